//! SQLite-backed persistence
//!
//! Default implementation of [`crate::gateway::PersistenceGateway`]. Schema
//! creation is idempotent and happens at pool init; there is no migration
//! framework here.

pub mod init;
mod sqlite;

pub use init::init_database;
pub use sqlite::SqliteGateway;
