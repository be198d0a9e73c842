//! # Ferro Station shared library (ferro-common)
//!
//! Domain types, error taxonomy, event system, and the persistence gateway
//! shared by the station engine and any presentation layer built on it.
//!
//! **Purpose:** keep the engine crate free of storage details and give
//! downstream consumers (UI, reporting) one set of serializable types.

pub mod db;
pub mod error;
pub mod events;
pub mod gateway;
pub mod types;

pub use error::{Error, Result};
pub use events::{EventBus, StationEvent};
pub use gateway::PersistenceGateway;
