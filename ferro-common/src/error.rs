//! Error types for the Ferro Station workspace
//!
//! Defines module-specific error types using thiserror for clear error
//! propagation. Parsing and persistence failures are recovered locally by the
//! pipeline; lifecycle violations and device faults are surfaced to the
//! caller but must never take the consumer loop down.

use thiserror::Error;

use crate::types::{Channel, PartKey};

/// Main error type for the station engine
#[derive(Error, Debug)]
pub enum Error {
    /// I/O failure on the measurement stream
    #[error("Device error: {0}")]
    Device(String),

    /// Malformed frame rejected by the parser
    #[error("Malformed frame: {0}")]
    Parse(String),

    /// A sixth shot was attempted on a channel that already holds five
    #[error("Channel {channel} is full for part {part} ({held} shots held)")]
    ChannelFull {
        part: PartKey,
        channel: Channel,
        held: usize,
    },

    /// Base part number already used in the current session
    #[error("Part number {0} already exists in this session")]
    DuplicateInSession(u32),

    /// (base number, description) pair already present in the history store
    #[error("Part number {base} for '{description}' already exists in history")]
    DuplicateInHistory { base: u32, description: String },

    /// Durable store write or lookup failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Operation not legal in the part's current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration file loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database connection or query errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Engine shut down before the request completed
    #[error("Pipeline stopped: {0}")]
    Stopped(String),
}

/// Convenience Result type using the station Error
pub type Result<T> = std::result::Result<T, Error>;
