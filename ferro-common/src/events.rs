//! Event system for the inspection station
//!
//! The engine uses hybrid communication:
//! - **EventBus** (tokio::broadcast): one-to-many notification of the
//!   presentation layer
//! - **Command channels** (tokio::mpsc): operator request → single handler
//!
//! Events are emitted after the ledger mutation they describe and
//! independently of persistence acknowledgment. All events serialize with
//! serde so a frontend can forward them verbatim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::types::{Channel, Disposition, PartKey, SessionSummary, Shot};

/// Station event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StationEvent {
    /// A new part attempt began accepting shots
    PartOpened {
        part: PartKey,
        timestamp: DateTime<Utc>,
    },

    /// A classified shot was appended to the ledger
    ShotRecorded {
        part: PartKey,
        channel: Channel,
        shot: Shot,
        timestamp: DateTime<Utc>,
    },

    /// A part attempt was sealed with a terminal status
    PartDisposed {
        part: PartKey,
        disposition: Disposition,
        timestamp: DateTime<Utc>,
    },

    /// A retest attempt was spawned for an existing base number
    RetestSpawned {
        /// The attempt that requested the retest
        predecessor: PartKey,
        /// The freshly opened attempt
        part: PartKey,
        timestamp: DateTime<Utc>,
    },

    /// A frame was dropped without mutating the ledger
    ///
    /// Diagnostic only; surfaced in logs, never as an interruptive alert.
    FrameRejected {
        frame: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// One-time actionable notification that the device stream failed
    DeviceFault {
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// A durable-store write failed; in-memory state is unaffected
    PersistenceFailed {
        operation: String,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// The inspection run was closed
    SessionEnded {
        session_id: Uuid,
        summary: SessionSummary,
        timestamp: DateTime<Utc>,
    },
}

/// Broadcast bus carrying [`StationEvent`]s to all subscribers
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<StationEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<StationEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring the no-subscriber case
    ///
    /// The engine never requires a listener; a headless run simply discards
    /// notifications.
    pub fn emit(&self, event: StationEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
