//! Persistence gateway boundary
//!
//! The engine delegates durability to an external record store through this
//! narrow interface. Every operation may fail independently; the pipeline
//! treats failures as reportable degradations, never as reasons to roll back
//! or block in-memory state.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::Result;
use crate::types::{Channel, Disposition, SessionInfo};

/// Durable store consumed by the lifecycle engine
///
/// Implementations must be safe to call from the single consumer task; the
/// caller bounds each call with a short timeout so a slow store degrades
/// durability, not ingestion liveness.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Record session metadata at the start of a run, returning the durable id
    async fn record_session_start(&self, session: &SessionInfo) -> Result<i64>;

    /// Record the end timestamp of a closed session
    async fn record_session_end(&self, session_id: i64, ended_at: chrono::DateTime<chrono::Utc>)
        -> Result<()>;

    /// Insert a part attempt, returning the durable id later writes refer to
    async fn record_part(
        &self,
        session_id: i64,
        base_number: u32,
        retest_index: u32,
        description: &str,
    ) -> Result<i64>;

    /// Append one classified shot for a part
    async fn record_shot(
        &self,
        part_id: i64,
        channel: Channel,
        sequence_index: usize,
        current: f64,
        duration: f64,
    ) -> Result<()>;

    /// Overwrite the stored status of a part
    async fn record_part_status(&self, part_id: i64, status: Disposition) -> Result<()>;

    /// Record whether a surface defect was confirmed
    async fn record_crack_flag(&self, part_id: i64, crack_detected: bool) -> Result<()>;

    /// Attach a captured defect image reference
    async fn record_evidence_path(&self, part_id: i64, path: &str) -> Result<()>;

    /// True when the (base number, description) pair exists anywhere in the
    /// history store, across all sessions
    async fn part_number_exists_in_history(&self, base_number: u32, description: &str)
        -> Result<bool>;
}

/// Stored shape of one part row in [`MemoryGateway`]
#[derive(Debug, Clone)]
pub struct MemoryPart {
    pub session_id: i64,
    pub base_number: u32,
    pub retest_index: u32,
    pub description: String,
    pub status: Option<Disposition>,
    pub crack_detected: Option<bool>,
    pub evidence_path: Option<String>,
    pub shots: Vec<(Channel, usize, f64, f64)>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    sessions: HashMap<i64, SessionInfo>,
    session_ends: HashMap<i64, chrono::DateTime<chrono::Utc>>,
    parts: HashMap<i64, MemoryPart>,
    /// Seeded (base, description) pairs counting as prior-session history
    history: Vec<(u32, String)>,
}

/// In-memory gateway for tests and diskless bring-up
///
/// Keeps the same observable contract as the SQLite gateway, including the
/// cross-session history check (seedable via [`MemoryGateway::seed_history`]).
#[derive(Debug, Default)]
pub struct MemoryGateway {
    state: Mutex<MemoryState>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a (base number, description) pair as already present in history
    pub fn seed_history(&self, base_number: u32, description: &str) {
        let mut state = self.state.lock().unwrap();
        state.history.push((base_number, description.to_string()));
    }

    /// Snapshot of a stored part row, if present
    pub fn part(&self, part_id: i64) -> Option<MemoryPart> {
        self.state.lock().unwrap().parts.get(&part_id).cloned()
    }

    pub fn part_count(&self) -> usize {
        self.state.lock().unwrap().parts.len()
    }

    pub fn session_end(&self, session_id: i64) -> Option<chrono::DateTime<chrono::Utc>> {
        self.state.lock().unwrap().session_ends.get(&session_id).copied()
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn record_session_start(&self, session: &SessionInfo) -> Result<i64> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        state.sessions.insert(id, session.clone());
        Ok(id)
    }

    async fn record_session_end(
        &self,
        session_id: i64,
        ended_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.session_ends.insert(session_id, ended_at);
        Ok(())
    }

    async fn record_part(
        &self,
        session_id: i64,
        base_number: u32,
        retest_index: u32,
        description: &str,
    ) -> Result<i64> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        state.parts.insert(
            id,
            MemoryPart {
                session_id,
                base_number,
                retest_index,
                description: description.to_string(),
                status: None,
                crack_detected: None,
                evidence_path: None,
                shots: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn record_shot(
        &self,
        part_id: i64,
        channel: Channel,
        sequence_index: usize,
        current: f64,
        duration: f64,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(part) = state.parts.get_mut(&part_id) {
            part.shots.push((channel, sequence_index, current, duration));
        }
        Ok(())
    }

    async fn record_part_status(&self, part_id: i64, status: Disposition) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(part) = state.parts.get_mut(&part_id) {
            part.status = Some(status);
        }
        Ok(())
    }

    async fn record_crack_flag(&self, part_id: i64, crack_detected: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(part) = state.parts.get_mut(&part_id) {
            part.crack_detected = Some(crack_detected);
        }
        Ok(())
    }

    async fn record_evidence_path(&self, part_id: i64, path: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(part) = state.parts.get_mut(&part_id) {
            part.evidence_path = Some(path.to_string());
        }
        Ok(())
    }

    async fn part_number_exists_in_history(
        &self,
        base_number: u32,
        description: &str,
    ) -> Result<bool> {
        let state = self.state.lock().unwrap();
        let seeded = state
            .history
            .iter()
            .any(|(b, d)| *b == base_number && d == description);
        let stored = state
            .parts
            .values()
            .any(|p| p.base_number == base_number && p.description == description);
        Ok(seeded || stored)
    }
}
