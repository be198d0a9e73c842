//! Part ledger
//!
//! Authoritative in-memory record of the parts tested in the active session:
//! identities, per-channel shot sequences, provisional status, retest
//! lineage. Mutated only from the pipeline's consumer task (single-writer);
//! presentation reads go through cloned snapshots.
//!
//! Retests are strictly additive history: spawning a retest never touches the
//! prior attempt's recorded shots, and lookups by base number always resolve
//! to the latest attempt.

use std::collections::HashMap;

use chrono::Utc;
use tracing::debug;

use ferro_common::error::{Error, Result};
use ferro_common::types::{
    Channel, Disposition, Part, PartKey, PartState, SessionInfo, SessionSummary, Shot,
    MAX_SHOTS_PER_CHANNEL,
};

use crate::classify::classify;

/// Immutable copy of the ledger for presentation-side reads
#[derive(Debug, Clone)]
pub struct LedgerSnapshot {
    pub session: SessionInfo,
    pub parts: Vec<Part>,
    pub summary: SessionSummary,
}

/// Session-scoped part state, owned by the lifecycle controller
#[derive(Debug)]
pub struct PartLedger {
    session: SessionInfo,
    /// Ordered by creation; the last entry is the part currently under test
    parts: Vec<Part>,
    /// base number → index of the most recent attempt in `parts`
    latest: HashMap<u32, usize>,
}

impl PartLedger {
    pub fn new(session: SessionInfo) -> Self {
        Self {
            session,
            parts: Vec::new(),
            latest: HashMap::new(),
        }
    }

    pub fn session(&self) -> &SessionInfo {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut SessionInfo {
        &mut self.session
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    /// The part currently under test (most recently created), if any
    pub fn current_part(&self) -> Option<&Part> {
        self.parts.last()
    }

    pub fn current_part_mut(&mut self) -> Option<&mut Part> {
        self.parts.last_mut()
    }

    /// Most recent attempt (highest retest index) for a base number
    pub fn latest_part(&self, base: u32) -> Option<&Part> {
        self.latest.get(&base).map(|&i| &self.parts[i])
    }

    /// Create a brand-new part (retest index 0) for an operator-entered base
    /// number. The cross-session history check happens at the gateway before
    /// this is called; this only enforces session uniqueness.
    pub fn create_part(&mut self, base: u32) -> Result<&Part> {
        if self.latest.contains_key(&base) {
            return Err(Error::DuplicateInSession(base));
        }

        let key = PartKey::original(base);
        let part = Part::new(key, self.session.part_description.clone());
        let index = self.parts.len();
        self.latest.insert(base, index);
        self.parts.push(part);
        debug!(part = %key, "Part opened");
        Ok(&self.parts[index])
    }

    /// Spawn the next retest attempt for a base number already in the
    /// session: fresh empty shot sequences, retest index one past the highest
    /// existing attempt.
    pub fn spawn_retest(&mut self, base: u32) -> Result<&Part> {
        let highest = self
            .parts
            .iter()
            .filter(|p| p.key.base == base)
            .map(|p| p.key.retest)
            .max()
            .ok_or_else(|| {
                Error::InvalidState(format!("no part {base} in this session to retest"))
            })?;

        let key = PartKey { base, retest: highest + 1 };
        let part = Part::new(key, self.session.part_description.clone());
        let index = self.parts.len();
        self.latest.insert(base, index);
        self.parts.push(part);
        debug!(part = %key, "Retest spawned");
        Ok(&self.parts[index])
    }

    /// Append a classified shot to the part currently under test.
    ///
    /// Classification is frozen here using the session thresholds in effect
    /// at ingestion. Fails without mutating anything when the part is not
    /// open or the channel already holds its five shots.
    pub fn append_shot(&mut self, channel: Channel, current: f64, duration: f64) -> Result<(PartKey, Shot)> {
        let thresholds = self.session.thresholds;
        let part = self
            .parts
            .last_mut()
            .ok_or_else(|| Error::InvalidState("no part declared yet".into()))?;

        if !part.state.is_open() {
            return Err(Error::InvalidState(format!(
                "part {} is {:?}, not accepting shots",
                part.key, part.state
            )));
        }

        let held = part.shots(channel).len();
        if held >= MAX_SHOTS_PER_CHANNEL {
            return Err(Error::ChannelFull { part: part.key, channel, held });
        }

        let shot = Shot {
            index: held,
            current,
            duration,
            outcome: classify(channel, current, &thresholds),
            recorded_at: Utc::now(),
        };
        part.shots_mut(channel).push(shot.clone());
        part.recompute_provisional();

        Ok((part.key, shot))
    }

    /// Seal the current part with a terminal status. Disposition is sticky;
    /// sealing an already-disposed part is an invariant violation.
    pub fn seal_current(&mut self, disposition: Disposition) -> Result<PartKey> {
        let part = self
            .parts
            .last_mut()
            .ok_or_else(|| Error::InvalidState("no part to dispose".into()))?;

        if let PartState::Disposed(existing) = part.state {
            return Err(Error::InvalidState(format!(
                "part {} already disposed as {existing}",
                part.key
            )));
        }

        part.state = PartState::Disposed(disposition);
        Ok(part.key)
    }

    /// End-of-session counters
    pub fn summary(&self) -> SessionSummary {
        let mut summary = SessionSummary {
            total_parts: self.parts.len(),
            ..Default::default()
        };
        for part in &self.parts {
            match part.state.disposition() {
                Some(Disposition::Pass) => summary.accepted += 1,
                Some(Disposition::Error) => summary.rejected += 1,
                Some(Disposition::Crack) => summary.cracked += 1,
                Some(Disposition::RetestRequested) => summary.retests += 1,
                None => {}
            }
        }
        summary
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            session: self.session.clone(),
            parts: self.parts.clone(),
            summary: self.summary(),
        }
    }
}
