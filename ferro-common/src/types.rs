//! Core domain types for the inspection station
//!
//! A **Session** owns an ordered sequence of **Parts**; a Part owns up to
//! five **Shots** per measurement **Channel**. Retests of a base part number
//! are separate Parts distinguished by a retest index; identity is always the
//! composite `(base, retest)` key, never a display string.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum number of shots recorded per channel per part attempt
pub const MAX_SHOTS_PER_CHANNEL: usize = 5;

/// Measurement circuit with its own independent pass/fail threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// Current passed head-to-head through the part
    Headshot,
    /// Current induced through the surrounding coil
    Coilshot,
}

impl Channel {
    /// Both channels, in fixed display order
    pub const ALL: [Channel; 2] = [Channel::Headshot, Channel::Coilshot];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Headshot => "Headshot",
            Channel::Coilshot => "Coilshot",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-shot classification, frozen at ingestion time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShotOutcome {
    Pass,
    Fail,
}

/// One discrete current/duration measurement on one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shot {
    /// Position within the channel sequence (0..4)
    pub index: usize,
    /// Peak current magnitude in amperes
    pub current: f64,
    /// Shot duration in seconds
    pub duration: f64,
    /// Classification against the threshold in effect when the shot arrived
    pub outcome: ShotOutcome,
    pub recorded_at: DateTime<Utc>,
}

/// Composite identity of one part attempt
///
/// `retest == 0` is the original attempt; successive retests count up from 1.
/// The `Display` form (`7`, `7-1`, `7-2`) is for presentation only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartKey {
    pub base: u32,
    pub retest: u32,
}

impl PartKey {
    pub fn original(base: u32) -> Self {
        Self { base, retest: 0 }
    }

    pub fn is_retest(&self) -> bool {
        self.retest > 0
    }
}

impl std::fmt::Display for PartKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.retest == 0 {
            write!(f, "{}", self.base)
        } else {
            write!(f, "{}-{}", self.base, self.retest)
        }
    }
}

/// Terminal classification decision for a part attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Disposition {
    /// All shots met threshold and no surface defect was reported
    Pass,
    /// At least one shot fell below threshold
    Error,
    /// Operator confirmed a surface defect despite passing measurements
    Crack,
    /// Operator requested another attempt; a new part was spawned
    RetestRequested,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Pass => "Pass",
            Disposition::Error => "Error",
            Disposition::Crack => "Crack",
            Disposition::RetestRequested => "Retest",
        }
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a part attempt
///
/// Disposition is sticky: once `Disposed`, later shot-driven status
/// recomputation never overwrites it. Only a retest produces a fresh `Open`
/// part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartState {
    /// Accepting shots
    Open,
    /// Closed for shots, waiting on the crack/retest decision
    AwaitingDisposition,
    /// Sealed with a terminal status
    Disposed(Disposition),
}

impl PartState {
    pub fn is_open(&self) -> bool {
        matches!(self, PartState::Open)
    }

    pub fn disposition(&self) -> Option<Disposition> {
        match self {
            PartState::Disposed(d) => Some(*d),
            _ => None,
        }
    }
}

/// Part status while still open, recomputed from shots-so-far
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvisionalStatus {
    /// No shots recorded yet
    Empty,
    /// Every recorded shot met its threshold
    Pass,
    /// At least one recorded shot fell below threshold
    Fail,
}

/// One physical part attempt with its accumulated measurements
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Part {
    pub key: PartKey,
    /// Inherited from the session at creation time
    pub description: String,
    pub state: PartState,
    pub headshot: Vec<Shot>,
    pub coilshot: Vec<Shot>,
    /// Recomputed from scratch on every append to avoid stale-state bugs
    pub provisional: ProvisionalStatus,
    /// Set only by a confirmed crack disposition
    pub crack_reported: bool,
    /// Reference to an externally captured defect image
    pub evidence_path: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Durable store id, present once the insert succeeded
    pub record_id: Option<i64>,
}

impl Part {
    pub fn new(key: PartKey, description: impl Into<String>) -> Self {
        Self {
            key,
            description: description.into(),
            state: PartState::Open,
            headshot: Vec::new(),
            coilshot: Vec::new(),
            provisional: ProvisionalStatus::Empty,
            crack_reported: false,
            evidence_path: None,
            created_at: Utc::now(),
            record_id: None,
        }
    }

    pub fn shots(&self, channel: Channel) -> &[Shot] {
        match channel {
            Channel::Headshot => &self.headshot,
            Channel::Coilshot => &self.coilshot,
        }
    }

    pub fn shots_mut(&mut self, channel: Channel) -> &mut Vec<Shot> {
        match channel {
            Channel::Headshot => &mut self.headshot,
            Channel::Coilshot => &mut self.coilshot,
        }
    }

    /// True if any recorded shot on either channel failed classification
    pub fn has_failure(&self) -> bool {
        Channel::ALL
            .iter()
            .any(|c| self.shots(*c).iter().any(|s| s.outcome == ShotOutcome::Fail))
    }

    /// Highest current recorded on a channel, 0.0 when empty
    pub fn highest_current(&self, channel: Channel) -> f64 {
        self.shots(channel)
            .iter()
            .map(|s| s.current)
            .fold(0.0, f64::max)
    }

    /// Recompute provisional status from the full shot record
    pub fn recompute_provisional(&mut self) {
        let total: usize = Channel::ALL.iter().map(|c| self.shots(*c).len()).sum();
        self.provisional = if total == 0 {
            ProvisionalStatus::Empty
        } else if self.has_failure() {
            ProvisionalStatus::Fail
        } else {
            ProvisionalStatus::Pass
        };
    }
}

/// Per-session, per-channel minimum acceptable current
///
/// Read once at session start; changing thresholds mid-session never
/// reclassifies stored shots.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSet {
    pub headshot: f64,
    pub coilshot: f64,
}

impl ThresholdSet {
    pub fn threshold(&self, channel: Channel) -> f64 {
        match channel {
            Channel::Headshot => self.headshot,
            Channel::Coilshot => self.coilshot,
        }
    }
}

/// Identity and fixed metadata of one inspection run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub operator: String,
    pub supervisor: String,
    pub company: String,
    pub machine_id: String,
    /// Description shared by every part tested in this run
    pub part_description: String,
    pub thresholds: ThresholdSet,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Durable store id, present once the insert succeeded
    pub record_id: Option<i64>,
}

impl SessionInfo {
    pub fn new(
        operator: impl Into<String>,
        supervisor: impl Into<String>,
        company: impl Into<String>,
        machine_id: impl Into<String>,
        part_description: impl Into<String>,
        thresholds: ThresholdSet,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            operator: operator.into(),
            supervisor: supervisor.into(),
            company: company.into(),
            machine_id: machine_id.into(),
            part_description: part_description.into(),
            thresholds,
            started_at: Utc::now(),
            ended_at: None,
            record_id: None,
        }
    }
}

/// End-of-session counters derived from the ledger
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub total_parts: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub cracked: usize,
    pub retests: usize,
}

/// Answer from the disposition authority when a part closes clean
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispositionChoice {
    /// No surface defect found
    Pass,
    /// Defect confirmed, optionally with a captured evidence reference
    Crack { evidence_path: Option<String> },
    /// Measure this part again
    Retest,
}
