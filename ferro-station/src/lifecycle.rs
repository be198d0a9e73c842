//! Part test lifecycle
//!
//! State machine per part: `Open` → `AwaitingDisposition` → `Disposed`.
//! A measurement failure closes a part straight to `Error` and the crack
//! question is never asked; a clean close asks the disposition authority
//! exactly once. Disposition is sticky. Retests spawn a fresh `Open` part
//! rather than reusing the sealed attempt.
//!
//! Gateway writes are best-effort with a short bound: a slow or failing store
//! degrades durability, never ingestion. The ledger is the source of truth
//! for the live session.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use ferro_common::error::{Error, Result};
use ferro_common::events::{EventBus, StationEvent};
use ferro_common::gateway::PersistenceGateway;
use ferro_common::types::{
    Disposition, DispositionChoice, Part, PartKey, PartState, SessionInfo, SessionSummary, Shot,
};

use crate::ledger::{LedgerSnapshot, PartLedger};
use crate::parser::ShotFrame;

/// Default bound on a single gateway call from the consumer loop
pub const DEFAULT_GATEWAY_TIMEOUT: Duration = Duration::from_millis(250);

/// Decision maker for part close-out, normally the presentation layer.
///
/// Called synchronously from the consumer loop's transition logic; it must
/// not block on hardware I/O.
#[async_trait]
pub trait DispositionAuthority: Send + Sync {
    /// Asked exactly once when a part closes with no measurement failure.
    async fn ask_crack_or_retest(&self, part: &Part) -> DispositionChoice;

    /// Asked after a part closes to `Error`; true spawns a retest attempt.
    async fn confirm_retest_after_error(&self, part: &Part) -> bool;
}

/// Authority for unattended runs: every clean part passes, failed parts are
/// not retested.
#[derive(Debug, Default)]
pub struct AutoPassAuthority;

#[async_trait]
impl DispositionAuthority for AutoPassAuthority {
    async fn ask_crack_or_retest(&self, _part: &Part) -> DispositionChoice {
        DispositionChoice::Pass
    }

    async fn confirm_retest_after_error(&self, _part: &Part) -> bool {
        false
    }
}

/// Result of closing the part under test
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseOutcome {
    pub part: PartKey,
    pub disposition: Disposition,
    /// Key of the retest attempt spawned by this close, if any
    pub retest: Option<PartKey>,
}

/// Orchestrates part transitions over the ledger, gateway, and event bus
pub struct LifecycleController {
    ledger: PartLedger,
    gateway: Arc<dyn PersistenceGateway>,
    authority: Arc<dyn DispositionAuthority>,
    bus: Arc<EventBus>,
    gateway_timeout: Duration,
    ended: bool,
}

impl LifecycleController {
    pub fn new(
        session: SessionInfo,
        gateway: Arc<dyn PersistenceGateway>,
        authority: Arc<dyn DispositionAuthority>,
        bus: Arc<EventBus>,
        gateway_timeout: Duration,
    ) -> Self {
        Self {
            ledger: PartLedger::new(session),
            gateway,
            authority,
            bus,
            gateway_timeout,
            ended: false,
        }
    }

    /// Persist session metadata. A store failure leaves the session without
    /// a durable id; parts and shots then stay in-memory only.
    pub async fn begin(&mut self) {
        let session = self.ledger.session().clone();
        let gateway = Arc::clone(&self.gateway);
        let id = self
            .guarded("record_session_start", async move {
                gateway.record_session_start(&session).await
            })
            .await;
        self.ledger.session_mut().record_id = id;
        if let Some(id) = id {
            info!(session_id = id, "Session recorded");
        }
    }

    /// Declare a brand-new part (retest index 0) for an operator-entered
    /// base number.
    ///
    /// Rejected before any mutation when the number repeats within the
    /// session or the (number, description) pair exists anywhere in history.
    /// The history lookup is strict: if the store cannot answer, creation
    /// fails rather than risking a duplicate.
    pub async fn open_part(&mut self, base: u32) -> Result<PartKey> {
        self.ensure_active()?;
        if let Some(current) = self.ledger.current_part() {
            if !matches!(current.state, PartState::Disposed(_)) {
                return Err(Error::InvalidState(format!(
                    "part {} is still open; close it before declaring a new part",
                    current.key
                )));
            }
        }
        if self.ledger.latest_part(base).is_some() {
            return Err(Error::DuplicateInSession(base));
        }

        let description = self.ledger.session().part_description.clone();
        let exists = timeout(
            self.gateway_timeout,
            self.gateway.part_number_exists_in_history(base, &description),
        )
        .await
        .map_err(|_| Error::Persistence("history lookup timed out".into()))??;
        if exists {
            return Err(Error::DuplicateInHistory { base, description });
        }

        let key = self.ledger.create_part(base)?.key;
        self.persist_new_part(key).await;
        self.bus.emit(StationEvent::PartOpened { part: key, timestamp: Utc::now() });
        info!(part = %key, "Part under test");
        Ok(key)
    }

    /// Ingest one parsed, classified shot for the part under test.
    ///
    /// Returns `Ok(None)` when the frame is deliberately dropped (no part
    /// declared yet, or the session is over). Lifecycle violations and full
    /// channels surface as errors; the ledger is unchanged in those cases.
    pub async fn ingest_shot(&mut self, frame: ShotFrame) -> Result<Option<(PartKey, Shot)>> {
        if self.ended {
            debug!("Dropping frame after session end");
            return Ok(None);
        }
        if self.ledger.current_part().is_none() {
            debug!("Dropping frame; no part declared yet");
            return Ok(None);
        }

        let (key, shot) = self.ledger.append_shot(frame.channel, frame.current, frame.duration)?;

        if let Some(part_id) = self.ledger.latest_part(key.base).and_then(|p| p.record_id) {
            let gateway = Arc::clone(&self.gateway);
            let (channel, index, current, duration) =
                (frame.channel, shot.index, shot.current, shot.duration);
            self.guarded("record_shot", async move {
                gateway.record_shot(part_id, channel, index, current, duration).await
            })
            .await;
        }

        self.bus.emit(StationEvent::ShotRecorded {
            part: key,
            channel: frame.channel,
            shot: shot.clone(),
            timestamp: Utc::now(),
        });
        Ok(Some((key, shot)))
    }

    /// Close the part under test and decide its terminal status.
    ///
    /// Any failed shot pre-empts the crack question and seals the part as
    /// `Error`; the authority is then only asked whether to retest. A clean
    /// part gets exactly one crack/retest prompt.
    pub async fn close_current(&mut self) -> Result<CloseOutcome> {
        self.ensure_active()?;
        self.close_inner(false).await
    }

    /// Shared close path. Operator-initiated closes reject a shotless part;
    /// the forced end-of-session close disposes it like any clean part.
    async fn close_inner(&mut self, allow_shotless: bool) -> Result<CloseOutcome> {
        let pending = self
            .ledger
            .current_part()
            .ok_or_else(|| Error::InvalidState("no part to close".into()))?
            .clone();
        if let PartState::Disposed(d) = pending.state {
            return Err(Error::InvalidState(format!(
                "part {} already disposed as {d}",
                pending.key
            )));
        }
        if !allow_shotless && pending.headshot.is_empty() && pending.coilshot.is_empty() {
            return Err(Error::InvalidState(format!(
                "part {} has no shots recorded",
                pending.key
            )));
        }

        if pending.has_failure() {
            self.dispose_current(Disposition::Error, None).await?;
            let retest = if self.authority.confirm_retest_after_error(&pending).await {
                Some(self.spawn_retest(pending.key).await?)
            } else {
                None
            };
            return Ok(CloseOutcome {
                part: pending.key,
                disposition: Disposition::Error,
                retest,
            });
        }

        // Clean close: single canonical disposition point
        if let Some(current) = self.ledger.current_part_mut() {
            current.state = PartState::AwaitingDisposition;
        }
        let choice = self.authority.ask_crack_or_retest(&pending).await;

        match choice {
            DispositionChoice::Pass => {
                self.dispose_current(Disposition::Pass, Some(false)).await?;
                Ok(CloseOutcome {
                    part: pending.key,
                    disposition: Disposition::Pass,
                    retest: None,
                })
            }
            DispositionChoice::Crack { evidence_path } => {
                if let Some(current) = self.ledger.current_part_mut() {
                    current.crack_reported = true;
                    current.evidence_path = evidence_path.clone();
                }
                self.dispose_current(Disposition::Crack, Some(true)).await?;
                if let (Some(part_id), Some(path)) = (pending.record_id, evidence_path.as_deref()) {
                    let gateway = Arc::clone(&self.gateway);
                    let path = path.to_string();
                    self.guarded("record_evidence_path", async move {
                        gateway.record_evidence_path(part_id, &path).await
                    })
                    .await;
                }
                Ok(CloseOutcome {
                    part: pending.key,
                    disposition: Disposition::Crack,
                    retest: None,
                })
            }
            DispositionChoice::Retest => {
                self.dispose_current(Disposition::RetestRequested, None).await?;
                let retest = self.spawn_retest(pending.key).await?;
                Ok(CloseOutcome {
                    part: pending.key,
                    disposition: Disposition::RetestRequested,
                    retest: Some(retest),
                })
            }
        }
    }

    /// Close the session. The last part, if still open, gets its one forced
    /// disposition pass first (shots or not). Idempotent.
    pub async fn end_session(&mut self) -> Result<SessionSummary> {
        if self.ended {
            debug!("Session already ended");
            return Ok(self.ledger.summary());
        }

        if let Some(part) = self.ledger.current_part() {
            if !matches!(part.state, PartState::Disposed(_)) {
                self.close_inner(true).await?;
            }
        }

        self.ended = true;
        let ended_at = Utc::now();
        self.ledger.session_mut().ended_at = Some(ended_at);

        if let Some(session_id) = self.ledger.session().record_id {
            let gateway = Arc::clone(&self.gateway);
            self.guarded("record_session_end", async move {
                gateway.record_session_end(session_id, ended_at).await
            })
            .await;
        }

        let summary = self.ledger.summary();
        self.bus.emit(StationEvent::SessionEnded {
            session_id: self.ledger.session().id,
            summary,
            timestamp: ended_at,
        });
        info!(
            total = summary.total_parts,
            accepted = summary.accepted,
            rejected = summary.rejected,
            "Session ended"
        );
        Ok(summary)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        self.ledger.snapshot()
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    fn ensure_active(&self) -> Result<()> {
        if self.ended {
            Err(Error::InvalidState("session has ended".into()))
        } else {
            Ok(())
        }
    }

    /// Seal the current part and push status (and optionally the crack flag)
    /// to the store, best-effort.
    async fn dispose_current(
        &mut self,
        disposition: Disposition,
        crack_flag: Option<bool>,
    ) -> Result<()> {
        let key = self.ledger.seal_current(disposition)?;

        if let Some(part_id) = self.ledger.latest_part(key.base).and_then(|p| p.record_id) {
            let gateway = Arc::clone(&self.gateway);
            self.guarded("record_part_status", async move {
                gateway.record_part_status(part_id, disposition).await
            })
            .await;
            if let Some(flag) = crack_flag {
                let gateway = Arc::clone(&self.gateway);
                self.guarded("record_crack_flag", async move {
                    gateway.record_crack_flag(part_id, flag).await
                })
                .await;
            }
        }

        self.bus.emit(StationEvent::PartDisposed {
            part: key,
            disposition,
            timestamp: Utc::now(),
        });
        info!(part = %key, %disposition, "Part disposed");
        Ok(())
    }

    async fn spawn_retest(&mut self, predecessor: PartKey) -> Result<PartKey> {
        let key = self.ledger.spawn_retest(predecessor.base)?.key;
        self.persist_new_part(key).await;
        self.bus.emit(StationEvent::RetestSpawned {
            predecessor,
            part: key,
            timestamp: Utc::now(),
        });
        info!(part = %key, "Retest under test");
        Ok(key)
    }

    /// Insert the named part in the store and attach the durable id. Skipped
    /// when the session itself never got one.
    async fn persist_new_part(&mut self, key: PartKey) {
        let Some(session_id) = self.ledger.session().record_id else {
            return;
        };
        let description = self.ledger.session().part_description.clone();
        let gateway = Arc::clone(&self.gateway);
        let record_id = self
            .guarded("record_part", async move {
                gateway
                    .record_part(session_id, key.base, key.retest, &description)
                    .await
            })
            .await;
        if let Some(part) = self.ledger.current_part_mut() {
            if part.key == key {
                part.record_id = record_id;
            }
        }
    }

    /// Run a gateway call with the configured bound. Timeout or failure is
    /// reported and swallowed; in-memory state is never rolled back.
    async fn guarded<T, F>(&self, operation: &str, fut: F) -> Option<T>
    where
        F: Future<Output = Result<T>>,
    {
        match timeout(self.gateway_timeout, fut).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                warn!("Persistence write {operation} failed: {e}");
                self.bus.emit(StationEvent::PersistenceFailed {
                    operation: operation.to_string(),
                    message: e.to_string(),
                    timestamp: Utc::now(),
                });
                None
            }
            Err(_) => {
                warn!("Persistence write {operation} timed out");
                self.bus.emit(StationEvent::PersistenceFailed {
                    operation: operation.to_string(),
                    message: format!("timed out after {:?}", self.gateway_timeout),
                    timestamp: Utc::now(),
                });
                None
            }
        }
    }
}
