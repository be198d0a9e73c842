//! End-to-end pipeline tests: scripted device frames through reader, parser,
//! classifier, and lifecycle, with an in-memory gateway and a scripted
//! disposition authority.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::time::sleep;

use ferro_common::error::{Error, Result};
use ferro_common::events::{EventBus, StationEvent};
use ferro_common::gateway::{MemoryGateway, PersistenceGateway};
use ferro_common::types::{
    Channel, Disposition, DispositionChoice, Part, PartKey, PartState, SessionInfo, ThresholdSet,
};
use ferro_station::ledger::LedgerSnapshot;
use ferro_station::lifecycle::DispositionAuthority;
use ferro_station::pipeline::{IngestionPipeline, PipelineOptions, StationHandle};

struct ScriptedAuthority {
    choices: Mutex<VecDeque<DispositionChoice>>,
    retest_after_error: bool,
    questions_asked: AtomicUsize,
}

impl ScriptedAuthority {
    fn new(choices: Vec<DispositionChoice>, retest_after_error: bool) -> Self {
        Self {
            choices: Mutex::new(choices.into()),
            retest_after_error,
            questions_asked: AtomicUsize::new(0),
        }
    }

    fn asked(&self) -> usize {
        self.questions_asked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DispositionAuthority for ScriptedAuthority {
    async fn ask_crack_or_retest(&self, _part: &Part) -> DispositionChoice {
        self.questions_asked.fetch_add(1, Ordering::SeqCst);
        self.choices
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(DispositionChoice::Pass)
    }

    async fn confirm_retest_after_error(&self, _part: &Part) -> bool {
        self.retest_after_error
    }
}

/// Gateway that dawdles on shot writes, slowing the consumer down enough to
/// make the bounded queue fill
struct SlowGateway {
    inner: MemoryGateway,
    shot_delay: Duration,
}

#[async_trait]
impl PersistenceGateway for SlowGateway {
    async fn record_session_start(&self, session: &SessionInfo) -> Result<i64> {
        self.inner.record_session_start(session).await
    }
    async fn record_session_end(
        &self,
        session_id: i64,
        ended_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        self.inner.record_session_end(session_id, ended_at).await
    }
    async fn record_part(
        &self,
        session_id: i64,
        base: u32,
        retest: u32,
        description: &str,
    ) -> Result<i64> {
        self.inner.record_part(session_id, base, retest, description).await
    }
    async fn record_shot(
        &self,
        part_id: i64,
        channel: Channel,
        index: usize,
        current: f64,
        duration: f64,
    ) -> Result<()> {
        sleep(self.shot_delay).await;
        self.inner.record_shot(part_id, channel, index, current, duration).await
    }
    async fn record_part_status(&self, part_id: i64, status: Disposition) -> Result<()> {
        self.inner.record_part_status(part_id, status).await
    }
    async fn record_crack_flag(&self, part_id: i64, flag: bool) -> Result<()> {
        self.inner.record_crack_flag(part_id, flag).await
    }
    async fn record_evidence_path(&self, part_id: i64, path: &str) -> Result<()> {
        self.inner.record_evidence_path(part_id, path).await
    }
    async fn part_number_exists_in_history(&self, base: u32, description: &str) -> Result<bool> {
        self.inner.part_number_exists_in_history(base, description).await
    }
}

fn session() -> SessionInfo {
    SessionInfo::new(
        "op",
        "sup",
        "co",
        "m1",
        "hub",
        ThresholdSet { headshot: 5.0, coilshot: 3.0 },
    )
}

struct Rig {
    pipeline: IngestionPipeline,
    handle: StationHandle,
    device: DuplexStream,
    bus: Arc<EventBus>,
}

async fn start_rig(
    gateway: Arc<dyn PersistenceGateway>,
    authority: Arc<dyn DispositionAuthority>,
    queue_depth: usize,
) -> Rig {
    let (device, io) = tokio::io::duplex(4096);
    let bus = Arc::new(EventBus::new(256));
    let options = PipelineOptions { queue_depth, ..Default::default() };
    let pipeline = IngestionPipeline::start(
        io,
        session(),
        gateway,
        authority,
        Arc::clone(&bus),
        options,
    )
    .await;
    let handle = pipeline.handle();
    Rig { pipeline, handle, device, bus }
}

/// Poll the snapshot until `pred` holds or two seconds elapse
async fn wait_for(handle: &StationHandle, pred: impl Fn(&LedgerSnapshot) -> bool) -> LedgerSnapshot {
    for _ in 0..200 {
        let snapshot = handle.snapshot().await.unwrap();
        if pred(&snapshot) {
            return snapshot;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

#[tokio::test]
async fn clean_part_flows_to_pass_disposition() {
    let authority = Arc::new(ScriptedAuthority::new(vec![DispositionChoice::Pass], false));
    let gateway = Arc::new(MemoryGateway::new());
    let mut rig = start_rig(gateway.clone(), authority.clone(), 64).await;

    rig.handle.open_part(7).await.unwrap();
    for i in 0..5 {
        let frame = format!("Meter 1:{}:0.5\nMeter 2:{}:0.4\n", 5.0 + i as f64, 3.0 + i as f64);
        rig.device.write_all(frame.as_bytes()).await.unwrap();
    }

    let snapshot = wait_for(&rig.handle, |s| {
        s.parts.first().is_some_and(|p| p.headshot.len() == 5 && p.coilshot.len() == 5)
    })
    .await;
    assert!(!snapshot.parts[0].has_failure());

    let outcome = rig.handle.close_part().await.unwrap();
    assert_eq!(outcome.disposition, Disposition::Pass);
    assert_eq!(authority.asked(), 1);

    let summary = rig.handle.end_session().await.unwrap();
    assert_eq!(summary.accepted, 1);
    rig.pipeline.stop().await;

    // All ten shots were persisted for the one stored part
    assert_eq!(gateway.part_count(), 1);
}

#[tokio::test]
async fn failed_shot_preempts_crack_question_and_spawns_retest() {
    // Scenario: head=5.0; part 10 takes 5.0 then 4.9 → Error, retest 10-1
    let authority = Arc::new(ScriptedAuthority::new(vec![], true));
    let mut rig = start_rig(Arc::new(MemoryGateway::new()), authority.clone(), 64).await;

    rig.handle.open_part(10).await.unwrap();
    rig.device.write_all(b"Meter 1:5.0:0.5\nMeter 1:4.9:0.5\n").await.unwrap();

    wait_for(&rig.handle, |s| s.parts.first().is_some_and(|p| p.headshot.len() == 2)).await;

    let outcome = rig.handle.close_part().await.unwrap();
    assert_eq!(outcome.disposition, Disposition::Error);
    assert_eq!(outcome.retest, Some(PartKey { base: 10, retest: 1 }));
    assert_eq!(authority.asked(), 0, "no crack question after a failed shot");

    let snapshot = rig.handle.snapshot().await.unwrap();
    let retest = snapshot.parts.iter().find(|p| p.key.retest == 1).unwrap();
    assert_eq!(retest.state, PartState::Open);
    assert!(retest.headshot.is_empty() && retest.coilshot.is_empty());

    rig.pipeline.stop().await;
}

#[tokio::test]
async fn malformed_frames_are_dropped_and_ingestion_continues() {
    let mut rig = start_rig(
        Arc::new(MemoryGateway::new()),
        Arc::new(ScriptedAuthority::new(vec![], false)),
        64,
    )
    .await;
    let mut events = rig.bus.subscribe();

    rig.handle.open_part(3).await.unwrap();
    rig.device
        .write_all(b"Meter 9:12.3:0.5\nnot a frame\nMeter 1:6.0:0.5\n")
        .await
        .unwrap();

    let snapshot =
        wait_for(&rig.handle, |s| s.parts.first().is_some_and(|p| p.headshot.len() == 1)).await;
    assert_eq!(snapshot.parts[0].headshot[0].current, 6.0);

    // Both bad frames were reported as diagnostics
    let mut rejects = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, StationEvent::FrameRejected { .. }) {
            rejects += 1;
        }
    }
    assert_eq!(rejects, 2);

    rig.pipeline.stop().await;
}

#[tokio::test]
async fn frames_are_applied_in_arrival_order_under_slow_consumer() {
    // Slow shot persistence + a queue of 2 forces backpressure on the reader;
    // nothing may be dropped or reordered.
    let gateway = Arc::new(SlowGateway {
        inner: MemoryGateway::new(),
        shot_delay: Duration::from_millis(15),
    });
    let mut rig = start_rig(
        gateway,
        Arc::new(ScriptedAuthority::new(vec![], false)),
        2,
    )
    .await;

    rig.handle.open_part(1).await.unwrap();
    let currents: Vec<f64> = (0..5).map(|i| 5.0 + i as f64 * 0.5).collect();
    for current in &currents {
        rig.device
            .write_all(format!("Meter 1:{current}:0.1\n").as_bytes())
            .await
            .unwrap();
    }

    let snapshot =
        wait_for(&rig.handle, |s| s.parts.first().is_some_and(|p| p.headshot.len() == 5)).await;
    let recorded: Vec<f64> = snapshot.parts[0].headshot.iter().map(|s| s.current).collect();
    assert_eq!(recorded, currents);
    let indices: Vec<usize> = snapshot.parts[0].headshot.iter().map(|s| s.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);

    rig.pipeline.stop().await;
}

#[tokio::test]
async fn sixth_shot_is_rejected_without_losing_the_channel_state() {
    let mut rig = start_rig(
        Arc::new(MemoryGateway::new()),
        Arc::new(ScriptedAuthority::new(vec![], false)),
        64,
    )
    .await;
    let mut events = rig.bus.subscribe();

    rig.handle.open_part(2).await.unwrap();
    for _ in 0..6 {
        rig.device.write_all(b"Meter 2:4.0:0.2\n").await.unwrap();
    }
    // A different channel still accepts afterwards
    rig.device.write_all(b"Meter 1:6.0:0.2\n").await.unwrap();

    let snapshot = wait_for(&rig.handle, |s| {
        s.parts.first().is_some_and(|p| p.headshot.len() == 1)
    })
    .await;
    assert_eq!(snapshot.parts[0].coilshot.len(), 5);

    let mut channel_full_reported = false;
    while let Ok(event) = events.try_recv() {
        if let StationEvent::FrameRejected { reason, .. } = event {
            if reason.contains("full") {
                channel_full_reported = true;
            }
        }
    }
    assert!(channel_full_reported);

    rig.pipeline.stop().await;
}

#[tokio::test]
async fn duplicate_part_numbers_are_rejected_at_the_handle() {
    let gateway = Arc::new(MemoryGateway::new());
    gateway.seed_history(42, "hub");
    let mut rig = start_rig(
        gateway,
        Arc::new(ScriptedAuthority::new(vec![DispositionChoice::Pass], false)),
        64,
    )
    .await;

    rig.handle.open_part(7).await.unwrap();
    rig.device.write_all(b"Meter 1:6.0:0.5\n").await.unwrap();
    wait_for(&rig.handle, |s| s.parts.first().is_some_and(|p| p.headshot.len() == 1)).await;
    rig.handle.close_part().await.unwrap();

    // Same number again in this session
    let err = rig.handle.open_part(7).await.unwrap_err();
    assert!(matches!(err, Error::DuplicateInSession(7)));

    // Number used in a previous session for the same description
    let err = rig.handle.open_part(42).await.unwrap_err();
    assert!(matches!(err, Error::DuplicateInHistory { base: 42, .. }));

    // The existing part 7 is unaffected
    let snapshot = rig.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.parts.len(), 1);
    assert_eq!(snapshot.parts[0].key, PartKey::original(7));

    rig.pipeline.stop().await;
}

#[tokio::test]
async fn stop_is_idempotent_and_final() {
    let mut rig = start_rig(
        Arc::new(MemoryGateway::new()),
        Arc::new(ScriptedAuthority::new(vec![], false)),
        64,
    )
    .await;

    rig.handle.open_part(1).await.unwrap();
    rig.device.write_all(b"Meter 1:6.0:0.5\n").await.unwrap();
    wait_for(&rig.handle, |s| s.parts.first().is_some_and(|p| p.headshot.len() == 1)).await;

    rig.pipeline.stop().await;
    rig.pipeline.stop().await;

    // No mutation after stop: commands fail, late frames go nowhere
    let _ = rig.device.write_all(b"Meter 1:7.0:0.5\n").await;
    sleep(Duration::from_millis(100)).await;
    let err = rig.handle.snapshot().await.unwrap_err();
    assert!(matches!(err, Error::Stopped(_)));
}

#[tokio::test]
async fn device_disconnect_is_reported_once_and_session_still_closes() {
    let authority = Arc::new(ScriptedAuthority::new(vec![DispositionChoice::Pass], false));
    let mut rig = start_rig(Arc::new(MemoryGateway::new()), authority, 64).await;
    let mut events = rig.bus.subscribe();

    rig.handle.open_part(9).await.unwrap();
    rig.device.write_all(b"Meter 1:6.0:0.5\n").await.unwrap();
    wait_for(&rig.handle, |s| s.parts.first().is_some_and(|p| p.headshot.len() == 1)).await;

    // Hardware goes away
    drop(rig.device);
    sleep(Duration::from_millis(200)).await;

    let mut faults = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, StationEvent::DeviceFault { .. }) {
            faults += 1;
        }
    }
    assert_eq!(faults, 1);

    // Engine still ends the session normally
    let summary = rig.handle.end_session().await.unwrap();
    assert_eq!(summary.accepted, 1);
    rig.pipeline.stop().await;
}
