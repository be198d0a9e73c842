//! Ingestion pipeline
//!
//! Wires reader → parser → classifier → lifecycle controller. The reader
//! task is the sole producer on a bounded frame channel; one consumer task
//! owns the controller (and through it the ledger), so every successfully
//! parsed shot reaches exactly one `append`, in arrival order, even under a
//! slow consumer. Operator requests and snapshot reads travel over a command
//! channel serviced by the same loop, preserving single-writer discipline.
//!
//! `stop()` is idempotent; after it returns, no further ledger mutation can
//! occur and any frame still in flight has been deliberately discarded and
//! logged.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use ferro_common::error::{Error, Result};
use ferro_common::events::{EventBus, StationEvent};
use ferro_common::gateway::PersistenceGateway;
use ferro_common::types::{PartKey, SessionInfo, SessionSummary};

use crate::ledger::LedgerSnapshot;
use crate::lifecycle::{
    CloseOutcome, DispositionAuthority, LifecycleController, DEFAULT_GATEWAY_TIMEOUT,
};
use crate::parser::{ChannelLabels, FrameParser};
use crate::reader::{LineReader, RawFrame};

/// Bound on how long `stop()` waits for the consumer loop to drain and exit
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Pipeline tuning knobs
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Bounded frame queue depth between reader and consumer
    pub queue_depth: usize,
    /// Bound on a single persistence call from the consumer loop
    pub gateway_timeout: Duration,
    /// Channel-label table for the frame parser
    pub labels: ChannelLabels,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            queue_depth: 64,
            gateway_timeout: DEFAULT_GATEWAY_TIMEOUT,
            labels: ChannelLabels::default(),
        }
    }
}

/// Operator requests serviced by the consumer loop
enum StationCommand {
    OpenPart {
        base: u32,
        reply: oneshot::Sender<Result<PartKey>>,
    },
    ClosePart {
        reply: oneshot::Sender<Result<CloseOutcome>>,
    },
    EndSession {
        reply: oneshot::Sender<Result<SessionSummary>>,
    },
    Snapshot {
        reply: oneshot::Sender<LedgerSnapshot>,
    },
    Shutdown,
}

/// Cloneable front door for operator actions and reads
///
/// All requests are queued to the single consumer task; replies come back on
/// oneshot channels. Requests after shutdown fail with [`Error::Stopped`].
#[derive(Clone)]
pub struct StationHandle {
    cmd_tx: mpsc::Sender<StationCommand>,
}

impl StationHandle {
    /// Declare a new part number for testing
    pub async fn open_part(&self, base: u32) -> Result<PartKey> {
        self.request(|reply| StationCommand::OpenPart { base, reply }).await?
    }

    /// Close the part under test and run its disposition
    pub async fn close_part(&self) -> Result<CloseOutcome> {
        self.request(|reply| StationCommand::ClosePart { reply }).await?
    }

    /// End the inspection run (forcing a final disposition if needed)
    pub async fn end_session(&self) -> Result<SessionSummary> {
        self.request(|reply| StationCommand::EndSession { reply }).await?
    }

    /// Immutable snapshot of the ledger for presentation
    pub async fn snapshot(&self) -> Result<LedgerSnapshot> {
        self.request(|reply| StationCommand::Snapshot { reply }).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> StationCommand,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| Error::Stopped("pipeline is shut down".into()))?;
        reply_rx
            .await
            .map_err(|_| Error::Stopped("pipeline stopped before replying".into()))
    }
}

/// Running acquisition pipeline for one session
pub struct IngestionPipeline {
    handle: StationHandle,
    reader: LineReader,
    consumer: Option<JoinHandle<()>>,
    stopped: bool,
}

impl IngestionPipeline {
    /// Start the pipeline over an opened device stream.
    ///
    /// Spawns the reader and consumer tasks and records the session through
    /// the gateway before any frame is accepted.
    pub async fn start<R>(
        device: R,
        session: SessionInfo,
        gateway: Arc<dyn PersistenceGateway>,
        authority: Arc<dyn DispositionAuthority>,
        bus: Arc<EventBus>,
        options: PipelineOptions,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut controller = LifecycleController::new(
            session,
            gateway,
            authority,
            Arc::clone(&bus),
            options.gateway_timeout,
        );
        controller.begin().await;

        let (frame_tx, frame_rx) = mpsc::channel(options.queue_depth);
        let (cmd_tx, cmd_rx) = mpsc::channel(16);

        let reader = LineReader::spawn(device, frame_tx, Arc::clone(&bus));
        let parser = FrameParser::new(options.labels);
        let consumer =
            tokio::spawn(consumer_loop(frame_rx, cmd_rx, controller, parser, bus));

        info!("Ingestion pipeline started");
        Self {
            handle: StationHandle { cmd_tx },
            reader,
            consumer: Some(consumer),
            stopped: false,
        }
    }

    pub fn handle(&self) -> StationHandle {
        self.handle.clone()
    }

    /// Stop the pipeline: halt the reader, then drain and shut down the
    /// consumer. Idempotent; after return no further ledger mutations occur.
    pub async fn stop(&mut self) {
        if self.stopped {
            debug!("Pipeline stop requested again; already stopped");
            return;
        }
        self.stopped = true;

        // Reader first so no new frames are produced while draining
        self.reader.stop().await;

        let _ = self.handle.cmd_tx.send(StationCommand::Shutdown).await;
        if let Some(consumer) = self.consumer.take() {
            match timeout(SHUTDOWN_TIMEOUT, consumer).await {
                Ok(Ok(())) => info!("Ingestion pipeline stopped"),
                Ok(Err(e)) => error!("Consumer task ended abnormally: {e}"),
                Err(_) => warn!("Consumer did not stop within {SHUTDOWN_TIMEOUT:?}; detaching"),
            }
        }
    }
}

/// Single-writer loop: the only place the ledger is ever mutated
async fn consumer_loop(
    mut frame_rx: mpsc::Receiver<RawFrame>,
    mut cmd_rx: mpsc::Receiver<StationCommand>,
    mut controller: LifecycleController,
    parser: FrameParser,
    bus: Arc<EventBus>,
) {
    let mut frames_open = true;

    loop {
        tokio::select! {
            maybe_frame = frame_rx.recv(), if frames_open => {
                match maybe_frame {
                    Some(raw) => handle_frame(&mut controller, &parser, &bus, raw).await,
                    None => {
                        // Reader gone; keep serving operator commands
                        debug!("Frame channel closed");
                        frames_open = false;
                    }
                }
            }

            maybe_cmd = cmd_rx.recv() => {
                match maybe_cmd {
                    Some(StationCommand::OpenPart { base, reply }) => {
                        let _ = reply.send(controller.open_part(base).await);
                    }
                    Some(StationCommand::ClosePart { reply }) => {
                        let _ = reply.send(controller.close_current().await);
                    }
                    Some(StationCommand::EndSession { reply }) => {
                        let _ = reply.send(controller.end_session().await);
                    }
                    Some(StationCommand::Snapshot { reply }) => {
                        let _ = reply.send(controller.snapshot());
                    }
                    Some(StationCommand::Shutdown) | None => {
                        drain_frames(&mut frame_rx);
                        break;
                    }
                }
            }
        }
    }
}

/// Parse, classify, and apply one raw frame. A bad frame is logged and
/// dropped; it never stalls ingestion of the frames behind it.
async fn handle_frame(
    controller: &mut LifecycleController,
    parser: &FrameParser,
    bus: &EventBus,
    raw: RawFrame,
) {
    let frame = match parser.parse(&raw.line) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(seq = raw.seq, "Dropped malformed frame: {e}");
            bus.emit(StationEvent::FrameRejected {
                frame: raw.line,
                reason: e.to_string(),
                timestamp: Utc::now(),
            });
            return;
        }
    };

    match controller.ingest_shot(frame).await {
        Ok(Some((part, shot))) => {
            debug!(part = %part, seq = raw.seq, index = shot.index, "Shot recorded");
        }
        Ok(None) => {}
        Err(e) => {
            // Lifecycle violation or full channel: reject, report, continue
            warn!(seq = raw.seq, "Frame rejected: {e}");
            bus.emit(StationEvent::FrameRejected {
                frame: raw.line,
                reason: e.to_string(),
                timestamp: Utc::now(),
            });
        }
    }
}

/// Discard frames still queued at shutdown, deliberately and audibly
fn drain_frames(frame_rx: &mut mpsc::Receiver<RawFrame>) {
    frame_rx.close();
    let mut discarded = 0usize;
    while frame_rx.try_recv().is_ok() {
        discarded += 1;
    }
    if discarded > 0 {
        info!("Discarded {discarded} in-flight frame(s) at shutdown");
    }
}
