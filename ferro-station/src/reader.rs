//! Device line reader
//!
//! Owns the hardware stream and turns it into newline-delimited raw frames on
//! a bounded channel. The reader is the sole producer; backpressure from a
//! slow consumer blocks the reader instead of dropping frames. I/O failure is
//! reported once through the event bus and ends the loop; a stop request is
//! observed within one poll interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use ferro_common::events::{EventBus, StationEvent};

/// How long a single blocking read may run before the stop flag is rechecked
const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Bound on how long `stop()` waits for the read loop to exit
const STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// One raw line read from the device, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Monotonic arrival sequence, starting at 1
    pub seq: u64,
    pub line: String,
}

/// Background reader over any line-oriented byte stream
///
/// Generic over the I/O handle so tests can feed frames through an in-memory
/// duplex and production can hand in the opened device node.
pub struct LineReader {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl LineReader {
    /// Spawn the read loop. Decoded lines go to `frame_tx`; faults go to the
    /// event bus as a one-time `DeviceFault`.
    pub fn spawn<R>(io: R, frame_tx: mpsc::Sender<RawFrame>, bus: Arc<EventBus>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = tokio::spawn(async move {
            read_loop(io, frame_tx, bus, stop_flag).await;
        });

        info!("Device reader started");
        Self { stop, handle: Some(handle) }
    }

    /// Request loop termination and wait (bounded) for it to exit.
    ///
    /// Idempotent: the second and later calls return immediately. After this
    /// returns, no further frames are produced.
    pub async fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            match timeout(STOP_TIMEOUT, handle).await {
                Ok(Ok(())) => info!("Device reader stopped"),
                Ok(Err(e)) => warn!("Device reader task ended abnormally: {e}"),
                Err(_) => warn!("Device reader did not stop within {STOP_TIMEOUT:?}; detaching"),
            }
        }
    }
}

async fn read_loop<R>(
    mut io: R,
    frame_tx: mpsc::Sender<RawFrame>,
    bus: Arc<EventBus>,
    stop: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin + Send,
{
    // Raw bytes accumulate here across poll timeouts; `read` is cancel-safe,
    // so an expired poll never discards a partially received line. Only
    // complete lines are drained out of the accumulator.
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 1024];
    let mut seq: u64 = 0;

    loop {
        if stop.load(Ordering::SeqCst) {
            debug!("Device reader observed stop request");
            return;
        }

        match timeout(READ_POLL_INTERVAL, io.read(&mut chunk)).await {
            // Poll interval elapsed with no bytes; not an error
            Err(_) => continue,

            Ok(Ok(0)) => {
                // EOF: flush a trailing unterminated line, then report once
                let line = String::from_utf8_lossy(&pending).trim().to_string();
                if !line.is_empty() {
                    seq += 1;
                    let _ = frame_tx.send(RawFrame { seq, line }).await;
                }
                report_fault(&bus, "device stream closed");
                return;
            }

            Ok(Ok(n)) => {
                pending.extend_from_slice(&chunk[..n]);
                while let Some(line) = take_line(&mut pending) {
                    if line.is_empty() {
                        continue;
                    }
                    seq += 1;
                    debug!(seq, %line, "Received frame");
                    if frame_tx.send(RawFrame { seq, line }).await.is_err() {
                        // Consumer gone; nothing left to deliver to
                        debug!("Frame channel closed; device reader exiting");
                        return;
                    }
                }
            }

            Ok(Err(e)) => {
                report_fault(&bus, &format!("read failed: {e}"));
                return;
            }
        }
    }
}

/// Drain one complete line from the accumulator, or `None` if no newline has
/// arrived yet. Partial content stays in place untouched.
fn take_line(pending: &mut Vec<u8>) -> Option<String> {
    let pos = pending.iter().position(|&b| b == b'\n')?;
    let line = String::from_utf8_lossy(&pending[..pos]).trim().to_string();
    pending.drain(..=pos);
    Some(line)
}

fn report_fault(bus: &EventBus, message: &str) {
    warn!("Device fault: {message}");
    bus.emit(StationEvent::DeviceFault {
        message: message.to_string(),
        timestamp: Utc::now(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn delivers_lines_in_order_then_reports_eof() {
        let (mut writer, device) = tokio::io::duplex(256);
        let bus = Arc::new(EventBus::new(16));
        let mut fault_rx = bus.subscribe();
        let (tx, mut rx) = mpsc::channel(8);

        let mut reader = LineReader::spawn(device, tx, Arc::clone(&bus));

        writer.write_all(b"Meter 1:5.0:0.5\nMeter 2:3.1:0.4\n").await.unwrap();
        drop(writer);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(first.line, "Meter 1:5.0:0.5");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.seq, 2);
        assert_eq!(second.line, "Meter 2:3.1:0.4");

        // Stream end surfaces exactly one DeviceFault
        match fault_rx.recv().await.unwrap() {
            StationEvent::DeviceFault { message, .. } => {
                assert!(message.contains("closed"), "got {message}");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        reader.stop().await;
    }

    #[tokio::test]
    async fn flushes_trailing_unterminated_line_at_eof() {
        let (mut writer, device) = tokio::io::duplex(64);
        let bus = Arc::new(EventBus::new(16));
        let (tx, mut rx) = mpsc::channel(8);

        let mut reader = LineReader::spawn(device, tx, bus);
        writer.write_all(b"Meter 1:4.0:0.2").await.unwrap();
        drop(writer);

        assert_eq!(rx.recv().await.unwrap().line, "Meter 1:4.0:0.2");
        reader.stop().await;
    }

    #[tokio::test]
    async fn partial_line_survives_slow_chunked_writes() {
        let (mut writer, device) = tokio::io::duplex(64);
        let bus = Arc::new(EventBus::new(16));
        let (tx, mut rx) = mpsc::channel(8);

        let mut reader = LineReader::spawn(device, tx, bus);

        // The device emits one frame in two chunks with a gap longer than
        // several poll intervals; the head must not be discarded.
        writer.write_all(b"Meter 1:5.").await.unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;
        writer.write_all(b"0:0.5\n").await.unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.line, "Meter 1:5.0:0.5");
        assert_eq!(frame.seq, 1);

        reader.stop().await;
    }

    #[tokio::test]
    async fn blank_lines_are_skipped() {
        let (mut writer, device) = tokio::io::duplex(64);
        let bus = Arc::new(EventBus::new(16));
        let (tx, mut rx) = mpsc::channel(8);

        let mut reader = LineReader::spawn(device, tx, bus);
        writer.write_all(b"\n\nMeter 2:1.0:0.1\n").await.unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.line, "Meter 2:1.0:0.1");
        assert_eq!(frame.seq, 1);

        reader.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_prompt() {
        let (_writer, device) = tokio::io::duplex(64);
        let bus = Arc::new(EventBus::new(16));
        let (tx, _rx) = mpsc::channel(8);

        let mut reader = LineReader::spawn(device, tx, bus);
        reader.stop().await;
        // Second call must return immediately with no effect
        reader.stop().await;
    }
}
