//! Download streaming controller.
//!
//! A receiver opens a transfer with its `file_id` and one-time token and gets
//! a [`DownloadStream`]. The stream forwards the spooled payload in fixed-size
//! chunks and checks the transfer's control flags between chunks:
//!
//! ```text
//! Idle ──open──▶ Streaming ◀──resume──▶ Paused
//!                  │   │                  │
//!                  │   └──cancel──────────┴──▶ Cancelled
//!                  ├──payload exhausted──────▶ Completed
//!                  └──body dropped / I/O────▶ Aborted
//! ```
//!
//! Whatever the exit path, the transfer is removed from the registry exactly
//! once and both ends receive a terminal status carrying the
//! [`StreamOutcome`].

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::config::TransferConfig;
use crate::error::{Error, Result};
use crate::notify::{NotificationBus, RecvStatus, SendPhase, SendStatus, ServerEvent, Throttle};
use crate::spool::PayloadReader;
use crate::transfer::{ControlState, Transfer, TransferRegistry};

/// How a download stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamOutcome {
    /// Every byte was forwarded
    Completed,
    /// A cancel request stopped the stream
    Cancelled,
    /// The receiver went away or the payload could not be read
    Aborted,
}

/// Lifecycle of a download stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Opened, nothing forwarded yet
    Idle,
    /// Forwarding chunks
    Streaming,
    /// Waiting for resume or cancel
    Paused,
    /// Ended after the last chunk
    Completed,
    /// Ended by a cancel request
    Cancelled,
    /// Ended early without a cancel request
    Aborted,
}

impl StreamState {
    /// Whether the stream has ended.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Aborted)
    }
}

impl From<StreamOutcome> for StreamState {
    fn from(outcome: StreamOutcome) -> Self {
        match outcome {
            StreamOutcome::Completed => Self::Completed,
            StreamOutcome::Cancelled => Self::Cancelled,
            StreamOutcome::Aborted => Self::Aborted,
        }
    }
}

/// Opens download streams for buffered transfers.
#[derive(Debug, Clone)]
pub struct DownloadController {
    bus: NotificationBus,
    transfers: TransferRegistry,
    chunk_size: usize,
    progress_interval: Duration,
    pause_recheck: Duration,
}

impl DownloadController {
    /// Create a controller.
    #[must_use]
    pub fn new(bus: NotificationBus, transfers: TransferRegistry, config: &TransferConfig) -> Self {
        Self {
            bus,
            transfers,
            chunk_size: config.chunk_size,
            progress_interval: config.progress_interval,
            pause_recheck: config.pause_recheck,
        }
    }

    /// Claim `file_id` with `token` and prepare its stream.
    ///
    /// Fails with [`Error::Forbidden`] for unknown transfers, wrong tokens and
    /// payloads another stream already holds. On success the sender is told
    /// the download was accepted.
    pub async fn open(&self, file_id: &str, token: &str) -> Result<DownloadStream> {
        let (transfer, payload) = self.transfers.claim(file_id, token)?;

        // From here on the transfer is ours to clean up.
        let finisher = Finisher {
            bus: self.bus.clone(),
            transfers: self.transfers.clone(),
            transfer: Arc::clone(&transfer),
            state: StreamState::Idle,
            sent: 0,
        };
        let reader = payload.into_reader().await?;

        tracing::info!(file_id, size = transfer.total_size(), "download accepted");
        self.bus.emit(
            transfer.sender_id(),
            ServerEvent::SendStatus(SendStatus::phase(file_id, SendPhase::Accepted)),
        );

        Ok(DownloadStream {
            control: transfer.subscribe(),
            transfer,
            reader,
            finisher,
            chunk_size: self.chunk_size,
            progress_interval: self.progress_interval,
            pause_recheck: self.pause_recheck,
        })
    }
}

/// An opened download, ready to be turned into a body stream.
#[derive(Debug)]
pub struct DownloadStream {
    transfer: Arc<Transfer>,
    reader: PayloadReader,
    control: watch::Receiver<ControlState>,
    finisher: Finisher,
    chunk_size: usize,
    progress_interval: Duration,
    pause_recheck: Duration,
}

impl DownloadStream {
    /// Transfer identifier.
    #[must_use]
    pub fn file_id(&self) -> &str {
        self.transfer.file_id()
    }

    /// File name to offer the receiver.
    #[must_use]
    pub fn filename(&self) -> &str {
        self.transfer.filename()
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.transfer.total_size()
    }

    /// Forward the payload chunk by chunk.
    ///
    /// Dropping the returned stream before it ends counts as
    /// [`StreamOutcome::Aborted`].
    pub fn into_stream(self) -> impl Stream<Item = io::Result<Vec<u8>>> + Send + 'static {
        let Self {
            transfer,
            mut reader,
            mut control,
            mut finisher,
            chunk_size,
            progress_interval,
            pause_recheck,
        } = self;

        async_stream::stream! {
            let file_id = transfer.file_id().to_string();
            let total = transfer.total_size();
            let mut throttle = Throttle::new(progress_interval);
            finisher.set_state(StreamState::Streaming);

            loop {
                let current = *control.borrow();
                if current.paused && !current.cancelled {
                    finisher.set_state(StreamState::Paused);
                }
                let flags = wait_while_paused(&mut control, pause_recheck).await;
                if flags.cancelled {
                    finisher.finish(StreamOutcome::Cancelled);
                    break;
                }
                finisher.set_state(StreamState::Streaming);

                match reader.next_chunk(chunk_size).await {
                    Ok(Some(chunk)) => {
                        let sent = reader.position();
                        finisher.sent = sent;

                        if throttle.ready() {
                            finisher.bus.emit(
                                transfer.receiver_id(),
                                ServerEvent::RecvStatus(RecvStatus::progress(&file_id, sent, total)),
                            );
                            finisher.bus.emit(
                                transfer.sender_id(),
                                ServerEvent::SendStatus(SendStatus::downloading(&file_id, sent, total)),
                            );
                        }

                        yield Ok(chunk);
                    }
                    Ok(None) => {
                        finisher.finish(StreamOutcome::Completed);
                        break;
                    }
                    Err(e) => {
                        tracing::error!(file_id = %file_id, error = %e, "payload read failed");
                        finisher.finish(StreamOutcome::Aborted);
                        yield Err(into_io(e));
                        break;
                    }
                }
            }
        }
    }
}

/// Block while the transfer is paused and not cancelled.
///
/// Wakes on every flag change, and at least once per `recheck`.
async fn wait_while_paused(
    control: &mut watch::Receiver<ControlState>,
    recheck: Duration,
) -> ControlState {
    loop {
        let flags = *control.borrow_and_update();
        if flags.cancelled || !flags.paused {
            return flags;
        }
        // A timeout or a closed channel both fall through to the re-check.
        let _ = tokio::time::timeout(recheck, control.changed()).await;
    }
}

fn into_io(err: Error) -> io::Error {
    match err {
        Error::Io(e) => e,
        other => io::Error::other(other),
    }
}

/// Runs the end-of-stream bookkeeping exactly once.
#[derive(Debug)]
struct Finisher {
    bus: NotificationBus,
    transfers: TransferRegistry,
    transfer: Arc<Transfer>,
    state: StreamState,
    sent: u64,
}

impl Finisher {
    fn set_state(&mut self, next: StreamState) {
        if self.state != next && !self.state.is_terminal() {
            tracing::debug!(file_id = self.transfer.file_id(), from = ?self.state, to = ?next, "stream state");
            self.state = next;
        }
    }

    fn finish(&mut self, outcome: StreamOutcome) {
        if self.state.is_terminal() {
            return;
        }
        self.state = outcome.into();

        let file_id = self.transfer.file_id();
        let total = self.transfer.total_size();
        if self.transfers.remove(file_id).is_none() {
            tracing::warn!(file_id, "transfer already gone at stream end");
        }

        tracing::info!(file_id, ?outcome, bytes = self.sent, total, "download finished");

        self.bus.emit(
            self.transfer.receiver_id(),
            ServerEvent::RecvStatus(RecvStatus::done(file_id, self.sent, total, outcome)),
        );
        self.bus.emit(
            self.transfer.sender_id(),
            ServerEvent::SendStatus(SendStatus::done(file_id, self.sent, total, outcome)),
        );
    }
}

impl Drop for Finisher {
    fn drop(&mut self) {
        // The body may be dropped right after its final chunk without being
        // polled for the end of stream.
        let outcome = if self.sent >= self.transfer.total_size() {
            StreamOutcome::Completed
        } else {
            StreamOutcome::Aborted
        };
        self.finish(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Connection, DeviceRegistry};
    use crate::spool::SpoolWriter;
    use crate::transfer::TransferMeta;
    use futures::StreamExt;
    use tokio::sync::mpsc;

    struct Fixture {
        controller: DownloadController,
        transfers: TransferRegistry,
        transfer: Arc<Transfer>,
        sender_rx: mpsc::Receiver<ServerEvent>,
        receiver_rx: mpsc::Receiver<ServerEvent>,
    }

    async fn fixture(data: &[u8], chunk_size: usize) -> Fixture {
        let devices = DeviceRegistry::new();
        let (s, sender_rx) = Connection::new();
        let (r, receiver_rx) = Connection::new();
        let sender_id = devices.register_connection("10.0.0.1", s);
        let receiver_id = devices.register_connection("10.0.0.2", r);

        let transfers = TransferRegistry::default();
        let mut writer = SpoolWriter::new(usize::MAX);
        writer.write(data).await.unwrap();
        let transfer = transfers
            .insert(Transfer::new(
                TransferMeta {
                    filename: "clip.bin".into(),
                    sender_id,
                    receiver_id,
                    sender_name: "Laptop".into(),
                },
                writer.finish().await.unwrap(),
            ))
            .unwrap();

        let config = TransferConfig {
            chunk_size,
            progress_interval: Duration::from_millis(1),
            pause_recheck: Duration::from_millis(20),
            ..TransferConfig::default()
        };
        let controller = DownloadController::new(NotificationBus::new(devices), transfers.clone(), &config);

        Fixture {
            controller,
            transfers,
            transfer,
            sender_rx,
            receiver_rx,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn recv_done(events: &[ServerEvent]) -> Option<RecvStatus> {
        events.iter().find_map(|ev| match ev {
            ServerEvent::RecvStatus(s) if s.done == Some(true) => Some(s.clone()),
            _ => None,
        })
    }

    async fn collect(stream: DownloadStream) -> Vec<u8> {
        let mut out = Vec::new();
        let mut body = Box::pin(stream.into_stream());
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_stream_completes_and_cleans_up() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut fx = fixture(&data, 1024).await;

        let stream = fx
            .controller
            .open(fx.transfer.file_id(), fx.transfer.token())
            .await
            .unwrap();
        assert_eq!(stream.total_size(), 10_000);
        assert_eq!(stream.filename(), "clip.bin");

        assert_eq!(collect(stream).await, data);
        assert!(fx.transfers.is_empty());

        let done = recv_done(&drain(&mut fx.receiver_rx)).expect("terminal recv_status");
        assert_eq!(done.bytes, 10_000);
        assert_eq!(done.outcome, Some(StreamOutcome::Completed));

        let sender_events = drain(&mut fx.sender_rx);
        assert!(sender_events.iter().any(
            |ev| matches!(ev, ServerEvent::SendStatus(s) if s.phase == SendPhase::Accepted)
        ));
        assert!(sender_events.iter().any(|ev| matches!(
            ev,
            ServerEvent::SendStatus(s) if s.phase == SendPhase::Done
                && s.outcome == Some(StreamOutcome::Completed)
        )));
    }

    #[tokio::test]
    async fn test_wrong_token_is_forbidden_and_harmless() {
        let fx = fixture(b"abc", 1024).await;
        let err = fx.controller.open(fx.transfer.file_id(), "nope").await.unwrap_err();

        assert!(matches!(err, Error::Forbidden));
        assert_eq!(fx.transfers.len(), 1);
        assert!(!fx.transfer.is_claimed());
    }

    #[tokio::test]
    async fn test_second_open_is_forbidden() {
        let fx = fixture(b"abc", 1024).await;
        let _first = fx
            .controller
            .open(fx.transfer.file_id(), fx.transfer.token())
            .await
            .unwrap();

        let second = fx.controller.open(fx.transfer.file_id(), fx.transfer.token()).await;
        assert!(matches!(second, Err(Error::Forbidden)));
    }

    #[tokio::test]
    async fn test_cancel_stops_at_chunk_boundary() {
        let data = vec![9u8; 8 * 1024];
        let mut fx = fixture(&data, 1024).await;
        let stream = fx
            .controller
            .open(fx.transfer.file_id(), fx.transfer.token())
            .await
            .unwrap();
        let mut body = Box::pin(stream.into_stream());

        let first = body.next().await.unwrap().unwrap();
        assert_eq!(first.len(), 1024);

        fx.transfers.control(fx.transfer.file_id(), "cancel").unwrap();
        assert!(body.next().await.is_none());
        assert!(fx.transfers.is_empty());

        let done = recv_done(&drain(&mut fx.receiver_rx)).unwrap();
        assert_eq!(done.outcome, Some(StreamOutcome::Cancelled));
        assert_eq!(done.bytes, 1024);
    }

    #[tokio::test]
    async fn test_pause_holds_and_resume_continues() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 256) as u8).collect();
        let fx = fixture(&data, 512).await;
        let stream = fx
            .controller
            .open(fx.transfer.file_id(), fx.transfer.token())
            .await
            .unwrap();
        let mut body = Box::pin(stream.into_stream());

        let mut received = body.next().await.unwrap().unwrap();
        fx.transfers.control(fx.transfer.file_id(), "pause").unwrap();

        let stalled = tokio::time::timeout(Duration::from_millis(150), body.next()).await;
        assert!(stalled.is_err(), "no chunk may arrive while paused");

        fx.transfers.control(fx.transfer.file_id(), "resume").unwrap();
        while let Some(chunk) = body.next().await {
            received.extend_from_slice(&chunk.unwrap());
        }

        assert_eq!(received, data);
        assert!(fx.transfers.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_while_paused() {
        let mut fx = fixture(&[1u8; 2048], 512).await;
        let stream = fx
            .controller
            .open(fx.transfer.file_id(), fx.transfer.token())
            .await
            .unwrap();
        fx.transfers.control(fx.transfer.file_id(), "pause").unwrap();

        let mut body = Box::pin(stream.into_stream());
        let transfers = fx.transfers.clone();
        let file_id = fx.transfer.file_id().to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            transfers.control(&file_id, "cancel").unwrap();
        });

        assert!(body.next().await.is_none());
        let done = recv_done(&drain(&mut fx.receiver_rx)).unwrap();
        assert_eq!(done.outcome, Some(StreamOutcome::Cancelled));
        assert_eq!(done.bytes, 0);
    }

    #[tokio::test]
    async fn test_dropped_stream_aborts_once() {
        let mut fx = fixture(&[5u8; 4096], 1024).await;
        let stream = fx
            .controller
            .open(fx.transfer.file_id(), fx.transfer.token())
            .await
            .unwrap();
        let mut body = Box::pin(stream.into_stream());
        body.next().await.unwrap().unwrap();
        drop(body);

        assert!(fx.transfers.is_empty());
        let events = drain(&mut fx.receiver_rx);
        let terminal: Vec<_> = events
            .iter()
            .filter(|ev| matches!(ev, ServerEvent::RecvStatus(s) if s.done == Some(true)))
            .collect();
        assert_eq!(terminal.len(), 1);
        assert_eq!(recv_done(&events).unwrap().outcome, Some(StreamOutcome::Aborted));
    }

    #[tokio::test]
    async fn test_unpolled_stream_aborts_on_drop() {
        let fx = fixture(b"abc", 1024).await;
        let stream = fx
            .controller
            .open(fx.transfer.file_id(), fx.transfer.token())
            .await
            .unwrap();
        drop(stream);
        assert!(fx.transfers.is_empty());
    }

    #[tokio::test]
    async fn test_empty_payload_completes() {
        let mut fx = fixture(b"", 1024).await;
        let stream = fx
            .controller
            .open(fx.transfer.file_id(), fx.transfer.token())
            .await
            .unwrap();

        assert!(collect(stream).await.is_empty());
        let done = recv_done(&drain(&mut fx.receiver_rx)).unwrap();
        assert_eq!(done.outcome, Some(StreamOutcome::Completed));
    }

    #[test]
    fn test_outcome_wire_names() {
        assert_eq!(serde_json::to_string(&StreamOutcome::Completed).unwrap(), "\"completed\"");
        assert_eq!(serde_json::to_string(&StreamOutcome::Aborted).unwrap(), "\"aborted\"");
        assert!(StreamState::Cancelled.is_terminal());
        assert!(!StreamState::Paused.is_terminal());
    }
}
