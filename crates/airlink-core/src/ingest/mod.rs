//! Upload ingest pipeline.
//!
//! An upload is drained completely into a [`SpoolWriter`] before the receiver
//! hears about it, so sender and receiver rates are fully decoupled. While
//! draining, the sender gets `send_status {phase: "upload"}` at most once per
//! progress interval regardless of how small the incoming chunks are.
//!
//! When the device ids are not known until after the payload, the upload is
//! drained with [`IngestPipeline::buffer`] and registered later with
//! [`IngestPipeline::commit`].

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::TransferConfig;
use crate::device::DeviceRegistry;
use crate::error::{Error, PeerRole, Result};
use crate::notify::{IncomingFile, NotificationBus, SendPhase, SendStatus, ServerEvent, Throttle};
use crate::spool::{SpoolWriter, SpooledPayload};
use crate::transfer::{Transfer, TransferMeta, TransferRegistry};

/// Sender name used when the upload form carries none.
const UNKNOWN_SENDER: &str = "Unknown";

/// Address reported when the sender vanished mid-upload.
const UNKNOWN_ADDRESS: &str = "unknown";

/// Who is sending what to whom.
#[derive(Debug, Clone, Default)]
pub struct IngestRequest {
    /// Uploading device
    pub sender_id: String,
    /// Receiving device
    pub target_id: String,
    /// Display name the sender chose for this upload
    pub sender_name: Option<String>,
    /// Client-supplied file name
    pub filename: Option<String>,
}

/// Buffers uploads and hands them to the transfer registry.
#[derive(Debug, Clone)]
pub struct IngestPipeline {
    bus: NotificationBus,
    transfers: TransferRegistry,
    chunk_size: usize,
    spool_threshold: usize,
    progress_interval: Duration,
}

impl IngestPipeline {
    /// Create a pipeline.
    #[must_use]
    pub fn new(bus: NotificationBus, transfers: TransferRegistry, config: &TransferConfig) -> Self {
        Self {
            bus,
            transfers,
            chunk_size: config.chunk_size,
            spool_threshold: config.spool_threshold,
            progress_interval: config.progress_interval,
        }
    }

    fn devices(&self) -> &DeviceRegistry {
        self.bus.devices()
    }

    /// Check that both ends are connected and the relay has room.
    ///
    /// The target is checked before the sender.
    pub fn validate(&self, request: &IngestRequest) -> Result<()> {
        if request.target_id.is_empty() || !self.devices().contains(&request.target_id) {
            return Err(Error::NotConnected(PeerRole::Target));
        }
        if request.sender_id.is_empty() || !self.devices().contains(&request.sender_id) {
            return Err(Error::NotConnected(PeerRole::Sender));
        }
        self.transfers.ensure_capacity()
    }

    /// Drain `source`, register the transfer and notify both ends.
    ///
    /// Nothing is registered unless the whole payload was read. If the target
    /// disconnected while the upload was in flight the payload is discarded
    /// and the upload fails with [`Error::NotConnected`].
    pub async fn ingest<R>(&self, request: IngestRequest, source: R) -> Result<Arc<Transfer>>
    where
        R: AsyncRead + Unpin,
    {
        self.validate(&request)?;

        let file_id = crate::new_id();
        tracing::info!(
            file_id = %file_id,
            filename = ?request.filename,
            sender = %request.sender_id,
            target = %request.target_id,
            "upload started"
        );

        let payload = self.drain(&file_id, Some(&request.sender_id), source).await?;
        self.register(file_id, request, payload)
    }

    /// Drain `source` before the sender and target are known.
    ///
    /// Browsers may put the file part ahead of the device ids in the upload
    /// form. The payload is held until [`IngestPipeline::commit`] receives the
    /// ids; no upload progress is reported in the meantime.
    pub async fn buffer<R>(&self, source: R) -> Result<BufferedUpload>
    where
        R: AsyncRead + Unpin,
    {
        self.transfers.ensure_capacity()?;

        let file_id = crate::new_id();
        tracing::info!(file_id = %file_id, "upload started ahead of device ids");

        let payload = self.drain(&file_id, None, source).await?;
        Ok(BufferedUpload { file_id, payload })
    }

    /// Validate `request` and register an upload drained by
    /// [`IngestPipeline::buffer`].
    ///
    /// On failure the payload is dropped and nothing is registered.
    pub fn commit(&self, request: IngestRequest, upload: BufferedUpload) -> Result<Arc<Transfer>> {
        self.validate(&request)?;
        self.register(upload.file_id, request, upload.payload)
    }

    async fn drain<R>(
        &self,
        file_id: &str,
        sender_id: Option<&str>,
        mut source: R,
    ) -> Result<SpooledPayload>
    where
        R: AsyncRead + Unpin,
    {
        let mut writer = SpoolWriter::new(self.spool_threshold);
        let mut buf = vec![0u8; self.chunk_size];
        let mut throttle = Throttle::new(self.progress_interval);

        loop {
            let n = source.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer.write(&buf[..n]).await?;

            if let Some(sender_id) = sender_id.filter(|_| throttle.ready()) {
                self.bus.emit(
                    sender_id,
                    ServerEvent::SendStatus(SendStatus::upload(file_id, writer.len())),
                );
            }
        }

        writer.finish().await
    }

    fn register(
        &self,
        file_id: String,
        request: IngestRequest,
        payload: SpooledPayload,
    ) -> Result<Arc<Transfer>> {
        if !self.devices().contains(&request.target_id) {
            tracing::warn!(file_id = %file_id, target = %request.target_id, "target left during upload");
            return Err(Error::NotConnected(PeerRole::Target));
        }

        let filename = sanitize_filename(request.filename.as_deref());
        let sender_name = request
            .sender_name
            .as_deref()
            .map(crate::clip_name)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| UNKNOWN_SENDER.to_string());
        let sender_ip = self
            .devices()
            .get(&request.sender_id)
            .map_or_else(|| UNKNOWN_ADDRESS.to_string(), |d| d.address);

        let transfer = self.transfers.insert(Transfer::with_id(
            file_id,
            TransferMeta {
                filename,
                sender_id: request.sender_id,
                receiver_id: request.target_id,
                sender_name,
            },
            payload,
        ))?;

        tracing::info!(
            file_id = %transfer.file_id(),
            size = transfer.total_size(),
            "upload buffered"
        );

        self.bus.emit(
            transfer.receiver_id(),
            ServerEvent::IncomingFile(IncomingFile {
                file_id: transfer.file_id().to_string(),
                filename: transfer.filename().to_string(),
                size: transfer.total_size(),
                sender_name: transfer.sender_name().to_string(),
                sender_ip,
                download_url: transfer.download_url(),
            }),
        );
        self.bus.emit(
            transfer.sender_id(),
            ServerEvent::SendStatus(SendStatus::phase(transfer.file_id(), SendPhase::Delivered)),
        );

        Ok(transfer)
    }
}

/// A payload drained before its sender and target were known.
#[derive(Debug)]
pub struct BufferedUpload {
    file_id: String,
    payload: SpooledPayload,
}

impl BufferedUpload {
    /// Identifier the transfer will be registered under.
    #[must_use]
    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    /// Payload size in bytes.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.payload.len()
    }

    /// Whether the payload is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Reduce a client-supplied name to a bare, header-safe file name.
///
/// Directory components are dropped, control characters removed and double
/// quotes replaced, since the name ends up inside `Content-Disposition`.
#[must_use]
pub fn sanitize_filename(raw: Option<&str>) -> String {
    let base = raw
        .unwrap_or_default()
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or_default();

    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| if c == '"' { '\'' } else { c })
        .collect();

    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Connection;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    fn setup() -> (IngestPipeline, DeviceRegistry, TransferRegistry) {
        let devices = DeviceRegistry::new();
        let transfers = TransferRegistry::default();
        let pipeline = IngestPipeline::new(
            NotificationBus::new(devices.clone()),
            transfers.clone(),
            &TransferConfig::default(),
        );
        (pipeline, devices, transfers)
    }

    fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename(Some("report.pdf")), "report.pdf");
        assert_eq!(sanitize_filename(Some("../../etc/passwd")), "passwd");
        assert_eq!(sanitize_filename(Some("C:\\Users\\me\\a.txt")), "a.txt");
        assert_eq!(sanitize_filename(Some("say \"hi\".txt")), "say 'hi'.txt");
        assert_eq!(sanitize_filename(Some("a\r\nb")), "ab");
        assert_eq!(sanitize_filename(Some("dir/")), "file");
        assert_eq!(sanitize_filename(None), "file");
    }

    #[tokio::test]
    async fn test_unknown_target_rejected_before_transfer() {
        let (pipeline, devices, transfers) = setup();
        let (s, _rx) = Connection::new();
        let sender = devices.register_connection("10.0.0.1", s);

        let request = IngestRequest {
            sender_id: sender,
            target_id: "ghost".into(),
            ..Default::default()
        };
        let err = pipeline.ingest(request, &b"data"[..]).await.unwrap_err();

        assert!(matches!(err, Error::NotConnected(PeerRole::Target)));
        assert!(transfers.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_sender_rejected() {
        let (pipeline, devices, transfers) = setup();
        let (r, _rx) = Connection::new();
        let target = devices.register_connection("10.0.0.2", r);

        let request = IngestRequest {
            sender_id: String::new(),
            target_id: target,
            ..Default::default()
        };
        let err = pipeline.ingest(request, &b"data"[..]).await.unwrap_err();

        assert!(matches!(err, Error::NotConnected(PeerRole::Sender)));
        assert!(transfers.is_empty());
    }

    #[tokio::test]
    async fn test_ingest_registers_and_notifies() {
        let (pipeline, devices, transfers) = setup();
        let (s, mut s_rx) = Connection::new();
        let (r, mut r_rx) = Connection::new();
        let sender = devices.register_connection("10.0.0.1", s);
        let target = devices.register_connection("10.0.0.2", r);
        drain(&mut s_rx);
        drain(&mut r_rx);

        let request = IngestRequest {
            sender_id: sender.clone(),
            target_id: target.clone(),
            sender_name: Some("  Laptop ".into()),
            filename: Some("photo.jpg".into()),
        };
        let transfer = pipeline.ingest(request, &[1u8; 5000][..]).await.unwrap();

        assert_eq!(transfer.total_size(), 5000);
        assert_eq!(transfers.len(), 1);

        let incoming = drain(&mut r_rx)
            .into_iter()
            .find_map(|ev| match ev {
                ServerEvent::IncomingFile(f) => Some(f),
                _ => None,
            })
            .expect("receiver notified");
        assert_eq!(incoming.size, 5000);
        assert_eq!(incoming.filename, "photo.jpg");
        assert_eq!(incoming.sender_name, "Laptop");
        assert_eq!(incoming.sender_ip, "10.0.0.1");
        assert_eq!(
            incoming.download_url,
            format!("/stream/{}/{}", transfer.file_id(), transfer.token())
        );

        let delivered = drain(&mut s_rx).into_iter().any(|ev| {
            matches!(ev, ServerEvent::SendStatus(ref s) if s.phase == SendPhase::Delivered)
        });
        assert!(delivered);
    }

    #[tokio::test]
    async fn test_default_sender_name() {
        let (pipeline, devices, _) = setup();
        let (s, _s_rx) = Connection::new();
        let (r, _r_rx) = Connection::new();
        let sender = devices.register_connection("10.0.0.1", s);
        let target = devices.register_connection("10.0.0.2", r);

        let request = IngestRequest {
            sender_id: sender,
            target_id: target,
            sender_name: Some("   ".into()),
            filename: None,
        };
        let transfer = pipeline.ingest(request, &b"x"[..]).await.unwrap();
        assert_eq!(transfer.sender_name(), "Unknown");
        assert_eq!(transfer.filename(), "file");
    }

    #[tokio::test]
    async fn test_target_leaving_mid_upload_discards_payload() {
        let (pipeline, devices, transfers) = setup();
        let (s, _s_rx) = Connection::new();
        let (r, _r_rx) = Connection::new();
        let r_conn = r.id();
        let sender = devices.register_connection("10.0.0.1", s);
        let target = devices.register_connection("10.0.0.2", r);

        let (mut client, server) = tokio::io::duplex(64);
        let request = IngestRequest {
            sender_id: sender,
            target_id: target,
            ..Default::default()
        };

        let upload = tokio::spawn({
            let pipeline = pipeline.clone();
            async move { pipeline.ingest(request, server).await }
        });

        client.write_all(b"partial").await.unwrap();
        devices.remove_connection(r_conn);
        drop(client);

        let err = upload.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::NotConnected(PeerRole::Target)));
        assert!(transfers.is_empty());
    }

    #[tokio::test]
    async fn test_buffer_then_commit() {
        let (pipeline, devices, transfers) = setup();
        let (s, mut s_rx) = Connection::new();
        let (r, mut r_rx) = Connection::new();
        let sender = devices.register_connection("10.0.0.1", s);
        let target = devices.register_connection("10.0.0.2", r);
        drain(&mut s_rx);
        drain(&mut r_rx);

        let upload = pipeline.buffer(&[4u8; 3000][..]).await.unwrap();
        assert_eq!(upload.len(), 3000);
        assert!(transfers.is_empty());
        assert!(drain(&mut s_rx).is_empty());

        let file_id = upload.file_id().to_string();
        let request = IngestRequest {
            sender_id: sender,
            target_id: target,
            sender_name: Some("Phone".into()),
            filename: Some("scan.png".into()),
        };
        let transfer = pipeline.commit(request, upload).unwrap();

        assert_eq!(transfer.file_id(), file_id);
        assert_eq!(transfer.filename(), "scan.png");
        assert_eq!(transfers.len(), 1);
        assert!(drain(&mut r_rx)
            .iter()
            .any(|ev| matches!(ev, ServerEvent::IncomingFile(f) if f.size == 3000)));
    }

    #[tokio::test]
    async fn test_commit_validates_ids() {
        let (pipeline, devices, transfers) = setup();
        let (s, _s_rx) = Connection::new();
        let sender = devices.register_connection("10.0.0.1", s);

        let upload = pipeline.buffer(&b"data"[..]).await.unwrap();
        let request = IngestRequest {
            sender_id: sender,
            target_id: "ghost".into(),
            ..Default::default()
        };
        let err = pipeline.commit(request, upload).unwrap_err();

        assert!(matches!(err, Error::NotConnected(PeerRole::Target)));
        assert!(transfers.is_empty());
    }

    #[tokio::test]
    async fn test_capacity_refused_before_drain() {
        let devices = DeviceRegistry::new();
        let transfers = TransferRegistry::new(1);
        let pipeline = IngestPipeline::new(
            NotificationBus::new(devices.clone()),
            transfers.clone(),
            &TransferConfig::default(),
        );
        let (s, _s_rx) = Connection::new();
        let (r, _r_rx) = Connection::new();
        let sender = devices.register_connection("10.0.0.1", s);
        let target = devices.register_connection("10.0.0.2", r);
        let request = IngestRequest {
            sender_id: sender,
            target_id: target,
            ..Default::default()
        };

        pipeline.ingest(request.clone(), &b"one"[..]).await.unwrap();
        let err = pipeline.ingest(request, &b"two"[..]).await.unwrap_err();
        assert!(matches!(err, Error::Capacity(1)));
    }
}
