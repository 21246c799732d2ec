//! Buffered transfer registry.
//!
//! A [`Transfer`] is created once its whole payload has been received, is
//! consumed by exactly one download stream, and is removed from the
//! [`TransferRegistry`] exactly once: when that stream ends, or when the
//! eviction janitor finds it unclaimed past its time-to-live.
//!
//! Pause/resume/cancel flags live in a per-transfer [`watch`] channel so a
//! paused stream is woken as soon as the flags change.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::spool::SpooledPayload;

/// Random bytes behind a download token.
const TOKEN_BYTES: usize = 24;

/// Control verb accepted by `/api/transfer/{file_id}/{action}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferAction {
    /// Suspend streaming
    Pause,
    /// Continue streaming
    Resume,
    /// Stop streaming at the next chunk boundary
    Cancel,
}

impl FromStr for TransferAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            "cancel" => Ok(Self::Cancel),
            other => Err(Error::InvalidAction(other.to_string())),
        }
    }
}

impl fmt::Display for TransferAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
        })
    }
}

/// Pause/cancel flags of a transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlState {
    /// Streaming is suspended
    pub paused: bool,
    /// Streaming must stop
    pub cancelled: bool,
}

impl ControlState {
    fn apply(&mut self, action: TransferAction) {
        match action {
            TransferAction::Pause => self.paused = true,
            TransferAction::Resume => self.paused = false,
            TransferAction::Cancel => self.cancelled = true,
        }
    }
}

/// Descriptive fields of a new transfer.
#[derive(Debug, Clone)]
pub struct TransferMeta {
    /// File name shown to the receiver
    pub filename: String,
    /// Uploading device
    pub sender_id: String,
    /// Receiving device
    pub receiver_id: String,
    /// Sender display name at upload time
    pub sender_name: String,
}

/// A buffered file handoff between two devices.
pub struct Transfer {
    file_id: String,
    token: String,
    meta: TransferMeta,
    total_size: u64,
    created_at: Instant,
    payload: Mutex<Option<SpooledPayload>>,
    control: watch::Sender<ControlState>,
}

impl Transfer {
    /// Wrap a received payload, minting a fresh id and download token.
    #[must_use]
    pub fn new(meta: TransferMeta, payload: SpooledPayload) -> Self {
        Self::with_id(crate::new_id(), meta, payload)
    }

    /// Wrap a received payload under an id chosen by the caller.
    ///
    /// The download token is always minted here.
    #[must_use]
    pub fn with_id(file_id: String, meta: TransferMeta, payload: SpooledPayload) -> Self {
        let (control, _) = watch::channel(ControlState::default());
        Self {
            file_id,
            token: generate_token(),
            meta,
            total_size: payload.len(),
            created_at: Instant::now(),
            payload: Mutex::new(Some(payload)),
            control,
        }
    }

    /// Transfer identifier.
    #[must_use]
    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    /// One-time download token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// File name.
    #[must_use]
    pub fn filename(&self) -> &str {
        &self.meta.filename
    }

    /// Uploading device.
    #[must_use]
    pub fn sender_id(&self) -> &str {
        &self.meta.sender_id
    }

    /// Receiving device.
    #[must_use]
    pub fn receiver_id(&self) -> &str {
        &self.meta.receiver_id
    }

    /// Sender display name.
    #[must_use]
    pub fn sender_name(&self) -> &str {
        &self.meta.sender_name
    }

    /// Payload size in bytes.
    #[must_use]
    pub const fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Time since the transfer was registered.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Relative URL that streams the payload.
    #[must_use]
    pub fn download_url(&self) -> String {
        format!("/stream/{}/{}", self.file_id, self.token)
    }

    /// Current flags.
    #[must_use]
    pub fn control_state(&self) -> ControlState {
        *self.control.borrow()
    }

    /// Receiver woken on every flag change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ControlState> {
        self.control.subscribe()
    }

    /// Apply `action` and return the resulting flags.
    pub fn apply(&self, action: TransferAction) -> ControlState {
        self.control.send_modify(|state| state.apply(action));
        self.control_state()
    }

    /// Whether a download stream has taken the payload.
    #[must_use]
    pub fn is_claimed(&self) -> bool {
        self.payload.lock().is_none()
    }

    fn take_payload(&self) -> Option<SpooledPayload> {
        self.payload.lock().take()
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("file_id", &self.file_id)
            .field("filename", &self.meta.filename)
            .field("total_size", &self.total_size)
            .field("sender_id", &self.meta.sender_id)
            .field("receiver_id", &self.meta.receiver_id)
            .field("control", &self.control_state())
            .finish_non_exhaustive()
    }
}

/// URL-safe random token, unpadded.
fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Compare download tokens in time independent of where they differ.
fn tokens_match(expected: &str, presented: &str) -> bool {
    let (a, b) = (expected.as_bytes(), presented.as_bytes());
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Concurrent store of buffered transfers.
///
/// Cloning is cheap; all clones share the same registry.
#[derive(Debug, Clone)]
pub struct TransferRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<Transfer>>>>,
    max_pending: usize,
}

impl Default for TransferRegistry {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

impl TransferRegistry {
    /// Create a registry holding at most `max_pending` transfers.
    #[must_use]
    pub fn new(max_pending: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            max_pending,
        }
    }

    /// Fail with [`Error::Capacity`] if no more transfers fit.
    pub fn ensure_capacity(&self) -> Result<()> {
        if self.inner.read().len() >= self.max_pending {
            return Err(Error::Capacity(self.max_pending));
        }
        Ok(())
    }

    /// Register `transfer`.
    pub fn insert(&self, transfer: Transfer) -> Result<Arc<Transfer>> {
        let transfer = Arc::new(transfer);

        let mut map = self.inner.write();
        if map.len() >= self.max_pending {
            return Err(Error::Capacity(self.max_pending));
        }
        map.insert(transfer.file_id.clone(), Arc::clone(&transfer));
        drop(map);

        tracing::debug!(file_id = %transfer.file_id, size = transfer.total_size, "transfer registered");
        Ok(transfer)
    }

    /// Look up a transfer.
    #[must_use]
    pub fn get(&self, file_id: &str) -> Option<Arc<Transfer>> {
        self.inner.read().get(file_id).cloned()
    }

    /// Apply a control verb to `file_id`.
    ///
    /// Unknown ids fail with [`Error::NotFound`] before the verb is parsed.
    pub fn control(&self, file_id: &str, action: &str) -> Result<ControlState> {
        let transfer = self
            .get(file_id)
            .ok_or_else(|| Error::NotFound(file_id.to_string()))?;
        let action: TransferAction = action.parse()?;

        let state = transfer.apply(action);
        tracing::info!(file_id, %action, paused = state.paused, cancelled = state.cancelled, "transfer control");
        Ok(state)
    }

    /// Hand the payload of `file_id` to the caller presenting `token`.
    ///
    /// Unknown ids, token mismatches and already-claimed payloads all yield
    /// [`Error::Forbidden`]. A mismatch leaves the transfer untouched.
    pub fn claim(&self, file_id: &str, token: &str) -> Result<(Arc<Transfer>, SpooledPayload)> {
        let map = self.inner.read();
        let transfer = map.get(file_id).ok_or(Error::Forbidden)?;

        if !tokens_match(&transfer.token, token) {
            tracing::warn!(file_id, "download token mismatch");
            return Err(Error::Forbidden);
        }

        let payload = transfer.take_payload().ok_or_else(|| {
            tracing::warn!(file_id, "payload already claimed");
            Error::Forbidden
        })?;

        Ok((Arc::clone(transfer), payload))
    }

    /// Remove `file_id`. Returns `None` if it was already gone.
    pub fn remove(&self, file_id: &str) -> Option<Arc<Transfer>> {
        self.inner.write().remove(file_id)
    }

    /// Remove every unclaimed transfer older than `ttl`.
    ///
    /// Claims and evictions are serialized by the registry lock, so a
    /// transfer is never evicted out from under a stream that has started.
    pub fn evict_expired(&self, ttl: Duration) -> Vec<Arc<Transfer>> {
        let mut map = self.inner.write();
        let expired: Vec<String> = map
            .values()
            .filter(|t| t.age() > ttl && !t.is_claimed())
            .map(|t| t.file_id.clone())
            .collect();

        expired
            .iter()
            .filter_map(|id| map.remove(id))
            .inspect(|t| {
                t.take_payload();
            })
            .collect()
    }

    /// Number of registered transfers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
