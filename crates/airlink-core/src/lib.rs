//! # AirLink Core Library
//!
//! `airlink-core` implements the transfer session engine behind the AirLink
//! relay: devices on a LAN connect to the relay, a sender uploads a file, the
//! relay buffers it, and the receiver downloads it over a token-authorized
//! stream while both ends see live progress.
//!
//! ## Modules
//!
//! - [`config`] - Configuration management
//! - [`device`] - Connected device registry and presence broadcast
//! - [`ingest`] - Upload ingest pipeline
//! - [`notify`] - Event types and best-effort delivery to devices
//! - [`spool`] - Memory-then-disk payload storage
//! - [`stream`] - Download streaming controller (pause/resume/cancel)
//! - [`transfer`] - Buffered transfer registry and control flags
//! - [`web`] - HTTP and WebSocket surface
//!
//! ## Example
//!
//! ```rust,ignore
//! use airlink_core::config::Config;
//! use airlink_core::web::RelayServer;
//!
//! let config = Config::load()?.with_env_overrides()?;
//! RelayServer::new(config).run().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]

use std::time::Duration;

pub mod config;
pub mod device;
pub mod error;
pub mod ingest;
pub mod notify;
pub mod spool;
pub mod stream;
pub mod transfer;

#[cfg(feature = "web")]
pub mod web;

pub use device::{Connection, ConnectionId, Device, DeviceId, DeviceRegistry};
pub use error::{Error, PeerRole, Result};
pub use ingest::{BufferedUpload, IngestPipeline, IngestRequest};
pub use notify::{NotificationBus, ServerEvent};
pub use stream::{DownloadController, DownloadStream, StreamOutcome};
pub use transfer::{ControlState, TransferAction, TransferRegistry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default HTTP port
pub const DEFAULT_PORT: u16 = 8080;

/// Default chunk size for ingest and streaming (256 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Default in-memory spool threshold (128 MiB)
pub const DEFAULT_SPOOL_THRESHOLD: usize = 128 * 1024 * 1024;

/// Minimum gap between progress events sent to one device
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Longest device or sender display name kept, in characters
pub const MAX_NAME_LEN: usize = 60;

/// Current UTC time as an RFC 3339 string with a `Z` suffix.
pub(crate) fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Trim `raw` and keep at most [`MAX_NAME_LEN`] characters.
pub(crate) fn clip_name(raw: &str) -> String {
    raw.trim().chars().take(MAX_NAME_LEN).collect()
}

/// Fresh opaque identifier: a v4 UUID as 32 lowercase hex characters.
pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
