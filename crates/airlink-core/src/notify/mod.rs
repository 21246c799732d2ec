//! Device event channel messages and best-effort delivery.
//!
//! Every frame on a device's event channel is a JSON object of the form
//! `{"event": <name>, "data": <payload>}`.
//!
//! | Direction | Event | Payload |
//! |-----------|-------|---------|
//! | relay → device | `welcome` | `{device_id, ip, url}` |
//! | relay → device | `devices` | `[{device_id, name, ip, last_seen}, …]` |
//! | relay → device | `incoming_file` | `{file_id, filename, size, sender_name, sender_ip, download_url}` |
//! | relay → device | `send_status` | `{file_id, phase, bytes?, total?, outcome?}` |
//! | relay → device | `recv_status` | `{file_id, bytes, total, done?, outcome?}` |
//! | device → relay | `register` | `{device_id, name}` |
//! | device → relay | `heartbeat` | `{device_id}` |
//!
//! Delivery never fails from the caller's point of view: a peer that has
//! disconnected must not abort a transfer in progress for the other party.
//! Lost events are logged instead.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::device::{DeviceInfo, DeviceRegistry};
use crate::stream::StreamOutcome;

/// Message pushed from the relay to a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Sent once when the event channel opens
    Welcome {
        /// Identifier assigned to the connecting device
        device_id: String,
        /// Address the relay sees for the device
        ip: String,
        /// Base URL of the relay
        url: String,
    },
    /// Full snapshot of connected devices
    Devices(Vec<DeviceInfo>),
    /// A buffered file is ready for the receiving device
    IncomingFile(IncomingFile),
    /// Progress of an outgoing transfer, for the sender
    SendStatus(SendStatus),
    /// Progress of an incoming transfer, for the receiver
    RecvStatus(RecvStatus),
}

impl ServerEvent {
    /// Wire name of the event.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::Devices(_) => "devices",
            Self::IncomingFile(_) => "incoming_file",
            Self::SendStatus(_) => "send_status",
            Self::RecvStatus(_) => "recv_status",
        }
    }
}

/// Announcement of a buffered transfer to its receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingFile {
    /// Transfer identifier
    pub file_id: String,
    /// Original file name
    pub filename: String,
    /// Payload size in bytes
    pub size: u64,
    /// Sender's display name
    pub sender_name: String,
    /// Sender's network address
    pub sender_ip: String,
    /// Relative URL that streams the payload
    pub download_url: String,
}

/// Sender-side transfer phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendPhase {
    /// Relay is still receiving the upload
    Upload,
    /// Upload buffered and receiver notified
    Delivered,
    /// Receiver opened the download stream
    Accepted,
    /// Receiver is downloading
    Downloading,
    /// Download stream has ended
    Done,
    /// Transfer was evicted before anyone downloaded it
    Expired,
}

/// Status update for the sending device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendStatus {
    /// Transfer identifier
    pub file_id: String,
    /// Current phase
    pub phase: SendPhase,
    /// Bytes processed so far
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    /// Total payload size
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    /// How the download stream ended (terminal updates only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<StreamOutcome>,
}

impl SendStatus {
    /// Status update carrying only a phase.
    #[must_use]
    pub fn phase(file_id: impl Into<String>, phase: SendPhase) -> Self {
        Self {
            file_id: file_id.into(),
            phase,
            bytes: None,
            total: None,
            outcome: None,
        }
    }

    /// Upload progress (total is unknown while draining).
    #[must_use]
    pub fn upload(file_id: impl Into<String>, bytes: u64) -> Self {
        Self {
            bytes: Some(bytes),
            ..Self::phase(file_id, SendPhase::Upload)
        }
    }

    /// Download progress as seen by the sender.
    #[must_use]
    pub fn downloading(file_id: impl Into<String>, bytes: u64, total: u64) -> Self {
        Self {
            bytes: Some(bytes),
            total: Some(total),
            ..Self::phase(file_id, SendPhase::Downloading)
        }
    }

    /// Terminal update once the download stream has ended.
    #[must_use]
    pub fn done(file_id: impl Into<String>, bytes: u64, total: u64, outcome: StreamOutcome) -> Self {
        Self {
            bytes: Some(bytes),
            total: Some(total),
            outcome: Some(outcome),
            ..Self::phase(file_id, SendPhase::Done)
        }
    }
}

/// Status update for the receiving device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecvStatus {
    /// Transfer identifier
    pub file_id: String,
    /// Bytes forwarded so far
    pub bytes: u64,
    /// Total payload size
    pub total: u64,
    /// Set on the terminal update
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
    /// How the download stream ended (terminal updates only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<StreamOutcome>,
}

impl RecvStatus {
    /// In-flight progress.
    #[must_use]
    pub fn progress(file_id: impl Into<String>, bytes: u64, total: u64) -> Self {
        Self {
            file_id: file_id.into(),
            bytes,
            total,
            done: None,
            outcome: None,
        }
    }

    /// Terminal update.
    #[must_use]
    pub fn done(file_id: impl Into<String>, bytes: u64, total: u64, outcome: StreamOutcome) -> Self {
        Self {
            done: Some(true),
            outcome: Some(outcome),
            ..Self::progress(file_id, bytes, total)
        }
    }
}

/// Message sent from a device to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Device describes itself
    Register {
        /// Identifier from `welcome`
        device_id: String,
        /// Display name chosen by the user
        #[serde(default)]
        name: Option<String>,
    },
    /// Keep-alive
    Heartbeat {
        /// Identifier from `welcome`
        device_id: String,
    },
}

/// Rate limiter for progress events.
///
/// The first event is allowed only once `interval` has passed since the
/// throttle was created, so very short transfers emit no progress at all,
/// only their terminal status.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last: Instant,
}

impl Throttle {
    /// Start a throttle that opens every `interval`.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Instant::now(),
        }
    }

    /// Returns true, and restarts the timer, if `interval` has elapsed.
    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last) > self.interval {
            self.last = now;
            true
        } else {
            false
        }
    }
}

/// Addresses events to devices through their live connection.
#[derive(Debug, Clone)]
pub struct NotificationBus {
    devices: DeviceRegistry,
}

impl NotificationBus {
    /// Create a bus that resolves devices through `devices`.
    #[must_use]
    pub const fn new(devices: DeviceRegistry) -> Self {
        Self { devices }
    }

    /// Deliver `event` to `device_id`.
    ///
    /// Returns whether the event was handed to a live connection. A missing
    /// device or a closed channel is logged and otherwise ignored.
    pub fn emit(&self, device_id: &str, event: ServerEvent) -> bool {
        let name = event.name();

        let Some(connection) = self.devices.connection_for(device_id) else {
            tracing::debug!(device_id, event = name, "dropping event for unknown device");
            return false;
        };

        let delivered = connection.send(event);
        if !delivered {
            tracing::debug!(
                device_id,
                connection = %connection.id(),
                event = name,
                "event not delivered"
            );
        }
        delivered
    }

    /// Deliver `event` to every connected device.
    pub fn broadcast(&self, event: &ServerEvent) {
        self.devices.broadcast(event);
    }

    /// The registry this bus resolves devices through.
    #[must_use]
    pub const fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }
}
