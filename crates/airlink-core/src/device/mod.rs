//! Connected device registry.
//!
//! A device exists exactly as long as its event channel is open. The registry
//! owns every [`Device`] record together with the [`Connection`] used to push
//! events to it, and keeps a reverse index from connection to device so a
//! closing socket can be resolved without scanning.
//!
//! Every change to membership or display metadata is followed by a `devices`
//! broadcast carrying the full list. The broadcast is queued while the write
//! lock is still held, so every device observes snapshots in mutation order.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::notify::ServerEvent;

/// Opaque device identifier.
pub type DeviceId = String;

/// Events queued per connection before new ones are dropped.
pub const CONNECTION_QUEUE_CAPACITY: usize = 256;

/// Name stored when a device registers without one.
const UNNAMED: &str = "Unnamed";

/// Length of the id prefix used as a fallback display name.
const ID_PREFIX_LEN: usize = 6;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one live event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Sending half of a device's event channel.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    tx: mpsc::Sender<ServerEvent>,
}

impl Connection {
    /// Create a connection and the receiver its socket task drains.
    #[must_use]
    pub fn new() -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(CONNECTION_QUEUE_CAPACITY);
        (
            Self {
                id: ConnectionId::next(),
                tx,
            },
            rx,
        )
    }

    /// Connection identity.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue `event` without waiting. Returns false if it was dropped.
    pub fn send(&self, event: ServerEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(ev)) => {
                tracing::warn!(connection = %self.id, event = ev.name(), "event queue full, dropping");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Whether the receiving side has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A connected device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Identifier assigned at connection time
    pub device_id: DeviceId,
    /// Name set by the device, if it registered one
    pub name: Option<String>,
    /// Address captured at connection time
    pub address: String,
    /// RFC 3339 timestamp of the last register/heartbeat
    pub last_seen: String,
    /// Connection the device is reachable on
    pub connection_id: ConnectionId,
}

impl Device {
    /// Name shown to other devices.
    #[must_use]
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            self.device_id.chars().take(ID_PREFIX_LEN).collect()
        })
    }

    /// Wire representation used by `devices` and `/api/devices`.
    #[must_use]
    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            device_id: self.device_id.clone(),
            name: self.display_name(),
            ip: self.address.clone(),
            last_seen: self.last_seen.clone(),
        }
    }
}

/// Device entry as published to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device identifier
    pub device_id: String,
    /// Display name
    pub name: String,
    /// Network address
    pub ip: String,
    /// RFC 3339 timestamp of last activity
    pub last_seen: String,
}

#[derive(Debug)]
struct Entry {
    device: Device,
    connection: Connection,
}

#[derive(Debug, Default)]
struct Inner {
    devices: HashMap<DeviceId, Entry>,
    by_connection: HashMap<ConnectionId, DeviceId>,
}

impl Inner {
    fn snapshot(&self) -> Vec<DeviceInfo> {
        self.devices.values().map(|e| e.device.info()).collect()
    }

    fn broadcast(&self, event: &ServerEvent) {
        for entry in self.devices.values() {
            entry.connection.send(event.clone());
        }
    }

    fn broadcast_devices(&self) {
        self.broadcast(&ServerEvent::Devices(self.snapshot()));
    }
}

/// Concurrent store of connected devices.
///
/// Cloning is cheap; all clones share the same registry.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device reachable on `connection` and return its fresh id.
    pub fn register_connection(&self, address: impl Into<String>, connection: Connection) -> DeviceId {
        let device_id = crate::new_id();
        let connection_id = connection.id();
        let device = Device {
            device_id: device_id.clone(),
            name: None,
            address: address.into(),
            last_seen: crate::now_iso(),
            connection_id,
        };

        let mut inner = self.inner.write();
        inner.by_connection.insert(connection_id, device_id.clone());
        inner
            .devices
            .insert(device_id.clone(), Entry { device, connection });
        inner.broadcast_devices();
        drop(inner);

        tracing::info!(device_id = %device_id, connection = %connection_id, "device connected");
        device_id
    }

    /// Set the display name of `device_id`.
    ///
    /// The name is trimmed and clipped to [`crate::MAX_NAME_LEN`] characters;
    /// an absent or blank name is stored as `"Unnamed"`. Returns false if the
    /// device is not connected.
    pub fn set_name(&self, device_id: &str, name: Option<&str>) -> bool {
        let clipped = name.map(crate::clip_name).filter(|n| !n.is_empty());
        let name = clipped.unwrap_or_else(|| UNNAMED.to_string());

        let mut inner = self.inner.write();
        let Some(entry) = inner.devices.get_mut(device_id) else {
            return false;
        };
        entry.device.name = Some(name);
        entry.device.last_seen = crate::now_iso();
        inner.broadcast_devices();
        true
    }

    /// Record a heartbeat from `device_id`. Returns false if unknown.
    pub fn touch(&self, device_id: &str) -> bool {
        let mut inner = self.inner.write();
        inner.devices.get_mut(device_id).is_some_and(|entry| {
            entry.device.last_seen = crate::now_iso();
            true
        })
    }

    /// Remove the device bound to `connection_id`, if any.
    pub fn remove_connection(&self, connection_id: ConnectionId) -> Option<DeviceId> {
        let mut inner = self.inner.write();
        let device_id = inner.by_connection.remove(&connection_id)?;
        inner.devices.remove(&device_id);
        inner.broadcast_devices();
        drop(inner);

        tracing::info!(device_id = %device_id, connection = %connection_id, "device disconnected");
        Some(device_id)
    }

    /// Snapshot of all connected devices, in no particular order.
    #[must_use]
    pub fn list(&self) -> Vec<DeviceInfo> {
        self.inner.read().snapshot()
    }

    /// Copy of one device record.
    #[must_use]
    pub fn get(&self, device_id: &str) -> Option<Device> {
        self.inner.read().devices.get(device_id).map(|e| e.device.clone())
    }

    /// Whether `device_id` is currently connected.
    #[must_use]
    pub fn contains(&self, device_id: &str) -> bool {
        self.inner.read().devices.contains_key(device_id)
    }

    /// Number of connected devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().devices.len()
    }

    /// Whether no device is connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().devices.is_empty()
    }

    /// Current connection of `device_id`.
    #[must_use]
    pub fn connection_for(&self, device_id: &str) -> Option<Connection> {
        self.inner
            .read()
            .devices
            .get(device_id)
            .map(|e| e.connection.clone())
    }

    /// Queue `event` on every connection.
    pub fn broadcast(&self, event: &ServerEvent) {
        self.inner.read().broadcast(event);
    }
}
