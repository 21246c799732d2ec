//! Shared application state for the relay's HTTP handlers.

use std::sync::Arc;

use crate::config::Config;
use crate::device::DeviceRegistry;
use crate::ingest::IngestPipeline;
use crate::notify::{NotificationBus, SendPhase, SendStatus, ServerEvent};
use crate::stream::DownloadController;
use crate::transfer::TransferRegistry;

/// Everything a handler may touch.
#[derive(Debug)]
pub struct AppState {
    /// Effective configuration
    pub config: Config,

    /// Base URL announced to devices in `welcome`
    pub host_url: String,

    /// Connected devices
    pub devices: DeviceRegistry,

    /// Buffered transfers
    pub transfers: TransferRegistry,

    /// Event delivery to devices
    pub bus: NotificationBus,

    /// Upload handling
    pub ingest: IngestPipeline,

    /// Download handling
    pub downloads: DownloadController,
}

impl AppState {
    /// Build the registries and engines for `config`.
    #[must_use]
    pub fn new(config: Config, host_url: impl Into<String>) -> Self {
        let devices = DeviceRegistry::new();
        let transfers = TransferRegistry::new(config.transfer.max_pending_transfers);
        let bus = NotificationBus::new(devices.clone());
        let ingest = IngestPipeline::new(bus.clone(), transfers.clone(), &config.transfer);
        let downloads = DownloadController::new(bus.clone(), transfers.clone(), &config.transfer);

        Self {
            config,
            host_url: host_url.into(),
            devices,
            transfers,
            bus,
            ingest,
            downloads,
        }
    }

    /// Evict unclaimed transfers past their time-to-live and tell their
    /// senders. Returns how many were evicted.
    pub fn evict_expired(&self) -> usize {
        let evicted = self.transfers.evict_expired(self.config.transfer.transfer_ttl);
        for transfer in &evicted {
            tracing::info!(
                file_id = transfer.file_id(),
                age_secs = transfer.age().as_secs(),
                "evicting unclaimed transfer"
            );
            self.bus.emit(
                transfer.sender_id(),
                ServerEvent::SendStatus(SendStatus::phase(transfer.file_id(), SendPhase::Expired)),
            );
        }
        evicted.len()
    }
}

/// Shared state type used in handlers.
pub type SharedState = Arc<AppState>;
