//! HTTP and WebSocket surface of the relay.
//!
//! ## API Endpoints
//!
//! | Method | Endpoint | Description |
//! |--------|----------|-------------|
//! | GET | /api/info | Relay base URL |
//! | GET | /api/devices | Connected devices |
//! | GET | /api/health | Registry sizes |
//! | POST | /api/send_stream | Upload a file for a device (multipart) |
//! | POST | /api/transfer/{file_id}/{action} | pause, resume or cancel |
//! | GET | /stream/{file_id}/{token} | Download a buffered file |
//! | WS | /ws | Device event channel |

pub mod error;
pub mod handlers;
pub mod state;
pub mod ws;

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::Config;
use crate::error::{Error, Result};

pub use error::{ApiError, ApiResult};
pub use state::{AppState, SharedState};

/// Build the relay router over `state`.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/api/info", get(handlers::info))
        .route("/api/devices", get(handlers::devices))
        .route("/api/health", get(handlers::health))
        .route("/api/send_stream", post(handlers::send_stream))
        .route("/api/transfer/{file_id}/{action}", post(handlers::control))
        .route("/stream/{file_id}/{token}", get(handlers::download))
        .route("/ws", get(ws::upgrade))
        .layer(DefaultBodyLimit::disable())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The relay server instance.
#[derive(Debug)]
pub struct RelayServer {
    state: SharedState,
}

impl RelayServer {
    /// Create a server for `config`.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let host_url = host_url(&config);
        Self {
            state: Arc::new(AppState::new(config, host_url)),
        }
    }

    /// Shared state, for embedding and tests.
    #[must_use]
    pub fn state(&self) -> SharedState {
        Arc::clone(&self.state)
    }

    /// Base URL announced to devices.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.state.host_url
    }

    /// Serve until Ctrl+C.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Serve until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let addr = self.state.config.server.bind_addr();
        let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
            Error::Internal(format!("failed to bind {addr}: {e}"))
        })?;

        tracing::info!(%addr, url = %self.state.host_url, "relay listening");

        let janitor = tokio::spawn(janitor(Arc::clone(&self.state)));
        let app = router(Arc::clone(&self.state));

        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await;

        janitor.abort();
        tracing::info!("relay stopped");
        served.map_err(Error::Io)
    }
}

/// Periodically evict unclaimed transfers past their time-to-live.
async fn janitor(state: SharedState) {
    let mut ticker = tokio::time::interval(state.config.transfer.janitor_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let evicted = state.evict_expired();
        if evicted > 0 {
            tracing::debug!(evicted, pending = state.transfers.len(), "janitor pass");
        }
    }
}

/// Base URL devices should use to reach the relay.
///
/// `public_host` wins; otherwise the LAN address of the default route.
#[must_use]
pub fn host_url(config: &Config) -> String {
    let host = config.server.public_host.clone().unwrap_or_else(|| {
        if config.server.localhost_only {
            "127.0.0.1".to_string()
        } else {
            lan_ip()
        }
    });
    format!("http://{host}:{}", config.server.port)
}

/// Address of the interface holding the default route.
///
/// No packet is sent; connecting a UDP socket only selects a route.
fn lan_ip() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map_or_else(|_| "127.0.0.1".to_string(), |addr| addr.ip().to_string())
}
