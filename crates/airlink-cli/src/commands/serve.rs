//! Serve command implementation.

use std::path::Path;

use anyhow::{Context, Result};

use airlink_core::config::Config;
use airlink_core::web::RelayServer;

use super::ServeArgs;

/// Run the serve command.
pub async fn run(args: ServeArgs, config_path: Option<&Path>) -> Result<()> {
    let config = super::load_config(config_path)?
        .with_env_overrides()
        .context("Invalid environment override")?;
    let config = apply_args(config, &args);
    config.validate().context("Invalid configuration")?;

    tracing::debug!(
        port = config.server.port,
        localhost_only = config.server.localhost_only,
        max_pending = config.transfer.max_pending_transfers,
        "Effective configuration"
    );

    let server = RelayServer::new(config);

    println!();
    println!("AirLink v{}", airlink_core::VERSION);
    println!("  {}", server.url());
    println!();
    println!("  Press Ctrl+C to stop");
    println!();

    server.run().await.context("Relay server failed")
}

/// Command-line flags win over the file and the environment.
fn apply_args(mut config: Config, args: &ServeArgs) -> Config {
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = &args.host {
        config.server.public_host = Some(host.clone());
    }
    if args.localhost_only {
        config.server.localhost_only = true;
    }
    config
}
