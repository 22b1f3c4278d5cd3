//! Worker binary: loads env configuration and keeps a client attached to
//! the coordinator until interrupted.

use anyhow::{Context, Result};
use sb_core::config::WorkerConfig;
use sb_worker::WorkerClient;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = WorkerConfig::from_env().context("failed to load worker configuration")?;
    sb_telemetry::logging::init_logging("sb-worker", &config.log_level);

    info!(
        name = %config.name,
        coordinator = %config.coordinator_url,
        default_cwd = %config.default_cwd.display(),
        "switchboard worker starting"
    );

    let client = WorkerClient::new(config);

    tokio::select! {
        result = client.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received, shutting down");
            Ok(())
        }
    }
}
