//! Standalone upload worker.
//!
//! Drains the shared Redis queue; run any number of these next to `postline-api`
//! started with `EMBEDDED_WORKER=false`.

use anyhow::{Context, bail};

use postline_api::app::services::Pipeline;
use postline_infra::{AppConfig, Backend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = AppConfig::from_env().context("invalid configuration")?;
    postline_observability::init(config.log_format);

    if config.backend != Backend::Redis {
        bail!("postline-worker needs BACKEND=redis; the memory backend only works inside postline-api");
    }
    config.embedded_worker = true;

    let mut pipeline = Pipeline::from_config(&config)?;
    let worker = pipeline.spawn_worker()?.context("pipeline has no worker")?;
    tracing::info!(channel = %config.upload_channel, "upload worker running");

    tokio::signal::ctrl_c().await.context("listen for ctrl-c")?;
    tracing::info!("shutdown requested");

    tokio::task::spawn_blocking(move || worker.shutdown())
        .await
        .context("worker shutdown task")?
        .context("worker stopped with an error")?;
    Ok(())
}
