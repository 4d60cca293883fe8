use anyhow::Context;

use postline_api::app::{build_app, services::Pipeline};
use postline_infra::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;
    postline_observability::init(config.log_format);

    let mut pipeline = Pipeline::from_config(&config)?;
    let worker = pipeline.spawn_worker()?;
    if worker.is_none() {
        tracing::info!("embedded worker disabled; run postline-worker to drain the queue");
    }

    let app = build_app(pipeline.services.clone());

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!(addr = %listener.local_addr()?, backend = ?config.backend, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    if let Some(worker) = worker {
        tokio::task::spawn_blocking(move || worker.shutdown())
            .await
            .context("worker shutdown task")?
            .context("worker stopped with an error")?;
    }

    tracing::info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
