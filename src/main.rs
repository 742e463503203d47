//! Conductor entry point: builds the runtime and runs the queue worker
//! until interrupted.

use conductor::{Config, Runtime};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conductor=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!("Loaded configuration: model={}", config.default_model);

    let runtime = Runtime::new(config);
    let worker = runtime.start_worker();
    info!("Queue worker started");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    worker.abort();

    Ok(())
}
