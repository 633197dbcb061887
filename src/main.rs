use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use k3d_lifecycle::{
    api::AppState,
    config::{Config, LogFormat, RuntimeKind},
    create_router,
    runtime::{DockerRuntime, MemoryRuntime, Runtime},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Configuration first: it decides the log format
    let config = Config::load()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    tracing::info!("Starting k3d lifecycle backend");

    let runtime: Arc<dyn Runtime> = match config.runtime {
        RuntimeKind::Docker => Arc::new(DockerRuntime::new(config.docker_bin.clone())),
        RuntimeKind::Memory => Arc::new(MemoryRuntime::new()),
    };
    tracing::info!(runtime = runtime.name(), "Container runtime selected");

    let metrics = PrometheusBuilder::new().install_recorder()?;

    let state = AppState::new(runtime, config.clone()).with_metrics(metrics);
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
