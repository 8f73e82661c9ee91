use std::net::SocketAddr;
use std::sync::Arc;

use rexec_executor::{RemoteExecutor, WorkerConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,rexec_server=debug,rexec_executor=debug".into()),
        )
        .init();

    let config = WorkerConfig::from_env();
    info!(
        volume = %config.volume_path.display(),
        volume_mounted = config.has_volume(),
        endpoint_id = config.endpoint_id.as_deref().unwrap_or("<unset>"),
        "starting rexec worker"
    );
    let executor = Arc::new(RemoteExecutor::new(config)?);
    let app = rexec_server::router(executor);

    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000u16);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
