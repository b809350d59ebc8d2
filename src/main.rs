use salestrack::{router, AppState, Config, CounterStore, DocumentStore};
use std::{net::SocketAddr, sync::Arc};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config = Config::from_env()?;
    let backend = config.connect().await?;
    let counters = CounterStore::new(
        backend
            .clone()
            .map(|store| store as Arc<dyn DocumentStore>),
    );
    let app = router(AppState::new(counters.clone()));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(persistent = counters.is_persistent(), "listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    counters.shutdown().await;
    if let Some(store) = backend {
        store.close();
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
