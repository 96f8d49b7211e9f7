use anyhow::Context;
use roomwire::{AppState, app, config::Config, hub::{Hub, HubHandle}, store::SqliteStore};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("roomwire=debug,tower_http=info")),
        )
        .init();

    let config = Config::from_env()?;

    let db = SqliteStore::connect(&config.database_url)
        .await
        .context("failed to open database")?;
    db.init_schema().await.context("failed to apply schema")?;

    let hub = Hub::spawn();

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    let app = app(AppState::new(db, hub.clone(), config));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(hub))
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

/// Waits for Ctrl-C, then stops the hub so every open socket is closed
/// and the server can drain.
async fn shutdown_signal(hub: HubHandle) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {e}");
    }
    tracing::info!("shutting down");
    hub.shutdown();
}
