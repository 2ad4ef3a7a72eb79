//! MetaGate gateway binary
//!
//! Loads the registry snapshot into the in-memory store, starts the engine
//! and serves the status router until ctrl-c.

use std::sync::Arc;

use anyhow::Context;
use metagate_gateway::{routes, Config, Gateway, Repositories};
use metagate_shared::{InMemoryStore, RegistrySnapshot};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before anything reads the environment
    dotenvy::dotenv().ok();

    init_tracing();

    let config = Config::from_env().context("invalid configuration")?;
    let store = Arc::new(load_store(config.registry_file.as_deref()).await?);

    let bind_address = config.bind_address.clone();
    let gateway = Arc::new(
        Gateway::builder(config, Repositories::from_store(store))
            .build()
            .context("failed to assemble gateway")?,
    );
    gateway.start().await;

    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind to {}", bind_address))?;
    tracing::info!(address = %bind_address, "MetaGate listening");

    axum::serve(listener, routes::router(gateway.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("status server failure")?;

    gateway.shutdown().await;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("metagate_gateway=info,tower_http=info"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn load_store(path: Option<&str>) -> anyhow::Result<InMemoryStore> {
    let Some(path) = path else {
        tracing::warn!("METAGATE_REGISTRY_FILE not set, starting with an empty registry");
        return Ok(InMemoryStore::new());
    };

    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read registry file {}", path))?;
    let snapshot: RegistrySnapshot =
        serde_json::from_str(&raw).with_context(|| format!("invalid registry file {}", path))?;

    tracing::info!(
        path = %path,
        servers = snapshot.servers.len(),
        namespaces = snapshot.namespaces.len(),
        "Registry loaded"
    );
    Ok(InMemoryStore::from_snapshot(snapshot).await)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
