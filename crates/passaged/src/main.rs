use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

mod config;
mod gateway;
mod http;
mod policy;
mod store;

use config::Config;
use gateway::HttpSimilarityGateway;
use http::AppState;
use policy::VerificationPolicy;
use store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("passaged starting");

    let config = Config::from_env();
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let store = Store::open(&config.db_path).await?;
    tracing::info!(path = %config.db_path.display(), "attendance ledger opened");

    let gateway = Arc::new(HttpSimilarityGateway::new(
        config.ai_service_url.clone(),
        config.match_threshold,
    ));
    tracing::info!(
        url = %config.ai_service_url,
        match_threshold = config.match_threshold,
        accept_floor = config.accept_floor,
        "similarity gateway configured"
    );

    let policy = Arc::new(VerificationPolicy::new(
        gateway,
        store.clone(),
        config.accept_floor,
    ));

    let state = AppState {
        policy,
        store,
        default_gate_location: config.default_gate_location.clone(),
    };
    let app = http::router(state, config.max_body_bytes);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "passaged ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("passaged shutting down");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
