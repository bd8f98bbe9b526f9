#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::{
    config::Config,
    content::{AdviceSlipSource, ContentSource},
    db::HubDb,
    distribution::ContentDistributor,
    server::{AppState, build_router},
    subscription::{SubscriptionStore, store},
    tasks::TaskExecutor,
    verification::IntentVerifier,
};

pub mod config;
pub mod content;
pub mod db;
pub mod distribution;
pub mod server;
pub mod signing;
pub mod subscription;
pub mod tasks;
pub mod verification;

#[cfg(test)]
mod test_support;

pub async fn build_hub_state(config: Config) -> Result<AppState> {
    let store = match config.db_url.clone() {
        Some(url) => {
            let db =
                HubDb::connect(url.as_str(), Duration::from_millis(config.db_timeout_ms)).await?;
            db.ensure_schema().await?;
            store::postgres(Arc::new(db))
        }
        None => store::memory(),
    };
    let http = http_client()?;
    let content_source: Arc<dyn ContentSource> = Arc::new(AdviceSlipSource::new(
        http.clone(),
        config.content_source_url.clone(),
        Duration::from_millis(config.content_source_timeout_ms),
    ));
    Ok(assemble_state(config, store, content_source, http))
}

/// Wires the verifier and distributor around an already chosen store and content source.
pub fn assemble_state(
    config: Config,
    store: Arc<dyn SubscriptionStore>,
    content_source: Arc<dyn ContentSource>,
    http: reqwest::Client,
) -> AppState {
    let tasks = TaskExecutor::new();
    let verifier = IntentVerifier::new(
        store.clone(),
        http.clone(),
        Duration::from_millis(config.verify_timeout_ms),
        tasks.clone(),
    );
    let distributor = ContentDistributor::new(
        store.clone(),
        http,
        Duration::from_millis(config.delivery_timeout_ms),
        config.max_concurrent_deliveries,
        config.max_delivery_failures,
        tasks.clone(),
    );
    info!(
        service = %config.service_name,
        store_driver = store.driver_name(),
        max_concurrent_deliveries = config.max_concurrent_deliveries,
        max_delivery_failures = config.max_delivery_failures,
        "hub state assembled"
    );
    AppState::new(config, store, verifier, distributor, content_source, tasks)
}

pub fn http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .user_agent(concat!("websub-hub/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

pub async fn build_app(config: Config) -> Result<axum::Router> {
    Ok(build_router(build_hub_state(config).await?))
}

pub async fn serve(config: Config) -> Result<()> {
    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(
        service = %config.service_name,
        bind_addr = %config.bind_addr,
        "websub hub listening"
    );
    let grace = Duration::from_millis(config.shutdown_grace_ms);
    let state = build_hub_state(config).await?;
    let tasks = state.tasks().clone();

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if tokio::time::timeout(grace, tasks.wait_idle()).await.is_err() {
        warn!(
            in_flight = tasks.in_flight(),
            "shutdown grace elapsed with hub tasks still running"
        );
    }
    info!(spawned_total = tasks.spawned_total(), "websub hub stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(reason = %error, "ctrl-c handler unavailable, serving until killed");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received, draining");
}
