// Main entry point - Dependency injection and server setup
mod domain;
mod application;
mod infrastructure;
mod presentation;

use std::{net::SocketAddr, sync::Arc, time::Duration};
use anyhow::Context;
use axum::{routing::{get, post}, Router};
use tokio::sync::watch;
use tower_http::{compression::CompressionLayer, trace::TraceLayer};
use tracing_subscriber::EnvFilter;

use crate::application::ingestion_gateway::IngestionGateway;
use crate::application::last_known_cache::LastKnownCache;
use crate::application::query_engine::QueryEngine;
use crate::application::retention_service::RetentionService;
use crate::application::sample_buffer::SampleBuffer;
use crate::application::sample_store::SampleStore;
use crate::infrastructure::config::{load_hydro_config, StoreBackend, StoreSettings};
use crate::infrastructure::connection_pool::ConnectionPool;
use crate::infrastructure::influx_store::InfluxSampleStore;
use crate::infrastructure::memory_store::MemorySampleStore;
use crate::infrastructure::overflow_log::OverflowLog;
use crate::presentation::app_state::AppState;
use crate::presentation::handlers::{health_check, ingest, latest, series};

type ClosePool = Box<dyn FnOnce() + Send>;

fn build_store(settings: &StoreSettings) -> anyhow::Result<(Arc<dyn SampleStore>, ClosePool)> {
    let acquire_timeout = Duration::from_millis(settings.acquire_timeout_ms);
    match settings.backend {
        StoreBackend::Influx => {
            let client = reqwest::Client::builder()
                .timeout(Duration::from_millis(settings.request_timeout_ms))
                .build()
                .context("failed to build InfluxDB HTTP client")?;
            let pool = Arc::new(ConnectionPool::new(client, settings.pool_size, acquire_timeout));
            let influx = &settings.influx;
            let store = InfluxSampleStore::new(
                influx.host.clone(),
                influx.token.clone(),
                influx.database.clone(),
                influx.retention_policy.clone(),
                pool.clone(),
                settings.page_size,
            );
            tracing::info!("Using InfluxDB store at {} (db {})", influx.host, influx.database);
            Ok((Arc::new(store), close_with_log(pool)))
        }
        StoreBackend::Memory => {
            let pool = Arc::new(ConnectionPool::new((), settings.pool_size, acquire_timeout));
            let store = MemorySampleStore::new(pool.clone(), settings.page_size);
            tracing::warn!("Using in-memory store; samples are lost on restart");
            Ok((Arc::new(store), close_with_log(pool)))
        }
    }
}

fn close_with_log<C: Clone + Send + Sync + 'static>(pool: Arc<ConnectionPool<C>>) -> ClosePool {
    Box::new(move || {
        pool.close();
        tracing::info!(
            "Store pool closed with {} of {} leases idle",
            pool.available(),
            pool.size()
        );
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config = load_hydro_config()?;

    // Create store (infrastructure layer)
    let (store, close_pool) = build_store(&config.store)?;
    let overflow = Arc::new(OverflowLog::new(config.overflow.path.clone()));

    // Create services (application layer)
    let (buffer, flush_handle) = SampleBuffer::start(store.clone(), overflow, &config.buffer);
    let cache = Arc::new(LastKnownCache::new());
    let gateway = IngestionGateway::new(buffer.clone(), cache.clone(), config.ingest.clone());
    let query_engine = QueryEngine::new(store.clone(), cache.clone(), config.query.clone());

    let (stop_tx, stop_rx) = watch::channel(false);
    let sweeper = RetentionService::new(store, cache.clone(), config.retention.clone()).spawn(stop_rx);

    // Create application state
    let state = Arc::new(AppState {
        gateway,
        query_engine,
        buffer,
        cache,
    });

    // Build router (presentation layer)
    let router = Router::new()
        .route("/healthz", get(health_check))
        .route("/ingest", post(ingest))
        .route("/latest/:sensor/:metric", get(latest))
        .route("/series", get(series))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start server
    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.bind))?;
    tracing::info!("Starting hydro-telemetry service on {}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain: stop the sweeper, flush what is buffered, then release the store
    let _ = stop_tx.send(true);
    if let Err(e) = sweeper.await {
        tracing::error!("Retention sweeper ended abnormally: {}", e);
    }
    flush_handle.shutdown().await;
    close_pool();
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
