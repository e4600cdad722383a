use anyhow::Result;
use solarflow_client::db::{
    BatchWrite, Document, MemoryStore, PgStore, Record, RecordKey, RecordStream, SnapshotScope, WriteResult,
};
use solarflow_client::{RecordStore, StoreError};
use solarflow_engine::{
    api,
    clock::SystemClock,
    config::{AppConfig, StoreKind},
    engine::Engine,
    metrics_server, observability,
};
use std::{net::SocketAddr, sync::Arc};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

enum StoreBackend {
    Memory(MemoryStore),
    Postgres(PgStore),
}

#[async_trait::async_trait]
impl RecordStore for StoreBackend {
    async fn get(&self, key: &RecordKey) -> Result<Option<Record>, StoreError> {
        match self {
            Self::Memory(s) => s.get(key).await,
            Self::Postgres(s) => s.get(key).await,
        }
    }

    async fn put_merge(&self, key: &RecordKey, fields: Document, timestamp: OffsetDateTime) -> Result<u64, StoreError> {
        match self {
            Self::Memory(s) => s.put_merge(key, fields, timestamp).await,
            Self::Postgres(s) => s.put_merge(key, fields, timestamp).await,
        }
    }

    async fn put_batch(&self, writes: Vec<BatchWrite>, timestamp: OffsetDateTime) -> Result<Vec<WriteResult>, StoreError> {
        match self {
            Self::Memory(s) => s.put_batch(writes, timestamp).await,
            Self::Postgres(s) => s.put_batch(writes, timestamp).await,
        }
    }

    async fn query_recent(&self, collection: &str, limit: usize) -> Result<Vec<Record>, StoreError> {
        match self {
            Self::Memory(s) => s.query_recent(collection, limit).await,
            Self::Postgres(s) => s.query_recent(collection, limit).await,
        }
    }

    async fn subscribe(&self, collection: &str, scope: SnapshotScope) -> Result<RecordStream, StoreError> {
        match self {
            Self::Memory(s) => s.subscribe(collection, scope).await,
            Self::Postgres(s) => s.subscribe(collection, scope).await,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    // Load configuration
    let cfg = AppConfig::load()?;

    // Start metrics server if configured
    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let store = match cfg.store.kind {
        StoreKind::Memory => {
            tracing::warn!("using in-memory record store; state is lost on exit");
            StoreBackend::Memory(MemoryStore::new())
        }
        StoreKind::Postgres => {
            let uri = cfg
                .store
                .uri
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("store.uri is required for the postgres store"))?;
            StoreBackend::Postgres(PgStore::connect(uri, cfg.store.max_connections).await?)
        }
    };

    let engine = Arc::new(Engine::new(
        Arc::new(store),
        Arc::new(SystemClock),
        cfg.engine.settings(),
    ));

    let created = engine.provision().await?;
    tracing::info!(created, "record store ready");

    let shutdown = CancellationToken::new();
    let reconcilers = engine.spawn_reconcilers(shutdown.clone());

    let addr: SocketAddr = cfg
        .api
        .bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid api.bind_addr: {e}"))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "operator API listening");

    let app = api::router(engine.clone());
    let server_shutdown = shutdown.clone();
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
            server_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    for handle in reconcilers {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "reconcile pipeline failed"),
            Err(e) => tracing::error!(error = %e, "reconcile pipeline panicked"),
        }
    }

    Ok(())
}
