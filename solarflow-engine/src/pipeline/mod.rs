//! Change-stream pipelines: a store subscription feeding a projected view.

use std::{
    pin::Pin,
    sync::Arc,
    time::{Duration, SystemTime},
};

use futures::{Stream, StreamExt};
use solarflow_client::{
    db::{Record, SnapshotScope},
    RecordStore,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub payload: T,
    pub received_at: SystemTime,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("source error: {0}")]
    Source(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("sink error: {0}")]
    Sink(String),
}

pub type EnvelopeStream<T> = Pin<Box<dyn Stream<Item = Result<Envelope<T>, PipelineError>> + Send>>;

#[async_trait::async_trait]
pub trait Source<T>: Send + Sync {
    async fn stream(&self) -> Result<EnvelopeStream<T>, PipelineError>;
}

#[async_trait::async_trait]
pub trait Sink<T>: Send + Sync {
    async fn run<S>(&self, input: S) -> Result<(), PipelineError>
    where
        S: Stream<Item = Result<Envelope<T>, PipelineError>> + Send + Unpin + 'static;
}

/// A projected view that folds delivered records synchronously.
pub trait Reconcile: Send + Sync + 'static {
    /// Fold one record into the view. Returns whether the view changed.
    fn reconcile(&mut self, record: &Record) -> Result<bool, PipelineError>;
}

/// Subscription to one collection of the record store.
pub struct StoreSource<S> {
    store: Arc<S>,
    collection: &'static str,
    scope: SnapshotScope,
}

impl<S> StoreSource<S> {
    pub fn new(store: Arc<S>, collection: &'static str, scope: SnapshotScope) -> Self {
        Self {
            store,
            collection,
            scope,
        }
    }
}

#[async_trait::async_trait]
impl<S: RecordStore> Source<Record> for StoreSource<S> {
    async fn stream(&self) -> Result<EnvelopeStream<Record>, PipelineError> {
        let records = self
            .store
            .subscribe(self.collection, self.scope)
            .await
            .map_err(|e| PipelineError::Source(format!("subscribe to {}: {e}", self.collection)))?;

        let stream = records.map(|item| {
            item.map(|payload| Envelope {
                payload,
                received_at: SystemTime::now(),
            })
            .map_err(|e| PipelineError::Source(e.to_string()))
        });
        Ok(Box::pin(stream))
    }
}

/// Applies every delivered record to a shared view. Stops with the error when
/// the change stream reports one, since records may have been dropped.
pub struct ViewSink<R> {
    name: &'static str,
    view: Arc<RwLock<R>>,
}

impl<R> ViewSink<R> {
    pub fn new(name: &'static str, view: Arc<RwLock<R>>) -> Self {
        Self { name, view }
    }
}

#[async_trait::async_trait]
impl<R: Reconcile> Sink<Record> for ViewSink<R> {
    async fn run<S>(&self, mut input: S) -> Result<(), PipelineError>
    where
        S: Stream<Item = Result<Envelope<Record>, PipelineError>> + Send + Unpin + 'static,
    {
        while let Some(item) = input.next().await {
            let env = match item {
                Ok(env) => env,
                Err(e) => {
                    tracing::error!(error = %e, view = self.name, "error in upstream change stream");
                    return Err(e);
                }
            };

            let result = self.view.write().await.reconcile(&env.payload);
            match result {
                Ok(true) => {
                    metrics::counter!("view_updates_total", "view" => self.name).increment(1);
                    if let Ok(lag) = SystemTime::now().duration_since(env.received_at) {
                        metrics::histogram!("view_apply_latency_seconds", "view" => self.name)
                            .record(lag.as_secs_f64());
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(error = %e, key = %env.payload.key, view = self.name, "skipping undecodable record");
                    metrics::counter!("view_decode_errors_total", "view" => self.name).increment(1);
                }
            }
        }

        Ok(())
    }
}

pub struct Pipeline<S, K> {
    pub name: &'static str,
    pub source: S,
    pub sink: K,
}

impl<S, K> Pipeline<S, K>
where
    S: Source<Record> + Send + Sync + 'static,
    K: Sink<Record> + Send + Sync + 'static,
{
    /// Run until the change stream ends or `shutdown` fires.
    ///
    /// A source error resubscribes, which replays the snapshot so records
    /// dropped by the interrupted stream reach the view.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), PipelineError> {
        let mut stream = self.source.stream().await?;
        tracing::info!(pipeline = self.name, "reconcile pipeline started");

        loop {
            let res = tokio::select! {
                res = self.sink.run(stream) => res,
                _ = shutdown.cancelled() => {
                    tracing::info!(pipeline = self.name, "reconcile pipeline stopped");
                    return Ok(());
                }
            };

            match res {
                Err(PipelineError::Source(e)) => {
                    tracing::warn!(pipeline = self.name, error = %e, "change stream interrupted, resubscribing");
                    metrics::counter!("pipeline_resubscribe_total", "pipeline" => self.name).increment(1);
                    stream = match self.resubscribe(&shutdown).await {
                        Some(stream) => stream,
                        None => return Ok(()),
                    };
                }
                res => {
                    tracing::warn!(pipeline = self.name, "change stream ended");
                    return res;
                }
            }
        }
    }

    /// `None` once `shutdown` fires.
    async fn resubscribe(&self, shutdown: &CancellationToken) -> Option<EnvelopeStream<Record>> {
        loop {
            match self.source.stream().await {
                Ok(stream) => return Some(stream),
                Err(e) => tracing::warn!(pipeline = self.name, error = %e, "resubscribe failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
                _ = shutdown.cancelled() => return None,
            }
        }
    }
}
