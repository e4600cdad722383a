//! Operator-facing command surface and the projected read views.

use std::sync::Arc;

use serde::Serialize;
use solarflow_client::{
    db::{RecordKey, SnapshotScope},
    domain::{
        AuditEntry, AuditOrigin, LoadSource, RelayMode, RelayState, TelemetrySample, UnitId, AUDIT_COLLECTION,
        BILLING_RECORD_ID, RELAY_COLLECTION, SENSOR_COLLECTION,
    },
    RecordStore,
};
use time::Duration;
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::billing::{self, BillingSummary};
use crate::clock::Clock;
use crate::coordinator::{AuditMode, CommandReceipt, RetryPolicy, TransitionCoordinator};
use crate::error::{parse_unit, EngineError};
use crate::ledger::{AuditView, DEFAULT_VIEW_LIMIT};
use crate::pipeline::{Pipeline, PipelineError, Reconcile, StoreSource, ViewSink};
use crate::projector::{CommandProjector, CommandView, UnitUpdate};
use crate::telemetry::{self, TelemetryReconciler, DEFAULT_HISTORY_CAPACITY};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineSettings {
    pub retry: RetryPolicy,
    pub audit_mode: AuditMode,
    pub staleness_threshold: Duration,
    pub history_capacity: usize,
    pub audit_view_limit: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            audit_mode: AuditMode::default(),
            staleness_threshold: Duration::seconds(120),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            audit_view_limit: DEFAULT_VIEW_LIMIT,
        }
    }
}

/// Newest telemetry sample with its derived fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatestTelemetry {
    pub sample: TelemetrySample,
    pub live: bool,
    pub load_source: LoadSource,
}

pub struct Engine<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    coordinator: TransitionCoordinator<S>,
    commands: Arc<RwLock<CommandProjector>>,
    telemetry: Arc<RwLock<TelemetryReconciler>>,
    audit: Arc<RwLock<AuditView>>,
    settings: EngineSettings,
}

impl<S: RecordStore> Engine<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, settings: EngineSettings) -> Self {
        Self {
            coordinator: TransitionCoordinator::new(
                store.clone(),
                clock.clone(),
                settings.retry,
                settings.audit_mode,
                settings.audit_view_limit,
            ),
            store,
            clock,
            commands: Arc::new(RwLock::new(CommandProjector::new())),
            telemetry: Arc::new(RwLock::new(TelemetryReconciler::new(settings.history_capacity))),
            audit: Arc::new(RwLock::new(AuditView::new(settings.audit_view_limit))),
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn coordinator(&self) -> &TransitionCoordinator<S> {
        &self.coordinator
    }

    pub async fn provision(&self) -> Result<usize, EngineError> {
        self.coordinator.provision_defaults().await
    }

    pub async fn set_relay_command(
        &self,
        unit: u8,
        mode: RelayMode,
        state: RelayState,
        operator: Option<String>,
    ) -> Result<CommandReceipt, EngineError> {
        let unit = parse_unit(unit)?;
        self.coordinator
            .apply_relay_command(unit, mode, state, AuditOrigin::Manual, operator)
            .await
    }

    pub async fn set_global_mode(&self, mode: RelayMode, operator: Option<String>) -> Result<CommandReceipt, EngineError> {
        self.coordinator
            .apply_global_mode(mode, AuditOrigin::Manual, operator)
            .await
    }

    pub async fn reset_billing(&self, operator: Option<String>) -> Result<CommandReceipt, EngineError> {
        self.coordinator.reset_billing(operator).await
    }

    /// View folded from the relay change stream.
    pub async fn relay_view(&self) -> CommandView {
        self.commands.read().await.view()
    }

    /// View folded from a direct read of the three committed records.
    pub async fn committed_view(&self) -> Result<CommandView, EngineError> {
        let mut projector = CommandProjector::new();
        for unit in UnitId::ALL {
            let key = RecordKey::new(RELAY_COLLECTION, unit.record_id());
            let record = self
                .store
                .get(&key)
                .await
                .map_err(|e| EngineError::from_store(e, &unit.to_string(), "read", 1))?;
            if let Some(record) = record {
                let update = UnitUpdate::from_record(&record).map_err(|e| EngineError::Corrupt(e.to_string()))?;
                projector.apply_all(update.as_ref());
            }
        }
        Ok(projector.view())
    }

    pub async fn latest_telemetry(&self) -> Option<LatestTelemetry> {
        let view = self.telemetry.read().await;
        let sample = view.latest()?.clone();
        Some(LatestTelemetry {
            live: telemetry::is_live(&sample, self.clock.now(), self.settings.staleness_threshold),
            load_source: sample.load_source(),
            sample,
        })
    }

    /// Oldest first.
    pub async fn telemetry_history(&self) -> Vec<TelemetrySample> {
        self.telemetry.read().await.history_oldest_first().cloned().collect()
    }

    /// Up to `limit` of the newest audit entries held by the view.
    pub async fn recent_audit(&self, limit: usize) -> Vec<AuditEntry> {
        self.audit.read().await.entries().iter().take(limit).cloned().collect()
    }

    pub async fn billing_summary(&self) -> Result<BillingSummary, EngineError> {
        let key = RecordKey::new(RELAY_COLLECTION, BILLING_RECORD_ID);
        let record = self
            .store
            .get(&key)
            .await
            .map_err(|e| EngineError::from_store(e, "billing", "read", 1))?;
        let account = billing::decode_account(record.as_ref()).map_err(|e| EngineError::Corrupt(e.to_string()))?;
        Ok(BillingSummary::from(&account))
    }

    /// Start one reconcile pipeline per collection. Each runs until its change
    /// stream ends or `shutdown` fires.
    pub fn spawn_reconcilers(&self, shutdown: CancellationToken) -> Vec<JoinHandle<Result<(), PipelineError>>> {
        vec![
            spawn_view(
                "relay_commands",
                StoreSource::new(self.store.clone(), RELAY_COLLECTION, SnapshotScope::All),
                self.commands.clone(),
                shutdown.clone(),
            ),
            spawn_view(
                "telemetry",
                StoreSource::new(
                    self.store.clone(),
                    SENSOR_COLLECTION,
                    SnapshotScope::Recent(self.settings.history_capacity),
                ),
                self.telemetry.clone(),
                shutdown.clone(),
            ),
            spawn_view(
                "audit",
                StoreSource::new(
                    self.store.clone(),
                    AUDIT_COLLECTION,
                    SnapshotScope::Recent(self.settings.audit_view_limit),
                ),
                self.audit.clone(),
                shutdown,
            ),
        ]
    }
}

fn spawn_view<S, R>(
    name: &'static str,
    source: StoreSource<S>,
    view: Arc<RwLock<R>>,
    shutdown: CancellationToken,
) -> JoinHandle<Result<(), PipelineError>>
where
    S: RecordStore,
    R: Reconcile,
{
    let pipeline = Pipeline {
        name,
        source,
        sink: ViewSink::new(name, view),
    };
    tokio::spawn(pipeline.run(shutdown))
}
