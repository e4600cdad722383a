use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, Mutex,
};
use std::time::Duration as StdDuration;

use solarflow_client::db::{
    BatchWrite, Document, MemoryStore, Record, RecordKey, RecordStream, SnapshotScope, WriteResult,
};
use solarflow_client::domain::{
    AuditState, AuditTarget, RelayMode, RelayState, UnitId, AUDIT_COLLECTION, BILLING_RECORD_ID, RELAY_COLLECTION,
};
use solarflow_client::{RecordStore, StoreError};
use solarflow_engine::{
    clock::ManualClock, AuditMode, AuditStatus, Engine, EngineError, EngineSettings, RetryPolicy,
};
use time::{macros::datetime, OffsetDateTime};

/// Memory store with injectable write faults.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    /// Next N batches fail without applying anything.
    fail_before: AtomicU32,
    /// Next N batches commit but report the store as unavailable.
    lose_ack: AtomicU32,
    /// Reject any batch that touches the audit ledger.
    reject_audit: AtomicBool,
    /// Merged straight into the store right after a lost acknowledgement, as
    /// if another writer got in before the retry.
    after_lost_ack: Mutex<Option<(RecordKey, Document)>>,
    batches: AtomicU32,
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait::async_trait]
impl RecordStore for FlakyStore {
    async fn get(&self, key: &RecordKey) -> Result<Option<Record>, StoreError> {
        self.inner.get(key).await
    }

    async fn put_merge(&self, key: &RecordKey, fields: Document, timestamp: OffsetDateTime) -> Result<u64, StoreError> {
        self.inner.put_merge(key, fields, timestamp).await
    }

    async fn put_batch(&self, writes: Vec<BatchWrite>, timestamp: OffsetDateTime) -> Result<Vec<WriteResult>, StoreError> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        if self.reject_audit.load(Ordering::SeqCst) && writes.iter().any(|w| w.key.collection == AUDIT_COLLECTION) {
            return Err(StoreError::Unavailable("audit collection offline".into()));
        }
        if take_one(&self.fail_before) {
            return Err(StoreError::Unavailable("connection reset".into()));
        }
        let result = self.inner.put_batch(writes, timestamp).await;
        if take_one(&self.lose_ack) {
            let interloper = self.after_lost_ack.lock().unwrap().take();
            if let Some((key, fields)) = interloper {
                self.inner.put_merge(&key, fields, timestamp).await?;
            }
            return Err(StoreError::Unavailable("timed out awaiting commit".into()));
        }
        result
    }

    async fn query_recent(&self, collection: &str, limit: usize) -> Result<Vec<Record>, StoreError> {
        self.inner.query_recent(collection, limit).await
    }

    async fn subscribe(&self, collection: &str, scope: SnapshotScope) -> Result<RecordStream, StoreError> {
        self.inner.subscribe(collection, scope).await
    }
}

fn settings(audit_mode: AuditMode) -> EngineSettings {
    EngineSettings {
        retry: RetryPolicy {
            max_retries: 3,
            backoff: StdDuration::from_millis(1),
        },
        audit_mode,
        ..EngineSettings::default()
    }
}

fn engine_with<S: RecordStore>(store: Arc<S>, audit_mode: AuditMode) -> Arc<Engine<S>> {
    let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 10:00:00 UTC)));
    Arc::new(Engine::new(store, clock, settings(audit_mode)))
}

async fn audit_count<S: RecordStore>(store: &S) -> usize {
    store.query_recent(AUDIT_COLLECTION, 1000).await.unwrap().len()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_manual_on_for_both_loads_commits_at_most_one() {
    for _ in 0..25 {
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store.clone(), AuditMode::Batched);
        engine.provision().await.unwrap();

        let a = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.set_relay_command(2, RelayMode::Manual, RelayState::On, None).await })
        };
        let b = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.set_relay_command(3, RelayMode::Manual, RelayState::On, None).await })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];

        let committed = results.iter().filter(|r| r.is_ok()).count();
        assert!(committed <= 1, "both loads committed on: {results:?}");
        for r in &results {
            if let Err(e) = r {
                assert!(
                    matches!(
                        e,
                        EngineError::InterlockViolation { .. } | EngineError::ConcurrentModification { .. }
                    ),
                    "unexpected error {e:?}"
                );
            }
        }

        let view = engine.committed_view().await.unwrap();
        assert!(!view.interlock_violated());
        assert_eq!(audit_count(store.as_ref()).await, committed);
    }
}

#[tokio::test]
async fn sibling_handover_scenario() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_with(store.clone(), AuditMode::Batched);
    engine.set_relay_command(2, RelayMode::Auto, RelayState::Off, None).await.unwrap();
    engine.set_relay_command(3, RelayMode::Manual, RelayState::On, None).await.unwrap();
    let before = audit_count(store.as_ref()).await;

    let err = engine
        .set_relay_command(2, RelayMode::Manual, RelayState::On, None)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        EngineError::InterlockViolation {
            unit: UnitId::BatteryLoad,
            requested: RelayState::On,
            sibling: UnitId::GridLoad,
        }
    );
    assert_eq!(audit_count(store.as_ref()).await, before);

    engine.set_relay_command(3, RelayMode::Manual, RelayState::Off, None).await.unwrap();
    assert_eq!(audit_count(store.as_ref()).await, before + 1);
    engine.set_relay_command(2, RelayMode::Manual, RelayState::On, None).await.unwrap();
    assert_eq!(audit_count(store.as_ref()).await, before + 2);

    let view = engine.committed_view().await.unwrap();
    assert!(view.get(UnitId::BatteryLoad).is_manual_on());
    assert_eq!(view.get(UnitId::GridLoad).desired_state, RelayState::Off);

    let entries = engine.coordinator().ledger().recent(2).await.unwrap();
    assert_eq!(entries[0].target, AuditTarget::Unit(UnitId::BatteryLoad));
    assert_eq!(entries[0].resulting_state, AuditState::On);
    assert_eq!(entries[1].target, AuditTarget::Unit(UnitId::GridLoad));
    assert_eq!(entries[1].resulting_state, AuditState::Off);
}

#[tokio::test]
async fn global_manual_applies_to_all_units() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_with(store.clone(), AuditMode::Batched);
    engine.provision().await.unwrap();

    engine.set_global_mode(RelayMode::Manual, None).await.unwrap();

    let view = engine.committed_view().await.unwrap();
    for unit in UnitId::ALL {
        assert_eq!(view.get(unit).mode, RelayMode::Manual);
    }
    let entries = engine.coordinator().ledger().recent(10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].target, AuditTarget::AllUnits);
}

#[tokio::test]
async fn global_mode_that_never_commits_changes_nothing() {
    let store = Arc::new(FlakyStore::default());
    let engine = engine_with(store.clone(), AuditMode::Batched);
    engine.provision().await.unwrap();
    let before = engine.committed_view().await.unwrap();

    store.fail_before.store(10, Ordering::SeqCst);
    let err = engine.set_global_mode(RelayMode::Manual, None).await.unwrap_err();

    assert!(matches!(err, EngineError::StoreUnavailable { attempts: 4, .. }), "{err:?}");
    assert_eq!(engine.committed_view().await.unwrap(), before);
    assert_eq!(audit_count(store.as_ref()).await, 0);
}

#[tokio::test]
async fn retry_after_lost_acknowledgement_does_not_duplicate_audit() {
    let store = Arc::new(FlakyStore::default());
    let engine = engine_with(store.clone(), AuditMode::Batched);
    store.lose_ack.store(1, Ordering::SeqCst);

    let receipt = engine
        .set_relay_command(1, RelayMode::Manual, RelayState::On, Some("op-9".into()))
        .await
        .unwrap();

    // The retry finds its own entry and does not write again.
    assert_eq!(store.batches.load(Ordering::SeqCst), 1);
    let entries = engine.coordinator().ledger().recent(10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(receipt.audit, AuditStatus::Recorded { entry_id: entries[0].id.clone() });
}

#[tokio::test]
async fn retry_recognises_its_own_commit_after_sibling_switched_on() {
    let store = Arc::new(FlakyStore::default());
    let engine = engine_with(store.clone(), AuditMode::Batched);
    store.lose_ack.store(1, Ordering::SeqCst);
    let grid_on = serde_json::json!({ "mode": "manual", "state": true });
    *store.after_lost_ack.lock().unwrap() = Some((
        RecordKey::new(RELAY_COLLECTION, UnitId::GridLoad.record_id()),
        grid_on.as_object().cloned().unwrap(),
    ));

    let receipt = engine
        .set_relay_command(2, RelayMode::Manual, RelayState::On, None)
        .await
        .unwrap();

    assert_eq!(store.batches.load(Ordering::SeqCst), 1);
    let entries = engine.coordinator().ledger().recent(10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(receipt.audit, AuditStatus::Recorded { entry_id: entries[0].id.clone() });
    assert_eq!(receipt.committed_at, entries[0].timestamp);
    assert!(engine.committed_view().await.unwrap().get(UnitId::BatteryLoad).is_manual_on());
}

#[tokio::test]
async fn interlock_denial_is_not_retried() {
    let store = Arc::new(FlakyStore::default());
    let engine = engine_with(store.clone(), AuditMode::Batched);
    engine.set_relay_command(2, RelayMode::Manual, RelayState::On, None).await.unwrap();
    let batches = store.batches.load(Ordering::SeqCst);

    let err = engine
        .set_relay_command(3, RelayMode::Manual, RelayState::On, None)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "interlock_violation");
    assert_eq!(store.batches.load(Ordering::SeqCst), batches);
}

#[tokio::test]
async fn failed_append_after_commit_keeps_the_transition_and_reports_it() {
    let store = Arc::new(FlakyStore::default());
    let engine = engine_with(store.clone(), AuditMode::AfterCommit);
    store.reject_audit.store(true, Ordering::SeqCst);

    let receipt = engine
        .set_relay_command(3, RelayMode::Manual, RelayState::On, None)
        .await
        .unwrap();

    assert!(matches!(receipt.audit, AuditStatus::Failed { .. }), "{:?}", receipt.audit);
    assert!(engine.committed_view().await.unwrap().get(UnitId::GridLoad).is_manual_on());
    assert_eq!(audit_count(store.as_ref()).await, 0);
}

#[tokio::test]
async fn after_commit_mode_appends_once_state_is_written() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_with(store.clone(), AuditMode::AfterCommit);

    let receipt = engine.reset_billing(Some("op-1".into())).await.unwrap();

    let entries = engine.coordinator().ledger().recent(10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].target, AuditTarget::Billing);
    assert_eq!(entries[0].timestamp, receipt.committed_at);

    let billing = store
        .get(&RecordKey::new(RELAY_COLLECTION, BILLING_RECORD_ID))
        .await
        .unwrap()
        .unwrap();
    assert!(billing.updated_at <= entries[0].timestamp);
}
