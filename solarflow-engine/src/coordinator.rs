//! Applies operator transitions as compare-and-swap batches against the store.
//!
//! Every attempt reads the records it depends on, decides, and commits one
//! batch that pins the versions it read. A batch that loses a race fails as a
//! whole and the attempt is repeated from the read, up to the retry budget.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use solarflow_client::{
    db::{codec, BatchWrite, Expect, Record, RecordKey, WriteResult},
    domain::{
        AuditOrigin, AuditState, AuditTarget, BillingAccount, RelayCommand, RelayMode, RelayPatch, RelayState,
        UnitId, BILLING_RECORD_ID, RELAY_COLLECTION,
    },
    RecordStore, StoreError,
};
use time::OffsetDateTime;

use crate::billing;
use crate::clock::{next_stamp, Clock};
use crate::error::{describe_command, EngineError};
use crate::interlock;
use crate::ledger::{self, AuditLedger, PendingEntry};
use crate::projector::decode_command;

const RELAY_REASON: &str = "Operator Override";
const GLOBAL_REASON: &str = "Universal Switch";
const BILLING_REASON: &str = "Billing Reset";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first.
    pub max_retries: u32,
    /// Linear backoff step: the n-th retry sleeps `backoff * n`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

/// Where the audit entry for a transition is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditMode {
    /// In the same atomic batch as the state write.
    #[default]
    Batched,
    /// Appended once the state write has committed. A failed append does not
    /// undo the transition; it is reported on the receipt.
    AfterCommit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditStatus {
    Recorded { entry_id: String },
    /// Auto-mode relay commands are not audited.
    NotRequired,
    Failed { entry_id: String, reason: String },
}

/// Confirmation of a committed transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandReceipt {
    pub target: AuditTarget,
    #[serde(with = "time::serde::rfc3339")]
    pub committed_at: OffsetDateTime,
    pub audit: AuditStatus,
}

/// Why a single attempt did not commit.
enum Attempt {
    Store(StoreError),
    /// Final; never retried.
    Rejected(EngineError),
}

impl From<StoreError> for Attempt {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

fn relay_key(unit: UnitId) -> RecordKey {
    RecordKey::new(RELAY_COLLECTION, unit.record_id())
}

fn billing_key() -> RecordKey {
    RecordKey::new(RELAY_COLLECTION, BILLING_RECORD_ID)
}

fn version_of(record: Option<&Record>) -> Option<u64> {
    record.map(|r| r.version)
}

fn stamps<'a>(records: impl IntoIterator<Item = &'a Option<Record>>) -> Vec<OffsetDateTime> {
    records.into_iter().flatten().map(|r| r.updated_at).collect()
}

fn command_of(record: Option<&Record>) -> Result<Option<RelayCommand>, StoreError> {
    record.map(decode_command).transpose()
}

/// The only writer of relay commands, billing resets, and audit entries.
pub struct TransitionCoordinator<S> {
    store: Arc<S>,
    ledger: AuditLedger<S>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    audit_mode: AuditMode,
    nonce: AtomicU64,
}

impl<S: RecordStore> TransitionCoordinator<S> {
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        audit_mode: AuditMode,
        audit_view_limit: usize,
    ) -> Self {
        Self {
            ledger: AuditLedger::new(store.clone(), audit_view_limit),
            store,
            clock,
            retry,
            audit_mode,
            // Distinct per process so two engines sharing a store never derive
            // the same entry id for different transitions.
            nonce: AtomicU64::new(u64::from(std::process::id()) << 32),
        }
    }

    pub fn ledger(&self) -> &AuditLedger<S> {
        &self.ledger
    }

    pub fn audit_mode(&self) -> AuditMode {
        self.audit_mode
    }

    fn pending(
        &self,
        target: AuditTarget,
        state: AuditState,
        origin: AuditOrigin,
        reason: &str,
        operator: Option<String>,
    ) -> PendingEntry {
        let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);
        PendingEntry {
            id: ledger::entry_id(target, state, self.clock.now(), nonce),
            target,
            resulting_state: state,
            origin,
            reason: reason.to_string(),
            operator,
        }
    }

    fn batched_entry(&self, pending: Option<&PendingEntry>, stamp: OffsetDateTime) -> Result<Option<BatchWrite>, StoreError> {
        match (self.audit_mode, pending) {
            (AuditMode::Batched, Some(p)) => AuditLedger::<S>::entry_write(&p.committed_at(stamp)).map(Some),
            _ => Ok(None),
        }
    }

    /// Set one unit's mode and desired state.
    ///
    /// Manual/on requests for the battery-load and grid-load units are checked
    /// against the sibling's committed record, and that record's version is
    /// asserted in the commit batch.
    pub async fn apply_relay_command(
        &self,
        unit: UnitId,
        mode: RelayMode,
        state: RelayState,
        origin: AuditOrigin,
        operator: Option<String>,
    ) -> Result<CommandReceipt, EngineError> {
        let started = Instant::now();
        let target = unit.to_string();
        let attempted = describe_command(mode, state);
        let pending = (mode == RelayMode::Manual)
            .then(|| self.pending(AuditTarget::Unit(unit), state.into(), origin, RELAY_REASON, operator.clone()));

        let result = self
            .retrying(&target, &attempted, |attempt| {
                self.try_relay_command(unit, mode, state, pending.as_ref(), attempt)
            })
            .await;

        let committed_at = match result {
            Ok(stamp) => stamp,
            Err(e) => {
                reject(&e);
                return Err(e);
            }
        };
        record_latency(started);
        metrics::counter!("relay_commands_committed_total").increment(1);
        tracing::info!(unit = %unit, %mode, %state, operator = operator.as_deref(), "relay command committed");

        let audit = self.settle_audit(pending, committed_at).await;
        Ok(CommandReceipt {
            target: AuditTarget::Unit(unit),
            committed_at,
            audit,
        })
    }

    async fn try_relay_command(
        &self,
        unit: UnitId,
        mode: RelayMode,
        state: RelayState,
        pending: Option<&PendingEntry>,
        attempt: u32,
    ) -> Result<OffsetDateTime, Attempt> {
        if let Some(stamp) = self.committed_earlier(pending, attempt).await? {
            return Ok(stamp);
        }
        let key = relay_key(unit);
        let current = self.store.get(&key).await?;

        let mut sibling = None;
        if interlock::applies(mode, state) {
            if let Some(sibling_unit) = unit.interlock_sibling() {
                let sibling_key = relay_key(sibling_unit);
                let record = self.store.get(&sibling_key).await?;
                let committed = command_of(record.as_ref())?;

                let decision = interlock::validate(unit, mode, state, committed.as_ref());
                if let interlock::InterlockDecision::Deny { sibling, reason } = decision {
                    tracing::warn!(unit = %unit, sibling = %sibling, reason, "relay command denied by interlock");
                }
                decision.into_result(unit, state).map_err(Attempt::Rejected)?;
                sibling = Some((sibling_key, record));
            }
        }

        let stamp = next_stamp(
            self.clock.now(),
            stamps([&current].into_iter().chain(sibling.as_ref().map(|(_, r)| r))),
        );
        let patch = RelayPatch {
            mode: Some(mode),
            desired_state: Some(state),
            updated_at: Some(stamp),
        };

        let mut writes = vec![BatchWrite::merge(
            key,
            codec::to_document(&patch)?,
            Expect::observed(version_of(current.as_ref())),
        )];
        if let Some((sibling_key, record)) = sibling {
            writes.push(BatchWrite::assert(sibling_key, Expect::observed(version_of(record.as_ref()))));
        }
        writes.extend(self.batched_entry(pending, stamp)?);

        self.store.put_batch(writes, stamp).await?;
        Ok(stamp)
    }

    /// Set `mode` on all three units in one batch. Desired states are kept.
    pub async fn apply_global_mode(
        &self,
        mode: RelayMode,
        origin: AuditOrigin,
        operator: Option<String>,
    ) -> Result<CommandReceipt, EngineError> {
        let started = Instant::now();
        let target = AuditTarget::AllUnits.to_string();
        let attempted = mode.to_string();
        let pending = self.pending(AuditTarget::AllUnits, mode.into(), origin, GLOBAL_REASON, operator.clone());

        let result = self
            .retrying(&target, &attempted, |attempt| self.try_global_mode(mode, &pending, attempt))
            .await;

        let committed_at = match result {
            Ok(stamp) => stamp,
            Err(e) => {
                reject(&e);
                return Err(e);
            }
        };
        record_latency(started);
        metrics::counter!("relay_commands_committed_total").increment(1);
        tracing::info!(%mode, operator = operator.as_deref(), "global mode committed");

        let audit = self.settle_audit(Some(pending), committed_at).await;
        Ok(CommandReceipt {
            target: AuditTarget::AllUnits,
            committed_at,
            audit,
        })
    }

    async fn try_global_mode(
        &self,
        mode: RelayMode,
        pending: &PendingEntry,
        attempt: u32,
    ) -> Result<OffsetDateTime, Attempt> {
        if let Some(stamp) = self.committed_earlier(Some(pending), attempt).await? {
            return Ok(stamp);
        }
        let mut records = Vec::with_capacity(UnitId::ALL.len());
        for unit in UnitId::ALL {
            records.push(self.store.get(&relay_key(unit)).await?);
        }

        let battery = command_of(records[UnitId::BatteryLoad.index()].as_ref())?.unwrap_or_default();
        let grid = command_of(records[UnitId::GridLoad.index()].as_ref())?.unwrap_or_default();
        let decision = interlock::validate_global(mode, &battery, &grid);
        if let interlock::InterlockDecision::Deny { sibling, reason } = decision {
            tracing::warn!(%mode, sibling = %sibling, reason, "global mode denied by interlock");
        }
        decision.into_global_result(mode).map_err(Attempt::Rejected)?;

        let stamp = next_stamp(self.clock.now(), stamps(&records));
        let patch = codec::to_document(&RelayPatch {
            mode: Some(mode),
            desired_state: None,
            updated_at: Some(stamp),
        })?;

        let mut writes: Vec<BatchWrite> = UnitId::ALL
            .into_iter()
            .zip(&records)
            .map(|(unit, record)| {
                BatchWrite::merge(relay_key(unit), patch.clone(), Expect::observed(version_of(record.as_ref())))
            })
            .collect();
        writes.extend(self.batched_entry(Some(pending), stamp)?);

        self.store.put_batch(writes, stamp).await?;
        Ok(stamp)
    }

    /// Zero both billing counters, keeping the rates. Safe to repeat.
    pub async fn reset_billing(&self, operator: Option<String>) -> Result<CommandReceipt, EngineError> {
        let started = Instant::now();
        let target = AuditTarget::Billing.to_string();
        let pending = self.pending(
            AuditTarget::Billing,
            AuditState::Reset,
            AuditOrigin::Manual,
            BILLING_REASON,
            operator.clone(),
        );

        let result = self
            .retrying(&target, "reset", |attempt| self.try_reset_billing(&pending, attempt))
            .await;

        let committed_at = match result {
            Ok(stamp) => stamp,
            Err(e) => {
                reject(&e);
                return Err(e);
            }
        };
        record_latency(started);
        metrics::counter!("billing_resets_total").increment(1);
        tracing::info!(operator = operator.as_deref(), "billing counters reset");

        let audit = self.settle_audit(Some(pending), committed_at).await;
        Ok(CommandReceipt {
            target: AuditTarget::Billing,
            committed_at,
            audit,
        })
    }

    async fn try_reset_billing(&self, pending: &PendingEntry, attempt: u32) -> Result<OffsetDateTime, Attempt> {
        if let Some(stamp) = self.committed_earlier(Some(pending), attempt).await? {
            return Ok(stamp);
        }
        let key = billing_key();
        let current = self.store.get(&key).await?;
        // Surface a corrupt singleton before overwriting parts of it.
        billing::decode_account(current.as_ref())?;

        let stamp = next_stamp(self.clock.now(), stamps([&current]));
        let exists = current.is_some();
        // Counters are zeroed whatever the agent added meanwhile; only the
        // creation of a missing record needs a precondition.
        let expect = if exists { Expect::Any } else { Expect::Missing };

        let mut writes = vec![BatchWrite::merge(key, billing::reset_document(stamp, exists)?, expect)];
        writes.extend(self.batched_entry(Some(pending), stamp)?);

        self.store.put_batch(writes, stamp).await?;
        Ok(stamp)
    }

    /// Create any missing relay record as `{auto, off}` and a missing billing
    /// record with default rates. Existing records are left untouched.
    /// Returns how many records were created.
    pub async fn provision_defaults(&self) -> Result<usize, EngineError> {
        let results = self
            .retrying("provisioning", "create defaults", move |_| async move {
                let now = self.clock.now();
                let mut writes = Vec::with_capacity(UnitId::ALL.len() + 1);
                for unit in UnitId::ALL {
                    let command = RelayCommand {
                        updated_at: Some(now),
                        ..RelayCommand::default()
                    };
                    writes.push(BatchWrite::create_if_absent(relay_key(unit), codec::to_document(&command)?));
                }
                writes.push(BatchWrite::create_if_absent(
                    billing_key(),
                    codec::to_document(&BillingAccount::default())?,
                ));
                Ok::<_, Attempt>(self.store.put_batch(writes, now).await?)
            })
            .await?;

        let created = results
            .iter()
            .filter(|r| matches!(r, WriteResult::Written { .. }))
            .count();
        if created > 0 {
            tracing::info!(created, "provisioned default records");
        }
        Ok(created)
    }

    /// On a retry in batched mode, the entry of an earlier attempt whose
    /// acknowledgement was lost proves that attempt committed; its stamp is
    /// returned instead of deciding the transition again.
    async fn committed_earlier(
        &self,
        pending: Option<&PendingEntry>,
        attempt: u32,
    ) -> Result<Option<OffsetDateTime>, StoreError> {
        if attempt == 0 || self.audit_mode != AuditMode::Batched {
            return Ok(None);
        }
        let Some(pending) = pending else {
            return Ok(None);
        };
        let found = self.ledger.find(&pending.id).await?;
        if let Some(entry) = &found {
            tracing::info!(entry_id = %entry.id, subject = %entry.target, "earlier attempt had committed");
        }
        Ok(found.map(|entry| entry.timestamp))
    }

    async fn settle_audit(&self, pending: Option<PendingEntry>, committed_at: OffsetDateTime) -> AuditStatus {
        let Some(pending) = pending else {
            return AuditStatus::NotRequired;
        };
        if self.audit_mode == AuditMode::Batched {
            return AuditStatus::Recorded { entry_id: pending.id };
        }

        let entry = pending.committed_at(committed_at);
        let target = entry.target.to_string();
        let ledger = &self.ledger;
        let appended = &entry;
        let result = self
            .retrying(&target, "audit append", move |_| async move {
                Ok::<_, Attempt>(ledger.append(appended).await?)
            })
            .await;

        match result {
            Ok(_) => AuditStatus::Recorded { entry_id: entry.id },
            Err(e) => {
                tracing::error!(error = %e, entry_id = %entry.id, subject = %target, "audit append failed after commit");
                metrics::counter!("audit_append_failed_total").increment(1);
                AuditStatus::Failed {
                    entry_id: entry.id,
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn retrying<T, F, Fut>(&self, target: &str, attempted: &str, mut op: F) -> Result<T, EngineError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, Attempt>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(Attempt::Rejected(e)) => return Err(e),
                Err(Attempt::Store(e)) if e.is_retryable() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let sleep_for = self.retry.backoff * attempt;
                    tracing::warn!(
                        error = %e,
                        attempt,
                        subject = target,
                        attempted,
                        "store write failed, retrying with backoff"
                    );
                    metrics::counter!("store_retry_total").increment(1);
                    tokio::time::sleep(sleep_for).await;
                }
                Err(Attempt::Store(e)) => {
                    tracing::error!(error = %e, attempts = attempt + 1, subject = target, attempted, "store write failed, giving up");
                    return Err(EngineError::from_store(e, target, attempted, attempt + 1));
                }
            }
        }
    }
}

fn reject(e: &EngineError) {
    metrics::counter!("relay_commands_rejected_total", "reason" => e.kind()).increment(1);
}

fn record_latency(started: Instant) {
    metrics::histogram!("command_commit_latency_seconds").record(started.elapsed().as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use solarflow_client::db::MemoryStore;
    use time::macros::datetime;

    fn coordinator(store: Arc<MemoryStore>, mode: AuditMode) -> TransitionCoordinator<MemoryStore> {
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 10:00:00 UTC)));
        let retry = RetryPolicy {
            max_retries: 2,
            backoff: Duration::from_millis(1),
        };
        TransitionCoordinator::new(store, clock, retry, mode, 50)
    }

    async fn command(store: &MemoryStore, unit: UnitId) -> RelayCommand {
        let record = store.get(&relay_key(unit)).await.unwrap();
        command_of(record.as_ref()).unwrap().unwrap_or_default()
    }

    #[tokio::test]
    async fn provisioning_creates_missing_records_once() {
        let store = Arc::new(MemoryStore::new());
        let c = coordinator(store.clone(), AuditMode::Batched);

        assert_eq!(c.provision_defaults().await, Ok(4));
        c.apply_relay_command(UnitId::GridLoad, RelayMode::Manual, RelayState::On, AuditOrigin::Manual, None)
            .await
            .unwrap();
        assert_eq!(c.provision_defaults().await, Ok(0));
        assert!(command(&store, UnitId::GridLoad).await.is_manual_on());
    }

    #[tokio::test]
    async fn auto_command_is_not_audited() {
        let store = Arc::new(MemoryStore::new());
        let c = coordinator(store.clone(), AuditMode::Batched);

        let receipt = c
            .apply_relay_command(UnitId::SolarDiversion, RelayMode::Auto, RelayState::On, AuditOrigin::Manual, None)
            .await
            .unwrap();

        assert_eq!(receipt.audit, AuditStatus::NotRequired);
        assert!(c.ledger().recent(10).await.unwrap().is_empty());
        assert_eq!(command(&store, UnitId::SolarDiversion).await.desired_state, RelayState::On);
    }

    #[tokio::test]
    async fn denied_command_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let c = coordinator(store.clone(), AuditMode::Batched);
        c.apply_relay_command(UnitId::GridLoad, RelayMode::Manual, RelayState::On, AuditOrigin::Manual, None)
            .await
            .unwrap();

        let err = c
            .apply_relay_command(UnitId::BatteryLoad, RelayMode::Manual, RelayState::On, AuditOrigin::Manual, None)
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
        assert_eq!(store.get(&relay_key(UnitId::BatteryLoad)).await.unwrap(), None);
        assert_eq!(c.ledger().recent(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn global_mode_keeps_desired_states() {
        let store = Arc::new(MemoryStore::new());
        let c = coordinator(store.clone(), AuditMode::Batched);
        c.provision_defaults().await.unwrap();
        c.apply_relay_command(UnitId::SolarDiversion, RelayMode::Manual, RelayState::On, AuditOrigin::Manual, None)
            .await
            .unwrap();

        let receipt = c
            .apply_global_mode(RelayMode::Auto, AuditOrigin::Manual, Some("op-7".into()))
            .await
            .unwrap();

        for unit in UnitId::ALL {
            assert_eq!(command(&store, unit).await.mode, RelayMode::Auto);
        }
        assert_eq!(command(&store, UnitId::SolarDiversion).await.desired_state, RelayState::On);

        let entries = c.ledger().recent(10).await.unwrap();
        assert_eq!(entries[0].target, AuditTarget::AllUnits);
        assert_eq!(entries[0].resulting_state, AuditState::Auto);
        assert_eq!(entries[0].operator.as_deref(), Some("op-7"));
        assert_eq!(receipt.audit, AuditStatus::Recorded { entry_id: entries[0].id.clone() });
    }

    #[tokio::test]
    async fn global_manual_refused_while_both_loads_on() {
        let store = Arc::new(MemoryStore::new());
        let c = coordinator(store.clone(), AuditMode::Batched);
        // Both loads on under auto control is legal.
        c.apply_relay_command(UnitId::BatteryLoad, RelayMode::Auto, RelayState::On, AuditOrigin::Automatic, None)
            .await
            .unwrap();
        c.apply_relay_command(UnitId::GridLoad, RelayMode::Auto, RelayState::On, AuditOrigin::Automatic, None)
            .await
            .unwrap();

        let err = c
            .apply_global_mode(RelayMode::Manual, AuditOrigin::Manual, None)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            EngineError::GlobalInterlockViolation {
                requested: RelayMode::Manual
            }
        );
        for unit in [UnitId::BatteryLoad, UnitId::GridLoad] {
            assert_eq!(command(&store, unit).await.mode, RelayMode::Auto);
        }
    }

    #[tokio::test]
    async fn reset_billing_is_audited_and_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let c = coordinator(store.clone(), AuditMode::AfterCommit);
        store
            .put_merge(
                &billing_key(),
                serde_json::json!({ "total_power_sold_wh": 900.0, "selling_rate_per_kwh": 0.07 })
                    .as_object()
                    .cloned()
                    .unwrap(),
                datetime!(2024-05-01 09:00:00 UTC),
            )
            .await
            .unwrap();

        c.reset_billing(None).await.unwrap();
        c.reset_billing(None).await.unwrap();

        let record = store.get(&billing_key()).await.unwrap();
        let account = billing::decode_account(record.as_ref()).unwrap();
        assert_eq!(account.energy_sold_wh, 0.0);
        assert_eq!(account.sell_rate_per_kwh, 0.07);

        let entries = c.ledger().recent(10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.resulting_state == AuditState::Reset));
    }

    #[tokio::test]
    async fn successive_commands_get_increasing_stamps_under_a_frozen_clock() {
        let store = Arc::new(MemoryStore::new());
        let c = coordinator(store.clone(), AuditMode::Batched);

        let first = c
            .apply_relay_command(UnitId::GridLoad, RelayMode::Manual, RelayState::On, AuditOrigin::Manual, None)
            .await
            .unwrap();
        let second = c
            .apply_relay_command(UnitId::GridLoad, RelayMode::Manual, RelayState::Off, AuditOrigin::Manual, None)
            .await
            .unwrap();

        assert!(second.committed_at > first.committed_at);
        assert_ne!(first.audit, second.audit);
    }
}
