//! Append-only audit ledger.
//!
//! Storage keeps every entry; reads are capped to the most recent K. Writes
//! are crate-private so that only the transition coordinator can append.

use std::sync::Arc;

use solarflow_client::{
    db::{codec, BatchWrite, Record, RecordKey, WriteResult},
    domain::{AuditEntry, AuditOrigin, AuditState, AuditTarget, AUDIT_COLLECTION},
    RecordStore, StoreError,
};
use time::OffsetDateTime;

use crate::error::EngineError;
use crate::pipeline::{PipelineError, Reconcile};

pub const DEFAULT_VIEW_LIMIT: usize = 50;

fn hash_str(hasher: &mut blake3::Hasher, s: &str) {
    let len = s.len() as u32;
    hasher.update(&len.to_le_bytes());
    hasher.update(s.as_bytes());
}

/// Deterministic id of the ledger entry for one logical transition.
///
/// Derived from what was requested and when, plus a per-process nonce, so a
/// retried write of the same transition lands on the same record id and the
/// store suppresses the duplicate.
pub fn entry_id(target: AuditTarget, state: AuditState, requested_at: OffsetDateTime, nonce: u64) -> String {
    let mut h = blake3::Hasher::new();
    hash_str(&mut h, &target.to_string());
    hash_str(&mut h, &state.to_string());
    h.update(&requested_at.unix_timestamp_nanos().to_le_bytes());
    h.update(&nonce.to_le_bytes());
    h.finalize().to_hex().to_string()
}

/// Everything about a transition except the commit timestamp, which is only
/// known once the write it belongs to is stamped.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub id: String,
    pub target: AuditTarget,
    pub resulting_state: AuditState,
    pub origin: AuditOrigin,
    pub reason: String,
    pub operator: Option<String>,
}

impl PendingEntry {
    pub fn committed_at(&self, timestamp: OffsetDateTime) -> AuditEntry {
        AuditEntry {
            id: self.id.clone(),
            timestamp,
            target: self.target,
            resulting_state: self.resulting_state,
            origin: self.origin,
            reason: self.reason.clone(),
            operator: self.operator.clone(),
        }
    }
}

pub fn decode_entry(record: &Record) -> Result<AuditEntry, StoreError> {
    let mut entry: AuditEntry = codec::decode_record(record)?;
    entry.id = record.key.id.clone();
    Ok(entry)
}

pub struct AuditLedger<S> {
    store: Arc<S>,
    view_limit: usize,
}

impl<S: RecordStore> AuditLedger<S> {
    pub fn new(store: Arc<S>, view_limit: usize) -> Self {
        Self {
            store,
            view_limit: view_limit.max(1),
        }
    }

    pub fn view_limit(&self) -> usize {
        self.view_limit
    }

    /// Batch write that appends `entry` unless an entry with its id exists.
    pub(crate) fn entry_write(entry: &AuditEntry) -> Result<BatchWrite, StoreError> {
        Ok(BatchWrite::create_if_absent(
            RecordKey::new(AUDIT_COLLECTION, entry.id.clone()),
            codec::to_document(entry)?,
        ))
    }

    /// Append on its own, after the state write it describes has committed.
    /// Returns `false` when the entry was already present.
    pub(crate) async fn append(&self, entry: &AuditEntry) -> Result<bool, StoreError> {
        let results = self
            .store
            .put_batch(vec![Self::entry_write(entry)?], entry.timestamp)
            .await?;
        Ok(matches!(results.first(), Some(WriteResult::Written { .. })))
    }

    pub(crate) async fn find(&self, id: &str) -> Result<Option<AuditEntry>, StoreError> {
        let record = self.store.get(&RecordKey::new(AUDIT_COLLECTION, id)).await?;
        record.as_ref().map(decode_entry).transpose()
    }

    /// The most recent `limit` entries, newest first, capped at the view limit.
    pub async fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>, EngineError> {
        let limit = limit.clamp(1, self.view_limit);
        let records = self
            .store
            .query_recent(AUDIT_COLLECTION, limit)
            .await
            .map_err(|e| EngineError::from_store(e, "audit ledger", "read", 1))?;

        let mut entries = records
            .iter()
            .map(decode_entry)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| EngineError::Corrupt(e.to_string()))?;
        sort_newest_first(&mut entries);
        Ok(entries)
    }
}

fn sort_newest_first(entries: &mut [AuditEntry]) {
    entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
}

/// Capped, newest-first in-memory view of the ledger fed by its change stream.
#[derive(Debug, Clone)]
pub struct AuditView {
    entries: Vec<AuditEntry>,
    limit: usize,
}

impl Default for AuditView {
    fn default() -> Self {
        Self::new(DEFAULT_VIEW_LIMIT)
    }
}

impl AuditView {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: Vec::new(),
            limit: limit.max(1),
        }
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    pub fn insert(&mut self, entry: AuditEntry) -> bool {
        if self.entries.iter().any(|e| e.id == entry.id) {
            return false;
        }
        if self.entries.len() >= self.limit
            && self.entries.last().is_some_and(|oldest| entry.timestamp < oldest.timestamp)
        {
            return false;
        }
        self.entries.push(entry);
        sort_newest_first(&mut self.entries);
        self.entries.truncate(self.limit);
        true
    }
}

impl Reconcile for AuditView {
    fn reconcile(&mut self, record: &Record) -> Result<bool, PipelineError> {
        if record.key.collection != AUDIT_COLLECTION {
            return Ok(false);
        }
        let entry = decode_entry(record).map_err(|e| PipelineError::Decode(e.to_string()))?;
        Ok(self.insert(entry))
    }
}
