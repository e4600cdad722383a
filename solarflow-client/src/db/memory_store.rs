use std::collections::BTreeMap;

use futures::StreamExt;
use time::OffsetDateTime;
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

use super::codec::merge_into;
use super::record_store::{
    BatchWrite, Document, Record, RecordKey, RecordStore, RecordStream, SnapshotScope, StoreError, WriteOp,
    WriteResult,
};

const DEFAULT_CHANGE_CAPACITY: usize = 1024;

/// In-process record store with the same commit semantics as [`super::PgStore`].
///
/// Used for development runs (`store.kind = "memory"`) and by the engine's tests.
pub struct MemoryStore {
    records: Mutex<BTreeMap<RecordKey, Record>>,
    changes: broadcast::Sender<Record>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_change_capacity(DEFAULT_CHANGE_CAPACITY)
    }

    /// `capacity` bounds how far a subscriber may fall behind before it
    /// observes a lag error.
    pub fn with_change_capacity(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            records: Mutex::new(BTreeMap::new()),
            changes,
        }
    }

    fn publish(&self, record: Record) {
        // No subscribers is fine.
        let _ = self.changes.send(record);
    }
}

fn newest_first(records: &mut [Record]) {
    records.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| b.key.id.cmp(&a.key.id))
    });
}

fn write_merge(
    records: &mut BTreeMap<RecordKey, Record>,
    key: &RecordKey,
    fields: Document,
    timestamp: OffsetDateTime,
) -> Record {
    let record = records.entry(key.clone()).or_insert_with(|| Record {
        key: key.clone(),
        version: 0,
        fields: Document::new(),
        updated_at: timestamp,
    });
    merge_into(&mut record.fields, fields);
    record.version += 1;
    record.updated_at = timestamp;
    record.clone()
}

#[async_trait::async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, key: &RecordKey) -> Result<Option<Record>, StoreError> {
        let records = self.records.lock().await;
        Ok(records.get(key).cloned())
    }

    async fn put_merge(
        &self,
        key: &RecordKey,
        fields: Document,
        timestamp: OffsetDateTime,
    ) -> Result<u64, StoreError> {
        let mut records = self.records.lock().await;
        if let Some(existing) = records.get(key) {
            if existing.updated_at > timestamp {
                return Err(StoreError::Stale { key: key.to_string() });
            }
        }

        let committed = write_merge(&mut records, key, fields, timestamp);
        let version = committed.version;
        drop(records);

        self.publish(committed);
        Ok(version)
    }

    async fn put_batch(
        &self,
        writes: Vec<BatchWrite>,
        timestamp: OffsetDateTime,
    ) -> Result<Vec<WriteResult>, StoreError> {
        let mut records = self.records.lock().await;

        // Every precondition is checked against the pre-batch state before
        // anything is written.
        for write in &writes {
            let expect = match &write.op {
                WriteOp::Merge { expect, .. } | WriteOp::Assert { expect } => *expect,
                WriteOp::CreateIfAbsent { .. } => continue,
            };
            let current = records.get(&write.key).map(|r| r.version);
            if !expect.holds(current) {
                return Err(StoreError::Conflict {
                    key: write.key.to_string(),
                });
            }
        }

        let mut results = Vec::with_capacity(writes.len());
        let mut committed = Vec::new();
        for write in writes {
            match write.op {
                WriteOp::Merge { fields, .. } => {
                    let record = write_merge(&mut records, &write.key, fields, timestamp);
                    results.push(WriteResult::Written {
                        version: record.version,
                    });
                    committed.push(record);
                }
                WriteOp::CreateIfAbsent { fields } => {
                    if records.contains_key(&write.key) {
                        results.push(WriteResult::AlreadyPresent);
                    } else {
                        let record = write_merge(&mut records, &write.key, fields, timestamp);
                        results.push(WriteResult::Written {
                            version: record.version,
                        });
                        committed.push(record);
                    }
                }
                WriteOp::Assert { .. } => results.push(WriteResult::Asserted),
            }
        }
        drop(records);

        for record in committed {
            self.publish(record);
        }
        Ok(results)
    }

    async fn query_recent(&self, collection: &str, limit: usize) -> Result<Vec<Record>, StoreError> {
        let records = self.records.lock().await;
        let mut matching: Vec<Record> = records
            .values()
            .filter(|r| r.key.collection == collection)
            .cloned()
            .collect();
        drop(records);

        newest_first(&mut matching);
        matching.truncate(limit);
        Ok(matching)
    }

    async fn subscribe(&self, collection: &str, scope: SnapshotScope) -> Result<RecordStream, StoreError> {
        // Snapshot and receiver are taken under the same lock so no commit
        // falls between them.
        let records = self.records.lock().await;
        let mut snapshot: Vec<Record> = records
            .values()
            .filter(|r| r.key.collection == collection)
            .cloned()
            .collect();
        let rx = self.changes.subscribe();
        drop(records);

        if let SnapshotScope::Recent(n) = scope {
            newest_first(&mut snapshot);
            snapshot.truncate(n);
            snapshot.reverse();
        }

        let collection = collection.to_string();
        let stream = async_stream::stream! {
            for record in snapshot {
                yield Ok(record);
            }

            let mut changes = BroadcastStream::new(rx);
            while let Some(item) = changes.next().await {
                match item {
                    Ok(record) if record.key.collection == collection => yield Ok(record),
                    Ok(_) => {}
                    Err(BroadcastStreamRecvError::Lagged(missed)) => {
                        yield Err(StoreError::Unavailable(format!(
                            "change stream for {collection} lagged, {missed} changes dropped"
                        )));
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}
