use anyhow::Result;
use serde_json::Value;
use sqlx::{
    postgres::{PgListener, PgPool, PgPoolOptions, PgRow},
    Postgres, Row, Transaction,
};
use time::OffsetDateTime;

use super::record_store::{
    BatchWrite, Document, Expect, Record, RecordKey, RecordStore, RecordStream, SnapshotScope, StoreError,
    WriteOp, WriteResult,
};

/// NOTIFY channel carrying `collection/id` for every committed write.
const CHANGE_CHANNEL: &str = "solarflow_record_changes";

/// Postgres-backed record store.
///
/// Expects the `records` table from `sql/schema/01_records.sql`. Batches run
/// in one transaction that first takes an advisory lock per touched key, in
/// sorted order, so version preconditions and writes commit together. The key
/// lock also covers `Expect::Missing`, where there is no row to lock.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(uri: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(uri)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn map_sqlx(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        // serialization_failure / deadlock_detected
        if matches!(db.code().as_deref(), Some("40001") | Some("40P01")) {
            return StoreError::Conflict {
                key: "transaction".to_string(),
            };
        }
    }
    StoreError::Unavailable(e.to_string())
}

fn row_to_record(row: &PgRow) -> Result<Record, StoreError> {
    let collection: String = row.try_get("collection").map_err(map_sqlx)?;
    let id: String = row.try_get("id").map_err(map_sqlx)?;
    let version: i64 = row.try_get("version").map_err(map_sqlx)?;
    let fields: Value = row.try_get("fields").map_err(map_sqlx)?;
    let updated_at: OffsetDateTime = row.try_get("updated_at").map_err(map_sqlx)?;

    let key = RecordKey::new(collection, id);
    let fields = match fields {
        Value::Object(map) => map,
        other => {
            return Err(StoreError::Codec(format!("{key}: expected a JSON object, got {other}")));
        }
    };

    Ok(Record {
        key,
        version: version as u64,
        fields,
        updated_at,
    })
}

async fn notify(tx: &mut Transaction<'_, Postgres>, key: &RecordKey) -> Result<(), StoreError> {
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(CHANGE_CHANNEL)
        .bind(key.to_string())
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx)?;
    Ok(())
}

/// Distinct keys of a batch in the order their locks are taken.
fn lock_order(writes: &[BatchWrite]) -> Vec<String> {
    let mut keys: Vec<String> = writes.iter().map(|w| w.key.to_string()).collect();
    keys.sort();
    keys.dedup();
    keys
}

/// Held until the transaction ends.
async fn lock_key(tx: &mut Transaction<'_, Postgres>, key: &str) -> Result<(), StoreError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(key)
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx)?;
    Ok(())
}

async fn locked_version(tx: &mut Transaction<'_, Postgres>, key: &RecordKey) -> Result<Option<u64>, StoreError> {
    let version: Option<i64> = sqlx::query_scalar(
        "SELECT version FROM records WHERE collection = $1 AND id = $2 FOR UPDATE",
    )
    .bind(&key.collection)
    .bind(&key.id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(map_sqlx)?;
    Ok(version.map(|v| v as u64))
}

async fn upsert_merge(
    tx: &mut Transaction<'_, Postgres>,
    key: &RecordKey,
    fields: Document,
    timestamp: OffsetDateTime,
) -> Result<Option<u64>, StoreError> {
    // `||` on jsonb is a shallow merge, matching the in-memory store.
    let version: Option<i64> = sqlx::query_scalar(
        r#"
        INSERT INTO records (collection, id, version, fields, updated_at)
        VALUES ($1, $2, 1, $3, $4)
        ON CONFLICT (collection, id) DO UPDATE
            SET fields     = records.fields || EXCLUDED.fields,
                version    = records.version + 1,
                updated_at = EXCLUDED.updated_at
            WHERE records.updated_at <= EXCLUDED.updated_at
        RETURNING version
        "#,
    )
    .bind(&key.collection)
    .bind(&key.id)
    .bind(Value::Object(fields))
    .bind(timestamp)
    .fetch_optional(&mut **tx)
    .await
    .map_err(map_sqlx)?;
    Ok(version.map(|v| v as u64))
}

async fn insert_if_absent(
    tx: &mut Transaction<'_, Postgres>,
    key: &RecordKey,
    fields: Document,
    timestamp: OffsetDateTime,
) -> Result<Option<u64>, StoreError> {
    let version: Option<i64> = sqlx::query_scalar(
        r#"
        INSERT INTO records (collection, id, version, fields, updated_at)
        VALUES ($1, $2, 1, $3, $4)
        ON CONFLICT (collection, id) DO NOTHING
        RETURNING version
        "#,
    )
    .bind(&key.collection)
    .bind(&key.id)
    .bind(Value::Object(fields))
    .bind(timestamp)
    .fetch_optional(&mut **tx)
    .await
    .map_err(map_sqlx)?;
    Ok(version.map(|v| v as u64))
}

#[async_trait::async_trait]
impl RecordStore for PgStore {
    async fn get(&self, key: &RecordKey) -> Result<Option<Record>, StoreError> {
        let row = sqlx::query(
            "SELECT collection, id, version, fields, updated_at FROM records WHERE collection = $1 AND id = $2",
        )
        .bind(&key.collection)
        .bind(&key.id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn put_merge(
        &self,
        key: &RecordKey,
        fields: Document,
        timestamp: OffsetDateTime,
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        lock_key(&mut tx, &key.to_string()).await?;
        let version = upsert_merge(&mut tx, key, fields, timestamp)
            .await?
            .ok_or_else(|| StoreError::Stale { key: key.to_string() })?;
        notify(&mut tx, key).await?;
        tx.commit().await.map_err(map_sqlx)?;
        Ok(version)
    }

    async fn put_batch(
        &self,
        writes: Vec<BatchWrite>,
        timestamp: OffsetDateTime,
    ) -> Result<Vec<WriteResult>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        for key in lock_order(&writes) {
            lock_key(&mut tx, &key).await?;
        }

        // Check every precondition before the first write; dropping `tx` on an
        // early return rolls the batch back.
        for write in &writes {
            let expect = match &write.op {
                WriteOp::Merge { expect, .. } | WriteOp::Assert { expect } => *expect,
                WriteOp::CreateIfAbsent { .. } => continue,
            };
            if expect == Expect::Any {
                continue;
            }
            let current = locked_version(&mut tx, &write.key).await?;
            if !expect.holds(current) {
                return Err(StoreError::Conflict {
                    key: write.key.to_string(),
                });
            }
        }

        let mut results = Vec::with_capacity(writes.len());
        for write in writes {
            let key = write.key;
            match write.op {
                WriteOp::Merge { fields, expect } => {
                    let written = if expect == Expect::Missing {
                        // A concurrent insert of the same key must fail the batch.
                        insert_if_absent(&mut tx, &key, fields, timestamp).await?
                    } else {
                        upsert_merge(&mut tx, &key, fields, timestamp).await?
                    };
                    let version = written.ok_or_else(|| StoreError::Conflict { key: key.to_string() })?;
                    notify(&mut tx, &key).await?;
                    results.push(WriteResult::Written { version });
                }
                WriteOp::CreateIfAbsent { fields } => match insert_if_absent(&mut tx, &key, fields, timestamp).await? {
                    Some(version) => {
                        notify(&mut tx, &key).await?;
                        results.push(WriteResult::Written { version });
                    }
                    None => results.push(WriteResult::AlreadyPresent),
                },
                WriteOp::Assert { .. } => results.push(WriteResult::Asserted),
            }
        }

        tx.commit().await.map_err(map_sqlx)?;
        Ok(results)
    }

    async fn query_recent(&self, collection: &str, limit: usize) -> Result<Vec<Record>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT collection, id, version, fields, updated_at
            FROM records
            WHERE collection = $1
            ORDER BY updated_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(collection)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(row_to_record).collect()
    }

    async fn subscribe(&self, collection: &str, scope: SnapshotScope) -> Result<RecordStream, StoreError> {
        // Listen before taking the snapshot so no commit is missed; a change
        // that lands in both is delivered twice, which readers tolerate by
        // comparing versions.
        let mut listener = PgListener::connect_with(&self.pool).await.map_err(map_sqlx)?;
        listener.listen(CHANGE_CHANNEL).await.map_err(map_sqlx)?;

        let mut snapshot = match scope {
            SnapshotScope::All => {
                let rows = sqlx::query(
                    "SELECT collection, id, version, fields, updated_at FROM records WHERE collection = $1 ORDER BY id",
                )
                .bind(collection)
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx)?;
                rows.iter().map(row_to_record).collect::<Result<Vec<_>, _>>()?
            }
            SnapshotScope::Recent(n) => self.query_recent(collection, n).await?,
        };
        if matches!(scope, SnapshotScope::Recent(_)) {
            snapshot.reverse();
        }

        let store = self.clone();
        let collection = collection.to_string();
        let stream = async_stream::stream! {
            for record in snapshot {
                yield Ok(record);
            }

            loop {
                let notification = match listener.recv().await {
                    Ok(n) => n,
                    Err(e) => {
                        // Notifications sent while the listener was down are
                        // lost; the stream ends so the reader resubscribes.
                        yield Err(map_sqlx(e));
                        break;
                    }
                };
                let Some((changed_collection, id)) = notification.payload().split_once('/') else {
                    tracing::warn!(payload = notification.payload(), "malformed change notification");
                    continue;
                };
                if changed_collection != collection {
                    continue;
                }
                match store.get(&RecordKey::new(changed_collection, id)).await {
                    Ok(Some(record)) => yield Ok(record),
                    Ok(None) => {}
                    Err(e) => yield Err(e),
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay(id: &str) -> RecordKey {
        RecordKey::new("relay_commands", id)
    }

    #[test]
    fn batches_lock_keys_in_one_global_order() {
        // Opposite write orders still lock in one order.
        let a = vec![
            BatchWrite::merge(relay("2"), Document::new(), Expect::Missing),
            BatchWrite::assert(relay("3"), Expect::Missing),
            BatchWrite::create_if_absent(RecordKey::new("relay_logs", "e1"), Document::new()),
        ];
        let b = vec![
            BatchWrite::create_if_absent(RecordKey::new("relay_logs", "e1"), Document::new()),
            BatchWrite::merge(relay("3"), Document::new(), Expect::Missing),
            BatchWrite::assert(relay("2"), Expect::Missing),
        ];

        assert_eq!(lock_order(&a), lock_order(&b));
        assert_eq!(
            lock_order(&a),
            vec!["relay_commands/2".to_string(), "relay_commands/3".to_string(), "relay_logs/e1".to_string()]
        );
    }

    #[test]
    fn repeated_key_is_locked_once() {
        let writes = vec![
            BatchWrite::assert(relay("1"), Expect::Version(2)),
            BatchWrite::merge(relay("1"), Document::new(), Expect::Any),
        ];
        assert_eq!(lock_order(&writes), vec!["relay_commands/1".to_string()]);
    }
}
