use std::{fmt, pin::Pin};

use futures::Stream;
use time::OffsetDateTime;

/// Body of a stored record: a flat JSON object merged field by field.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Stream of records: first the requested snapshot, then every change.
pub type RecordStream = Pin<Box<dyn Stream<Item = Result<Record, StoreError>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub collection: String,
    pub id: String,
}

impl RecordKey {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// A record as committed by the store.
///
/// `version` starts at 1 and increases by one on every write that touches
/// the record; `updated_at` is the last-writer-wins timestamp of that write.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub key: RecordKey,
    pub version: u64,
    pub fields: Document,
    pub updated_at: OffsetDateTime,
}

/// Precondition on a record's committed version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    Any,
    Version(u64),
    Missing,
}

impl Expect {
    /// Expectation matching what a reader observed: the version it saw, or absence.
    pub fn observed(version: Option<u64>) -> Self {
        match version {
            Some(v) => Self::Version(v),
            None => Self::Missing,
        }
    }

    pub fn holds(self, current: Option<u64>) -> bool {
        match (self, current) {
            (Self::Any, _) => true,
            (Self::Version(want), Some(have)) => want == have,
            (Self::Version(_), None) => false,
            (Self::Missing, current) => current.is_none(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Merge `fields` into the record (creating it if absent), provided the
    /// precondition holds.
    Merge { fields: Document, expect: Expect },
    /// Insert the record unless one with the same key exists. An existing
    /// record is left untouched and the op still succeeds.
    CreateIfAbsent { fields: Document },
    /// Precondition only; writes nothing.
    Assert { expect: Expect },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchWrite {
    pub key: RecordKey,
    pub op: WriteOp,
}

impl BatchWrite {
    pub fn merge(key: RecordKey, fields: Document, expect: Expect) -> Self {
        Self {
            key,
            op: WriteOp::Merge { fields, expect },
        }
    }

    pub fn create_if_absent(key: RecordKey, fields: Document) -> Self {
        Self {
            key,
            op: WriteOp::CreateIfAbsent { fields },
        }
    }

    pub fn assert(key: RecordKey, expect: Expect) -> Self {
        Self {
            key,
            op: WriteOp::Assert { expect },
        }
    }
}

/// Per-write outcome of a committed batch, in request order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    Written { version: u64 },
    AlreadyPresent,
    Asserted,
}

/// How much of a collection a new subscription replays before live changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotScope {
    All,
    /// The `n` records with the newest `updated_at`.
    Recent(usize),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// A batch precondition failed: the record changed since it was read.
    #[error("conflict on {key}: record changed since it was read")]
    Conflict { key: String },
    /// A merge carried a timestamp older than the committed one.
    #[error("stale write to {key}: committed record is newer")]
    Stale { key: String },
    #[error("record not found: {key}")]
    NotFound { key: String },
    /// Transient infrastructure failure. The write may or may not have landed.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("codec error: {0}")]
    Codec(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Stale { .. })
    }

    /// Whether running the same logical operation again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Stale { .. } | Self::Unavailable(_))
    }
}

/// Narrow interface over the document store backing the engine.
///
/// Implementations must make `put_batch` all-or-nothing: either every write
/// and precondition in the batch commits, or none of it is visible.
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync + 'static {
    async fn get(&self, key: &RecordKey) -> Result<Option<Record>, StoreError>;

    /// Merge `fields` into the record at `key` with last-writer-wins on
    /// `timestamp`. Returns the new version.
    async fn put_merge(
        &self,
        key: &RecordKey,
        fields: Document,
        timestamp: OffsetDateTime,
    ) -> Result<u64, StoreError>;

    /// Apply every write atomically, stamping written records with `timestamp`.
    async fn put_batch(
        &self,
        writes: Vec<BatchWrite>,
        timestamp: OffsetDateTime,
    ) -> Result<Vec<WriteResult>, StoreError>;

    /// Up to `limit` records of `collection`, newest `updated_at` first.
    async fn query_recent(&self, collection: &str, limit: usize) -> Result<Vec<Record>, StoreError>;

    /// Snapshot of `collection` followed by its live changes. An `Err` item
    /// means changes may have been dropped; subscribe again to catch up.
    async fn subscribe(&self, collection: &str, scope: SnapshotScope) -> Result<RecordStream, StoreError>;
}
