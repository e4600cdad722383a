pub mod codec;
pub mod memory_store;
pub mod pg_store;
pub mod record_store;

pub use memory_store::MemoryStore;
pub use pg_store::PgStore;
pub use record_store::{
    BatchWrite, Document, Expect, Record, RecordKey, RecordStore, RecordStream, SnapshotScope, StoreError,
    WriteOp, WriteResult,
};
