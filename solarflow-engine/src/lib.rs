pub mod api;
pub mod billing;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod export;
pub mod interlock;
pub mod ledger;
pub mod metrics_server;
pub mod observability;
pub mod pipeline;
pub mod projector;
pub mod telemetry;

pub use coordinator::{AuditMode, AuditStatus, CommandReceipt, RetryPolicy, TransitionCoordinator};
pub use engine::{Engine, EngineSettings};
pub use error::EngineError;
pub use pipeline::{Envelope, Pipeline};
