pub mod audit_entry;
pub mod billing_account;
pub mod relay_command;
pub mod telemetry_sample;

pub use audit_entry::{AuditEntry, AuditOrigin, AuditState, AuditTarget};
pub use billing_account::BillingAccount;
pub use relay_command::{RelayCommand, RelayMode, RelayPatch, RelayState, UnitId};
pub use telemetry_sample::{LoadSource, TelemetrySample};

/// Collection holding the three relay command records and the billing singleton.
pub const RELAY_COLLECTION: &str = "relay_commands";
/// Collection the hardware agent appends sensor samples to.
pub const SENSOR_COLLECTION: &str = "sensor_data";
/// Collection holding the audit ledger.
pub const AUDIT_COLLECTION: &str = "relay_logs";
/// Record id of the billing singleton inside [`RELAY_COLLECTION`].
pub const BILLING_RECORD_ID: &str = "billing_data";
