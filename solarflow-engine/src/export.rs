//! CSV rendering of the audit ledger.

use std::io;

use serde::Serialize;
use solarflow_client::domain::AuditEntry;
use time::format_description::well_known::Rfc3339;

#[derive(Debug, Serialize)]
struct AuditCsvRow<'a> {
    id: &'a str,
    timestamp: String,
    relay: String,
    state: String,
    source: String,
    reason: &'a str,
    operator: &'a str,
}

/// Write `entries` in the order given, one row per entry, with a header row.
pub fn write_audit_csv<W: io::Write>(entries: &[AuditEntry], out: W) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_writer(out);
    for entry in entries {
        writer.serialize(AuditCsvRow {
            id: &entry.id,
            timestamp: entry.timestamp.format(&Rfc3339)?,
            relay: entry.target.to_string(),
            state: entry.resulting_state.to_string(),
            source: entry.origin.to_string(),
            reason: &entry.reason,
            operator: entry.operator.as_deref().unwrap_or(""),
        })?;
    }
    writer.flush()?;
    Ok(())
}
