use anyhow::{bail, Result};
use solarflow_client::db::PgStore;
use solarflow_engine::{
    config::{AppConfig, StoreKind},
    export, ledger::AuditLedger, observability,
};
use std::{env, fs::File, io, sync::Arc};

const DEFAULT_LIMIT: usize = 10_000;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        bail!("usage: export_audit <output.csv | -> [limit]");
    }
    let output = &args[1];
    let limit = match args.get(2) {
        Some(raw) => raw.parse::<usize>()?,
        None => DEFAULT_LIMIT,
    };

    let cfg = AppConfig::load()?;
    if cfg.store.kind != StoreKind::Postgres {
        bail!("export_audit reads a persistent ledger; set store.kind = \"postgres\"");
    }
    let uri = cfg
        .store
        .uri
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("store.uri is required for the postgres store"))?;
    let store = PgStore::connect(uri, cfg.store.max_connections).await?;

    let ledger = AuditLedger::new(Arc::new(store), limit);
    let mut entries = ledger.recent(limit).await?;
    // Chronological order for the export.
    entries.reverse();

    if output == "-" {
        export::write_audit_csv(&entries, io::stdout().lock())?;
    } else {
        export::write_audit_csv(&entries, File::create(output)?)?;
    }

    tracing::info!(rows = entries.len(), output = %output, "exported audit ledger");
    Ok(())
}
