use serde::Deserialize;
use std::{fs, time::Duration as StdDuration};

use crate::coordinator::{AuditMode, RetryPolicy};
use crate::engine::EngineSettings;
use crate::ledger::DEFAULT_VIEW_LIMIT;
use crate::telemetry::DEFAULT_HISTORY_CAPACITY;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub kind: StoreKind,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    50
}

fn default_staleness_threshold_secs() -> u64 {
    120
}

fn default_history_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}

fn default_audit_view_limit() -> usize {
    DEFAULT_VIEW_LIMIT
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_staleness_threshold_secs")]
    pub staleness_threshold_secs: u64,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_audit_view_limit")]
    pub audit_view_limit: usize,
    #[serde(default)]
    pub audit_mode: AuditMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            staleness_threshold_secs: default_staleness_threshold_secs(),
            history_capacity: default_history_capacity(),
            audit_view_limit: default_audit_view_limit(),
            audit_mode: AuditMode::default(),
        }
    }
}

impl EngineConfig {
    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            retry: RetryPolicy {
                max_retries: self.max_retries,
                backoff: StdDuration::from_millis(self.retry_backoff_ms),
            },
            audit_mode: self.audit_mode,
            staleness_threshold: time::Duration::seconds(i64::try_from(self.staleness_threshold_secs).unwrap_or(i64::MAX)),
            history_capacity: self.history_capacity,
            audit_view_limit: self.audit_view_limit,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub store: StoreConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    pub api: ApiConfig,
    pub metrics: Option<MetricsConfig>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("SOLARFLOW_CONFIG").unwrap_or_else(|_| "solarflow-config.toml".to_string());
        let contents = fs::read_to_string(&path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        let cfg: AppConfig = toml::from_str(contents)?;
        if cfg.store.kind == StoreKind::Postgres && cfg.store.uri.is_none() {
            anyhow::bail!("store.uri is required when store.kind = \"postgres\"");
        }
        Ok(cfg)
    }
}
