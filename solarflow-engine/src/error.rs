use solarflow_client::{
    domain::{RelayMode, RelayState, UnitId},
    StoreError,
};

/// Errors returned by the operator command surface.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Policy rejection; the operator must switch the sibling off first.
    #[error("interlock: cannot switch {unit} {requested}, sibling unit {sibling} active")]
    InterlockViolation {
        unit: UnitId,
        requested: RelayState,
        sibling: UnitId,
    },
    /// A global switch refused because it would put both loads on under
    /// manual control.
    #[error("interlock: cannot switch GLOBAL to {requested}, units R2 and R3 both on")]
    GlobalInterlockViolation { requested: RelayMode },
    /// Lost every compare-and-swap attempt against concurrent writers.
    #[error("concurrent modification of {target} ({attempted}) after {attempts} attempts")]
    ConcurrentModification {
        target: String,
        attempted: String,
        attempts: u32,
    },
    #[error("store unavailable while applying {attempted} to {target} after {attempts} attempts: {reason}")]
    StoreUnavailable {
        target: String,
        attempted: String,
        attempts: u32,
        reason: String,
    },
    /// Malformed input, rejected before any store access.
    #[error("invalid command: {0}")]
    Validation(String),
    /// A stored record could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl EngineError {
    /// Short machine-readable kind, used as a metric label and API error code.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InterlockViolation { .. } | Self::GlobalInterlockViolation { .. } => "interlock_violation",
            Self::ConcurrentModification { .. } => "concurrent_modification",
            Self::StoreUnavailable { .. } => "store_unavailable",
            Self::Validation(_) => "validation",
            Self::Corrupt(_) => "corrupt",
        }
    }

    /// Surface a store error that outlived the retry budget.
    pub(crate) fn from_store(err: StoreError, target: &str, attempted: &str, attempts: u32) -> Self {
        match err {
            StoreError::Conflict { .. } | StoreError::Stale { .. } => Self::ConcurrentModification {
                target: target.to_string(),
                attempted: attempted.to_string(),
                attempts,
            },
            StoreError::Unavailable(reason) => Self::StoreUnavailable {
                target: target.to_string(),
                attempted: attempted.to_string(),
                attempts,
                reason,
            },
            StoreError::NotFound { key } => Self::Corrupt(format!("{key} is missing")),
            StoreError::Codec(reason) => Self::Corrupt(reason),
        }
    }
}

/// Parse the operator's unit number.
pub fn parse_unit(n: u8) -> Result<UnitId, EngineError> {
    UnitId::from_number(n).ok_or_else(|| EngineError::Validation(format!("unknown unit {n}, expected 1, 2 or 3")))
}

/// Human label for an attempted relay command, e.g. `manual/ON`.
pub(crate) fn describe_command(mode: RelayMode, state: RelayState) -> String {
    format!("{mode}/{state}")
}
