use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::relay_command::{RelayMode, RelayState, UnitId};

/// What a ledger entry is about. Persisted as the `relay` field:
/// `R1`..`R3`, `GLOBAL` for all units, `BILLING` for the billing account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AuditTarget {
    Unit(UnitId),
    AllUnits,
    Billing,
}

impl fmt::Display for AuditTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unit(unit) => write!(f, "{unit}"),
            Self::AllUnits => f.write_str("GLOBAL"),
            Self::Billing => f.write_str("BILLING"),
        }
    }
}

impl From<AuditTarget> for String {
    fn from(target: AuditTarget) -> Self {
        target.to_string()
    }
}

impl TryFrom<String> for AuditTarget {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "GLOBAL" => Ok(Self::AllUnits),
            "BILLING" => Ok(Self::Billing),
            other => other
                .strip_prefix('R')
                .and_then(|n| n.parse::<u8>().ok())
                .and_then(UnitId::from_number)
                .map(Self::Unit)
                .ok_or_else(|| format!("unknown audit target '{other}'")),
        }
    }
}

/// Resulting state recorded for a transition. Persisted upper-case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditState {
    On,
    Off,
    Manual,
    Auto,
    Reset,
}

impl From<RelayState> for AuditState {
    fn from(state: RelayState) -> Self {
        match state {
            RelayState::On => Self::On,
            RelayState::Off => Self::Off,
        }
    }
}

impl From<RelayMode> for AuditState {
    fn from(mode: RelayMode) -> Self {
        match mode {
            RelayMode::Manual => Self::Manual,
            RelayMode::Auto => Self::Auto,
        }
    }
}

impl fmt::Display for AuditState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::On => "ON",
            Self::Off => "OFF",
            Self::Manual => "MANUAL",
            Self::Auto => "AUTO",
            Self::Reset => "RESET",
        };
        f.write_str(s)
    }
}

/// Who initiated a transition. Older console entries wrote `UI` for operator
/// actions; they decode as [`AuditOrigin::Manual`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditOrigin {
    #[serde(rename = "MANUAL", alias = "UI")]
    Manual,
    #[serde(rename = "AUTO")]
    Automatic,
}

impl fmt::Display for AuditOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manual => f.write_str("MANUAL"),
            Self::Automatic => f.write_str("AUTO"),
        }
    }
}

/// One committed transition. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Deterministic entry id; doubles as the record id in the ledger collection.
    #[serde(skip)]
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(rename = "relay")]
    pub target: AuditTarget,
    #[serde(rename = "state")]
    pub resulting_state: AuditState,
    #[serde(rename = "source")]
    pub origin: AuditOrigin,
    #[serde(default)]
    pub reason: String,
    /// Caller identity, when the transition came through the operator surface.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
}
