use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// One of the three controllable relays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum UnitId {
    /// R1: routes solar output to the battery (on) or the grid (off).
    SolarDiversion,
    /// R2: household load fed from the battery.
    BatteryLoad,
    /// R3: household load fed from the grid.
    GridLoad,
}

impl UnitId {
    pub const ALL: [UnitId; 3] = [UnitId::SolarDiversion, UnitId::BatteryLoad, UnitId::GridLoad];

    pub fn number(self) -> u8 {
        match self {
            Self::SolarDiversion => 1,
            Self::BatteryLoad => 2,
            Self::GridLoad => 3,
        }
    }

    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(Self::SolarDiversion),
            2 => Some(Self::BatteryLoad),
            3 => Some(Self::GridLoad),
            _ => None,
        }
    }

    /// Zero-based slot, for fixed-size per-unit arrays.
    pub fn index(self) -> usize {
        usize::from(self.number() - 1)
    }

    /// The unit this one is mutually exclusive with, if any.
    pub fn interlock_sibling(self) -> Option<UnitId> {
        match self {
            Self::SolarDiversion => None,
            Self::BatteryLoad => Some(Self::GridLoad),
            Self::GridLoad => Some(Self::BatteryLoad),
        }
    }

    /// Id of the unit's record in the relay collection ("1", "2", "3").
    pub fn record_id(self) -> String {
        self.number().to_string()
    }

    pub fn from_record_id(id: &str) -> Option<Self> {
        id.parse::<u8>().ok().and_then(Self::from_number)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::SolarDiversion => "solar diversion",
            Self::BatteryLoad => "battery load",
            Self::GridLoad => "grid load",
        }
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.number())
    }
}

impl TryFrom<u8> for UnitId {
    type Error = String;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        Self::from_number(n).ok_or_else(|| format!("unknown unit {n}, expected 1..=3"))
    }
}

impl From<UnitId> for u8 {
    fn from(unit: UnitId) -> Self {
        unit.number()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    #[default]
    Auto,
    Manual,
}

impl fmt::Display for RelayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Manual => f.write_str("manual"),
        }
    }
}

/// Commanded relay position. Persisted as a boolean `state` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "bool", into = "bool")]
pub enum RelayState {
    On,
    #[default]
    Off,
}

impl RelayState {
    pub fn is_on(self) -> bool {
        matches!(self, Self::On)
    }
}

impl From<bool> for RelayState {
    fn from(on: bool) -> Self {
        if on {
            Self::On
        } else {
            Self::Off
        }
    }
}

impl From<RelayState> for bool {
    fn from(state: RelayState) -> Self {
        state.is_on()
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::On => f.write_str("ON"),
            Self::Off => f.write_str("OFF"),
        }
    }
}

/// Committed command for a single unit, as the hardware agent reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RelayCommand {
    pub mode: RelayMode,
    #[serde(rename = "state")]
    pub desired_state: RelayState,
    #[serde(rename = "updatedAt", default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

impl RelayCommand {
    /// Overlay the fields present in `patch`; absent fields keep their value.
    pub fn apply(&mut self, patch: &RelayPatch) {
        if let Some(mode) = patch.mode {
            self.mode = mode;
        }
        if let Some(state) = patch.desired_state {
            self.desired_state = state;
        }
        if let Some(ts) = patch.updated_at {
            self.updated_at = Some(ts);
        }
    }

    pub fn is_manual_on(&self) -> bool {
        self.mode == RelayMode::Manual && self.desired_state.is_on()
    }
}

/// A partial relay record. Both the stored documents and the coordinator's
/// merge writes use this shape; a missing field means "unchanged".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RelayPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<RelayMode>,
    #[serde(rename = "state", default, skip_serializing_if = "Option::is_none")]
    pub desired_state: Option<RelayState>,
    #[serde(
        rename = "updatedAt",
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub updated_at: Option<OffsetDateTime>,
}
