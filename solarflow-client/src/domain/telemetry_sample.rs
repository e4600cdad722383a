use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::relay_command::UnitId;

/// One sensor report written by the hardware agent. Never mutated by the engine.
///
/// Field names follow the agent's `sensor_data` documents. Readings the agent
/// could not take are left out of the document and decode as `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Record id assigned by the store; not part of the document body.
    #[serde(skip)]
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default)]
    pub solar_voltage: Option<f64>,
    #[serde(default)]
    pub solar_current: Option<f64>,
    #[serde(default)]
    pub solar_power_w: Option<f64>,
    #[serde(default)]
    pub battery_voltage: Option<f64>,
    #[serde(default)]
    pub battery_current: Option<f64>,
    /// State of charge, percent.
    #[serde(default)]
    pub battery_level: Option<f64>,
    #[serde(default)]
    pub grid_voltage: Option<f64>,
    #[serde(default)]
    pub household_current: Option<f64>,
    #[serde(default)]
    pub household_power_w: Option<f64>,
    #[serde(default)]
    pub relay1_state: bool,
    #[serde(default)]
    pub relay2_state: bool,
    #[serde(default)]
    pub relay3_state: bool,
}

/// Where the household load is physically drawing from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadSource {
    Battery,
    Grid,
    None,
}

impl TelemetrySample {
    /// Relay position as observed by the agent, which may lag the command.
    pub fn observed_state(&self, unit: UnitId) -> bool {
        match unit {
            UnitId::SolarDiversion => self.relay1_state,
            UnitId::BatteryLoad => self.relay2_state,
            UnitId::GridLoad => self.relay3_state,
        }
    }

    pub fn load_source(&self) -> LoadSource {
        if self.relay2_state {
            LoadSource::Battery
        } else if self.relay3_state {
            LoadSource::Grid
        } else {
            LoadSource::None
        }
    }
}
