use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const DEFAULT_SELL_RATE_PER_KWH: f64 = 0.05;
pub const DEFAULT_BUY_RATE_PER_KWH: f64 = 0.15;

fn default_sell_rate() -> f64 {
    DEFAULT_SELL_RATE_PER_KWH
}

fn default_buy_rate() -> f64 {
    DEFAULT_BUY_RATE_PER_KWH
}

/// Billing singleton. The counters are accumulated by the hardware agent and
/// only ever zeroed by the engine's reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingAccount {
    #[serde(rename = "total_power_sold_wh", default)]
    pub energy_sold_wh: f64,
    #[serde(rename = "total_power_utilized_wh", default)]
    pub energy_utilized_wh: f64,
    #[serde(rename = "selling_rate_per_kwh", default = "default_sell_rate")]
    pub sell_rate_per_kwh: f64,
    #[serde(rename = "buying_rate_per_kwh", default = "default_buy_rate")]
    pub buy_rate_per_kwh: f64,
    #[serde(
        rename = "last_reset_timestamp",
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub last_reset_at: Option<OffsetDateTime>,
}

impl Default for BillingAccount {
    fn default() -> Self {
        Self {
            energy_sold_wh: 0.0,
            energy_utilized_wh: 0.0,
            sell_rate_per_kwh: DEFAULT_SELL_RATE_PER_KWH,
            buy_rate_per_kwh: DEFAULT_BUY_RATE_PER_KWH,
            last_reset_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::codec;

    #[test]
    fn missing_rates_fall_back_to_defaults() {
        let doc = serde_json::json!({
            "total_power_sold_wh": 1500.0,
            "total_power_utilized_wh": 300.0
        });

        let account: BillingAccount = codec::from_document(doc.as_object().unwrap()).unwrap();

        assert_eq!(account.energy_sold_wh, 1500.0);
        assert_eq!(account.sell_rate_per_kwh, DEFAULT_SELL_RATE_PER_KWH);
        assert_eq!(account.buy_rate_per_kwh, DEFAULT_BUY_RATE_PER_KWH);
        assert_eq!(account.last_reset_at, None);
    }
}
