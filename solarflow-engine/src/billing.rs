//! Derived billing figures and the reset write.

use serde::Serialize;
use solarflow_client::{
    db::{codec, Document, Record},
    domain::BillingAccount,
    StoreError,
};
use time::OffsetDateTime;

const WH_PER_KWH: f64 = 1000.0;

/// Figures shown to the operator. Revenue and cost are never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BillingSummary {
    pub energy_sold_kwh: f64,
    pub energy_utilized_kwh: f64,
    pub sell_rate_per_kwh: f64,
    pub buy_rate_per_kwh: f64,
    pub revenue: f64,
    pub cost: f64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_reset_at: Option<OffsetDateTime>,
}

impl From<&BillingAccount> for BillingSummary {
    fn from(account: &BillingAccount) -> Self {
        Self {
            energy_sold_kwh: sold_kwh(account),
            energy_utilized_kwh: utilized_kwh(account),
            sell_rate_per_kwh: account.sell_rate_per_kwh,
            buy_rate_per_kwh: account.buy_rate_per_kwh,
            revenue: revenue(account),
            cost: cost(account),
            last_reset_at: account.last_reset_at,
        }
    }
}

pub fn sold_kwh(account: &BillingAccount) -> f64 {
    account.energy_sold_wh / WH_PER_KWH
}

pub fn utilized_kwh(account: &BillingAccount) -> f64 {
    account.energy_utilized_wh / WH_PER_KWH
}

pub fn revenue(account: &BillingAccount) -> f64 {
    sold_kwh(account) * account.sell_rate_per_kwh
}

pub fn cost(account: &BillingAccount) -> f64 {
    utilized_kwh(account) * account.buy_rate_per_kwh
}

/// Decode the singleton; an absent record reads as a fresh account.
pub fn decode_account(record: Option<&Record>) -> Result<BillingAccount, StoreError> {
    record.map_or_else(|| Ok(BillingAccount::default()), codec::decode_record)
}

/// Merge body that zeroes both counters and stamps the reset. Rates are only
/// written when the record does not exist yet, so existing rates survive.
pub fn reset_document(reset_at: OffsetDateTime, record_exists: bool) -> Result<Document, StoreError> {
    let mut doc = codec::to_document(&BillingAccount {
        last_reset_at: Some(reset_at),
        ..BillingAccount::default()
    })?;
    if record_exists {
        doc.remove("selling_rate_per_kwh");
        doc.remove("buying_rate_per_kwh");
    }
    Ok(doc)
}
