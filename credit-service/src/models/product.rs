//! Product catalog entries.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::AccountType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRate {
    pub account_type: AccountType,
    /// Price per hour of running time.
    pub hourly_rate: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub product_type: String,
    pub paid: bool,
    pub rates: Vec<ProductRate>,
    /// Smallest running-seconds quantity accepted in a metering record.
    #[serde(default = "default_min_granularity")]
    pub min_granularity_secs: u64,
}

fn default_min_granularity() -> u64 {
    1
}

impl Product {
    pub fn rate_for(&self, account_type: AccountType) -> Option<Decimal> {
        self.rates
            .iter()
            .find(|r| r.account_type == account_type)
            .map(|r| r.hourly_rate)
    }
}
