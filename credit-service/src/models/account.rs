//! Cloud account model and entitlement flags.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Account tiers. Rates, coupon eligibility and thresholds differ per tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Standard,
    Premium,
    Enterprise,
}

impl AccountType {
    pub const ALL: [AccountType; 3] = [Self::Standard, Self::Premium, Self::Enterprise];

    /// Get string representation for database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Premium => "premium",
            Self::Enterprise => "enterprise",
        }
    }

    pub fn is_standard(&self) -> bool {
        matches!(self, Self::Standard)
    }
}

impl std::fmt::Display for AccountType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AccountType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(Self::Standard),
            "premium" => Ok(Self::Premium),
            "enterprise" => Ok(Self::Enterprise),
            other => Err(anyhow::anyhow!("Unknown account type: {}", other)),
        }
    }
}

/// Timestamp stored in `credits_depleted` when the account has never been depleted.
pub fn never_depleted() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// Flags derived by the entitlement state machine and written back by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountFlags {
    pub paid_services_allowed: bool,
    pub low_credits: bool,
    pub terminate_paid_services: bool,
    pub credits_depleted: DateTime<Utc>,
}

impl Default for AccountFlags {
    fn default() -> Self {
        Self {
            paid_services_allowed: false,
            low_credits: false,
            terminate_paid_services: false,
            credits_depleted: never_depleted(),
        }
    }
}

/// Cloud account as seen by the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudAccount {
    pub id: String,
    pub account_type: AccountType,
    pub country_code: String,
    pub flags: AccountFlags,
    pub created_at: DateTime<Utc>,
}

impl CloudAccount {
    pub fn new(id: String, account_type: AccountType, country_code: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            account_type,
            country_code,
            flags: AccountFlags::default(),
            created_at: now,
        }
    }

    /// True once the account has gone through at least one depletion.
    pub fn was_ever_depleted(&self) -> bool {
        self.flags.credits_depleted > never_depleted()
    }
}

/// Input for enrolling an account.
#[derive(Debug, Clone)]
pub struct EnrollAccount {
    pub id: Option<String>,
    pub account_type: AccountType,
    pub country_code: String,
}

/// Generate a 12-digit cloud account id.
pub fn generate_account_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    format!("{:012}", rng.gen_range(100_000_000_000u64..1_000_000_000_000u64))
}
