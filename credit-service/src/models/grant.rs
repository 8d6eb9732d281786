//! Credit grants: discrete credit allocations with their own expiry.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Where a grant came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GrantReason {
    Coupon,
    CardReserve,
    Migration,
}

impl GrantReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coupon => "COUPON",
            Self::CardReserve => "CARD_RESERVE",
            Self::Migration => "MIGRATION",
        }
    }
}

impl std::fmt::Display for GrantReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for GrantReason {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "COUPON" => Ok(Self::Coupon),
            "CARD_RESERVE" => Ok(Self::CardReserve),
            "MIGRATION" => Ok(Self::Migration),
            other => Err(anyhow::anyhow!("Unknown grant reason: {}", other)),
        }
    }
}

/// A credit grant. Remaining balance is never stored; it is re-derived by the
/// depletion walk from the full usage history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditGrant {
    pub id: Uuid,
    pub cloud_account_id: String,
    pub reason: GrantReason,
    pub coupon_code: Option<String>,
    pub original_amount: Decimal,
    /// Card-backed reserve with no amount cap.
    pub unlimited: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CreditGrant {
    pub fn new(input: IssueGrant, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            cloud_account_id: input.cloud_account_id,
            reason: input.reason,
            coupon_code: input.coupon_code,
            original_amount: input.original_amount,
            unlimited: input.unlimited,
            created_at: now,
            expires_at: input.expires_at,
        }
    }

    /// Live at `at`: already issued and not yet expired.
    pub fn is_live_at(&self, at: DateTime<Utc>) -> bool {
        self.created_at <= at && at < self.expires_at
    }

    pub fn is_expired_at(&self, at: DateTime<Utc>) -> bool {
        self.expires_at <= at
    }
}

/// Input for issuing a grant.
#[derive(Debug, Clone)]
pub struct IssueGrant {
    pub cloud_account_id: String,
    pub reason: GrantReason,
    pub coupon_code: Option<String>,
    pub original_amount: Decimal,
    pub unlimited: bool,
    pub expires_at: DateTime<Utc>,
}

/// Signal sent to the scheduler whenever a grant is created.
#[derive(Debug, Clone)]
pub struct GrantCreated {
    pub cloud_account_id: String,
    pub grant_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn grant_is_live_between_creation_and_expiry() {
        let now = Utc::now();
        let grant = CreditGrant::new(
            IssueGrant {
                cloud_account_id: "1".into(),
                reason: GrantReason::Migration,
                coupon_code: None,
                original_amount: Decimal::new(100, 0),
                unlimited: false,
                expires_at: now + Duration::days(1),
            },
            now,
        );

        assert!(!grant.is_live_at(now - Duration::seconds(1)));
        assert!(grant.is_live_at(now));
        assert!(!grant.is_live_at(now + Duration::days(1)));
        assert!(grant.is_expired_at(now + Duration::days(1)));
    }

    #[test]
    fn reason_round_trips_through_str() {
        for reason in [GrantReason::Coupon, GrantReason::CardReserve, GrantReason::Migration] {
            assert_eq!(reason.as_str().parse::<GrantReason>().unwrap(), reason);
        }
    }
}
