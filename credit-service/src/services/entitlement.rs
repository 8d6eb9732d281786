//! Account entitlement state machine.
//!
//! Healthy -> LowCredits -> Depleted -> Healthy (after top-up). Depleted is
//! re-entrant. Flags are a pure function of the ledger snapshot plus the
//! previously published flags, which only matter for the depletion timestamp.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use super::depletion::LedgerSnapshot;
use crate::models::AccountFlags;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntitlementState {
    /// No grants at all: nothing to gate on yet.
    Unfunded,
    Healthy,
    LowCredits,
    Depleted,
}

impl EntitlementState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unfunded => "UNFUNDED",
            Self::Healthy => "HEALTHY",
            Self::LowCredits => "LOW_CREDITS",
            Self::Depleted => "DEPLETED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entitlement {
    pub state: EntitlementState,
    pub flags: AccountFlags,
}

/// True when remaining credit is below `(100 - threshold_pct)%` of the allocation.
pub fn below_threshold(remaining: Decimal, allocation: Decimal, threshold_pct: u8) -> bool {
    let keep_pct = Decimal::from(100u8.saturating_sub(threshold_pct.min(100)));
    remaining < keep_pct.saturating_mul(allocation) / Decimal::ONE_HUNDRED
}

/// Derive flags from a snapshot.
///
/// `threshold_pct` is the percent-used mark that turns on `low_credits`.
pub fn derive(
    snapshot: &LedgerSnapshot,
    previous: &AccountFlags,
    threshold_pct: u8,
    now: DateTime<Utc>,
) -> Entitlement {
    if !snapshot.has_grants {
        return Entitlement {
            state: EntitlementState::Unfunded,
            flags: AccountFlags {
                paid_services_allowed: false,
                low_credits: false,
                terminate_paid_services: false,
                credits_depleted: previous.credits_depleted,
            },
        };
    }

    if snapshot.unlimited_active {
        return Entitlement {
            state: EntitlementState::Healthy,
            flags: AccountFlags {
                paid_services_allowed: true,
                low_credits: false,
                terminate_paid_services: false,
                credits_depleted: previous.credits_depleted,
            },
        };
    }

    let remaining = snapshot.total_remaining_amount;
    if remaining > Decimal::ZERO {
        let low = below_threshold(remaining, snapshot.live_allocation, threshold_pct);
        return Entitlement {
            state: if low {
                EntitlementState::LowCredits
            } else {
                EntitlementState::Healthy
            },
            flags: AccountFlags {
                paid_services_allowed: true,
                low_credits: low,
                terminate_paid_services: false,
                credits_depleted: previous.credits_depleted,
            },
        };
    }

    // Only a fresh depletion moves the timestamp.
    let credits_depleted = if previous.terminate_paid_services {
        previous.credits_depleted
    } else {
        now
    };

    Entitlement {
        state: EntitlementState::Depleted,
        flags: AccountFlags {
            paid_services_allowed: false,
            low_credits: true,
            terminate_paid_services: true,
            credits_depleted,
        },
    }
}
