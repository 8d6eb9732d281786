//! Depletion engine.
//!
//! Grants that have expired by `now` first cover the usage dated while they
//! were live, earliest expiry first, and forfeit whatever they did not cover.
//! Live grants then absorb all remaining usage in expiry order, including
//! usage incurred before they were issued. Whatever is left is unapplied
//! debt. The walk is a pure function of its inputs, so re-running it with the
//! same grants, usage and clock yields the same snapshot.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::cmp::Ordering;
use uuid::Uuid;

use crate::models::{CreditGrant, UsageEntry};

/// A priced usage amount at a point in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageCharge {
    pub timestamp: DateTime<Utc>,
    pub amount: Decimal,
}

impl From<&UsageEntry> for UsageCharge {
    fn from(entry: &UsageEntry) -> Self {
        Self {
            timestamp: entry.timestamp,
            amount: entry.amount,
        }
    }
}

/// Per-grant outcome of the walk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GrantBalance {
    pub grant_id: Uuid,
    pub original_amount: Decimal,
    pub amount_used: Decimal,
    /// Zero once the grant has expired.
    pub remaining_amount: Decimal,
    /// Balance lost to expiry. Never refunded nor counted as unapplied.
    pub forfeited_amount: Decimal,
    pub expires_at: DateTime<Utc>,
    pub expired: bool,
    pub unlimited: bool,
}

/// Derived ledger view. Recomputed on every request, never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerSnapshot {
    pub as_of: DateTime<Utc>,
    pub total_remaining_amount: Decimal,
    pub total_used_amount: Decimal,
    pub total_unapplied_amount: Decimal,
    pub total_forfeited_amount: Decimal,
    /// Original amounts of capped grants still live at `as_of`.
    pub live_allocation: Decimal,
    /// An uncapped card reserve is live at `as_of`.
    pub unlimited_active: bool,
    /// The account has at least one grant, live or not.
    pub has_grants: bool,
    /// Latest expiry among live grants.
    pub expiration_date: Option<DateTime<Utc>>,
    /// Ordered by expiry, earliest first.
    pub grants: Vec<GrantBalance>,
}

impl LedgerSnapshot {
    pub fn is_depleted(&self) -> bool {
        self.has_grants && !self.unlimited_active && self.total_remaining_amount.is_zero()
    }

    pub fn grant(&self, grant_id: Uuid) -> Option<&GrantBalance> {
        self.grants.iter().find(|g| g.grant_id == grant_id)
    }
}

/// Draw order among grants: earliest expiry, then earliest issue, then id.
fn draw_order(a: &CreditGrant, b: &CreditGrant) -> Ordering {
    a.expires_at
        .cmp(&b.expires_at)
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}

/// Usage not yet drawn from any grant, in timestamp order.
struct Outstanding {
    charges: Vec<(DateTime<Utc>, Decimal)>,
}

impl Outstanding {
    fn new(usage: &[UsageCharge]) -> Self {
        let mut charges: Vec<(DateTime<Utc>, Decimal)> = usage
            .iter()
            .filter(|u| u.amount > Decimal::ZERO)
            .map(|u| (u.timestamp, u.amount))
            .collect();
        charges.sort_by(|a, b| a.0.cmp(&b.0));
        Self { charges }
    }

    /// Draw up to `available` from charges dated before `before`, oldest first.
    fn draw(&mut self, available: Decimal, before: Option<DateTime<Utc>>) -> Decimal {
        let mut taken = Decimal::ZERO;
        for (at, owed) in self.charges.iter_mut() {
            if before.is_some_and(|limit| *at >= limit) {
                break;
            }
            let left = available - taken;
            if left.is_zero() {
                break;
            }
            let part = (*owed).min(left);
            *owed -= part;
            taken += part;
        }
        taken
    }

    fn total(&self) -> Decimal {
        self.charges
            .iter()
            .fold(Decimal::ZERO, |sum, (_, owed)| sum.saturating_add(*owed))
    }
}

/// Run the depletion walk as of `now`.
pub fn apply(grants: &[CreditGrant], usage: &[UsageCharge], now: DateTime<Utc>) -> LedgerSnapshot {
    let mut capped: Vec<&CreditGrant> = grants.iter().filter(|g| !g.unlimited).collect();
    capped.sort_by(|a, b| draw_order(a, b));

    let mut used = vec![Decimal::ZERO; capped.len()];
    let mut outstanding = Outstanding::new(usage);

    // Expired grants only ever covered usage dated while they were live. A
    // grant never live (expiring on issue) covers nothing.
    for (idx, grant) in capped.iter().enumerate() {
        if grant.is_expired_at(now) && grant.created_at < grant.expires_at {
            used[idx] = outstanding.draw(grant.original_amount.max(Decimal::ZERO), Some(grant.expires_at));
        }
    }

    // Live grants absorb the rest, whenever it was incurred.
    for (idx, grant) in capped.iter().enumerate() {
        if grant.is_live_at(now) {
            used[idx] = outstanding.draw(grant.original_amount.max(Decimal::ZERO), None);
        }
    }

    let mut snapshot = LedgerSnapshot {
        as_of: now,
        total_remaining_amount: Decimal::ZERO,
        total_used_amount: Decimal::ZERO,
        total_unapplied_amount: outstanding.total(),
        total_forfeited_amount: Decimal::ZERO,
        live_allocation: Decimal::ZERO,
        unlimited_active: grants.iter().any(|g| g.unlimited && g.is_live_at(now)),
        has_grants: !grants.is_empty(),
        expiration_date: grants
            .iter()
            .filter(|g| g.is_live_at(now))
            .map(|g| g.expires_at)
            .max(),
        grants: Vec::with_capacity(grants.len()),
    };

    for (idx, grant) in capped.iter().enumerate() {
        let expired = grant.is_expired_at(now);
        let remaining = grant.original_amount.max(Decimal::ZERO) - used[idx];
        let (live_remaining, forfeited) = if expired {
            (Decimal::ZERO, remaining)
        } else {
            (remaining, Decimal::ZERO)
        };

        snapshot.total_used_amount = snapshot.total_used_amount.saturating_add(used[idx]);
        snapshot.total_remaining_amount = snapshot.total_remaining_amount.saturating_add(live_remaining);
        snapshot.total_forfeited_amount = snapshot.total_forfeited_amount.saturating_add(forfeited);
        // Exhausted grants no longer count toward the low-credit allocation.
        if grant.is_live_at(now) && live_remaining > Decimal::ZERO {
            snapshot.live_allocation = snapshot.live_allocation.saturating_add(grant.original_amount);
        }

        snapshot.grants.push(GrantBalance {
            grant_id: grant.id,
            original_amount: grant.original_amount,
            amount_used: used[idx],
            remaining_amount: live_remaining,
            forfeited_amount: forfeited,
            expires_at: grant.expires_at,
            expired,
            unlimited: false,
        });
    }

    for grant in grants.iter().filter(|g| g.unlimited) {
        snapshot.grants.push(GrantBalance {
            grant_id: grant.id,
            original_amount: grant.original_amount,
            amount_used: Decimal::ZERO,
            remaining_amount: Decimal::ZERO,
            forfeited_amount: Decimal::ZERO,
            expires_at: grant.expires_at,
            expired: grant.is_expired_at(now),
            unlimited: true,
        });
    }
    snapshot.grants.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));

    snapshot
}
