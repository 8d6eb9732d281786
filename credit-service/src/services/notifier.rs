//! Notification trigger and delivery.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Mutex;
use thiserror::Error;

use super::depletion::LedgerSnapshot;
use super::entitlement::EntitlementState;
use crate::models::{Notification, NotificationKind, NotificationState};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Delivery failed: {0}")]
    SendFailed(String),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),
}

/// Outbound channel for credit notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError>;
}

/// Writes notifications to the structured log.
#[derive(Debug, Default)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError> {
        tracing::info!(
            cloud_account_id = %notification.cloud_account_id,
            kind = %notification.kind,
            subject = %notification.subject,
            "Credit notification published"
        );
        Ok(())
    }
}

/// Keeps delivered notifications in memory.
#[derive(Debug, Default)]
pub struct MockNotificationSink {
    sent: Mutex<Vec<Notification>>,
}

impl MockNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn sent_to(&self, cloud_account_id: &str) -> Vec<NotificationKind> {
        self.sent()
            .into_iter()
            .filter(|n| n.cloud_account_id == cloud_account_id)
            .map(|n| n.kind)
            .collect()
    }
}

#[async_trait]
impl NotificationSink for MockNotificationSink {
    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError> {
        self.sent
            .lock()
            .map_err(|e| DeliveryError::SendFailed(e.to_string()))?
            .push(notification.clone());
        Ok(())
    }
}

/// Events to emit for one derivation and the latch to store afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub events: Vec<NotificationKind>,
    pub latch: NotificationState,
}

/// Decide which notifications a derivation triggers.
///
/// Threshold events fire at most once per crossing. The 80% latch re-arms when
/// the account is healthy again; the 100% latch re-arms once it leaves the
/// depleted state, and releasing it is what reports credits as available
/// again. Accounts on an uncapped card reserve get no usage events.
pub fn evaluate(
    state: EntitlementState,
    latch: &NotificationState,
    snapshot: &LedgerSnapshot,
    now: DateTime<Utc>,
) -> Evaluation {
    let mut events = Vec::new();
    let mut next = *latch;

    if snapshot.unlimited_active {
        next.expired_notified_through = next.expired_notified_through.max(now);
        return Evaluation { events, latch: next };
    }

    match state {
        EntitlementState::Depleted => {
            if !latch.threshold100_sent {
                events.push(NotificationKind::Threshold100);
            }
            next.threshold80_sent = true;
            next.threshold100_sent = true;
        }
        EntitlementState::LowCredits => {
            if !latch.threshold80_sent {
                events.push(NotificationKind::Threshold80);
            }
            next.threshold80_sent = true;
            next.threshold100_sent = false;
        }
        EntitlementState::Healthy => {
            next.threshold80_sent = false;
            next.threshold100_sent = false;
        }
        EntitlementState::Unfunded => {}
    }

    if latch.threshold100_sent && !next.threshold100_sent {
        events.push(NotificationKind::CreditsAvailable);
    }

    let newly_expired = snapshot.grants.iter().any(|g| {
        g.expired
            && !g.unlimited
            && g.forfeited_amount > rust_decimal::Decimal::ZERO
            && g.expires_at > latch.expired_notified_through
    });
    if newly_expired {
        events.push(NotificationKind::CreditsExpired);
    }
    next.expired_notified_through = next.expired_notified_through.max(now);

    Evaluation { events, latch: next }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CreditGrant, GrantReason, IssueGrant};
    use crate::services::depletion::{UsageCharge, apply};
    use crate::models::AccountFlags;
    use crate::services::entitlement::derive;
    use chrono::Duration;
    use rust_decimal::Decimal;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn grant(amount: i64, created: DateTime<Utc>, expires: DateTime<Utc>) -> CreditGrant {
        CreditGrant::new(
            IssueGrant {
                cloud_account_id: "acct".into(),
                reason: GrantReason::Coupon,
                coupon_code: None,
                original_amount: Decimal::new(amount, 0),
                unlimited: false,
                expires_at: expires,
            },
            created,
        )
    }

    fn used(amount: i64, at: DateTime<Utc>) -> UsageCharge {
        UsageCharge {
            timestamp: at,
            amount: Decimal::new(amount, 0),
        }
    }

    /// Drives derive + evaluate the way the scheduler does, carrying state.
    struct Harness {
        flags: AccountFlags,
        latch: NotificationState,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                flags: AccountFlags::default(),
                latch: NotificationState::fresh(t0()),
            }
        }

        fn step(&mut self, grants: &[CreditGrant], usage: &[UsageCharge], now: DateTime<Utc>) -> Vec<NotificationKind> {
            let snap = apply(grants, usage, now);
            let e = derive(&snap, &self.flags, 80, now);
            let eval = evaluate(e.state, &self.latch, &snap, now);
            self.flags = e.flags;
            self.latch = eval.latch;
            eval.events
        }
    }

    #[test]
    fn low_credit_notification_fires_once() {
        let grants = [grant(100, t0(), t0() + Duration::days(30))];
        let usage = [used(85, t0())];
        let mut h = Harness::new();

        assert_eq!(h.step(&grants, &usage, t0() + Duration::hours(1)), vec![NotificationKind::Threshold80]);
        assert!(h.step(&grants, &usage, t0() + Duration::hours(2)).is_empty());
    }

    #[test]
    fn straight_to_depleted_emits_only_the_100_event() {
        let grants = [grant(10, t0(), t0() + Duration::days(30))];
        let usage = [used(20, t0())];
        let mut h = Harness::new();

        assert_eq!(h.step(&grants, &usage, t0() + Duration::hours(1)), vec![NotificationKind::Threshold100]);
        assert!(h.step(&grants, &usage, t0() + Duration::hours(2)).is_empty());
    }

    #[test]
    fn refill_and_new_depletion_fires_a_fresh_100_event() {
        let first = grant(10, t0(), t0() + Duration::days(30));
        let mut h = Harness::new();
        let usage = vec![used(10, t0())];

        assert_eq!(h.step(&[first.clone()], &usage, t0() + Duration::hours(1)), vec![NotificationKind::Threshold100]);

        let refill = grant(100, t0() + Duration::hours(2), t0() + Duration::days(30));
        let grants = [first, refill];
        assert_eq!(
            h.step(&grants, &usage, t0() + Duration::hours(3)),
            vec![NotificationKind::CreditsAvailable]
        );

        let mut usage = usage;
        usage.push(used(100, t0() + Duration::hours(4)));
        assert_eq!(h.step(&grants, &usage, t0() + Duration::hours(5)), vec![NotificationKind::Threshold100]);
    }

    #[test]
    fn credits_available_follows_the_latch_not_the_flags() {
        let grants = [
            grant(10, t0(), t0() + Duration::days(30)),
            grant(100, t0() + Duration::hours(2), t0() + Duration::days(30)),
        ];
        let usage = [used(10, t0())];
        let now = t0() + Duration::hours(3);
        let snap = apply(&grants, &usage, now);
        let depleted_latch = NotificationState {
            threshold80_sent: true,
            threshold100_sent: true,
            expired_notified_through: t0(),
        };

        // Flags already published as healthy, latch still depleted.
        let eval = evaluate(EntitlementState::Healthy, &depleted_latch, &snap, now);
        assert_eq!(eval.events, vec![NotificationKind::CreditsAvailable]);
        assert!(!eval.latch.threshold100_sent);

        let again = evaluate(EntitlementState::Healthy, &eval.latch, &snap, now);
        assert!(again.events.is_empty());
    }

    #[test]
    fn expiry_with_balance_notifies_once() {
        let grants = [grant(50, t0(), t0() + Duration::days(1))];
        let mut h = Harness::new();

        assert!(h.step(&grants, &[], t0() + Duration::hours(1)).is_empty());

        let events = h.step(&grants, &[], t0() + Duration::days(2));
        assert!(events.contains(&NotificationKind::CreditsExpired));
        assert!(events.contains(&NotificationKind::Threshold100));

        assert!(h.step(&grants, &[], t0() + Duration::days(3)).is_empty());
    }

    #[test]
    fn fully_used_grant_expiring_does_not_notify_expiry() {
        let grants = [
            grant(10, t0(), t0() + Duration::days(1)),
            grant(100, t0(), t0() + Duration::days(30)),
        ];
        let usage = [used(10, t0())];
        let mut h = Harness::new();

        h.step(&grants, &usage, t0() + Duration::hours(1));
        let events = h.step(&grants, &usage, t0() + Duration::days(2));
        assert!(!events.contains(&NotificationKind::CreditsExpired));
    }

    #[test]
    fn unlimited_reserve_suppresses_notifications() {
        let mut reserve = grant(0, t0(), t0() + Duration::days(365));
        reserve.unlimited = true;
        let grants = [grant(10, t0(), t0() + Duration::days(30)), reserve];
        let mut h = Harness::new();

        assert!(h.step(&grants, &[used(20, t0())], t0() + Duration::hours(1)).is_empty());
    }

    #[tokio::test]
    async fn mock_sink_records_deliveries() {
        let sink = MockNotificationSink::new();
        sink.deliver(&Notification::new("acct", NotificationKind::Threshold80, t0()))
            .await
            .unwrap();

        assert_eq!(sink.sent_to("acct"), vec![NotificationKind::Threshold80]);
        assert_eq!(sink.sent()[0].subject, "Your Cloud Credits are about to run out");
    }
}
