//! Persistence seam for the ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;

use crate::models::{
    AccountFlags, CloudAccount, Coupon, CouponRedemption, CreditGrant, EnrollAccount, Instance,
    InvalidMeteringRecord, InvalidRecordFilter, NotificationState, RedeemOutcome, UsageEntry,
};

/// Storage used by every ledger component. Implementations must make
/// `insert_usage_if_absent` and `redeem_coupon` atomic.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn health_check(&self) -> Result<(), AppError>;

    // Accounts

    /// Create the account, or reset the notification latch of an existing one.
    async fn enroll_account(
        &self,
        input: &EnrollAccount,
        now: DateTime<Utc>,
    ) -> Result<CloudAccount, AppError>;

    async fn get_account(&self, id: &str) -> Result<Option<CloudAccount>, AppError>;

    async fn update_account_flags(&self, id: &str, flags: &AccountFlags) -> Result<(), AppError>;

    /// Accounts with any grant or usage history.
    async fn list_ledger_accounts(&self) -> Result<Vec<String>, AppError>;

    async fn get_notification_state(&self, id: &str)
    -> Result<Option<NotificationState>, AppError>;

    async fn save_notification_state(
        &self,
        id: &str,
        state: &NotificationState,
    ) -> Result<(), AppError>;

    // Grants

    async fn insert_grant(&self, grant: &CreditGrant) -> Result<(), AppError>;

    /// Grants of an account, earliest expiry first.
    async fn list_grants(&self, cloud_account_id: &str) -> Result<Vec<CreditGrant>, AppError>;

    // Coupons

    /// Fails with `AppError::Conflict` when the code already exists.
    async fn insert_coupon(&self, coupon: &Coupon) -> Result<(), AppError>;

    async fn get_coupon(&self, code: &str) -> Result<Option<Coupon>, AppError>;

    async fn set_coupon_disabled(&self, code: &str, disabled: bool) -> Result<bool, AppError>;

    async fn list_redemptions(&self, code: &str) -> Result<Vec<CouponRedemption>, AppError>;

    /// Atomically re-check the coupon, bump `num_redeemed`, record the
    /// redemption and insert the grant. Nothing is written unless the outcome
    /// is `Redeemed`.
    async fn redeem_coupon(
        &self,
        code: &str,
        grant: &CreditGrant,
        now: DateTime<Utc>,
    ) -> Result<RedeemOutcome, AppError>;

    // Metering

    /// Insert unless `(resource_id, transaction_id)` is already recorded.
    /// Returns whether the entry was inserted.
    async fn insert_usage_if_absent(&self, entry: &UsageEntry) -> Result<bool, AppError>;

    async fn has_transaction(&self, resource_id: &str, transaction_id: &str)
    -> Result<bool, AppError>;

    /// Usage of an account in timestamp order.
    async fn list_usage(&self, cloud_account_id: &str) -> Result<Vec<UsageEntry>, AppError>;

    async fn insert_invalid_record(&self, record: &InvalidMeteringRecord) -> Result<(), AppError>;

    async fn list_invalid_records(
        &self,
        filter: &InvalidRecordFilter,
    ) -> Result<Vec<InvalidMeteringRecord>, AppError>;

    // Instances

    async fn upsert_instance(&self, instance: &Instance) -> Result<(), AppError>;

    async fn list_instances(&self, cloud_account_id: &str) -> Result<Vec<Instance>, AppError>;

    async fn list_running_paid_instances(&self) -> Result<Vec<Instance>, AppError>;

    async fn mark_instance_terminated(
        &self,
        instance_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), AppError>;
}
