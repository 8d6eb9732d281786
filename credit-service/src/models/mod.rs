//! Domain models for credit-service.

pub mod account;
pub mod coupon;
pub mod grant;
pub mod instance;
pub mod notification;
pub mod product;
pub mod usage;

pub use account::{AccountFlags, AccountType, CloudAccount, EnrollAccount, never_depleted};
pub use coupon::{Coupon, CouponRedemption, CreateCoupon, RedeemOutcome};
pub use grant::{CreditGrant, GrantCreated, GrantReason, IssueGrant};
pub use instance::{Instance, InstanceState, LaunchDecision};
pub use notification::{Notification, NotificationKind, NotificationState};
pub use product::{Product, ProductRate};
pub use usage::{
    BillingPeriod, InvalidMeteringRecord, InvalidRecordFilter, InvalidityReason, MeteringRecord,
    UsageEntry, UsagePeriodAggregate,
};
