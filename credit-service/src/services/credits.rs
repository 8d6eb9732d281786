//! Credit grant store operations: coupons, redemption, direct grants and the
//! per-account credit view.

use axum::http::StatusCode;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::instrument;
use validator::ValidateEmail;

use super::depletion::{self, LedgerSnapshot, UsageCharge};
use super::metrics::record_grant_operation;
use super::store::LedgerStore;
use crate::config::CouponConfig;
use crate::models::{
    Coupon, CouponRedemption, CreateCoupon, CreditGrant, GrantCreated, GrantReason, IssueGrant,
    RedeemOutcome, coupon,
};

const CODE_GENERATION_ATTEMPTS: usize = 5;

/// Redemption rejections, each with a stable code.
#[derive(Debug, Error)]
pub enum RedeemError {
    #[error("Coupon code is invalid")]
    InvalidCoupon,

    #[error("Cloud account not found")]
    AccountNotFound,

    #[error("Coupon is disabled")]
    Disabled,

    #[error("Coupon is not yet valid")]
    NotStarted,

    #[error("Coupon has expired")]
    Expired,

    #[error("Coupon already redeemed by this account")]
    AlreadyRedeemed,

    #[error("Coupon cannot be redeemed by this account type")]
    AccountTypeMismatch,

    #[error("Coupon has no redemptions left")]
    Exhausted,

    #[error(transparent)]
    Store(#[from] AppError),
}

impl RedeemError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCoupon => "INVALID_COUPON",
            Self::AccountNotFound => "ACCOUNT_NOT_FOUND",
            Self::Disabled => "COUPON_DISABLED",
            Self::NotStarted => "COUPON_NOT_STARTED",
            Self::Expired => "EXPIRED_COUPON",
            Self::AlreadyRedeemed => "ALREADY_REDEEMED",
            Self::AccountTypeMismatch => "COUPON_ACCOUNT_TYPE_MISMATCH",
            Self::Exhausted => "COUPON_EXHAUSTED",
            Self::Store(_) => "INTERNAL",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidCoupon | Self::AccountNotFound => StatusCode::NOT_FOUND,
            Self::AlreadyRedeemed | Self::Exhausted => StatusCode::CONFLICT,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }
}

impl From<RedeemError> for AppError {
    fn from(err: RedeemError) -> Self {
        match err {
            RedeemError::Store(inner) => inner,
            other => AppError::Rejected {
                status: other.status(),
                code: other.code(),
                message: other.to_string(),
            },
        }
    }
}

/// One grant in the credit view.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditDetail {
    pub id: uuid::Uuid,
    pub cloud_account_id: String,
    pub reason: GrantReason,
    pub coupon_code: Option<String>,
    pub created: DateTime<Utc>,
    pub expiration: DateTime<Utc>,
    pub original_amount: Decimal,
    pub remaining_amount: Decimal,
    pub amount_used: Decimal,
    pub unlimited: bool,
    pub expired: bool,
}

/// Response body of the credit query.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditSummary {
    pub cloud_account_id: String,
    pub total_remaining_amount: Decimal,
    pub total_used_amount: Decimal,
    #[serde(rename = "totalUnAppliedAmount")]
    pub total_unapplied_amount: Decimal,
    pub expiration_date: Option<DateTime<Utc>>,
    pub credits: Vec<CreditDetail>,
}

impl CreditSummary {
    pub fn new(cloud_account_id: &str, grants: &[CreditGrant], snapshot: &LedgerSnapshot) -> Self {
        let credits = snapshot
            .grants
            .iter()
            .filter_map(|balance| {
                let grant = grants.iter().find(|g| g.id == balance.grant_id)?;
                Some(CreditDetail {
                    id: grant.id,
                    cloud_account_id: grant.cloud_account_id.clone(),
                    reason: grant.reason,
                    coupon_code: grant.coupon_code.clone(),
                    created: grant.created_at,
                    expiration: grant.expires_at,
                    original_amount: grant.original_amount,
                    remaining_amount: balance.remaining_amount,
                    amount_used: balance.amount_used,
                    unlimited: grant.unlimited,
                    expired: balance.expired,
                })
            })
            .collect();

        Self {
            cloud_account_id: cloud_account_id.to_string(),
            total_remaining_amount: snapshot.total_remaining_amount,
            total_used_amount: snapshot.total_used_amount,
            total_unapplied_amount: snapshot.total_unapplied_amount,
            expiration_date: snapshot.expiration_date,
            credits,
        }
    }
}

/// Load grants and usage and run the depletion walk.
pub async fn load_snapshot(
    store: &dyn LedgerStore,
    cloud_account_id: &str,
    now: DateTime<Utc>,
) -> Result<(Vec<CreditGrant>, LedgerSnapshot), AppError> {
    let grants = store.list_grants(cloud_account_id).await?;
    let usage: Vec<UsageCharge> = store
        .list_usage(cloud_account_id)
        .await?
        .iter()
        .map(UsageCharge::from)
        .collect();
    let snapshot = depletion::apply(&grants, &usage, now);
    Ok((grants, snapshot))
}

#[derive(Clone)]
pub struct CreditService {
    store: Arc<dyn LedgerStore>,
    config: CouponConfig,
    grant_tx: Option<mpsc::Sender<GrantCreated>>,
}

impl CreditService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        config: CouponConfig,
        grant_tx: Option<mpsc::Sender<GrantCreated>>,
    ) -> Self {
        Self {
            store,
            config,
            grant_tx,
        }
    }

    fn announce(&self, grant: &CreditGrant) {
        let Some(tx) = &self.grant_tx else {
            return;
        };
        let signal = GrantCreated {
            cloud_account_id: grant.cloud_account_id.clone(),
            grant_id: grant.id,
        };
        if let Err(e) = tx.try_send(signal) {
            // The next scheduler tick picks the grant up anyway.
            tracing::debug!(error = %e, grant_id = %grant.id, "Grant signal not delivered");
        }
    }

    /// Create a coupon.
    #[instrument(skip(self, input), fields(creator = %input.creator, amount = %input.amount))]
    pub async fn create_coupon(
        &self,
        input: CreateCoupon,
        now: DateTime<Utc>,
    ) -> Result<Coupon, AppError> {
        if input.amount <= Decimal::ZERO {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Coupon amount must be greater than zero"
            )));
        }

        let max_uses = if input.is_standard {
            self.config.max_uses_standard
        } else {
            self.config.max_uses_non_standard
        };
        if input.num_uses == 0 {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Coupon number of uses must be at least 1"
            )));
        }
        if input.num_uses > max_uses {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Coupon number of uses {} exceeds the limit of {} for {} coupons",
                input.num_uses,
                max_uses,
                if input.is_standard { "standard" } else { "non-standard" }
            )));
        }

        if !input.creator.validate_email() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Coupon creator must be a valid email address"
            )));
        }

        let start = input.start.unwrap_or(now);
        let expires = input
            .expires
            .unwrap_or_else(|| now + Duration::days(self.config.default_validity_days));
        if expires < now {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Coupon expiration cannot be in the past"
            )));
        }
        if expires < start {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Coupon expiration cannot precede its start"
            )));
        }

        for _ in 0..CODE_GENERATION_ATTEMPTS {
            let coupon = Coupon {
                code: coupon::generate_code(),
                amount: input.amount,
                creator: input.creator.clone(),
                created_at: now,
                start,
                expires,
                num_uses: input.num_uses,
                num_redeemed: 0,
                is_standard: input.is_standard,
                disabled: false,
            };

            match self.store.insert_coupon(&coupon).await {
                Ok(()) => {
                    record_grant_operation("create_coupon", "success");
                    tracing::info!(code = %coupon.code, "Coupon created");
                    return Ok(coupon);
                }
                Err(AppError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(AppError::InternalError(anyhow::anyhow!(
            "Failed to generate a unique coupon code"
        )))
    }

    pub async fn get_coupon(
        &self,
        code: &str,
    ) -> Result<(Coupon, Vec<CouponRedemption>), AppError> {
        let coupon = self
            .store
            .get_coupon(code)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Coupon {} not found", code)))?;
        let redemptions = self.store.list_redemptions(code).await?;
        Ok((coupon, redemptions))
    }

    #[instrument(skip(self))]
    pub async fn disable_coupon(&self, code: &str) -> Result<(), AppError> {
        if !self.store.set_coupon_disabled(code, true).await? {
            return Err(AppError::NotFound(anyhow::anyhow!("Coupon {} not found", code)));
        }
        tracing::info!(code = %code, "Coupon disabled");
        Ok(())
    }

    /// Redeem a coupon into a credit grant.
    #[instrument(skip(self), fields(code = %code, cloud_account_id = %cloud_account_id))]
    pub async fn redeem(
        &self,
        code: &str,
        cloud_account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CreditGrant, RedeemError> {
        let result = self.try_redeem(code, cloud_account_id, now).await;
        match &result {
            Ok(grant) => {
                record_grant_operation("redeem", "success");
                tracing::info!(grant_id = %grant.id, amount = %grant.original_amount, "Coupon redeemed");
                self.announce(grant);
            }
            Err(e) => {
                record_grant_operation("redeem", e.code());
                tracing::info!(code = e.code(), "Coupon redemption rejected");
            }
        }
        result
    }

    async fn try_redeem(
        &self,
        code: &str,
        cloud_account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CreditGrant, RedeemError> {
        if !coupon::is_valid_code(code) {
            return Err(RedeemError::InvalidCoupon);
        }
        let coupon = self
            .store
            .get_coupon(code)
            .await?
            .ok_or(RedeemError::InvalidCoupon)?;
        let account = self
            .store
            .get_account(cloud_account_id)
            .await?
            .ok_or(RedeemError::AccountNotFound)?;

        if coupon.disabled {
            return Err(RedeemError::Disabled);
        }
        if now < coupon.start {
            return Err(RedeemError::NotStarted);
        }
        if coupon.expires <= now {
            return Err(RedeemError::Expired);
        }
        let redemptions = self.store.list_redemptions(code).await?;
        if redemptions
            .iter()
            .any(|r| r.cloud_account_id == cloud_account_id)
        {
            return Err(RedeemError::AlreadyRedeemed);
        }
        if coupon.is_standard != account.account_type.is_standard() {
            return Err(RedeemError::AccountTypeMismatch);
        }
        if coupon.is_exhausted() {
            return Err(RedeemError::Exhausted);
        }

        let grant = CreditGrant::new(
            IssueGrant {
                cloud_account_id: cloud_account_id.to_string(),
                reason: GrantReason::Coupon,
                coupon_code: Some(coupon.code.clone()),
                original_amount: coupon.amount,
                unlimited: false,
                expires_at: coupon.expires,
            },
            now,
        );

        match self.store.redeem_coupon(code, &grant, now).await? {
            RedeemOutcome::Redeemed => Ok(grant),
            RedeemOutcome::AlreadyRedeemed => Err(RedeemError::AlreadyRedeemed),
            RedeemOutcome::Exhausted => Err(RedeemError::Exhausted),
            RedeemOutcome::UnknownCoupon => Err(RedeemError::InvalidCoupon),
        }
    }

    /// Issue a grant directly (card reserve or migration credit).
    #[instrument(skip(self, input), fields(cloud_account_id = %input.cloud_account_id, reason = %input.reason))]
    pub async fn issue_grant(
        &self,
        input: IssueGrant,
        now: DateTime<Utc>,
    ) -> Result<CreditGrant, AppError> {
        if self.store.get_account(&input.cloud_account_id).await?.is_none() {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Cloud account {} not found",
                input.cloud_account_id
            )));
        }
        if input.unlimited && input.reason != GrantReason::CardReserve {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Only card reserves can be unlimited"
            )));
        }
        if !input.unlimited && input.original_amount <= Decimal::ZERO {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Credit amount must be greater than zero"
            )));
        }
        if input.expires_at <= now {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Credit expiration must be in the future"
            )));
        }

        let grant = CreditGrant::new(input, now);
        self.store.insert_grant(&grant).await?;

        record_grant_operation("issue", "success");
        tracing::info!(grant_id = %grant.id, amount = %grant.original_amount, "Credit grant issued");
        self.announce(&grant);
        Ok(grant)
    }

    /// Credit view of an account as of `now`.
    #[instrument(skip(self))]
    pub async fn credit_summary(
        &self,
        cloud_account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CreditSummary, AppError> {
        if self.store.get_account(cloud_account_id).await?.is_none() {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Cloud account {} not found",
                cloud_account_id
            )));
        }
        let (grants, snapshot) = load_snapshot(self.store.as_ref(), cloud_account_id, now).await?;
        Ok(CreditSummary::new(cloud_account_id, &grants, &snapshot))
    }
}
