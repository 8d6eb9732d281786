//! Direct grants and the per-account credit and usage views.

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::models::{CreditGrant, GrantReason, IssueGrant, UsagePeriodAggregate};
use crate::services::CreditSummary;
use crate::startup::AppState;

// ============================================================================
// Request/Response DTOs
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct IssueCreditRequest {
    #[validate(length(min = 1, message = "Cloud account id is required"))]
    pub cloud_account_id: String,
    pub reason: GrantReason,
    #[serde(default)]
    pub amount: Decimal,
    #[serde(default)]
    pub unlimited: bool,
    pub expiration: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantResponse {
    pub id: Uuid,
    pub cloud_account_id: String,
    pub reason: GrantReason,
    pub coupon_code: Option<String>,
    pub original_amount: Decimal,
    pub unlimited: bool,
    pub created: DateTime<Utc>,
    pub expiration: DateTime<Utc>,
}

impl From<CreditGrant> for GrantResponse {
    fn from(grant: CreditGrant) -> Self {
        Self {
            id: grant.id,
            cloud_account_id: grant.cloud_account_id,
            reason: grant.reason,
            coupon_code: grant.coupon_code,
            original_amount: grant.original_amount,
            unlimited: grant.unlimited,
            created: grant.created_at,
            expiration: grant.expires_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageResponse {
    pub cloud_account_id: String,
    pub periods: Vec<UsagePeriodAggregate>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Issue a card reserve or migration credit.
///
/// POST /v1/cloudcredits
pub async fn issue_credit(
    State(state): State<AppState>,
    Json(req): Json<IssueCreditRequest>,
) -> Result<(StatusCode, Json<GrantResponse>), AppError> {
    req.validate()?;

    if req.reason == GrantReason::Coupon {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Coupon credits are issued through coupon redemption"
        )));
    }

    let grant = state
        .credits
        .issue_grant(
            IssueGrant {
                cloud_account_id: req.cloud_account_id,
                reason: req.reason,
                coupon_code: None,
                original_amount: req.amount,
                unlimited: req.unlimited,
                expires_at: req.expiration,
            },
            Utc::now(),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(grant.into())))
}

/// Remaining, used and unapplied amounts with per-grant detail.
///
/// GET /v1/cloudaccounts/:id/credit
pub async fn get_credit(
    State(state): State<AppState>,
    Path(cloud_account_id): Path<String>,
) -> Result<Json<CreditSummary>, AppError> {
    let summary = state
        .credits
        .credit_summary(&cloud_account_id, Utc::now())
        .await?;
    Ok(Json(summary))
}

/// Usage per product type and billing period.
///
/// GET /v1/cloudaccounts/:id/usage
pub async fn get_usage(
    State(state): State<AppState>,
    Path(cloud_account_id): Path<String>,
) -> Result<Json<UsageResponse>, AppError> {
    if state.store.get_account(&cloud_account_id).await?.is_none() {
        return Err(AppError::NotFound(anyhow::anyhow!(
            "Cloud account {} not found",
            cloud_account_id
        )));
    }
    let periods = state.aggregator.usage_for(&cloud_account_id).await?;
    Ok(Json(UsageResponse {
        cloud_account_id,
        periods,
    }))
}
