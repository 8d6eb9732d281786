//! Coupon administration and redemption.

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use validator::Validate;

use super::credits::GrantResponse;
use crate::models::{Coupon, CouponRedemption, CreateCoupon};
use crate::startup::AppState;

// ============================================================================
// Request/Response DTOs
// ============================================================================

fn default_standard() -> bool {
    true
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateCouponRequest {
    pub amount: Decimal,
    #[validate(range(min = 1, message = "Number of uses must be at least 1"))]
    pub num_uses: u32,
    #[validate(email(message = "Creator must be a valid email address"))]
    pub creator: String,
    pub start: Option<DateTime<Utc>>,
    pub expires: Option<DateTime<Utc>>,
    #[serde(default = "default_standard")]
    pub is_standard: bool,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RedeemCouponRequest {
    #[validate(length(min = 1, message = "Coupon code is required"))]
    pub code: String,
    #[validate(length(min = 1, message = "Cloud account id is required"))]
    pub cloud_account_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedemptionResponse {
    pub cloud_account_id: String,
    pub grant_id: uuid::Uuid,
    pub redeemed: DateTime<Utc>,
}

impl From<CouponRedemption> for RedemptionResponse {
    fn from(r: CouponRedemption) -> Self {
        Self {
            cloud_account_id: r.cloud_account_id,
            grant_id: r.grant_id,
            redeemed: r.redeemed_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CouponResponse {
    pub code: String,
    pub amount: Decimal,
    pub creator: String,
    pub created: DateTime<Utc>,
    pub start: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    pub num_uses: u32,
    pub num_redeemed: u32,
    pub is_standard: bool,
    pub disabled: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub redemptions: Vec<RedemptionResponse>,
}

impl From<Coupon> for CouponResponse {
    fn from(coupon: Coupon) -> Self {
        Self {
            code: coupon.code,
            amount: coupon.amount,
            creator: coupon.creator,
            created: coupon.created_at,
            start: coupon.start,
            expires: coupon.expires,
            num_uses: coupon.num_uses,
            num_redeemed: coupon.num_redeemed,
            is_standard: coupon.is_standard,
            disabled: coupon.disabled,
            redemptions: Vec::new(),
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Create a coupon with a generated code.
///
/// POST /v1/coupons
pub async fn create_coupon(
    State(state): State<AppState>,
    Json(req): Json<CreateCouponRequest>,
) -> Result<(StatusCode, Json<CouponResponse>), AppError> {
    req.validate()?;

    let coupon = state
        .credits
        .create_coupon(
            CreateCoupon {
                amount: req.amount,
                num_uses: req.num_uses,
                creator: req.creator,
                start: req.start,
                expires: req.expires,
                is_standard: req.is_standard,
            },
            Utc::now(),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(coupon.into())))
}

/// Coupon with its redemptions.
///
/// GET /v1/coupons/:code
pub async fn get_coupon(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<CouponResponse>, AppError> {
    let (coupon, redemptions) = state.credits.get_coupon(&code).await?;
    let mut response = CouponResponse::from(coupon);
    response.redemptions = redemptions.into_iter().map(Into::into).collect();
    Ok(Json(response))
}

/// POST /v1/coupons/:code/disable
pub async fn disable_coupon(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<StatusCode, AppError> {
    state.credits.disable_coupon(&code).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Redeem a coupon into a credit grant on the account.
///
/// POST /v1/coupons/redeem
pub async fn redeem_coupon(
    State(state): State<AppState>,
    Json(req): Json<RedeemCouponRequest>,
) -> Result<(StatusCode, Json<GrantResponse>), AppError> {
    req.validate()?;

    let grant = state
        .credits
        .redeem(req.code.trim(), req.cloud_account_id.trim(), Utc::now())
        .await?;

    Ok((StatusCode::CREATED, Json(grant.into())))
}
