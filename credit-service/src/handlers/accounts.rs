//! Cloud account enrollment and the published entitlement flags.

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use validator::Validate;

use crate::models::{AccountType, CloudAccount, EnrollAccount};
use crate::startup::AppState;
use crate::workers::AccountReconciliation;

// ============================================================================
// Request/Response DTOs
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct EnrollAccountRequest {
    #[validate(length(min = 1, max = 64, message = "Cloud account id must be 1-64 characters"))]
    pub cloud_account_id: Option<String>,
    #[serde(rename = "type")]
    pub account_type: AccountType,
    #[validate(length(equal = 2, message = "Country code must be ISO 3166-1 alpha-2"))]
    pub country_code: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountResponse {
    pub cloud_account_id: String,
    #[serde(rename = "type")]
    pub account_type: AccountType,
    pub country_code: String,
    pub paid_services_allowed: bool,
    pub low_credits: bool,
    pub terminate_paid_services: bool,
    /// Absent when the account was never depleted.
    pub credits_depleted: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
}

impl From<CloudAccount> for AccountResponse {
    fn from(account: CloudAccount) -> Self {
        let credits_depleted = account
            .was_ever_depleted()
            .then_some(account.flags.credits_depleted);
        Self {
            cloud_account_id: account.id,
            account_type: account.account_type,
            country_code: account.country_code,
            paid_services_allowed: account.flags.paid_services_allowed,
            low_credits: account.flags.low_credits,
            terminate_paid_services: account.flags.terminate_paid_services,
            credits_depleted,
            created: account.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileResponse {
    pub cloud_account_id: String,
    pub state: &'static str,
    pub flags_changed: bool,
    pub notifications: Vec<&'static str>,
    pub terminated: Vec<String>,
}

impl From<AccountReconciliation> for ReconcileResponse {
    fn from(done: AccountReconciliation) -> Self {
        Self {
            cloud_account_id: done.cloud_account_id,
            state: done.state.as_str(),
            flags_changed: done.flags_changed,
            notifications: done.notifications.iter().map(|k| k.as_str()).collect(),
            terminated: done.terminated,
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Enroll a cloud account. Re-enrolling an existing id only resets its
/// notification state.
///
/// POST /v1/cloudaccounts
pub async fn enroll_account(
    State(state): State<AppState>,
    Json(req): Json<EnrollAccountRequest>,
) -> Result<(StatusCode, Json<AccountResponse>), AppError> {
    req.validate()?;

    let input = EnrollAccount {
        id: req.cloud_account_id,
        account_type: req.account_type,
        country_code: req.country_code.to_ascii_uppercase(),
    };
    let account = state.store.enroll_account(&input, Utc::now()).await?;

    tracing::info!(
        cloud_account_id = %account.id,
        account_type = %account.account_type,
        "Cloud account enrolled"
    );

    Ok((StatusCode::CREATED, Json(account.into())))
}

/// Published flags of an account.
///
/// GET /v1/cloudaccounts/:id
pub async fn get_account(
    State(state): State<AppState>,
    Path(cloud_account_id): Path<String>,
) -> Result<Json<AccountResponse>, AppError> {
    let account = state
        .store
        .get_account(&cloud_account_id)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Cloud account {} not found", cloud_account_id))
        })?;

    Ok(Json(account.into()))
}

/// Re-derive one account immediately instead of waiting for the next tick.
///
/// POST /v1/cloudaccounts/:id/reconcile
pub async fn reconcile_account(
    State(state): State<AppState>,
    Path(cloud_account_id): Path<String>,
) -> Result<Json<ReconcileResponse>, AppError> {
    let done = state
        .reconciler
        .reconcile_account(&cloud_account_id, Utc::now())
        .await?;
    Ok(Json(done.into()))
}
