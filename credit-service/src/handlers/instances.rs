//! Instance enforcement endpoints for the compute control plane.

use axum::{
    extract::{Json, State},
    http::StatusCode,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use validator::Validate;

use crate::models::{Instance, LaunchDecision};
use crate::startup::AppState;

// ============================================================================
// Request/Response DTOs
// ============================================================================

/// Either `productId` or an explicit `paid` flag must be present. The
/// product wins when both are given.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CanLaunchRequest {
    #[validate(length(min = 1, message = "Cloud account id is required"))]
    pub cloud_account_id: String,
    pub product_id: Option<String>,
    pub paid: Option<bool>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RegisterInstanceRequest {
    #[validate(length(min = 1, max = 128, message = "Instance id must be 1-128 characters"))]
    pub instance_id: String,
    #[validate(length(min = 1, message = "Cloud account id is required"))]
    pub cloud_account_id: String,
    #[validate(length(min = 1, message = "Product id is required"))]
    pub product_id: String,
}

#[derive(Debug, Serialize)]
pub struct DeactivationResponse {
    pub instances: Vec<Instance>,
}

// ============================================================================
// Handlers
// ============================================================================

/// 200 when the launch may proceed, 403 when it is denied.
///
/// POST /v1/instances/can-launch
pub async fn can_launch(
    State(state): State<AppState>,
    Json(req): Json<CanLaunchRequest>,
) -> Result<(StatusCode, Json<LaunchDecision>), AppError> {
    req.validate()?;

    let decision = match (&req.product_id, req.paid) {
        (Some(product_id), _) => {
            state
                .gateway
                .can_launch_product(&req.cloud_account_id, product_id)
                .await?
        }
        (None, Some(paid)) => state.gateway.can_launch(&req.cloud_account_id, paid).await?,
        (None, None) => {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Either productId or paid must be provided"
            )));
        }
    };

    let status = if decision.is_allowed() {
        StatusCode::OK
    } else {
        StatusCode::FORBIDDEN
    };
    Ok((status, Json(decision)))
}

/// Record a running instance reported by the control plane.
///
/// POST /v1/instances
pub async fn register_instance(
    State(state): State<AppState>,
    Json(req): Json<RegisterInstanceRequest>,
) -> Result<(StatusCode, Json<Instance>), AppError> {
    req.validate()?;

    let instance = state
        .gateway
        .register_instance(
            &req.instance_id,
            &req.cloud_account_id,
            &req.product_id,
            Utc::now(),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(instance)))
}

/// Running paid instances of accounts flagged for termination.
///
/// GET /v1/instances/deactivation
pub async fn deactivation_list(
    State(state): State<AppState>,
) -> Result<Json<DeactivationResponse>, AppError> {
    let instances = state.gateway.deactivation_list().await?;
    Ok(Json(DeactivationResponse { instances }))
}
