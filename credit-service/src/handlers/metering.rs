//! Metering intake and the invalid-record query.

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
};
use chrono::Utc;
use serde::Serialize;
use service_core::error::AppError;

use crate::models::{InvalidMeteringRecord, InvalidRecordFilter, MeteringRecord};
use crate::services::IngestOutcome;
use crate::startup::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeteringAck {
    pub transaction_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InvalidRecordsResponse {
    pub records: Vec<InvalidMeteringRecord>,
}

/// Accept a metering record. Always 200 for any JSON body: rejected and
/// malformed records are only visible through the invalid-record query.
///
/// POST /v1/meteringrecords
pub async fn submit_record(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<MeteringAck>), AppError> {
    let record = MeteringRecord::from_json(&body);
    let outcome = state.aggregator.ingest(&record, Utc::now()).await?;
    if let IngestOutcome::Accepted(entry) = &outcome {
        tracing::debug!(cloud_account_id = %entry.cloud_account_id, "Usage recorded");
    }

    Ok((
        StatusCode::OK,
        Json(MeteringAck {
            transaction_id: record.transaction_id,
        }),
    ))
}

/// GET /v1/meteringrecords/invalid?cloudAccountId=&transactionId=
pub async fn list_invalid_records(
    State(state): State<AppState>,
    Query(filter): Query<InvalidRecordFilter>,
) -> Result<Json<InvalidRecordsResponse>, AppError> {
    let records = state.aggregator.invalid_records(&filter).await?;
    Ok(Json(InvalidRecordsResponse { records }))
}
