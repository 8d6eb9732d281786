//! Metering records, accepted usage and the invalid-record side channel.

use chrono::{DateTime, Datelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

/// Raw metering record as submitted by the compute control plane.
/// Every field is optional so that incomplete records can be diverted
/// with a reason instead of failing deserialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeteringRecord {
    pub transaction_id: Option<String>,
    pub resource_id: Option<String>,
    pub cloud_account_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub product_id: Option<String>,
    pub region: Option<String>,
    /// Running seconds, as a JSON number or numeric string.
    pub quantity: Option<serde_json::Value>,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    /// A timestamp was submitted but could not be read.
    #[serde(skip)]
    pub malformed_timestamp: bool,
}

impl MeteringRecord {
    /// Read a record from any JSON body. Fields of the wrong type count as
    /// absent, so a malformed record is diverted instead of refused.
    pub fn from_json(body: &serde_json::Value) -> Self {
        if let Ok(record) = serde_json::from_value::<Self>(body.clone()) {
            return record;
        }

        let timestamp = field(body, "timestamp")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|at| at.with_timezone(&Utc));

        Self {
            transaction_id: text(body, "transactionId"),
            resource_id: text(body, "resourceId"),
            cloud_account_id: text(body, "cloudAccountId"),
            timestamp,
            product_id: text(body, "productId"),
            region: text(body, "region"),
            quantity: field(body, "quantity").cloned(),
            properties: field(body, "properties")
                .and_then(|p| serde_json::from_value(p.clone()).ok())
                .unwrap_or_default(),
            malformed_timestamp: field(body, "timestamp").is_some() && timestamp.is_none(),
        }
    }

    /// Quantity as submitted, for audit on the invalid-record side channel.
    pub fn raw_quantity(&self) -> Option<String> {
        self.quantity.as_ref().map(|q| match q {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Parsed running seconds, if the quantity is numeric.
    pub fn running_seconds(&self) -> Option<Decimal> {
        match self.quantity.as_ref()? {
            serde_json::Value::Number(n) => Decimal::from_str(&n.to_string())
                .or_else(|_| Decimal::from_scientific(&n.to_string()))
                .ok(),
            serde_json::Value::String(s) => Decimal::from_str(s.trim()).ok(),
            _ => None,
        }
    }
}

fn field<'a>(body: &'a serde_json::Value, key: &str) -> Option<&'a serde_json::Value> {
    body.get(key).filter(|v| !v.is_null())
}

fn text(body: &serde_json::Value, key: &str) -> Option<String> {
    match field(body, key)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Why a metering record was diverted. Precedence follows declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvalidityReason {
    MissingCloudAccountId,
    MissingTransactionId,
    MissingResourceName,
    FailedToGetProductRate,
    NoMatchingProduct,
    DuplicateTransactionId,
    FailedToCalculateQty,
    InvalidMeteringQty,
}

impl InvalidityReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingCloudAccountId => "MISSING_CLOUD_ACCOUNT_ID",
            Self::MissingTransactionId => "MISSING_TRANSACTION_ID",
            Self::MissingResourceName => "MISSING_RESOURCE_NAME",
            Self::FailedToGetProductRate => "FAILED_TO_GET_PRODUCT_RATE",
            Self::NoMatchingProduct => "NO_MATCHING_PRODUCT",
            Self::DuplicateTransactionId => "DUPLICATE_TRANSACTION_ID",
            Self::FailedToCalculateQty => "FAILED_TO_CALCULATE_QTY",
            Self::InvalidMeteringQty => "INVALID_METERING_QTY",
        }
    }
}

impl std::fmt::Display for InvalidityReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for InvalidityReason {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MISSING_CLOUD_ACCOUNT_ID" => Ok(Self::MissingCloudAccountId),
            "MISSING_TRANSACTION_ID" => Ok(Self::MissingTransactionId),
            "MISSING_RESOURCE_NAME" => Ok(Self::MissingResourceName),
            "FAILED_TO_GET_PRODUCT_RATE" => Ok(Self::FailedToGetProductRate),
            "NO_MATCHING_PRODUCT" => Ok(Self::NoMatchingProduct),
            "DUPLICATE_TRANSACTION_ID" => Ok(Self::DuplicateTransactionId),
            "FAILED_TO_CALCULATE_QTY" => Ok(Self::FailedToCalculateQty),
            "INVALID_METERING_QTY" => Ok(Self::InvalidMeteringQty),
            other => Err(anyhow::anyhow!("Unknown invalidity reason: {}", other)),
        }
    }
}

/// A diverted metering record. Never affects the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidMeteringRecord {
    pub id: Uuid,
    pub transaction_id: Option<String>,
    pub resource_id: Option<String>,
    pub cloud_account_id: Option<String>,
    pub product_id: Option<String>,
    pub quantity: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub reason: InvalidityReason,
    pub recorded_at: DateTime<Utc>,
}

impl InvalidMeteringRecord {
    pub fn from_record(record: &MeteringRecord, reason: InvalidityReason, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            transaction_id: record.transaction_id.clone(),
            resource_id: record.resource_id.clone(),
            cloud_account_id: record.cloud_account_id.clone(),
            product_id: record.product_id.clone(),
            quantity: record.raw_quantity(),
            timestamp: record.timestamp,
            reason,
            recorded_at: now,
        }
    }
}

/// Filter for the invalid-record query.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidRecordFilter {
    pub cloud_account_id: Option<String>,
    pub transaction_id: Option<String>,
}

impl InvalidRecordFilter {
    pub fn matches(&self, record: &InvalidMeteringRecord) -> bool {
        let account_ok = self
            .cloud_account_id
            .as_ref()
            .is_none_or(|id| record.cloud_account_id.as_ref() == Some(id));
        let txn_ok = self
            .transaction_id
            .as_ref()
            .is_none_or(|id| record.transaction_id.as_ref() == Some(id));
        account_ok && txn_ok
    }
}

/// An accepted, priced usage entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEntry {
    pub id: Uuid,
    pub cloud_account_id: String,
    pub transaction_id: String,
    pub resource_id: String,
    pub product_id: String,
    pub product_type: String,
    pub timestamp: DateTime<Utc>,
    pub running_seconds: Decimal,
    pub rate: Decimal,
    pub amount: Decimal,
}

/// Calendar month (UTC) a usage entry is billed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub year: i32,
    pub month: u32,
}

impl BillingPeriod {
    pub fn of(at: DateTime<Utc>) -> Self {
        Self {
            year: at.year(),
            month: at.month(),
        }
    }
}

impl std::fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Usage per account, product type and billing period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsagePeriodAggregate {
    pub cloud_account_id: String,
    pub product_type: String,
    pub period: String,
    pub amount: Decimal,
    pub running_seconds: Decimal,
    pub mins_used: Decimal,
    pub rate: Decimal,
    pub records: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record_with_quantity(quantity: serde_json::Value) -> MeteringRecord {
        MeteringRecord {
            quantity: Some(quantity),
            ..Default::default()
        }
    }

    #[test]
    fn running_seconds_accepts_numbers_and_numeric_strings() {
        assert_eq!(
            record_with_quantity(json!(3600)).running_seconds(),
            Some(Decimal::new(3600, 0))
        );
        assert_eq!(
            record_with_quantity(json!("90.5")).running_seconds(),
            Some(Decimal::new(905, 1))
        );
        assert_eq!(record_with_quantity(json!("abc")).running_seconds(), None);
        assert_eq!(record_with_quantity(json!(true)).running_seconds(), None);
    }

    #[test]
    fn from_json_tolerates_wrongly_typed_fields() {
        let record = MeteringRecord::from_json(&json!({
            "transactionId": 42,
            "resourceId": true,
            "cloudAccountId": "acct",
            "timestamp": "not-a-time",
            "quantity": 3600,
        }));

        assert_eq!(record.transaction_id.as_deref(), Some("42"));
        assert_eq!(record.resource_id, None);
        assert_eq!(record.cloud_account_id.as_deref(), Some("acct"));
        assert_eq!(record.timestamp, None);
        assert!(record.malformed_timestamp);
        assert_eq!(record.running_seconds(), Some(Decimal::new(3600, 0)));
    }

    #[test]
    fn from_json_reads_well_formed_records() {
        let record = MeteringRecord::from_json(&json!({
            "transactionId": "txn",
            "timestamp": "2024-05-01T00:00:00Z",
        }));

        assert_eq!(record.transaction_id.as_deref(), Some("txn"));
        assert!(record.timestamp.is_some());
        assert!(!record.malformed_timestamp);

        let not_an_object = MeteringRecord::from_json(&json!([1, 2, 3]));
        assert_eq!(not_an_object.cloud_account_id, None);
        assert!(!not_an_object.malformed_timestamp);
    }

    #[test]
    fn raw_quantity_keeps_submitted_text() {
        assert_eq!(
            record_with_quantity(json!("-5")).raw_quantity().as_deref(),
            Some("-5")
        );
        assert_eq!(
            record_with_quantity(json!(12)).raw_quantity().as_deref(),
            Some("12")
        );
    }

    #[test]
    fn filter_matches_on_both_fields() {
        let record = InvalidMeteringRecord::from_record(
            &MeteringRecord {
                cloud_account_id: Some("acct".into()),
                transaction_id: Some("txn".into()),
                ..Default::default()
            },
            InvalidityReason::NoMatchingProduct,
            Utc::now(),
        );

        assert!(InvalidRecordFilter::default().matches(&record));
        assert!(InvalidRecordFilter {
            cloud_account_id: Some("acct".into()),
            transaction_id: Some("txn".into()),
        }
        .matches(&record));
        assert!(!InvalidRecordFilter {
            cloud_account_id: Some("other".into()),
            transaction_id: None,
        }
        .matches(&record));
    }

    #[test]
    fn billing_period_is_calendar_month() {
        let at = DateTime::parse_from_rfc3339("2024-02-29T23:59:59Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(BillingPeriod::of(at).to_string(), "2024-02");
    }
}
