//! Usage aggregator: validates metering records, prices accepted ones and
//! diverts the rest to the invalid-record side channel.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use super::catalog::ProductCatalog;
use super::metrics::record_metering;
use super::store::LedgerStore;
use crate::models::{
    BillingPeriod, InvalidMeteringRecord, InvalidRecordFilter, InvalidityReason, MeteringRecord,
    UsageEntry, UsagePeriodAggregate,
};

const SECONDS_PER_HOUR: i64 = 3600;

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Accepted(UsageEntry),
    Rejected(InvalidityReason),
}

/// Fields a record must carry before any lookup happens.
struct Identified<'a> {
    cloud_account_id: &'a str,
    transaction_id: &'a str,
    resource_id: &'a str,
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn identify(record: &MeteringRecord) -> Result<Identified<'_>, InvalidityReason> {
    let cloud_account_id =
        present(&record.cloud_account_id).ok_or(InvalidityReason::MissingCloudAccountId)?;
    let transaction_id =
        present(&record.transaction_id).ok_or(InvalidityReason::MissingTransactionId)?;
    let resource_id = present(&record.resource_id).ok_or(InvalidityReason::MissingResourceName)?;
    Ok(Identified {
        cloud_account_id,
        transaction_id,
        resource_id,
    })
}

/// Check the running-seconds quantity against the product granularity.
pub fn check_quantity(
    record: &MeteringRecord,
    min_granularity_secs: u64,
) -> Result<Decimal, InvalidityReason> {
    if record.malformed_timestamp {
        return Err(InvalidityReason::FailedToCalculateQty);
    }
    let seconds = record
        .running_seconds()
        .filter(|s| *s > Decimal::ZERO)
        .ok_or(InvalidityReason::FailedToCalculateQty)?;
    if seconds < Decimal::from(min_granularity_secs) {
        return Err(InvalidityReason::InvalidMeteringQty);
    }
    Ok(seconds)
}

/// `running_seconds / 3600 * hourly_rate`, or `None` on overflow.
pub fn price(running_seconds: Decimal, hourly_rate: Decimal) -> Option<Decimal> {
    running_seconds
        .checked_mul(hourly_rate)?
        .checked_div(Decimal::from(SECONDS_PER_HOUR))
}

/// Group usage by product type and calendar month.
pub fn aggregate(entries: &[UsageEntry]) -> Vec<UsagePeriodAggregate> {
    let mut buckets: BTreeMap<(BillingPeriod, String), UsagePeriodAggregate> = BTreeMap::new();

    for entry in entries {
        let period = BillingPeriod::of(entry.timestamp);
        let bucket = buckets
            .entry((period, entry.product_type.clone()))
            .or_insert_with(|| UsagePeriodAggregate {
                cloud_account_id: entry.cloud_account_id.clone(),
                product_type: entry.product_type.clone(),
                period: period.to_string(),
                amount: Decimal::ZERO,
                running_seconds: Decimal::ZERO,
                mins_used: Decimal::ZERO,
                rate: entry.rate,
                records: 0,
            });
        bucket.amount = bucket.amount.saturating_add(entry.amount);
        bucket.running_seconds = bucket.running_seconds.saturating_add(entry.running_seconds);
        bucket.mins_used = bucket.running_seconds / Decimal::from(60);
        bucket.rate = entry.rate;
        bucket.records += 1;
    }

    buckets.into_values().collect()
}

#[derive(Clone)]
pub struct UsageAggregator {
    store: Arc<dyn LedgerStore>,
    catalog: Arc<ProductCatalog>,
}

impl UsageAggregator {
    pub fn new(store: Arc<dyn LedgerStore>, catalog: Arc<ProductCatalog>) -> Self {
        Self { store, catalog }
    }

    /// Validate and record one metering record. Rejections are values, not
    /// errors; `Err` is returned only when the store fails.
    #[instrument(skip(self, record), fields(
        transaction_id = record.transaction_id.as_deref().unwrap_or(""),
        cloud_account_id = record.cloud_account_id.as_deref().unwrap_or("")
    ))]
    pub async fn ingest(
        &self,
        record: &MeteringRecord,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome, AppError> {
        let outcome = self.classify(record, now).await?;

        match &outcome {
            IngestOutcome::Accepted(entry) => {
                record_metering("accepted", "");
                tracing::debug!(
                    usage_id = %entry.id,
                    amount = %entry.amount,
                    product_type = %entry.product_type,
                    "Metering record accepted"
                );
            }
            IngestOutcome::Rejected(reason) => {
                self.store
                    .insert_invalid_record(&InvalidMeteringRecord::from_record(record, *reason, now))
                    .await?;
                record_metering("rejected", reason.as_str());
                tracing::info!(reason = %reason, "Metering record diverted");
            }
        }

        Ok(outcome)
    }

    async fn classify(
        &self,
        record: &MeteringRecord,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome, AppError> {
        let ids = match identify(record) {
            Ok(ids) => ids,
            Err(reason) => return Ok(IngestOutcome::Rejected(reason)),
        };

        let Some(account) = self.store.get_account(ids.cloud_account_id).await? else {
            return Ok(IngestOutcome::Rejected(
                InvalidityReason::FailedToGetProductRate,
            ));
        };

        let Some(product) = present(&record.product_id).and_then(|id| self.catalog.find(id)) else {
            return Ok(IngestOutcome::Rejected(InvalidityReason::NoMatchingProduct));
        };

        let Some(rate) = product.rate_for(account.account_type) else {
            return Ok(IngestOutcome::Rejected(
                InvalidityReason::FailedToGetProductRate,
            ));
        };

        let priced = check_quantity(record, product.min_granularity_secs).and_then(|seconds| {
            price(seconds, rate)
                .map(|amount| (seconds, amount))
                .ok_or(InvalidityReason::FailedToCalculateQty)
        });
        let (seconds, amount) = match priced {
            Ok(priced) => priced,
            Err(reason) => {
                // Bad quantity still loses to a duplicate transaction id.
                if self
                    .store
                    .has_transaction(ids.resource_id, ids.transaction_id)
                    .await?
                {
                    return Ok(IngestOutcome::Rejected(
                        InvalidityReason::DuplicateTransactionId,
                    ));
                }
                return Ok(IngestOutcome::Rejected(reason));
            }
        };

        let entry = UsageEntry {
            id: Uuid::new_v4(),
            cloud_account_id: account.id.clone(),
            transaction_id: ids.transaction_id.to_string(),
            resource_id: ids.resource_id.to_string(),
            product_id: product.id.clone(),
            product_type: product.product_type.clone(),
            // Usage cannot be dated ahead of the clock that records it.
            timestamp: record.timestamp.map_or(now, |at| at.min(now)),
            running_seconds: seconds,
            rate,
            amount,
        };

        if !self.store.insert_usage_if_absent(&entry).await? {
            return Ok(IngestOutcome::Rejected(
                InvalidityReason::DuplicateTransactionId,
            ));
        }

        Ok(IngestOutcome::Accepted(entry))
    }

    pub async fn usage_for(
        &self,
        cloud_account_id: &str,
    ) -> Result<Vec<UsagePeriodAggregate>, AppError> {
        let entries = self.store.list_usage(cloud_account_id).await?;
        Ok(aggregate(&entries))
    }

    pub async fn invalid_records(
        &self,
        filter: &InvalidRecordFilter,
    ) -> Result<Vec<InvalidMeteringRecord>, AppError> {
        self.store.list_invalid_records(filter).await
    }
}
