//! In-memory ledger store. Default backend when no database is configured.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use service_core::error::AppError;
use std::collections::BTreeSet;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::store::LedgerStore;
use crate::models::{
    AccountFlags, CloudAccount, Coupon, CouponRedemption, CreditGrant, EnrollAccount, Instance,
    InstanceState, InvalidMeteringRecord, InvalidRecordFilter, NotificationState, RedeemOutcome,
    UsageEntry, account::generate_account_id,
};

#[derive(Default)]
pub struct InMemoryStore {
    accounts: DashMap<String, CloudAccount>,
    latches: DashMap<String, NotificationState>,
    grants: DashMap<String, Vec<CreditGrant>>,
    coupons: DashMap<String, Coupon>,
    redemptions: DashMap<String, Vec<CouponRedemption>>,
    usage: DashMap<String, Vec<UsageEntry>>,
    transactions: DashMap<(String, String), Uuid>,
    invalid: RwLock<Vec<InvalidMeteringRecord>>,
    instances: DashMap<String, Instance>,
    redeem_lock: Mutex<()>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for InMemoryStore {
    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn enroll_account(
        &self,
        input: &EnrollAccount,
        now: DateTime<Utc>,
    ) -> Result<CloudAccount, AppError> {
        let id = input.id.clone().unwrap_or_else(generate_account_id);

        let account = self
            .accounts
            .entry(id.clone())
            .or_insert_with(|| {
                CloudAccount::new(
                    id.clone(),
                    input.account_type,
                    input.country_code.clone(),
                    now,
                )
            })
            .clone();
        self.latches.insert(id, NotificationState::fresh(now));

        Ok(account)
    }

    async fn get_account(&self, id: &str) -> Result<Option<CloudAccount>, AppError> {
        Ok(self.accounts.get(id).map(|a| a.clone()))
    }

    async fn update_account_flags(&self, id: &str, flags: &AccountFlags) -> Result<(), AppError> {
        let mut account = self
            .accounts
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Cloud account {} not found", id)))?;
        account.flags = *flags;
        Ok(())
    }

    async fn list_ledger_accounts(&self) -> Result<Vec<String>, AppError> {
        let ids: BTreeSet<String> = self
            .grants
            .iter()
            .map(|e| e.key().clone())
            .chain(self.usage.iter().map(|e| e.key().clone()))
            .collect();
        Ok(ids.into_iter().collect())
    }

    async fn get_notification_state(
        &self,
        id: &str,
    ) -> Result<Option<NotificationState>, AppError> {
        Ok(self.latches.get(id).map(|l| *l))
    }

    async fn save_notification_state(
        &self,
        id: &str,
        state: &NotificationState,
    ) -> Result<(), AppError> {
        self.latches.insert(id.to_string(), *state);
        Ok(())
    }

    async fn insert_grant(&self, grant: &CreditGrant) -> Result<(), AppError> {
        self.grants
            .entry(grant.cloud_account_id.clone())
            .or_default()
            .push(grant.clone());
        Ok(())
    }

    async fn list_grants(&self, cloud_account_id: &str) -> Result<Vec<CreditGrant>, AppError> {
        let mut grants = self
            .grants
            .get(cloud_account_id)
            .map(|g| g.clone())
            .unwrap_or_default();
        grants.sort_by(|a, b| a.expires_at.cmp(&b.expires_at).then(a.created_at.cmp(&b.created_at)));
        Ok(grants)
    }

    async fn insert_coupon(&self, coupon: &Coupon) -> Result<(), AppError> {
        match self.coupons.entry(coupon.code.clone()) {
            Entry::Occupied(_) => Err(AppError::Conflict(anyhow::anyhow!(
                "Coupon {} already exists",
                coupon.code
            ))),
            Entry::Vacant(slot) => {
                slot.insert(coupon.clone());
                Ok(())
            }
        }
    }

    async fn get_coupon(&self, code: &str) -> Result<Option<Coupon>, AppError> {
        Ok(self.coupons.get(code).map(|c| c.clone()))
    }

    async fn set_coupon_disabled(&self, code: &str, disabled: bool) -> Result<bool, AppError> {
        match self.coupons.get_mut(code) {
            Some(mut coupon) => {
                coupon.disabled = disabled;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_redemptions(&self, code: &str) -> Result<Vec<CouponRedemption>, AppError> {
        Ok(self
            .redemptions
            .get(code)
            .map(|r| r.clone())
            .unwrap_or_default())
    }

    async fn redeem_coupon(
        &self,
        code: &str,
        grant: &CreditGrant,
        now: DateTime<Utc>,
    ) -> Result<RedeemOutcome, AppError> {
        let _guard = self.redeem_lock.lock().await;

        let Some(mut coupon) = self.coupons.get_mut(code) else {
            return Ok(RedeemOutcome::UnknownCoupon);
        };

        let already = self.redemptions.get(code).is_some_and(|r| {
            r.iter()
                .any(|r| r.cloud_account_id == grant.cloud_account_id)
        });
        if already {
            return Ok(RedeemOutcome::AlreadyRedeemed);
        }
        if coupon.is_exhausted() {
            return Ok(RedeemOutcome::Exhausted);
        }

        coupon.num_redeemed += 1;
        drop(coupon);

        self.redemptions
            .entry(code.to_string())
            .or_default()
            .push(CouponRedemption {
                code: code.to_string(),
                cloud_account_id: grant.cloud_account_id.clone(),
                grant_id: grant.id,
                redeemed_at: now,
            });
        self.grants
            .entry(grant.cloud_account_id.clone())
            .or_default()
            .push(grant.clone());

        Ok(RedeemOutcome::Redeemed)
    }

    async fn insert_usage_if_absent(&self, entry: &UsageEntry) -> Result<bool, AppError> {
        let key = (entry.resource_id.clone(), entry.transaction_id.clone());
        match self.transactions.entry(key) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(entry.id);
                self.usage
                    .entry(entry.cloud_account_id.clone())
                    .or_default()
                    .push(entry.clone());
                Ok(true)
            }
        }
    }

    async fn has_transaction(
        &self,
        resource_id: &str,
        transaction_id: &str,
    ) -> Result<bool, AppError> {
        Ok(self
            .transactions
            .contains_key(&(resource_id.to_string(), transaction_id.to_string())))
    }

    async fn list_usage(&self, cloud_account_id: &str) -> Result<Vec<UsageEntry>, AppError> {
        let mut usage = self
            .usage
            .get(cloud_account_id)
            .map(|u| u.clone())
            .unwrap_or_default();
        usage.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(usage)
    }

    async fn insert_invalid_record(&self, record: &InvalidMeteringRecord) -> Result<(), AppError> {
        self.invalid.write().await.push(record.clone());
        Ok(())
    }

    async fn list_invalid_records(
        &self,
        filter: &InvalidRecordFilter,
    ) -> Result<Vec<InvalidMeteringRecord>, AppError> {
        Ok(self
            .invalid
            .read()
            .await
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    async fn upsert_instance(&self, instance: &Instance) -> Result<(), AppError> {
        self.instances.insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    async fn list_instances(&self, cloud_account_id: &str) -> Result<Vec<Instance>, AppError> {
        let mut instances: Vec<Instance> = self
            .instances
            .iter()
            .filter(|i| i.cloud_account_id == cloud_account_id)
            .map(|i| i.clone())
            .collect();
        instances.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(instances)
    }

    async fn list_running_paid_instances(&self) -> Result<Vec<Instance>, AppError> {
        let mut instances: Vec<Instance> = self
            .instances
            .iter()
            .filter(|i| i.is_running_paid())
            .map(|i| i.clone())
            .collect();
        instances.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(instances)
    }

    async fn mark_instance_terminated(
        &self,
        instance_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        if let Some(mut instance) = self.instances.get_mut(instance_id) {
            if instance.state != InstanceState::Terminated {
                instance.state = InstanceState::Terminated;
                instance.terminated_at = Some(at);
            }
        }
        Ok(())
    }
}
