//! Instance enforcement: launch gating and paid-instance termination.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::instrument;

use super::catalog::ProductCatalog;
use super::metrics::record_launch_decision;
use super::store::LedgerStore;
use crate::models::{AccountFlags, Instance, InstanceState, LaunchDecision};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    Terminated,
    /// Instance no longer exists on the control plane. Counts as success.
    AlreadyGone,
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Control plane unavailable: {0}")]
    Unavailable(String),

    #[error("Terminate rejected: {0}")]
    Rejected(String),
}

/// Compute control plane, as seen by the scheduler.
#[async_trait]
pub trait InstanceController: Send + Sync {
    /// Must be idempotent.
    async fn terminate(&self, instance: &Instance) -> Result<TerminateOutcome, ControllerError>;
}

/// Logs terminations. Used when no control plane is wired in.
#[derive(Debug, Default)]
pub struct LogInstanceController;

#[async_trait]
impl InstanceController for LogInstanceController {
    async fn terminate(&self, instance: &Instance) -> Result<TerminateOutcome, ControllerError> {
        tracing::warn!(
            instance_id = %instance.id,
            cloud_account_id = %instance.cloud_account_id,
            product_id = %instance.product_id,
            "Terminating paid instance"
        );
        Ok(TerminateOutcome::Terminated)
    }
}

/// Records terminate calls; instances listed in `gone` report `AlreadyGone`
/// and instances listed in `failing` report an error.
#[derive(Debug, Default)]
pub struct MockInstanceController {
    calls: Mutex<Vec<String>>,
    gone: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<String>>,
}

impl MockInstanceController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_gone(&self, instance_id: &str) {
        if let Ok(mut gone) = self.gone.lock() {
            gone.insert(instance_id.to_string());
        }
    }

    pub fn fail_on(&self, instance_id: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(instance_id.to_string());
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.clear();
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl InstanceController for MockInstanceController {
    async fn terminate(&self, instance: &Instance) -> Result<TerminateOutcome, ControllerError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(instance.id.clone());
        }
        let failing = self
            .failing
            .lock()
            .map(|f| f.contains(&instance.id))
            .unwrap_or(false);
        if failing {
            return Err(ControllerError::Unavailable(format!(
                "instance {} unreachable",
                instance.id
            )));
        }
        let gone = self
            .gone
            .lock()
            .map(|g| g.contains(&instance.id))
            .unwrap_or(false);
        Ok(if gone {
            TerminateOutcome::AlreadyGone
        } else {
            TerminateOutcome::Terminated
        })
    }
}

/// Paid access verdict from published flags.
pub fn decide(flags: &AccountFlags, is_paid: bool) -> LaunchDecision {
    if !is_paid {
        return LaunchDecision::Allow;
    }
    if flags.terminate_paid_services {
        return LaunchDecision::Deny {
            reason: "Cloud credits depleted".to_string(),
        };
    }
    if !flags.paid_services_allowed {
        return LaunchDecision::Deny {
            reason: "Paid services are not allowed for this account".to_string(),
        };
    }
    LaunchDecision::Allow
}

/// Reads the last published flags; never triggers a derivation itself.
#[derive(Clone)]
pub struct EnforcementGateway {
    store: Arc<dyn LedgerStore>,
    catalog: Arc<ProductCatalog>,
}

impl EnforcementGateway {
    pub fn new(store: Arc<dyn LedgerStore>, catalog: Arc<ProductCatalog>) -> Self {
        Self { store, catalog }
    }

    /// `CanLaunch(accountId, isPaidProduct)`.
    #[instrument(skip(self))]
    pub async fn can_launch(
        &self,
        cloud_account_id: &str,
        is_paid: bool,
    ) -> Result<LaunchDecision, AppError> {
        let decision = if !is_paid {
            LaunchDecision::Allow
        } else {
            let account = self.store.get_account(cloud_account_id).await?.ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("Cloud account {} not found", cloud_account_id))
            })?;
            decide(&account.flags, true)
        };

        record_launch_decision(if decision.is_allowed() { "allow" } else { "deny" });
        Ok(decision)
    }

    /// Resolve the product's paid flag from the catalog, then decide.
    pub async fn can_launch_product(
        &self,
        cloud_account_id: &str,
        product_id: &str,
    ) -> Result<LaunchDecision, AppError> {
        let product = self.catalog.find(product_id).ok_or_else(|| AppError::Rejected {
            status: axum::http::StatusCode::BAD_REQUEST,
            code: "NO_MATCHING_PRODUCT",
            message: format!("Unknown product {}", product_id),
        })?;
        self.can_launch(cloud_account_id, product.paid).await
    }

    /// Record an instance reported by the control plane.
    #[instrument(skip(self), fields(cloud_account_id = %cloud_account_id))]
    pub async fn register_instance(
        &self,
        instance_id: &str,
        cloud_account_id: &str,
        product_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Instance, AppError> {
        let product = self.catalog.find(product_id).ok_or_else(|| AppError::Rejected {
            status: axum::http::StatusCode::BAD_REQUEST,
            code: "NO_MATCHING_PRODUCT",
            message: format!("Unknown product {}", product_id),
        })?;
        if self.store.get_account(cloud_account_id).await?.is_none() {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Cloud account {} not found",
                cloud_account_id
            )));
        }

        let instance = Instance {
            id: instance_id.to_string(),
            cloud_account_id: cloud_account_id.to_string(),
            product_id: product.id.clone(),
            paid: product.paid,
            state: InstanceState::Running,
            created_at: now,
            terminated_at: None,
        };
        self.store.upsert_instance(&instance).await?;
        Ok(instance)
    }

    /// Running paid instances of accounts flagged for termination.
    pub async fn deactivation_list(&self) -> Result<Vec<Instance>, AppError> {
        let mut pending = Vec::new();
        for instance in self.store.list_running_paid_instances().await? {
            let flagged = self
                .store
                .get_account(&instance.cloud_account_id)
                .await?
                .is_some_and(|a| a.flags.terminate_paid_services);
            if flagged {
                pending.push(instance);
            }
        }
        Ok(pending)
    }
}
