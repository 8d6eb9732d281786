//! Reconciliation scheduler: the single writer of derived account state.
//!
//! Every tick re-derives each ledger account from scratch: depletion walk,
//! entitlement flags, notifications, then termination of running paid
//! instances on depleted accounts. Work for one account is serialized by a
//! per-account lock; a failure on one account never stops the others.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::{EntitlementConfig, NotificationConfig, SchedulerConfig};
use crate::models::{GrantCreated, Notification, NotificationKind, NotificationState};
use crate::services::credits::load_snapshot;
use crate::services::enforcement::{InstanceController, TerminateOutcome};
use crate::services::entitlement::{self, EntitlementState};
use crate::services::metrics::{
    RECONCILIATION_TICK_DURATION, record_notification, record_reconciliation, record_termination,
};
use crate::services::notifier::{self, NotificationSink};
use crate::services::store::LedgerStore;

/// What one account reconciliation did.
#[derive(Debug, Clone)]
pub struct AccountReconciliation {
    pub cloud_account_id: String,
    pub state: EntitlementState,
    pub flags_changed: bool,
    pub notifications: Vec<NotificationKind>,
    pub terminated: Vec<String>,
    pub termination_failures: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub accounts: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub notifications: usize,
    pub terminated: usize,
}

pub struct Reconciler {
    store: Arc<dyn LedgerStore>,
    sink: Arc<dyn NotificationSink>,
    controller: Arc<dyn InstanceController>,
    entitlement: EntitlementConfig,
    notifications: NotificationConfig,
    workers: usize,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        sink: Arc<dyn NotificationSink>,
        controller: Arc<dyn InstanceController>,
        entitlement: EntitlementConfig,
        notifications: NotificationConfig,
        workers: usize,
    ) -> Self {
        Self {
            store,
            sink,
            controller,
            entitlement,
            notifications,
            workers: workers.max(1),
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, cloud_account_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(cloud_account_id.to_string())
            .or_default()
            .clone()
    }

    /// Re-derive one account as of `now` and publish the result.
    #[instrument(skip(self), fields(cloud_account_id = %cloud_account_id))]
    pub async fn reconcile_account(
        &self,
        cloud_account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AccountReconciliation, AppError> {
        let lock = self.lock_for(cloud_account_id);
        let _guard = lock.lock().await;

        let account = self
            .store
            .get_account(cloud_account_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("Cloud account {} not found", cloud_account_id))
            })?;

        let (_, snapshot) = load_snapshot(self.store.as_ref(), cloud_account_id, now).await?;
        let threshold = self.entitlement.threshold_for(account.account_type);
        let derived = entitlement::derive(&snapshot, &account.flags, threshold, now);

        let latch = self
            .store
            .get_notification_state(cloud_account_id)
            .await?
            .unwrap_or_else(|| NotificationState::fresh(account.created_at));
        let evaluation = notifier::evaluate(derived.state, &latch, &snapshot, now);

        // Flags go out before the latch. If the latch write fails, the next
        // pass sees the old latch and re-emits the transition events.
        let flags_changed = derived.flags != account.flags;
        if flags_changed {
            self.store
                .update_account_flags(cloud_account_id, &derived.flags)
                .await?;
            tracing::info!(
                state = derived.state.as_str(),
                paid_services_allowed = derived.flags.paid_services_allowed,
                low_credits = derived.flags.low_credits,
                terminate_paid_services = derived.flags.terminate_paid_services,
                remaining = %snapshot.total_remaining_amount,
                unapplied = %snapshot.total_unapplied_amount,
                "Account entitlement changed"
            );
        }
        if evaluation.latch != latch {
            self.store
                .save_notification_state(cloud_account_id, &evaluation.latch)
                .await?;
        }

        // Latched before delivery: a lost delivery is not retried.
        if self.notifications.delivers_to(account.account_type) {
            for kind in &evaluation.events {
                let notification = Notification::new(cloud_account_id, *kind, now);
                match self.sink.deliver(&notification).await {
                    Ok(()) => record_notification(kind.as_str(), "delivered"),
                    Err(e) => {
                        record_notification(kind.as_str(), "failed");
                        tracing::error!(error = %e, kind = %kind, "Failed to deliver notification");
                    }
                }
            }
        } else if !evaluation.events.is_empty() {
            tracing::debug!(
                account_type = %account.account_type,
                events = evaluation.events.len(),
                "Notifications latched without delivery"
            );
        }

        let mut terminated = Vec::new();
        let mut termination_failures = 0;
        if derived.flags.terminate_paid_services {
            for instance in self.store.list_instances(cloud_account_id).await? {
                if !instance.is_running_paid() {
                    continue;
                }
                match self.controller.terminate(&instance).await {
                    Ok(outcome) => {
                        self.store.mark_instance_terminated(&instance.id, now).await?;
                        record_termination(match outcome {
                            TerminateOutcome::Terminated => "terminated",
                            TerminateOutcome::AlreadyGone => "already_gone",
                        });
                        tracing::info!(instance_id = %instance.id, ?outcome, "Paid instance terminated");
                        terminated.push(instance.id);
                    }
                    Err(e) => {
                        termination_failures += 1;
                        record_termination("failed");
                        tracing::error!(
                            error = %e,
                            instance_id = %instance.id,
                            "Failed to terminate paid instance, will retry next tick"
                        );
                    }
                }
            }
        }

        Ok(AccountReconciliation {
            cloud_account_id: cloud_account_id.to_string(),
            state: derived.state,
            flags_changed,
            notifications: evaluation.events,
            terminated,
            termination_failures,
        })
    }

    /// One full pass over every account with ledger history.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickSummary, AppError> {
        let timer = RECONCILIATION_TICK_DURATION.start_timer();
        let started = Instant::now();
        let ids = self.store.list_ledger_accounts().await?;

        let results: Vec<(String, Result<AccountReconciliation, AppError>)> = stream::iter(ids)
            .map(|id| async move {
                let result = self.reconcile_account(&id, now).await;
                (id, result)
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;

        let mut summary = TickSummary {
            accounts: results.len(),
            ..TickSummary::default()
        };
        for (id, result) in results {
            match result {
                Ok(done) => {
                    record_reconciliation("success");
                    summary.succeeded += 1;
                    summary.notifications += done.notifications.len();
                    summary.terminated += done.terminated.len();
                }
                Err(e) => {
                    record_reconciliation("failed");
                    summary.failed += 1;
                    tracing::error!(error = %e, cloud_account_id = %id, "Account reconciliation failed");
                }
            }
        }

        timer.observe_duration();
        tracing::info!(
            accounts = summary.accounts,
            succeeded = summary.succeeded,
            failed = summary.failed,
            duration_ms = started.elapsed().as_millis() as u64,
            "Reconciliation tick completed"
        );
        Ok(summary)
    }
}

/// Drives the reconciler on a fixed interval and on grant signals.
pub struct ReconciliationScheduler {
    reconciler: Arc<Reconciler>,
    config: SchedulerConfig,
    grant_rx: mpsc::Receiver<GrantCreated>,
    shutdown_token: CancellationToken,
}

impl ReconciliationScheduler {
    pub fn new(
        reconciler: Arc<Reconciler>,
        config: SchedulerConfig,
    ) -> (Self, mpsc::Sender<GrantCreated>) {
        let (grant_tx, grant_rx) = mpsc::channel(config.signal_queue_size.max(1));
        let scheduler = Self {
            reconciler,
            config,
            grant_rx,
            shutdown_token: CancellationToken::new(),
        };
        (scheduler, grant_tx)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn start(self) -> JoinHandle<()> {
        let Self {
            reconciler,
            config,
            mut grant_rx,
            shutdown_token,
        } = self;

        tokio::spawn(async move {
            if !config.enabled {
                tracing::info!("Reconciliation scheduler disabled by configuration");
                return;
            }

            tracing::info!(
                interval_secs = config.interval_secs,
                workers = config.workers,
                "Starting reconciliation scheduler"
            );

            let mut ticker = tokio::time::interval(config.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut signals_open = true;

            loop {
                tokio::select! {
                    _ = shutdown_token.cancelled() => {
                        tracing::info!("Reconciliation scheduler shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = reconciler.tick_at(Utc::now()).await {
                            tracing::error!(error = %e, "Reconciliation tick failed");
                        }
                    }
                    signal = grant_rx.recv(), if signals_open => {
                        let Some(signal) = signal else {
                            tracing::info!("Grant signal channel closed");
                            signals_open = false;
                            continue;
                        };
                        tracing::debug!(
                            cloud_account_id = %signal.cloud_account_id,
                            grant_id = %signal.grant_id,
                            "Grant created, reconciling account"
                        );
                        if let Err(e) = reconciler
                            .reconcile_account(&signal.cloud_account_id, Utc::now())
                            .await
                        {
                            record_reconciliation("failed");
                            tracing::error!(
                                error = %e,
                                cloud_account_id = %signal.cloud_account_id,
                                "Account reconciliation failed"
                            );
                        }
                    }
                }
            }
        })
    }
}
