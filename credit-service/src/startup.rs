//! Application startup and lifecycle management.

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::security_headers::security_headers_middleware;
use service_core::middleware::tracing::{request_id_middleware, REQUEST_ID_HEADER};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::CreditConfig;
use crate::handlers::{accounts, coupons, credits, health, instances, metering};
use crate::services::{
    init_metrics, CreditService, Database, EnforcementGateway, InMemoryStore, InstanceController,
    LedgerStore, LogInstanceController, LogNotificationSink, NotificationSink, ProductCatalog,
    UsageAggregator,
};
use crate::workers::{ReconciliationScheduler, Reconciler};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: CreditConfig,
    pub store: Arc<dyn LedgerStore>,
    pub credits: CreditService,
    pub aggregator: UsageAggregator,
    pub gateway: EnforcementGateway,
    pub reconciler: Arc<Reconciler>,
}

/// Build the HTTP router over the given state.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        .route("/metrics", get(health::metrics_handler))
        // Accounts
        .route("/v1/cloudaccounts", post(accounts::enroll_account))
        .route("/v1/cloudaccounts/:id", get(accounts::get_account))
        .route(
            "/v1/cloudaccounts/:id/reconcile",
            post(accounts::reconcile_account),
        )
        .route("/v1/cloudaccounts/:id/credit", get(credits::get_credit))
        .route("/v1/cloudaccounts/:id/usage", get(credits::get_usage))
        // Grants
        .route("/v1/coupons", post(coupons::create_coupon))
        .route("/v1/coupons/redeem", post(coupons::redeem_coupon))
        .route("/v1/coupons/:code", get(coupons::get_coupon))
        .route("/v1/coupons/:code/disable", post(coupons::disable_coupon))
        .route("/v1/cloudcredits", post(credits::issue_credit))
        // Metering
        .route("/v1/meteringrecords", post(metering::submit_record))
        .route(
            "/v1/meteringrecords/invalid",
            get(metering::list_invalid_records),
        )
        // Enforcement
        .route("/v1/instances", post(instances::register_instance))
        .route("/v1/instances/can-launch", post(instances::can_launch))
        .route(
            "/v1/instances/deactivation",
            get(instances::deactivation_list),
        )
        .with_state(state)
        .layer(middleware::from_fn(metrics_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                )
            }),
        )
        .layer(middleware::from_fn(request_id_middleware))
        .layer(middleware::from_fn(security_headers_middleware))
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
    scheduler: ReconciliationScheduler,
}

impl Application {
    /// Build the application with the logging notification sink and
    /// instance controller.
    pub async fn build(config: CreditConfig) -> Result<Self, AppError> {
        Self::build_with(
            config,
            Arc::new(LogNotificationSink),
            Arc::new(LogInstanceController),
        )
        .await
    }

    /// Build the application with explicit collaborators.
    pub async fn build_with(
        config: CreditConfig,
        sink: Arc<dyn NotificationSink>,
        controller: Arc<dyn InstanceController>,
    ) -> Result<Self, AppError> {
        init_metrics();

        let store: Arc<dyn LedgerStore> = match &config.database {
            Some(db_config) => {
                let db = Database::new(
                    &db_config.url,
                    db_config.max_connections,
                    db_config.min_connections,
                )
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                    e
                })?;
                db.run_migrations().await.map_err(|e| {
                    tracing::error!(error = %e, "Failed to run migrations");
                    e
                })?;
                Arc::new(db)
            }
            None => {
                tracing::warn!("DATABASE_URL not set, using the in-memory ledger store");
                Arc::new(InMemoryStore::new())
            }
        };

        let catalog = Arc::new(match &config.catalog_path {
            Some(path) => ProductCatalog::from_file(path)?,
            None => ProductCatalog::builtin(),
        });
        tracing::info!(products = catalog.len(), "Product catalog loaded");

        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            sink,
            controller,
            config.entitlement.clone(),
            config.notifications.clone(),
            config.scheduler.workers,
        ));
        let (scheduler, grant_tx) =
            ReconciliationScheduler::new(reconciler.clone(), config.scheduler.clone());

        let state = AppState {
            config: config.clone(),
            store: store.clone(),
            credits: CreditService::new(store.clone(), config.coupons.clone(), Some(grant_tx)),
            aggregator: UsageAggregator::new(store.clone(), catalog.clone()),
            gateway: EnforcementGateway::new(store, catalog),
            reconciler,
        };

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Credit service listener bound");

        Ok(Self {
            port,
            listener,
            state,
            scheduler,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Run the HTTP server and the reconciliation scheduler until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let shutdown = self.scheduler.shutdown_token();
        let scheduler = self.scheduler.start();

        let router = build_router(self.state);

        tracing::info!(
            service = "credit-service",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        let result = axum::serve(self.listener, router).await;

        shutdown.cancel();
        if let Err(e) = scheduler.await {
            tracing::error!(error = %e, "Reconciliation scheduler task failed");
        }

        result.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
