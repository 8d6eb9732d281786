//! Common test utilities for credit-service integration tests.

#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use credit_service::config::{CreditConfig, EntitlementConfig, NotificationConfig};
use credit_service::models::{
    AccountType, CreditGrant, EnrollAccount, GrantReason, IssueGrant, MeteringRecord,
};
use credit_service::services::{
    CreditService, EnforcementGateway, InMemoryStore, IngestOutcome, LedgerStore,
    MockInstanceController, MockNotificationSink, ProductCatalog, UsageAggregator,
};
use credit_service::startup::{AppState, Application};
use credit_service::workers::Reconciler;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::{Arc, Once};
use uuid::Uuid;

static INIT: Once = Once::new();

/// Product used for usage in tests: 3.60 per hour, so 1000 seconds cost 1.00.
pub const PAID_PRODUCT: &str = "vm-spr-sml";
pub const FREE_PRODUCT: &str = "vm-free-tiny";
pub const SECONDS_PER_CREDIT: i64 = 1000;

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,credit_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn at(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339)
        .expect("valid timestamp")
        .with_timezone(&Utc)
}

/// Parse a decimal serialized as a JSON string or number.
pub fn dec(value: &Value) -> Decimal {
    match value {
        Value::String(s) => Decimal::from_str(s).expect("decimal string"),
        Value::Number(n) => Decimal::from_str(&n.to_string()).expect("decimal number"),
        other => panic!("not a decimal: {}", other),
    }
}

pub fn unique_account_id() -> String {
    let digits: String = Uuid::new_v4()
        .as_u128()
        .to_string()
        .chars()
        .take(12)
        .collect();
    format!("{:0>12}", digits)
}

// ============================================================================
// HTTP harness
// ============================================================================

/// Test application wrapper.
pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub client: reqwest::Client,
    pub state: AppState,
    pub sink: Arc<MockNotificationSink>,
    pub controller: Arc<MockInstanceController>,
}

/// Spawn the service on a random port with the in-memory store.
pub async fn spawn_app() -> TestApp {
    init_tracing();

    let sink = Arc::new(MockNotificationSink::new());
    let controller = Arc::new(MockInstanceController::new());
    let app = Application::build_with(CreditConfig::for_tests(), sink.clone(), controller.clone())
        .await
        .expect("Failed to build application");

    let port = app.port();
    let state = app.state().clone();
    let address = format!("http://127.0.0.1:{}", port);

    tokio::spawn(async move {
        app.run_until_stopped().await.ok();
    });

    let client = reqwest::Client::new();
    for _ in 0..50 {
        if client.get(format!("{}/health", address)).send().await.is_ok() {
            break;
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
    }

    TestApp {
        address,
        port,
        client,
        state,
        sink,
        controller,
    }
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn post(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    /// Enroll an account and return its id.
    pub async fn enroll(&self, account_type: &str) -> String {
        let response = self
            .post(
                "/v1/cloudaccounts",
                json!({ "cloudAccountId": unique_account_id(), "type": account_type, "countryCode": "US" }),
            )
            .await;
        assert_eq!(response.status().as_u16(), 201);
        let body: Value = response.json().await.expect("Failed to parse JSON");
        body["cloudAccountId"]
            .as_str()
            .expect("cloudAccountId")
            .to_string()
    }

    pub async fn issue_migration_credit(&self, cloud_account_id: &str, amount: &str) -> Value {
        let response = self
            .post(
                "/v1/cloudcredits",
                json!({
                    "cloudAccountId": cloud_account_id,
                    "reason": "MIGRATION",
                    "amount": amount,
                    "expiration": Utc::now() + Duration::days(30),
                }),
            )
            .await;
        assert_eq!(response.status().as_u16(), 201);
        response.json().await.expect("Failed to parse JSON")
    }

    /// Submit usage of the paid test product, worth `credits`.
    pub async fn meter(&self, cloud_account_id: &str, credits: i64) -> String {
        let transaction_id = Uuid::new_v4().to_string();
        let response = self
            .post(
                "/v1/meteringrecords",
                json!({
                    "transactionId": transaction_id,
                    "resourceId": "instance-1",
                    "cloudAccountId": cloud_account_id,
                    "productId": PAID_PRODUCT,
                    "timestamp": Utc::now(),
                    "quantity": credits * SECONDS_PER_CREDIT,
                }),
            )
            .await;
        assert_eq!(response.status().as_u16(), 200);
        transaction_id
    }

    pub async fn reconcile(&self, cloud_account_id: &str) -> Value {
        let response = self
            .post(
                &format!("/v1/cloudaccounts/{}/reconcile", cloud_account_id),
                json!({}),
            )
            .await;
        assert_eq!(response.status().as_u16(), 200);
        response.json().await.expect("Failed to parse JSON")
    }

    pub async fn account(&self, cloud_account_id: &str) -> Value {
        let response = self
            .get(&format!("/v1/cloudaccounts/{}", cloud_account_id))
            .await;
        assert_eq!(response.status().as_u16(), 200);
        response.json().await.expect("Failed to parse JSON")
    }
}

// ============================================================================
// Library harness with explicit clocks
// ============================================================================

/// Drives the ledger components directly, without HTTP or wall-clock time.
pub struct TestLedger {
    pub store: Arc<InMemoryStore>,
    pub credits: CreditService,
    pub aggregator: UsageAggregator,
    pub gateway: EnforcementGateway,
    pub reconciler: Arc<Reconciler>,
    pub sink: Arc<MockNotificationSink>,
    pub controller: Arc<MockInstanceController>,
}

impl TestLedger {
    pub fn new() -> Self {
        Self::with_config(EntitlementConfig::default(), NotificationConfig::default())
    }

    pub fn with_config(entitlement: EntitlementConfig, notifications: NotificationConfig) -> Self {
        init_tracing();

        let store = Arc::new(InMemoryStore::new());
        let dyn_store: Arc<dyn LedgerStore> = store.clone();
        let catalog = Arc::new(ProductCatalog::builtin());
        let sink = Arc::new(MockNotificationSink::new());
        let controller = Arc::new(MockInstanceController::new());
        let reconciler = Arc::new(Reconciler::new(
            dyn_store.clone(),
            sink.clone(),
            controller.clone(),
            entitlement,
            notifications,
            4,
        ));

        Self {
            credits: CreditService::new(dyn_store.clone(), Default::default(), None),
            aggregator: UsageAggregator::new(dyn_store.clone(), catalog.clone()),
            gateway: EnforcementGateway::new(dyn_store, catalog),
            store,
            reconciler,
            sink,
            controller,
        }
    }

    pub async fn enroll(&self, id: &str, account_type: AccountType, now: DateTime<Utc>) {
        self.store
            .enroll_account(
                &EnrollAccount {
                    id: Some(id.to_string()),
                    account_type,
                    country_code: "US".to_string(),
                },
                now,
            )
            .await
            .expect("enroll");
    }

    /// Issue a migration credit of `amount` created at `now`.
    pub async fn grant(
        &self,
        id: &str,
        amount: i64,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> CreditGrant {
        self.credits
            .issue_grant(
                IssueGrant {
                    cloud_account_id: id.to_string(),
                    reason: GrantReason::Migration,
                    coupon_code: None,
                    original_amount: Decimal::from(amount),
                    unlimited: false,
                    expires_at,
                },
                now,
            )
            .await
            .expect("issue grant")
    }

    pub async fn unlimited_reserve(
        &self,
        id: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> CreditGrant {
        self.credits
            .issue_grant(
                IssueGrant {
                    cloud_account_id: id.to_string(),
                    reason: GrantReason::CardReserve,
                    coupon_code: None,
                    original_amount: Decimal::ZERO,
                    unlimited: true,
                    expires_at,
                },
                now,
            )
            .await
            .expect("issue card reserve")
    }

    /// Record paid usage worth `credits` at `at`.
    pub async fn usage(&self, id: &str, credits: i64, at: DateTime<Utc>) -> IngestOutcome {
        let record = MeteringRecord {
            transaction_id: Some(Uuid::new_v4().to_string()),
            resource_id: Some("instance-1".to_string()),
            cloud_account_id: Some(id.to_string()),
            timestamp: Some(at),
            product_id: Some(PAID_PRODUCT.to_string()),
            quantity: Some(json!(credits * SECONDS_PER_CREDIT)),
            ..Default::default()
        };
        self.aggregator.ingest(&record, at).await.expect("ingest")
    }
}
