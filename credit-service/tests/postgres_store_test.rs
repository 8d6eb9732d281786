//! Postgres ledger store tests. Require TEST_DATABASE_URL.

mod common;

use chrono::{Duration, Utc};
use common::{at, init_tracing, unique_account_id};
use credit_service::models::{
    AccountFlags, AccountType, CreateCoupon, CreditGrant, EnrollAccount, GrantReason, Instance,
    InstanceState, InvalidMeteringRecord, InvalidRecordFilter, InvalidityReason, IssueGrant,
    MeteringRecord, RedeemOutcome, UsageEntry,
};
use credit_service::services::{CreditService, Database, LedgerStore};
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

async fn store() -> Arc<Database> {
    init_tracing();
    dotenvy::dotenv().ok();
    let database_url = std::env::var("TEST_DATABASE_URL")
        .expect("TEST_DATABASE_URL must be set to run Postgres store tests");
    let db = Database::new(&database_url, 4, 1)
        .await
        .expect("Failed to connect to database");
    db.run_migrations().await.expect("Failed to run migrations");
    Arc::new(db)
}

async fn enroll(db: &Database, account_type: AccountType) -> String {
    let account = db
        .enroll_account(
            &EnrollAccount {
                id: Some(unique_account_id()),
                account_type,
                country_code: "US".to_string(),
            },
            Utc::now(),
        )
        .await
        .unwrap();
    account.id
}

fn grant(account: &str, amount: i64, expires_in_days: i64) -> CreditGrant {
    let now = at("2024-05-01T00:00:00Z");
    CreditGrant::new(
        IssueGrant {
            cloud_account_id: account.to_string(),
            reason: GrantReason::Migration,
            coupon_code: None,
            original_amount: Decimal::from(amount),
            unlimited: false,
            expires_at: now + Duration::days(expires_in_days),
        },
        now,
    )
}

#[tokio::test]
#[ignore] // Requires database
async fn accounts_round_trip_with_flags() {
    let db = store().await;
    let id = enroll(&db, AccountType::Premium).await;

    let account = db.get_account(&id).await.unwrap().unwrap();
    assert_eq!(account.account_type, AccountType::Premium);
    assert_eq!(account.flags, AccountFlags::default());
    assert!(!account.was_ever_depleted());

    let depleted_at = at("2024-06-01T12:00:00Z");
    let flags = AccountFlags {
        paid_services_allowed: false,
        low_credits: true,
        terminate_paid_services: true,
        credits_depleted: depleted_at,
    };
    db.update_account_flags(&id, &flags).await.unwrap();
    assert_eq!(db.get_account(&id).await.unwrap().unwrap().flags, flags);

    assert!(db
        .update_account_flags("000000000000", &flags)
        .await
        .is_err());

    // Re-enrollment keeps the account and resets the latch.
    let mut latch = db.get_notification_state(&id).await.unwrap().unwrap();
    latch.threshold80_sent = true;
    db.save_notification_state(&id, &latch).await.unwrap();
    db.enroll_account(
        &EnrollAccount {
            id: Some(id.clone()),
            account_type: AccountType::Standard,
            country_code: "US".to_string(),
        },
        Utc::now(),
    )
    .await
    .unwrap();
    let again = db.get_account(&id).await.unwrap().unwrap();
    assert_eq!(again.account_type, AccountType::Premium);
    assert!(!db.get_notification_state(&id).await.unwrap().unwrap().threshold80_sent);
}

#[tokio::test]
#[ignore] // Requires database
async fn grants_are_listed_earliest_expiry_first() {
    let db = store().await;
    let id = enroll(&db, AccountType::Standard).await;

    let late = grant(&id, 10, 60);
    let early = grant(&id, 15, 30);
    db.insert_grant(&late).await.unwrap();
    db.insert_grant(&early).await.unwrap();

    let grants = db.list_grants(&id).await.unwrap();
    assert_eq!(grants.len(), 2);
    assert_eq!(grants[0].id, early.id);
    assert_eq!(grants[0].original_amount, Decimal::from(15));
    assert!(db.list_ledger_accounts().await.unwrap().contains(&id));
}

#[tokio::test]
#[ignore] // Requires database
async fn usage_is_deduplicated_by_resource_and_transaction() {
    let db = store().await;
    let id = enroll(&db, AccountType::Standard).await;
    let transaction_id = Uuid::new_v4().to_string();

    let entry = UsageEntry {
        id: Uuid::new_v4(),
        cloud_account_id: id.clone(),
        transaction_id: transaction_id.clone(),
        resource_id: "instance-1".to_string(),
        product_id: "vm-spr-sml".to_string(),
        product_type: "compute-vm".to_string(),
        timestamp: at("2024-05-01T01:00:00Z"),
        running_seconds: Decimal::from(1000),
        rate: Decimal::new(360, 2),
        amount: Decimal::ONE,
    };

    assert!(db.insert_usage_if_absent(&entry).await.unwrap());
    let replay = UsageEntry {
        id: Uuid::new_v4(),
        amount: Decimal::from(50),
        ..entry.clone()
    };
    assert!(!db.insert_usage_if_absent(&replay).await.unwrap());
    assert!(db.has_transaction("instance-1", &transaction_id).await.unwrap());

    let usage = db.list_usage(&id).await.unwrap();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].amount, Decimal::ONE);
}

#[tokio::test]
#[ignore] // Requires database
async fn invalid_records_are_filterable() {
    let db = store().await;
    let id = unique_account_id();
    let transaction_id = Uuid::new_v4().to_string();

    let record = MeteringRecord {
        transaction_id: Some(transaction_id.clone()),
        cloud_account_id: Some(id.clone()),
        quantity: Some(serde_json::json!("abc")),
        ..Default::default()
    };
    db.insert_invalid_record(&InvalidMeteringRecord::from_record(
        &record,
        InvalidityReason::MissingResourceName,
        Utc::now(),
    ))
    .await
    .unwrap();

    let found = db
        .list_invalid_records(&InvalidRecordFilter {
            cloud_account_id: Some(id),
            transaction_id: None,
        })
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].reason, InvalidityReason::MissingResourceName);
    assert_eq!(found[0].quantity.as_deref(), Some("abc"));
    assert_eq!(found[0].transaction_id.as_deref(), Some(transaction_id.as_str()));
}

#[tokio::test]
#[ignore] // Requires database
async fn concurrent_redemptions_respect_the_use_limit() {
    let db = store().await;
    let dyn_store: Arc<dyn LedgerStore> = db.clone();
    let credits = CreditService::new(dyn_store, Default::default(), None);
    let now = Utc::now();

    let coupon = credits
        .create_coupon(
            CreateCoupon {
                amount: Decimal::from(20),
                num_uses: 3,
                creator: "ops@example.com".to_string(),
                start: None,
                expires: None,
                is_standard: false,
            },
            now,
        )
        .await
        .unwrap();

    let mut accounts = Vec::new();
    for _ in 0..8 {
        accounts.push(enroll(&db, AccountType::Premium).await);
    }

    let handles: Vec<_> = accounts
        .iter()
        .map(|id| {
            let credits = credits.clone();
            let code = coupon.code.clone();
            let id = id.clone();
            tokio::spawn(async move { credits.redeem(&code, &id, Utc::now()).await })
        })
        .collect();

    let mut redeemed = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            redeemed += 1;
        }
    }
    assert_eq!(redeemed, 3);

    let stored = db.get_coupon(&coupon.code).await.unwrap().unwrap();
    assert_eq!(stored.num_redeemed, 3);
    assert_eq!(db.list_redemptions(&coupon.code).await.unwrap().len(), 3);

    // A repeat through the store is rejected without writing anything.
    let first = &db.list_redemptions(&coupon.code).await.unwrap()[0];
    let repeat = CreditGrant::new(
        IssueGrant {
            cloud_account_id: first.cloud_account_id.clone(),
            reason: GrantReason::Coupon,
            coupon_code: Some(coupon.code.clone()),
            original_amount: coupon.amount,
            unlimited: false,
            expires_at: coupon.expires,
        },
        now,
    );
    assert_eq!(
        db.redeem_coupon(&coupon.code, &repeat, now).await.unwrap(),
        RedeemOutcome::AlreadyRedeemed
    );
}

#[tokio::test]
#[ignore] // Requires database
async fn instances_are_terminated_once() {
    let db = store().await;
    let id = enroll(&db, AccountType::Standard).await;
    let instance_id = format!("i-{}", Uuid::new_v4());
    let now = at("2024-05-01T00:00:00Z");

    db.upsert_instance(&Instance {
        id: instance_id.clone(),
        cloud_account_id: id.clone(),
        product_id: "vm-spr-sml".to_string(),
        paid: true,
        state: InstanceState::Running,
        created_at: now,
        terminated_at: None,
    })
    .await
    .unwrap();
    assert!(db
        .list_running_paid_instances()
        .await
        .unwrap()
        .iter()
        .any(|i| i.id == instance_id));

    let first = now + Duration::hours(1);
    db.mark_instance_terminated(&instance_id, first).await.unwrap();
    db.mark_instance_terminated(&instance_id, now + Duration::hours(2))
        .await
        .unwrap();

    let instances = db.list_instances(&id).await.unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].state, InstanceState::Terminated);
    assert_eq!(instances[0].terminated_at, Some(first));
}
