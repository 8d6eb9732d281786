//! Coupon lifecycle and redemption tests.

mod common;

use chrono::{Duration, Utc};
use common::{at, dec, spawn_app, TestLedger};
use credit_service::models::{AccountType, CreateCoupon};
use credit_service::services::RedeemError;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::sync::Arc;

async fn create_coupon(app: &common::TestApp, body: Value) -> Value {
    let response = app.post("/v1/coupons", body).await;
    assert_eq!(response.status().as_u16(), 201);
    response.json().await.unwrap()
}

async fn redeem(app: &common::TestApp, code: &str, account: &str) -> reqwest::Response {
    app.post(
        "/v1/coupons/redeem",
        json!({ "code": code, "cloudAccountId": account }),
    )
    .await
}

async fn error_code(response: reqwest::Response) -> String {
    let body: Value = response.json().await.unwrap();
    body["code"].as_str().unwrap_or_default().to_string()
}

#[tokio::test]
async fn create_coupon_generates_a_formatted_code() {
    let app = spawn_app().await;

    let coupon = create_coupon(
        &app,
        json!({ "amount": "150", "numUses": 1, "creator": "ops@example.com" }),
    )
    .await;

    let code = coupon["code"].as_str().unwrap();
    assert_eq!(code.len(), 14);
    assert!(code
        .split('-')
        .all(|g| g.len() == 4 && g.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())));
    assert_eq!(dec(&coupon["amount"]), Decimal::from(150));
    assert_eq!(coupon["numRedeemed"], 0);
    assert_eq!(coupon["isStandard"], true);
}

#[tokio::test]
async fn create_coupon_validates_input() {
    let app = spawn_app().await;

    let bad_creator = app
        .post(
            "/v1/coupons",
            json!({ "amount": "10", "numUses": 1, "creator": "not-an-email" }),
        )
        .await;
    assert_eq!(bad_creator.status().as_u16(), 422);

    let zero_amount = app
        .post(
            "/v1/coupons",
            json!({ "amount": "0", "numUses": 1, "creator": "ops@example.com" }),
        )
        .await;
    assert_eq!(zero_amount.status().as_u16(), 400);

    let too_many_uses = app
        .post(
            "/v1/coupons",
            json!({ "amount": "10", "numUses": 2, "creator": "ops@example.com", "isStandard": true }),
        )
        .await;
    assert_eq!(too_many_uses.status().as_u16(), 400);

    let past_expiry = app
        .post(
            "/v1/coupons",
            json!({
                "amount": "10",
                "numUses": 1,
                "creator": "ops@example.com",
                "expires": Utc::now() - Duration::days(1),
            }),
        )
        .await;
    assert_eq!(past_expiry.status().as_u16(), 400);
}

#[tokio::test]
async fn redemption_creates_a_grant_and_restores_paid_access() {
    let app = spawn_app().await;
    let account = app.enroll("standard").await;
    let coupon = create_coupon(
        &app,
        json!({ "amount": "25", "numUses": 1, "creator": "ops@example.com" }),
    )
    .await;
    let code = coupon["code"].as_str().unwrap();

    let response = redeem(&app, code, &account).await;
    assert_eq!(response.status().as_u16(), 201);
    let grant: Value = response.json().await.unwrap();
    assert_eq!(grant["reason"], "COUPON");
    assert_eq!(grant["couponCode"], code);
    assert_eq!(dec(&grant["originalAmount"]), Decimal::from(25));
    assert_eq!(grant["expiration"], coupon["expires"]);

    let detail: Value = app
        .get(&format!("/v1/coupons/{}", code))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(detail["numRedeemed"], 1);
    assert_eq!(detail["redemptions"][0]["cloudAccountId"], account.as_str());

    let reconciled = app.reconcile(&account).await;
    assert_eq!(reconciled["state"], "HEALTHY");
    assert_eq!(app.account(&account).await["paidServicesAllowed"], true);
}

#[tokio::test]
async fn second_redemption_by_the_same_account_is_rejected() {
    let app = spawn_app().await;
    let account = app.enroll("premium").await;
    let coupon = create_coupon(
        &app,
        json!({ "amount": "10", "numUses": 5, "creator": "ops@example.com", "isStandard": false }),
    )
    .await;
    let code = coupon["code"].as_str().unwrap();

    assert_eq!(redeem(&app, code, &account).await.status().as_u16(), 201);

    let again = redeem(&app, code, &account).await;
    assert_eq!(again.status().as_u16(), 409);
    assert_eq!(error_code(again).await, "ALREADY_REDEEMED");
}

#[tokio::test]
async fn redemption_rejections_carry_stable_codes() {
    let app = spawn_app().await;
    let standard = app.enroll("standard").await;
    let premium = app.enroll("premium").await;

    let malformed = redeem(&app, "not-a-code", &standard).await;
    assert_eq!(malformed.status().as_u16(), 404);
    assert_eq!(error_code(malformed).await, "INVALID_COUPON");

    let unknown = redeem(&app, "AAAA-BBBB-CCCC", &standard).await;
    assert_eq!(unknown.status().as_u16(), 404);
    assert_eq!(error_code(unknown).await, "INVALID_COUPON");

    let standard_coupon = create_coupon(
        &app,
        json!({ "amount": "10", "numUses": 1, "creator": "ops@example.com" }),
    )
    .await;
    let code = standard_coupon["code"].as_str().unwrap();

    let no_account = redeem(&app, code, "999999999999").await;
    assert_eq!(no_account.status().as_u16(), 404);
    assert_eq!(error_code(no_account).await, "ACCOUNT_NOT_FOUND");

    let mismatch = redeem(&app, code, &premium).await;
    assert_eq!(mismatch.status().as_u16(), 422);
    assert_eq!(error_code(mismatch).await, "COUPON_ACCOUNT_TYPE_MISMATCH");

    let future = create_coupon(
        &app,
        json!({
            "amount": "10",
            "numUses": 1,
            "creator": "ops@example.com",
            "start": Utc::now() + Duration::days(1),
        }),
    )
    .await;
    let not_started = redeem(&app, future["code"].as_str().unwrap(), &standard).await;
    assert_eq!(not_started.status().as_u16(), 422);
    assert_eq!(error_code(not_started).await, "COUPON_NOT_STARTED");

    let disabled = app
        .post(&format!("/v1/coupons/{}/disable", code), json!({}))
        .await;
    assert_eq!(disabled.status().as_u16(), 204);
    let rejected = redeem(&app, code, &standard).await;
    assert_eq!(rejected.status().as_u16(), 422);
    assert_eq!(error_code(rejected).await, "COUPON_DISABLED");
}

#[tokio::test]
async fn exhausted_coupon_is_rejected() {
    let app = spawn_app().await;
    let first = app.enroll("enterprise").await;
    let second = app.enroll("enterprise").await;
    let coupon = create_coupon(
        &app,
        json!({ "amount": "10", "numUses": 1, "creator": "ops@example.com", "isStandard": false }),
    )
    .await;
    let code = coupon["code"].as_str().unwrap();

    assert_eq!(redeem(&app, code, &first).await.status().as_u16(), 201);

    let exhausted = redeem(&app, code, &second).await;
    assert_eq!(exhausted.status().as_u16(), 409);
    assert_eq!(error_code(exhausted).await, "COUPON_EXHAUSTED");
}

#[tokio::test]
async fn expired_coupon_is_rejected() {
    let ledger = TestLedger::new();
    let t0 = at("2024-05-01T00:00:00Z");
    ledger.enroll("100000000001", AccountType::Standard, t0).await;

    let coupon = ledger
        .credits
        .create_coupon(
            CreateCoupon {
                amount: Decimal::from(10),
                num_uses: 1,
                creator: "ops@example.com".into(),
                start: None,
                expires: Some(t0 + Duration::days(1)),
                is_standard: true,
            },
            t0,
        )
        .await
        .unwrap();

    let result = ledger
        .credits
        .redeem(&coupon.code, "100000000001", t0 + Duration::days(1))
        .await;
    assert!(matches!(result, Err(RedeemError::Expired)));

    let grant = ledger
        .credits
        .redeem(&coupon.code, "100000000001", t0 + Duration::hours(23))
        .await
        .unwrap();
    assert_eq!(grant.expires_at, coupon.expires);
}

#[tokio::test]
async fn concurrent_redemptions_never_exceed_num_uses() {
    let ledger = Arc::new(TestLedger::new());
    let t0 = at("2024-05-01T00:00:00Z");
    let accounts: Vec<String> = (0..10).map(|i| format!("2000000000{:02}", i)).collect();
    for id in &accounts {
        ledger.enroll(id, AccountType::Premium, t0).await;
    }

    let coupon = ledger
        .credits
        .create_coupon(
            CreateCoupon {
                amount: Decimal::from(5),
                num_uses: 3,
                creator: "ops@example.com".into(),
                start: None,
                expires: None,
                is_standard: false,
            },
            t0,
        )
        .await
        .unwrap();

    let mut handles = Vec::new();
    for id in accounts {
        let ledger = ledger.clone();
        let code = coupon.code.clone();
        handles.push(tokio::spawn(async move {
            ledger.credits.redeem(&code, &id, t0).await
        }));
    }

    let mut redeemed = 0;
    let mut exhausted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => redeemed += 1,
            Err(RedeemError::Exhausted) => exhausted += 1,
            Err(other) => panic!("unexpected rejection: {}", other),
        }
    }

    assert_eq!(redeemed, 3);
    assert_eq!(exhausted, 7);
    let (stored, redemptions) = ledger.credits.get_coupon(&coupon.code).await.unwrap();
    assert_eq!(stored.num_redeemed, 3);
    assert_eq!(redemptions.len(), 3);
}
