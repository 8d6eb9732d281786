//! Cloud account enrollment tests.

mod common;

use common::{spawn_app, unique_account_id};
use serde_json::{json, Value};

#[tokio::test]
async fn enrolled_account_starts_with_all_flags_cleared() {
    let app = spawn_app().await;
    let id = app.enroll("premium").await;

    let account = app.account(&id).await;
    assert_eq!(account["type"], "premium");
    assert_eq!(account["countryCode"], "US");
    assert_eq!(account["paidServicesAllowed"], false);
    assert_eq!(account["lowCredits"], false);
    assert_eq!(account["terminatePaidServices"], false);
    assert!(account["creditsDepleted"].is_null());
}

#[tokio::test]
async fn enrollment_generates_an_id_when_none_is_given() {
    let app = spawn_app().await;

    let response = app
        .post(
            "/v1/cloudaccounts",
            json!({ "type": "standard", "countryCode": "de" }),
        )
        .await;
    assert_eq!(response.status().as_u16(), 201);

    let body: Value = response.json().await.unwrap();
    let id = body["cloudAccountId"].as_str().unwrap();
    assert_eq!(id.len(), 12);
    assert_eq!(body["countryCode"], "DE");
}

#[tokio::test]
async fn re_enrollment_keeps_the_account() {
    let app = spawn_app().await;
    let id = unique_account_id();
    let body = json!({ "cloudAccountId": id, "type": "enterprise", "countryCode": "US" });

    let first: Value = app.post("/v1/cloudaccounts", body.clone()).await.json().await.unwrap();
    let second = app.post("/v1/cloudaccounts", body).await;
    assert_eq!(second.status().as_u16(), 201);
    let second: Value = second.json().await.unwrap();

    assert_eq!(first["created"], second["created"]);
}

#[tokio::test]
async fn unknown_account_is_not_found() {
    let app = spawn_app().await;

    let response = app.get("/v1/cloudaccounts/000000000000").await;
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn enrollment_validates_the_request() {
    let app = spawn_app().await;

    let bad_country = app
        .post(
            "/v1/cloudaccounts",
            json!({ "type": "standard", "countryCode": "USA" }),
        )
        .await;
    assert_eq!(bad_country.status().as_u16(), 422);

    let bad_type = app
        .post(
            "/v1/cloudaccounts",
            json!({ "type": "platinum", "countryCode": "US" }),
        )
        .await;
    assert!(bad_type.status().is_client_error());
}
