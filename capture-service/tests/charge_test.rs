mod common;

use capture_service::models::amounts_equal;
use capture_service::services::paypal::GatewayError;
use common::{approved_order, authorized, completed_capture, TestApp};
use serde_json::json;

#[tokio::test]
async fn checkout_authorize_creates_reservation() {
    let app = TestApp::spawn().await;
    app.gateway.add_order(approved_order("5ORDER-CK1", 180.0));
    app.gateway
        .authorize_results
        .lock()
        .unwrap()
        .push_back(Ok(authorized("3AUTH-CK1", 180.0)));

    let response = app
        .client
        .post(format!("{}/checkout", app.address))
        .json(&json!({
            "order_id": "5ORDER-CK1",
            "mode": "authorize",
            "expected_amount": 180.0,
            "currency": "EUR",
            "capture_limit": 400.0
        }))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status().as_u16(), 201);
    let body: serde_json::Value = response.json().await.unwrap();
    let reservation_id = body["reservation_id"].as_str().unwrap();
    assert!(reservation_id.starts_with("HTL-"));
    assert_eq!(body["ledger"]["capture_limit"], 400.0);
    assert_eq!(body["ledger"]["captured_total"], 0.0);
    assert_eq!(body["ledger"]["authorization"]["status"], "AUTHORIZED");

    let ledger = app.ledger(reservation_id).await;
    assert!(amounts_equal(ledger.captured_total, 0.0));
}

#[tokio::test]
async fn checkout_rejects_order_amount_mismatch() {
    let app = TestApp::spawn().await;
    app.gateway.add_order(approved_order("5ORDER-CK2", 150.0));

    let response = app
        .client
        .post(format!("{}/checkout", app.address))
        .json(&json!({
            "order_id": "5ORDER-CK2",
            "mode": "authorize",
            "expected_amount": 180.0,
            "currency": "EUR"
        }))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn charge_captures_against_live_authorization() {
    let app = TestApp::spawn().await;
    app.seed_ledger_with_auth("HTL-CHG1", 300.0, 200.0).await;
    app.gateway
        .capture_auth_results
        .lock()
        .unwrap()
        .push_back(Ok(completed_capture("2CAP-CHG1", 60.0)));

    let response = app
        .client
        .post(format!("{}/charge", app.address))
        .json(&json!({
            "reservation_id": "HTL-CHG1",
            "amount": 60.0,
            "currency": "EUR"
        }))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["capture_id"], "2CAP-CHG1");
    assert_eq!(body["via"], "AUTH_CAPTURE");
    assert_eq!(body["ledger"]["captured_total"], 60.0);
    assert_eq!(body["ledger"]["pending_total"], 0.0);

    let ledger = app.ledger("HTL-CHG1").await;
    assert_eq!(ledger.capture_history.len(), 1);
}

#[tokio::test]
async fn charge_over_capacity_is_rejected_without_gateway_call() {
    let app = TestApp::spawn().await;
    app.seed_ledger_with_auth("HTL-CHG2", 100.0, 100.0).await;

    let response = app
        .client
        .post(format!("{}/charge", app.address))
        .json(&json!({
            "reservation_id": "HTL-CHG2",
            "amount": 150.0,
            "currency": "EUR"
        }))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status().as_u16(), 402);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("capture capacity"));

    // No capture attempt was consumed.
    assert!(app.gateway.capture_auth_results.lock().unwrap().is_empty());
    let ledger = app.ledger("HTL-CHG2").await;
    assert!(amounts_equal(ledger.pending_total, 0.0));
}

#[tokio::test]
async fn declined_charge_releases_reserved_capacity() {
    let app = TestApp::spawn().await;
    app.seed_ledger_with_auth("HTL-CHG3", 300.0, 200.0).await;
    app.gateway
        .capture_auth_results
        .lock()
        .unwrap()
        .push_back(Err(GatewayError::Declined {
            code: "INSTRUMENT_DECLINED".to_string(),
            message: "declined".to_string(),
        }));

    let response = app
        .client
        .post(format!("{}/charge", app.address))
        .json(&json!({
            "reservation_id": "HTL-CHG3",
            "amount": 60.0,
            "currency": "EUR"
        }))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status().as_u16(), 402);

    let ledger = app.ledger("HTL-CHG3").await;
    assert!(amounts_equal(ledger.pending_total, 0.0));
    assert!(ledger.capture_history.is_empty());
}

#[tokio::test]
async fn charge_for_unknown_reservation_is_404() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .post(format!("{}/charge", app.address))
        .json(&json!({
            "reservation_id": "HTL-NOPE",
            "amount": 60.0,
            "currency": "EUR"
        }))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn charge_with_invalid_amount_is_422() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .post(format!("{}/charge", app.address))
        .json(&json!({
            "reservation_id": "HTL-CHG4",
            "amount": 0.0,
            "currency": "EUR"
        }))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status().as_u16(), 422);
}

#[tokio::test]
async fn link_pay_capture_settles_into_ledger() {
    let app = TestApp::spawn().await;
    app.seed_ledger_with_auth("HTL-LINK1", 300.0, 200.0).await;
    app.gateway.add_order(approved_order("5ORDER-LINK1", 80.0));
    app.gateway
        .capture_order_results
        .lock()
        .unwrap()
        .push_back(Ok(completed_capture("2CAP-LINK1", 80.0)));

    let response = app
        .client
        .post(format!("{}/link-pay", app.address))
        .json(&json!({
            "reservation_id": "HTL-LINK1",
            "order_id": "5ORDER-LINK1",
            "mode": "capture",
            "amount": 80.0,
            "currency": "EUR"
        }))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["capture_id"], "2CAP-LINK1");
    assert_eq!(body["ledger"]["captures"][0]["via"], "LINK_CAPTURE");

    let ledger = app.ledger("HTL-LINK1").await;
    assert!(amounts_equal(ledger.captured_total, 80.0));
    assert!(amounts_equal(ledger.pending_total, 0.0));
}
