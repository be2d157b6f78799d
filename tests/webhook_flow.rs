use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use coach_integrations::clock::{Clock, ManualClock};
use coach_integrations::store::{BookingStore, EventStore, JsonStore};
use coach_integrations::types::{BookingStatus, EventStatus, Provider};
use coach_integrations::webhook::verification::signed_headers;
use coach_integrations::{router, AppState, Config};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const STRIPE_SECRET: &str = "whsec_integration_test";
const CALCOM_SECRET: &str = "calcom_integration_test";

struct Harness {
    app: Router,
    store: Arc<JsonStore>,
    clock: Arc<ManualClock>,
}

fn harness() -> Harness {
    let config = Config::from_lookup(|key| {
        let value = match key {
            "STATE_SIGNING_SECRET" => "integration-test-state-secret",
            "STRIPE_WEBHOOK_SECRET" => STRIPE_SECRET,
            "STRIPE_SECRET_KEY" => "sk_test_integration",
            "CALCOM_WEBHOOK_SECRET" => CALCOM_SECRET,
            _ => return None,
        };
        Some(value.to_string())
    })
    .unwrap();
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(JsonStore::in_memory());
    let state = AppState::with_store(&config, clock.clone(), store.clone()).unwrap();
    Harness {
        app: router(state),
        store,
        clock,
    }
}

fn signed_request(provider: Provider, secret: &str, body: &[u8], clock: &ManualClock) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(format!("/webhooks/{provider}"))
        .header("content-type", "application/json");
    for (name, value) in signed_headers(provider, body, secret, clock.now()) {
        builder = builder.header(name, value);
    }
    builder.body(Body::from(body.to_vec())).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn stripe_cancellation(event_id: &str, reference: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": event_id,
        "object": "event",
        "type": "BOOKING_CANCELLED",
        "data": {"object": {"metadata": {"booking_reference": reference}}}
    }))
    .unwrap()
}

#[tokio::test]
async fn stripe_cancellation_is_applied_exactly_once() {
    let h = harness();
    let body = stripe_cancellation("evt_cancel_1", "bk_100");

    let (status, response) = send(
        &h.app,
        signed_request(Provider::Stripe, STRIPE_SECRET, &body, &h.clock),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["success"], true);
    assert_eq!(response["status"], "processed");

    let booking = h.store.get_booking("bk_100").await.unwrap().unwrap();
    assert_eq!(booking.status, BookingStatus::Cancelled);
    assert_eq!(booking.revision, 1);
    let event = h
        .store
        .get_event(Provider::Stripe, "evt_cancel_1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.status, EventStatus::Processed);
    assert_eq!(event.attempts, 1);

    let (status, response) = send(
        &h.app,
        signed_request(Provider::Stripe, STRIPE_SECRET, &body, &h.clock),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["success"], true);
    assert_eq!(response["status"], "duplicate");

    let booking = h.store.get_booking("bk_100").await.unwrap().unwrap();
    assert_eq!(booking.revision, 1, "redelivery must not update the booking");
}

#[tokio::test]
async fn delayed_created_after_cancel_keeps_booking_cancelled() {
    let h = harness();
    let cancel = serde_json::to_vec(&json!({
        "triggerEvent": "BOOKING_CANCELLED",
        "createdAt": "2026-05-01T10:05:00Z",
        "payload": {"uid": "cal_77"}
    }))
    .unwrap();
    let created = serde_json::to_vec(&json!({
        "triggerEvent": "BOOKING_CREATED",
        "createdAt": "2026-05-01T10:00:00Z",
        "payload": {"uid": "cal_77", "startTime": "2026-05-10T09:00:00Z"}
    }))
    .unwrap();

    for body in [&cancel, &created] {
        let (status, _) = send(
            &h.app,
            signed_request(Provider::Calcom, CALCOM_SECRET, body, &h.clock),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let booking = h.store.get_booking("cal_77").await.unwrap().unwrap();
    assert_eq!(booking.status, BookingStatus::Cancelled);
}

#[tokio::test]
async fn bad_signature_is_unauthorized_and_not_recorded() {
    let h = harness();
    let body = stripe_cancellation("evt_forged", "bk_200");

    let (status, response) = send(
        &h.app,
        signed_request(Provider::Stripe, "whsec_wrong", &body, &h.clock),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(response["error"], "invalid_signature");
    assert!(h
        .store
        .get_event(Provider::Stripe, "evt_forged")
        .await
        .unwrap()
        .is_none());

    let unsigned = Request::builder()
        .method("POST")
        .uri("/webhooks/stripe")
        .body(Body::from(body))
        .unwrap();
    let (status, _) = send(&h.app, unsigned).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn stale_signature_is_rejected() {
    let h = harness();
    let body = stripe_cancellation("evt_old", "bk_300");
    let request = signed_request(Provider::Stripe, STRIPE_SECRET, &body, &h.clock);
    h.clock.advance(chrono::Duration::minutes(10));

    let (status, _) = send(&h.app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn malformed_payload_is_bad_request() {
    let h = harness();
    let body = br#"{"type": "charge.refunded"}"#;
    let (status, response) = send(
        &h.app,
        signed_request(Provider::Stripe, STRIPE_SECRET, body, &h.clock),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["error"], "malformed_payload");
}

#[tokio::test]
async fn unknown_event_types_are_acknowledged() {
    let h = harness();
    let body = serde_json::to_vec(&json!({
        "id": "evt_customer",
        "type": "customer.created",
        "data": {"object": {}}
    }))
    .unwrap();
    let (status, response) = send(
        &h.app,
        signed_request(Provider::Stripe, STRIPE_SECRET, &body, &h.clock),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["status"], "ignored");
}

#[tokio::test]
async fn unknown_or_unconfigured_providers_are_not_found() {
    let h = harness();
    let body = b"{}";

    let unknown = Request::builder()
        .method("POST")
        .uri("/webhooks/paypal")
        .body(Body::from(body.to_vec()))
        .unwrap();
    let (status, response) = send(&h.app, unknown).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(response["error"], "unknown_provider");

    let (status, _) = send(
        &h.app,
        signed_request(Provider::Zoom, "anything", body, &h.clock),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_and_circuit_status() {
    let h = harness();
    let (status, body) = send(
        &h.app,
        Request::builder().uri("/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = send(
        &h.app,
        Request::builder()
            .uri("/admin/circuits")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let circuits = body["circuits"].as_array().unwrap();
    assert_eq!(circuits.len(), Provider::ALL.len());
    assert!(circuits.iter().all(|c| c["state"] == "closed"));
}
