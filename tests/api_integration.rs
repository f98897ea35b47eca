//! Integration tests for the REST API feature.

#![cfg(feature = "api")]

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::util::ServiceExt;

use common::Harness;
use fleet_ems::api::{AppState, router};
use fleet_ems::fleet::AllocationMode;

fn post(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json(resp: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn dispatch_round_trip_reaches_running() {
    let mut h = Harness::s9_pair(AllocationMode::Frequency).await;
    let app = router(Arc::new(AppState {
        arbiter: Arc::clone(&h.arbiter),
    }));

    let resp = app
        .clone()
        .oneshot(post("/api/activate", r#"{"activationPowerInKw": 2.0}"#))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json(resp).await;
    assert_eq!(body["accepted"], true);
    // Only the two dispatch fields cross the boundary.
    assert_eq!(body.as_object().unwrap().len(), 2);

    h.cycles(2).await;
    let status = json(app.clone().oneshot(get("/api/status")).await.unwrap()).await;
    assert_eq!(status["runningStatus"], 2);
    assert!((status["activePowerInKw"].as_f64().unwrap() - 2.0).abs() < 0.05);

    let resp = app
        .clone()
        .oneshot(post("/api/deactivate", "{}"))
        .await
        .unwrap();
    assert_eq!(json(resp).await["accepted"], true);
    h.cycles(1).await;
    let status = json(app.oneshot(get("/api/status")).await.unwrap()).await;
    assert_eq!(status["runningStatus"], 1);
}

#[tokio::test]
async fn fleet_view_lists_devices() {
    let h = Harness::s9_pair(AllocationMode::OnOff).await;
    let app = router(Arc::new(AppState {
        arbiter: Arc::clone(&h.arbiter),
    }));

    let fleet = json(app.oneshot(get("/api/fleet")).await.unwrap()).await;
    assert_eq!(fleet["phase"], "standby");
    assert_eq!(fleet["onlineDevices"], 2);
    assert_eq!(fleet["configVersion"], 1);
    let devices = fleet["devices"].as_array().unwrap();
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0]["address"], "10.0.0.1");
}

#[tokio::test]
async fn no_devices_maps_to_503() {
    let mut h = Harness::with_events(fleet_ems::config::FleetConfig::default(), Vec::new());
    h.cycles(1).await;
    let app = router(Arc::new(AppState {
        arbiter: Arc::clone(&h.arbiter),
    }));

    let resp = app
        .oneshot(post("/api/activate", r#"{"activationPowerInKw": 1.0}"#))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json(resp).await["accepted"], false);
}

#[tokio::test]
async fn fault_maps_to_409() {
    let mut h = Harness::s9_pair(AllocationMode::Frequency).await;
    h.control.set_unreachable("10.0.0.1", true);
    h.control.set_unreachable("10.0.0.2", true);
    h.cycles(3).await;
    let app = router(Arc::new(AppState {
        arbiter: Arc::clone(&h.arbiter),
    }));

    let status = json(app.clone().oneshot(get("/api/status")).await.unwrap()).await;
    assert_eq!(status["isAvailableForDispatch"], false);
    let resp = app
        .oneshot(post("/api/activate", r#"{"activationPowerInKw": 1.0}"#))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn apply_and_device_control_return_operator_details() {
    let h = Harness::s9_pair(AllocationMode::Frequency).await;
    let app = router(Arc::new(AppState {
        arbiter: Arc::clone(&h.arbiter),
    }));

    let resp = app
        .clone()
        .oneshot(post(
            "/api/apply",
            r#"{"targetPowerKw": 1.46, "mode": "on_off"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json(resp).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["plan"]["summary"]["full_count"], 1);

    let resp = app
        .oneshot(post("/api/devices/10.0.0.1/control", r#"{"action": "stop"}"#))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(!h.control.is_mining("10.0.0.1"));
}
