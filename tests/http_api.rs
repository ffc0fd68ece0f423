//! The HTTP surface: JSON envelopes and error-taxonomy status codes.

mod common;

use std::sync::Arc;

use actix_web::{test, web, App};
use serde_json::{json, Value};

use rounds::alerts::CriticalAlertEngine;
use rounds::api::{self, AppState};
use rounds::config::WebSocketConfig;
use rounds::consult::ConsultationService;
use rounds::models::{AbnormalFlag, StaffId};
use rounds::store::{EntityStore, MemoryStore, ScopeFilter};
use rounds::sync::{SyncConfig, SyncEngine};

async fn app_state() -> (Arc<MemoryStore>, web::Data<AppState>) {
    let store = Arc::new(MemoryStore::new());
    let dyn_store: Arc<dyn EntityStore> = store.clone();
    let sync = SyncEngine::new(dyn_store.clone(), SyncConfig::default());
    let alerts = CriticalAlertEngine::attach(&sync, ScopeFilter::all())
        .await
        .unwrap();
    let state = web::Data::new(AppState {
        store: dyn_store,
        consultations: ConsultationService::new(store.clone()),
        alerts,
        websocket: WebSocketConfig::default(),
    });
    (store, state)
}

#[actix_web::test]
async fn consultation_flow_over_http() {
    let (_store, state) = app_state().await;
    let app = test::init_service(
        App::new()
            .app_data(state.clone())
            .configure(api::configure),
    )
    .await;

    // Register a patient.
    let req = test::TestRequest::post()
        .uri("/api/patients")
        .set_json(json!({
            "mrn": "MRN-50",
            "first_name": "Lena",
            "last_name": "Varga",
            "date_of_birth": "1979-02-08",
            "practice_code": "P01",
            "visit_type": "walk_in",
            "visit_reason": "dizziness"
        }))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["success"], true);
    let patient_id = body["patient"]["id"].as_str().unwrap().to_string();

    // First doctor claims successfully.
    let doctor_a = StaffId::new();
    let req = test::TestRequest::post()
        .uri("/api/consultations/start")
        .set_json(json!({ "patient_id": patient_id, "doctor_id": doctor_a }))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["already_mine"], false);

    // Second doctor gets a 409 with the error envelope.
    let req = test::TestRequest::post()
        .uri("/api/consultations/start")
        .set_json(json!({ "patient_id": patient_id, "doctor_id": StaffId::new() }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("another doctor"));

    // The waiting board is now empty.
    let req = test::TestRequest::get()
        .uri("/api/queue?practice=P01")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["queue"].as_array().unwrap().len(), 0);

    // Completion by the holder succeeds.
    let req = test::TestRequest::post()
        .uri("/api/consultations/complete")
        .set_json(json!({ "patient_id": patient_id, "doctor_id": doctor_a }))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["patient"]["consultation_status"], "served");
}

#[actix_web::test]
async fn alert_surface_over_http() {
    let (store, state) = app_state().await;
    let app = test::init_service(
        App::new()
            .app_data(state.clone())
            .configure(api::configure),
    )
    .await;

    let patient = store
        .insert_patient(common::registered("P01", "MRN-51"))
        .await
        .unwrap();
    let result = store
        .insert_lab_result(common::lab_result(
            "P01",
            &patient.id,
            AbnormalFlag::Critical,
        ))
        .await
        .unwrap();

    assert!(
        common::eventually(|| async {
            state.alerts.unacknowledged().await.len() == 1
        })
        .await
    );

    // Scoped listing: present in P01, absent in P02.
    let req = test::TestRequest::get()
        .uri("/api/alerts?practice=P01")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    let alerts = body["alerts"].as_array().unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0]["state"], "unacknowledged_critical");

    let req = test::TestRequest::get()
        .uri("/api/alerts?practice=P02")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["alerts"].as_array().unwrap().len(), 0);

    // A blank note is rejected with 422 before any state changes.
    let req = test::TestRequest::post()
        .uri(&format!("/api/lab-results/{}/acknowledge", result.id))
        .set_json(json!({ "staff_id": StaffId::new(), "note": "" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 422);

    // A proper acknowledgment clears the alert.
    let req = test::TestRequest::post()
        .uri(&format!("/api/lab-results/{}/acknowledge", result.id))
        .set_json(json!({ "staff_id": StaffId::new(), "note": "registrar reviewed" }))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["lab_result"]["critical_acknowledged"], true);

    let req = test::TestRequest::get()
        .uri("/api/alerts?practice=P01")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["alerts"].as_array().unwrap().len(), 0);
}

#[actix_web::test]
async fn unknown_lab_result_is_404() {
    let (_store, state) = app_state().await;
    let app = test::init_service(
        App::new()
            .app_data(state.clone())
            .configure(api::configure),
    )
    .await;

    let req = test::TestRequest::post()
        .uri(&format!(
            "/api/lab-results/{}/acknowledge",
            rounds::models::LabResultId::new()
        ))
        .set_json(json!({ "staff_id": StaffId::new(), "note": "n/a" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}
