use actix_web::{web, HttpResponse};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use validator::Validate;

use crate::alerts::{alert_state, AlertState};
use crate::error::CoreError;
use crate::models::{
    LabResult, LabResultId, NewLabResult, NewPatient, PatientId, StaffId, VisitType,
};
use crate::store::ScopeFilter;

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct ScopeQuery {
    pub practice: Option<String>,
}

impl ScopeQuery {
    fn filter(&self) -> ScopeFilter {
        match &self.practice {
            Some(code) => ScopeFilter::practice(code.clone()),
            None => ScopeFilter::all(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StartConsultationRequest {
    pub patient_id: PatientId,
    pub doctor_id: StaffId,
}

#[derive(Debug, Deserialize)]
pub struct CompleteConsultationRequest {
    pub patient_id: PatientId,
    pub doctor_id: StaffId,
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub patient_id: PatientId,
    pub visit_type: VisitType,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AcknowledgeRequest {
    pub staff_id: StaffId,
    #[validate(length(min = 1, message = "a clinical note is required"))]
    pub note: String,
}

#[derive(Debug, Deserialize)]
pub struct ViewedRequest {
    pub staff_id: StaffId,
}

pub async fn register_patient(
    state: web::Data<AppState>,
    body: web::Json<NewPatient>,
) -> Result<HttpResponse, CoreError> {
    let patient = state.consultations.register_patient(body.into_inner()).await?;
    Ok(HttpResponse::Created().json(json!({ "success": true, "patient": patient })))
}

pub async fn list_patients(
    state: web::Data<AppState>,
    query: web::Query<ScopeQuery>,
) -> Result<HttpResponse, CoreError> {
    let patients = state.store.fetch_patients(&query.filter()).await
        .map_err(CoreError::from)?;
    Ok(HttpResponse::Ok().json(json!({ "success": true, "patients": patients })))
}

pub async fn queue_board(
    state: web::Data<AppState>,
    query: web::Query<ScopeQuery>,
) -> Result<HttpResponse, CoreError> {
    let waiting = state.consultations.queue(&query.filter()).await?;
    Ok(HttpResponse::Ok().json(json!({ "success": true, "queue": waiting })))
}

pub async fn start_consultation(
    state: web::Data<AppState>,
    body: web::Json<StartConsultationRequest>,
) -> Result<HttpResponse, CoreError> {
    let outcome = state
        .consultations
        .start_consultation(&body.patient_id, &body.doctor_id)
        .await?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "already_mine": outcome.already_mine,
        "patient": outcome.patient,
    })))
}

pub async fn complete_consultation(
    state: web::Data<AppState>,
    body: web::Json<CompleteConsultationRequest>,
) -> Result<HttpResponse, CoreError> {
    let patient = state
        .consultations
        .complete_consultation(&body.patient_id, &body.doctor_id)
        .await?;
    Ok(HttpResponse::Ok().json(json!({ "success": true, "patient": patient })))
}

pub async fn add_to_queue(
    state: web::Data<AppState>,
    body: web::Json<EnqueueRequest>,
) -> Result<HttpResponse, CoreError> {
    let body = body.into_inner();
    let patient = state
        .consultations
        .add_to_queue(&body.patient_id, body.visit_type, body.reason)
        .await?;
    Ok(HttpResponse::Ok().json(json!({ "success": true, "patient": patient })))
}

/// Ingestion collaborator's effect: a classified lab result lands in the
/// store and propagates through the standard change feed. Transport-level
/// authentication of the upstream webhook is out of scope here.
pub async fn ingest_lab_result(
    state: web::Data<AppState>,
    body: web::Json<NewLabResult>,
) -> Result<HttpResponse, CoreError> {
    let result = LabResult::ingest(body.into_inner(), Utc::now());
    let result = state
        .store
        .insert_lab_result(result)
        .await
        .map_err(CoreError::from)?;
    Ok(HttpResponse::Created().json(json!({ "success": true, "lab_result": result })))
}

pub async fn list_lab_results(
    state: web::Data<AppState>,
    query: web::Query<ScopeQuery>,
) -> Result<HttpResponse, CoreError> {
    let results = state
        .store
        .fetch_lab_results(&query.filter())
        .await
        .map_err(CoreError::from)?;
    Ok(HttpResponse::Ok().json(json!({ "success": true, "lab_results": results })))
}

pub async fn unacknowledged_alerts(
    state: web::Data<AppState>,
    query: web::Query<ScopeQuery>,
) -> Result<HttpResponse, CoreError> {
    let filter = query.filter();
    let alerts: Vec<serde_json::Value> = state
        .alerts
        .unacknowledged()
        .await
        .into_iter()
        .filter(|result| filter.admits(&result.practice_code))
        .map(|result| {
            let state: AlertState = alert_state(&result);
            json!({ "state": state, "result": result })
        })
        .collect();
    Ok(HttpResponse::Ok().json(json!({ "success": true, "alerts": alerts })))
}

pub async fn acknowledge_result(
    state: web::Data<AppState>,
    path: web::Path<LabResultId>,
    body: web::Json<AcknowledgeRequest>,
) -> Result<HttpResponse, CoreError> {
    body.validate()
        .map_err(|err| CoreError::Validation(err.to_string()))?;
    let result = state
        .alerts
        .acknowledge(&path, &body.staff_id, &body.note)
        .await?;
    Ok(HttpResponse::Ok().json(json!({ "success": true, "lab_result": result })))
}

pub async fn mark_viewed(
    state: web::Data<AppState>,
    path: web::Path<LabResultId>,
    body: web::Json<ViewedRequest>,
) -> Result<HttpResponse, CoreError> {
    let result = state.alerts.mark_viewed(&path, &body.staff_id).await?;
    Ok(HttpResponse::Ok().json(json!({ "success": true, "lab_result": result })))
}
