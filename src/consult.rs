//! Transition Service: the consultation lifecycle.
//!
//! Every operation is a single conditional update against the entity
//! store, so mutual exclusion between concurrently acting staff is decided
//! server-side. No client-side locking, no lock held across a round trip.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::error::CoreError;
use crate::models::{NewPatient, Patient, PatientId, StaffId, VisitType};
use crate::store::{
    EntityStore, PatientChange, PatientExpectation, ScopeFilter, StoreError,
};

#[derive(Clone)]
pub struct ConsultationService {
    store: Arc<dyn EntityStore>,
}

/// Result of `start_consultation`. `already_mine` flags the benign repeat:
/// the claim had already succeeded for this same doctor, so a retry or
/// double-click is reported as success rather than a conflict.
#[derive(Debug, Clone, Serialize)]
pub struct StartOutcome {
    pub patient: Patient,
    pub already_mine: bool,
}

impl ConsultationService {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, new), fields(mrn = %new.mrn, practice = %new.practice_code))]
    pub async fn register_patient(&self, new: NewPatient) -> Result<Patient, CoreError> {
        if new.mrn.trim().is_empty() {
            return Err(CoreError::Validation("mrn is required".into()));
        }
        if new.first_name.trim().is_empty() || new.last_name.trim().is_empty() {
            return Err(CoreError::Validation(
                "first_name and last_name are required".into(),
            ));
        }
        let patient = Patient::register(new, Utc::now());
        let patient = self.store.insert_patient(patient).await?;
        info!(patient_id = %patient.id, "patient registered");
        Ok(patient)
    }

    /// Claim a waiting patient for a doctor. Exactly one of any set of
    /// concurrent claims succeeds; the rest see `Conflict`.
    #[instrument(skip(self), fields(patient_id = %patient_id, doctor_id = %doctor_id))]
    pub async fn start_consultation(
        &self,
        patient_id: &PatientId,
        doctor_id: &StaffId,
    ) -> Result<StartOutcome, CoreError> {
        let result = self
            .store
            .update_patient_if(
                patient_id,
                PatientExpectation::AwaitingDoctor,
                PatientChange::BeginConsultation {
                    doctor: doctor_id.clone(),
                    at: Utc::now(),
                },
            )
            .await;

        match result {
            Ok(patient) => {
                info!("consultation started");
                Ok(StartOutcome {
                    patient,
                    already_mine: false,
                })
            }
            Err(StoreError::PatientConflict(current)) => {
                if current.in_consultation_with(doctor_id) {
                    // The earlier claim by this doctor already went through.
                    Ok(StartOutcome {
                        patient: *current,
                        already_mine: true,
                    })
                } else {
                    warn!("patient already claimed");
                    Err(CoreError::Conflict(
                        "patient is already with another doctor".into(),
                    ))
                }
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Finish a consultation. Only the doctor holding the patient may
    /// complete it.
    #[instrument(skip(self), fields(patient_id = %patient_id, doctor_id = %doctor_id))]
    pub async fn complete_consultation(
        &self,
        patient_id: &PatientId,
        doctor_id: &StaffId,
    ) -> Result<Patient, CoreError> {
        let result = self
            .store
            .update_patient_if(
                patient_id,
                PatientExpectation::InConsultationWith(doctor_id.clone()),
                PatientChange::FinishConsultation { at: Utc::now() },
            )
            .await;

        match result {
            Ok(patient) => {
                info!("consultation completed");
                Ok(patient)
            }
            Err(StoreError::PatientConflict(_)) => Err(CoreError::Conflict(
                "consultation is not held by this doctor".into(),
            )),
            Err(other) => Err(other.into()),
        }
    }

    /// Put a patient (back) on the waiting list. Receptionist-initiated,
    /// no ownership precondition.
    #[instrument(skip(self, reason), fields(patient_id = %patient_id))]
    pub async fn add_to_queue(
        &self,
        patient_id: &PatientId,
        visit_type: VisitType,
        reason: Option<String>,
    ) -> Result<Patient, CoreError> {
        let patient = self
            .store
            .update_patient_if(
                patient_id,
                PatientExpectation::Any,
                PatientChange::Enqueue {
                    visit_type,
                    reason,
                    at: Utc::now(),
                },
            )
            .await?;
        info!("patient queued");
        Ok(patient)
    }

    /// The waiting board: queued patients in arrival order.
    pub async fn queue(&self, filter: &ScopeFilter) -> Result<Vec<Patient>, CoreError> {
        let mut waiting: Vec<Patient> = self
            .store
            .fetch_patients(filter)
            .await?
            .into_iter()
            .filter(|p| p.awaiting_doctor())
            .collect();
        waiting.sort_by_key(|p| p.last_status_change);
        Ok(waiting)
    }
}
