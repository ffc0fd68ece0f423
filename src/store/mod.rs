//! Entity Store contract and backends.
//!
//! The store is the single authority for mutual exclusion: every
//! consultation transition is a conditional update that either applies
//! atomically or reports a conflict with the current snapshot. Each
//! successful mutation emits exactly one [`ChangeEvent`] on the feed,
//! in commit order.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::models::{
    ChangeEvent, ConsultationStatus, LabResult, LabResultId, Patient, PatientId, StaffId,
    VisitType,
};

/// Default capacity of the change-event feed.
pub const FEED_CAPACITY: usize = 256;

/// Practice-partition scope for reads and subscriptions. `None` admits
/// every practice (administrative role).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeFilter {
    pub practice_code: Option<String>,
}

impl ScopeFilter {
    pub fn practice(code: impl Into<String>) -> Self {
        Self {
            practice_code: Some(code.into()),
        }
    }

    pub fn all() -> Self {
        Self {
            practice_code: None,
        }
    }

    pub fn admits(&self, practice_code: &str) -> bool {
        match &self.practice_code {
            Some(scope) => scope == practice_code,
            None => true,
        }
    }
}

/// Expected current state for a conditional patient update.
#[derive(Debug, Clone)]
pub enum PatientExpectation {
    /// Waiting (or never queued) with no doctor attached.
    AwaitingDoctor,
    /// In consultation with this specific doctor.
    InConsultationWith(StaffId),
    Any,
}

impl PatientExpectation {
    pub fn holds(&self, patient: &Patient) -> bool {
        match self {
            PatientExpectation::AwaitingDoctor => patient.awaiting_doctor(),
            PatientExpectation::InConsultationWith(doctor) => {
                patient.in_consultation_with(doctor)
            }
            PatientExpectation::Any => true,
        }
    }
}

/// State transition applied when the expectation holds. Each variant sets
/// `consultation_status` and `current_doctor_id` together, which is what
/// keeps the doctor-link invariant out of reach of partial updates.
#[derive(Debug, Clone)]
pub enum PatientChange {
    BeginConsultation {
        doctor: StaffId,
        at: DateTime<Utc>,
    },
    FinishConsultation {
        at: DateTime<Utc>,
    },
    Enqueue {
        visit_type: VisitType,
        reason: Option<String>,
        at: DateTime<Utc>,
    },
}

impl PatientChange {
    pub fn apply(&self, patient: &mut Patient) {
        match self {
            PatientChange::BeginConsultation { doctor, at } => {
                patient.consultation_status = ConsultationStatus::InConsultation;
                patient.current_doctor_id = Some(doctor.clone());
                patient.last_status_change = *at;
                patient.updated_at = *at;
            }
            PatientChange::FinishConsultation { at } => {
                patient.consultation_status = ConsultationStatus::Served;
                patient.current_doctor_id = None;
                patient.last_status_change = *at;
                patient.updated_at = *at;
            }
            PatientChange::Enqueue {
                visit_type,
                reason,
                at,
            } => {
                patient.consultation_status = ConsultationStatus::Waiting;
                patient.current_doctor_id = None;
                patient.visit_type = *visit_type;
                patient.visit_reason = reason.clone();
                patient.last_status_change = *at;
                patient.updated_at = *at;
            }
        }
    }
}

/// Store-level failures. Conflicts carry the snapshot observed at mutation
/// time so callers can classify benign repeats without a second read.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("patient not found: {0}")]
    PatientNotFound(PatientId),
    #[error("lab result not found: {0}")]
    LabResultNotFound(LabResultId),
    #[error("patient {} no longer satisfies the expected state", .0.id)]
    PatientConflict(Box<Patient>),
    #[error("lab result {} no longer satisfies the expected state", .0.id)]
    LabResultConflict(Box<LabResult>),
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Authoritative store of patients and lab results.
///
/// Mutations are atomic check-and-set operations; reads are bulk fetches
/// used for initial snapshots and reconciliation; `subscribe` opens the
/// change feed.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn insert_patient(&self, patient: Patient) -> Result<Patient, StoreError>;

    async fn insert_lab_result(&self, result: LabResult) -> Result<LabResult, StoreError>;

    async fn get_patient(&self, id: &PatientId) -> Result<Option<Patient>, StoreError>;

    async fn get_lab_result(&self, id: &LabResultId)
        -> Result<Option<LabResult>, StoreError>;

    async fn fetch_patients(&self, filter: &ScopeFilter) -> Result<Vec<Patient>, StoreError>;

    async fn fetch_lab_results(
        &self,
        filter: &ScopeFilter,
    ) -> Result<Vec<LabResult>, StoreError>;

    /// Compare-and-set over a patient: applies `change` only while `expect`
    /// still holds, otherwise fails with the current snapshot.
    async fn update_patient_if(
        &self,
        id: &PatientId,
        expect: PatientExpectation,
        change: PatientChange,
    ) -> Result<Patient, StoreError>;

    /// Conditional on the result being unacknowledged; an acknowledged
    /// result yields `LabResultConflict` with the stored audit pair intact.
    async fn acknowledge_lab_result(
        &self,
        id: &LabResultId,
        by: &StaffId,
        note: &str,
        at: DateTime<Utc>,
    ) -> Result<LabResult, StoreError>;

    /// Set-union append of `viewer` to `viewed_by`.
    async fn mark_lab_result_viewed(
        &self,
        id: &LabResultId,
        viewer: &StaffId,
    ) -> Result<LabResult, StoreError>;

    /// Administrative removal; present because the change feed carries
    /// deletions, not because the core itself deletes patients.
    async fn delete_patient(&self, id: &PatientId) -> Result<(), StoreError>;

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;
}
