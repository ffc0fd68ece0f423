//! In-memory store backend.
//!
//! Default backend for development and tests. Per-entity atomicity comes
//! from the map's entry locks: a conditional update checks and mutates
//! while holding the entry, and emits its event before releasing it, so
//! the feed observes commits in order.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::models::{
    ChangeBody, ChangeEvent, LabResult, LabResultId, Patient, PatientId, StaffId,
};

use super::{
    EntityStore, PatientChange, PatientExpectation, ScopeFilter, StoreError, FEED_CAPACITY,
};

pub struct MemoryStore {
    patients: DashMap<PatientId, Patient>,
    lab_results: DashMap<LabResultId, LabResult>,
    events: broadcast::Sender<ChangeEvent>,
    seq: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(FEED_CAPACITY)
    }

    pub fn with_capacity(feed_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(feed_capacity);
        Self {
            patients: DashMap::new(),
            lab_results: DashMap::new(),
            events,
            seq: AtomicU64::new(0),
        }
    }

    fn emit(&self, body: ChangeBody) {
        let event = ChangeEvent {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            occurred_at: Utc::now(),
            body,
        };
        // No subscribers is fine; the store does not care who listens.
        let _ = self.events.send(event);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn insert_patient(&self, patient: Patient) -> Result<Patient, StoreError> {
        use dashmap::mapref::entry::Entry;
        match self.patients.entry(patient.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Backend(format!(
                "patient {} already exists",
                patient.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(patient.clone());
                self.emit(ChangeBody::PatientInserted(patient.clone()));
                Ok(patient)
            }
        }
    }

    async fn insert_lab_result(&self, result: LabResult) -> Result<LabResult, StoreError> {
        use dashmap::mapref::entry::Entry;
        match self.lab_results.entry(result.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Backend(format!(
                "lab result {} already exists",
                result.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(result.clone());
                self.emit(ChangeBody::LabResultInserted(result.clone()));
                Ok(result)
            }
        }
    }

    async fn get_patient(&self, id: &PatientId) -> Result<Option<Patient>, StoreError> {
        Ok(self.patients.get(id).map(|entry| entry.clone()))
    }

    async fn get_lab_result(
        &self,
        id: &LabResultId,
    ) -> Result<Option<LabResult>, StoreError> {
        Ok(self.lab_results.get(id).map(|entry| entry.clone()))
    }

    async fn fetch_patients(&self, filter: &ScopeFilter) -> Result<Vec<Patient>, StoreError> {
        Ok(self
            .patients
            .iter()
            .filter(|entry| filter.admits(&entry.practice_code))
            .map(|entry| entry.clone())
            .collect())
    }

    async fn fetch_lab_results(
        &self,
        filter: &ScopeFilter,
    ) -> Result<Vec<LabResult>, StoreError> {
        Ok(self
            .lab_results
            .iter()
            .filter(|entry| filter.admits(&entry.practice_code))
            .map(|entry| entry.clone())
            .collect())
    }

    async fn update_patient_if(
        &self,
        id: &PatientId,
        expect: PatientExpectation,
        change: PatientChange,
    ) -> Result<Patient, StoreError> {
        let mut entry = self
            .patients
            .get_mut(id)
            .ok_or_else(|| StoreError::PatientNotFound(id.clone()))?;
        if !expect.holds(&entry) {
            return Err(StoreError::PatientConflict(Box::new(entry.clone())));
        }
        change.apply(&mut entry);
        let snapshot = entry.clone();
        // Emit while the entry is held: commit order equals feed order.
        self.emit(ChangeBody::PatientUpdated(snapshot.clone()));
        Ok(snapshot)
    }

    async fn acknowledge_lab_result(
        &self,
        id: &LabResultId,
        by: &StaffId,
        note: &str,
        at: DateTime<Utc>,
    ) -> Result<LabResult, StoreError> {
        let mut entry = self
            .lab_results
            .get_mut(id)
            .ok_or_else(|| StoreError::LabResultNotFound(id.clone()))?;
        if entry.critical_acknowledged {
            return Err(StoreError::LabResultConflict(Box::new(entry.clone())));
        }
        entry.critical_acknowledged = true;
        entry.acknowledged_by = Some(by.clone());
        entry.acknowledged_at = Some(at);
        entry.acknowledgment_note = Some(note.to_string());
        let snapshot = entry.clone();
        self.emit(ChangeBody::LabResultUpdated(snapshot.clone()));
        Ok(snapshot)
    }

    async fn mark_lab_result_viewed(
        &self,
        id: &LabResultId,
        viewer: &StaffId,
    ) -> Result<LabResult, StoreError> {
        let mut entry = self
            .lab_results
            .get_mut(id)
            .ok_or_else(|| StoreError::LabResultNotFound(id.clone()))?;
        let changed = entry.viewed_by.insert(viewer.clone());
        let snapshot = entry.clone();
        if changed {
            self.emit(ChangeBody::LabResultUpdated(snapshot.clone()));
        }
        Ok(snapshot)
    }

    async fn delete_patient(&self, id: &PatientId) -> Result<(), StoreError> {
        match self.patients.remove(id) {
            Some(_) => {
                self.emit(ChangeBody::PatientDeleted(id.clone()));
                Ok(())
            }
            None => Err(StoreError::PatientNotFound(id.clone())),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConsultationStatus, NewPatient, VisitType};
    use chrono::NaiveDate;

    fn new_patient(practice: &str) -> Patient {
        Patient::register(
            NewPatient {
                mrn: "MRN-1".into(),
                first_name: "Ng".into(),
                last_name: "Wei".into(),
                date_of_birth: NaiveDate::from_ymd_opt(1990, 1, 1).unwrap(),
                practice_code: practice.into(),
                visit_type: VisitType::WalkIn,
                visit_reason: None,
                next_of_kin: vec![],
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn conditional_update_rejects_stale_expectation() {
        let store = MemoryStore::new();
        let patient = store.insert_patient(new_patient("P01")).await.unwrap();
        let doctor = StaffId::new();

        let claimed = store
            .update_patient_if(
                &patient.id,
                PatientExpectation::AwaitingDoctor,
                PatientChange::BeginConsultation {
                    doctor: doctor.clone(),
                    at: Utc::now(),
                },
            )
            .await
            .unwrap();
        assert_eq!(
            claimed.consultation_status,
            ConsultationStatus::InConsultation
        );

        let err = store
            .update_patient_if(
                &patient.id,
                PatientExpectation::AwaitingDoctor,
                PatientChange::BeginConsultation {
                    doctor: StaffId::new(),
                    at: Utc::now(),
                },
            )
            .await
            .unwrap_err();
        match err {
            StoreError::PatientConflict(snapshot) => {
                assert_eq!(snapshot.current_doctor_id, Some(doctor));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn every_mutation_emits_one_event() {
        let store = MemoryStore::new();
        let mut feed = store.subscribe();

        let patient = store.insert_patient(new_patient("P01")).await.unwrap();
        store
            .update_patient_if(
                &patient.id,
                PatientExpectation::Any,
                PatientChange::Enqueue {
                    visit_type: VisitType::FollowUp,
                    reason: Some("review".into()),
                    at: Utc::now(),
                },
            )
            .await
            .unwrap();
        store.delete_patient(&patient.id).await.unwrap();

        let first = feed.recv().await.unwrap();
        let second = feed.recv().await.unwrap();
        let third = feed.recv().await.unwrap();
        assert!(matches!(first.body, ChangeBody::PatientInserted(_)));
        assert!(matches!(second.body, ChangeBody::PatientUpdated(_)));
        assert!(matches!(third.body, ChangeBody::PatientDeleted(_)));
        assert!(first.seq < second.seq && second.seq < third.seq);
    }
}
