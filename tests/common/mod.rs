//! Shared fixtures and a feed-proxy store for failure-path tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::broadcast;

use rounds::models::{
    AbnormalFlag, ChangeEvent, LabResult, LabResultId, NewLabResult, NewPatient, NextOfKin,
    Patient, PatientId, ResultStatus, StaffId, VisitType,
};
use rounds::store::{
    EntityStore, MemoryStore, PatientChange, PatientExpectation, ScopeFilter, StoreError,
};

/// Now, truncated to whole seconds so snapshots survive a SQLite round trip.
pub fn now_secs() -> DateTime<Utc> {
    DateTime::from_timestamp(Utc::now().timestamp(), 0).unwrap()
}

pub fn new_patient(practice: &str, mrn: &str) -> NewPatient {
    NewPatient {
        mrn: mrn.into(),
        first_name: "Amara".into(),
        last_name: "Diallo".into(),
        date_of_birth: NaiveDate::from_ymd_opt(1988, 11, 23).unwrap(),
        practice_code: practice.into(),
        visit_type: VisitType::WalkIn,
        visit_reason: Some("fever".into()),
        next_of_kin: vec![NextOfKin {
            name: "Sekou Diallo".into(),
            relationship: "Spouse".into(),
            phone: Some("+220 555 0101".into()),
        }],
    }
}

pub fn registered(practice: &str, mrn: &str) -> Patient {
    Patient::register(new_patient(practice, mrn), now_secs())
}

pub fn lab_result(practice: &str, patient_id: &PatientId, flag: AbnormalFlag) -> LabResult {
    LabResult::ingest(
        NewLabResult {
            patient_id: patient_id.clone(),
            practice_code: practice.into(),
            test_name: "Potassium".into(),
            value: 6.8,
            unit: "mmol/L".into(),
            reference_range_low: Some(3.5),
            reference_range_high: Some(5.0),
            abnormal_flag: Some(flag),
            result_status: ResultStatus::Final,
            collection_datetime: now_secs(),
        },
        now_secs(),
    )
}

/// Poll `check` until it passes or the deadline expires.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Wraps a [`MemoryStore`] behind a feed we can sever and fetches we can
/// fail, to drive the sync engine's disconnect and degraded paths.
pub struct FeedProxyStore {
    inner: Arc<MemoryStore>,
    sender: StdMutex<broadcast::Sender<ChangeEvent>>,
    pub fail_fetches: AtomicU32,
}

impl FeedProxyStore {
    pub fn new() -> Arc<Self> {
        let inner = Arc::new(MemoryStore::new());
        let (tx, _) = broadcast::channel(64);
        let proxy = Arc::new(Self {
            inner: inner.clone(),
            sender: StdMutex::new(tx),
            fail_fetches: AtomicU32::new(0),
        });

        let forward_to = Arc::downgrade(&proxy);
        let mut feed = inner.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = feed.recv().await {
                let Some(proxy) = forward_to.upgrade() else {
                    break;
                };
                let tx = proxy.sender.lock().unwrap().clone();
                let _ = tx.send(event);
            }
        });
        proxy
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    /// Sever every open subscription; the next `subscribe` gets a fresh
    /// feed, as after a transport reconnect.
    pub fn disconnect(&self) {
        let (tx, _) = broadcast::channel(64);
        *self.sender.lock().unwrap() = tx;
    }

    pub fn fail_next_fetches(&self, count: u32) {
        self.fail_fetches.store(count, Ordering::SeqCst);
    }

    fn fetch_allowed(&self) -> Result<(), StoreError> {
        let remaining = self.fail_fetches.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_fetches.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Backend("injected fetch failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl EntityStore for FeedProxyStore {
    async fn insert_patient(&self, patient: Patient) -> Result<Patient, StoreError> {
        self.inner.insert_patient(patient).await
    }

    async fn insert_lab_result(&self, result: LabResult) -> Result<LabResult, StoreError> {
        self.inner.insert_lab_result(result).await
    }

    async fn get_patient(&self, id: &PatientId) -> Result<Option<Patient>, StoreError> {
        self.inner.get_patient(id).await
    }

    async fn get_lab_result(
        &self,
        id: &LabResultId,
    ) -> Result<Option<LabResult>, StoreError> {
        self.inner.get_lab_result(id).await
    }

    async fn fetch_patients(&self, filter: &ScopeFilter) -> Result<Vec<Patient>, StoreError> {
        self.fetch_allowed()?;
        self.inner.fetch_patients(filter).await
    }

    async fn fetch_lab_results(
        &self,
        filter: &ScopeFilter,
    ) -> Result<Vec<LabResult>, StoreError> {
        self.fetch_allowed()?;
        self.inner.fetch_lab_results(filter).await
    }

    async fn update_patient_if(
        &self,
        id: &PatientId,
        expect: PatientExpectation,
        change: PatientChange,
    ) -> Result<Patient, StoreError> {
        self.inner.update_patient_if(id, expect, change).await
    }

    async fn acknowledge_lab_result(
        &self,
        id: &LabResultId,
        by: &StaffId,
        note: &str,
        at: DateTime<Utc>,
    ) -> Result<LabResult, StoreError> {
        self.inner.acknowledge_lab_result(id, by, note, at).await
    }

    async fn mark_lab_result_viewed(
        &self,
        id: &LabResultId,
        viewer: &StaffId,
    ) -> Result<LabResult, StoreError> {
        self.inner.mark_lab_result_viewed(id, viewer).await
    }

    async fn delete_patient(&self, id: &PatientId) -> Result<(), StoreError> {
        self.inner.delete_patient(id).await
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.lock().unwrap().subscribe()
    }
}
