//! Consultation lifecycle: atomicity, ownership, and the doctor-link
//! invariant under arbitrary operation sequences.

mod common;

use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;
use test_case::test_case;

use common::{now_secs, registered};
use rounds::consult::ConsultationService;
use rounds::error::CoreError;
use rounds::models::{ConsultationStatus, Patient, PatientId, StaffId, VisitType};
use rounds::store::{EntityStore, MemoryStore, ScopeFilter};

fn service() -> (Arc<MemoryStore>, ConsultationService) {
    let store = Arc::new(MemoryStore::new());
    let service = ConsultationService::new(store.clone());
    (store, service)
}

async fn insert_with_status(
    store: &MemoryStore,
    status: ConsultationStatus,
) -> Patient {
    let mut patient = registered("P01", "MRN-100");
    patient.consultation_status = status;
    patient.current_doctor_id = None;
    store.insert_patient(patient).await.unwrap()
}

#[test_case(ConsultationStatus::None, true ; "never queued counts as waiting")]
#[test_case(ConsultationStatus::Waiting, true ; "waiting patient can be claimed")]
#[test_case(ConsultationStatus::Served, false ; "served patient cannot be claimed")]
#[tokio::test]
async fn claim_preconditions(status: ConsultationStatus, claimable: bool) {
    let (store, service) = service();
    let patient = insert_with_status(&store, status).await;
    let outcome = service
        .start_consultation(&patient.id, &StaffId::new())
        .await;
    assert_eq!(outcome.is_ok(), claimable);
}

#[tokio::test]
async fn concurrent_claims_resolve_to_one_winner() {
    let (store, service) = service();
    let patient = store.insert_patient(registered("P01", "MRN-1")).await.unwrap();

    let doctor_a = StaffId::new();
    let doctor_b = StaffId::new();
    let barrier = Arc::new(tokio::sync::Barrier::new(2));

    let contenders = [doctor_a.clone(), doctor_b.clone()].map(|doctor| {
        let service = service.clone();
        let patient_id = patient.id.clone();
        let barrier = barrier.clone();
        tokio::spawn(async move {
            barrier.wait().await;
            service.start_consultation(&patient_id, &doctor).await
        })
    });

    let outcomes = futures::future::join_all(contenders).await;
    let results: Vec<_> = outcomes.into_iter().map(|joined| joined.unwrap()).collect();

    let winners = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(CoreError::Conflict(_))))
        .count();
    assert_eq!((winners, conflicts), (1, 1));

    // The stored doctor is exactly the winner's id.
    let winner = results
        .iter()
        .find_map(|r| r.as_ref().ok())
        .map(|outcome| outcome.patient.current_doctor_id.clone().unwrap())
        .unwrap();
    let current = store.get_patient(&patient.id).await.unwrap().unwrap();
    assert_eq!(current.current_doctor_id, Some(winner.clone()));
    assert!(winner == doctor_a || winner == doctor_b);
    assert_eq!(
        current.consultation_status,
        ConsultationStatus::InConsultation
    );
}

#[tokio::test]
async fn repeat_claim_by_holder_is_benign() {
    let (store, service) = service();
    let patient = store.insert_patient(registered("P01", "MRN-2")).await.unwrap();
    let doctor = StaffId::new();

    let first = service.start_consultation(&patient.id, &doctor).await.unwrap();
    assert!(!first.already_mine);

    let second = service.start_consultation(&patient.id, &doctor).await.unwrap();
    assert!(second.already_mine);
    assert_eq!(second.patient.current_doctor_id, Some(doctor));
}

#[tokio::test]
async fn completion_requires_ownership() {
    let (store, service) = service();
    let patient = store.insert_patient(registered("P01", "MRN-3")).await.unwrap();
    let doctor_a = StaffId::new();
    let doctor_b = StaffId::new();

    // Not in consultation at all.
    let err = service
        .complete_consultation(&patient.id, &doctor_a)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));

    service.start_consultation(&patient.id, &doctor_a).await.unwrap();

    // A doctor cannot complete another doctor's consultation.
    let err = service
        .complete_consultation(&patient.id, &doctor_b)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));

    let served = service
        .complete_consultation(&patient.id, &doctor_a)
        .await
        .unwrap();
    assert_eq!(served.consultation_status, ConsultationStatus::Served);
    assert!(served.current_doctor_id.is_none());
}

#[tokio::test]
async fn completing_unknown_patient_is_not_found() {
    let (_store, service) = service();
    let err = service
        .complete_consultation(&PatientId::new(), &StaffId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NotFound { .. }));
}

#[tokio::test]
async fn full_consultation_scenario() {
    let (store, service) = service();
    let p1 = store.insert_patient(registered("P01", "MRN-4")).await.unwrap();
    assert_eq!(p1.consultation_status, ConsultationStatus::Waiting);
    let d1 = StaffId::new();
    let d2 = StaffId::new();

    let started = service.start_consultation(&p1.id, &d1).await.unwrap();
    assert_eq!(
        started.patient.consultation_status,
        ConsultationStatus::InConsultation
    );
    assert_eq!(started.patient.current_doctor_id, Some(d1.clone()));

    let err = service.start_consultation(&p1.id, &d2).await.unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));

    let served = service.complete_consultation(&p1.id, &d1).await.unwrap();
    assert_eq!(served.consultation_status, ConsultationStatus::Served);
    assert!(served.current_doctor_id.is_none());
}

#[tokio::test]
async fn requeue_returns_served_patient_to_board() {
    let (store, service) = service();
    let patient = store.insert_patient(registered("P01", "MRN-5")).await.unwrap();
    let doctor = StaffId::new();

    service.start_consultation(&patient.id, &doctor).await.unwrap();
    service.complete_consultation(&patient.id, &doctor).await.unwrap();

    let queued = service
        .add_to_queue(&patient.id, VisitType::FollowUp, Some("wound check".into()))
        .await
        .unwrap();
    assert_eq!(queued.consultation_status, ConsultationStatus::Waiting);
    assert_eq!(queued.visit_type, VisitType::FollowUp);

    let board = service.queue(&ScopeFilter::practice("P01")).await.unwrap();
    assert_eq!(board.len(), 1);
    assert_eq!(board[0].id, patient.id);
}

/// The doctor-link invariant holds after any sequence of transitions:
/// `current_doctor_id` is set iff the patient is in consultation.
#[tokio::test]
async fn doctor_link_invariant_survives_random_sequences() {
    let (store, service) = service();
    let mut patients = Vec::new();
    for i in 0..3 {
        let patient = store
            .insert_patient(Patient::register(
                common::new_patient("P01", &format!("MRN-{i}")),
                now_secs(),
            ))
            .await
            .unwrap();
        patients.push(patient.id);
    }
    let doctors: Vec<StaffId> = (0..3).map(|_| StaffId::new()).collect();

    let mut rng = rand::thread_rng();
    for _ in 0..200 {
        let patient = patients.choose(&mut rng).unwrap();
        let doctor = doctors.choose(&mut rng).unwrap();
        // Conflicts are an expected outcome, not a failure.
        let _ = match rng.gen_range(0..3) {
            0 => service
                .start_consultation(patient, doctor)
                .await
                .map(|_| ()),
            1 => service
                .complete_consultation(patient, doctor)
                .await
                .map(|_| ()),
            _ => service
                .add_to_queue(patient, VisitType::WalkIn, None)
                .await
                .map(|_| ()),
        };

        for id in &patients {
            let current = store.get_patient(id).await.unwrap().unwrap();
            assert_eq!(
                current.current_doctor_id.is_some(),
                current.consultation_status == ConsultationStatus::InConsultation,
                "doctor link diverged from status for {id}"
            );
        }
    }
}
