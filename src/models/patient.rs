use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::StaffId;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatientId(pub Uuid);

impl PatientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for PatientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PatientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle stage of a patient's current visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsultationStatus {
    None,
    Waiting,
    InConsultation,
    Served,
}

impl ConsultationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsultationStatus::None => "none",
            ConsultationStatus::Waiting => "waiting",
            ConsultationStatus::InConsultation => "in_consultation",
            ConsultationStatus::Served => "served",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(ConsultationStatus::None),
            "waiting" => Some(ConsultationStatus::Waiting),
            "in_consultation" => Some(ConsultationStatus::InConsultation),
            "served" => Some(ConsultationStatus::Served),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisitType {
    WalkIn,
    Appointment,
    FollowUp,
    Emergency,
}

impl VisitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisitType::WalkIn => "walk_in",
            VisitType::Appointment => "appointment",
            VisitType::FollowUp => "follow_up",
            VisitType::Emergency => "emergency",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "walk_in" => Some(VisitType::WalkIn),
            "appointment" => Some(VisitType::Appointment),
            "follow_up" => Some(VisitType::FollowUp),
            "emergency" => Some(VisitType::Emergency),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextOfKin {
    pub name: String,
    pub relationship: String, // e.g., "Spouse", "Parent", "Guardian"
    pub phone: Option<String>,
}

/// A registered patient.
///
/// `current_doctor_id` is set if and only if `consultation_status` is
/// `InConsultation`; every transition goes through [`crate::store::PatientChange`],
/// which updates both fields together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    pub id: PatientId,
    pub mrn: String,
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: NaiveDate,
    pub practice_code: String,
    pub consultation_status: ConsultationStatus,
    pub current_doctor_id: Option<StaffId>,
    pub last_status_change: DateTime<Utc>,
    pub visit_type: VisitType,
    pub visit_reason: Option<String>,
    pub next_of_kin: Vec<NextOfKin>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Patient {
    pub fn register(new: NewPatient, now: DateTime<Utc>) -> Self {
        Self {
            id: PatientId::new(),
            mrn: new.mrn,
            first_name: new.first_name,
            last_name: new.last_name,
            date_of_birth: new.date_of_birth,
            practice_code: new.practice_code,
            consultation_status: ConsultationStatus::Waiting,
            current_doctor_id: None,
            last_status_change: now,
            visit_type: new.visit_type,
            visit_reason: new.visit_reason,
            next_of_kin: new.next_of_kin,
            created_at: now,
            updated_at: now,
        }
    }

    /// True when a doctor may claim this patient.
    pub fn awaiting_doctor(&self) -> bool {
        matches!(
            self.consultation_status,
            ConsultationStatus::None | ConsultationStatus::Waiting
        ) && self.current_doctor_id.is_none()
    }

    pub fn in_consultation_with(&self, doctor: &StaffId) -> bool {
        self.consultation_status == ConsultationStatus::InConsultation
            && self.current_doctor_id.as_ref() == Some(doctor)
    }
}

/// Registration input; the receptionist's intake form distills to this.
#[derive(Debug, Clone, Deserialize)]
pub struct NewPatient {
    pub mrn: String,
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: NaiveDate,
    pub practice_code: String,
    pub visit_type: VisitType,
    pub visit_reason: Option<String>,
    #[serde(default)]
    pub next_of_kin: Vec<NextOfKin>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NewPatient {
        NewPatient {
            mrn: "MRN-0001".into(),
            first_name: "Ada".into(),
            last_name: "Okafor".into(),
            date_of_birth: NaiveDate::from_ymd_opt(1984, 3, 12).unwrap(),
            practice_code: "P01".into(),
            visit_type: VisitType::WalkIn,
            visit_reason: Some("headache".into()),
            next_of_kin: vec![],
        }
    }

    #[test]
    fn registration_enters_waiting_state() {
        let patient = Patient::register(sample(), Utc::now());
        assert_eq!(patient.consultation_status, ConsultationStatus::Waiting);
        assert!(patient.current_doctor_id.is_none());
        assert!(patient.awaiting_doctor());
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            ConsultationStatus::None,
            ConsultationStatus::Waiting,
            ConsultationStatus::InConsultation,
            ConsultationStatus::Served,
        ] {
            assert_eq!(ConsultationStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ConsultationStatus::parse("discharged"), None);
    }
}
