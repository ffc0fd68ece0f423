//! Entity and event types shared across the core.

pub mod event;
pub mod lab;
pub mod patient;

pub use event::{ChangeBody, ChangeEvent};
pub use lab::{AbnormalFlag, LabResult, LabResultId, NewLabResult, ResultStatus};
pub use patient::{
    ConsultationStatus, NewPatient, NextOfKin, Patient, PatientId, VisitType,
};

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a staff member (doctor, nurse, receptionist).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaffId(pub Uuid);

impl StaffId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for StaffId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StaffId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
