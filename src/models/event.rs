use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{LabResult, LabResultId, Patient, PatientId};

/// A change applied to the entity store, broadcast to every subscriber.
///
/// Snapshots are full relational views (a patient carries its next-of-kin),
/// so subscribers never issue follow-up reads to resolve an event. Decoded
/// once at the subscription boundary; everything downstream matches on the
/// closed variant set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Store-assigned monotone counter, for gap diagnostics only.
    pub seq: u64,
    pub occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    pub body: ChangeBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "data", rename_all = "snake_case")]
pub enum ChangeBody {
    PatientInserted(Patient),
    PatientUpdated(Patient),
    PatientDeleted(PatientId),
    LabResultInserted(LabResult),
    LabResultUpdated(LabResult),
    LabResultDeleted(LabResultId),
}

impl ChangeBody {
    /// Practice scope of the carried snapshot. Deletions carry no snapshot
    /// and therefore no scope; they are delivered to every subscriber.
    pub fn practice_code(&self) -> Option<&str> {
        match self {
            ChangeBody::PatientInserted(p) | ChangeBody::PatientUpdated(p) => {
                Some(&p.practice_code)
            }
            ChangeBody::LabResultInserted(r) | ChangeBody::LabResultUpdated(r) => {
                Some(&r.practice_code)
            }
            ChangeBody::PatientDeleted(_) | ChangeBody::LabResultDeleted(_) => None,
        }
    }
}
