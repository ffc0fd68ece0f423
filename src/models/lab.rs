use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{PatientId, StaffId};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabResultId(pub Uuid);

impl LabResultId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for LabResultId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LabResultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Abnormality classification of a result, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbnormalFlag {
    Normal,
    Low,
    High,
    VeryLow,
    VeryHigh,
    Critical,
}

impl AbnormalFlag {
    /// normal < low/high < very-low/very-high < critical
    pub fn severity_rank(&self) -> u8 {
        match self {
            AbnormalFlag::Normal => 0,
            AbnormalFlag::Low | AbnormalFlag::High => 1,
            AbnormalFlag::VeryLow | AbnormalFlag::VeryHigh => 2,
            AbnormalFlag::Critical => 3,
        }
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, AbnormalFlag::Critical)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AbnormalFlag::Normal => "normal",
            AbnormalFlag::Low => "low",
            AbnormalFlag::High => "high",
            AbnormalFlag::VeryLow => "very_low",
            AbnormalFlag::VeryHigh => "very_high",
            AbnormalFlag::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(AbnormalFlag::Normal),
            "low" => Some(AbnormalFlag::Low),
            "high" => Some(AbnormalFlag::High),
            "very_low" => Some(AbnormalFlag::VeryLow),
            "very_high" => Some(AbnormalFlag::VeryHigh),
            "critical" => Some(AbnormalFlag::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Preliminary,
    Final,
    Corrected,
    Amended,
    Cancelled,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Preliminary => "preliminary",
            ResultStatus::Final => "final",
            ResultStatus::Corrected => "corrected",
            ResultStatus::Amended => "amended",
            ResultStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "preliminary" => Some(ResultStatus::Preliminary),
            "final" => Some(ResultStatus::Final),
            "corrected" => Some(ResultStatus::Corrected),
            "amended" => Some(ResultStatus::Amended),
            "cancelled" => Some(ResultStatus::Cancelled),
            _ => None,
        }
    }
}

/// A lab result as delivered by the ingestion pipeline.
///
/// `critical_acknowledged == true` implies `acknowledged_by` is set; the
/// acknowledgment fields are written exactly once and never overwritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabResult {
    pub id: LabResultId,
    pub patient_id: PatientId,
    pub practice_code: String,
    pub test_name: String,
    pub value: f64,
    pub unit: String,
    pub reference_range_low: Option<f64>,
    pub reference_range_high: Option<f64>,
    pub abnormal_flag: AbnormalFlag,
    pub result_status: ResultStatus,
    pub critical_acknowledged: bool,
    pub acknowledged_by: Option<StaffId>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledgment_note: Option<String>,
    pub viewed_by: HashSet<StaffId>,
    pub collection_datetime: DateTime<Utc>,
    pub resulted_at: DateTime<Utc>,
}

impl LabResult {
    pub fn ingest(new: NewLabResult, now: DateTime<Utc>) -> Self {
        let abnormal_flag = new.abnormal_flag.unwrap_or_else(|| {
            classify(
                new.value,
                new.reference_range_low,
                new.reference_range_high,
            )
        });
        Self {
            id: LabResultId::new(),
            patient_id: new.patient_id,
            practice_code: new.practice_code,
            test_name: new.test_name,
            value: new.value,
            unit: new.unit,
            reference_range_low: new.reference_range_low,
            reference_range_high: new.reference_range_high,
            abnormal_flag,
            result_status: new.result_status,
            critical_acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
            acknowledgment_note: None,
            viewed_by: HashSet::new(),
            collection_datetime: new.collection_datetime,
            resulted_at: now,
        }
    }

    /// A critical result that nobody has signed off yet.
    pub fn needs_acknowledgment(&self) -> bool {
        self.abnormal_flag.is_critical() && !self.critical_acknowledged
    }
}

/// Ingestion payload. The upstream lab normally classifies the abnormal
/// flag itself; when it is absent we classify from the reference range.
#[derive(Debug, Clone, Deserialize)]
pub struct NewLabResult {
    pub patient_id: PatientId,
    pub practice_code: String,
    pub test_name: String,
    pub value: f64,
    pub unit: String,
    pub reference_range_low: Option<f64>,
    pub reference_range_high: Option<f64>,
    pub abnormal_flag: Option<AbnormalFlag>,
    pub result_status: ResultStatus,
    pub collection_datetime: DateTime<Utc>,
}

/// Classify a value against its reference range. A value more than one
/// range-width outside the range is very-low/very-high; `Critical` is never
/// inferred here, it must come from the lab's own classification.
pub fn classify(value: f64, low: Option<f64>, high: Option<f64>) -> AbnormalFlag {
    let width = match (low, high) {
        (Some(l), Some(h)) if h > l => h - l,
        _ => f64::INFINITY,
    };
    if let Some(l) = low {
        if value < l - width {
            return AbnormalFlag::VeryLow;
        }
        if value < l {
            return AbnormalFlag::Low;
        }
    }
    if let Some(h) = high {
        if value > h + width {
            return AbnormalFlag::VeryHigh;
        }
        if value > h {
            return AbnormalFlag::High;
        }
    }
    AbnormalFlag::Normal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ranks_are_ordered() {
        assert!(AbnormalFlag::Normal.severity_rank() < AbnormalFlag::Low.severity_rank());
        assert_eq!(
            AbnormalFlag::Low.severity_rank(),
            AbnormalFlag::High.severity_rank()
        );
        assert!(AbnormalFlag::VeryHigh.severity_rank() < AbnormalFlag::Critical.severity_rank());
        assert!(AbnormalFlag::Critical.is_critical());
    }

    #[test]
    fn classify_uses_range_width() {
        // Range 3.5..5.0, width 1.5
        assert_eq!(classify(4.2, Some(3.5), Some(5.0)), AbnormalFlag::Normal);
        assert_eq!(classify(3.1, Some(3.5), Some(5.0)), AbnormalFlag::Low);
        assert_eq!(classify(1.9, Some(3.5), Some(5.0)), AbnormalFlag::VeryLow);
        assert_eq!(classify(5.8, Some(3.5), Some(5.0)), AbnormalFlag::High);
        assert_eq!(classify(6.6, Some(3.5), Some(5.0)), AbnormalFlag::VeryHigh);
        // Open-ended range never escalates past low/high
        assert_eq!(classify(0.1, Some(3.5), None), AbnormalFlag::Low);
    }
}
