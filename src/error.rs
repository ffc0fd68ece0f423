//! Error taxonomy for the queue and synchronization core.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};

use crate::store::StoreError;

/// Errors surfaced by the core's public operations.
///
/// `Conflict` and `Validation` are expected user-facing outcomes and are
/// returned synchronously. `TransientIo` is retried internally by the sync
/// engine and only reaches a caller once the retry budget is spent.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("transient I/O failure: {0}")]
    TransientIo(String),
    #[error("local mirror inconsistent, reconciliation in progress: {0}")]
    Inconsistent(String),
}

impl CoreError {
    pub fn patient_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            kind: "patient",
            id: id.to_string(),
        }
    }

    pub fn lab_result_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            kind: "lab result",
            id: id.to_string(),
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::PatientNotFound(id) => CoreError::patient_not_found(id),
            StoreError::LabResultNotFound(id) => CoreError::lab_result_not_found(id),
            StoreError::PatientConflict(patient) => CoreError::Conflict(format!(
                "patient {} changed concurrently",
                patient.id
            )),
            StoreError::LabResultConflict(result) => CoreError::Conflict(format!(
                "lab result {} changed concurrently",
                result.id
            )),
            StoreError::Backend(message) => CoreError::TransientIo(message),
        }
    }
}

impl ResponseError for CoreError {
    fn status_code(&self) -> StatusCode {
        match self {
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::TransientIo(_) | CoreError::Inconsistent(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(serde_json::json!({
            "success": false,
            "error": self.to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(
            CoreError::Conflict("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            CoreError::patient_not_found("p1").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            CoreError::Validation("note".into()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            CoreError::TransientIo("feed".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
