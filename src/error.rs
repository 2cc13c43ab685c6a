use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use thiserror::Error;

use crate::{
    backend::error::BackendError,
    state::{AbortError, ApplyError, PlanError, quiz::QuizRecordError},
};

/// Errors that can occur in service layer operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The backend refused or could not serve the request.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    /// The backend returned a quiz the engine cannot run.
    #[error("invalid quiz: {0}")]
    InvalidQuiz(#[from] QuizRecordError),
    /// No user is attached to the session.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Invalid input provided by the client.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Operation cannot be performed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// Answers are still waiting to reach the backend.
    #[error("{0} answer(s) still syncing; try again shortly")]
    SyncPending(usize),
    /// Operation exceeded its timeout limit.
    #[error("operation timed out")]
    Timeout,
}

/// Application-level errors that are converted to HTTP responses.
#[derive(Debug, Error)]
pub enum AppError {
    /// Bad request with invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Unauthorized access attempt.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Requested resource not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// Conflict with current state.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Backend unavailable.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    /// The backend refused the request.
    #[error("bad gateway: {0}")]
    BadGateway(String),
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Backend(source) => match source {
                BackendError::NotFound(message) => AppError::NotFound(message),
                BackendError::NotActive(_) | BackendError::Already(_) | BackendError::Ended(_) => {
                    AppError::Conflict(source.to_string())
                }
                BackendError::Unavailable { .. } => {
                    AppError::ServiceUnavailable(source.to_string())
                }
                BackendError::Rejected(_) => AppError::BadGateway(source.to_string()),
            },
            ServiceError::InvalidQuiz(source) => AppError::BadGateway(source.to_string()),
            ServiceError::Unauthorized(message) => AppError::Unauthorized(message),
            ServiceError::InvalidInput(message) => AppError::BadRequest(message),
            ServiceError::InvalidState(message) => AppError::Conflict(message),
            ServiceError::NotFound(message) => AppError::NotFound(message),
            pending @ ServiceError::SyncPending(_) => AppError::Conflict(pending.to_string()),
            ServiceError::Timeout => AppError::ServiceUnavailable("operation timed out".into()),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::BadGateway(_) => StatusCode::BAD_GATEWAY,
        };

        let payload = Json(ErrorBody {
            message: self.to_string(),
        });

        (status, payload).into_response()
    }
}

impl From<PlanError> for ServiceError {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::AlreadyPending => {
                ServiceError::InvalidState("state transition already pending".into())
            }
            PlanError::InvalidTransition(invalid) => {
                ServiceError::InvalidState(invalid.to_string())
            }
        }
    }
}

impl From<ApplyError> for ServiceError {
    fn from(err: ApplyError) -> Self {
        match err {
            ApplyError::NoPending => ServiceError::InvalidState("no transition is pending".into()),
            ApplyError::IdMismatch { .. } => {
                ServiceError::InvalidState("pending transition does not match".into())
            }
            ApplyError::PhaseMismatch { expected, actual } => ServiceError::InvalidState(format!(
                "state changed during transition (expected {expected:?}, got {actual:?})"
            )),
        }
    }
}

impl From<AbortError> for ServiceError {
    fn from(err: AbortError) -> Self {
        match err {
            AbortError::NoPending => ServiceError::InvalidState("no pending transition".into()),
            AbortError::IdMismatch { .. } => {
                ServiceError::InvalidState("transition plan does not match".into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::response::IntoResponse;

    use super::*;

    #[test]
    fn sync_pending_maps_to_conflict() {
        let response = AppError::from(ServiceError::SyncPending(2)).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn backend_categories_map_to_http_statuses() {
        let missing = AppError::from(ServiceError::from(BackendError::NotFound("quiz".into())));
        assert!(matches!(missing, AppError::NotFound(_)));

        let outage = AppError::from(ServiceError::from(BackendError::unavailable(
            "down",
            std::io::Error::other("refused"),
        )));
        assert_eq!(outage.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
