//! Error types shared by the REST backend implementation.

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use crate::backend::error::BackendError;

/// Convenient result alias returning [`HttpDaoError`] failures.
pub type HttpResult<T> = Result<T, HttpDaoError>;

/// Failures that can occur while talking to the quiz REST backend.
#[derive(Debug, Error)]
pub enum HttpDaoError {
    /// Required environment variable is missing.
    #[error("missing backend environment variable `{var}`")]
    MissingEnvVar { var: &'static str },
    /// Building the HTTP client failed (invalid TLS setup, etc).
    #[error("failed to build backend client")]
    ClientBuilder {
        #[source]
        source: reqwest::Error,
    },
    /// A request could not be sent.
    #[error("failed to send backend request to `{path}`")]
    RequestSend {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    /// The backend refused the request with a structured reason.
    #[error("backend refused `{path}` with status {status}: {reason}")]
    Refused {
        path: String,
        status: StatusCode,
        reason: String,
    },
    /// Response payload could not be decoded.
    #[error("failed to decode backend response for `{path}`")]
    DecodeResponse {
        path: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Error body returned by the backend on refusal.
#[derive(Debug, Default, Deserialize)]
pub(super) struct ErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ErrorBody {
    /// Prefer the machine-readable code, then the prose message.
    pub fn reason(self) -> String {
        self.code
            .filter(|code| !code.is_empty())
            .or(self.message)
            .unwrap_or_default()
    }
}

impl From<HttpDaoError> for BackendError {
    fn from(err: HttpDaoError) -> Self {
        match err {
            HttpDaoError::Refused { status, reason, .. } if status == StatusCode::NOT_FOUND => {
                BackendError::NotFound(reason)
            }
            HttpDaoError::Refused { status, reason, path } if status.is_server_error() => {
                BackendError::unavailable(
                    format!("{path} returned {status}"),
                    std::io::Error::other(reason),
                )
            }
            HttpDaoError::Refused { reason, .. } => BackendError::classify(reason),
            other => BackendError::unavailable(other.to_string(), other),
        }
    }
}
