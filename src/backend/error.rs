use std::error::Error;
use thiserror::Error;

/// Result alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Error raised by a backend implementation, already sorted into the
/// categories the session engine reacts to.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The requested quiz, slot or row does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The quiz has not materialized its active transition yet.
    #[error("quiz not active: {0}")]
    NotActive(String),
    /// The participation already exists or was already completed.
    #[error("already joined: {0}")]
    Already(String),
    /// The quiz is over.
    #[error("quiz ended: {0}")]
    Ended(String),
    /// The backend could not be reached.
    #[error("backend unavailable: {message}")]
    Unavailable {
        message: String,
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// Any other refusal.
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl BackendError {
    /// Construct an unavailable error from any transport failure.
    pub fn unavailable(message: impl Into<String>, source: impl Error + Send + Sync + 'static) -> Self {
        BackendError::Unavailable {
            message: message.into(),
            source: Box::new(source),
        }
    }

    /// Sort a free-form backend message (or error code) into a category.
    ///
    /// Codes such as `NOT_ACTIVE` and prose such as "quiz is not active yet"
    /// land in the same bucket.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let normalized = message.to_lowercase().replace(['_', '-'], " ");

        if normalized.contains("not active")
            || normalized.contains("not ready")
            || normalized.contains("not started")
        {
            BackendError::NotActive(message)
        } else if normalized.contains("already") {
            BackendError::Already(message)
        } else if normalized.contains("ended") || normalized.contains("has finished") {
            BackendError::Ended(message)
        } else if normalized.contains("not found") {
            BackendError::NotFound(message)
        } else {
            BackendError::Rejected(message)
        }
    }

    /// Transport-level failures worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Unavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_codes_and_prose() {
        assert!(matches!(
            BackendError::classify("NOT_ACTIVE"),
            BackendError::NotActive(_)
        ));
        assert!(matches!(
            BackendError::classify("Quiz is not ready yet"),
            BackendError::NotActive(_)
        ));
        assert!(matches!(
            BackendError::classify("ALREADY"),
            BackendError::Already(_)
        ));
        assert!(matches!(
            BackendError::classify("user already completed this quiz"),
            BackendError::Already(_)
        ));
        assert!(matches!(
            BackendError::classify("This quiz has ended"),
            BackendError::Ended(_)
        ));
        assert!(matches!(
            BackendError::classify("slot not found"),
            BackendError::NotFound(_)
        ));
        assert!(matches!(
            BackendError::classify("rate limited"),
            BackendError::Rejected(_)
        ));
    }

    #[test]
    fn only_unavailable_is_transient() {
        let io = std::io::Error::other("connection reset");
        assert!(BackendError::unavailable("upsert failed", io).is_transient());
        assert!(!BackendError::Rejected("nope".into()).is_transient());
    }
}
