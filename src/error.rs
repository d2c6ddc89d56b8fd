//! Error taxonomy shared by the ingestion, retrieval and conversation layers.

/// Top-level error type for docchat operations.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// The uploaded file could not be read, parsed or validated.
    #[error("Ingestion failed for {source_id}: {reason}")]
    Ingestion { source_id: String, reason: String },

    /// The embedding or LLM service failed or timed out after retrying.
    #[error("{service} service unavailable: {reason}")]
    ServiceUnavailable {
        service: &'static str,
        reason: String,
    },

    #[error("Session not found: {0}")]
    NotFound(String),

    /// The conversation or vector store could not be reached.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The session was deleted while a turn was in flight; the result was discarded.
    #[error("Session {0} was deleted before the answer could be saved")]
    SessionDeleted(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AppError {
    pub fn ingestion(source_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Ingestion {
            source_id: source_id.into(),
            reason: reason.into(),
        }
    }

    pub fn unavailable(service: &'static str, reason: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            service,
            reason: reason.into(),
        }
    }

    pub(crate) fn poisoned(what: &str) -> Self {
        Self::Persistence(format!("{what} lock poisoned"))
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

pub type Result<T, E = AppError> = std::result::Result<T, E>;
