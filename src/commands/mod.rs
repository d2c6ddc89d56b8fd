//! Upload and conversation boundaries.
//!
//! Commands return `Result<T, String>` with messages meant for the person at
//! the keyboard; the typed error is logged before it is flattened.

pub mod chat;
pub mod knowledge;

use crate::error::AppError;

pub(crate) fn user_facing(err: AppError) -> String {
    tracing::error!(error = %err, "Command failed");
    match err {
        AppError::Persistence(_) => {
            "Conversation storage is unavailable right now, so nothing was saved. Please try again in a moment.".to_string()
        }
        AppError::ServiceUnavailable { service, .. } => format!(
            "The {service} service did not respond. Please try again in a moment."
        ),
        AppError::NotFound(id) => format!("No conversation with id {id} exists."),
        AppError::SessionDeleted(_) => {
            "This conversation was deleted while the answer was being written; the answer was discarded.".to_string()
        }
        AppError::Ingestion { source_id, reason } => {
            format!("Could not add {source_id}: {reason}")
        }
        AppError::Config(reason) => format!("Configuration problem: {reason}"),
    }
}
