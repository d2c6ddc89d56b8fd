use std::path::Path;

use super::user_facing;
use crate::db::models::SourceSummary;
use crate::state::AppState;

/// Ingest one file and describe the outcome.
pub async fn upload_document(state: &AppState, file_path: &Path) -> Result<String, String> {
    let result = state.pipeline.ingest(file_path).await.map_err(user_facing)?;
    Ok(format!(
        "Loaded {}: {} chunks indexed.",
        result.source_id, result.chunk_count
    ))
}

pub fn list_documents(state: &AppState) -> Result<Vec<SourceSummary>, String> {
    state.pipeline.sources().map_err(user_facing)
}

pub fn delete_document(state: &AppState, source_id: &str) -> Result<String, String> {
    let removed = state.pipeline.remove(source_id).map_err(user_facing)?;
    Ok(if removed == 0 {
        format!("{source_id} was not loaded.")
    } else {
        format!("Removed {source_id} ({removed} chunks).")
    })
}

pub fn clear_knowledge_base(state: &AppState) -> Result<String, String> {
    let removed = state.pipeline.reset().map_err(user_facing)?;
    Ok(format!("Knowledge base cleared ({removed} chunks removed)."))
}
