use serde::Serialize;

use super::user_facing;
use crate::composer::SourceRef;
use crate::conversation::ConversationStore;
use crate::db::models::{Message, SessionSummary};
use crate::state::AppState;

#[derive(Debug, Clone, Serialize)]
pub struct ChatTurn {
    pub response_text: String,
    pub sources: Vec<SourceRef>,
    pub history: Vec<Message>,
}

pub fn new_session() -> String {
    ConversationStore::new_session_id()
}

pub fn list_sessions(state: &AppState) -> Result<Vec<SessionSummary>, String> {
    state.store.list_sessions().map_err(user_facing)
}

pub fn get_history(state: &AppState, session_id: &str) -> Result<Vec<Message>, String> {
    state.store.history(session_id).map_err(user_facing)
}

pub fn rename_session(state: &AppState, session_id: &str, subject: &str) -> Result<(), String> {
    let subject = subject.trim();
    if subject.is_empty() {
        return Err("A conversation name cannot be empty.".to_string());
    }
    state.store.rename(session_id, subject).map_err(user_facing)
}

pub fn delete_session(state: &AppState, session_id: &str) -> Result<(), String> {
    state.store.delete(session_id).map(|_| ()).map_err(user_facing)
}

/// Answer one user message and return the reply together with the updated history.
pub async fn send_message(
    state: &AppState,
    session_id: &str,
    message: &str,
    persona: &str,
    strict_mode: bool,
) -> Result<ChatTurn, String> {
    let message = message.trim();
    if message.is_empty() {
        return Err("Please type a message first.".to_string());
    }

    let answer = state
        .composer
        .answer(session_id, message, persona, strict_mode)
        .await
        .map_err(user_facing)?;

    let history = state.store.history(session_id).map_err(user_facing)?;
    Ok(ChatTurn {
        response_text: answer.text,
        sources: answer.sources,
        history,
    })
}
