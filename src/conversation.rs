//! Durable conversation history, one append-only message log per session.
//!
//! Sessions have no table of their own: a session is the set of messages
//! sharing a `session_id`. Every message of a session carries the same
//! `subject`, taken from the first user message and changed only by `rename`.

use rusqlite::{params, Connection, Transaction};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use crate::config::PolicyConfig;
use crate::db::models::{Message, Role, SessionSummary};
use crate::db::{Database, Migration, MigrationStep};
use crate::error::{AppError, Result};

pub static MIGRATIONS: &[Migration] = &[
    Migration {
        id: "0001_create_messages",
        step: MigrationStep::Sql(
            "CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );",
        ),
    },
    Migration {
        id: "0002_messages_subject",
        step: MigrationStep::AddColumn {
            table: "messages",
            column: "subject",
            decl: "TEXT",
        },
    },
    Migration {
        id: "0003_messages_indexes",
        step: MigrationStep::Sql(
            "CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, created_at);
             CREATE INDEX IF NOT EXISTS idx_messages_subject ON messages(subject);",
        ),
    },
];

/// Cuts a first user message down to a session subject.
#[derive(Debug, Clone)]
pub struct SubjectPolicy {
    pub max_chars: usize,
    pub ellipsis: String,
    pub placeholder: String,
}

impl From<&PolicyConfig> for SubjectPolicy {
    fn from(policy: &PolicyConfig) -> Self {
        Self {
            max_chars: policy.subject_max_chars,
            ellipsis: policy.subject_ellipsis.clone(),
            placeholder: policy.subject_placeholder.clone(),
        }
    }
}

impl Default for SubjectPolicy {
    fn default() -> Self {
        Self::from(&PolicyConfig::default())
    }
}

impl SubjectPolicy {
    /// The first user message itself, cut to `max_chars` characters; blank messages get the placeholder.
    pub fn derive(&self, first_message: &str) -> String {
        if first_message.trim().is_empty() {
            return self.placeholder.clone();
        }
        if first_message.chars().count() <= self.max_chars {
            return first_message.to_string();
        }
        let mut subject: String = first_message.chars().take(self.max_chars).collect();
        subject.push_str(&self.ellipsis);
        subject
    }
}

/// Deletion counter and number of unfinished turns for one session.
#[derive(Debug, Default)]
struct LiveSession {
    epoch: u64,
    in_flight: usize,
}

/// A turn being answered. Saving it fails if the session was deleted after
/// the turn began; dropping it stops tracking the session once no other turn
/// is in flight.
pub struct TurnGuard<'a> {
    store: &'a ConversationStore,
    session_id: String,
    epoch: u64,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        let Ok(mut live) = self.store.live.lock() else {
            return;
        };
        if let Some(session) = live.get_mut(&self.session_id) {
            session.in_flight = session.in_flight.saturating_sub(1);
            if session.in_flight == 0 {
                live.remove(&self.session_id);
            }
        }
    }
}

pub struct ConversationStore {
    db: Database,
    subjects: SubjectPolicy,
    /// Sessions with a turn in flight.
    live: Mutex<HashMap<String, LiveSession>>,
}

impl ConversationStore {
    pub fn open(path: &Path, subjects: SubjectPolicy) -> Result<Self> {
        Ok(Self {
            db: Database::open(path, MIGRATIONS)?,
            subjects,
            live: Mutex::new(HashMap::new()),
        })
    }

    pub fn new_session_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Append one message, deriving the session subject if this is its first user message.
    pub fn append(&self, session_id: &str, role: Role, content: &str) -> Result<Message> {
        let subject = self.subjects.derive(content);
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let id = insert_message(&tx, session_id, role, content, &subject)?;
            let message = load_message(&tx, id)?;
            tx.commit()?;
            Ok(message)
        })
    }

    /// Start tracking a turn so a concurrent `delete` can invalidate it.
    pub fn begin_turn(&self, session_id: &str) -> Result<TurnGuard<'_>> {
        let mut live = self.live.lock().map_err(|_| AppError::poisoned("live sessions"))?;
        let session = live.entry(session_id.to_string()).or_default();
        session.in_flight += 1;
        Ok(TurnGuard {
            store: self,
            session_id: session_id.to_string(),
            epoch: session.epoch,
        })
    }

    /// Persist a user message and its answer together, unless the session was
    /// deleted after `turn` began.
    pub fn append_turn_if_live(
        &self,
        turn: &TurnGuard<'_>,
        user_message: &str,
        answer: &str,
    ) -> Result<(Message, Message)> {
        let session_id = turn.session_id.as_str();
        let live = self.live.lock().map_err(|_| AppError::poisoned("live sessions"))?;
        if live.get(session_id).map(|s| s.epoch) != Some(turn.epoch) {
            tracing::info!(session_id, "Discarding answer for deleted session");
            return Err(AppError::SessionDeleted(session_id.to_string()));
        }

        let subject = self.subjects.derive(user_message);
        let saved = self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let user_id = insert_message(&tx, session_id, Role::User, user_message, &subject)?;
            let answer_id = insert_message(&tx, session_id, Role::Assistant, answer, &subject)?;
            let saved = (load_message(&tx, user_id)?, load_message(&tx, answer_id)?);
            tx.commit()?;
            Ok(saved)
        })?;
        drop(live);
        Ok(saved)
    }

    /// Messages of a session, oldest first. Unknown sessions yield an empty list.
    pub fn history(&self, session_id: &str) -> Result<Vec<Message>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, role, content, created_at, subject FROM messages
                 WHERE session_id = ?1 ORDER BY created_at ASC, id ASC",
            )?;
            let rows = stmt.query_map(params![session_id], map_message)?;
            rows.collect()
        })
    }

    /// One row per session, newest session first.
    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let placeholder = self.subjects.placeholder.clone();
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, MAX(subject), MIN(created_at) AS started FROM messages
                 GROUP BY session_id ORDER BY started DESC, MIN(id) DESC",
            )?;
            let rows = stmt.query_map([], |row| {
                let subject: Option<String> = row.get(1)?;
                Ok(SessionSummary {
                    session_id: row.get(0)?,
                    subject: subject.unwrap_or_else(|| placeholder.clone()),
                    created_at: row.get(2)?,
                })
            })?;
            rows.collect()
        })
    }

    pub fn rename(&self, session_id: &str, new_subject: &str) -> Result<()> {
        let updated = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE messages SET subject = ?1 WHERE session_id = ?2",
                params![new_subject, session_id],
            )
        })?;
        if updated == 0 {
            return Err(AppError::NotFound(session_id.to_string()));
        }
        tracing::info!(session_id, subject = new_subject, "Renamed session");
        Ok(())
    }

    /// Remove every message of a session. Deleting an unknown session is a no-op.
    pub fn delete(&self, session_id: &str) -> Result<usize> {
        let mut live = self.live.lock().map_err(|_| AppError::poisoned("live sessions"))?;
        if let Some(session) = live.get_mut(session_id) {
            session.epoch += 1;
        }
        let removed = self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM messages WHERE session_id = ?1",
                params![session_id],
            )
        })?;
        drop(live);
        tracing::info!(session_id, removed, "Deleted session");
        Ok(removed)
    }
}

/// Insert a message and settle the session subject in the same transaction.
///
/// A new row copies any subject the session already has. A user message then
/// sets `subject` on the whole session only where it is still unset, so the
/// first user message wins even under concurrent appends.
fn insert_message(
    tx: &Transaction<'_>,
    session_id: &str,
    role: Role,
    content: &str,
    derived_subject: &str,
) -> rusqlite::Result<i64> {
    tx.execute(
        "INSERT INTO messages (session_id, role, content, created_at, subject)
         VALUES (?1, ?2, ?3, ?4,
                 (SELECT subject FROM messages WHERE session_id = ?1 AND subject IS NOT NULL LIMIT 1))",
        params![session_id, role.as_str(), content, now_timestamp()],
    )?;
    let id = tx.last_insert_rowid();

    if role == Role::User {
        tx.execute(
            "UPDATE messages SET subject = ?2
             WHERE session_id = ?1 AND subject IS NULL
               AND NOT EXISTS (SELECT 1 FROM messages WHERE session_id = ?1 AND subject IS NOT NULL)",
            params![session_id, derived_subject],
        )?;
    }
    Ok(id)
}

fn load_message(conn: &Connection, id: i64) -> rusqlite::Result<Message> {
    conn.query_row(
        "SELECT id, session_id, role, content, created_at, subject FROM messages WHERE id = ?1",
        params![id],
        map_message,
    )
}

fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let role: String = row.get(2)?;
    let role = role.parse::<Role>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(Message {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role,
        content: row.get(3)?,
        created_at: row.get(4)?,
        subject: row.get(5)?,
    })
}

fn now_timestamp() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%dT%H:%M:%S%.6fZ")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn open(dir: &tempfile::TempDir) -> ConversationStore {
        ConversationStore::open(&dir.path().join("history.db"), SubjectPolicy::default()).unwrap()
    }

    #[test]
    fn test_subject_truncation() {
        let policy = SubjectPolicy::default();
        assert_eq!(policy.derive("What is Rust?"), "What is Rust?");
        assert_eq!(policy.derive("  line one\n line  two "), "  line one\n line  two ");
        let long = "a".repeat(60);
        assert_eq!(policy.derive(&long), format!("{}...", "a".repeat(50)));
        assert_eq!(policy.derive(&"é".repeat(50)), "é".repeat(50));
        assert_eq!(policy.derive("   "), "New Chat");
    }

    #[test]
    fn test_history_returns_messages_in_call_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open(&dir);
        for i in 0..5 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            store.append("s1", role, &format!("message {i}")).unwrap();
        }
        let contents: Vec<String> = store
            .history("s1")
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(
            contents,
            (0..5).map(|i| format!("message {i}")).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_unknown_session_has_empty_history() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(open(&dir).history("nope").unwrap().is_empty());
    }

    #[test]
    fn test_first_user_message_sets_subject_for_whole_session() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open(&dir);
        store.append("s1", Role::Assistant, "Hello! Ask me anything.").unwrap();
        store.append("s1", Role::User, "Tell me about the weather in Oslo").unwrap();
        store.append("s1", Role::Assistant, "It is cold.").unwrap();
        store.append("s1", Role::User, "And in Rome?").unwrap();

        let history = store.history("s1").unwrap();
        assert_eq!(history.len(), 4);
        for message in &history {
            assert_eq!(message.subject.as_deref(), Some("Tell me about the weather in Oslo"));
        }
    }

    #[test]
    fn test_concurrent_first_messages_agree_on_one_subject() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(open(&dir));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store.append("race", Role::User, &format!("opener {i}")).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let history = store.history("race").unwrap();
        let first = history[0].content.clone();
        assert!(history.iter().all(|m| m.subject.as_deref() == Some(first.as_str())));
    }

    #[test]
    fn test_list_sessions_newest_first_with_placeholder() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open(&dir);
        store.append("old", Role::User, "First chat").unwrap();
        store.append("mid", Role::Assistant, "Greeting only").unwrap();
        store.append("new", Role::User, "Latest chat").unwrap();
        store.append("old", Role::Assistant, "reply").unwrap();

        let sessions = store.list_sessions().unwrap();
        let ids: Vec<&str> = sessions.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
        assert_eq!(sessions[1].subject, "New Chat");
        assert_eq!(sessions[2].subject, "First chat");
    }

    #[test]
    fn test_rename_changes_only_target_session() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open(&dir);
        store.append("a", Role::User, "Is it raining?").unwrap();
        store.append("b", Role::User, "Explain lifetimes").unwrap();

        store.rename("a", "Weather talk").unwrap();
        let sessions = store.list_sessions().unwrap();
        let subject = |id: &str| {
            sessions
                .iter()
                .find(|s| s.session_id == id)
                .map(|s| s.subject.clone())
                .unwrap()
        };
        assert_eq!(subject("a"), "Weather talk");
        assert_eq!(subject("b"), "Explain lifetimes");

        // later messages inherit the renamed subject
        let next = store.append("a", Role::User, "What about tomorrow?").unwrap();
        assert_eq!(next.subject.as_deref(), Some("Weather talk"));
    }

    #[test]
    fn test_rename_unknown_session_is_not_found() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = open(&dir).rename("ghost", "Anything").unwrap_err();
        assert!(matches!(err, AppError::NotFound(id) if id == "ghost"));
    }

    #[test]
    fn test_delete_is_idempotent_and_clears_history() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open(&dir);
        store.append("s1", Role::User, "hi").unwrap();
        store.append("s2", Role::User, "other").unwrap();

        assert_eq!(store.delete("s1").unwrap(), 1);
        assert_eq!(store.delete("s1").unwrap(), 0);
        assert!(store.history("s1").unwrap().is_empty());
        assert_eq!(store.history("s2").unwrap().len(), 1);
    }

    #[test]
    fn test_turn_discarded_after_delete() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open(&dir);
        store.append("s1", Role::User, "hi").unwrap();

        let turn = store.begin_turn("s1").unwrap();
        store.delete("s1").unwrap();
        let err = store
            .append_turn_if_live(&turn, "question", "answer")
            .unwrap_err();
        assert!(matches!(err, AppError::SessionDeleted(_)));
        assert!(store.history("s1").unwrap().is_empty());
        drop(turn);

        let fresh = store.begin_turn("s1").unwrap();
        let (user, answer) = store
            .append_turn_if_live(&fresh, "question", "answer")
            .unwrap();
        assert_eq!(user.role, Role::User);
        assert_eq!(answer.subject.as_deref(), Some("question"));
    }

    #[test]
    fn test_subject_keeps_message_text_verbatim() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open(&dir);
        store.append("s", Role::User, "Line one\nline  two").unwrap();
        store.append("s", Role::Assistant, "ok").unwrap();
        for message in store.history("s").unwrap() {
            assert_eq!(message.subject.as_deref(), Some("Line one\nline  two"));
        }
    }

    #[test]
    fn test_finished_and_unknown_sessions_are_not_tracked() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open(&dir);
        for i in 0..20 {
            store.delete(&format!("ghost-{i}")).unwrap();
        }
        assert!(store.live.lock().unwrap().is_empty());

        let first = store.begin_turn("s1").unwrap();
        let second = store.begin_turn("s1").unwrap();
        store.append_turn_if_live(&first, "q1", "a1").unwrap();
        drop(first);
        // still tracked while the second turn is open
        assert_eq!(store.live.lock().unwrap().len(), 1);
        store.append_turn_if_live(&second, "q2", "a2").unwrap();
        drop(second);
        assert!(store.live.lock().unwrap().is_empty());
        assert_eq!(store.history("s1").unwrap().len(), 4);
    }

    #[test]
    fn test_subject_column_added_to_legacy_table() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("history.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT NOT NULL,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );
                INSERT INTO messages (session_id, role, content, created_at)
                VALUES ('legacy', 'user', 'old question', '2024-01-01T00:00:00.000000Z');",
            )
            .unwrap();
        }

        let store = ConversationStore::open(&path, SubjectPolicy::default()).unwrap();
        let history = store.history("legacy").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].subject, None);
        assert_eq!(store.list_sessions().unwrap()[0].subject, "New Chat");
    }
}
