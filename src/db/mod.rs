pub mod models;

use rusqlite::{params, Connection, ErrorCode};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{AppError, Result};

/// One forward-only schema change.
pub struct Migration {
    pub id: &'static str,
    pub step: MigrationStep,
}

pub enum MigrationStep {
    /// Idempotent DDL such as `CREATE TABLE IF NOT EXISTS`.
    Sql(&'static str),
    /// Adds a column unless the table already has it.
    AddColumn {
        table: &'static str,
        column: &'static str,
        decl: &'static str,
    },
}

/// A single SQLite connection shared behind a mutex.
///
/// The connection is dropped when SQLite reports an I/O class failure and
/// reopened (and re-migrated) on the next call, so a store outage rejects
/// calls while it lasts instead of poisoning the process.
pub struct Database {
    path: PathBuf,
    migrations: &'static [Migration],
    conn: Mutex<Option<Connection>>,
}

impl Database {
    pub fn open(path: &Path, migrations: &'static [Migration]) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    AppError::Persistence(format!("cannot create {}: {e}", parent.display()))
                })?;
            }
        }
        let conn = connect(path, migrations)?;
        Ok(Self {
            path: path.to_path_buf(),
            migrations,
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Run `f` against the connection, reconnecting first if a previous call lost it.
    pub fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>) -> Result<T> {
        let mut guard = self.conn.lock().map_err(|_| AppError::poisoned("database"))?;
        if guard.is_none() {
            tracing::info!(path = %self.path.display(), "Reopening database connection");
            *guard = Some(connect(&self.path, self.migrations)?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(AppError::Persistence("database connection unavailable".into()));
        };
        match f(conn) {
            Ok(value) => Ok(value),
            Err(err) => {
                if is_connection_failure(&err) {
                    tracing::warn!(path = %self.path.display(), error = %err, "Dropping failed database connection");
                    *guard = None;
                }
                Err(err.into())
            }
        }
    }
}

fn connect(path: &Path, migrations: &[Migration]) -> Result<Connection> {
    let mut conn = Connection::open(path)?;
    conn.execute_batch(
        "
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA busy_timeout=5000;
        ",
    )?;
    migrate(&mut conn, migrations)?;
    Ok(conn)
}

/// Apply every migration not yet recorded in `schema_migrations`, in order.
pub fn migrate(conn: &mut Connection, migrations: &[Migration]) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            id TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    for migration in migrations {
        let applied: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE id = ?1)",
            params![migration.id],
            |row| row.get(0),
        )?;
        if applied {
            continue;
        }

        let tx = conn.transaction()?;
        match &migration.step {
            MigrationStep::Sql(sql) => tx.execute_batch(sql)?,
            MigrationStep::AddColumn {
                table,
                column,
                decl,
            } => {
                if !has_column(&tx, table, column)? {
                    tx.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl};"))?;
                }
            }
        }
        tx.execute(
            "INSERT INTO schema_migrations (id) VALUES (?1)",
            params![migration.id],
        )?;
        tx.commit()?;
        tracing::debug!(migration = migration.id, "Applied migration");
    }
    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn is_connection_failure(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => matches!(
            e.code,
            ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::DatabaseCorrupt
                | ErrorCode::NotADatabase
                | ErrorCode::ReadOnly
        ),
        _ => false,
    }
}
