//! Disk-backed vector index over embedded document chunks.
//!
//! Chunks live in one SQLite table keyed by collection. Every mutation runs in
//! a single transaction on the shared connection, so a search sees either all
//! of an upsert or none of it, and the index survives restarts.

use rusqlite::{params, OptionalExtension};
use std::cmp::Ordering;
use std::path::Path;

use crate::chunker::{Chunk, ChunkMetadata};
use crate::db::models::SourceSummary;
use crate::db::{Database, Migration, MigrationStep};
use crate::embedding::{bytes_to_embedding, cosine_similarity, embedding_to_bytes};
use crate::error::{AppError, Result};

pub static MIGRATIONS: &[Migration] = &[
    Migration {
        id: "0001_create_chunks",
        step: MigrationStep::Sql(
            "CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                collection TEXT NOT NULL,
                source TEXT NOT NULL,
                seq INTEGER NOT NULL,
                content TEXT NOT NULL,
                page INTEGER,
                start_offset INTEGER NOT NULL DEFAULT 0,
                embedding BLOB NOT NULL,
                inserted_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        ),
    },
    Migration {
        id: "0002_chunks_source_index",
        step: MigrationStep::Sql(
            "CREATE INDEX IF NOT EXISTS idx_chunks_collection_source ON chunks(collection, source);",
        ),
    },
];

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

pub struct VectorIndex {
    db: Database,
    collection: String,
}

impl VectorIndex {
    pub fn open(path: &Path, collection: &str) -> Result<Self> {
        Ok(Self {
            db: Database::open(path, MIGRATIONS)?,
            collection: collection.to_string(),
        })
    }

    /// Insert chunks with their embeddings, replacing any earlier chunks of the same sources.
    pub fn upsert(&self, chunks: &[Chunk], embeddings: &[Vec<f32>]) -> Result<usize> {
        if chunks.len() != embeddings.len() {
            return Err(AppError::Persistence(format!(
                "{} chunks but {} embeddings",
                chunks.len(),
                embeddings.len()
            )));
        }

        let mut sources: Vec<&str> = chunks.iter().map(|c| c.metadata.source.as_str()).collect();
        sources.sort_unstable();
        sources.dedup();

        let inserted = self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            for source in &sources {
                tx.execute(
                    "DELETE FROM chunks WHERE collection = ?1 AND source = ?2",
                    params![self.collection, source],
                )?;
            }
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO chunks (id, collection, source, seq, content, page, start_offset, embedding)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;
                for (chunk, embedding) in chunks.iter().zip(embeddings) {
                    stmt.execute(params![
                        uuid::Uuid::new_v4().to_string(),
                        self.collection,
                        chunk.metadata.source,
                        chunk.sequence_index as i64,
                        chunk.text,
                        chunk.metadata.page,
                        chunk.start_offset as i64,
                        embedding_to_bytes(embedding),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(chunks.len())
        })?;

        tracing::debug!(collection = %self.collection, sources = ?sources, inserted, "Upserted chunks");
        Ok(inserted)
    }

    /// The `k` chunks most similar to `query`, best first; ties keep insertion order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredChunk>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let rows = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT source, seq, content, page, start_offset, embedding
                 FROM chunks WHERE collection = ?1 ORDER BY rowid ASC",
            )?;
            let rows = stmt.query_map(params![self.collection], |row| {
                let bytes: Vec<u8> = row.get(5)?;
                let source: String = row.get(0)?;
                let seq: i64 = row.get(1)?;
                let start: i64 = row.get(4)?;
                Ok((
                    Chunk {
                        source_id: source.clone(),
                        sequence_index: seq as usize,
                        text: row.get(2)?,
                        start_offset: start as usize,
                        metadata: ChunkMetadata {
                            source,
                            page: row.get(3)?,
                        },
                    },
                    bytes_to_embedding(&bytes),
                ))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;

        let mut scored: Vec<ScoredChunk> = rows
            .into_iter()
            .map(|(chunk, embedding)| ScoredChunk {
                score: cosine_similarity(query, &embedding),
                chunk,
            })
            .collect();

        // stable sort keeps rowid order among equal scores
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    /// Remove every chunk of `source`. Unknown sources are a no-op.
    pub fn delete_source(&self, source: &str) -> Result<usize> {
        let removed = self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM chunks WHERE collection = ?1 AND source = ?2",
                params![self.collection, source],
            )
        })?;
        tracing::info!(collection = %self.collection, source, removed, "Deleted source from index");
        Ok(removed)
    }

    /// Remove every chunk in the collection.
    pub fn clear(&self) -> Result<usize> {
        let removed = self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM chunks WHERE collection = ?1",
                params![self.collection],
            )
        })?;
        tracing::info!(collection = %self.collection, removed, "Cleared index");
        Ok(removed)
    }

    pub fn count(&self) -> Result<usize> {
        let count: i64 = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM chunks WHERE collection = ?1",
                params![self.collection],
                |row| row.get(0),
            )
        })?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        let any: Option<i64> = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT 1 FROM chunks WHERE collection = ?1 LIMIT 1",
                params![self.collection],
                |row| row.get(0),
            )
            .optional()
        })?;
        Ok(any.is_none())
    }

    /// Loaded documents with their chunk counts, in first-ingested order.
    pub fn sources(&self) -> Result<Vec<SourceSummary>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT source, COUNT(*) FROM chunks WHERE collection = ?1
                 GROUP BY source ORDER BY MIN(rowid) ASC",
            )?;
            let rows = stmt.query_map(params![self.collection], |row| {
                let count: i64 = row.get(1)?;
                Ok(SourceSummary {
                    source: row.get(0)?,
                    chunk_count: count as usize,
                })
            })?;
            rows.collect()
        })
    }
}
