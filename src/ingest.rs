//! Document ingestion: load -> chunk -> embed -> upsert.

use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::chunker::Chunker;
use crate::config::{EmbeddingConfig, UploadConfig};
use crate::db::models::SourceSummary;
use crate::doc_processor::{self, LoadedDocument};
use crate::embedding::Embedder;
use crate::error::{AppError, Result};
use crate::service::call_with_retry;
use crate::vector_index::VectorIndex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestResult {
    pub source_id: String,
    pub chunk_count: usize,
}

pub struct IngestionPipeline {
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    chunker: Chunker,
    limits: UploadConfig,
    embedding: EmbeddingConfig,
}

impl IngestionPipeline {
    pub fn new(
        index: Arc<VectorIndex>,
        embedder: Arc<dyn Embedder>,
        chunker: Chunker,
        limits: UploadConfig,
        embedding: EmbeddingConfig,
    ) -> Self {
        Self {
            index,
            embedder,
            chunker,
            limits,
            embedding,
        }
    }

    /// Ingest one uploaded file, replacing any earlier upload with the same file name.
    pub async fn ingest(&self, path: &Path) -> Result<IngestResult> {
        let path = path.to_path_buf();
        let limits = self.limits.clone();
        let source_id = doc_processor::source_id_for(&path);

        // PDF extraction is CPU bound
        let document = tokio::task::spawn_blocking(move || doc_processor::load_file(&path, &limits))
            .await
            .map_err(|e| AppError::ingestion(&source_id, format!("loader task failed: {e}")))??;

        self.ingest_document(document).await
    }

    /// Chunk, embed and store an already loaded document.
    ///
    /// All embeddings are gathered before the single upsert, so an embedding
    /// failure leaves the index exactly as it was.
    pub async fn ingest_document(&self, document: LoadedDocument) -> Result<IngestResult> {
        let source_id = document.source_id.clone();
        let chunks = self.chunker.split(&source_id, &document.pages);
        if chunks.is_empty() {
            return Err(AppError::ingestion(
                source_id,
                "Document is empty or could not be parsed",
            ));
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let batches: Vec<Vec<String>> = texts
            .chunks(self.embedding.batch_size.max(1))
            .map(<[String]>::to_vec)
            .collect();
        let batch_count = batches.len();

        let embedded: Vec<Vec<Vec<f32>>> = stream::iter(batches)
            .map(|batch| async move {
                let vectors = call_with_retry("embedding", &self.embedding.calls, || {
                    self.embedder.embed_batch(&batch)
                })
                .await?;
                if vectors.len() != batch.len() {
                    return Err(AppError::unavailable(
                        "embedding",
                        format!("expected {} vectors, got {}", batch.len(), vectors.len()),
                    ));
                }
                Ok(vectors)
            })
            .buffered(self.embedding.concurrency.max(1))
            .try_collect::<Vec<_>>()
            .await
            .inspect_err(|e| {
                tracing::warn!(source_id = %source_id, error = %e, "Embedding failed, nothing stored");
            })?;
        let embeddings: Vec<Vec<f32>> = embedded.into_iter().flatten().collect();

        let index = Arc::clone(&self.index);
        let chunk_count = tokio::task::spawn_blocking(move || index.upsert(&chunks, &embeddings))
            .await
            .map_err(|e| AppError::Persistence(format!("index task failed: {e}")))??;

        tracing::info!(
            source_id = %source_id,
            file_type = %document.file_type,
            pages = document.pages.len(),
            chars = document.total_chars(),
            batches = batch_count,
            chunk_count,
            "Ingested document"
        );
        Ok(IngestResult {
            source_id,
            chunk_count,
        })
    }

    /// Drop a document from the index. Unknown documents are a no-op.
    pub fn remove(&self, source_id: &str) -> Result<usize> {
        self.index.delete_source(source_id)
    }

    /// Drop every document.
    pub fn reset(&self) -> Result<usize> {
        self.index.clear()
    }

    pub fn sources(&self) -> Result<Vec<SourceSummary>> {
        self.index.sources()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::Page;
    use crate::config::ChunkingConfig;
    use crate::embedding::EmbeddingError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Embeds by character classes; fails every call after `fail_after` successful ones.
    struct CountingEmbedder {
        calls: AtomicUsize,
        fail_after: usize,
    }

    impl CountingEmbedder {
        fn new(fail_after: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_after,
            }
        }
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) >= self.fail_after {
                return Err(EmbeddingError::Api {
                    status: 400,
                    message: "rejected".into(),
                });
            }
            Ok(texts
                .iter()
                .map(|t| {
                    let vowels = t.chars().filter(|c| "aeiou".contains(*c)).count() as f32;
                    vec![vowels + 1.0, t.len() as f32]
                })
                .collect())
        }
    }

    fn pipeline(dir: &tempfile::TempDir, embedder: Arc<dyn Embedder>) -> IngestionPipeline {
        let index = Arc::new(VectorIndex::open(&dir.path().join("vectors.db"), "documents").unwrap());
        let chunker = Chunker::new(ChunkingConfig {
            chunk_size: 100,
            chunk_overlap: 20,
        })
        .unwrap();
        let embedding = EmbeddingConfig {
            batch_size: 2,
            ..EmbeddingConfig::default()
        };
        IngestionPipeline::new(index, embedder, chunker, UploadConfig::default(), embedding)
    }

    fn document(name: &str, words: usize) -> LoadedDocument {
        LoadedDocument {
            source_id: name.to_string(),
            file_type: "txt".into(),
            pages: vec![Page::new("lorem ipsum dolor ".repeat(words), None)],
        }
    }

    #[tokio::test]
    async fn test_ingest_reports_chunk_count() {
        let dir = tempfile::TempDir::new().unwrap();
        let pipeline = pipeline(&dir, Arc::new(CountingEmbedder::new(usize::MAX)));
        let result = pipeline.ingest_document(document("notes.txt", 40)).await.unwrap();
        assert_eq!(result.source_id, "notes.txt");
        assert!(result.chunk_count > 1);
        assert_eq!(
            pipeline.sources().unwrap(),
            vec![SourceSummary {
                source: "notes.txt".into(),
                chunk_count: result.chunk_count
            }]
        );
    }

    #[tokio::test]
    async fn test_reingest_does_not_duplicate() {
        let dir = tempfile::TempDir::new().unwrap();
        let pipeline = pipeline(&dir, Arc::new(CountingEmbedder::new(usize::MAX)));
        let first = pipeline.ingest_document(document("notes.txt", 40)).await.unwrap();
        let second = pipeline.ingest_document(document("notes.txt", 40)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(pipeline.sources().unwrap()[0].chunk_count, first.chunk_count);
    }

    #[tokio::test]
    async fn test_embedding_failure_commits_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let pipeline = pipeline(&dir, Arc::new(CountingEmbedder::new(1)));

        let err = pipeline
            .ingest_document(document("notes.txt", 40))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ServiceUnavailable { service: "embedding", .. }));
        assert!(pipeline.sources().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_reupload_keeps_previous_version() {
        let dir = tempfile::TempDir::new().unwrap();
        let good = pipeline(&dir, Arc::new(CountingEmbedder::new(usize::MAX)));
        let stored = good.ingest_document(document("notes.txt", 40)).await.unwrap();

        let flaky = pipeline(&dir, Arc::new(CountingEmbedder::new(0)));
        assert!(flaky.ingest_document(document("notes.txt", 10)).await.is_err());
        assert_eq!(flaky.sources().unwrap()[0].chunk_count, stored.chunk_count);
    }

    #[tokio::test]
    async fn test_ingest_file_rejects_unsupported_type() {
        let dir = tempfile::TempDir::new().unwrap();
        let pipeline = pipeline(&dir, Arc::new(CountingEmbedder::new(usize::MAX)));
        let path = dir.path().join("archive.zip");
        std::fs::write(&path, b"PK").unwrap();
        let err = pipeline.ingest(&path).await.unwrap_err();
        assert!(matches!(err, AppError::Ingestion { .. }));
    }

    #[tokio::test]
    async fn test_remove_and_reset() {
        let dir = tempfile::TempDir::new().unwrap();
        let pipeline = pipeline(&dir, Arc::new(CountingEmbedder::new(usize::MAX)));
        pipeline.ingest_document(document("a.txt", 5)).await.unwrap();
        pipeline.ingest_document(document("b.txt", 5)).await.unwrap();

        assert_eq!(pipeline.remove("a.txt").unwrap(), 1);
        assert_eq!(pipeline.remove("a.txt").unwrap(), 0);
        assert_eq!(pipeline.sources().unwrap().len(), 1);
        assert_eq!(pipeline.reset().unwrap(), 1);
        assert!(pipeline.sources().unwrap().is_empty());
    }
}
