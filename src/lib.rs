//! Retrieval-augmented chat over uploaded documents with persistent,
//! subject-labelled conversation sessions.

pub mod chunker;
pub mod commands;
pub mod composer;
pub mod config;
pub mod conversation;
pub mod db;
pub mod doc_processor;
pub mod embedding;
pub mod error;
pub mod ingest;
pub mod llm;
pub mod service;
pub mod state;
pub mod vector_index;

pub use composer::{AnswerComposer, AnswerResult, SourceRef};
pub use config::{load_config, AppConfig};
pub use conversation::ConversationStore;
pub use error::{AppError, Result};
pub use ingest::{IngestResult, IngestionPipeline};
pub use state::AppState;
pub use vector_index::VectorIndex;
