use std::sync::Arc;

use crate::chunker::Chunker;
use crate::composer::{AnswerComposer, ComposerSettings};
use crate::config::AppConfig;
use crate::conversation::{ConversationStore, SubjectPolicy};
use crate::embedding::{Embedder, OpenAiEmbedder};
use crate::error::Result;
use crate::ingest::IngestionPipeline;
use crate::llm::{LanguageModel, ProviderModel};
use crate::vector_index::VectorIndex;

/// Process-wide components, built once and handed to the command layer.
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<ConversationStore>,
    pub index: Arc<VectorIndex>,
    pub pipeline: IngestionPipeline,
    pub composer: AnswerComposer,
}

impl AppState {
    /// Open the on-disk stores named in `config` and connect the configured services.
    pub fn from_config(config: AppConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(ConversationStore::open(
            &config.storage.history_path(),
            SubjectPolicy::from(&config.policy),
        )?);
        let index = Arc::new(VectorIndex::open(
            &config.storage.vector_path(),
            &config.storage.collection,
        )?);
        let embedder: Arc<dyn Embedder> = Arc::new(OpenAiEmbedder::new(&config.embedding));
        let llm: Arc<dyn LanguageModel> = Arc::new(ProviderModel::new(&config.llm));

        tracing::info!(
            data_dir = %config.storage.data_dir.display(),
            provider = %config.llm.provider,
            model = %config.llm.model,
            "Opened docchat state"
        );
        Self::with_services(config, store, index, embedder, llm)
    }

    /// Assemble the state from explicit dependencies.
    pub fn with_services(
        config: AppConfig,
        store: Arc<ConversationStore>,
        index: Arc<VectorIndex>,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn LanguageModel>,
    ) -> Result<Self> {
        let chunker = Chunker::new(config.chunking)?;
        let pipeline = IngestionPipeline::new(
            Arc::clone(&index),
            Arc::clone(&embedder),
            chunker,
            config.upload.clone(),
            config.embedding.clone(),
        );
        let composer = AnswerComposer::new(
            Arc::clone(&store),
            Arc::clone(&index),
            embedder,
            llm,
            ComposerSettings::from(&config),
        );
        Ok(Self {
            config,
            store,
            index,
            pipeline,
            composer,
        })
    }
}
