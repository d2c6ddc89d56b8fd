//! Answer composition: retrieve context, build the grounded prompt, call the
//! model, cite sources and record the turn.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::chunker::Chunk;
use crate::config::{AppConfig, CallPolicy, PersonaPresets, PolicyConfig};
use crate::conversation::ConversationStore;
use crate::embedding::Embedder;
use crate::error::{AppError, Result};
use crate::llm::LanguageModel;
use crate::service::call_with_retry;
use crate::vector_index::VectorIndex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub source: String,
    pub page: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerResult {
    /// Full reply as stored, including any source block.
    pub text: String,
    pub sources: Vec<SourceRef>,
    /// True when retrieval failed in strict mode and `text` is the degraded-service notice.
    pub degraded: bool,
}

/// Everything the composer needs from configuration.
#[derive(Debug, Clone)]
pub struct ComposerSettings {
    pub top_k: usize,
    pub policy: PolicyConfig,
    pub personas: PersonaPresets,
    pub embedding_calls: CallPolicy,
    pub llm_calls: CallPolicy,
}

impl From<&AppConfig> for ComposerSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            top_k: config.retrieval.top_k,
            policy: config.policy.clone(),
            personas: config.personas.clone(),
            embedding_calls: config.embedding.calls,
            llm_calls: config.llm.calls,
        }
    }
}

enum Retrieval {
    /// Nothing has been uploaded; strict mode has nothing to ground against.
    EmptyIndex,
    Found(Vec<Chunk>),
    Failed(AppError),
}

pub struct AnswerComposer {
    store: Arc<ConversationStore>,
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn LanguageModel>,
    settings: ComposerSettings,
}

impl AnswerComposer {
    pub fn new(
        store: Arc<ConversationStore>,
        index: Arc<VectorIndex>,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn LanguageModel>,
        settings: ComposerSettings,
    ) -> Self {
        Self {
            store,
            index,
            embedder,
            llm,
            settings,
        }
    }

    pub async fn answer(
        &self,
        session_id: &str,
        user_message: &str,
        persona: &str,
        strict_mode: bool,
    ) -> Result<AnswerResult> {
        let policy = &self.settings.policy;
        let turn = self.store.begin_turn(session_id)?;
        let history = self.store.history(session_id)?;

        let context = match self.retrieve(user_message).await {
            Retrieval::Found(chunks) => chunks,
            Retrieval::EmptyIndex => Vec::new(),
            Retrieval::Failed(err) if strict_mode => {
                tracing::warn!(session_id, error = %err, "Retrieval failed in strict mode, refusing to answer");
                return Ok(AnswerResult {
                    text: policy.degraded_message.clone(),
                    sources: Vec::new(),
                    degraded: true,
                });
            }
            Retrieval::Failed(err) => {
                tracing::warn!(session_id, error = %err, "Retrieval failed, answering without context");
                Vec::new()
            }
        };

        // Strict mode only binds when there is something to ground against.
        let grounded = strict_mode && !context.is_empty();
        let system = self.system_prompt(persona, &context, grounded);

        let llm = &self.llm;
        let reply = call_with_retry("llm", &self.settings.llm_calls, || {
            llm.complete(&system, &history, user_message)
        })
        .await?;

        let (text, sources) = if grounded && self.is_refusal(&reply) {
            (policy.refusal_phrase.clone(), Vec::new())
        } else if context.is_empty() {
            (reply, Vec::new())
        } else {
            let sources: Vec<SourceRef> = context
                .iter()
                .map(|c| SourceRef {
                    source: c.metadata.source.clone(),
                    page: c.metadata.page,
                })
                .collect();
            let text = format!("{}{}", reply.trim_end(), self.source_block(&sources));
            (text, sources)
        };

        self.store
            .append_turn_if_live(&turn, user_message, &text)?;

        tracing::info!(
            session_id,
            strict_mode,
            grounded,
            context_chunks = context.len(),
            cited = sources.len(),
            "Answered turn"
        );
        Ok(AnswerResult {
            text,
            sources,
            degraded: false,
        })
    }

    async fn retrieve(&self, user_message: &str) -> Retrieval {
        match self.on_index(|index| index.is_empty()).await {
            Ok(true) => return Retrieval::EmptyIndex,
            Ok(false) => {}
            Err(err) => return Retrieval::Failed(err),
        }

        let embedder = &self.embedder;
        let query = match call_with_retry("embedding", &self.settings.embedding_calls, || {
            embedder.embed(user_message)
        })
        .await
        {
            Ok(query) => query,
            Err(err) => return Retrieval::Failed(err),
        };

        let k = self.settings.top_k;
        match self.on_index(move |index| index.search(&query, k)).await {
            Ok(hits) if hits.is_empty() => Retrieval::EmptyIndex,
            Ok(hits) => Retrieval::Found(hits.into_iter().map(|h| h.chunk).collect()),
            Err(err) => Retrieval::Failed(err),
        }
    }

    /// Run blocking index work off the async workers.
    async fn on_index<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&VectorIndex) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let index = Arc::clone(&self.index);
        tokio::task::spawn_blocking(move || f(index.as_ref()))
            .await
            .map_err(|e| AppError::Persistence(format!("index task failed: {e}")))?
    }

    fn system_prompt(&self, persona: &str, context: &[Chunk], grounded: bool) -> String {
        let policy = &self.settings.policy;
        let mut prompt = self
            .settings
            .personas
            .resolve(persona, &policy.default_persona)
            .to_string();

        if context.is_empty() {
            return prompt;
        }

        if grounded {
            prompt.push_str(&format!(
                "\n\nAnswer the user's question using ONLY the context below. \
                 If the answer is not contained in the context, reply with exactly \
                 the following sentence and nothing else: \"{}\"",
                policy.refusal_phrase
            ));
        } else {
            prompt.push_str(
                "\n\nThe context below was retrieved from the user's documents. \
                 Use it when it is relevant; otherwise answer from your own knowledge.",
            );
        }

        prompt.push_str("\n\nContext:");
        for (i, chunk) in context.iter().enumerate() {
            let label = self.citation(
                i + 1,
                &SourceRef {
                    source: chunk.metadata.source.clone(),
                    page: chunk.metadata.page,
                },
            );
            prompt.push_str(&format!("\n\n[{}]\n{}", label, chunk.text.trim()));
        }
        prompt
    }

    fn is_refusal(&self, reply: &str) -> bool {
        let refusal = self.settings.policy.refusal_phrase.trim();
        let reply = reply.trim().trim_matches('"');
        !refusal.is_empty() && (reply == refusal || reply.contains(refusal))
    }

    fn citation(&self, index: usize, source: &SourceRef) -> String {
        let policy = &self.settings.policy;
        match source.page {
            Some(page) => policy
                .citation_with_page
                .replace("{index}", &index.to_string())
                .replace("{source}", &source.source)
                .replace("{page}", &page.to_string()),
            None => policy
                .citation_without_page
                .replace("{index}", &index.to_string())
                .replace("{source}", &source.source),
        }
    }

    fn source_block(&self, sources: &[SourceRef]) -> String {
        let mut block = format!("\n\n{}", self.settings.policy.sources_header);
        for (i, source) in sources.iter().enumerate() {
            block.push('\n');
            block.push_str(&self.citation(i + 1, source));
        }
        block
    }
}
