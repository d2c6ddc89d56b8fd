//! Configuration for docchat.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! `./docchat.toml` -> explicit file -> `DOCCHAT_` environment variables.
//! Nested keys use a double underscore, e.g. `DOCCHAT_LLM__MODEL=gpt-4o`.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub chunking: ChunkingConfig,
    pub upload: UploadConfig,
    pub retrieval: RetrievalConfig,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub policy: PolicyConfig,
    /// Named persona presets selectable by name instead of free text.
    pub personas: PersonaPresets,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding both SQLite files.
    pub data_dir: PathBuf,
    pub history_db: String,
    pub vector_db: String,
    /// Name of the shared vector collection.
    pub collection: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = directories::ProjectDirs::from("dev", "docchat", "docchat")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".docchat"));
        Self {
            data_dir,
            history_db: "history.db".into(),
            vector_db: "vectors.db".into(),
            collection: "documents".into(),
        }
    }
}

impl StorageConfig {
    pub fn history_path(&self) -> PathBuf {
        self.data_dir.join(&self.history_db)
    }

    pub fn vector_path(&self) -> PathBuf {
        self.data_dir.join(&self.vector_db)
    }
}

/// Window and overlap, both measured in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub allowed_extensions: Vec<String>,
    pub max_file_bytes: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            allowed_extensions: vec!["pdf".into(), "txt".into(), "md".into()],
            max_file_bytes: 20 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self { top_k: 3 }
    }
}

/// Timeout and retry budget for one external service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallPolicy {
    pub timeout_secs: u64,
    /// Retries after the first attempt, for transient failures only.
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            max_retries: 1,
            backoff_ms: 500,
        }
    }
}

impl CallPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// "openai", "claude" or "ollama".
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub calls: CallPolicy,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            model: "gpt-4o-mini".into(),
            base_url: None,
            api_key: None,
            max_tokens: 4096,
            calls: CallPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    /// Texts sent per embedding request.
    pub batch_size: usize,
    /// Embedding requests allowed in flight during one ingestion.
    pub concurrency: usize,
    pub calls: CallPolicy,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "text-embedding-3-small".into(),
            base_url: None,
            api_key: None,
            batch_size: 20,
            concurrency: 2,
            calls: CallPolicy {
                timeout_secs: 30,
                ..CallPolicy::default()
            },
        }
    }
}

/// Wording that answers and session listings depend on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub default_persona: String,
    /// Returned verbatim in strict mode when the documents do not contain the answer.
    pub refusal_phrase: String,
    /// Shown in strict mode when retrieval itself failed.
    pub degraded_message: String,
    pub sources_header: String,
    /// `{index}`, `{source}` and `{page}` are substituted.
    pub citation_with_page: String,
    /// `{index}` and `{source}` are substituted.
    pub citation_without_page: String,
    pub subject_max_chars: usize,
    pub subject_ellipsis: String,
    pub subject_placeholder: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            default_persona: "You are a helpful assistant.".into(),
            refusal_phrase: "I'm sorry, but the provided documents do not contain the answer to that question.".into(),
            degraded_message: "Document search is temporarily unavailable, so I can't give a grounded answer right now. Please try again shortly.".into(),
            sources_header: "**Sources:**".into(),
            citation_with_page: "{index}. {source}, Page {page}".into(),
            citation_without_page: "{index}. {source}".into(),
            subject_max_chars: 50,
            subject_ellipsis: "...".into(),
            subject_placeholder: "New Chat".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersonaPresets(pub BTreeMap<String, String>);

impl Default for PersonaPresets {
    fn default() -> Self {
        let mut presets = BTreeMap::new();
        presets.insert(
            "assistant".to_string(),
            "You are a helpful assistant.".to_string(),
        );
        presets.insert(
            "eli5".to_string(),
            "You are a helpful assistant that explains concepts like I am 5 years old.".to_string(),
        );
        presets.insert(
            "concise".to_string(),
            "You are a precise assistant. Answer in as few sentences as possible.".to_string(),
        );
        Self(presets)
    }
}

impl PersonaPresets {
    /// Resolve a preset name to its directive; anything else is taken as a free-text directive.
    pub fn resolve<'a>(&'a self, persona: &'a str, fallback: &'a str) -> &'a str {
        let trimmed = persona.trim();
        if trimmed.is_empty() {
            return fallback;
        }
        self.0
            .get(trimmed)
            .map(String::as_str)
            .unwrap_or(trimmed)
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        let chunking = &self.chunking;
        if chunking.chunk_size == 0 {
            return Err(AppError::Config("chunking.chunk_size must be positive".into()));
        }
        if chunking.chunk_overlap >= chunking.chunk_size {
            return Err(AppError::Config(format!(
                "chunking.chunk_overlap ({}) must be smaller than chunking.chunk_size ({})",
                chunking.chunk_overlap, chunking.chunk_size
            )));
        }
        if self.retrieval.top_k == 0 {
            return Err(AppError::Config("retrieval.top_k must be positive".into()));
        }
        if self.embedding.batch_size == 0 {
            return Err(AppError::Config("embedding.batch_size must be positive".into()));
        }
        if !matches!(self.llm.provider.as_str(), "openai" | "claude" | "ollama") {
            return Err(AppError::Config(format!(
                "unknown llm.provider '{}'",
                self.llm.provider
            )));
        }
        Ok(())
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Environment variables (prefixed with `DOCCHAT_`)
/// 2. Explicit config file
/// 3. `./docchat.toml`
/// 4. User config (`<config dir>/docchat/config.toml`)
/// 5. Built-in defaults
pub fn load_config(explicit: Option<&Path>) -> Result<AppConfig> {
    let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

    if let Some(dirs) = directories::ProjectDirs::from("dev", "docchat", "docchat") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    let local = Path::new("docchat.toml");
    if local.exists() {
        figment = figment.merge(Toml::file(local));
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(AppError::Config(format!(
                "config file {} does not exist",
                path.display()
            )));
        }
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("DOCCHAT_").split("__"));

    let mut config: AppConfig = figment
        .extract()
        .map_err(|e| AppError::Config(e.to_string()))?;

    if config.llm.api_key.is_none() {
        let var = match config.llm.provider.as_str() {
            "claude" => Some("ANTHROPIC_API_KEY"),
            "openai" => Some("OPENAI_API_KEY"),
            _ => None,
        };
        config.llm.api_key = var.and_then(|v| std::env::var(v).ok());
    }
    if config.embedding.api_key.is_none() {
        config.embedding.api_key = std::env::var("OPENAI_API_KEY").ok();
    }

    config.validate()?;
    Ok(config)
}
