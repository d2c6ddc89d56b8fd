pub mod claude;
pub mod openai;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::db::models::{Message, Role};
use crate::service::Transient;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

impl From<&Message> for ChatMessage {
    fn from(message: &Message) -> Self {
        Self::new(message.role.as_str(), message.content.clone())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChatRequest {
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub max_tokens: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
}

/// The chat completion service: `complete(system, history, user_message) -> text`.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(
        &self,
        system: &str,
        history: &[Message],
        user_message: &str,
    ) -> Result<String, LlmError>;
}

/// Unified LLM provider enum; dispatches to OpenAI-compatible or Claude backends.
#[derive(Debug, Clone)]
pub enum Provider {
    OpenAi(openai::OpenAiConfig),
    Claude(claude::ClaudeConfig),
    Ollama(openai::OpenAiConfig),
}

impl Provider {
    pub fn openai(api_key: String) -> Self {
        Provider::OpenAi(openai::OpenAiConfig {
            api_key,
            base_url: "https://api.openai.com/v1".to_string(),
        })
    }

    pub fn claude(api_key: String) -> Self {
        Provider::Claude(claude::ClaudeConfig {
            api_key,
            base_url: "https://api.anthropic.com".to_string(),
        })
    }

    pub fn ollama(host: String) -> Self {
        Provider::Ollama(openai::OpenAiConfig {
            api_key: String::new(),
            base_url: format!("{}/v1", host),
        })
    }

    /// Build the provider named in `config.provider`, honouring a custom base URL.
    pub fn from_config(config: &LlmConfig) -> Self {
        let api_key = config.api_key.clone().unwrap_or_default();
        let mut provider = match config.provider.as_str() {
            "claude" => Provider::claude(api_key),
            "ollama" => Provider::ollama("http://localhost:11434".to_string()),
            _ => Provider::openai(api_key),
        };
        if let Some(base_url) = &config.base_url {
            match &mut provider {
                Provider::OpenAi(c) | Provider::Ollama(c) => c.base_url = base_url.clone(),
                Provider::Claude(c) => c.base_url = base_url.clone(),
            }
        }
        provider
    }

    pub async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        match self {
            Provider::OpenAi(config) | Provider::Ollama(config) => {
                openai::chat(config, request).await
            }
            Provider::Claude(config) => claude::chat(config, request).await,
        }
    }
}

/// A provider bound to one model.
#[derive(Debug, Clone)]
pub struct ProviderModel {
    provider: Provider,
    model: String,
    max_tokens: u32,
}

impl ProviderModel {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            provider: Provider::from_config(config),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        }
    }
}

#[async_trait]
impl LanguageModel for ProviderModel {
    async fn complete(
        &self,
        system: &str,
        history: &[Message],
        user_message: &str,
    ) -> Result<String, LlmError> {
        let mut messages: Vec<ChatMessage> = history.iter().map(ChatMessage::from).collect();
        messages.push(ChatMessage::new(Role::User.as_str(), user_message));

        let request = ChatRequest {
            system: (!system.is_empty()).then(|| system.to_string()),
            messages,
            model: self.model.clone(),
            max_tokens: self.max_tokens,
        };
        let response = self.provider.chat(&request).await?;
        tracing::debug!(
            requested = %self.model,
            served = %response.model,
            chars = response.content.len(),
            "LLM reply received"
        );
        Ok(response.content)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Parse error: {0}")]
    Parse(String),
}

impl Transient for LlmError {
    fn is_transient(&self) -> bool {
        match self {
            LlmError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            LlmError::Api { status, .. } => *status == 429 || *status >= 500,
            LlmError::Parse(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_from_config() {
        let mut config = LlmConfig {
            provider: "claude".into(),
            api_key: Some("sk-test".into()),
            ..LlmConfig::default()
        };
        assert!(matches!(
            Provider::from_config(&config),
            Provider::Claude(ref c) if c.api_key == "sk-test" && c.base_url == "https://api.anthropic.com"
        ));

        config.provider = "ollama".into();
        config.base_url = Some("http://gpu-box:11434/v1".into());
        assert!(matches!(
            Provider::from_config(&config),
            Provider::Ollama(ref c) if c.base_url == "http://gpu-box:11434/v1"
        ));
    }

    #[test]
    fn test_rate_limits_are_transient() {
        let limited = LlmError::Api {
            status: 429,
            message: "slow down".into(),
        };
        assert!(limited.is_transient());
        assert!(!LlmError::Parse("bad json".into()).is_transient());
    }
}
