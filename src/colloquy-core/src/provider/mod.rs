//! Provider adapters.
//!
//! Every hosted model API is wrapped behind [`ReplyGenerator`]: take a chat
//! request, return the generated text. The set of adapters is closed and
//! represented by [`Provider`], chosen per persona from configuration at
//! startup.

mod gemini;
mod openai;
mod scripted;

pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;
pub use scripted::ScriptedProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::{Config, Credentials};
use crate::error::ColloquyError;
use crate::persona::ProviderKind;

/// Speaker of a history message. System text goes in [`ChatRequest::system`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// A request for one reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    /// Display name of the persona asking; never sent to the API.
    pub persona: String,
    pub model: String,
    /// System instructions.
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

impl ChatRequest {
    /// Merge adjacent messages that share a role and drop empty ones.
    pub fn normalized(mut self) -> Self {
        let mut merged: Vec<ChatMessage> = Vec::with_capacity(self.messages.len());
        for message in self.messages.drain(..) {
            if message.content.trim().is_empty() {
                continue;
            }
            match merged.last_mut() {
                Some(last) if last.role == message.role => {
                    last.content.push_str("\n\n");
                    last.content.push_str(&message.content);
                }
                _ => merged.push(message),
            }
        }
        self.messages = merged;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: None,
        }
    }
}

/// Capability shared by all provider adapters.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn generate(&self, request: &ChatRequest) -> Result<Reply, ColloquyError>;
}

/// The closed set of provider adapters.
pub enum Provider {
    Gemini(GeminiProvider),
    OpenAi(OpenAiProvider),
    Scripted(ScriptedProvider),
}

#[async_trait]
impl ReplyGenerator for Provider {
    fn kind(&self) -> ProviderKind {
        match self {
            Provider::Gemini(p) => p.kind(),
            Provider::OpenAi(p) => p.kind(),
            Provider::Scripted(p) => p.kind(),
        }
    }

    async fn generate(&self, request: &ChatRequest) -> Result<Reply, ColloquyError> {
        match self {
            Provider::Gemini(p) => p.generate(request).await,
            Provider::OpenAi(p) => p.generate(request).await,
            Provider::Scripted(p) => p.generate(request).await,
        }
    }
}

impl From<GeminiProvider> for Provider {
    fn from(p: GeminiProvider) -> Self {
        Provider::Gemini(p)
    }
}

impl From<OpenAiProvider> for Provider {
    fn from(p: OpenAiProvider) -> Self {
        Provider::OpenAi(p)
    }
}

impl From<ScriptedProvider> for Provider {
    fn from(p: ScriptedProvider) -> Self {
        Provider::Scripted(p)
    }
}

/// Build the adapter for `kind` from configuration and credentials.
pub fn build_provider(
    kind: ProviderKind,
    config: &Config,
    credentials: &Credentials,
) -> Result<Provider, ColloquyError> {
    let Some(settings) = config.providers.get(kind) else {
        return Ok(ScriptedProvider::numbered().into());
    };

    let (key, var_name) = credentials.api_key(kind);
    let api_key = key.ok_or_else(|| {
        ColloquyError::ConfigError(format!(
            "{} is not set; it is required for {} personas",
            var_name, kind
        ))
    })?;

    let http_client = http_client(Duration::from_secs(settings.timeout_secs))?;

    let provider = match kind {
        ProviderKind::Gemini => {
            let base = settings
                .api_base
                .clone()
                .unwrap_or_else(|| gemini::DEFAULT_API_BASE.to_string());
            GeminiProvider::new(http_client, api_key, base).into()
        }
        ProviderKind::OpenAi | ProviderKind::DeepSeek | ProviderKind::Grok => {
            let base = settings
                .api_base
                .clone()
                .or_else(|| {
                    if kind == ProviderKind::OpenAi {
                        credentials.openai_api_base.clone()
                    } else {
                        None
                    }
                })
                .unwrap_or_else(|| openai::default_api_base(kind).to_string());
            OpenAiProvider::new(kind, http_client, api_key, base).into()
        }
        ProviderKind::Scripted => ScriptedProvider::numbered().into(),
    };

    tracing::debug!(provider = %kind, "provider client ready");
    Ok(provider)
}

fn http_client(timeout: Duration) -> Result<reqwest::Client, ColloquyError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| ColloquyError::ConfigError(format!("Failed to create HTTP client: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(messages: Vec<ChatMessage>) -> ChatRequest {
        ChatRequest {
            persona: "James".to_string(),
            model: "m".to_string(),
            system: "sys".to_string(),
            messages,
            max_tokens: 100,
            temperature: None,
        }
    }

    #[test]
    fn test_normalized_merges_same_role() {
        let req = request(vec![
            ChatMessage::user("one"),
            ChatMessage::user("two"),
            ChatMessage::assistant("three"),
            ChatMessage::user("   "),
            ChatMessage::assistant("four"),
        ])
        .normalized();

        assert_eq!(
            req.messages,
            vec![
                ChatMessage::user("one\n\ntwo"),
                ChatMessage::assistant("three\n\nfour"),
            ]
        );
    }

    #[test]
    fn test_build_provider_requires_key() {
        let config = crate::config::default_config();
        let creds = Credentials::default();
        let err = build_provider(ProviderKind::Gemini, &config, &creds)
            .err()
            .unwrap();
        assert!(err.to_string().contains("GEMINI_API_KEY"));
    }

    #[test]
    fn test_build_provider_kinds() {
        let config = crate::config::default_config();
        let creds = Credentials {
            gemini_api_key: Some("g".to_string()),
            deepseek_api_key: Some("d".to_string()),
            ..Default::default()
        };
        let gemini = build_provider(ProviderKind::Gemini, &config, &creds).unwrap();
        assert_eq!(gemini.kind(), ProviderKind::Gemini);

        let deepseek = build_provider(ProviderKind::DeepSeek, &config, &creds).unwrap();
        assert_eq!(deepseek.kind(), ProviderKind::DeepSeek);
        match deepseek {
            Provider::OpenAi(p) => assert_eq!(p.api_base(), "https://api.deepseek.com/v1"),
            _ => panic!("expected an OpenAI-compatible provider"),
        }

        let scripted = build_provider(ProviderKind::Scripted, &config, &creds).unwrap();
        assert_eq!(scripted.kind(), ProviderKind::Scripted);
    }
}
