//! OpenAI-compatible chat completions (OpenAI, DeepSeek, Grok).

use async_openai::Client;
use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessage, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
    CreateChatCompletionRequestArgs,
};
use async_trait::async_trait;

use super::{ChatRequest, ChatRole, Reply, ReplyGenerator, TokenUsage};
use crate::error::ColloquyError;
use crate::persona::ProviderKind;

pub(crate) fn default_api_base(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::DeepSeek => "https://api.deepseek.com/v1",
        ProviderKind::Grok => "https://api.x.ai/v1",
        _ => "https://api.openai.com/v1",
    }
}

pub struct OpenAiProvider {
    kind: ProviderKind,
    client: Client<OpenAIConfig>,
    api_base: String,
}

impl OpenAiProvider {
    pub fn new(
        kind: ProviderKind,
        http_client: reqwest::Client,
        api_key: impl Into<String>,
        api_base: impl Into<String>,
    ) -> Self {
        let api_base = api_base.into();
        let config = OpenAIConfig::new()
            .with_api_key(api_key.into())
            .with_api_base(&api_base);

        Self {
            kind,
            client: Client::with_config(config).with_http_client(http_client),
            api_base,
        }
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }
}

fn to_messages(request: &ChatRequest) -> Vec<ChatCompletionRequestMessage> {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if !request.system.trim().is_empty() {
        messages.push(ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessage {
                content: request.system.clone().into(),
                name: None,
            },
        ));
    }

    for m in &request.messages {
        let message = match m.role {
            ChatRole::User => {
                ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                    content: m.content.clone().into(),
                    name: None,
                })
            }
            ChatRole::Assistant => {
                ChatCompletionRequestMessage::Assistant(ChatCompletionRequestAssistantMessage {
                    content: Some(m.content.clone().into()),
                    name: None,
                    tool_calls: None,
                    refusal: None,
                    audio: None,
                    function_call: None,
                })
            }
        };
        messages.push(message);
    }
    messages
}

#[async_trait]
impl ReplyGenerator for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn generate(&self, request: &ChatRequest) -> Result<Reply, ColloquyError> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&request.model)
            .max_completion_tokens(request.max_tokens)
            .messages(to_messages(request));
        if let Some(temperature) = request.temperature {
            args.temperature(temperature);
        }
        let api_request = args.build()?;

        let response = self.client.chat().create(api_request).await?;

        let text = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        let usage = response.usage.map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens as u64,
            completion_tokens: u.completion_tokens as u64,
        });

        Ok(Reply { text, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ChatMessage;

    #[test]
    fn test_default_bases() {
        assert_eq!(default_api_base(ProviderKind::OpenAi), "https://api.openai.com/v1");
        assert_eq!(default_api_base(ProviderKind::Grok), "https://api.x.ai/v1");
    }

    #[test]
    fn test_messages_start_with_system() {
        let request = ChatRequest {
            persona: "John".to_string(),
            model: "gpt-4o-mini".to_string(),
            system: "You are John.".to_string(),
            messages: vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")],
            max_tokens: 64,
            temperature: None,
        };
        let messages = to_messages(&request);
        assert_eq!(messages.len(), 3);
        assert!(matches!(messages[0], ChatCompletionRequestMessage::System(_)));
        assert!(matches!(messages[1], ChatCompletionRequestMessage::User(_)));
        assert!(matches!(messages[2], ChatCompletionRequestMessage::Assistant(_)));
    }
}
