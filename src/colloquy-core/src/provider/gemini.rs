//! Google Gemini adapter over the `generateContent` REST endpoint.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{ChatRequest, ChatRole, Reply, ReplyGenerator, TokenUsage};
use crate::error::ColloquyError;
use crate::persona::ProviderKind;

pub(crate) const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
}

impl GeminiProvider {
    pub fn new(
        client: reqwest::Client,
        api_key: impl Into<String>,
        api_base: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, model: &str) -> String {
        format!("{}/models/{}:generateContent", self.api_base, model)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Serialize, Deserialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

fn build_body(request: &ChatRequest) -> GenerateRequest {
    let system_instruction = if request.system.trim().is_empty() {
        None
    } else {
        Some(Content {
            role: None,
            parts: vec![Part {
                text: Some(request.system.clone()),
            }],
        })
    };

    let contents = request
        .messages
        .iter()
        .map(|m| Content {
            role: Some(
                match m.role {
                    ChatRole::User => "user",
                    ChatRole::Assistant => "model",
                }
                .to_string(),
            ),
            parts: vec![Part {
                text: Some(m.content.clone()),
            }],
        })
        .collect();

    GenerateRequest {
        system_instruction,
        contents,
        generation_config: GenerationConfig {
            max_output_tokens: request.max_tokens,
            temperature: request.temperature,
        },
    }
}

fn parse_reply(response: GenerateResponse) -> Result<Reply, ColloquyError> {
    let usage = response.usage_metadata.map(|u| TokenUsage {
        prompt_tokens: u.prompt_token_count,
        completion_tokens: u.candidates_token_count,
    });

    let Some(candidate) = response.candidates.into_iter().next() else {
        let reason = response
            .prompt_feedback
            .and_then(|f| f.block_reason)
            .unwrap_or_else(|| "no candidates returned".to_string());
        return Err(ColloquyError::Provider(format!("Gemini: {}", reason)));
    };

    let text = candidate
        .content
        .map(|c| {
            c.parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    Ok(Reply { text, usage })
}

#[async_trait]
impl ReplyGenerator for GeminiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    async fn generate(&self, request: &ChatRequest) -> Result<Reply, ColloquyError> {
        let body = build_body(request);

        let response = self
            .client
            .post(self.endpoint(&request.model))
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorEnvelope>(&text)
                .map(|e| e.error.message)
                .unwrap_or(text);
            return Err(ColloquyError::Api {
                provider: ProviderKind::Gemini,
                status,
                message,
            });
        }

        let parsed: GenerateResponse = response.json().await?;
        parse_reply(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ChatMessage;

    fn request() -> ChatRequest {
        ChatRequest {
            persona: "James".to_string(),
            model: "gemini-2.5-flash".to_string(),
            system: "You are James.".to_string(),
            messages: vec![
                ChatMessage::user("Recite a poem."),
                ChatMessage::assistant("Roses are red."),
                ChatMessage::user("[John's Response] Nice."),
            ],
            max_tokens: 256,
            temperature: Some(0.5),
        }
    }

    #[test]
    fn test_body_maps_roles_and_system() {
        let json = serde_json::to_value(build_body(&request())).unwrap();

        assert_eq!(
            json["systemInstruction"]["parts"][0]["text"],
            "You are James."
        );
        assert_eq!(json["contents"][0]["role"], "user");
        assert_eq!(json["contents"][1]["role"], "model");
        assert_eq!(json["contents"][2]["parts"][0]["text"], "[John's Response] Nice.");
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 256);
        assert!(json["systemInstruction"].get("role").is_none());
    }

    #[test]
    fn test_parse_reply_joins_parts() {
        let raw = r#"{
            "candidates": [{"content": {"role": "model", "parts": [{"text": "Hello "}, {"text": "there."}]}}],
            "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 3, "totalTokenCount": 15}
        }"#;
        let reply = parse_reply(serde_json::from_str(raw).unwrap()).unwrap();
        assert_eq!(reply.text, "Hello there.");
        assert_eq!(
            reply.usage,
            Some(TokenUsage {
                prompt_tokens: 12,
                completion_tokens: 3
            })
        );
    }

    #[test]
    fn test_parse_reply_blocked_prompt() {
        let raw = r#"{"promptFeedback": {"blockReason": "SAFETY"}}"#;
        let err = parse_reply(serde_json::from_str(raw).unwrap()).unwrap_err();
        assert!(err.to_string().contains("SAFETY"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_endpoint_uses_model() {
        let provider =
            GeminiProvider::new(reqwest::Client::new(), "key", "https://example.test/v1beta/");
        assert_eq!(
            provider.endpoint("gemini-2.5-flash"),
            "https://example.test/v1beta/models/gemini-2.5-flash:generateContent"
        );
    }
}
