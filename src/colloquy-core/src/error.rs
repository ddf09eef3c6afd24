//! Error types for the conversation system.

use async_openai::error::OpenAIError;
use thiserror::Error;

use crate::persona::ProviderKind;

#[derive(Error, Debug)]
pub enum ColloquyError {
    #[error("Invalid participant count for {scenario}: expected {min}-{max}, got {actual}")]
    InvalidParticipantCount {
        scenario: String,
        min: usize,
        max: usize,
        actual: usize,
    },

    #[error("Persona '{0}' is already registered")]
    DuplicatePersona(String),

    #[error("Unknown persona: {0}")]
    UnknownPersona(String),

    #[error("Model '{model}' is not enabled for provider {provider}")]
    UnsupportedModel { provider: ProviderKind, model: String },

    #[error("No client configured for provider {0}")]
    ProviderUnavailable(ProviderKind),

    #[error("{provider} API error (status {status}): {message}")]
    Api {
        provider: ProviderKind,
        status: u16,
        message: String,
    },

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("OpenAI API error: {0}")]
    OpenAIError(#[from] OpenAIError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Turn {sequence} is out of order for session {session} (expected {expected})")]
    OutOfOrderTurn {
        session: String,
        sequence: u32,
        expected: u32,
    },

    #[error("Audio error: {0}")]
    Audio(#[from] hound::Error),

    #[error("TTS error: {0}")]
    TtsError(String),

    #[error("Speech service error (status {status}): {message}")]
    SpeechApi { status: u16, message: String },

    #[error("Persona '{persona}' returned an empty reply")]
    EmptyReply { persona: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unknown scenario: {0}")]
    UnknownScenario(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ColloquyError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ColloquyError::Api { status, .. } | ColloquyError::SpeechApi { status, .. } => {
                *status == 429 || *status >= 500
            }
            ColloquyError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ColloquyError::OpenAIError(e) => openai_is_transient(e),
            ColloquyError::EmptyReply { .. } => true,
            _ => false,
        }
    }
}

/// 5xx bodies carry neither a type nor a code, so an untyped `ApiError`
/// counts as a server fault.
fn openai_is_transient(err: &OpenAIError) -> bool {
    match err {
        OpenAIError::Reqwest(e) => {
            e.is_timeout()
                || e.is_connect()
                || e.is_request()
                || e.status().is_some_and(|s| {
                    let code = s.as_u16();
                    code == 429 || code >= 500
                })
        }
        OpenAIError::ApiError(api) => {
            let kind = api.code.as_deref().or(api.r#type.as_deref());
            match kind {
                None => true,
                Some(kind) => matches!(kind, "rate_limit_exceeded" | "server_error"),
            }
        }
        _ => false,
    }
}
