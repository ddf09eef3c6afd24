//! Configuration module for loading TOML config files.

use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ColloquyError;
use crate::persona::ProviderKind;
use crate::retry::RetryPolicy;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Groups sessions in the database.
    pub project: String,
    pub storage: StorageConfig,
    pub generation: GenerationConfig,
    pub retry: RetryConfig,
    pub narration: NarrationConfig,
    pub providers: ProvidersConfig,
    /// Per-model prices, keyed by model name.
    pub pricing: HashMap<String, ModelPricing>,
}

impl Default for Config {
    fn default() -> Self {
        default_config()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("data/chat_history.sqlite"),
        }
    }
}

/// Generation limits applied to every request.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: 600,
            temperature: None,
        }
    }
}

/// Backoff settings for third-party API calls.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts)
            .with_initial_delay(Duration::from_millis(self.initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_backoff_multiplier(self.backoff_multiplier)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NarrationBackend {
    Azure,
    Kokoro,
    None,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NarrationConfig {
    pub backend: NarrationBackend,
    pub audio_dir: PathBuf,
    /// Voice for personas without a `[voice]` section.
    pub default_voice: String,
    pub default_rate: f32,
}

impl Default for NarrationConfig {
    fn default() -> Self {
        Self {
            backend: NarrationBackend::Azure,
            audio_dir: PathBuf::from("data/audio"),
            default_voice: "en-US-AvaMultilingualNeural".to_string(),
            default_rate: 1.0,
        }
    }
}

/// Settings for one provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// Overrides the provider's default API base URL.
    pub api_base: Option<String>,
    /// Allowed models; empty means any.
    pub models: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            api_base: None,
            models: Vec::new(),
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub gemini: ProviderSettings,
    pub openai: ProviderSettings,
    pub deepseek: ProviderSettings,
    pub grok: ProviderSettings,
}

impl ProvidersConfig {
    /// Settings for a provider; the scripted provider takes none.
    pub fn get(&self, kind: ProviderKind) -> Option<&ProviderSettings> {
        match kind {
            ProviderKind::Gemini => Some(&self.gemini),
            ProviderKind::OpenAi => Some(&self.openai),
            ProviderKind::DeepSeek => Some(&self.deepseek),
            ProviderKind::Grok => Some(&self.grok),
            ProviderKind::Scripted => None,
        }
    }

    /// Whether `model` may be used with `kind`.
    pub fn allows_model(&self, kind: ProviderKind, model: &str) -> bool {
        self.get(kind)
            .map(|s| s.models.is_empty() || s.models.iter().any(|m| m == model))
            .unwrap_or(true)
    }
}

/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    pub fn cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        (prompt_tokens as f64 * self.input_per_million
            + completion_tokens as f64 * self.output_per_million)
            / 1_000_000.0
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ColloquyError> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| ColloquyError::ConfigError(format!("Failed to read config: {}", e)))?;

        Self::from_str(&content)
    }

    /// Load configuration from string content.
    pub fn from_str(content: &str) -> Result<Self, ColloquyError> {
        let config: Config = toml::from_str(content)
            .map_err(|e| ColloquyError::ConfigError(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if given, else `colloquy.toml` in the working
    /// directory if present, else defaults. `COLLOQUY_DB` overrides the
    /// database path.
    pub fn discover(path: Option<&Path>) -> Result<Self, ColloquyError> {
        let mut config = match path {
            Some(p) => Self::load(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::load(DEFAULT_CONFIG_FILE)?,
            None => default_config(),
        };
        if let Ok(db) = env::var("COLLOQUY_DB") {
            if !db.trim().is_empty() {
                config.storage.database = PathBuf::from(db);
            }
        }
        Ok(config)
    }

    fn validate(&self) -> Result<(), ColloquyError> {
        if self.retry.max_attempts == 0 {
            return Err(ColloquyError::ConfigError(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.generation.max_tokens == 0 {
            return Err(ColloquyError::ConfigError(
                "generation.max_tokens must be positive".to_string(),
            ));
        }
        if self.narration.default_rate <= 0.0 {
            return Err(ColloquyError::ConfigError(
                "narration.default_rate must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Pricing for a model, if configured.
    pub fn pricing_for(&self, model: &str) -> Option<ModelPricing> {
        self.pricing.get(model).copied()
    }
}

pub const DEFAULT_CONFIG_FILE: &str = "colloquy.toml";

/// Default configuration embedded in the binary.
pub fn default_config() -> Config {
    let mut pricing = HashMap::new();
    pricing.insert(
        "gemini-2.5-flash".to_string(),
        ModelPricing {
            input_per_million: 0.30,
            output_per_million: 2.50,
        },
    );
    pricing.insert(
        "gemini-2.5-pro".to_string(),
        ModelPricing {
            input_per_million: 1.25,
            output_per_million: 10.00,
        },
    );

    Config {
        project: "default_chat".to_string(),
        storage: StorageConfig::default(),
        generation: GenerationConfig::default(),
        retry: RetryConfig::default(),
        narration: NarrationConfig::default(),
        providers: ProvidersConfig::default(),
        pricing,
    }
}

/// API credentials and endpoints read from the environment.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub gemini_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub openai_api_base: Option<String>,
    pub deepseek_api_key: Option<String>,
    pub xai_api_key: Option<String>,
    pub speech_key: Option<String>,
    pub speech_region: Option<String>,
    pub speech_endpoint: Option<String>,
}

impl Credentials {
    pub fn from_env() -> Self {
        Self {
            gemini_api_key: var("GEMINI_API_KEY").or_else(|| var("GOOGLE_API_KEY")),
            openai_api_key: var("OPENAI_API_KEY"),
            openai_api_base: var("OPENAI_API_BASE").or_else(|| var("OPENAI_BASE_URL")),
            deepseek_api_key: var("DEEPSEEK_API_KEY"),
            xai_api_key: var("XAI_API_KEY"),
            speech_key: var("SPEECH_KEY"),
            speech_region: var("SPEECH_REGION"),
            speech_endpoint: var("SPEECH_ENDPOINT"),
        }
    }

    /// API key for a provider, with the variable name to mention when missing.
    pub fn api_key(&self, kind: ProviderKind) -> (Option<&str>, &'static str) {
        match kind {
            ProviderKind::Gemini => (self.gemini_api_key.as_deref(), "GEMINI_API_KEY"),
            ProviderKind::OpenAi => (self.openai_api_key.as_deref(), "OPENAI_API_KEY"),
            ProviderKind::DeepSeek => (self.deepseek_api_key.as_deref(), "DEEPSEEK_API_KEY"),
            ProviderKind::Grok => (self.xai_api_key.as_deref(), "XAI_API_KEY"),
            ProviderKind::Scripted => (None, ""),
        }
    }
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}
