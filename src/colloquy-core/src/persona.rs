//! Persona definitions.
//!
//! A persona is the configured personality behind one participant: who it
//! is, which provider and model answer for it, and how it sounds when
//! narrated. Personas are loaded once at scenario startup and never change
//! afterwards.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

use crate::error::ColloquyError;

/// Identifier of a persona, unique within a scenario.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersonaId(String);

impl PersonaId {
    pub fn new(id: impl Into<String>) -> Result<Self, ColloquyError> {
        let id = id.into();
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(ColloquyError::ConfigError(format!(
                "Invalid persona id '{}': use letters, digits, '_' or '-'",
                id
            )));
        }
        Ok(Self(id))
    }

    /// Derive an id from a display name ("Johnny B" -> "johnny_b").
    pub fn from_name(name: &str) -> Result<Self, ColloquyError> {
        let slug: String = name
            .trim()
            .chars()
            .filter_map(|c| {
                if c.is_ascii_alphanumeric() {
                    Some(c.to_ascii_lowercase())
                } else if c.is_whitespace() || c == '-' || c == '_' {
                    Some('_')
                } else {
                    None
                }
            })
            .collect();
        Self::new(slug)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PersonaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The hosted service (or offline stand-in) that answers for a persona.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Gemini,
    OpenAi,
    DeepSeek,
    Grok,
    /// Canned replies, no network.
    Scripted,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => "gemini",
            ProviderKind::OpenAi => "openai",
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::Grok => "grok",
            ProviderKind::Scripted => "scripted",
        }
    }

    pub fn all() -> [ProviderKind; 5] {
        [
            ProviderKind::Gemini,
            ProviderKind::OpenAi,
            ProviderKind::DeepSeek,
            ProviderKind::Grok,
            ProviderKind::Scripted,
        ]
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Voice used when a persona's replies are narrated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceSettings {
    /// Backend-specific voice name, e.g. "en-US-GuyNeural" or "bm_george".
    pub name: String,
    /// Playback rate, 1.0 is normal speed.
    #[serde(default = "default_rate")]
    pub rate: f32,
}

fn default_rate() -> f32 {
    1.0
}

impl VoiceSettings {
    pub fn new(name: impl Into<String>, rate: f32) -> Self {
        Self {
            name: name.into(),
            rate,
        }
    }
}

/// A configured personality driving one participant's replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub id: PersonaId,
    /// Display name, also used to label this persona's turns for others.
    pub name: String,
    pub provider: ProviderKind,
    /// Model name passed to the provider (e.g. "gemini-2.5-flash").
    pub model: String,
    /// Personality description sent as system instructions.
    pub system_prompt: String,
    pub voice: Option<VoiceSettings>,
}

#[derive(Deserialize)]
struct PersonaFile {
    agent: AgentSection,
    personality: PersonalitySection,
    #[serde(default)]
    voice: Option<VoiceSettings>,
}

#[derive(Deserialize)]
struct AgentSection {
    #[serde(default)]
    id: Option<String>,
    name: String,
    provider: ProviderKind,
    model: String,
}

#[derive(Deserialize)]
struct PersonalitySection {
    system_prompt: String,
}

impl Persona {
    pub fn new(
        id: PersonaId,
        name: impl Into<String>,
        provider: ProviderKind,
        model: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            provider,
            model: model.into(),
            system_prompt: system_prompt.into(),
            voice: None,
        }
    }

    /// Set the narration voice.
    pub fn with_voice(mut self, voice: VoiceSettings) -> Self {
        self.voice = Some(voice);
        self
    }

    /// Load a persona sheet from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ColloquyError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ColloquyError::ConfigError(format!(
                "Failed to read persona file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            ColloquyError::ConfigError(msg) => {
                ColloquyError::ConfigError(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    /// Parse a persona sheet from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ColloquyError> {
        let file: PersonaFile = toml::from_str(content)
            .map_err(|e| ColloquyError::ConfigError(format!("Failed to parse persona: {}", e)))?;

        let name = file.agent.name.trim().to_string();
        if name.is_empty() {
            return Err(ColloquyError::ConfigError(
                "Persona name cannot be empty".to_string(),
            ));
        }
        if file.agent.model.trim().is_empty() {
            return Err(ColloquyError::ConfigError(format!(
                "Persona '{}' has no model",
                name
            )));
        }
        if file.personality.system_prompt.trim().is_empty() {
            return Err(ColloquyError::ConfigError(format!(
                "Persona '{}' has an empty system prompt",
                name
            )));
        }

        let id = match file.agent.id {
            Some(id) => PersonaId::new(id)?,
            None => PersonaId::from_name(&name)?,
        };

        Ok(Self {
            id,
            name,
            provider: file.agent.provider,
            model: file.agent.model.trim().to_string(),
            system_prompt: file.personality.system_prompt.trim().to_string(),
            voice: file.voice,
        })
    }

    /// Name with the serving model, for headers.
    pub fn display_name_with_model(&self) -> String {
        format!("{} ({}/{})", self.name, self.provider, self.model)
    }
}

/// The set of personas taking part in one scenario.
#[derive(Debug, Clone, Default)]
pub struct PersonaRoster {
    personas: Vec<Persona>,
    index: HashMap<PersonaId, usize>,
}

impl PersonaRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a persona. Identifiers must be unique.
    pub fn insert(&mut self, persona: Persona) -> Result<(), ColloquyError> {
        if self.index.contains_key(&persona.id) {
            return Err(ColloquyError::DuplicatePersona(persona.id.to_string()));
        }
        self.index.insert(persona.id.clone(), self.personas.len());
        self.personas.push(persona);
        Ok(())
    }

    /// Load and register several persona files, in order.
    pub fn load_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self, ColloquyError> {
        let mut roster = Self::new();
        for path in paths {
            roster.insert(Persona::load(path)?)?;
        }
        Ok(roster)
    }

    pub fn get(&self, id: &PersonaId) -> Result<&Persona, ColloquyError> {
        self.index
            .get(id)
            .map(|&i| &self.personas[i])
            .ok_or_else(|| ColloquyError::UnknownPersona(id.to_string()))
    }

    pub fn contains(&self, id: &PersonaId) -> bool {
        self.index.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Persona> {
        self.personas.iter()
    }

    pub fn ids(&self) -> Vec<PersonaId> {
        self.personas.iter().map(|p| p.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.personas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }

    pub fn into_vec(self) -> Vec<Persona> {
        self.personas
    }
}
