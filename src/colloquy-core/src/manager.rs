//! The agent manager: one entry point that turns a persona and a
//! conversation into a reply from the persona's provider.

use std::collections::HashMap;

use crate::config::{Config, GenerationConfig, ModelPricing, ProvidersConfig};
use crate::conversation::{Conversation, TurnKind};
use crate::error::ColloquyError;
use crate::persona::{Persona, PersonaId, PersonaRoster, ProviderKind};
use crate::provider::{ChatMessage, ChatRequest, ChatRole, Provider, Reply, ReplyGenerator};
use crate::retry::{RetryPolicy, with_retry};
use crate::sanitize::sanitize_reply;

/// Sent when a persona has nothing new to respond to.
const CONTINUE_PROMPT: &str = "[user]Continue the conversation.";

/// Settings the manager applies to every request.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub retry: RetryPolicy,
    pub generation: GenerationConfig,
    pub providers: ProvidersConfig,
    pub pricing: HashMap<String, ModelPricing>,
}

impl ManagerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retry: config.retry.policy(),
            generation: config.generation.clone(),
            providers: config.providers.clone(),
            pricing: config.pricing.clone(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from_config(&crate::config::default_config())
    }
}

/// A named piece of extra information for a persona's next request.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextPiece {
    pub label: String,
    pub info: String,
}

/// Token totals for one persona.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageTotals {
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

pub struct AgentManager {
    providers: HashMap<ProviderKind, Provider>,
    roster: PersonaRoster,
    pending_context: HashMap<PersonaId, Vec<ContextPiece>>,
    usage: HashMap<PersonaId, UsageTotals>,
    settings: ManagerSettings,
}

impl AgentManager {
    /// Create a manager that routes to the given providers.
    pub fn new(providers: Vec<Provider>, settings: ManagerSettings) -> Self {
        let providers = providers.into_iter().map(|p| (p.kind(), p)).collect();
        Self {
            providers,
            roster: PersonaRoster::new(),
            pending_context: HashMap::new(),
            usage: HashMap::new(),
            settings,
        }
    }

    /// Register a persona. Its id must be unused, its provider configured
    /// and its model allowed.
    pub fn register(&mut self, persona: Persona) -> Result<(), ColloquyError> {
        if !self.providers.contains_key(&persona.provider) {
            return Err(ColloquyError::ProviderUnavailable(persona.provider));
        }
        if !self
            .settings
            .providers
            .allows_model(persona.provider, &persona.model)
        {
            return Err(ColloquyError::UnsupportedModel {
                provider: persona.provider,
                model: persona.model,
            });
        }
        tracing::debug!(
            persona = %persona.id,
            provider = %persona.provider,
            model = %persona.model,
            "registered persona"
        );
        self.roster.insert(persona)
    }

    pub fn persona(&self, id: &PersonaId) -> Result<&Persona, ColloquyError> {
        self.roster.get(id)
    }

    pub fn personas(&self) -> &PersonaRoster {
        &self.roster
    }

    pub fn provider(&self, kind: ProviderKind) -> Option<&Provider> {
        self.providers.get(&kind)
    }

    /// Queue extra information for the persona's next request.
    pub fn add_context(
        &mut self,
        persona_id: &PersonaId,
        label: impl Into<String>,
        info: impl Into<String>,
    ) -> Result<(), ColloquyError> {
        self.roster.get(persona_id)?;
        self.pending_context
            .entry(persona_id.clone())
            .or_default()
            .push(ContextPiece {
                label: label.into(),
                info: info.into(),
            });
        Ok(())
    }

    pub fn pending_context(&self, persona_id: &PersonaId) -> &[ContextPiece] {
        self.pending_context
            .get(persona_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Generate the persona's next reply to `conversation`.
    ///
    /// Pending context is consumed by this call whether or not it succeeds.
    /// Provider failures are returned unchanged once retries are exhausted; a
    /// reply that is empty after sanitizing is an error, never a turn.
    pub async fn reply(
        &mut self,
        persona_id: &PersonaId,
        conversation: &Conversation,
        prompt: &str,
    ) -> Result<Reply, ColloquyError> {
        let persona = self.roster.get(persona_id)?.clone();
        let context = self.pending_context.remove(persona_id).unwrap_or_default();
        let request = build_request(
            &persona,
            conversation,
            &context,
            prompt,
            &self.settings.generation,
        );

        let provider = self
            .providers
            .get(&persona.provider)
            .ok_or(ColloquyError::ProviderUnavailable(persona.provider))?;

        tracing::debug!(
            persona = %persona.id,
            messages = request.messages.len(),
            context_pieces = context.len(),
            "requesting reply"
        );

        let label = format!("{}/{}", persona.provider, persona.id);
        let request = &request;
        let persona_name = persona.name.as_str();
        let reply = with_retry(&self.settings.retry, &label, move || async move {
            let raw = provider.generate(request).await?;
            let text = sanitize_reply(&raw.text);
            if text.is_empty() {
                return Err(ColloquyError::EmptyReply {
                    persona: persona_name.to_string(),
                });
            }
            Ok(Reply {
                text,
                usage: raw.usage,
            })
        })
        .await?;

        let totals = self.usage.entry(persona.id.clone()).or_default();
        totals.requests += 1;
        if let Some(usage) = reply.usage {
            totals.prompt_tokens += usage.prompt_tokens;
            totals.completion_tokens += usage.completion_tokens;
        }

        Ok(reply)
    }

    pub fn usage(&self, persona_id: &PersonaId) -> UsageTotals {
        self.usage.get(persona_id).cloned().unwrap_or_default()
    }

    /// Estimated spend in USD across all personas with configured pricing.
    pub fn total_cost(&self) -> f64 {
        self.usage
            .iter()
            .filter_map(|(id, totals)| {
                let persona = self.roster.get(id).ok()?;
                let pricing = self.settings.pricing.get(&persona.model)?;
                Some(pricing.cost(totals.prompt_tokens, totals.completion_tokens))
            })
            .sum()
    }
}

/// Build the request from `persona`'s point of view: its own turns are
/// assistant messages, everyone else's are labelled user messages.
fn build_request(
    persona: &Persona,
    conversation: &Conversation,
    context: &[ContextPiece],
    prompt: &str,
    generation: &GenerationConfig,
) -> ChatRequest {
    let mut messages = Vec::with_capacity(conversation.len() + 1);

    for turn in conversation.turns() {
        let own = turn.persona_id == persona.id && turn.kind == TurnKind::Agent;
        if own {
            if !turn.prompt.trim().is_empty() {
                messages.push(ChatMessage::user(format!("[user]{}", turn.prompt)));
            }
            messages.push(ChatMessage::assistant(turn.content.clone()));
        } else {
            let label = match turn.kind {
                TurnKind::Agent => format!("[{}'s Response]", turn.persona_name),
                TurnKind::Manual => format!("[{}]", turn.persona_name),
            };
            messages.push(ChatMessage::user(format!("{}{}", label, turn.content)));
        }
    }

    let mut current: Vec<String> = context
        .iter()
        .map(|c| format!("[{}]{}", c.label, c.info))
        .collect();
    if !prompt.trim().is_empty() {
        current.push(format!("[user]{}", prompt));
    }
    if !current.is_empty() {
        messages.push(ChatMessage::user(current.join("\n\n")));
    }

    let mut request = ChatRequest {
        persona: persona.name.clone(),
        model: persona.model.clone(),
        system: persona.system_prompt.clone(),
        messages,
        max_tokens: generation.max_tokens,
        temperature: generation.temperature,
    }
    .normalized();

    if request
        .messages
        .last()
        .is_none_or(|m| m.role == ChatRole::Assistant)
    {
        request.messages.push(ChatMessage::user(CONTINUE_PROMPT));
    }
    request
}
