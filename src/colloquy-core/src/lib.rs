//! Colloquy Core Library
//!
//! Persona management, provider adapters, turn persistence, narration and
//! the scenario-driven session runner.

pub mod audio;
pub mod config;
pub mod conversation;
pub mod error;
pub mod manager;
pub mod narration;
pub mod orchestrator;
pub mod persona;
pub mod provider;
pub mod retry;
pub mod sanitize;
pub mod scenario;
pub mod store;

pub use config::{Config, Credentials, NarrationBackend};
pub use conversation::{Conversation, NewTurn, SessionId, Turn, TurnKind};
pub use error::ColloquyError;
pub use manager::{AgentManager, ManagerSettings};
pub use narration::{AudioClip, Narrator, build_narrator};
pub use orchestrator::{SessionCallback, SessionEvent, SessionOptions, SessionRunner};
pub use persona::{Persona, PersonaId, PersonaRoster, ProviderKind, VoiceSettings};
pub use provider::{Provider, ReplyGenerator, ScriptedProvider, build_provider};
pub use retry::RetryPolicy;
pub use scenario::{
    BoardDiscussionScenario, ChatbotScenario, DialogueScenario, PlannedTurn, Scenario,
    available_scenarios, get_scenario,
};
pub use store::{InMemoryTurnStore, SessionInfo, SessionSummary, SqliteTurnStore, TurnStore};
