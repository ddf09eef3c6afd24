//! Session orchestration logic.
//!
//! Drives a scenario turn by turn: asks the agent manager for a reply,
//! records it in the conversation, optionally narrates it and persists it.

use std::collections::HashSet;
use std::path::PathBuf;

use tracing::{info, warn};

use crate::audio::audio_file_name;
use crate::config::{Config, NarrationConfig};
use crate::conversation::{Conversation, NewTurn, SessionId, Turn};
use crate::error::ColloquyError;
use crate::manager::AgentManager;
use crate::narration::{AudioClip, Narrator, voice_for};
use crate::persona::PersonaId;
use crate::scenario::Scenario;
use crate::store::{SessionInfo, TurnStore};

/// Options for running a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Project the session is filed under in the store.
    pub project: String,
    /// Default voice for personas without one.
    pub narration: NarrationConfig,
}

impl SessionOptions {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            narration: NarrationConfig::default(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            project: config.project.clone(),
            narration: config.narration.clone(),
        }
    }
}

/// Callback for session events.
pub type SessionCallback = Box<dyn Fn(SessionEvent) + Send + Sync>;

/// Events emitted during a session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A persona is about to speak.
    TurnStart {
        sequence: u32,
        persona: PersonaId,
        name: String,
    },
    /// A turn was recorded and persisted.
    TurnComplete { turn: Turn },
    /// A reply was written to an audio file.
    Narrated { sequence: u32, clip: AudioClip },
    /// The session has concluded.
    SessionEnd {
        session_id: SessionId,
        turns: usize,
        total_cost: f64,
    },
}

/// Runs one session of a scenario.
pub struct SessionRunner {
    manager: AgentManager,
    store: Box<dyn TurnStore>,
    scenario: Box<dyn Scenario>,
    participants: Vec<PersonaId>,
    options: SessionOptions,
    conversation: Conversation,
    narrator: Option<(Narrator, PathBuf)>,
    callback: Option<SessionCallback>,
    /// Planned turns executed so far.
    planned: usize,
    begun: bool,
    ended: bool,
}

impl SessionRunner {
    /// Create a runner for `participants`, which must all be registered with
    /// `manager` and fit the scenario's participant limits.
    pub fn new(
        manager: AgentManager,
        store: Box<dyn TurnStore>,
        scenario: Box<dyn Scenario>,
        participants: Vec<PersonaId>,
        options: SessionOptions,
    ) -> Result<Self, ColloquyError> {
        scenario.validate_participants(participants.len())?;

        let mut seen = HashSet::new();
        for id in &participants {
            manager.persona(id)?;
            if !seen.insert(id.clone()) {
                return Err(ColloquyError::DuplicatePersona(id.to_string()));
            }
        }

        Ok(Self {
            manager,
            store,
            scenario,
            participants,
            options,
            conversation: Conversation::new(SessionId::new()),
            narrator: None,
            callback: None,
            planned: 0,
            begun: false,
            ended: false,
        })
    }

    /// Narrate every agent turn into `audio_dir/<session>/`.
    pub fn with_narrator(mut self, narrator: Narrator, audio_dir: impl Into<PathBuf>) -> Self {
        self.narrator = Some((narrator, audio_dir.into()));
        self
    }

    /// Set a callback for session events.
    pub fn with_callback(mut self, callback: SessionCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Record the session in the store. Called implicitly by the first turn.
    pub fn begin(&mut self) -> Result<(), ColloquyError> {
        if self.begun {
            return Ok(());
        }
        let info = SessionInfo::new(
            self.conversation.session_id(),
            self.options.project.clone(),
            self.scenario.name(),
        );
        self.store.begin_session(&info)?;
        self.begun = true;
        info!(
            session = %info.id,
            project = %info.project,
            scenario = %info.scenario,
            participants = self.participants.len(),
            "session started"
        );
        Ok(())
    }

    /// Ask `speaker` for a reply to the conversation so far.
    ///
    /// A provider failure leaves the conversation and the store untouched.
    /// A narration failure is logged and the turn is kept without audio.
    pub async fn agent_turn(
        &mut self,
        speaker: &PersonaId,
        prompt: &str,
    ) -> Result<Turn, ColloquyError> {
        if !self.participants.contains(speaker) {
            return Err(ColloquyError::UnknownPersona(speaker.to_string()));
        }
        self.begin()?;

        let sequence = self.conversation.next_sequence();
        let persona = self.manager.persona(speaker)?.clone();
        self.emit_event(SessionEvent::TurnStart {
            sequence,
            persona: persona.id.clone(),
            name: persona.name.clone(),
        });

        let reply = self.manager.reply(speaker, &self.conversation, prompt).await?;
        let mut new_turn = NewTurn::agent(
            persona.id.clone(),
            persona.name.clone(),
            persona.model.clone(),
            prompt,
            reply.text,
        );

        if let Some((narrator, audio_dir)) = self.narrator.as_mut() {
            let path = audio_dir
                .join(self.conversation.session_id().to_string())
                .join(audio_file_name(sequence, &persona.id));
            let voice = voice_for(&persona, &self.options.narration);
            match narrator.narrate(&new_turn.content, &voice, &path).await {
                Ok(clip) => {
                    new_turn = new_turn.with_audio(clip.path.clone());
                    self.emit_event(SessionEvent::Narrated { sequence, clip });
                }
                Err(e) => {
                    warn!(persona = %persona.id, sequence, error = %e, "narration failed");
                }
            }
        }

        self.persist(new_turn)
    }

    /// Record a line that was not generated, e.g. typed by a human.
    pub fn manual_turn(&mut self, name: &str, text: &str) -> Result<Turn, ColloquyError> {
        let persona_id = PersonaId::from_name(name)?;
        self.begin()?;
        self.emit_event(SessionEvent::TurnStart {
            sequence: self.conversation.next_sequence(),
            persona: persona_id.clone(),
            name: name.to_string(),
        });
        self.persist(NewTurn::manual(persona_id, name, text))
    }

    /// Store first, then extend the in-memory log, so a failed append
    /// leaves both where they were.
    fn persist(&mut self, new_turn: NewTurn) -> Result<Turn, ColloquyError> {
        let turn = self.conversation.prepare(new_turn);
        self.store.append(&turn)?;
        self.conversation.commit(turn.clone())?;
        info!(
            session = %turn.session_id,
            sequence = turn.sequence,
            persona = %turn.persona_id,
            kind = turn.kind.as_str(),
            "turn recorded"
        );
        self.emit_event(SessionEvent::TurnComplete { turn: turn.clone() });
        Ok(turn)
    }

    /// Execute the next `n` planned turns, stopping at the scenario's limit.
    pub async fn run(&mut self, n: usize) -> Result<Vec<Turn>, ColloquyError> {
        let mut turns = Vec::with_capacity(n);
        for _ in 0..n {
            if self.is_finished() {
                break;
            }
            let plan = self
                .scenario
                .plan_turn(self.planned, self.participants.len());
            let speaker = self
                .participants
                .get(plan.speaker)
                .cloned()
                .ok_or_else(|| {
                    ColloquyError::UnknownPersona(format!("participant #{}", plan.speaker))
                })?;
            turns.push(self.agent_turn(&speaker, &plan.prompt).await?);
            self.planned += 1;
        }
        if self.is_finished() {
            self.end();
        }
        Ok(turns)
    }

    /// Execute every remaining planned turn.
    pub async fn run_to_end(&mut self) -> Result<Vec<Turn>, ColloquyError> {
        let limit = self
            .scenario
            .turn_limit(self.participants.len())
            .ok_or_else(|| {
                ColloquyError::ConfigError(format!(
                    "{} is open-ended and has no last turn",
                    self.scenario.display_name()
                ))
            })?;
        self.run(limit.saturating_sub(self.planned)).await
    }

    /// Mark the session as over. Emits `SessionEnd` once.
    pub fn end(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        info!(
            session = %self.conversation.session_id(),
            turns = self.conversation.len(),
            "session ended"
        );
        self.emit_event(SessionEvent::SessionEnd {
            session_id: self.conversation.session_id(),
            turns: self.conversation.len(),
            total_cost: self.manager.total_cost(),
        });
    }

    /// Queue extra information for a participant's next reply.
    pub fn add_context(
        &mut self,
        persona_id: &PersonaId,
        label: impl Into<String>,
        info: impl Into<String>,
    ) -> Result<(), ColloquyError> {
        self.manager.add_context(persona_id, label, info)
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn session_id(&self) -> SessionId {
        self.conversation.session_id()
    }

    pub fn participants(&self) -> &[PersonaId] {
        &self.participants
    }

    pub fn scenario(&self) -> &dyn Scenario {
        self.scenario.as_ref()
    }

    pub fn manager(&self) -> &AgentManager {
        &self.manager
    }

    pub fn store(&self) -> &dyn TurnStore {
        self.store.as_ref()
    }

    pub fn total_cost(&self) -> f64 {
        self.manager.total_cost()
    }

    /// Number of planned turns executed so far.
    pub fn planned_turns(&self) -> usize {
        self.planned
    }

    /// True once the scenario's turn limit is reached or `end` was called.
    pub fn is_finished(&self) -> bool {
        self.ended
            || self
                .scenario
                .turn_limit(self.participants.len())
                .is_some_and(|limit| self.planned >= limit)
    }

    fn emit_event(&self, event: SessionEvent) {
        if let Some(ref callback) = self.callback {
            callback(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::conversation::TurnKind;
    use crate::manager::ManagerSettings;
    use crate::persona::{Persona, ProviderKind};
    use crate::provider::ScriptedProvider;
    use crate::retry::RetryPolicy;
    use crate::scenario::{BoardDiscussionScenario, ChatbotScenario, DialogueScenario};
    use crate::narration::AzureSpeech;
    use crate::store::{InMemoryTurnStore, SessionSummary};

    /// Fails the append with the given ordinal, once.
    struct FlakyStore {
        inner: InMemoryTurnStore,
        appends: usize,
        fail_on: usize,
    }

    impl TurnStore for FlakyStore {
        fn begin_session(&mut self, info: &SessionInfo) -> Result<(), ColloquyError> {
            self.inner.begin_session(info)
        }

        fn append(&mut self, turn: &Turn) -> Result<(), ColloquyError> {
            self.appends += 1;
            if self.appends == self.fail_on {
                return Err(ColloquyError::Io(std::io::Error::other("disk full")));
            }
            self.inner.append(turn)
        }

        fn turns_for_session(&self, session: &SessionId) -> Result<Vec<Turn>, ColloquyError> {
            self.inner.turns_for_session(session)
        }

        fn sessions(&self, project: Option<&str>) -> Result<Vec<SessionSummary>, ColloquyError> {
            self.inner.sessions(project)
        }
    }

    fn id(s: &str) -> PersonaId {
        PersonaId::new(s).unwrap()
    }

    fn manager_with(provider: ScriptedProvider, names: &[&str]) -> AgentManager {
        let settings = ManagerSettings::default().with_retry(RetryPolicy::no_retry());
        let mut manager = AgentManager::new(vec![provider.into()], settings);
        for name in names {
            manager
                .register(Persona::new(
                    PersonaId::from_name(name).unwrap(),
                    *name,
                    ProviderKind::Scripted,
                    "scripted",
                    format!("You are {}.", name),
                ))
                .unwrap();
        }
        manager
    }

    fn dialogue_runner(turns: usize) -> SessionRunner {
        SessionRunner::new(
            manager_with(ScriptedProvider::numbered(), &["James", "John"]),
            Box::new(InMemoryTurnStore::new()),
            Box::new(DialogueScenario::new(turns, "Recite a poem.")),
            vec![id("james"), id("john")],
            SessionOptions::new("test"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_dialogue_runs_to_limit() {
        let mut runner = dialogue_runner(5);
        let turns = runner.run_to_end().await.unwrap();

        assert_eq!(turns.len(), 5);
        assert!(runner.is_finished());
        let speakers: Vec<&str> = turns.iter().map(|t| t.persona_id.as_str()).collect();
        assert_eq!(speakers, vec!["james", "john", "james", "john", "james"]);
        assert_eq!(turns[0].prompt, "Recite a poem.");
        assert!(turns[1].prompt.is_empty());

        let stored = runner.store().turns_for_session(&runner.session_id()).unwrap();
        assert_eq!(stored.len(), 5);
        assert_eq!(
            stored.iter().map(|t| t.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );
    }

    #[tokio::test]
    async fn test_run_never_exceeds_limit() {
        let mut runner = dialogue_runner(3);
        assert_eq!(runner.run(2).await.unwrap().len(), 2);
        assert!(!runner.is_finished());
        assert_eq!(runner.run(5).await.unwrap().len(), 1);
        assert!(runner.run(1).await.unwrap().is_empty());
        assert_eq!(runner.conversation().len(), 3);
    }

    #[tokio::test]
    async fn test_events_are_emitted_in_order() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let mut runner = dialogue_runner(2).with_callback(Box::new(move |event| {
            let tag = match event {
                SessionEvent::TurnStart { .. } => "start",
                SessionEvent::TurnComplete { .. } => "complete",
                SessionEvent::Narrated { .. } => "narrated",
                SessionEvent::SessionEnd { .. } => "end",
            };
            sink.lock().unwrap().push(tag);
        }));

        runner.run_to_end().await.unwrap();
        runner.end();
        assert_eq!(
            *events.lock().unwrap(),
            vec!["start", "complete", "start", "complete", "end"]
        );
    }

    #[tokio::test]
    async fn test_provider_failure_records_nothing() {
        let mut runner = SessionRunner::new(
            manager_with(ScriptedProvider::failing("quota exceeded"), &["James", "John"]),
            Box::new(InMemoryTurnStore::new()),
            Box::new(DialogueScenario::new(4, "Hi")),
            vec![id("james"), id("john")],
            SessionOptions::new("test"),
        )
        .unwrap();

        let err = runner.run(1).await.unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
        assert!(runner.conversation().is_empty());
        assert_eq!(runner.planned_turns(), 0);
        assert!(runner.store().turns_for_session(&runner.session_id()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_manual_turn_is_seen_by_agents() {
        let provider = ScriptedProvider::numbered();
        let mut runner = SessionRunner::new(
            manager_with(provider, &["James"]),
            Box::new(InMemoryTurnStore::new()),
            Box::new(ChatbotScenario),
            vec![id("james")],
            SessionOptions::new("chat"),
        )
        .unwrap();

        let manual = runner.manual_turn("Narrator", "The lights dim.").unwrap();
        assert_eq!(manual.kind, TurnKind::Manual);
        assert_eq!(manual.model, "manual");
        assert_eq!(manual.sequence, 1);

        let reply = runner.agent_turn(&id("james"), "What now?").await.unwrap();
        assert_eq!(reply.sequence, 2);
        assert!(!runner.is_finished());

        let Some(crate::provider::Provider::Scripted(scripted)) =
            runner.manager().provider(ProviderKind::Scripted)
        else {
            panic!("scripted provider missing");
        };
        let request = &scripted.requests()[0];
        assert!(request.messages[0].content.contains("[Narrator]The lights dim."));
    }

    #[tokio::test]
    async fn test_open_ended_has_no_end() {
        let mut runner = SessionRunner::new(
            manager_with(ScriptedProvider::numbered(), &["James"]),
            Box::new(InMemoryTurnStore::new()),
            Box::new(ChatbotScenario),
            vec![id("james")],
            SessionOptions::new("chat"),
        )
        .unwrap();
        assert!(matches!(
            runner.run_to_end().await,
            Err(ColloquyError::ConfigError(_))
        ));
        runner.end();
        assert!(runner.is_finished());
    }

    #[test]
    fn test_rejects_bad_participants() {
        let duplicate = SessionRunner::new(
            manager_with(ScriptedProvider::numbered(), &["James", "John"]),
            Box::new(InMemoryTurnStore::new()),
            Box::new(DialogueScenario::default()),
            vec![id("james"), id("james")],
            SessionOptions::new("test"),
        );
        assert!(matches!(duplicate, Err(ColloquyError::DuplicatePersona(_))));

        let unknown = SessionRunner::new(
            manager_with(ScriptedProvider::numbered(), &["James"]),
            Box::new(InMemoryTurnStore::new()),
            Box::new(DialogueScenario::default()),
            vec![id("james"), id("mark")],
            SessionOptions::new("test"),
        );
        assert!(matches!(unknown, Err(ColloquyError::UnknownPersona(_))));

        let too_many = SessionRunner::new(
            manager_with(ScriptedProvider::numbered(), &["James"]),
            Box::new(InMemoryTurnStore::new()),
            Box::new(BoardDiscussionScenario::new(2, "x")),
            vec![id("james")],
            SessionOptions::new("test"),
        );
        assert!(matches!(
            too_many,
            Err(ColloquyError::InvalidParticipantCount { actual: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_context_reaches_next_reply() {
        let mut runner = dialogue_runner(2);
        runner
            .add_context(&id("james"), "Setting", "A crowded tavern")
            .unwrap();
        runner.run(1).await.unwrap();
        assert!(runner.manager().pending_context(&id("james")).is_empty());
    }

    #[tokio::test]
    async fn test_failed_append_leaves_conversation_in_step() {
        let store = FlakyStore {
            inner: InMemoryTurnStore::new(),
            appends: 0,
            fail_on: 2,
        };
        let mut runner = SessionRunner::new(
            manager_with(ScriptedProvider::numbered(), &["James", "John"]),
            Box::new(store),
            Box::new(DialogueScenario::new(4, "Recite a poem.")),
            vec![id("james"), id("john")],
            SessionOptions::new("test"),
        )
        .unwrap();

        let err = runner.run(4).await.unwrap_err();
        assert!(matches!(err, ColloquyError::Io(_)));
        assert_eq!(runner.conversation().len(), 1);
        assert_eq!(runner.planned_turns(), 1);
        assert_eq!(
            runner.store().turns_for_session(&runner.session_id()).unwrap().len(),
            1
        );

        // The next attempt picks up with John at sequence 2
        let rest = runner.run_to_end().await.unwrap();
        assert_eq!(rest.len(), 3);
        assert!(runner.is_finished());

        let stored = runner.store().turns_for_session(&runner.session_id()).unwrap();
        assert_eq!(
            stored.iter().map(|t| t.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
        let speakers: Vec<&str> = stored.iter().map(|t| t.persona_id.as_str()).collect();
        assert_eq!(speakers, vec!["james", "john", "james", "john"]);
        assert_eq!(runner.conversation().turns(), stored.as_slice());
    }

    #[tokio::test]
    async fn test_unreachable_narrator_keeps_turns_without_audio() {
        let audio_dir = tempfile::TempDir::new().unwrap();
        let speech = AzureSpeech::new(
            reqwest::Client::new(),
            "k",
            "http://127.0.0.1:9/cognitiveservices/v1",
        )
        .with_retry(RetryPolicy::no_retry());

        let narrated = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&narrated);
        let mut runner = dialogue_runner(2)
            .with_narrator(Narrator::Azure(speech), audio_dir.path())
            .with_callback(Box::new(move |event| {
                if let SessionEvent::Narrated { .. } = event {
                    *sink.lock().unwrap() += 1;
                }
            }));

        let turns = runner.run_to_end().await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(*narrated.lock().unwrap(), 0);

        let stored = runner.store().turns_for_session(&runner.session_id()).unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|t| t.audio_path.is_none()));
    }
}
