//! Conversation turns and the ordered per-session log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ColloquyError;
use crate::persona::PersonaId;

/// Model name recorded for turns that were not generated.
pub const MANUAL_MODEL: &str = "manual";

/// Identifier of one run of a scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = ColloquyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| ColloquyError::ConfigError(format!("Invalid session id '{}': {}", s, e)))
    }
}

/// Where a turn's text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnKind {
    /// Generated by a provider.
    Agent,
    /// Typed by a human or injected by the scenario.
    Manual,
}

impl TurnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnKind::Agent => "agent",
            TurnKind::Manual => "manual",
        }
    }
}

impl FromStr for TurnKind {
    type Err = ColloquyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent" => Ok(TurnKind::Agent),
            "manual" => Ok(TurnKind::Manual),
            other => Err(ColloquyError::ConfigError(format!(
                "Unknown turn kind '{}'",
                other
            ))),
        }
    }
}

/// One recorded message. Never mutated once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub session_id: SessionId,
    /// 1-based position within the session.
    pub sequence: u32,
    pub kind: TurnKind,
    pub persona_id: PersonaId,
    pub persona_name: String,
    pub model: String,
    /// Instruction given for this turn; empty when the speaker fed off the
    /// conversation alone.
    pub prompt: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub audio_path: Option<PathBuf>,
}

/// Everything needed to record a turn except its position and time.
#[derive(Debug, Clone)]
pub struct NewTurn {
    pub kind: TurnKind,
    pub persona_id: PersonaId,
    pub persona_name: String,
    pub model: String,
    pub prompt: String,
    pub content: String,
    pub audio_path: Option<PathBuf>,
}

impl NewTurn {
    pub fn agent(
        persona_id: PersonaId,
        persona_name: impl Into<String>,
        model: impl Into<String>,
        prompt: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            kind: TurnKind::Agent,
            persona_id,
            persona_name: persona_name.into(),
            model: model.into(),
            prompt: prompt.into(),
            content: content.into(),
            audio_path: None,
        }
    }

    pub fn manual(
        persona_id: PersonaId,
        persona_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            kind: TurnKind::Manual,
            persona_id,
            persona_name: persona_name.into(),
            model: MANUAL_MODEL.to_string(),
            prompt: String::new(),
            content: content.into(),
            audio_path: None,
        }
    }

    pub fn with_audio(mut self, path: impl Into<PathBuf>) -> Self {
        self.audio_path = Some(path.into());
        self
    }
}

/// Ordered turns of one session.
#[derive(Debug, Clone)]
pub struct Conversation {
    session_id: SessionId,
    turns: Vec<Turn>,
}

impl Conversation {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            turns: Vec::new(),
        }
    }

    /// Rebuild from persisted turns, which must be consecutive from 1.
    pub fn from_turns(session_id: SessionId, turns: Vec<Turn>) -> Result<Self, ColloquyError> {
        for (i, turn) in turns.iter().enumerate() {
            let expected = i as u32 + 1;
            if turn.sequence != expected || turn.session_id != session_id {
                return Err(ColloquyError::OutOfOrderTurn {
                    session: session_id.to_string(),
                    sequence: turn.sequence,
                    expected,
                });
            }
        }
        Ok(Self { session_id, turns })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Position the next recorded turn will take.
    pub fn next_sequence(&self) -> u32 {
        self.turns.len() as u32 + 1
    }

    /// Append a turn, assigning its sequence and timestamp.
    ///
    /// Timestamps never go backwards within a conversation, even if the
    /// wall clock does.
    pub fn record(&mut self, new: NewTurn) -> Turn {
        let turn = self.prepare(new);
        self.turns.push(turn.clone());
        turn
    }

    /// Build the next turn without appending it. Pair with [`commit`]
    /// once the turn is durably stored elsewhere.
    ///
    /// [`commit`]: Conversation::commit
    pub fn prepare(&self, new: NewTurn) -> Turn {
        self.prepare_at(new, Utc::now())
    }

    /// Append a turn built by [`prepare`](Conversation::prepare).
    pub fn commit(&mut self, turn: Turn) -> Result<(), ColloquyError> {
        let expected = self.next_sequence();
        if turn.session_id != self.session_id || turn.sequence != expected {
            return Err(ColloquyError::OutOfOrderTurn {
                session: self.session_id.to_string(),
                sequence: turn.sequence,
                expected,
            });
        }
        self.turns.push(turn);
        Ok(())
    }

    fn prepare_at(&self, new: NewTurn, now: DateTime<Utc>) -> Turn {
        let created_at = match self.turns.last() {
            Some(last) if last.created_at > now => last.created_at,
            _ => now,
        };

        Turn {
            session_id: self.session_id,
            sequence: self.next_sequence(),
            kind: new.kind,
            persona_id: new.persona_id,
            persona_name: new.persona_name,
            model: new.model,
            prompt: new.prompt,
            content: new.content,
            created_at,
            audio_path: new.audio_path,
        }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn id(s: &str) -> PersonaId {
        PersonaId::new(s).unwrap()
    }

    #[test]
    fn test_record_assigns_consecutive_sequences() {
        let mut convo = Conversation::new(SessionId::new());
        let a = convo.record(NewTurn::agent(id("a"), "A", "m", "hi", "hello"));
        let b = convo.record(NewTurn::agent(id("b"), "B", "m", "", "hey"));

        assert_eq!(a.sequence, 1);
        assert_eq!(b.sequence, 2);
        assert_eq!(convo.next_sequence(), 3);
        assert_eq!(convo.last().unwrap().persona_id, id("b"));
    }

    #[test]
    fn test_timestamps_never_go_backwards() {
        let mut convo = Conversation::new(SessionId::new());
        let now = Utc::now();
        let first = convo.prepare_at(NewTurn::manual(id("u"), "User", "one"), now);
        convo.commit(first.clone()).unwrap();
        let second = convo.prepare_at(
            NewTurn::manual(id("u"), "User", "two"),
            now - Duration::seconds(30),
        );
        assert_eq!(second.created_at, first.created_at);
    }

    #[test]
    fn test_prepare_leaves_log_untouched_until_commit() {
        let mut convo = Conversation::new(SessionId::new());
        let turn = convo.prepare(NewTurn::manual(id("u"), "User", "one"));
        assert_eq!(turn.sequence, 1);
        assert!(convo.is_empty());

        // Preparing again yields the same slot
        assert_eq!(convo.prepare(NewTurn::manual(id("u"), "User", "two")).sequence, 1);

        convo.commit(turn.clone()).unwrap();
        assert_eq!(convo.len(), 1);
        assert!(matches!(
            convo.commit(turn),
            Err(ColloquyError::OutOfOrderTurn { sequence: 1, expected: 2, .. })
        ));
    }

    #[test]
    fn test_manual_turn_uses_manual_model() {
        let mut convo = Conversation::new(SessionId::new());
        let turn = convo.record(NewTurn::manual(id("user"), "You", "hello there"));
        assert_eq!(turn.kind, TurnKind::Manual);
        assert_eq!(turn.model, MANUAL_MODEL);
    }

    #[test]
    fn test_from_turns_rejects_gaps() {
        let session = SessionId::new();
        let mut convo = Conversation::new(session);
        convo.record(NewTurn::manual(id("u"), "U", "1"));
        let mut turns = convo.turns().to_vec();
        let mut skipped = turns[0].clone();
        skipped.sequence = 3;
        turns.push(skipped);

        assert!(matches!(
            Conversation::from_turns(session, turns),
            Err(ColloquyError::OutOfOrderTurn { sequence: 3, expected: 2, .. })
        ));
    }

    #[test]
    fn test_session_id_round_trips_through_text() {
        let session = SessionId::new();
        let parsed: SessionId = session.to_string().parse().unwrap();
        assert_eq!(parsed, session);
        assert!("not-a-uuid".parse::<SessionId>().is_err());
    }
}
