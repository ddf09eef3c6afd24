//! Scenario definitions and trait.
//!
//! A scenario decides who speaks next and what they are asked. The session
//! runner drives it one planned turn at a time.

use crate::error::ColloquyError;

/// Largest board a discussion accepts.
pub const MAX_BOARD_MEMBERS: usize = 8;

/// The next speaker (index into the participant list) and their prompt.
/// An empty prompt means the speaker feeds off the conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedTurn {
    pub speaker: usize,
    pub prompt: String,
}

/// Trait for runnable conversation scenarios.
pub trait Scenario: Send + Sync {
    /// Short identifier, also stored with the session.
    fn name(&self) -> &str;

    fn display_name(&self) -> &str;

    fn min_participants(&self) -> usize;

    fn max_participants(&self) -> usize;

    /// Total planned turns for this many participants; `None` is open-ended.
    fn turn_limit(&self, participant_count: usize) -> Option<usize>;

    /// Plan the turn at zero-based `index`.
    fn plan_turn(&self, index: usize, participant_count: usize) -> PlannedTurn;

    fn validate_participants(&self, count: usize) -> Result<(), ColloquyError> {
        if count < self.min_participants() || count > self.max_participants() {
            return Err(ColloquyError::InvalidParticipantCount {
                scenario: self.name().to_string(),
                min: self.min_participants(),
                max: self.max_participants(),
                actual: count,
            });
        }
        Ok(())
    }
}

/// One persona answering a human, open-ended.
#[derive(Debug, Clone, Default)]
pub struct ChatbotScenario;

impl Scenario for ChatbotScenario {
    fn name(&self) -> &str {
        "chatbot"
    }

    fn display_name(&self) -> &str {
        "Chatbot"
    }

    fn min_participants(&self) -> usize {
        1
    }

    fn max_participants(&self) -> usize {
        1
    }

    fn turn_limit(&self, _participant_count: usize) -> Option<usize> {
        None
    }

    fn plan_turn(&self, _index: usize, _participant_count: usize) -> PlannedTurn {
        PlannedTurn {
            speaker: 0,
            prompt: String::new(),
        }
    }
}

/// Two personas taking turns, A, B, A, B...
#[derive(Debug, Clone)]
pub struct DialogueScenario {
    turns: usize,
    opening: String,
}

impl DialogueScenario {
    pub fn new(turns: usize, opening: impl Into<String>) -> Self {
        Self {
            turns,
            opening: opening.into(),
        }
    }

    pub fn opening(&self) -> &str {
        &self.opening
    }
}

impl Default for DialogueScenario {
    fn default() -> Self {
        Self::new(
            10,
            "To impress them, you decided to recite a poem you made on the spot.",
        )
    }
}

impl Scenario for DialogueScenario {
    fn name(&self) -> &str {
        "dialogue"
    }

    fn display_name(&self) -> &str {
        "Two-Persona Dialogue"
    }

    fn min_participants(&self) -> usize {
        2
    }

    fn max_participants(&self) -> usize {
        2
    }

    fn turn_limit(&self, _participant_count: usize) -> Option<usize> {
        Some(self.turns)
    }

    fn plan_turn(&self, index: usize, _participant_count: usize) -> PlannedTurn {
        PlannedTurn {
            speaker: index % 2,
            prompt: if index == 0 {
                self.opening.clone()
            } else {
                String::new()
            },
        }
    }
}

/// A board of personas discussing an agenda round-robin.
#[derive(Debug, Clone)]
pub struct BoardDiscussionScenario {
    rounds: usize,
    agenda: String,
}

impl BoardDiscussionScenario {
    pub fn new(rounds: usize, agenda: impl Into<String>) -> Self {
        Self {
            rounds: rounds.max(1),
            agenda: agenda.into(),
        }
    }

    pub fn rounds(&self) -> usize {
        self.rounds
    }
}

impl Scenario for BoardDiscussionScenario {
    fn name(&self) -> &str {
        "board"
    }

    fn display_name(&self) -> &str {
        "Board Discussion"
    }

    fn min_participants(&self) -> usize {
        2
    }

    fn max_participants(&self) -> usize {
        MAX_BOARD_MEMBERS
    }

    fn turn_limit(&self, participant_count: usize) -> Option<usize> {
        Some(self.rounds * participant_count)
    }

    fn plan_turn(&self, index: usize, participant_count: usize) -> PlannedTurn {
        let count = participant_count.max(1);
        let round = index / count;
        let speaker = index % count;

        let prompt = if index == 0 {
            format!(
                "The board meeting is now open. The agenda: {}. Please open the discussion.",
                self.agenda
            )
        } else if speaker == 0 && round + 1 == self.rounds {
            "This is the final round. Please start the closing statements.".to_string()
        } else {
            String::new()
        };

        PlannedTurn { speaker, prompt }
    }
}

/// Build a scenario by name. `length` is turns for a dialogue and rounds
/// for a board; `topic` is the opening line or the agenda.
pub fn get_scenario(name: &str, length: usize, topic: &str) -> Option<Box<dyn Scenario>> {
    match name.to_lowercase().as_str() {
        "chatbot" | "chat" => Some(Box::new(ChatbotScenario)),
        "dialogue" => Some(Box::new(DialogueScenario::new(length, topic))),
        "board" | "board_discussion" => Some(Box::new(BoardDiscussionScenario::new(length, topic))),
        _ => None,
    }
}

/// List all available scenario names.
pub fn available_scenarios() -> Vec<&'static str> {
    vec!["chatbot", "dialogue", "board"]
}
