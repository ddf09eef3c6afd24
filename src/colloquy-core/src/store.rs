//! Append-only persistence of conversation turns.
//!
//! Each session is recorded once when it begins and its turns are appended
//! one by one, strictly in sequence. Reading a session back returns the
//! turns in the order they were appended. A store has a single writer.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::conversation::{SessionId, Turn, TurnKind};
use crate::error::ColloquyError;
use crate::persona::PersonaId;

/// One run of a scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub project: String,
    pub scenario: String,
    pub started_at: DateTime<Utc>,
}

impl SessionInfo {
    pub fn new(id: SessionId, project: impl Into<String>, scenario: impl Into<String>) -> Self {
        Self {
            id,
            project: project.into(),
            scenario: scenario.into(),
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub info: SessionInfo,
    pub turn_count: u32,
}

/// Storage backend for conversation turns.
pub trait TurnStore: Send {
    /// Record the start of a session.
    fn begin_session(&mut self, info: &SessionInfo) -> Result<(), ColloquyError>;

    /// Append a turn. Its sequence must directly follow the session's last.
    fn append(&mut self, turn: &Turn) -> Result<(), ColloquyError>;

    /// All turns of a session, in append order.
    fn turns_for_session(&self, session: &SessionId) -> Result<Vec<Turn>, ColloquyError>;

    /// Sessions, newest first, optionally for one project only.
    fn sessions(&self, project: Option<&str>) -> Result<Vec<SessionSummary>, ColloquyError>;
}

fn check_sequence(turn: &Turn, last: u32) -> Result<(), ColloquyError> {
    let expected = last + 1;
    if turn.sequence != expected {
        return Err(ColloquyError::OutOfOrderTurn {
            session: turn.session_id.to_string(),
            sequence: turn.sequence,
            expected,
        });
    }
    Ok(())
}

// In-memory store

#[derive(Debug, Default)]
pub struct InMemoryTurnStore {
    sessions: Vec<SessionInfo>,
    turns: HashMap<SessionId, Vec<Turn>>,
}

impl InMemoryTurnStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored turns.
    pub fn len(&self) -> usize {
        self.turns.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TurnStore for InMemoryTurnStore {
    fn begin_session(&mut self, info: &SessionInfo) -> Result<(), ColloquyError> {
        if !self.turns.contains_key(&info.id) {
            self.sessions.push(info.clone());
            self.turns.insert(info.id, Vec::new());
        }
        Ok(())
    }

    fn append(&mut self, turn: &Turn) -> Result<(), ColloquyError> {
        let turns = self
            .turns
            .get_mut(&turn.session_id)
            .ok_or_else(|| ColloquyError::UnknownSession(turn.session_id.to_string()))?;
        check_sequence(turn, turns.len() as u32)?;
        turns.push(turn.clone());
        Ok(())
    }

    fn turns_for_session(&self, session: &SessionId) -> Result<Vec<Turn>, ColloquyError> {
        Ok(self.turns.get(session).cloned().unwrap_or_default())
    }

    fn sessions(&self, project: Option<&str>) -> Result<Vec<SessionSummary>, ColloquyError> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .iter()
            .filter(|s| project.is_none_or(|p| s.project == p))
            .map(|s| SessionSummary {
                info: s.clone(),
                turn_count: self.turns.get(&s.id).map_or(0, |t| t.len() as u32),
            })
            .collect();
        summaries.reverse();
        Ok(summaries)
    }
}

// SQLite store

/// SQLite-backed store in a single database file.
pub struct SqliteTurnStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl SqliteTurnStore {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ColloquyError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::initialize_schema(&conn)?;
        tracing::debug!(path = %path.display(), "opened turn store");
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    /// In-memory database, for tests.
    pub fn in_memory() -> Result<Self, ColloquyError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_schema(&conn)?;
        Ok(Self { conn, path: None })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn initialize_schema(conn: &Connection) -> Result<(), ColloquyError> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                project TEXT NOT NULL,
                scenario TEXT NOT NULL,
                started_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS turns (
                session_id TEXT NOT NULL REFERENCES sessions(id),
                sequence INTEGER NOT NULL,
                kind TEXT NOT NULL,
                persona_id TEXT NOT NULL,
                persona_name TEXT NOT NULL,
                model TEXT NOT NULL,
                prompt TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                audio_path TEXT,
                PRIMARY KEY (session_id, sequence)
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_project
                ON sessions(project, started_at);
            "#,
        )?;
        Ok(())
    }

    fn row_to_turn(row: &rusqlite::Row) -> rusqlite::Result<Turn> {
        let session: String = row.get(0)?;
        let kind: String = row.get(2)?;
        let persona_id: String = row.get(3)?;
        let created_at: String = row.get(8)?;
        let audio_path: Option<String> = row.get(9)?;

        Ok(Turn {
            session_id: session.parse().map_err(|e| conversion_error(0, e))?,
            sequence: row.get(1)?,
            kind: kind.parse::<TurnKind>().map_err(|e| conversion_error(2, e))?,
            persona_id: PersonaId::new(persona_id).map_err(|e| conversion_error(3, e))?,
            persona_name: row.get(4)?,
            model: row.get(5)?,
            prompt: row.get(6)?,
            content: row.get(7)?,
            created_at: parse_time(&created_at).map_err(|e| conversion_error(8, e))?,
            audio_path: audio_path.map(PathBuf::from),
        })
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

fn conversion_error(column: usize, e: impl std::fmt::Display) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        e.to_string().into(),
    )
}

impl TurnStore for SqliteTurnStore {
    fn begin_session(&mut self, info: &SessionInfo) -> Result<(), ColloquyError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO sessions (id, project, scenario, started_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                info.id.to_string(),
                info.project,
                info.scenario,
                info.started_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn append(&mut self, turn: &Turn) -> Result<(), ColloquyError> {
        let session = turn.session_id.to_string();
        let tx = self.conn.transaction()?;

        let exists: Option<i64> = tx
            .query_row("SELECT 1 FROM sessions WHERE id = ?1", [&session], |row| row.get(0))
            .optional()?;
        if exists.is_none() {
            return Err(ColloquyError::UnknownSession(session));
        }

        let last: u32 = tx.query_row(
            "SELECT COALESCE(MAX(sequence), 0) FROM turns WHERE session_id = ?1",
            [&session],
            |row| row.get(0),
        )?;
        check_sequence(turn, last)?;

        tx.execute(
            r#"
            INSERT INTO turns
                (session_id, sequence, kind, persona_id, persona_name, model, prompt, content, created_at, audio_path)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                session,
                turn.sequence,
                turn.kind.as_str(),
                turn.persona_id.as_str(),
                turn.persona_name,
                turn.model,
                turn.prompt,
                turn.content,
                turn.created_at.to_rfc3339(),
                turn.audio_path.as_ref().map(|p| p.to_string_lossy().into_owned()),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn turns_for_session(&self, session: &SessionId) -> Result<Vec<Turn>, ColloquyError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT session_id, sequence, kind, persona_id, persona_name, model, prompt, content, created_at, audio_path
            FROM turns
            WHERE session_id = ?1
            ORDER BY sequence
            "#,
        )?;
        let turns = stmt
            .query_map([session.to_string()], Self::row_to_turn)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(turns)
    }

    fn sessions(&self, project: Option<&str>) -> Result<Vec<SessionSummary>, ColloquyError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT s.id, s.project, s.scenario, s.started_at,
                   (SELECT COUNT(*) FROM turns t WHERE t.session_id = s.id)
            FROM sessions s
            WHERE ?1 IS NULL OR s.project = ?1
            ORDER BY s.started_at DESC, s.rowid DESC
            "#,
        )?;
        let summaries = stmt
            .query_map([project], |row| {
                let id: String = row.get(0)?;
                let started_at: String = row.get(3)?;
                Ok(SessionSummary {
                    info: SessionInfo {
                        id: id.parse().map_err(|e| conversion_error(0, e))?,
                        project: row.get(1)?,
                        scenario: row.get(2)?,
                        started_at: parse_time(&started_at).map_err(|e| conversion_error(3, e))?,
                    },
                    turn_count: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(summaries)
    }
}
