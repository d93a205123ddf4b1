use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use serde::{Deserialize, Serialize};
use std::path::Path;

use tracepipe_types::{Acceptance, Platform, SessionStatus};

use crate::timefmt;
use crate::{Error, Result};

// Schema version (increment when changing table definitions)
const SCHEMA_VERSION: i32 = 1;

// NOTE: Conversation Store Rationale
//
// Turns are owned by their session row; back-references are by
// (session_key, turn_id) lookup, never pointers. tool_uses is a JSON blob
// column: it is written whole by the single per-session writer and read
// whole, so relational decomposition buys nothing.
//
// The `applied` table is the dedup index that makes the builder idempotent:
// (event_id, builder_id) is inserted in the same transaction as the state
// change it guards, so redelivery after a crash can never half-apply.

/// One session row
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub session_key: String,
    pub platform: Platform,
    pub external_session_id: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub status: SessionStatus,
}

/// A tool invocation observed between a turn's prompt and response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolUse {
    pub event_id: String,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    pub at: DateTime<Utc>,
}

/// Compact session listing row for read surfaces
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_key: String,
    pub platform: String,
    pub external_session_id: String,
    pub last_seen_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub turn_count: i64,
}

/// One reconstructed turn
#[derive(Debug, Clone)]
pub struct TurnRow {
    pub session_key: String,
    pub turn_id: i64,
    pub prompt_event_id: String,
    pub response_event_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub accepted: Acceptance,
    pub tool_uses: Vec<ToolUse>,
}

/// Structured conversations and turns keyed by session
pub struct ConversationStore {
    conn: Connection,
}

impl ConversationStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let current_version: i32 =
            self.conn
                .query_row("PRAGMA user_version", [], |row| row.get(0))?;

        if current_version != 0 && current_version != SCHEMA_VERSION {
            self.conn.execute_batch(
                r#"
                DROP TABLE IF EXISTS applied;
                DROP TABLE IF EXISTS turns;
                DROP TABLE IF EXISTS sessions;
                "#,
            )?;
        }

        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_key TEXT PRIMARY KEY,
                platform TEXT NOT NULL,
                external_session_id TEXT NOT NULL,
                first_seen_at TEXT NOT NULL,
                last_seen_at TEXT NOT NULL,
                status TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS turns (
                session_key TEXT NOT NULL,
                turn_id INTEGER NOT NULL,
                prompt_event_id TEXT NOT NULL,
                response_event_id TEXT,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                accepted TEXT NOT NULL DEFAULT 'unknown',
                tool_uses_blob TEXT NOT NULL DEFAULT '[]',
                PRIMARY KEY (session_key, turn_id),
                FOREIGN KEY (session_key) REFERENCES sessions(session_key)
            );

            CREATE TABLE IF NOT EXISTS applied (
                event_id TEXT NOT NULL,
                builder_id TEXT NOT NULL,
                applied_at TEXT NOT NULL,
                PRIMARY KEY (event_id, builder_id)
            );

            CREATE INDEX IF NOT EXISTS idx_turns_started ON turns(session_key, started_at);
            CREATE INDEX IF NOT EXISTS idx_applied_at ON applied(applied_at);
            "#,
        )?;

        self.conn
            .execute(&format!("PRAGMA user_version = {}", SCHEMA_VERSION), [])?;

        Ok(())
    }

    /// Start a transaction covering one derived-state update
    pub fn begin(&mut self) -> Result<ConversationTxn<'_>> {
        Ok(ConversationTxn {
            tx: self.conn.transaction()?,
        })
    }

    pub fn session(&self, session_key: &str) -> Result<Option<SessionRow>> {
        session_query(&self.conn, session_key)
    }

    pub fn turns(&self, session_key: &str) -> Result<Vec<TurnRow>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT session_key, turn_id, prompt_event_id, response_event_id,
                   started_at, completed_at, accepted, tool_uses_blob
            FROM turns
            WHERE session_key = ?1
            ORDER BY turn_id
            "#,
        )?;
        let rows = stmt.query_map([session_key], row_to_turn_parts)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .map(turn_from_parts)
            .collect()
    }

    pub fn session_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Most recently active sessions with their turn counts
    pub fn list_sessions(&self, limit: usize) -> Result<Vec<SessionSummary>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT s.session_key, s.platform, s.external_session_id,
                   s.last_seen_at, s.status,
                   (SELECT COUNT(*) FROM turns t WHERE t.session_key = s.session_key)
            FROM sessions s
            ORDER BY s.last_seen_at DESC
            LIMIT ?1
            "#,
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .map(
                |(session_key, platform, external_session_id, last_seen, status, turn_count)| {
                    Ok(SessionSummary {
                        session_key,
                        platform,
                        external_session_id,
                        last_seen_at: timefmt::parse(&last_seen)?,
                        status: SessionStatus::parse(&status).ok_or_else(|| {
                            Error::Corrupt(format!("bad status '{}'", status))
                        })?,
                        turn_count,
                    })
                },
            )
            .collect()
    }

    /// Drop dedup acknowledgements older than `before` (rolling window,
    /// matched to raw-store retention by the operator)
    pub fn prune_applied_before(&self, before: DateTime<Utc>) -> Result<usize> {
        let pruned = self.conn.execute(
            "DELETE FROM applied WHERE applied_at < ?1",
            [timefmt::to_text(before)],
        )?;
        Ok(pruned)
    }
}

/// Typed operations available inside one update transaction
pub struct ConversationTxn<'conn> {
    tx: Transaction<'conn>,
}

impl ConversationTxn<'_> {
    pub fn already_applied(&self, event_id: &str, builder_id: &str) -> Result<bool> {
        let found: Option<i64> = self
            .tx
            .query_row(
                "SELECT 1 FROM applied WHERE event_id = ?1 AND builder_id = ?2",
                params![event_id, builder_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn mark_applied(&self, event_id: &str, builder_id: &str) -> Result<()> {
        self.tx.execute(
            "INSERT OR IGNORE INTO applied (event_id, builder_id, applied_at) VALUES (?1, ?2, ?3)",
            params![event_id, builder_id, timefmt::to_text(Utc::now())],
        )?;
        Ok(())
    }

    pub fn session(&self, session_key: &str) -> Result<Option<SessionRow>> {
        session_query(&self.tx, session_key)
    }

    pub fn upsert_session(&self, session: &SessionRow) -> Result<()> {
        self.tx.execute(
            r#"
            INSERT INTO sessions
                (session_key, platform, external_session_id, first_seen_at, last_seen_at, status)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(session_key) DO UPDATE SET
                last_seen_at = ?5,
                status = ?6
            "#,
            params![
                &session.session_key,
                session.platform.as_str(),
                &session.external_session_id,
                timefmt::to_text(session.first_seen_at),
                timefmt::to_text(session.last_seen_at),
                session.status.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Turn id for the next turn in a session (ids are dense per session)
    pub fn next_turn_id(&self, session_key: &str) -> Result<i64> {
        let max: Option<i64> = self.tx.query_row(
            "SELECT MAX(turn_id) FROM turns WHERE session_key = ?1",
            [session_key],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0) + 1)
    }

    /// The currently open turn, if any (highest turn_id with no completion)
    pub fn open_turn(&self, session_key: &str) -> Result<Option<TurnRow>> {
        let parts = self
            .tx
            .query_row(
                r#"
                SELECT session_key, turn_id, prompt_event_id, response_event_id,
                       started_at, completed_at, accepted, tool_uses_blob
                FROM turns
                WHERE session_key = ?1 AND completed_at IS NULL
                ORDER BY turn_id DESC
                LIMIT 1
                "#,
                [session_key],
                row_to_turn_parts,
            )
            .optional()?;
        parts.map(turn_from_parts).transpose()
    }

    /// The most recent turn regardless of completion
    pub fn latest_turn(&self, session_key: &str) -> Result<Option<TurnRow>> {
        let parts = self
            .tx
            .query_row(
                r#"
                SELECT session_key, turn_id, prompt_event_id, response_event_id,
                       started_at, completed_at, accepted, tool_uses_blob
                FROM turns
                WHERE session_key = ?1
                ORDER BY turn_id DESC
                LIMIT 1
                "#,
                [session_key],
                row_to_turn_parts,
            )
            .optional()?;
        parts.map(turn_from_parts).transpose()
    }

    pub fn insert_turn(&self, turn: &TurnRow) -> Result<()> {
        self.tx.execute(
            r#"
            INSERT INTO turns
                (session_key, turn_id, prompt_event_id, response_event_id,
                 started_at, completed_at, accepted, tool_uses_blob)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            turn_params(turn)?,
        )?;
        Ok(())
    }

    pub fn update_turn(&self, turn: &TurnRow) -> Result<()> {
        self.tx.execute(
            r#"
            UPDATE turns
            SET prompt_event_id = ?3, response_event_id = ?4, started_at = ?5,
                completed_at = ?6, accepted = ?7, tool_uses_blob = ?8
            WHERE session_key = ?1 AND turn_id = ?2
            "#,
            turn_params(turn)?,
        )?;
        Ok(())
    }

    pub fn commit(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }
}

type TurnParts = (
    String,
    i64,
    String,
    Option<String>,
    String,
    Option<String>,
    String,
    String,
);

fn row_to_turn_parts(row: &Row<'_>) -> rusqlite::Result<TurnParts> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn turn_from_parts(parts: TurnParts) -> Result<TurnRow> {
    let (session_key, turn_id, prompt_event_id, response_event_id, started, completed, accepted, blob) =
        parts;

    Ok(TurnRow {
        session_key,
        turn_id,
        prompt_event_id,
        response_event_id,
        started_at: timefmt::parse(&started)?,
        completed_at: completed.as_deref().map(timefmt::parse).transpose()?,
        accepted: Acceptance::parse(&accepted)
            .ok_or_else(|| Error::Corrupt(format!("bad acceptance '{}'", accepted)))?,
        tool_uses: serde_json::from_str(&blob)?,
    })
}

fn turn_params(turn: &TurnRow) -> Result<TurnParts> {
    let blob = serde_json::to_string(&turn.tool_uses)?;
    Ok((
        turn.session_key.clone(),
        turn.turn_id,
        turn.prompt_event_id.clone(),
        turn.response_event_id.clone(),
        timefmt::to_text(turn.started_at),
        turn.completed_at.map(timefmt::to_text),
        turn.accepted.as_str().to_string(),
        blob,
    ))
}

fn session_query(conn: &Connection, session_key: &str) -> Result<Option<SessionRow>> {
    let parts: Option<(String, String, String, String, String, String)> = conn
        .query_row(
            r#"
            SELECT session_key, platform, external_session_id,
                   first_seen_at, last_seen_at, status
            FROM sessions WHERE session_key = ?1
            "#,
            [session_key],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            },
        )
        .optional()?;

    match parts {
        Some((session_key, platform, external_session_id, first, last, status)) => {
            Ok(Some(SessionRow {
                session_key,
                platform: Platform::from(platform.as_str()),
                external_session_id,
                first_seen_at: timefmt::parse(&first)?,
                last_seen_at: timefmt::parse(&last)?,
                status: SessionStatus::parse(&status)
                    .ok_or_else(|| Error::Corrupt(format!("bad status '{}'", status)))?,
            }))
        }
        None => Ok(None),
    }
}
