use std::sync::{Arc, Mutex};
use tracing::debug;

use tracepipe_store::{ConversationStore, ConversationTxn, RawStore, SessionRow, ToolUse, TurnRow};
use tracepipe_types::{
    Acceptance, CdcRecord, EventType, FileOperation, IngressEvent, SessionStatus, session_key,
};

use crate::builder::{BuildOutcome, Builder};
use crate::resolve::resolve_event;
use crate::session_lock::SessionLocks;
use crate::Result;

// NOTE: Session/turn state machine
//
//            SessionStart
//   (none) ─────────────▶ OPEN ──────────────────────────┐
//                          │  UserPrompt                 │
//                          ▼                             │
//                       TURN_OPEN ── tool events ──▶ TURN_OPEN
//                          │  AssistantResponse          │
//                          ▼                             │
//                       TURN_CLOSED ── UserPrompt ──▶ TURN_OPEN
//                          │  SessionEnd                 │
//                          ▼                             │
//                        CLOSED ◀────────────────────────┘
//
// - Any event implicitly creates its session; a late SessionStart is
//   absorbed without resetting anything.
// - A prompt landing on an open turn force-closes it as incomplete, with
//   completed_at = the new prompt's enqueued_at.
// - Events arriving after SessionEnd reopen the session (reconnecting
//   agents that failed silently).
// - Accept/reject is inferred from FileEdit operation signals and lands on
//   the most recent responded turn still marked unknown.

/// Rebuilds conversations from CDC records. Strictly idempotent per
/// `event_id`: replays leave the store byte-equivalent.
pub struct ConversationBuilder {
    conversations: Arc<Mutex<ConversationStore>>,
    raw: Arc<Mutex<RawStore>>,
    locks: SessionLocks,
}

impl ConversationBuilder {
    pub fn new(
        conversations: Arc<Mutex<ConversationStore>>,
        raw: Arc<Mutex<RawStore>>,
    ) -> Self {
        Self {
            conversations,
            raw,
            locks: SessionLocks::new(),
        }
    }

    fn try_apply(&self, record: &CdcRecord) -> Result<bool> {
        let event = resolve_event(record, &self.raw)?;
        let key = session_key(&event.platform, &event.external_session_id);

        let lock = self.locks.for_session(&key);
        let _guard = SessionLocks::hold(&lock);

        let mut store = self.conversations.lock().expect("conversation store lock poisoned");
        let txn = store.begin()?;

        if txn.already_applied(&event.event_id, self.id())? {
            return Ok(false);
        }

        update_session(&txn, &key, &event)?;
        update_turns(&txn, &key, &event)?;

        txn.mark_applied(&event.event_id, self.id())?;
        txn.commit()?;

        debug!(event_id = %event.event_id, session = %key, "applied conversation update");
        Ok(true)
    }
}

impl Builder for ConversationBuilder {
    fn id(&self) -> &'static str {
        "conversation"
    }

    fn apply(&self, record: &CdcRecord) -> BuildOutcome {
        match self.try_apply(record) {
            Ok(true) => BuildOutcome::Applied,
            Ok(false) => BuildOutcome::Skipped,
            Err(err) => BuildOutcome::from_error(err),
        }
    }
}

fn update_session(txn: &ConversationTxn<'_>, key: &str, event: &IngressEvent) -> Result<()> {
    let closing = event.event_type == EventType::SessionEnd;

    let session = match txn.session(key)? {
        Some(mut row) => {
            if event.enqueued_at > row.last_seen_at {
                row.last_seen_at = event.enqueued_at;
            }
            // SessionEnd closes; anything else (re)opens
            row.status = if closing {
                SessionStatus::Closed
            } else {
                SessionStatus::Open
            };
            row
        }
        None => SessionRow {
            session_key: key.to_string(),
            platform: event.platform.clone(),
            external_session_id: event.external_session_id.clone(),
            first_seen_at: event.enqueued_at,
            last_seen_at: event.enqueued_at,
            status: if closing {
                SessionStatus::Closed
            } else {
                SessionStatus::Open
            },
        },
    };

    txn.upsert_session(&session)?;
    Ok(())
}

fn update_turns(txn: &ConversationTxn<'_>, key: &str, event: &IngressEvent) -> Result<()> {
    match &event.event_type {
        // Absorbed: session row is already up to date
        EventType::SessionStart => {}

        EventType::UserPrompt => {
            if let Some(mut open) = txn.open_turn(key)? {
                open.completed_at = Some(event.enqueued_at);
                txn.update_turn(&open)?;
            }
            let turn = TurnRow {
                session_key: key.to_string(),
                turn_id: txn.next_turn_id(key)?,
                prompt_event_id: event.event_id.clone(),
                response_event_id: None,
                started_at: event.enqueued_at,
                completed_at: None,
                accepted: Acceptance::Unknown,
                tool_uses: Vec::new(),
            };
            txn.insert_turn(&turn)?;
        }

        EventType::AssistantResponse => {
            if let Some(mut open) = txn.open_turn(key)? {
                open.response_event_id = Some(event.event_id.clone());
                open.completed_at = Some(event.enqueued_at);
                txn.update_turn(&open)?;
            }
        }

        EventType::ToolPre
        | EventType::ToolPost
        | EventType::ShellPre
        | EventType::ShellPost
        | EventType::FileEdit => {
            if let Some(mut open) = txn.open_turn(key)? {
                open.tool_uses.push(ToolUse {
                    event_id: event.event_id.clone(),
                    event_type: event.event_type.as_str().to_string(),
                    tool_name: event.payload_str("tool_name").map(String::from),
                    at: event.enqueued_at,
                });
                txn.update_turn(&open)?;
            }

            if let Some(op) = event.file_operation() {
                apply_acceptance_signal(txn, key, op)?;
            }
        }

        EventType::SessionEnd => {
            if let Some(mut open) = txn.open_turn(key)? {
                open.completed_at = Some(event.enqueued_at);
                txn.update_turn(&open)?;
            }
        }

        // Unknown types pass through without conversation effect
        EventType::ContextCompact | EventType::Unknown(_) => {}
    }

    Ok(())
}

/// First accept/reject signal after a response settles the turn; later
/// signals are ignored.
fn apply_acceptance_signal(
    txn: &ConversationTxn<'_>,
    key: &str,
    op: FileOperation,
) -> Result<()> {
    let acceptance = match op {
        FileOperation::Accepted => Acceptance::Accepted,
        FileOperation::Rejected => Acceptance::Rejected,
        _ => return Ok(()),
    };

    if let Some(mut latest) = txn.latest_turn(key)? {
        if latest.response_event_id.is_some() && latest.accepted == Acceptance::Unknown {
            latest.accepted = acceptance;
            txn.update_turn(&latest)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use serde_json::json;
    use tracepipe_types::Platform;

    struct Harness {
        builder: ConversationBuilder,
        conversations: Arc<Mutex<ConversationStore>>,
        t: DateTime<Utc>,
        n: u32,
    }

    impl Harness {
        fn new() -> Self {
            let conversations = Arc::new(Mutex::new(ConversationStore::open_in_memory().unwrap()));
            let raw = Arc::new(Mutex::new(RawStore::open_in_memory().unwrap()));
            Self {
                builder: ConversationBuilder::new(conversations.clone(), raw),
                conversations,
                t: Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap(),
                n: 0,
            }
        }

        fn push(&mut self, event_type: EventType, payload: serde_json::Value) -> BuildOutcome {
            self.n += 1;
            self.t += Duration::seconds(1);
            let mut event = IngressEvent::new(
                format!("evt-{}", self.n),
                self.t,
                Platform::ClaudeCode,
                "s-1",
                event_type,
            );
            if let serde_json::Value::Object(map) = payload {
                event.payload = map;
            }
            let record = CdcRecord::for_committed_event(&event, 1, 0);
            self.builder.apply(&record)
        }

        fn replay(&self, record: &CdcRecord) -> BuildOutcome {
            self.builder.apply(record)
        }

        fn key(&self) -> String {
            session_key(&Platform::ClaudeCode, "s-1")
        }

        fn turns(&self) -> Vec<TurnRow> {
            self.conversations.lock().unwrap().turns(&self.key()).unwrap()
        }

        fn session(&self) -> SessionRow {
            self.conversations
                .lock()
                .unwrap()
                .session(&self.key())
                .unwrap()
                .unwrap()
        }
    }

    #[test]
    fn test_happy_path_builds_one_completed_turn() {
        let mut h = Harness::new();
        assert!(h.push(EventType::SessionStart, json!({})).is_success());
        h.push(EventType::UserPrompt, json!({"prompt_length": 12}));
        h.push(
            EventType::AssistantResponse,
            json!({"response_length": 45, "tokens_used": 30, "model": "m1", "duration_ms": 800}),
        );

        assert_eq!(h.session().status, SessionStatus::Open);
        let turns = h.turns();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].accepted, Acceptance::Unknown);
        assert!(turns[0].completed_at.is_some());
        assert!(turns[0].response_event_id.is_some());
    }

    #[test]
    fn test_event_before_session_start_creates_session() {
        let mut h = Harness::new();
        h.push(EventType::UserPrompt, json!({"prompt_length": 3}));
        assert_eq!(h.session().status, SessionStatus::Open);

        // Late SessionStart is absorbed
        let first_seen = h.session().first_seen_at;
        h.push(EventType::SessionStart, json!({}));
        assert_eq!(h.session().first_seen_at, first_seen);
        assert_eq!(h.turns().len(), 1);
    }

    #[test]
    fn test_back_to_back_prompts_force_close_prior_turn() {
        let mut h = Harness::new();
        h.push(EventType::UserPrompt, json!({"prompt_length": 1}));
        h.push(EventType::UserPrompt, json!({"prompt_length": 2}));

        let turns = h.turns();
        assert_eq!(turns.len(), 2);
        // First turn closed incomplete at the second prompt's time
        assert_eq!(turns[0].completed_at, Some(turns[1].started_at));
        assert!(turns[0].response_event_id.is_none());
        assert!(turns[1].completed_at.is_none());
    }

    #[test]
    fn test_tool_events_append_to_open_turn_in_order() {
        let mut h = Harness::new();
        h.push(EventType::UserPrompt, json!({"prompt_length": 1}));
        h.push(EventType::ToolPre, json!({"tool_name": "Edit", "input_size": 10}));
        h.push(
            EventType::ToolPost,
            json!({"tool_name": "Edit", "success": true, "duration_ms": 40, "output_size": 8}),
        );
        h.push(
            EventType::AssistantResponse,
            json!({"response_length": 5, "tokens_used": 9, "model": "m1", "duration_ms": 100}),
        );

        let turns = h.turns();
        assert_eq!(turns[0].tool_uses.len(), 2);
        assert_eq!(turns[0].tool_uses[0].event_type, "ToolPre");
        assert_eq!(turns[0].tool_uses[1].event_type, "ToolPost");
        assert!(turns[0].tool_uses[0].at <= turns[0].tool_uses[1].at);
    }

    #[test]
    fn test_rejected_file_edit_marks_turn() {
        let mut h = Harness::new();
        h.push(EventType::UserPrompt, json!({"prompt_length": 1}));
        h.push(
            EventType::AssistantResponse,
            json!({"response_length": 5, "tokens_used": 9, "model": "m1", "duration_ms": 100}),
        );
        h.push(
            EventType::FileEdit,
            json!({"file_extension": "rs", "lines_added": 4, "lines_removed": 0, "operation": "rejected"}),
        );

        assert_eq!(h.turns()[0].accepted, Acceptance::Rejected);

        // A later contradictory signal does not flip the settled turn
        h.push(
            EventType::FileEdit,
            json!({"file_extension": "rs", "lines_added": 4, "lines_removed": 0, "operation": "accepted"}),
        );
        assert_eq!(h.turns()[0].accepted, Acceptance::Rejected);
    }

    #[test]
    fn test_session_end_closes_session_and_open_turn() {
        let mut h = Harness::new();
        h.push(EventType::UserPrompt, json!({"prompt_length": 1}));
        h.push(EventType::SessionEnd, json!({"session_duration_ms": 9000}));

        assert_eq!(h.session().status, SessionStatus::Closed);
        let turns = h.turns();
        assert!(turns[0].completed_at.is_some());
        assert!(turns[0].response_event_id.is_none());
    }

    #[test]
    fn test_event_after_close_reopens_session() {
        let mut h = Harness::new();
        h.push(EventType::SessionStart, json!({}));
        h.push(EventType::SessionEnd, json!({"session_duration_ms": 100}));
        assert_eq!(h.session().status, SessionStatus::Closed);

        h.push(EventType::UserPrompt, json!({"prompt_length": 1}));
        assert_eq!(h.session().status, SessionStatus::Open);
        assert_eq!(h.turns().len(), 1);
    }

    #[test]
    fn test_replay_is_idempotent() {
        let mut h = Harness::new();
        h.n += 1;
        h.t += Duration::seconds(1);
        let mut event = IngressEvent::new(
            "evt-dup",
            h.t,
            Platform::ClaudeCode,
            "s-1",
            EventType::UserPrompt,
        );
        event.payload.insert("prompt_length".into(), json!(4));
        let record = CdcRecord::for_committed_event(&event, 1, 0);

        assert!(matches!(h.replay(&record), BuildOutcome::Applied));
        assert!(matches!(h.replay(&record), BuildOutcome::Skipped));
        assert_eq!(h.turns().len(), 1);
    }

    #[test]
    fn test_turn_started_at_is_non_decreasing() {
        let mut h = Harness::new();
        for i in 0..5 {
            h.push(EventType::UserPrompt, json!({"prompt_length": i}));
            if i % 2 == 0 {
                h.push(
                    EventType::AssistantResponse,
                    json!({"response_length": 1, "tokens_used": 1, "model": "m", "duration_ms": 10}),
                );
            }
        }
        let turns = h.turns();
        assert_eq!(turns.len(), 5);
        for pair in turns.windows(2) {
            assert!(pair[0].started_at <= pair[1].started_at);
        }
    }

    #[test]
    fn test_unknown_event_type_is_ignored_without_error() {
        let mut h = Harness::new();
        let outcome = h.push(EventType::from("FutureThing"), json!({"x": 1}));
        assert!(outcome.is_success());
        assert!(h.turns().is_empty());
        // Session row still tracked
        assert_eq!(h.session().status, SessionStatus::Open);
    }
}
