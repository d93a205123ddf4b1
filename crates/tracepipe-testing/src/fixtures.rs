use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};
use uuid::Uuid;

use tracepipe_types::{EventType, IngressEvent, Platform};

/// Declarative builder for ingress events of one session.
///
/// The clock starts at "now" (so sliding-window accounting sees the
/// events) and each emitted event advances it by one second, so
/// per-session `enqueued_at` ordering holds by construction.
pub struct EventFixture {
    platform: Platform,
    session: String,
    t: DateTime<Utc>,
    seq: u32,
}

impl EventFixture {
    pub fn new(session: &str) -> Self {
        Self {
            platform: Platform::ClaudeCode,
            session: session.to_string(),
            t: Utc::now(),
            seq: 0,
        }
    }

    pub fn on_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn starting_at(mut self, t: DateTime<Utc>) -> Self {
        self.t = t;
        self
    }

    fn next(&mut self, event_type: EventType, payload: Value) -> IngressEvent {
        self.seq += 1;
        self.t += Duration::seconds(1);
        let mut event = IngressEvent::new(
            format!("{}-{}", Uuid::new_v4(), self.seq),
            self.t,
            self.platform.clone(),
            self.session.clone(),
            event_type,
        );
        if let Value::Object(map) = payload {
            event.payload = map;
        }
        event
    }

    pub fn session_start(&mut self) -> IngressEvent {
        self.next(EventType::SessionStart, json!({}))
    }

    pub fn session_end(&mut self, duration_ms: u64) -> IngressEvent {
        self.next(
            EventType::SessionEnd,
            json!({"session_duration_ms": duration_ms}),
        )
    }

    pub fn user_prompt(&mut self, prompt_length: u64) -> IngressEvent {
        self.next(EventType::UserPrompt, json!({"prompt_length": prompt_length}))
    }

    pub fn assistant_response(&mut self, tokens_used: u64, duration_ms: u64) -> IngressEvent {
        self.next(
            EventType::AssistantResponse,
            json!({
                "response_length": 45,
                "tokens_used": tokens_used,
                "model": "m1",
                "duration_ms": duration_ms,
            }),
        )
    }

    pub fn tool_pre(&mut self, tool_name: &str, input_size: u64) -> IngressEvent {
        self.next(
            EventType::ToolPre,
            json!({"tool_name": tool_name, "input_size": input_size}),
        )
    }

    pub fn tool_post(&mut self, tool_name: &str, success: bool, duration_ms: u64) -> IngressEvent {
        self.next(
            EventType::ToolPost,
            json!({
                "tool_name": tool_name,
                "success": success,
                "duration_ms": duration_ms,
                "output_size": 64,
            }),
        )
    }

    pub fn file_edit(&mut self, operation: &str) -> IngressEvent {
        self.next(
            EventType::FileEdit,
            json!({
                "file_extension": "rs",
                "lines_added": 3,
                "lines_removed": 1,
                "operation": operation,
            }),
        )
    }

    pub fn shell_post(&mut self, exit_code: i64, duration_ms: u64) -> IngressEvent {
        self.next(
            EventType::ShellPost,
            json!({
                "exit_code": exit_code,
                "duration_ms": duration_ms,
                "output_lines": 10,
            }),
        )
    }

    pub fn context_compact(&mut self, tokens_before: u64, tokens_after: u64) -> IngressEvent {
        self.next(
            EventType::ContextCompact,
            json!({"tokens_before": tokens_before, "tokens_after": tokens_after}),
        )
    }

    /// An event that fails schema validation (missing `prompt_length`)
    pub fn poison(&mut self) -> IngressEvent {
        self.next(EventType::UserPrompt, json!({"note": "no prompt_length"}))
    }

    /// Session key of this fixture's session
    pub fn session_key(&self) -> String {
        tracepipe_types::session_key(&self.platform, &self.session)
    }

    /// Producer-side session id (the `external_session_id` label value)
    pub fn session_id(&self) -> &str {
        &self.session
    }
}
