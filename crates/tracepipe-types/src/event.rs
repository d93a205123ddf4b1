use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

// NOTE: Schema Design Goals
//
// 1. Open payloads: capture agents evolve faster than the pipeline. Payloads
//    stay an opaque key/value map; typed accessors live at the points that
//    consume specific fields (builders, validation).
// 2. Open event set: unknown event types are carried through raw storage and
//    CDC untouched so newer agents keep working against an older pipeline.
// 3. Validation is presence + JSON type only, and only for the keys the
//    derived layer actually reads.

/// Originating tool family of an event (enumerated but extensible)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Platform {
    ClaudeCode,
    Cursor,
    Copilot,
    ShellHook,
    Other(String),
}

impl Platform {
    pub fn as_str(&self) -> &str {
        match self {
            Platform::ClaudeCode => "claude_code",
            Platform::Cursor => "cursor",
            Platform::Copilot => "copilot",
            Platform::ShellHook => "shell_hook",
            Platform::Other(s) => s.as_str(),
        }
    }
}

impl From<&str> for Platform {
    fn from(s: &str) -> Self {
        match s {
            "claude_code" => Platform::ClaudeCode,
            "cursor" => Platform::Cursor,
            "copilot" => Platform::Copilot,
            "shell_hook" => Platform::ShellHook,
            other => Platform::Other(other.to_string()),
        }
    }
}

impl Serialize for Platform {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Platform {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Platform::from(s.as_str()))
    }
}

/// Type of telemetry event
///
/// Wire names match what capture agents emit (`SessionStart`, `ToolPost`, ...).
/// Types this pipeline does not know are preserved as `Unknown` and flow
/// through storage and CDC without erroring.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    SessionStart,
    SessionEnd,
    UserPrompt,
    AssistantResponse,
    ToolPre,
    ToolPost,
    FileEdit,
    ShellPre,
    ShellPost,
    ContextCompact,
    Unknown(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::SessionStart => "SessionStart",
            EventType::SessionEnd => "SessionEnd",
            EventType::UserPrompt => "UserPrompt",
            EventType::AssistantResponse => "AssistantResponse",
            EventType::ToolPre => "ToolPre",
            EventType::ToolPost => "ToolPost",
            EventType::FileEdit => "FileEdit",
            EventType::ShellPre => "ShellPre",
            EventType::ShellPost => "ShellPost",
            EventType::ContextCompact => "ContextCompact",
            EventType::Unknown(s) => s.as_str(),
        }
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        match s {
            "SessionStart" => EventType::SessionStart,
            "SessionEnd" => EventType::SessionEnd,
            "UserPrompt" => EventType::UserPrompt,
            "AssistantResponse" => EventType::AssistantResponse,
            "ToolPre" => EventType::ToolPre,
            "ToolPost" => EventType::ToolPost,
            "FileEdit" => EventType::FileEdit,
            "ShellPre" => EventType::ShellPre,
            "ShellPost" => EventType::ShellPost,
            "ContextCompact" => EventType::ContextCompact,
            other => EventType::Unknown(other.to_string()),
        }
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(EventType::from(s.as_str()))
    }
}

/// File edit disposition carried in `FileEdit.operation`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    Created,
    Edited,
    Deleted,
    Accepted,
    Rejected,
}

impl FileOperation {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(FileOperation::Created),
            "edited" => Some(FileOperation::Edited),
            "deleted" => Some(FileOperation::Deleted),
            "accepted" => Some(FileOperation::Accepted),
            "rejected" => Some(FileOperation::Rejected),
            _ => None,
        }
    }
}

/// Telemetry event as produced by capture agents
/// Maps 1:1 to an ingress stream entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressEvent {
    /// Globally unique, producer-assigned
    pub event_id: String,

    /// Producer-assigned wall clock (RFC 3339, UTC)
    pub enqueued_at: DateTime<Utc>,

    pub platform: Platform,

    /// Opaque producer-assigned session identifier
    pub external_session_id: String,

    pub event_type: EventType,

    /// Opaque structured payload, validated only for the keys the
    /// derived layer reads
    #[serde(default)]
    pub payload: Map<String, Value>,

    #[serde(default)]
    pub retry_count: u32,
}

impl IngressEvent {
    pub fn new(
        event_id: impl Into<String>,
        enqueued_at: DateTime<Utc>,
        platform: Platform,
        external_session_id: impl Into<String>,
        event_type: EventType,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            enqueued_at,
            platform,
            external_session_id: external_session_id.into(),
            event_type,
            payload: Map::new(),
            retry_count: 0,
        }
    }

    /// Typed accessor: unsigned integer payload field
    pub fn payload_u64(&self, key: &str) -> Option<u64> {
        self.payload.get(key).and_then(Value::as_u64)
    }

    /// Typed accessor: signed integer payload field
    pub fn payload_i64(&self, key: &str) -> Option<i64> {
        self.payload.get(key).and_then(Value::as_i64)
    }

    /// Typed accessor: string payload field
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Typed accessor: boolean payload field
    pub fn payload_bool(&self, key: &str) -> Option<bool> {
        self.payload.get(key).and_then(Value::as_bool)
    }

    /// File edit disposition, when this is a well-formed `FileEdit`
    pub fn file_operation(&self) -> Option<FileOperation> {
        if self.event_type != EventType::FileEdit {
            return None;
        }
        self.payload_str("operation").and_then(FileOperation::parse)
    }
}

fn require_u64(event: &IngressEvent, key: &str) -> Result<()> {
    if event.payload_u64(key).is_some() {
        Ok(())
    } else {
        Err(schema_err(event, key, "unsigned integer"))
    }
}

fn require_i64(event: &IngressEvent, key: &str) -> Result<()> {
    if event.payload_i64(key).is_some() {
        Ok(())
    } else {
        Err(schema_err(event, key, "integer"))
    }
}

fn require_str(event: &IngressEvent, key: &str) -> Result<()> {
    if event.payload_str(key).is_some() {
        Ok(())
    } else {
        Err(schema_err(event, key, "string"))
    }
}

fn require_bool(event: &IngressEvent, key: &str) -> Result<()> {
    if event.payload_bool(key).is_some() {
        Ok(())
    } else {
        Err(schema_err(event, key, "boolean"))
    }
}

fn schema_err(event: &IngressEvent, key: &str, expected: &str) -> Error {
    Error::Schema {
        event_type: event.event_type.as_str().to_string(),
        detail: format!("missing or non-{} field '{}'", expected, key),
    }
}

/// Validate the payload keys required for this event type.
///
/// Unknown event types always pass; extra keys are never rejected.
pub fn validate_payload(event: &IngressEvent) -> Result<()> {
    match &event.event_type {
        EventType::SessionStart => Ok(()),
        EventType::SessionEnd => require_u64(event, "session_duration_ms"),
        EventType::UserPrompt => require_u64(event, "prompt_length"),
        EventType::AssistantResponse => {
            require_u64(event, "response_length")?;
            require_u64(event, "tokens_used")?;
            require_str(event, "model")?;
            require_u64(event, "duration_ms")
        }
        EventType::ToolPre => {
            require_str(event, "tool_name")?;
            require_u64(event, "input_size")
        }
        EventType::ToolPost => {
            require_str(event, "tool_name")?;
            require_bool(event, "success")?;
            require_u64(event, "duration_ms")?;
            require_u64(event, "output_size")
        }
        EventType::FileEdit => {
            require_str(event, "file_extension")?;
            require_u64(event, "lines_added")?;
            require_u64(event, "lines_removed")?;
            require_str(event, "operation")?;
            match event.file_operation() {
                Some(_) => Ok(()),
                None => Err(Error::Schema {
                    event_type: event.event_type.as_str().to_string(),
                    detail: format!(
                        "invalid operation '{}'",
                        event.payload_str("operation").unwrap_or_default()
                    ),
                }),
            }
        }
        EventType::ShellPre => require_u64(event, "command_length"),
        EventType::ShellPost => {
            require_i64(event, "exit_code")?;
            require_u64(event, "duration_ms")?;
            require_u64(event, "output_lines")
        }
        EventType::ContextCompact => {
            require_u64(event, "tokens_before")?;
            require_u64(event, "tokens_after")
        }
        EventType::Unknown(_) => Ok(()),
    }
}
