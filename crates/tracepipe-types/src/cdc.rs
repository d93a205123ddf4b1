use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::event::{EventType, IngressEvent, Platform};

/// Serialized payloads at or under this size ride inline on the CDC record;
/// larger ones are carried as a `(batch_id, index)` reference into the raw
/// store. Typical capture-agent payloads are well under this.
pub const INLINE_PAYLOAD_MAX_BYTES: usize = 4096;

/// Payload carriage on a CDC record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PayloadRef {
    Inline { payload: Map<String, Value> },
    Stored { batch_id: i64, index: usize },
}

/// Per-event notification published after a successful batch commit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdcRecord {
    /// Assigned by the CDC stream on append; 0 until appended
    #[serde(default)]
    pub cdc_id: i64,

    pub event_id: String,
    pub enqueued_at: DateTime<Utc>,
    pub platform: Platform,
    pub external_session_id: String,
    pub event_type: EventType,

    /// Raw-store batch this event was committed in
    pub batch_id: i64,

    pub payload_ref: PayloadRef,
}

impl CdcRecord {
    /// Build the CDC record for an event committed at `(batch_id, index)`.
    ///
    /// The inline/by-reference decision is made here, once, at publish time.
    pub fn for_committed_event(event: &IngressEvent, batch_id: i64, index: usize) -> Self {
        let serialized_len = serde_json::to_vec(&event.payload)
            .map(|b| b.len())
            .unwrap_or(usize::MAX);

        let payload_ref = if serialized_len <= INLINE_PAYLOAD_MAX_BYTES {
            PayloadRef::Inline {
                payload: event.payload.clone(),
            }
        } else {
            PayloadRef::Stored { batch_id, index }
        };

        Self {
            cdc_id: 0,
            event_id: event.event_id.clone(),
            enqueued_at: event.enqueued_at,
            platform: event.platform.clone(),
            external_session_id: event.external_session_id.clone(),
            event_type: event.event_type.clone(),
            batch_id,
            payload_ref,
        }
    }

    /// Inline payload, if carried on the record itself
    pub fn inline_payload(&self) -> Option<&Map<String, Value>> {
        match &self.payload_ref {
            PayloadRef::Inline { payload } => Some(payload),
            PayloadRef::Stored { .. } => None,
        }
    }
}
