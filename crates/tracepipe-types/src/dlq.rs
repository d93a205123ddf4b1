use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::Platform;

/// Pipeline stage that gave up on an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    FastPath,
    ConversationBuilder,
    MetricsAggregator,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::FastPath => "fast_path",
            Stage::ConversationBuilder => "conversation_builder",
            Stage::MetricsAggregator => "metrics_aggregator",
        }
    }
}

/// Dead-letter record: an event dropped from its stream after exhausting
/// its retry budget. The DLQ is append-only and drained out-of-band.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqRecord {
    pub event_id: String,
    pub platform: Platform,
    pub external_session_id: String,

    /// Original payload, serialized as the producer sent it
    pub payload: String,

    pub stage: Stage,
    pub error_kind: String,
    pub error_detail: String,
    pub deadlettered_at: DateTime<Utc>,
}
