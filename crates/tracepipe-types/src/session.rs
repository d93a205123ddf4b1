use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::event::Platform;

/// Session lifecycle status
///
/// A session closes on the first `SessionEnd`; any later event for the same
/// key reopens it (silently reconnecting agents are expected).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Open,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Open => "open",
            SessionStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(SessionStatus::Open),
            "closed" => Some(SessionStatus::Closed),
            _ => None,
        }
    }
}

/// Whether a turn's suggestion was taken, derived from post-response signals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Acceptance {
    Unknown,
    Accepted,
    Rejected,
}

impl Acceptance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Acceptance::Unknown => "unknown",
            Acceptance::Accepted => "accepted",
            Acceptance::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unknown" => Some(Acceptance::Unknown),
            "accepted" => Some(Acceptance::Accepted),
            "rejected" => Some(Acceptance::Rejected),
            _ => None,
        }
    }
}

/// Stable session key for `(platform, external_session_id)`.
///
/// Hash-based so the derived stores group events before (and regardless of)
/// any producer-side identifier scheme.
pub fn session_key(platform: &Platform, external_session_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(platform.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(external_session_id.as_bytes());
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}
