use chrono::{DateTime, SecondsFormat, Utc};

use crate::{Error, Result};

/// Fixed-width RFC 3339 with microseconds and a `Z` suffix, so stored
/// timestamps compare correctly as text.
pub(crate) fn to_text(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Corrupt(format!("bad timestamp '{}': {}", text, e)))
}
