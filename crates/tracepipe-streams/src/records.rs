use serde::de::DeserializeOwned;

use crate::Result;

/// One delivered stream entry.
///
/// `delivery_count` counts deliveries to the consumer group, including
/// claims from dead consumers; it is the retry budget for poison handling.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub seq: i64,
    pub delivery_count: u32,
    pub body: String,
}

impl StreamEntry {
    /// Decode the entry body into a typed record
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }
}
