use std::sync::{Arc, Mutex};

use tracepipe_streams::{StreamDb, streams};
use tracepipe_types::DlqRecord;

use crate::Result;

/// Append a record to the dead-letter stream. The DLQ is unbounded;
/// operators drain it out-of-band.
pub(crate) fn push(streams_db: &Arc<Mutex<StreamDb>>, record: &DlqRecord) -> Result<i64> {
    let body = serde_json::to_string(record)?;
    let mut db = streams_db.lock().expect("stream db lock poisoned");
    Ok(db.append(streams::DLQ, &body, None)?)
}
