use std::sync::{Arc, Mutex};

use tracepipe_store::RawStore;
use tracepipe_types::{CdcRecord, IngressEvent, PayloadRef};

use crate::{Error, Result};

/// Materialize the event a CDC record describes.
///
/// Inline payloads are used as-is; stored references are resolved against
/// the raw store. A reference to a batch that is not readable yet is a
/// referential error, which the outcome classification treats as transient.
pub(crate) fn resolve_event(
    record: &CdcRecord,
    raw: &Arc<Mutex<RawStore>>,
) -> Result<IngressEvent> {
    let payload = match &record.payload_ref {
        PayloadRef::Inline { payload } => payload.clone(),
        PayloadRef::Stored { batch_id, index } => {
            let store = raw.lock().expect("raw store lock poisoned");
            let events = store.try_read(*batch_id)?.ok_or_else(|| {
                Error::Referential(format!(
                    "cdc record {} references unreadable batch {}",
                    record.event_id, batch_id
                ))
            })?;
            events
                .get(*index)
                .ok_or_else(|| {
                    Error::Referential(format!(
                        "cdc record {} references index {} beyond batch {} ({} events)",
                        record.event_id,
                        index,
                        batch_id,
                        events.len()
                    ))
                })?
                .payload
                .clone()
        }
    };

    Ok(IngressEvent {
        event_id: record.event_id.clone(),
        enqueued_at: record.enqueued_at,
        platform: record.platform.clone(),
        external_session_id: record.external_session_id.clone(),
        event_type: record.event_type.clone(),
        payload,
        retry_count: 0,
    })
}
