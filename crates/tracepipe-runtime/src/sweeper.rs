use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

use tracepipe_store::RawStore;
use tracepipe_streams::{StreamDb, streams};
use tracepipe_types::CdcRecord;

use crate::counters::PipelineCounters;
use crate::custody::CustodyAccounting;
use crate::shutdown::Shutdown;
use crate::Result;

/// Repairs CDC publish failures: batches logged in `cdc_unpublished` are
/// re-read from the raw store and their records re-appended.
///
/// Re-publication can duplicate records that made it out before the
/// original failure; the idempotent builders make that harmless.
pub struct CdcSweeper {
    raw: Arc<Mutex<RawStore>>,
    streams: Arc<Mutex<StreamDb>>,
    counters: Arc<PipelineCounters>,
    custody: CustodyAccounting,
    cdc_maxlen: u64,
    interval: Duration,
}

impl CdcSweeper {
    pub fn new(
        raw: Arc<Mutex<RawStore>>,
        streams: Arc<Mutex<StreamDb>>,
        counters: Arc<PipelineCounters>,
        custody: CustodyAccounting,
        cdc_maxlen: u64,
        interval: Duration,
    ) -> Self {
        Self {
            raw,
            streams,
            counters,
            custody,
            cdc_maxlen,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: Shutdown) {
        loop {
            if shutdown.idle(self.interval).await {
                return;
            }
            match self.sweep() {
                Ok(0) => {}
                Ok(republished) => info!(republished, "re-published missing cdc records"),
                Err(err) => warn!(error = %err, "cdc sweep failed"),
            }
        }
    }

    /// One sweep pass; exposed for tests
    pub fn sweep(&self) -> Result<usize> {
        let batch_ids = {
            let raw = self.raw.lock().expect("raw store lock poisoned");
            raw.cdc_unpublished(16)?
        };

        let mut republished = 0;
        for batch_id in batch_ids {
            let events = {
                let raw = self.raw.lock().expect("raw store lock poisoned");
                raw.read(batch_id)?
            };

            {
                let mut db = self.streams.lock().expect("stream db lock poisoned");
                for (index, event) in events.iter().enumerate() {
                    let record = CdcRecord::for_committed_event(event, batch_id, index);
                    let body = serde_json::to_string(&record)?;
                    db.append(streams::CDC, &body, Some(self.cdc_maxlen))?;
                    republished += 1;
                }
            }

            PipelineCounters::incr(&self.counters.cdc_published, events.len() as u64);
            for event in &events {
                if let Err(err) = self.custody.cdc_published(&event.event_id, event.enqueued_at) {
                    warn!(error = %err, "custody accounting failed");
                }
            }

            let raw = self.raw.lock().expect("raw store lock poisoned");
            raw.clear_cdc_unpublished(batch_id)?;
        }

        Ok(republished)
    }
}
