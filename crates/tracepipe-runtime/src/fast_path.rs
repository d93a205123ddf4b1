use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};

use tracepipe_store::RawStore;
use tracepipe_streams::{StreamDb, StreamEntry, streams};
use tracepipe_types::{
    CdcRecord, DlqRecord, IngressEvent, Platform, Stage, truncate, validate_payload,
};

/// Bound on DLQ error detail text
const ERROR_DETAIL_MAX: usize = 500;

use crate::config::{FastPathConfig, StreamConfig};
use crate::counters::PipelineCounters;
use crate::custody::CustodyAccounting;
use crate::dlq;
use crate::shed::ShedState;
use crate::shutdown::Shutdown;
use crate::{Error, Result};

/// Ingress consumer group shared by fast-path instances
pub const FAST_PATH_GROUP: &str = "fast-path";

// NOTE: Commit protocol
//
// 1. Persist: one raw-store transaction per batch. Failure leaves every
//    entry pending; redelivery retries the batch in full.
// 2. Publish CDC: fire-and-forget per event. A publish failure is recorded
//    in the raw store's fallback log and repaired by the sweeper; it never
//    blocks acknowledgement, because raw durability is the custody anchor
//    and CDC is a derivable projection.
// 3. Acknowledge: ack failure is tolerated; the batch is re-read and the
//    idempotent builders absorb the recomputation.
//
// The only path that drops an ingress entry without persisting it is the
// poison route: an entry that keeps failing decode/validation until its
// delivery count exhausts R_MAX is deadlettered and acked.

/// Drains the ingress stream: batch, compress, persist, emit CDC, ack.
pub struct FastPath {
    streams: Arc<Mutex<StreamDb>>,
    raw: Arc<Mutex<RawStore>>,
    counters: Arc<PipelineCounters>,
    custody: CustodyAccounting,
    shed: Arc<ShedState>,
    config: FastPathConfig,
    stream_config: StreamConfig,
    consumer: String,
    last_batch_id: i64,
}

impl FastPath {
    pub fn new(
        streams: Arc<Mutex<StreamDb>>,
        raw: Arc<Mutex<RawStore>>,
        counters: Arc<PipelineCounters>,
        custody: CustodyAccounting,
        shed: Arc<ShedState>,
        config: FastPathConfig,
        stream_config: StreamConfig,
    ) -> Self {
        let consumer = format!("fast-{}", std::process::id());
        Self {
            streams,
            raw,
            counters,
            custody,
            shed,
            config,
            stream_config,
            consumer,
            last_batch_id: 0,
        }
    }

    /// Long-running consumer task. Terminates on cancellation or on an
    /// invariant violation; everything else is swallowed and retried.
    pub async fn run(mut self, mut shutdown: Shutdown) -> Result<()> {
        info!(consumer = %self.consumer, "fast path starting");
        let mut last_claim: Option<Instant> = None;

        loop {
            if shutdown.is_cancelled() {
                info!("fast path stopping");
                return Ok(());
            }

            // Pending-entry recovery: at startup and every T_STUCK, adopt
            // entries stuck with dead or slow consumers in the group.
            let mut entries = Vec::new();
            if last_claim.is_none_or(|t| t.elapsed() >= self.config.t_stuck()) {
                entries = self.claim_stuck()?;
                last_claim = Some(Instant::now());
            }

            let b_max = self.shed.effective_b_max(self.config.b_max);
            let t_batch = self.shed.effective_t_batch(self.config.t_batch());

            if entries.is_empty() {
                entries = self.read(b_max)?;
            }
            if entries.is_empty() {
                shutdown.idle(self.config.t_poll()).await;
                continue;
            }

            // Batch accumulation: close on B_MAX, T_BATCH elapsed since the
            // first event, or cancellation.
            let deadline = Instant::now() + t_batch;
            while entries.len() < b_max && Instant::now() < deadline && !shutdown.is_cancelled() {
                let more = self.read(b_max - entries.len())?;
                if more.is_empty() {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if shutdown.idle(remaining.min(self.config.t_poll())).await {
                        break;
                    }
                } else {
                    entries.extend(more);
                }
            }

            self.commit(entries)?;

            if let Some(pause) = self.shed.pause(self.config.t_pause()) {
                shutdown.idle(pause).await;
            }
        }
    }

    fn read(&self, count: usize) -> Result<Vec<StreamEntry>> {
        let mut db = self.streams.lock().expect("stream db lock poisoned");
        Ok(db.read_group(streams::INGRESS, FAST_PATH_GROUP, &self.consumer, count)?)
    }

    fn claim_stuck(&self) -> Result<Vec<StreamEntry>> {
        let mut db = self.streams.lock().expect("stream db lock poisoned");
        let claimed = db.claim_stuck(
            streams::INGRESS,
            FAST_PATH_GROUP,
            &self.consumer,
            self.config.t_stuck(),
            self.config.b_max,
        )?;
        if !claimed.is_empty() {
            info!(count = claimed.len(), "claimed stuck ingress entries");
        }
        Ok(claimed)
    }

    /// Execute the commit protocol for one closed batch. Only invariant
    /// violations propagate out.
    pub(crate) fn commit(&mut self, entries: Vec<StreamEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        PipelineCounters::incr(&self.counters.events_read, entries.len() as u64);

        let mut events: Vec<(i64, IngressEvent)> = Vec::new();
        for entry in entries {
            match entry.decode::<IngressEvent>() {
                Ok(event) => {
                    if let Err(err) = self
                        .custody
                        .ingress_enqueued(&event.event_id, event.enqueued_at)
                    {
                        warn!(error = %err, "custody accounting failed");
                    }
                    match validate_payload(&event) {
                        Ok(()) => events.push((entry.seq, event)),
                        Err(err) => self.poison(&entry, Some(event), "schema", err.to_string())?,
                    }
                }
                Err(err) => self.poison(&entry, None, "decode", err.to_string())?,
            }
        }

        if events.is_empty() {
            return Ok(());
        }

        // Step 1 - persist
        let batch: Vec<IngressEvent> = events.iter().map(|(_, e)| e.clone()).collect();
        let batch_id = {
            let mut raw = self.raw.lock().expect("raw store lock poisoned");
            match raw.append(&batch) {
                Ok(id) => id,
                Err(err) => {
                    PipelineCounters::incr(&self.counters.batches_failed, 1);
                    warn!(error = %err, "batch persist failed; entries stay pending");
                    return Ok(());
                }
            }
        };

        if batch_id <= self.last_batch_id {
            PipelineCounters::incr(&self.counters.invariant_violations, 1);
            return Err(Error::Invariant(format!(
                "batch id went backward: {} after {}",
                batch_id, self.last_batch_id
            )));
        }
        self.last_batch_id = batch_id;

        PipelineCounters::incr(&self.counters.batches_committed, 1);
        for (_, event) in &events {
            if let Err(err) = self.custody.raw_persisted(&event.event_id, event.enqueued_at) {
                warn!(error = %err, "custody accounting failed");
            }
        }
        debug!(batch_id, events = events.len(), "batch committed");

        // Step 2 - publish CDC
        self.publish_cdc(batch_id, &events);

        // Step 3 - acknowledge
        let seqs: Vec<i64> = events.iter().map(|(seq, _)| *seq).collect();
        let db = self.streams.lock().expect("stream db lock poisoned");
        if let Err(err) = db.ack(streams::INGRESS, FAST_PATH_GROUP, &seqs) {
            PipelineCounters::incr(&self.counters.ack_failed, 1);
            warn!(error = %err, "ingress ack failed; batch will be redelivered");
        }

        Ok(())
    }

    fn publish_cdc(&self, batch_id: i64, events: &[(i64, IngressEvent)]) {
        let mut published = 0usize;
        {
            let mut db = self.streams.lock().expect("stream db lock poisoned");
            for (index, (_, event)) in events.iter().enumerate() {
                let record = CdcRecord::for_committed_event(event, batch_id, index);
                let appended = serde_json::to_string(&record)
                    .map_err(Error::from)
                    .and_then(|body| {
                        db.append(streams::CDC, &body, Some(self.stream_config.cdc_maxlen))
                            .map_err(Error::from)
                    });
                match appended {
                    Ok(_) => published += 1,
                    Err(err) => {
                        warn!(batch_id, error = %err, "cdc publish failed; falling back to sweep log");
                        break;
                    }
                }
            }
        }

        PipelineCounters::incr(&self.counters.cdc_published, published as u64);
        for (_, event) in events.iter().take(published) {
            if let Err(err) = self.custody.cdc_published(&event.event_id, event.enqueued_at) {
                warn!(error = %err, "custody accounting failed");
            }
        }

        if published < events.len() {
            let raw = self.raw.lock().expect("raw store lock poisoned");
            if let Err(err) = raw.record_cdc_unpublished(batch_id) {
                // Fallback to the fallback failed; pending-entry redelivery
                // of the unacked batch is the remaining safety net.
                warn!(batch_id, error = %err, "could not record cdc fallback");
            }
        }
    }

    /// Poison handling: after R_MAX deliveries the entry is deadlettered
    /// and acked so the group makes progress.
    fn poison(
        &self,
        entry: &StreamEntry,
        event: Option<IngressEvent>,
        kind: &str,
        detail: String,
    ) -> Result<()> {
        if entry.delivery_count < self.config.r_max {
            debug!(
                seq = entry.seq,
                attempt = entry.delivery_count,
                kind,
                "poison candidate left pending for retry"
            );
            return Ok(());
        }

        let deadlettered_at = Utc::now();
        let error_detail = truncate(&detail, ERROR_DETAIL_MAX);
        let record = match &event {
            Some(e) => DlqRecord {
                event_id: e.event_id.clone(),
                platform: e.platform.clone(),
                external_session_id: e.external_session_id.clone(),
                payload: serde_json::to_string(&e.payload)?,
                stage: Stage::FastPath,
                error_kind: kind.to_string(),
                error_detail,
                deadlettered_at,
            },
            None => DlqRecord {
                event_id: format!("undecodable-{}", entry.seq),
                platform: Platform::Other("unknown".to_string()),
                external_session_id: String::new(),
                payload: entry.body.clone(),
                stage: Stage::FastPath,
                error_kind: kind.to_string(),
                error_detail,
                deadlettered_at,
            },
        };

        dlq::push(&self.streams, &record)?;
        PipelineCounters::incr(&self.counters.dlq_total, 1);

        let observed_at = event.as_ref().map(|e| e.enqueued_at).unwrap_or(deadlettered_at);
        if let Err(err) = self
            .custody
            .deadlettered(Stage::FastPath, &record.event_id, observed_at)
        {
            warn!(error = %err, "custody accounting failed");
        }

        let db = self.streams.lock().expect("stream db lock poisoned");
        if let Err(err) = db.ack(streams::INGRESS, FAST_PATH_GROUP, &[entry.seq]) {
            PipelineCounters::incr(&self.counters.ack_failed, 1);
            warn!(error = %err, "poison ack failed");
        }
        warn!(event_id = %record.event_id, kind, "event deadlettered from fast path");

        Ok(())
    }
}
