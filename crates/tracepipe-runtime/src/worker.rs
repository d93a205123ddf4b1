use chrono::Utc;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tracepipe_engine::{BuildOutcome, Builder, RetryDecision, RetryPolicy};
use tracepipe_streams::{StreamDb, StreamEntry, streams};
use tracepipe_types::{CdcRecord, DlqRecord, Platform, Stage, session_key, truncate};

use crate::config::WorkerConfig;
use crate::counters::PipelineCounters;
use crate::custody::CustodyAccounting;
use crate::dlq;
use crate::shutdown::Shutdown;
use crate::Result;

/// CDC consumer group shared by the pool
pub const WORKER_GROUP: &str = "workers";

/// Per-worker channel depth; bounds dispatcher read-ahead
const SHARD_DEPTH: usize = 16;

// NOTE: Sharded pool topology
//
// One dispatcher owns the consumer-group read and routes each record to a
// worker by hash(session_key). Same session, same worker, FIFO channel:
// per-session enqueued_at order survives parallel processing. Concurrency
// stays bounded at N_WORKERS; a full shard channel backpressures the
// dispatcher, and everything the dispatcher read ahead but no worker
// acknowledged is reclaimed through the pending-entries list after a crash.

struct Dispatch {
    entry_seq: i64,
    record: CdcRecord,
}

struct PoolShared {
    streams: Arc<Mutex<StreamDb>>,
    builders: Vec<Box<dyn Builder>>,
    retry: RetryPolicy,
    counters: Arc<PipelineCounters>,
    custody: CustodyAccounting,
    config: WorkerConfig,
}

/// Bounded-concurrency consumers of the CDC stream.
///
/// Each record is dispatched to every registered builder in sequence and
/// acknowledged only after all builders succeed (or the record is
/// deadlettered as permanent).
pub struct WorkerPool {
    shared: PoolShared,
}

impl WorkerPool {
    pub fn new(
        streams: Arc<Mutex<StreamDb>>,
        builders: Vec<Box<dyn Builder>>,
        counters: Arc<PipelineCounters>,
        custody: CustodyAccounting,
        config: WorkerConfig,
    ) -> Self {
        let retry = RetryPolicy {
            max_attempts: config.r_max_builder,
            ..RetryPolicy::default()
        };
        Self {
            shared: PoolShared {
                streams,
                builders,
                retry,
                counters,
                custody,
                config,
            },
        }
    }

    /// Spawn the dispatcher and the fixed-size worker set
    pub fn spawn(self, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
        let n = self.shared.config.n_workers.max(1);
        let shared = Arc::new(self.shared);

        let mut senders = Vec::with_capacity(n);
        let mut handles = Vec::with_capacity(n + 1);

        for i in 0..n {
            let (tx, rx) = mpsc::channel::<Dispatch>(SHARD_DEPTH);
            senders.push(tx);
            let worker = Worker {
                pool: shared.clone(),
                name: format!("worker-{}", i),
            };
            handles.push(tokio::spawn(worker.run(rx, shutdown.clone())));
        }

        let dispatcher = Dispatcher {
            pool: shared,
            senders,
        };
        handles.push(tokio::spawn(dispatcher.run(shutdown.clone())));

        handles
    }
}

struct Dispatcher {
    pool: Arc<PoolShared>,
    senders: Vec<mpsc::Sender<Dispatch>>,
}

impl Dispatcher {
    async fn run(self, mut shutdown: Shutdown) {
        info!(workers = self.senders.len(), "worker pool starting");
        let mut last_claim: Option<Instant> = None;

        loop {
            if shutdown.is_cancelled() {
                info!("worker pool dispatcher stopping");
                // Dropping the senders lets workers drain and exit
                return;
            }

            let mut entries = Vec::new();
            if last_claim.is_none_or(|t| t.elapsed() >= self.pool.config.t_stuck()) {
                match self.claim_stuck() {
                    Ok(claimed) => entries = claimed,
                    Err(err) => warn!(error = %err, "cdc claim failed"),
                }
                last_claim = Some(Instant::now());
            }

            if entries.is_empty() {
                match self.read_batch() {
                    Ok(read) => entries = read,
                    Err(err) => {
                        warn!(error = %err, "cdc read failed");
                    }
                }
            }

            if entries.is_empty() {
                shutdown.idle(self.pool.config.t_poll()).await;
                continue;
            }

            for entry in entries {
                let record: CdcRecord = match entry.decode() {
                    Ok(record) => record,
                    Err(err) => {
                        // A CDC record this pipeline wrote but cannot read
                        // back is permanent by definition.
                        self.deadletter_undecodable(&entry, err.to_string());
                        self.ack(entry.seq);
                        continue;
                    }
                };

                let shard = shard_for(&record, self.senders.len());
                let dispatch = Dispatch {
                    entry_seq: entry.seq,
                    record,
                };
                if self.senders[shard].send(dispatch).await.is_err() {
                    // Worker gone (cancellation); the entry stays pending
                    return;
                }
            }
        }
    }

    fn read_batch(&self) -> Result<Vec<StreamEntry>> {
        let count = self.senders.len() * 2;
        let mut db = self.pool.streams.lock().expect("stream db lock poisoned");
        Ok(db.read_group(streams::CDC, WORKER_GROUP, "dispatcher", count)?)
    }

    fn claim_stuck(&self) -> Result<Vec<StreamEntry>> {
        let mut db = self.pool.streams.lock().expect("stream db lock poisoned");
        let claimed = db.claim_stuck(
            streams::CDC,
            WORKER_GROUP,
            "dispatcher",
            self.pool.config.t_stuck(),
            self.senders.len() * 2,
        )?;
        if !claimed.is_empty() {
            info!(count = claimed.len(), "claimed stuck cdc records");
        }
        Ok(claimed)
    }

    fn ack(&self, seq: i64) {
        ack_cdc(&self.pool, seq);
    }

    fn deadletter_undecodable(&self, entry: &StreamEntry, detail: String) {
        let dlq_record = DlqRecord {
            event_id: format!("undecodable-cdc-{}", entry.seq),
            platform: Platform::Other("unknown".to_string()),
            external_session_id: String::new(),
            payload: entry.body.clone(),
            stage: Stage::ConversationBuilder,
            error_kind: "decode".to_string(),
            error_detail: detail,
            deadlettered_at: Utc::now(),
        };
        if let Err(err) = dlq::push(&self.pool.streams, &dlq_record) {
            warn!(error = %err, "dlq append failed");
            return;
        }
        PipelineCounters::incr(&self.pool.counters.dlq_total, 1);
    }
}

/// Stable shard assignment by session identity
fn shard_for(record: &CdcRecord, shards: usize) -> usize {
    let key = session_key(&record.platform, &record.external_session_id);
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

struct Worker {
    pool: Arc<PoolShared>,
    name: String,
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<Dispatch>, mut shutdown: Shutdown) {
        while let Some(dispatch) = rx.recv().await {
            self.process(dispatch, &mut shutdown).await;
            // Finish the record in flight, then honor cancellation; anything
            // still buffered is reclaimed via pending-entry recovery
            if shutdown.is_cancelled() {
                break;
            }
        }
        info!(worker = %self.name, "worker stopping");
    }

    async fn process(&self, dispatch: Dispatch, shutdown: &mut Shutdown) {
        let record = dispatch.record;

        'builders: for builder in &self.pool.builders {
            let mut attempt = 1u32;
            loop {
                let outcome = builder.apply(&record);
                match self.pool.retry.decide(&outcome, attempt) {
                    RetryDecision::Done => {
                        if let Err(err) = self.pool.custody.derived_applied(
                            builder.id(),
                            &record.event_id,
                            record.enqueued_at,
                        ) {
                            warn!(error = %err, "custody accounting failed");
                        }
                        break;
                    }
                    RetryDecision::RetryAfter(delay) => {
                        PipelineCounters::incr(&self.pool.counters.records_retried, 1);
                        debug!(
                            event_id = %record.event_id,
                            builder = builder.id(),
                            attempt,
                            "transient builder failure, backing off"
                        );
                        // Cancellation mid-retry leaves the record pending;
                        // recovery redelivers it after restart.
                        if shutdown.idle(delay).await {
                            return;
                        }
                        attempt += 1;
                    }
                    RetryDecision::Deadletter => {
                        self.deadletter(&record, builder.id(), &outcome);
                        break 'builders;
                    }
                }
            }
        }

        ack_cdc(&self.pool, dispatch.entry_seq);
        PipelineCounters::incr(&self.pool.counters.records_processed, 1);
    }

    fn deadletter(&self, record: &CdcRecord, builder_id: &str, outcome: &BuildOutcome) {
        let (error_kind, error_detail) = match outcome {
            BuildOutcome::Transient(err) | BuildOutcome::Permanent(err) => {
                (err.kind().to_string(), truncate(&err.to_string(), 500))
            }
            _ => ("unknown".to_string(), String::new()),
        };

        let stage = stage_for(builder_id);
        let dlq_record = DlqRecord {
            event_id: record.event_id.clone(),
            platform: record.platform.clone(),
            external_session_id: record.external_session_id.clone(),
            payload: serde_json::to_string(record).unwrap_or_default(),
            stage,
            error_kind,
            error_detail,
            deadlettered_at: Utc::now(),
        };

        if let Err(err) = dlq::push(&self.pool.streams, &dlq_record) {
            warn!(error = %err, "dlq append failed");
            return;
        }
        PipelineCounters::incr(&self.pool.counters.dlq_total, 1);
        if let Err(err) =
            self.pool
                .custody
                .deadlettered(stage, &record.event_id, record.enqueued_at)
        {
            warn!(error = %err, "custody accounting failed");
        }
        warn!(
            event_id = %record.event_id,
            builder = builder_id,
            "record deadlettered from worker pool"
        );
    }
}

fn ack_cdc(pool: &PoolShared, seq: i64) {
    let db = pool.streams.lock().expect("stream db lock poisoned");
    if let Err(err) = db.ack(streams::CDC, WORKER_GROUP, &[seq]) {
        PipelineCounters::incr(&pool.counters.ack_failed, 1);
        warn!(error = %err, "cdc ack failed; record will be redelivered");
    }
}

fn stage_for(builder_id: &str) -> Stage {
    match builder_id {
        "metrics" => Stage::MetricsAggregator,
        _ => Stage::ConversationBuilder,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tracepipe_types::{EventType, IngressEvent};

    fn record_for(session: &str) -> CdcRecord {
        let event = IngressEvent::new(
            "e1",
            Utc::now(),
            Platform::ClaudeCode,
            session,
            EventType::UserPrompt,
        );
        CdcRecord::for_committed_event(&event, 1, 0)
    }

    #[test]
    fn test_shard_assignment_is_stable_per_session() {
        let a1 = shard_for(&record_for("s-1"), 4);
        let a2 = shard_for(&record_for("s-1"), 4);
        assert_eq!(a1, a2);
        assert!(a1 < 4);
    }

    #[test]
    fn test_sessions_spread_across_shards() {
        let shards: std::collections::HashSet<usize> = (0..64)
            .map(|i| shard_for(&record_for(&format!("s-{}", i)), 4))
            .collect();
        assert!(shards.len() > 1);
    }

    #[test]
    fn test_stage_mapping() {
        assert_eq!(stage_for("metrics"), Stage::MetricsAggregator);
        assert_eq!(stage_for("conversation"), Stage::ConversationBuilder);
    }
}
