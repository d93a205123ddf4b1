use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use tracepipe_engine::{Builder, ConversationBuilder, MetricsAggregator};
use tracepipe_store::{ConversationStore, MetricsStore, RawStore};
use tracepipe_streams::{StreamDb, streams};
use tracepipe_types::IngressEvent;

use crate::config::PipelineConfig;
use crate::counters::{CountersSnapshot, PipelineCounters};
use crate::custody::{CustodyAccounting, HealthReport};
use crate::fast_path::FastPath;
use crate::shed::{BackpressureMonitor, ShedState};
use crate::shutdown::Shutdown;
use crate::sweeper::CdcSweeper;
use crate::worker::WorkerPool;
use crate::Result;

// NOTE: Dependency graph
//
// Every component is an explicit value built here and shared by reference;
// there is no process-wide mutable state. The stream database and the
// three stores are the only shared handles, each behind its own mutex.

/// The assembled pipeline: stores, streams, counters, and the task set
/// that moves events from ingress to derived state.
pub struct Pipeline {
    config: PipelineConfig,
    streams: Arc<Mutex<StreamDb>>,
    raw: Arc<Mutex<RawStore>>,
    conversations: Arc<Mutex<ConversationStore>>,
    metrics: Arc<Mutex<MetricsStore>>,
    counters: Arc<PipelineCounters>,
    shed: Arc<ShedState>,
    custody: CustodyAccounting,
}

impl Pipeline {
    /// Open (or create) all pipeline state under the configured data dir
    pub fn open(config: PipelineConfig) -> Result<Self> {
        let data_dir = config.data_dir()?;
        std::fs::create_dir_all(&data_dir)?;
        Self::open_at(config, &data_dir)
    }

    pub fn open_at(config: PipelineConfig, data_dir: &Path) -> Result<Self> {
        let streams = Arc::new(Mutex::new(StreamDb::open(&data_dir.join("streams.db"))?));
        let raw = Arc::new(Mutex::new(RawStore::open(&data_dir.join("raw.db"))?));
        let conversations = Arc::new(Mutex::new(ConversationStore::open(
            &data_dir.join("conversations.db"),
        )?));
        let metrics = Arc::new(Mutex::new(MetricsStore::open(&data_dir.join("metrics.db"))?));

        let custody = CustodyAccounting::new(metrics.clone());

        info!(data_dir = %data_dir.display(), "pipeline opened");
        Ok(Self {
            config,
            streams,
            raw,
            conversations,
            metrics,
            counters: Arc::new(PipelineCounters::default()),
            shed: Arc::new(ShedState::default()),
            custody,
        })
    }

    /// Producer edge: append one event to the ingress stream.
    ///
    /// Capture agents go through this; it never blocks on downstream state.
    pub fn publish(&self, event: &IngressEvent) -> Result<i64> {
        let body = serde_json::to_string(event)?;
        let mut db = self.streams.lock().expect("stream db lock poisoned");
        Ok(db.append(
            streams::INGRESS,
            &body,
            Some(self.config.streams.ingress_maxlen),
        )?)
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.counters.snapshot()
    }

    pub fn custody(&self) -> CustodyAccounting {
        self.custody.clone()
    }

    /// Sliding-hour chain-of-custody health
    pub fn health(&self) -> Result<HealthReport> {
        self.custody.health(Duration::from_secs(3600))
    }

    pub fn streams(&self) -> Arc<Mutex<StreamDb>> {
        self.streams.clone()
    }

    pub fn raw(&self) -> Arc<Mutex<RawStore>> {
        self.raw.clone()
    }

    pub fn conversations(&self) -> Arc<Mutex<ConversationStore>> {
        self.conversations.clone()
    }

    pub fn metrics(&self) -> Arc<Mutex<MetricsStore>> {
        self.metrics.clone()
    }

    pub fn shed(&self) -> Arc<ShedState> {
        self.shed.clone()
    }

    /// Spawn every pipeline task and run until cancellation, then join
    /// within the shutdown budget. Exceeding the budget is logged and
    /// tolerated; pending-entry recovery picks up the remainder on restart.
    pub async fn run(&self, shutdown: Shutdown) -> Result<()> {
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        let fast_path = FastPath::new(
            self.streams.clone(),
            self.raw.clone(),
            self.counters.clone(),
            self.custody.clone(),
            self.shed.clone(),
            self.config.fast_path.clone(),
            self.config.streams.clone(),
        );
        tasks.push(tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                if let Err(err) = fast_path.run(shutdown).await {
                    error!(error = %err, "fast path terminated");
                }
            }
        }));

        let builders: Vec<Box<dyn Builder>> = vec![
            Box::new(ConversationBuilder::new(
                self.conversations.clone(),
                self.raw.clone(),
            )),
            Box::new(MetricsAggregator::new(
                self.metrics.clone(),
                self.raw.clone(),
            )),
        ];
        let pool = WorkerPool::new(
            self.streams.clone(),
            builders,
            self.counters.clone(),
            self.custody.clone(),
            self.config.workers.clone(),
        );
        tasks.extend(pool.spawn(&shutdown));

        let monitor = BackpressureMonitor::new(
            self.streams.clone(),
            self.shed.clone(),
            self.config.backpressure.clone(),
        );
        tasks.push(tokio::spawn(monitor.run(shutdown.clone())));

        let sweeper = CdcSweeper::new(
            self.raw.clone(),
            self.streams.clone(),
            self.counters.clone(),
            self.custody.clone(),
            self.config.streams.cdc_maxlen,
            self.config.sweep_interval(),
        );
        tasks.push(tokio::spawn(sweeper.run(shutdown.clone())));

        let mut wait = shutdown.clone();
        wait.cancelled().await;
        info!("pipeline shutting down");

        let joined = tokio::time::timeout(
            self.config.t_shutdown(),
            futures::future::join_all(tasks),
        )
        .await;
        if joined.is_err() {
            warn!("shutdown budget exceeded; pending-entry recovery will reclaim in-flight work");
        }

        Ok(())
    }
}
