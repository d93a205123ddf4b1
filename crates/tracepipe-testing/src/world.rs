use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::task::JoinHandle;

use tracepipe_runtime::{Pipeline, PipelineConfig, Shutdown, ShutdownHandle};
use tracepipe_streams::streams;
use tracepipe_types::DlqRecord;

/// Install a test tracing subscriber once; later calls are no-ops
pub fn install_test_subscriber() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Poll `cond` until it holds or the deadline passes
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

/// An isolated pipeline in a temp directory, with timers tightened so
/// integration tests settle in tens of milliseconds.
pub struct PipelineWorld {
    _temp_dir: TempDir,
    pub pipeline: Arc<Pipeline>,
}

impl PipelineWorld {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut PipelineConfig)) -> Self {
        install_test_subscriber();

        let temp_dir = TempDir::new().expect("Failed to create temp dir");

        let mut config = PipelineConfig {
            data_dir: Some(temp_dir.path().to_path_buf()),
            ..PipelineConfig::default()
        };
        config.fast_path.t_poll_ms = 10;
        config.fast_path.t_batch_ms = 20;
        config.fast_path.t_stuck_ms = 200;
        config.workers.t_poll_ms = 10;
        config.workers.t_stuck_ms = 200;
        config.backpressure.t_mon_ms = 50;
        config.sweep_interval_ms = 50;
        config.t_shutdown_ms = 2_000;
        tweak(&mut config);

        let pipeline = Pipeline::open(config).expect("Failed to open pipeline");

        Self {
            _temp_dir: temp_dir,
            pipeline: Arc::new(pipeline),
        }
    }

    /// Spawn the pipeline's task set
    pub fn start(&self) -> RunningPipeline {
        let (handle, shutdown) = Shutdown::new();
        let pipeline = self.pipeline.clone();
        let task = tokio::spawn(async move {
            let _ = pipeline.run(shutdown).await;
        });
        RunningPipeline { handle, task }
    }

    /// Decode every record currently in the dead-letter stream
    pub fn dlq_records(&self) -> Vec<DlqRecord> {
        let streams_db = self.pipeline.streams();
        let db = streams_db.lock().expect("stream db lock poisoned");
        db.scan(streams::DLQ)
            .expect("dlq scan failed")
            .iter()
            .filter_map(|entry| entry.decode().ok())
            .collect()
    }

    /// Entries currently retained in the CDC stream
    pub fn cdc_len(&self) -> u64 {
        let streams_db = self.pipeline.streams();
        let db = streams_db.lock().expect("stream db lock poisoned");
        db.len(streams::CDC).expect("cdc len failed")
    }

    /// Depth of the ingress pending-entries list for the fast-path group
    pub fn ingress_pending(&self) -> u64 {
        let streams_db = self.pipeline.streams();
        let db = streams_db.lock().expect("stream db lock poisoned");
        db.pending_count(streams::INGRESS, tracepipe_runtime::FAST_PATH_GROUP)
            .expect("pending count failed")
    }
}

impl Default for PipelineWorld {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a started pipeline; stop() is a graceful shutdown
pub struct RunningPipeline {
    handle: ShutdownHandle,
    task: JoinHandle<()>,
}

impl RunningPipeline {
    pub async fn stop(self) {
        self.handle.shutdown();
        let _ = self.task.await;
    }
}
