mod config;
mod counters;
mod custody;
mod dlq;
mod error;
mod fast_path;
mod pipeline;
mod shed;
mod shutdown;
mod sweeper;
mod worker;

pub use config::{
    BackpressureConfig, FastPathConfig, PipelineConfig, StreamConfig, WorkerConfig,
    resolve_data_dir,
};
pub use counters::{CountersSnapshot, PipelineCounters};
pub use custody::{CustodyAccounting, HealthReport};
pub use error::{Error, Result};
pub use fast_path::{FAST_PATH_GROUP, FastPath};
pub use pipeline::Pipeline;
pub use shed::{BackpressureMonitor, ShedMode, ShedState};
pub use shutdown::{Shutdown, ShutdownHandle};
pub use sweeper::CdcSweeper;
pub use worker::{WORKER_GROUP, WorkerPool};
