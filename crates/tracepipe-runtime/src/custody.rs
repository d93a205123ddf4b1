use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracepipe_store::{Bucket, MetricKey, MetricOp, MetricsStore, Scope};
use tracepipe_types::Stage;

use crate::Result;

// NOTE: Chain of custody
//
// Every stage increments a per-minute counter keyed by the event's
// enqueued_at minute, so the stages of one event land in the same bucket
// and the sliding-hour comparison stays meaningful. Increments go through
// the metrics store's (event_id, metric_key) dedup, which makes replays
// and redeliveries invisible to the accounting.

/// Stage counters correlating ingress → persisted → derived
#[derive(Clone)]
pub struct CustodyAccounting {
    metrics: Arc<Mutex<MetricsStore>>,
}

/// Aggregates over a sliding window, plus the chain-break verdict
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub window_secs: u64,
    pub ingress_enqueued: i64,
    pub raw_persisted: i64,
    pub cdc_published: i64,
    pub dlq_fast_path: i64,
    pub dlq_total: i64,
    pub chain_broken: bool,
}

impl CustodyAccounting {
    pub fn new(metrics: Arc<Mutex<MetricsStore>>) -> Self {
        Self { metrics }
    }

    fn bump(
        &self,
        event_id: &str,
        name: &str,
        labels: &[(&str, &str)],
        at: DateTime<Utc>,
    ) -> Result<()> {
        let key = MetricKey::new(Scope::Global, name, labels, Bucket::minute(at));
        let mut store = self.metrics.lock().expect("metrics store lock poisoned");
        store.apply(event_id, &[(key, MetricOp::Incr(1))])?;
        Ok(())
    }

    pub fn ingress_enqueued(&self, event_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.bump(event_id, "cc_ingress_enqueued", &[], at)
    }

    pub fn raw_persisted(&self, event_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.bump(event_id, "cc_raw_persisted", &[], at)
    }

    pub fn cdc_published(&self, event_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.bump(event_id, "cc_cdc_published", &[], at)
    }

    pub fn derived_applied(&self, builder: &str, event_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.bump(event_id, "cc_derived_applied", &[("builder", builder)], at)
    }

    pub fn deadlettered(&self, stage: Stage, event_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.bump(event_id, "cc_dlq_total", &[("stage", stage.as_str())], at)
    }

    /// Sliding-window custody check. The chain is broken when fewer events
    /// reached the raw store than entered ingress, net of fast-path
    /// deadletters.
    pub fn health(&self, window: Duration) -> Result<HealthReport> {
        let since = Utc::now() - chrono::Duration::from_std(window).unwrap_or(chrono::Duration::hours(1));
        let store = self.metrics.lock().expect("metrics store lock poisoned");

        let ingress_enqueued = store.counter_sum_since("cc_ingress_enqueued", None, since)?;
        let raw_persisted = store.counter_sum_since("cc_raw_persisted", None, since)?;
        let cdc_published = store.counter_sum_since("cc_cdc_published", None, since)?;
        let dlq_fast_path =
            store.counter_sum_since("cc_dlq_total", Some("stage=fast_path"), since)?;
        let dlq_total = store.counter_sum_since("cc_dlq_total", None, since)?;

        Ok(HealthReport {
            window_secs: window.as_secs(),
            ingress_enqueued,
            raw_persisted,
            cdc_published,
            dlq_fast_path,
            dlq_total,
            chain_broken: raw_persisted < ingress_enqueued - dlq_fast_path,
        })
    }
}
