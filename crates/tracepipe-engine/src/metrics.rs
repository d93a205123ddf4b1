use std::sync::{Arc, Mutex};
use tracing::debug;

use tracepipe_store::{Bucket, MetricKey, MetricOp, MetricsStore, RawStore, Scope};
use tracepipe_types::{CdcRecord, EventType, FileOperation, IngressEvent};

use crate::builder::{BuildOutcome, Builder};
use crate::resolve::resolve_event;
use crate::Result;

/// Turns CDC records into metric delta sets and applies them with
/// `(event_id, metric_key)` conditional updates, so reprocessing the same
/// event never double-counts.
pub struct MetricsAggregator {
    metrics: Arc<Mutex<MetricsStore>>,
    raw: Arc<Mutex<RawStore>>,
}

impl MetricsAggregator {
    pub fn new(metrics: Arc<Mutex<MetricsStore>>, raw: Arc<Mutex<RawStore>>) -> Self {
        Self { metrics, raw }
    }

    fn try_apply(&self, record: &CdcRecord) -> Result<bool> {
        let event = resolve_event(record, &self.raw)?;
        let deltas = compute_deltas(&event);

        let mut store = self.metrics.lock().expect("metrics store lock poisoned");
        let applied = store.apply(&event.event_id, &deltas)?;

        debug!(event_id = %event.event_id, applied, "applied metric deltas");
        Ok(applied > 0)
    }
}

impl Builder for MetricsAggregator {
    fn id(&self) -> &'static str {
        "metrics"
    }

    fn apply(&self, record: &CdcRecord) -> BuildOutcome {
        match self.try_apply(record) {
            Ok(true) => BuildOutcome::Applied,
            Ok(false) => BuildOutcome::Skipped,
            Err(err) => BuildOutcome::from_error(err),
        }
    }
}

/// Pure delta computation for one event.
///
/// Every record counts into `events_total`; the rest depends on type.
/// Unknown types contribute only the `events_total` line.
pub fn compute_deltas(event: &IngressEvent) -> Vec<(MetricKey, MetricOp)> {
    let mut deltas = vec![(
        MetricKey::new(
            Scope::Platform,
            "events_total",
            &[
                ("platform", event.platform.as_str()),
                ("event_type", event.event_type.as_str()),
            ],
            Bucket::minute(event.enqueued_at),
        ),
        MetricOp::Incr(1),
    )];

    match &event.event_type {
        EventType::SessionStart => {
            deltas.push((
                MetricKey::new(Scope::Global, "sessions_active", &[], Bucket::all()),
                MetricOp::GaugeAdd(1.0),
            ));
        }

        EventType::SessionEnd => {
            deltas.push((
                MetricKey::new(Scope::Global, "sessions_active", &[], Bucket::all()),
                MetricOp::GaugeAdd(-1.0),
            ));
        }

        EventType::AssistantResponse => {
            if let Some(tokens) = event.payload_u64("tokens_used") {
                deltas.push((
                    MetricKey::new(
                        Scope::Session,
                        "tokens_total",
                        &[("session", &event.external_session_id)],
                        Bucket::all(),
                    ),
                    MetricOp::Incr(tokens as i64),
                ));
            }
            // Every response is one suggestion for acceptance-rate purposes
            for key in suggestion_keys(event) {
                deltas.push((key, MetricOp::Incr(1)));
            }
        }

        EventType::ToolPost => {
            if let (Some(tool_name), Some(duration)) = (
                event.payload_str("tool_name"),
                event.payload_u64("duration_ms"),
            ) {
                deltas.push((
                    MetricKey::new(
                        Scope::Tool,
                        "tool_latency_ms",
                        &[("tool_name", tool_name)],
                        Bucket::all(),
                    ),
                    MetricOp::Observe(duration),
                ));
            }
        }

        EventType::FileEdit => {
            if event.file_operation() == Some(FileOperation::Accepted) {
                for key in accepted_keys(event) {
                    deltas.push((key, MetricOp::Incr(1)));
                }
            }
        }

        _ => {}
    }

    deltas
}

fn suggestion_keys(event: &IngressEvent) -> Vec<MetricKey> {
    scoped_rate_keys("suggestion_total", event)
}

fn accepted_keys(event: &IngressEvent) -> Vec<MetricKey> {
    scoped_rate_keys("accepted_total", event)
}

fn scoped_rate_keys(name: &str, event: &IngressEvent) -> Vec<MetricKey> {
    vec![
        MetricKey::new(Scope::Global, name, &[], Bucket::all()),
        MetricKey::new(
            Scope::Session,
            name,
            &[("session", &event.external_session_id)],
            Bucket::all(),
        ),
    ]
}

/// Accepted/suggested ratio for a scope, `None` until a suggestion exists
pub fn acceptance_rate(
    store: &MetricsStore,
    scope: Scope,
    labels: &[(&str, &str)],
) -> Result<Option<f64>> {
    let suggested = store.counter(&MetricKey::new(scope, "suggestion_total", labels, Bucket::all()))?;
    if suggested == 0 {
        return Ok(None);
    }
    let accepted = store.counter(&MetricKey::new(scope, "accepted_total", labels, Bucket::all()))?;
    Ok(Some(accepted as f64 / suggested as f64))
}

/// Current active-session gauge, floored at zero (duplicate end events from
/// reconnecting agents can otherwise drive the raw value negative)
pub fn sessions_active(store: &MetricsStore) -> Result<f64> {
    let key = MetricKey::new(Scope::Global, "sessions_active", &[], Bucket::all());
    Ok(store.gauge(&key)?.unwrap_or(0.0).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use tracepipe_types::Platform;

    fn event(event_type: EventType, payload: serde_json::Value) -> IngressEvent {
        let mut e = IngressEvent::new(
            "evt-1",
            Utc::now(),
            Platform::ClaudeCode,
            "s-1",
            event_type,
        );
        if let serde_json::Value::Object(map) = payload {
            e.payload = map;
        }
        e
    }

    fn harness() -> (MetricsAggregator, Arc<Mutex<MetricsStore>>) {
        let metrics = Arc::new(Mutex::new(MetricsStore::open_in_memory().unwrap()));
        let raw = Arc::new(Mutex::new(RawStore::open_in_memory().unwrap()));
        (MetricsAggregator::new(metrics.clone(), raw), metrics)
    }

    #[test]
    fn test_every_event_counts_into_events_total() {
        let e = event(EventType::from("FutureThing"), json!({}));
        let deltas = compute_deltas(&e);
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].0.name, "events_total");
        assert_eq!(
            deltas[0].0.labels(),
            "event_type=FutureThing,platform=claude_code"
        );
    }

    #[test]
    fn test_assistant_response_deltas() {
        let e = event(
            EventType::AssistantResponse,
            json!({"response_length": 45, "tokens_used": 30, "model": "m1", "duration_ms": 800}),
        );
        let deltas = compute_deltas(&e);
        let names: Vec<&str> = deltas.iter().map(|(k, _)| k.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["events_total", "tokens_total", "suggestion_total", "suggestion_total"]
        );
        assert!(deltas.iter().any(|(k, op)| {
            k.name == "tokens_total" && *op == MetricOp::Incr(30)
        }));
    }

    #[test]
    fn test_tool_post_observes_latency() {
        let e = event(
            EventType::ToolPost,
            json!({"tool_name": "Edit", "success": true, "duration_ms": 40, "output_size": 1}),
        );
        let deltas = compute_deltas(&e);
        assert!(deltas
            .iter()
            .any(|(k, op)| k.name == "tool_latency_ms" && *op == MetricOp::Observe(40)));
    }

    #[test]
    fn test_duplicate_event_ids_count_once() {
        let (aggregator, metrics) = harness();
        let e = event(
            EventType::AssistantResponse,
            json!({"response_length": 45, "tokens_used": 30, "model": "m1", "duration_ms": 800}),
        );
        let record = CdcRecord::for_committed_event(&e, 1, 0);

        assert!(matches!(aggregator.apply(&record), BuildOutcome::Applied));
        assert!(matches!(aggregator.apply(&record), BuildOutcome::Skipped));

        let store = metrics.lock().unwrap();
        let tokens = store
            .counter(&MetricKey::new(
                Scope::Session,
                "tokens_total",
                &[("session", "s-1")],
                Bucket::all(),
            ))
            .unwrap();
        assert_eq!(tokens, 30);
    }

    #[test]
    fn test_acceptance_rate_zero_accepted_one_suggested() {
        let (aggregator, metrics) = harness();

        let response = event(
            EventType::AssistantResponse,
            json!({"response_length": 5, "tokens_used": 2, "model": "m", "duration_ms": 10}),
        );
        aggregator.apply(&CdcRecord::for_committed_event(&response, 1, 0));

        let mut rejected = event(
            EventType::FileEdit,
            json!({"file_extension": "rs", "lines_added": 1, "lines_removed": 0, "operation": "rejected"}),
        );
        rejected.event_id = "evt-2".to_string();
        aggregator.apply(&CdcRecord::for_committed_event(&rejected, 1, 1));

        let store = metrics.lock().unwrap();
        let rate = acceptance_rate(&store, Scope::Session, &[("session", "s-1")])
            .unwrap()
            .unwrap();
        assert_eq!(rate, 0.0);
    }

    #[test]
    fn test_sessions_active_gauge_tracks_lifecycle() {
        let (aggregator, metrics) = harness();

        let mut start = event(EventType::SessionStart, json!({}));
        start.event_id = "e-start".to_string();
        let mut end = event(EventType::SessionEnd, json!({"session_duration_ms": 100}));
        end.event_id = "e-end".to_string();

        aggregator.apply(&CdcRecord::for_committed_event(&start, 1, 0));
        {
            let store = metrics.lock().unwrap();
            assert_eq!(sessions_active(&store).unwrap(), 1.0);
        }

        aggregator.apply(&CdcRecord::for_committed_event(&end, 1, 1));
        let store = metrics.lock().unwrap();
        assert_eq!(sessions_active(&store).unwrap(), 0.0);
    }
}
