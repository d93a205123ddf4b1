use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;

use crate::timefmt;
use crate::{Error, Result};

// Schema version (increment when changing table definitions)
const SCHEMA_VERSION: i32 = 1;

// NOTE: Metrics Store Rationale
//
// Counter and histogram updates are plain SQL increments, so concurrent
// workers compose without read-modify-write races. Idempotence is the
// `metric_applied` dedup table: each (event_id, metric_key) delta is
// guarded by an INSERT OR IGNORE in the same transaction, so redelivering
// an event re-applies nothing.
//
// Histogram rows are per-bucket (non-cumulative); readers cumulate. That
// keeps an observation a single-row increment.

/// Exponential latency bucket upper bounds, in milliseconds
pub const HISTOGRAM_BOUNDS: [i64; 15] = [
    1, 2, 4, 8, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384,
];

/// Sentinel bound for observations above the largest finite bucket
pub const HISTOGRAM_OVERFLOW: i64 = i64::MAX;

/// Upper bound of the bucket an observation falls into
pub fn histogram_bound_for(value_ms: u64) -> i64 {
    for bound in HISTOGRAM_BOUNDS {
        if value_ms <= bound as u64 {
            return bound;
        }
    }
    HISTOGRAM_OVERFLOW
}

/// Metric scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Global,
    Session,
    Tool,
    Platform,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Session => "session",
            Scope::Tool => "tool",
            Scope::Platform => "platform",
        }
    }
}

/// Time-window identifier a metric value is bucketed under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket(String);

impl Bucket {
    /// Lifetime bucket for metrics that are not windowed
    pub fn all() -> Self {
        Bucket("all".to_string())
    }

    pub fn minute(ts: DateTime<Utc>) -> Self {
        Bucket(format!("m:{}", ts.format("%Y-%m-%dT%H:%M")))
    }

    pub fn hour(ts: DateTime<Utc>) -> Self {
        Bucket(format!("h:{}", ts.format("%Y-%m-%dT%H")))
    }

    pub fn day(ts: DateTime<Utc>) -> Self {
        Bucket(format!("d:{}", ts.format("%Y-%m-%d")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Full key of one metric series: `(scope, name, labels, bucket)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricKey {
    pub scope: Scope,
    pub name: String,
    labels: String,
    pub bucket: Bucket,
}

impl MetricKey {
    pub fn new(scope: Scope, name: &str, labels: &[(&str, &str)], bucket: Bucket) -> Self {
        Self {
            scope,
            name: name.to_string(),
            labels: canonical_labels(labels),
            bucket,
        }
    }

    pub fn labels(&self) -> &str {
        &self.labels
    }

    /// Stable string used in the `(event_id, metric_key)` dedup index
    pub fn dedup_key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.scope.as_str(),
            self.name,
            self.labels,
            self.bucket.as_str()
        )
    }
}

fn canonical_labels(labels: &[(&str, &str)]) -> String {
    let mut pairs: Vec<(&str, &str)> = labels.to_vec();
    pairs.sort_by_key(|(k, _)| *k);
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// One delta against a metric series
#[derive(Debug, Clone, PartialEq)]
pub enum MetricOp {
    /// Monotonic counter increment
    Incr(i64),
    /// Last-writer-wins gauge value
    GaugeSet(f64),
    /// Signed gauge adjustment (session open/close transitions)
    GaugeAdd(f64),
    /// Histogram observation in milliseconds
    Observe(u64),
}

/// Rolling counters, gauges and histograms keyed by `(scope, name, labels, bucket)`
pub struct MetricsStore {
    conn: Connection,
}

impl MetricsStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let current_version: i32 =
            self.conn
                .query_row("PRAGMA user_version", [], |row| row.get(0))?;

        if current_version != 0 && current_version != SCHEMA_VERSION {
            self.conn.execute_batch(
                r#"
                DROP TABLE IF EXISTS metric_applied;
                DROP TABLE IF EXISTS histograms;
                DROP TABLE IF EXISTS gauges;
                DROP TABLE IF EXISTS counters;
                "#,
            )?;
        }

        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS counters (
                scope TEXT NOT NULL,
                name TEXT NOT NULL,
                labels TEXT NOT NULL,
                bucket TEXT NOT NULL,
                value INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (scope, name, labels, bucket)
            );

            CREATE TABLE IF NOT EXISTS gauges (
                scope TEXT NOT NULL,
                name TEXT NOT NULL,
                labels TEXT NOT NULL,
                bucket TEXT NOT NULL,
                value REAL NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (scope, name, labels, bucket)
            );

            CREATE TABLE IF NOT EXISTS histograms (
                scope TEXT NOT NULL,
                name TEXT NOT NULL,
                labels TEXT NOT NULL,
                bucket TEXT NOT NULL,
                le INTEGER NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (scope, name, labels, bucket, le)
            );

            CREATE TABLE IF NOT EXISTS metric_applied (
                event_id TEXT NOT NULL,
                metric_key TEXT NOT NULL,
                applied_at TEXT NOT NULL,
                PRIMARY KEY (event_id, metric_key)
            );

            CREATE INDEX IF NOT EXISTS idx_counters_name ON counters(name, bucket);
            CREATE INDEX IF NOT EXISTS idx_metric_applied_at ON metric_applied(applied_at);
            "#,
        )?;

        self.conn
            .execute(&format!("PRAGMA user_version = {}", SCHEMA_VERSION), [])?;

        Ok(())
    }

    /// Apply a delta set for one event in a single transaction.
    ///
    /// Each `(event_id, metric_key)` pair is applied at most once ever;
    /// re-applying the same set is a no-op. Returns how many deltas were
    /// freshly applied.
    pub fn apply(&mut self, event_id: &str, deltas: &[(MetricKey, MetricOp)]) -> Result<usize> {
        let now_text = timefmt::to_text(Utc::now());
        let tx = self.conn.transaction()?;
        let mut applied = 0;

        for (key, op) in deltas {
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO metric_applied (event_id, metric_key, applied_at)
                 VALUES (?1, ?2, ?3)",
                params![event_id, key.dedup_key(), now_text],
            )?;
            if inserted == 0 {
                continue;
            }
            applied += 1;

            match op {
                MetricOp::Incr(delta) => {
                    tx.execute(
                        r#"
                        INSERT INTO counters (scope, name, labels, bucket, value)
                        VALUES (?1, ?2, ?3, ?4, ?5)
                        ON CONFLICT(scope, name, labels, bucket)
                            DO UPDATE SET value = value + ?5
                        "#,
                        params![
                            key.scope.as_str(),
                            key.name,
                            key.labels,
                            key.bucket.as_str(),
                            delta
                        ],
                    )?;
                }
                MetricOp::GaugeSet(value) => {
                    tx.execute(
                        r#"
                        INSERT INTO gauges (scope, name, labels, bucket, value, updated_at)
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                        ON CONFLICT(scope, name, labels, bucket)
                            DO UPDATE SET value = ?5, updated_at = ?6
                        "#,
                        params![
                            key.scope.as_str(),
                            key.name,
                            key.labels,
                            key.bucket.as_str(),
                            value,
                            now_text
                        ],
                    )?;
                }
                MetricOp::GaugeAdd(delta) => {
                    tx.execute(
                        r#"
                        INSERT INTO gauges (scope, name, labels, bucket, value, updated_at)
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                        ON CONFLICT(scope, name, labels, bucket)
                            DO UPDATE SET value = value + ?5, updated_at = ?6
                        "#,
                        params![
                            key.scope.as_str(),
                            key.name,
                            key.labels,
                            key.bucket.as_str(),
                            delta,
                            now_text
                        ],
                    )?;
                }
                MetricOp::Observe(value_ms) => {
                    let bound = histogram_bound_for(*value_ms);
                    tx.execute(
                        r#"
                        INSERT INTO histograms (scope, name, labels, bucket, le, count)
                        VALUES (?1, ?2, ?3, ?4, ?5, 1)
                        ON CONFLICT(scope, name, labels, bucket, le)
                            DO UPDATE SET count = count + 1
                        "#,
                        params![
                            key.scope.as_str(),
                            key.name,
                            key.labels,
                            key.bucket.as_str(),
                            bound
                        ],
                    )?;
                }
            }
        }

        tx.commit()?;
        Ok(applied)
    }

    pub fn counter(&self, key: &MetricKey) -> Result<i64> {
        let value: Option<i64> = self
            .conn
            .query_row(
                "SELECT value FROM counters
                 WHERE scope = ?1 AND name = ?2 AND labels = ?3 AND bucket = ?4",
                params![
                    key.scope.as_str(),
                    key.name,
                    key.labels,
                    key.bucket.as_str()
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.unwrap_or(0))
    }

    /// Sum a counter across all scopes, labels and buckets
    pub fn counter_sum(&self, name: &str) -> Result<i64> {
        let sum: Option<i64> = self.conn.query_row(
            "SELECT SUM(value) FROM counters WHERE name = ?1",
            [name],
            |row| row.get(0),
        )?;
        Ok(sum.unwrap_or(0))
    }

    /// Sum a counter's minute buckets at or after `since`, optionally
    /// restricted to an exact label string
    pub fn counter_sum_since(
        &self,
        name: &str,
        labels: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let since_bucket = Bucket::minute(since);
        let sum: Option<i64> = match labels {
            Some(labels) => self.conn.query_row(
                "SELECT SUM(value) FROM counters
                 WHERE name = ?1 AND labels = ?2 AND bucket >= ?3 AND bucket LIKE 'm:%'",
                params![name, labels, since_bucket.as_str()],
                |row| row.get(0),
            )?,
            None => self.conn.query_row(
                "SELECT SUM(value) FROM counters
                 WHERE name = ?1 AND bucket >= ?2 AND bucket LIKE 'm:%'",
                params![name, since_bucket.as_str()],
                |row| row.get(0),
            )?,
        };
        Ok(sum.unwrap_or(0))
    }

    pub fn gauge(&self, key: &MetricKey) -> Result<Option<f64>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM gauges
                 WHERE scope = ?1 AND name = ?2 AND labels = ?3 AND bucket = ?4",
                params![
                    key.scope.as_str(),
                    key.name,
                    key.labels,
                    key.bucket.as_str()
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Per-bucket histogram counts, ordered by bound (non-cumulative)
    pub fn histogram(&self, key: &MetricKey) -> Result<Vec<(i64, u64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT le, count FROM histograms
             WHERE scope = ?1 AND name = ?2 AND labels = ?3 AND bucket = ?4
             ORDER BY le",
        )?;
        let rows = stmt.query_map(
            params![
                key.scope.as_str(),
                key.name,
                key.labels,
                key.bucket.as_str()
            ],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)? as u64)),
        )?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    /// Drop dedup acknowledgements older than `before` (rolling window)
    pub fn prune_applied_before(&self, before: DateTime<Utc>) -> Result<usize> {
        let pruned = self.conn.execute(
            "DELETE FROM metric_applied WHERE applied_at < ?1",
            [timefmt::to_text(before)],
        )?;
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> MetricKey {
        MetricKey::new(Scope::Global, name, &[], Bucket::all())
    }

    #[test]
    fn test_counter_increment_and_sum() {
        let mut store = MetricsStore::open_in_memory().unwrap();
        let k = MetricKey::new(
            Scope::Platform,
            "events_total",
            &[("platform", "claude_code"), ("event_type", "UserPrompt")],
            Bucket::minute(Utc::now()),
        );

        store.apply("e1", &[(k.clone(), MetricOp::Incr(1))]).unwrap();
        store.apply("e2", &[(k.clone(), MetricOp::Incr(1))]).unwrap();

        assert_eq!(store.counter(&k).unwrap(), 2);
        assert_eq!(store.counter_sum("events_total").unwrap(), 2);
    }

    #[test]
    fn test_reapplying_same_event_is_a_noop() {
        let mut store = MetricsStore::open_in_memory().unwrap();
        let k = key("tokens_total");

        let first = store.apply("e1", &[(k.clone(), MetricOp::Incr(30))]).unwrap();
        let second = store.apply("e1", &[(k.clone(), MetricOp::Incr(30))]).unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 0);
        assert_eq!(store.counter(&k).unwrap(), 30);
    }

    #[test]
    fn test_labels_are_canonicalized() {
        let a = MetricKey::new(Scope::Global, "x", &[("b", "2"), ("a", "1")], Bucket::all());
        let b = MetricKey::new(Scope::Global, "x", &[("a", "1"), ("b", "2")], Bucket::all());
        assert_eq!(a.dedup_key(), b.dedup_key());
        assert_eq!(a.labels(), "a=1,b=2");
    }

    #[test]
    fn test_histogram_bucketing() {
        assert_eq!(histogram_bound_for(0), 1);
        assert_eq!(histogram_bound_for(1), 1);
        assert_eq!(histogram_bound_for(3), 4);
        assert_eq!(histogram_bound_for(800), 1024);
        assert_eq!(histogram_bound_for(16384), 16384);
        assert_eq!(histogram_bound_for(16385), HISTOGRAM_OVERFLOW);

        let mut store = MetricsStore::open_in_memory().unwrap();
        let k = MetricKey::new(
            Scope::Tool,
            "tool_latency_ms",
            &[("tool_name", "Edit")],
            Bucket::all(),
        );
        store.apply("e1", &[(k.clone(), MetricOp::Observe(3))]).unwrap();
        store.apply("e2", &[(k.clone(), MetricOp::Observe(4))]).unwrap();
        store.apply("e3", &[(k.clone(), MetricOp::Observe(900_000))]).unwrap();

        let buckets = store.histogram(&k).unwrap();
        assert_eq!(buckets, vec![(4, 2), (HISTOGRAM_OVERFLOW, 1)]);
    }

    #[test]
    fn test_gauge_add_and_set() {
        let mut store = MetricsStore::open_in_memory().unwrap();
        let k = key("sessions_active");

        store.apply("e1", &[(k.clone(), MetricOp::GaugeAdd(1.0))]).unwrap();
        store.apply("e2", &[(k.clone(), MetricOp::GaugeAdd(1.0))]).unwrap();
        store.apply("e3", &[(k.clone(), MetricOp::GaugeAdd(-1.0))]).unwrap();
        assert_eq!(store.gauge(&k).unwrap(), Some(1.0));

        store.apply("e4", &[(k.clone(), MetricOp::GaugeSet(7.5))]).unwrap();
        assert_eq!(store.gauge(&k).unwrap(), Some(7.5));
    }

    #[test]
    fn test_counter_sum_since_only_counts_recent_minutes() {
        let mut store = MetricsStore::open_in_memory().unwrap();
        let now = Utc::now();
        let old = now - chrono::Duration::hours(3);

        let recent = MetricKey::new(Scope::Global, "cc_raw_persisted", &[], Bucket::minute(now));
        let stale = MetricKey::new(Scope::Global, "cc_raw_persisted", &[], Bucket::minute(old));
        store.apply("e1", &[(recent, MetricOp::Incr(5))]).unwrap();
        store.apply("e2", &[(stale, MetricOp::Incr(9))]).unwrap();

        let sum = store
            .counter_sum_since("cc_raw_persisted", None, now - chrono::Duration::hours(1))
            .unwrap();
        assert_eq!(sum, 5);
    }
}
