use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::VecDeque;
use std::path::Path;
use tracing::{debug, warn};

use tracepipe_types::{IngressEvent, session_key};

use crate::codec::{compress_events, decompress_events};
use crate::timefmt;
use crate::{Error, Result};

// Schema version (increment when changing table definitions)
const SCHEMA_VERSION: i32 = 1;

// NOTE: Raw Store Rationale
//
// The compressed batch log is the chain-of-custody anchor: once a batch
// commits here, the event is durable and everything downstream (CDC,
// conversations, metrics) is a derivable projection. Records are never
// mutated after commit; `prune_before` exists for operators, nothing in
// the pipeline calls it.
//
// `cdc_unpublished` lives next to the batches because a CDC publish failure
// is repaired from the committed batch itself; the sweeper re-reads the
// events and re-emits their records.

/// Persisted batch metadata (everything but the blob)
#[derive(Debug, Clone)]
pub struct RawBatchMeta {
    pub batch_id: i64,
    pub written_at: DateTime<Utc>,
    pub event_count: usize,
    pub first_enqueued_at: DateTime<Utc>,
    pub last_enqueued_at: DateTime<Utc>,
    pub codec_version: u8,
}

/// Append-only compressed event log. Single writer per process; readers
/// go through WAL snapshots.
pub struct RawStore {
    conn: Connection,
}

impl RawStore {
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
                DROP TABLE IF EXISTS cdc_unpublished;
                DROP TABLE IF EXISTS raw_batches;
                "#,
            )?;
        }

        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS raw_batches (
                batch_id INTEGER PRIMARY KEY AUTOINCREMENT,
                written_at TEXT NOT NULL,
                event_count INTEGER NOT NULL,
                first_enqueued_at TEXT NOT NULL,
                last_enqueued_at TEXT NOT NULL,
                codec_version INTEGER NOT NULL,
                blob BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS cdc_unpublished (
                batch_id INTEGER PRIMARY KEY,
                recorded_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_batches_last_enqueued
                ON raw_batches(last_enqueued_at);
            "#,
        )?;

        self.conn
            .execute(&format!("PRAGMA user_version = {}", SCHEMA_VERSION), [])?;

        Ok(())
    }

    /// Atomically persist a compressed batch, returning its assigned id.
    ///
    /// The transaction covers the whole batch; a crash mid-append persists
    /// nothing. Event order within the batch is preserved by the blob.
    pub fn append(&mut self, events: &[IngressEvent]) -> Result<i64> {
        if events.is_empty() {
            return Err(Error::InvalidBatch("empty batch".to_string()));
        }

        let first = events
            .iter()
            .map(|e| e.enqueued_at)
            .min()
            .expect("non-empty batch");
        let last = events
            .iter()
            .map(|e| e.enqueued_at)
            .max()
            .expect("non-empty batch");

        let (codec_version, blob) = compress_events(events)?;

        let tx = self.conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO raw_batches
                (written_at, event_count, first_enqueued_at, last_enqueued_at, codec_version, blob)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                timefmt::to_text(Utc::now()),
                events.len() as i64,
                timefmt::to_text(first),
                timefmt::to_text(last),
                codec_version as i64,
                blob,
            ],
        )?;
        let batch_id = tx.last_insert_rowid();
        tx.commit()?;

        debug!(batch_id, event_count = events.len(), "committed raw batch");
        Ok(batch_id)
    }

    /// Decompress a committed batch back into its events
    pub fn read(&self, batch_id: i64) -> Result<Vec<IngressEvent>> {
        self.try_read(batch_id)?
            .ok_or_else(|| Error::Corrupt(format!("batch {} not found", batch_id)))
    }

    /// Like [`read`](Self::read), but absence is not an error. Lets callers
    /// distinguish a batch that is not readable yet (restart races) from a
    /// corrupt one.
    pub fn try_read(&self, batch_id: i64) -> Result<Option<Vec<IngressEvent>>> {
        let row: Option<(i64, u8, Vec<u8>)> = self
            .conn
            .query_row(
                "SELECT event_count, codec_version, blob FROM raw_batches WHERE batch_id = ?1",
                [batch_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((event_count, codec_version, blob)) = row else {
            return Ok(None);
        };

        let events = decompress_events(codec_version, &blob)?;
        if events.len() as i64 != event_count {
            return Err(Error::Corrupt(format!(
                "batch {} decompressed to {} events, recorded {}",
                batch_id,
                events.len(),
                event_count
            )));
        }

        Ok(Some(events))
    }

    /// Batch metadata without touching the blob
    pub fn meta(&self, batch_id: i64) -> Result<Option<RawBatchMeta>> {
        let meta = self
            .conn
            .query_row(
                r#"
                SELECT batch_id, written_at, event_count, first_enqueued_at,
                       last_enqueued_at, codec_version
                FROM raw_batches WHERE batch_id = ?1
                "#,
                [batch_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, u8>(5)?,
                    ))
                },
            )
            .optional()?;

        match meta {
            Some((batch_id, written_at, event_count, first, last, codec_version)) => {
                Ok(Some(RawBatchMeta {
                    batch_id,
                    written_at: timefmt::parse(&written_at)?,
                    event_count: event_count as usize,
                    first_enqueued_at: timefmt::parse(&first)?,
                    last_enqueued_at: timefmt::parse(&last)?,
                    codec_version,
                }))
            }
            None => Ok(None),
        }
    }

    /// Lazy sequence over a session's events at or after `since`.
    ///
    /// Batches are candidate-filtered on stored bounds and decompressed one
    /// at a time as the iterator advances.
    pub fn scan(
        &self,
        session: &str,
        since: DateTime<Utc>,
    ) -> Result<ScanIter<'_>> {
        let mut stmt = self.conn.prepare(
            "SELECT batch_id FROM raw_batches WHERE last_enqueued_at >= ?1 ORDER BY batch_id",
        )?;
        let ids = stmt
            .query_map([timefmt::to_text(since)], |row| row.get::<_, i64>(0))?
            .collect::<std::result::Result<VecDeque<_>, _>>()?;

        Ok(ScanIter {
            store: self,
            batch_ids: ids,
            buffered: Vec::new().into_iter(),
            session: session.to_string(),
            since,
        })
    }

    pub fn last_batch_id(&self) -> Result<Option<i64>> {
        let id: Option<i64> = self
            .conn
            .query_row("SELECT MAX(batch_id) FROM raw_batches", [], |row| row.get(0))?;
        Ok(id)
    }

    pub fn batch_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM raw_batches", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Integrity sweep: every committed batch must decompress to exactly
    /// its recorded event count under its recorded codec. Returns the ids
    /// of batches that fail, for operator tooling.
    pub fn verify_integrity(&self) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT batch_id FROM raw_batches ORDER BY batch_id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut corrupt = Vec::new();
        for batch_id in ids {
            match self.try_read(batch_id) {
                Ok(Some(_)) => {}
                Ok(None) => {}
                Err(Error::Corrupt(msg)) | Err(Error::Codec(msg)) => {
                    warn!(batch_id, %msg, "raw batch failed integrity check");
                    corrupt.push(batch_id);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(corrupt)
    }

    /// Retention hook for operators; the pipeline never calls this
    pub fn prune_before(&self, batch_id: i64) -> Result<usize> {
        let pruned = self.conn.execute(
            "DELETE FROM raw_batches WHERE batch_id < ?1",
            [batch_id],
        )?;
        Ok(pruned)
    }

    /// Record a batch whose CDC records could not all be published
    pub fn record_cdc_unpublished(&self, batch_id: i64) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO cdc_unpublished (batch_id, recorded_at) VALUES (?1, ?2)",
            params![batch_id, timefmt::to_text(Utc::now())],
        )?;
        Ok(())
    }

    /// Batches awaiting CDC re-publication, oldest first
    pub fn cdc_unpublished(&self, limit: usize) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT batch_id FROM cdc_unpublished ORDER BY batch_id LIMIT ?1",
        )?;
        let ids = stmt
            .query_map([limit as i64], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Mark a fallback-logged batch as fully published
    pub fn clear_cdc_unpublished(&self, batch_id: i64) -> Result<()> {
        self.conn.execute(
            "DELETE FROM cdc_unpublished WHERE batch_id = ?1",
            [batch_id],
        )?;
        Ok(())
    }
}

/// Iterator returned by [`RawStore::scan`]
pub struct ScanIter<'a> {
    store: &'a RawStore,
    batch_ids: VecDeque<i64>,
    buffered: std::vec::IntoIter<IngressEvent>,
    session: String,
    since: DateTime<Utc>,
}

impl Iterator for ScanIter<'_> {
    type Item = Result<IngressEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(event) = self.buffered.next() {
                return Some(Ok(event));
            }

            let batch_id = self.batch_ids.pop_front()?;
            match self.store.read(batch_id) {
                Ok(events) => {
                    let matching: Vec<IngressEvent> = events
                        .into_iter()
                        .filter(|e| {
                            e.enqueued_at >= self.since
                                && session_key(&e.platform, &e.external_session_id)
                                    == self.session
                        })
                        .collect();
                    self.buffered = matching.into_iter();
                }
                Err(err) => return Some(Err(err)),
            }
        }
    }
}
