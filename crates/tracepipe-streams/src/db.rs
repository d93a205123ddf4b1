use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::records::StreamEntry;
use crate::schema::init_schema;
use crate::{Error, Result};

/// Well-known stream names
pub mod streams {
    pub const INGRESS: &str = "ingress";
    pub const CDC: &str = "cdc";
    pub const DLQ: &str = "dlq";
}

/// Append-only ordered logs with consumer groups, one SQLite database for
/// all streams of a pipeline instance.
///
/// Delivery semantics are at-least-once: `read_group` hands each new entry
/// to exactly one consumer and parks it in the pending-entries list until
/// `ack`. Crashed consumers leave entries pending; `claim_stuck` reassigns
/// them once their idle time exceeds the caller's threshold.
pub struct StreamDb {
    conn: Connection,
}

impl StreamDb {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let db = Self { conn };
        init_schema(&db.conn)?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        init_schema(&db.conn)?;
        Ok(db)
    }

    /// Append an entry and return its assigned sequence number.
    ///
    /// When `maxlen` is set, entries older than the newest `maxlen` are
    /// dropped, except those still pending in some consumer group. Like any
    /// bounded log, a stalled group can lose never-delivered entries once
    /// producers outrun retention.
    pub fn append(&mut self, stream: &str, body: &str, maxlen: Option<u64>) -> Result<i64> {
        let tx = self.conn.transaction()?;

        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM entries WHERE stream = ?1",
            [stream],
            |row| row.get(0),
        )?;

        tx.execute(
            "INSERT INTO entries (stream, seq, appended_at, body) VALUES (?1, ?2, ?3, ?4)",
            params![stream, seq, Utc::now().to_rfc3339(), body],
        )?;

        if let Some(maxlen) = maxlen {
            let threshold = seq - maxlen as i64;
            if threshold > 0 {
                let trimmed = tx.execute(
                    r#"
                    DELETE FROM entries
                    WHERE stream = ?1 AND seq <= ?2
                      AND seq NOT IN (SELECT seq FROM pending WHERE stream = ?1)
                    "#,
                    params![stream, threshold],
                )?;
                if trimmed > 0 {
                    debug!(stream, trimmed, "trimmed stream to retention bound");
                }
            }
        }

        tx.commit()?;
        Ok(seq)
    }

    /// Deliver up to `count` never-delivered entries to `consumer`, parking
    /// them in the pending-entries list. Returns immediately; polling cadence
    /// is the caller's concern.
    pub fn read_group(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let tx = self.conn.transaction()?;

        tx.execute(
            "INSERT OR IGNORE INTO groups (stream, group_name, next_seq) VALUES (?1, ?2, 1)",
            params![stream, group],
        )?;

        let next_seq: i64 = tx.query_row(
            "SELECT next_seq FROM groups WHERE stream = ?1 AND group_name = ?2",
            params![stream, group],
            |row| row.get(0),
        )?;

        let mut entries = Vec::new();
        {
            let mut stmt = tx.prepare(
                r#"
                SELECT seq, body FROM entries
                WHERE stream = ?1 AND seq >= ?2
                ORDER BY seq
                LIMIT ?3
                "#,
            )?;
            let rows = stmt.query_map(params![stream, next_seq, count as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (seq, body) = row?;
                entries.push(StreamEntry {
                    seq,
                    delivery_count: 1,
                    body,
                });
            }
        }

        if let Some(last) = entries.last() {
            let now_ms = Utc::now().timestamp_millis();
            for entry in &entries {
                tx.execute(
                    r#"
                    INSERT INTO pending
                        (stream, group_name, seq, consumer, delivered_at_ms, delivery_count)
                    VALUES (?1, ?2, ?3, ?4, ?5, 1)
                    "#,
                    params![stream, group, entry.seq, consumer, now_ms],
                )?;
            }
            tx.execute(
                "UPDATE groups SET next_seq = ?3 WHERE stream = ?1 AND group_name = ?2",
                params![stream, group, last.seq + 1],
            )?;
        }

        tx.commit()?;
        Ok(entries)
    }

    /// Acknowledge delivered entries, removing them from the pending list
    pub fn ack(&self, stream: &str, group: &str, seqs: &[i64]) -> Result<usize> {
        let mut acked = 0;
        for seq in seqs {
            acked += self.conn.execute(
                "DELETE FROM pending WHERE stream = ?1 AND group_name = ?2 AND seq = ?3",
                params![stream, group, seq],
            )?;
        }
        Ok(acked)
    }

    /// Reassign pending entries idle for at least `min_idle` to `consumer`,
    /// bumping their delivery count. Entries whose body was trimmed are
    /// dropped from the pending list rather than returned.
    pub fn claim_stuck(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        limit: usize,
    ) -> Result<Vec<StreamEntry>> {
        let now_ms = Utc::now().timestamp_millis();
        let cutoff_ms = now_ms - min_idle.as_millis() as i64;

        let tx = self.conn.transaction()?;

        let stuck: Vec<(i64, u32)> = {
            let mut stmt = tx.prepare(
                r#"
                SELECT seq, delivery_count FROM pending
                WHERE stream = ?1 AND group_name = ?2 AND delivered_at_ms <= ?3
                ORDER BY seq
                LIMIT ?4
                "#,
            )?;
            let rows = stmt.query_map(params![stream, group, cutoff_ms, limit as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, u32>(1)?))
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut claimed = Vec::new();
        for (seq, delivery_count) in stuck {
            let body: Option<String> = tx
                .query_row(
                    "SELECT body FROM entries WHERE stream = ?1 AND seq = ?2",
                    params![stream, seq],
                    |row| row.get(0),
                )
                .optional()?;

            match body {
                Some(body) => {
                    tx.execute(
                        r#"
                        UPDATE pending
                        SET consumer = ?4, delivered_at_ms = ?5,
                            delivery_count = delivery_count + 1
                        WHERE stream = ?1 AND group_name = ?2 AND seq = ?3
                        "#,
                        params![stream, group, seq, consumer, now_ms],
                    )?;
                    claimed.push(StreamEntry {
                        seq,
                        delivery_count: delivery_count + 1,
                        body,
                    });
                }
                None => {
                    tx.execute(
                        "DELETE FROM pending WHERE stream = ?1 AND group_name = ?2 AND seq = ?3",
                        params![stream, group, seq],
                    )?;
                }
            }
        }

        tx.commit()?;
        Ok(claimed)
    }

    /// Backlog of a consumer group: retained entries not yet delivered to
    /// it, plus its delivered-but-unacknowledged entries.
    pub fn group_lag(&self, stream: &str, group: &str) -> Result<u64> {
        let next_seq: i64 = self
            .conn
            .query_row(
                "SELECT next_seq FROM groups WHERE stream = ?1 AND group_name = ?2",
                params![stream, group],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(1);

        let unread: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM entries WHERE stream = ?1 AND seq >= ?2",
            params![stream, next_seq],
            |row| row.get(0),
        )?;

        Ok(unread as u64 + self.pending_count(stream, group)?)
    }

    /// Depth of the pending-entries list for a group
    pub fn pending_count(&self, stream: &str, group: &str) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM pending WHERE stream = ?1 AND group_name = ?2",
            params![stream, group],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Age of the oldest pending entry, if any
    pub fn oldest_pending_age(&self, stream: &str, group: &str) -> Result<Option<Duration>> {
        let oldest_ms: Option<i64> = self
            .conn
            .query_row(
                "SELECT MIN(delivered_at_ms) FROM pending WHERE stream = ?1 AND group_name = ?2",
                params![stream, group],
                |row| row.get(0),
            )
            .optional()?
            .flatten();

        Ok(oldest_ms.map(|ms| {
            let age_ms = (Utc::now().timestamp_millis() - ms).max(0);
            Duration::from_millis(age_ms as u64)
        }))
    }

    /// Number of entries currently retained in a stream
    pub fn len(&self, stream: &str) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM entries WHERE stream = ?1",
            [stream],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Read one retained entry by sequence number (operator/test hook)
    pub fn get(&self, stream: &str, seq: i64) -> Result<Option<String>> {
        let body = self
            .conn
            .query_row(
                "SELECT body FROM entries WHERE stream = ?1 AND seq = ?2",
                params![stream, seq],
                |row| row.get(0),
            )
            .optional()?;
        Ok(body)
    }

    /// Scan all retained entries of a stream in order (operator/test hook)
    pub fn scan(&self, stream: &str) -> Result<Vec<StreamEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, body FROM entries WHERE stream = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map([stream], |row| {
            Ok(StreamEntry {
                seq: row.get(0)?,
                delivery_count: 0,
                body: row.get(1)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    #[cfg(test)]
    fn backdate_pending(&self, stream: &str, group: &str, by: Duration) -> Result<()> {
        self.conn.execute(
            "UPDATE pending SET delivered_at_ms = delivered_at_ms - ?3
             WHERE stream = ?1 AND group_name = ?2",
            params![stream, group, by.as_millis() as i64],
        )?;
        Ok(())
    }
}
