use rusqlite::Connection;

use crate::Result;

// Schema version (increment when changing table definitions)
pub const SCHEMA_VERSION: i32 = 1;

// NOTE: Stream Storage Rationale
//
// Why SQLite-backed streams (not an in-process queue)?
// - Pending entries must survive process crashes; recovery re-claims them
// - Multiple pipeline processes may share one consumer group
// - Acknowledgement is a durable state transition, not a channel drain
//
// Why a per-group cursor plus a pending table?
// - `next_seq` is the high-water mark of entries ever delivered to the group
// - `pending` holds delivered-but-unacknowledged entries per consumer;
//   ack deletes, claim reassigns, delivery_count tracks the retry budget
//
// Why millisecond-integer delivery timestamps?
// - Claim eligibility is an age comparison; integers avoid text-format drift

pub fn init_schema(conn: &Connection) -> Result<()> {
    let current_version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if current_version != 0 && current_version != SCHEMA_VERSION {
        drop_all_tables(conn)?;
    }

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS entries (
            stream TEXT NOT NULL,
            seq INTEGER NOT NULL,
            appended_at TEXT NOT NULL,
            body TEXT NOT NULL,
            PRIMARY KEY (stream, seq)
        );

        CREATE TABLE IF NOT EXISTS groups (
            stream TEXT NOT NULL,
            group_name TEXT NOT NULL,
            next_seq INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (stream, group_name)
        );

        CREATE TABLE IF NOT EXISTS pending (
            stream TEXT NOT NULL,
            group_name TEXT NOT NULL,
            seq INTEGER NOT NULL,
            consumer TEXT NOT NULL,
            delivered_at_ms INTEGER NOT NULL,
            delivery_count INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (stream, group_name, seq)
        );

        CREATE INDEX IF NOT EXISTS idx_pending_delivered
            ON pending(stream, group_name, delivered_at_ms);
        "#,
    )?;

    conn.execute(&format!("PRAGMA user_version = {}", SCHEMA_VERSION), [])?;

    Ok(())
}

fn drop_all_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        DROP TABLE IF EXISTS pending;
        DROP TABLE IF EXISTS groups;
        DROP TABLE IF EXISTS entries;
        "#,
    )?;
    Ok(())
}
