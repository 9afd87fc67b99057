//! Crash-safe outbound queue for chunks awaiting delivery.
//!
//! A single-file SQLite log in WAL mode with `synchronous=NORMAL`: an
//! acknowledged enqueue survives a process crash. Sequences come from an
//! AUTOINCREMENT primary key, so they strictly increase and are never reused,
//! even across restarts.

use std::collections::HashMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};

use crate::chunk::EventChunk;
use crate::error::Error;

/// A chunk with its persistent queue sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedChunk {
    pub sequence: i64,
    pub event_id: String,
    pub chunk_index: u32,
    pub chunk_count: u32,
    pub compression: String,
    pub payload: Vec<u8>,
    pub chunk_hash: Vec<u8>,
    pub event_hash: Vec<u8>,
    pub created_at: f64,
    pub logical_timestamp_ms: i64,
    pub clock_skew_ms: f64,
    pub attributes: HashMap<String, String>,
}

impl QueuedChunk {
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let attributes_json: String = row.get("attributes")?;
        Ok(Self {
            sequence: row.get("sequence")?,
            event_id: row.get("event_id")?,
            chunk_index: row.get("chunk_index")?,
            chunk_count: row.get("chunk_count")?,
            compression: row.get("compression")?,
            payload: row.get("payload")?,
            chunk_hash: row.get("chunk_hash")?,
            event_hash: row.get("event_hash")?,
            created_at: row.get("created_at")?,
            logical_timestamp_ms: row.get("logical_timestamp_ms")?,
            clock_skew_ms: row.get("clock_skew_ms")?,
            attributes: serde_json::from_str(&attributes_json).unwrap_or_default(),
        })
    }
}

/// Durable FIFO keyed by a monotonic per-sensor sequence.
pub struct DurableQueue {
    conn: Mutex<Option<Connection>>,
    retention_seconds: f64,
}

impl DurableQueue {
    /// Open or create the queue at `path`.
    pub fn open(path: &Path, retention_seconds: f64) -> Result<Self, Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            retention_seconds,
        })
    }

    /// Release the backing store; later calls fail with [`Error::Closed`].
    pub fn close(&self) {
        if let Some(conn) = self.conn.lock().take() {
            let _ = conn.close();
        }
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T, Error>) -> Result<T, Error> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(Error::Closed)?;
        f(conn)
    }

    /// Atomically assign consecutive sequences to `chunks` and persist them.
    ///
    /// Retention pruning runs inside the same transaction.
    pub fn enqueue(&self, chunks: &[EventChunk]) -> Result<Vec<QueuedChunk>, Error> {
        let now = unix_time_secs();
        let retention = self.retention_seconds;
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let mut queued = Vec::with_capacity(chunks.len());
            for chunk in chunks {
                tx.execute(
                    r#"
                    INSERT INTO chunks (
                        event_id, chunk_index, chunk_count, compression,
                        payload, chunk_hash, event_hash, created_at,
                        logical_timestamp_ms, clock_skew_ms, attributes
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                    "#,
                    params![
                        chunk.event_id,
                        chunk.chunk_index,
                        chunk.chunk_count,
                        chunk.compression,
                        chunk.payload,
                        chunk.chunk_hash,
                        chunk.event_hash,
                        now,
                        chunk.logical_timestamp_ms,
                        chunk.clock_skew_ms,
                        serde_json::to_string(&chunk.attributes)?,
                    ],
                )?;
                queued.push(QueuedChunk {
                    sequence: tx.last_insert_rowid(),
                    event_id: chunk.event_id.clone(),
                    chunk_index: chunk.chunk_index,
                    chunk_count: chunk.chunk_count,
                    compression: chunk.compression.clone(),
                    payload: chunk.payload.clone(),
                    chunk_hash: chunk.chunk_hash.clone(),
                    event_hash: chunk.event_hash.clone(),
                    created_at: now,
                    logical_timestamp_ms: chunk.logical_timestamp_ms,
                    clock_skew_ms: chunk.clock_skew_ms,
                    attributes: chunk.attributes.clone(),
                });
            }
            tx.execute(
                "DELETE FROM chunks WHERE created_at < ?1",
                params![now - retention],
            )?;
            tx.commit()?;
            Ok(queued)
        })
    }

    /// Read rows with `sequence > since_sequence` in ascending order, bounded
    /// by `max_chunks` and by `max_bytes` of compressed payload.
    ///
    /// The first row is always included even when it alone exceeds
    /// `max_bytes`, so an oversize chunk can still make progress. Does not
    /// mutate.
    pub fn peek_window(
        &self,
        since_sequence: i64,
        max_chunks: u32,
        max_bytes: u64,
    ) -> Result<Vec<QueuedChunk>, Error> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT sequence, event_id, chunk_index, chunk_count, compression,
                       payload, chunk_hash, event_hash, created_at,
                       logical_timestamp_ms, clock_skew_ms, attributes
                FROM chunks
                WHERE sequence > ?1
                ORDER BY sequence ASC
                LIMIT ?2
                "#,
            )?;
            let rows = stmt
                .query_map(params![since_sequence, max_chunks as i64 * 2], QueuedChunk::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let mut window = Vec::new();
        let mut total_bytes = 0u64;
        for record in rows {
            let payload_bytes = record.payload_size() as u64;
            let limit_ok = if payload_bytes > max_bytes && window.is_empty() {
                true
            } else {
                total_bytes + payload_bytes <= max_bytes
            };
            if window.len() >= max_chunks as usize || !limit_ok {
                break;
            }
            total_bytes += payload_bytes;
            window.push(record);
        }
        Ok(window)
    }

    /// Delete the given sequences; missing ones are silently ignored.
    pub fn delete_sequences(&self, sequences: &[i64]) -> Result<usize, Error> {
        if sequences.is_empty() {
            return Ok(0);
        }
        self.with_conn(|conn| {
            let placeholders = vec!["?"; sequences.len()].join(",");
            let sql = format!("DELETE FROM chunks WHERE sequence IN ({placeholders})");
            let deleted = conn.execute(&sql, rusqlite::params_from_iter(sequences.iter()))?;
            Ok(deleted)
        })
    }

    pub fn queue_depth(&self) -> Result<i64, Error> {
        self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?)
        })
    }

    pub fn oldest_age_seconds(&self) -> Result<f64, Error> {
        self.with_conn(|conn| {
            let oldest: Option<f64> =
                conn.query_row("SELECT MIN(created_at) FROM chunks", [], |row| row.get(0))?;
            Ok(oldest.map(|t| (unix_time_secs() - t).max(0.0)).unwrap_or(0.0))
        })
    }

    pub fn last_sequence(&self) -> Result<i64, Error> {
        self.with_conn(|conn| {
            let last: Option<i64> =
                conn.query_row("SELECT MAX(sequence) FROM chunks", [], |row| row.get(0))?;
            Ok(last.unwrap_or(0))
        })
    }
}

fn init_schema(conn: &Connection) -> Result<(), Error> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            sequence             INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id             TEXT NOT NULL,
            chunk_index          INTEGER NOT NULL,
            chunk_count          INTEGER NOT NULL,
            compression          TEXT NOT NULL,
            payload              BLOB NOT NULL,
            chunk_hash           BLOB NOT NULL,
            event_hash           BLOB NOT NULL,
            created_at           REAL NOT NULL,
            logical_timestamp_ms INTEGER NOT NULL,
            clock_skew_ms        REAL NOT NULL,
            attributes           TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_chunks_event ON chunks(event_id, chunk_index);
        "#,
    )?;
    Ok(())
}

fn unix_time_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
