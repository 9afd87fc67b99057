//! Deduplicating ingest store: the server's record of truth.
//!
//! Two tables: `chunks` keyed by `(sensor_id, sequence)` and `events` keyed
//! by `(sensor_id, event_id)`. Ingest verifies the chunk hash, deduplicates
//! by sequence, tracks per-event arrival counts, and assembles the event the
//! moment the last chunk lands, all inside one transaction.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::chunk::{gzip_decompress, sha256, GZIP};
use crate::error::Error;
use crate::wire::DataChunk;

/// Outcome of one chunk ingest.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestResult {
    pub stored: bool,
    pub duplicate: bool,
    pub sequence: i64,
    pub event_id: String,
    pub sensor_id: String,
    pub logical_timestamp_ms: i64,
    pub event_complete: bool,
    pub assembled_payload: Option<Vec<u8>>,
}

pub struct ChunkStore {
    conn: Mutex<Option<Connection>>,
    retention_seconds: f64,
}

impl ChunkStore {
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

    /// Ingest one chunk.
    ///
    /// Duplicates by `(sensor_id, sequence)` return without mutation. A hash
    /// or metadata mismatch fails the whole transaction, so a rejected chunk
    /// is neither stored nor counted.
    pub fn ingest(&self, chunk: &DataChunk) -> Result<IngestResult, Error> {
        if chunk.compression != GZIP {
            return Err(Error::invalid_argument(format!(
                "unsupported compression {}",
                chunk.compression
            )));
        }
        let digest = sha256(&chunk.payload);
        if digest != chunk.chunk_sha256 {
            return Err(Error::integrity(format!(
                "chunk hash mismatch for sequence {}: expected {} got {}",
                chunk.sequence,
                hex::encode(&chunk.chunk_sha256),
                hex::encode(&digest),
            )));
        }

        let now = unix_time_secs();
        let retention = self.retention_seconds;
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;

            let exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM chunks WHERE sensor_id = ?1 AND sequence = ?2",
                    params![chunk.sensor_id, chunk.sequence],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                let event_complete = event_complete(&tx, &chunk.sensor_id, &chunk.event_id)?;
                return Ok(IngestResult {
                    stored: false,
                    duplicate: true,
                    sequence: chunk.sequence,
                    event_id: chunk.event_id.clone(),
                    sensor_id: chunk.sensor_id.clone(),
                    logical_timestamp_ms: chunk.logical_timestamp_ms,
                    event_complete,
                    assembled_payload: None,
                });
            }

            tx.execute(
                r#"
                INSERT INTO chunks (
                    sensor_id, sequence, event_id, chunk_index, chunk_count,
                    compression, payload, chunk_sha256, event_sha256,
                    created_at, logical_timestamp_ms, clock_skew_ms, attributes
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                "#,
                params![
                    chunk.sensor_id,
                    chunk.sequence,
                    chunk.event_id,
                    chunk.chunk_index,
                    chunk.chunk_count,
                    chunk.compression,
                    chunk.payload,
                    chunk.chunk_sha256,
                    chunk.event_sha256,
                    chunk.created_at,
                    chunk.logical_timestamp_ms,
                    chunk.clock_skew_ms,
                    serde_json::to_string(&chunk.attributes)?,
                ],
            )?;

            let event_row: Option<(u32, Vec<u8>, u32)> = tx
                .query_row(
                    r#"
                    SELECT chunk_count, event_sha256, received_chunks
                    FROM events
                    WHERE sensor_id = ?1 AND event_id = ?2
                    "#,
                    params![chunk.sensor_id, chunk.event_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            let received = match event_row {
                Some((existing_count, existing_hash, received)) => {
                    if existing_hash != chunk.event_sha256 {
                        return Err(Error::integrity(format!(
                            "event hash mismatch for event {}",
                            chunk.event_id
                        )));
                    }
                    if existing_count != chunk.chunk_count {
                        return Err(Error::integrity(format!(
                            "chunk count mismatch for event {}: expected {} got {}",
                            chunk.event_id, existing_count, chunk.chunk_count
                        )));
                    }
                    let received = received + 1;
                    tx.execute(
                        r#"
                        UPDATE events SET received_chunks = ?1, updated_at = ?2
                        WHERE sensor_id = ?3 AND event_id = ?4
                        "#,
                        params![received, now, chunk.sensor_id, chunk.event_id],
                    )?;
                    received
                }
                None => {
                    tx.execute(
                        r#"
                        INSERT INTO events (
                            sensor_id, event_id, chunk_count, event_sha256,
                            received_chunks, logical_timestamp_ms, clock_skew_ms,
                            created_at, updated_at
                        ) VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?7, ?7)
                        "#,
                        params![
                            chunk.sensor_id,
                            chunk.event_id,
                            chunk.chunk_count,
                            chunk.event_sha256,
                            chunk.logical_timestamp_ms,
                            chunk.clock_skew_ms,
                            now,
                        ],
                    )?;
                    1
                }
            };

            let complete = received >= chunk.chunk_count;
            let mut assembled_payload = None;
            if complete {
                tx.execute(
                    r#"
                    UPDATE events SET completed_at = ?1, updated_at = ?1
                    WHERE sensor_id = ?2 AND event_id = ?3
                    "#,
                    params![now, chunk.sensor_id, chunk.event_id],
                )?;
                let assembled = assemble_event(&tx, &chunk.sensor_id, &chunk.event_id)?;
                let assembled_digest = sha256(&assembled);
                if assembled_digest != chunk.event_sha256 {
                    return Err(Error::integrity(format!(
                        "assembled payload hash mismatch for event {}: expected {} got {}",
                        chunk.event_id,
                        hex::encode(&chunk.event_sha256),
                        hex::encode(&assembled_digest),
                    )));
                }
                assembled_payload = Some(assembled);
            }

            prune(&tx, now - retention)?;
            tx.commit()?;

            Ok(IngestResult {
                stored: true,
                duplicate: false,
                sequence: chunk.sequence,
                event_id: chunk.event_id.clone(),
                sensor_id: chunk.sensor_id.clone(),
                logical_timestamp_ms: chunk.logical_timestamp_ms,
                event_complete: complete,
                assembled_payload,
            })
        })
    }

    /// Number of stored chunk rows for a sensor.
    pub fn chunk_count(&self, sensor_id: &str) -> Result<i64, Error> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM chunks WHERE sensor_id = ?1",
                params![sensor_id],
                |row| row.get(0),
            )?)
        })
    }

    /// Arrival count recorded for one event, if the row still exists.
    pub fn received_chunks(&self, sensor_id: &str, event_id: &str) -> Result<Option<u32>, Error> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT received_chunks FROM events WHERE sensor_id = ?1 AND event_id = ?2",
                    params![sensor_id, event_id],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }
}

fn event_complete(conn: &Connection, sensor_id: &str, event_id: &str) -> Result<bool, Error> {
    let completed_at: Option<Option<f64>> = conn
        .query_row(
            "SELECT completed_at FROM events WHERE sensor_id = ?1 AND event_id = ?2",
            params![sensor_id, event_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(matches!(completed_at, Some(Some(_))))
}

/// Decompress chunks in `chunk_index` order and concatenate.
fn assemble_event(conn: &Connection, sensor_id: &str, event_id: &str) -> Result<Vec<u8>, Error> {
    let mut stmt = conn.prepare(
        r#"
        SELECT payload, compression FROM chunks
        WHERE sensor_id = ?1 AND event_id = ?2
        ORDER BY chunk_index ASC
        "#,
    )?;
    let rows = stmt
        .query_map(params![sensor_id, event_id], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut assembled = Vec::new();
    for (payload, compression) in rows {
        if compression != GZIP {
            return Err(Error::invalid_argument(format!(
                "unsupported compression {compression}"
            )));
        }
        assembled.extend(gzip_decompress(&payload)?);
    }
    Ok(assembled)
}

/// Drop completed events older than the cutoff, chunks first so the join
/// still sees the event rows.
fn prune(conn: &Connection, cutoff: f64) -> Result<(), Error> {
    conn.execute(
        r#"
        DELETE FROM chunks WHERE (sensor_id, event_id) IN (
            SELECT sensor_id, event_id FROM events
            WHERE completed_at IS NOT NULL AND completed_at < ?1
        )
        "#,
        params![cutoff],
    )?;
    conn.execute(
        "DELETE FROM events WHERE completed_at IS NOT NULL AND completed_at < ?1",
        params![cutoff],
    )?;
    Ok(())
}

fn init_schema(conn: &Connection) -> Result<(), Error> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            sensor_id            TEXT NOT NULL,
            sequence             INTEGER NOT NULL,
            event_id             TEXT NOT NULL,
            chunk_index          INTEGER NOT NULL,
            chunk_count          INTEGER NOT NULL,
            compression          TEXT NOT NULL,
            payload              BLOB NOT NULL,
            chunk_sha256         BLOB NOT NULL,
            event_sha256         BLOB NOT NULL,
            created_at           TEXT NOT NULL,
            logical_timestamp_ms INTEGER NOT NULL,
            clock_skew_ms        REAL NOT NULL,
            attributes           TEXT NOT NULL,
            PRIMARY KEY (sensor_id, sequence)
        );

        CREATE TABLE IF NOT EXISTS events (
            sensor_id            TEXT NOT NULL,
            event_id             TEXT NOT NULL,
            chunk_count          INTEGER NOT NULL,
            event_sha256         BLOB NOT NULL,
            received_chunks      INTEGER NOT NULL,
            logical_timestamp_ms INTEGER NOT NULL,
            clock_skew_ms        REAL NOT NULL,
            created_at           REAL NOT NULL,
            updated_at           REAL NOT NULL,
            completed_at         REAL,
            PRIMARY KEY (sensor_id, event_id)
        );

        CREATE INDEX IF NOT EXISTS idx_chunks_event
        ON chunks(sensor_id, event_id, chunk_index);
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
