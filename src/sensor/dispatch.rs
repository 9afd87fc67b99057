//! Request/ack handling between the durable queue and the wire.
//!
//! Tracks which sequences are attributed to which server window and turns
//! incoming [`ChunkRequest`]s into outbound [`DataChunk`]s. Not thread-safe:
//! owned and driven solely by the agent task.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::error::Error;
use crate::wire::{ChunkAck, ChunkRequest, DataChunk, SCHEMA_VERSION};

use super::queue::{DurableQueue, QueuedChunk};

/// Outcome of applying one ack, for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckStats {
    pub deleted: usize,
    pub remaining: i64,
}

pub struct ChunkDispatcher {
    sensor_id: String,
    queue: Arc<DurableQueue>,
    windows: HashMap<String, HashSet<i64>>,
    in_flight: HashMap<i64, String>,
    last_ack_sequence: i64,
}

impl ChunkDispatcher {
    pub fn new(sensor_id: impl Into<String>, queue: Arc<DurableQueue>) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            queue,
            windows: HashMap::new(),
            in_flight: HashMap::new(),
            last_ack_sequence: 0,
        }
    }

    pub fn last_ack_sequence(&self) -> i64 {
        self.last_ack_sequence
    }

    pub fn queue_depth(&self) -> Result<i64, Error> {
        self.queue.queue_depth()
    }

    fn track_window(&mut self, window_id: &str, sequence: i64) {
        self.windows
            .entry(window_id.to_string())
            .or_default()
            .insert(sequence);
        self.in_flight.insert(sequence, window_id.to_string());
    }

    fn release_sequence(&mut self, sequence: i64) {
        let Some(window_id) = self.in_flight.remove(&sequence) else {
            return;
        };
        if let Some(sequences) = self.windows.get_mut(&window_id) {
            sequences.remove(&sequence);
            if sequences.is_empty() {
                self.windows.remove(&window_id);
            }
        }
    }

    /// Select queued chunks for `request` and attribute them to its window.
    pub fn build_chunks(&mut self, request: &ChunkRequest) -> Result<Vec<DataChunk>, Error> {
        let records = self.queue.peek_window(
            request.since_sequence,
            request.max_chunks,
            request.max_bytes,
        )?;

        let mut to_send = Vec::new();
        for record in records {
            if let Some(window_id) = self.in_flight.get(&record.sequence) {
                if window_id != &request.window_id {
                    // Attributed to another window; let the server resolve
                    // via retry/ack before resending.
                    continue;
                }
            }

            if request.max_in_flight > 0 && self.in_flight.len() >= request.max_in_flight as usize
            {
                break;
            }

            let sequence = record.sequence;
            let mut chunk = self.to_data_chunk(record);
            chunk
                .attributes
                .insert("window_id".to_string(), request.window_id.clone());
            to_send.push(chunk);
            self.track_window(&request.window_id, sequence);
        }
        Ok(to_send)
    }

    fn to_data_chunk(&self, record: QueuedChunk) -> DataChunk {
        let created_at = chrono::DateTime::from_timestamp(record.created_at as i64, 0)
            .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
            .unwrap_or_default();
        DataChunk {
            schema_version: SCHEMA_VERSION.to_string(),
            sensor_id: self.sensor_id.clone(),
            event_id: record.event_id,
            sequence: record.sequence,
            chunk_index: record.chunk_index,
            chunk_count: record.chunk_count,
            compression: record.compression,
            payload: record.payload,
            chunk_sha256: record.chunk_hash,
            event_sha256: record.event_hash,
            created_at,
            logical_timestamp_ms: record.logical_timestamp_ms,
            clock_skew_ms: record.clock_skew_ms,
            attributes: record.attributes,
        }
    }

    /// Apply one ack: delete committed rows, release their in-flight
    /// entries, and advance the high-water mark. Idempotent.
    pub fn handle_ack(&mut self, ack: &ChunkAck) -> Result<AckStats, Error> {
        let committed: Vec<i64> = ack
            .committed_sequences
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        if ack.reset_window {
            // Drops only the window descriptor; in-flight entries are
            // released solely by acks naming their sequences.
            self.windows.remove(&ack.window_id);
        }

        let deleted = self.queue.delete_sequences(&committed)?;
        for &sequence in &committed {
            self.release_sequence(sequence);
        }
        if let Some(&last) = committed.last() {
            self.last_ack_sequence = self.last_ack_sequence.max(last);
        }
        Ok(AckStats {
            deleted,
            remaining: self.queue.queue_depth()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{chunk_payload, random_event_id, ChunkOptions};
    use tempfile::tempdir;

    fn make_queue(dir: &tempfile::TempDir) -> Arc<DurableQueue> {
        Arc::new(DurableQueue::open(&dir.path().join("queue.db"), 3600.0).unwrap())
    }

    fn enqueue_payload(queue: &DurableQueue, len: usize) -> Vec<i64> {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let chunks = chunk_payload(&payload, &random_event_id(), ChunkOptions::default()).unwrap();
        queue
            .enqueue(&chunks)
            .unwrap()
            .iter()
            .map(|c| c.sequence)
            .collect()
    }

    fn request(window_id: &str) -> ChunkRequest {
        ChunkRequest {
            since_sequence: 0,
            max_chunks: 8,
            max_bytes: 2 * 1024 * 1024,
            window_id: window_id.to_string(),
            max_in_flight: 8,
        }
    }

    #[test]
    fn test_build_chunks_and_handle_ack() {
        let dir = tempdir().unwrap();
        let queue = make_queue(&dir);
        let sequences = enqueue_payload(&queue, 200_000);
        let mut dispatcher = ChunkDispatcher::new("sensor-xyz", queue.clone());

        let chunks = dispatcher.build_chunks(&request("w1")).unwrap();
        assert_eq!(chunks.len(), sequences.len());
        assert_eq!(chunks[0].sensor_id, "sensor-xyz");
        assert_eq!(chunks[0].attributes["window_id"], "w1");
        assert!(!chunks[0].created_at.is_empty());

        let ack = ChunkAck {
            window_id: "w1".to_string(),
            committed_sequences: sequences.clone(),
            reset_window: false,
        };
        let stats = dispatcher.handle_ack(&ack).unwrap();
        assert_eq!(stats.deleted, sequences.len());
        assert_eq!(stats.remaining, 0);
        assert_eq!(dispatcher.last_ack_sequence(), *sequences.last().unwrap());
    }

    #[test]
    fn test_ack_is_idempotent() {
        let dir = tempdir().unwrap();
        let queue = make_queue(&dir);
        let sequences = enqueue_payload(&queue, 100_000);
        let mut dispatcher = ChunkDispatcher::new("s1", queue.clone());
        dispatcher.build_chunks(&request("w1")).unwrap();

        let ack = ChunkAck {
            window_id: "w1".to_string(),
            committed_sequences: sequences.clone(),
            reset_window: false,
        };
        let first = dispatcher.handle_ack(&ack).unwrap();
        assert_eq!(first.deleted, sequences.len());
        let high_water = dispatcher.last_ack_sequence();

        let second = dispatcher.handle_ack(&ack).unwrap();
        assert_eq!(second.deleted, 0);
        assert_eq!(second.remaining, 0);
        assert_eq!(dispatcher.last_ack_sequence(), high_water);
    }

    #[test]
    fn test_in_flight_rows_skip_other_windows() {
        let dir = tempdir().unwrap();
        let queue = make_queue(&dir);
        enqueue_payload(&queue, 100_000);
        let mut dispatcher = ChunkDispatcher::new("s1", queue.clone());

        let first = dispatcher.build_chunks(&request("w1")).unwrap();
        assert_eq!(first.len(), 1);
        // Same rows requested under a different window are withheld.
        let second = dispatcher.build_chunks(&request("w2")).unwrap();
        assert!(second.is_empty());
        // The owning window may resend them.
        let again = dispatcher.build_chunks(&request("w1")).unwrap();
        assert_eq!(again.len(), 1);
    }

    #[test]
    fn test_max_in_flight_caps_selection() {
        let dir = tempdir().unwrap();
        let queue = make_queue(&dir);
        enqueue_payload(&queue, 300_000);
        let mut dispatcher = ChunkDispatcher::new("s1", queue.clone());

        let mut req = request("w1");
        req.max_in_flight = 2;
        let chunks = dispatcher.build_chunks(&req).unwrap();
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn test_reset_window_drops_descriptor_only() {
        let dir = tempdir().unwrap();
        let queue = make_queue(&dir);
        enqueue_payload(&queue, 100_000);
        let mut dispatcher = ChunkDispatcher::new("s1", queue.clone());
        dispatcher.build_chunks(&request("w1")).unwrap();

        let ack = ChunkAck {
            window_id: "w1".to_string(),
            committed_sequences: vec![],
            reset_window: true,
        };
        dispatcher.handle_ack(&ack).unwrap();

        // The sequence stays flagged in-flight under w1, so another window
        // still cannot claim it.
        let other = dispatcher.build_chunks(&request("w2")).unwrap();
        assert!(other.is_empty());
    }
}
