//! Most recent assembled payload per sensor.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use super::store::IngestResult;

/// Last fully assembled event payload for one sensor. Replaced wholesale;
/// no history is retained.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub sensor_id: String,
    pub event_id: String,
    pub payload: Vec<u8>,
    pub logical_timestamp_ms: i64,
    pub updated_at: f64,
}

impl Snapshot {
    /// Best-effort JSON view of the payload; `{}` when it is not JSON.
    pub fn payload_json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or_else(|_| serde_json::json!({}))
    }
}

#[derive(Default)]
pub struct SnapshotCache {
    snapshots: Mutex<HashMap<String, Snapshot>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the assembled payload of a completed ingest; returns the new
    /// snapshot, or `None` when the result did not complete an event.
    pub fn update_from_ingest(&self, result: &IngestResult) -> Option<Snapshot> {
        if !result.event_complete {
            return None;
        }
        let payload = result.assembled_payload.clone()?;
        let snapshot = Snapshot {
            sensor_id: result.sensor_id.clone(),
            event_id: result.event_id.clone(),
            payload,
            logical_timestamp_ms: result.logical_timestamp_ms,
            updated_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
        };
        self.snapshots
            .lock()
            .insert(snapshot.sensor_id.clone(), snapshot.clone());
        Some(snapshot)
    }

    pub fn get(&self, sensor_id: &str) -> Option<Snapshot> {
        self.snapshots.lock().get(sensor_id).cloned()
    }

    pub fn all(&self) -> HashMap<String, Snapshot> {
        self.snapshots.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(complete: bool, payload: Option<Vec<u8>>) -> IngestResult {
        IngestResult {
            stored: true,
            duplicate: false,
            sequence: 1,
            event_id: "e1".to_string(),
            sensor_id: "s1".to_string(),
            logical_timestamp_ms: 1_700_000_000_000,
            event_complete: complete,
            assembled_payload: payload,
        }
    }

    #[test]
    fn test_incomplete_ingest_is_ignored() {
        let cache = SnapshotCache::new();
        assert!(cache.update_from_ingest(&result(false, None)).is_none());
        assert!(cache.update_from_ingest(&result(true, None)).is_none());
        assert!(cache.get("s1").is_none());
    }

    #[test]
    fn test_snapshot_replaced_wholesale() {
        let cache = SnapshotCache::new();
        cache
            .update_from_ingest(&result(true, Some(b"{\"rtt\":10}".to_vec())))
            .unwrap();
        let snapshot = cache
            .update_from_ingest(&result(true, Some(b"{\"rtt\":20}".to_vec())))
            .unwrap();
        assert_eq!(cache.all().len(), 1);
        assert_eq!(cache.get("s1").unwrap().payload, snapshot.payload);
        assert_eq!(snapshot.payload_json()["rtt"], 20);
    }

    #[test]
    fn test_non_json_payload_projects_to_empty_object() {
        let cache = SnapshotCache::new();
        let snapshot = cache
            .update_from_ingest(&result(true, Some(vec![0xff, 0xfe])))
            .unwrap();
        assert_eq!(snapshot.payload_json(), serde_json::json!({}));
    }
}
