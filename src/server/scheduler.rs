//! Policy layer that issues windowed chunk requests to connected sensors.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::future::join_all;
use tracing::debug;

use crate::config::SchedulerConfig;
use crate::wire::ChunkRequest;

use super::control::ControlManager;
use super::offsets::OffsetTracker;

/// Per-request overrides; unset fields fall back to configured defaults.
#[derive(Debug, Clone, Default)]
pub struct RequestOverrides {
    pub window_id: Option<String>,
    pub since_sequence: Option<i64>,
    pub max_chunks: Option<u32>,
    pub max_bytes: Option<u64>,
}

pub struct RequestScheduler {
    control: Arc<ControlManager>,
    offsets: Arc<OffsetTracker>,
    max_chunks: u32,
    max_bytes: u64,
    max_in_flight: u32,
}

impl RequestScheduler {
    pub fn new(
        control: Arc<ControlManager>,
        offsets: Arc<OffsetTracker>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            control,
            offsets,
            max_chunks: config.max_chunks,
            max_bytes: config.max_bytes,
            max_in_flight: config.max_in_flight,
        }
    }

    /// Issue one chunk request. `since_sequence` defaults to the last
    /// committed sequence, so progress resumes from acked state after a
    /// restart. Returns false when the sensor is offline.
    pub async fn request_sensor(&self, sensor_id: &str, overrides: RequestOverrides) -> bool {
        let window_id = overrides
            .window_id
            .unwrap_or_else(|| format!("{sensor_id}-{}", epoch_millis()));
        let since_sequence = overrides
            .since_sequence
            .unwrap_or_else(|| self.offsets.get(sensor_id));
        let request = ChunkRequest {
            since_sequence,
            max_chunks: overrides.max_chunks.unwrap_or(self.max_chunks),
            max_bytes: overrides.max_bytes.unwrap_or(self.max_bytes),
            window_id: window_id.clone(),
            max_in_flight: self.max_in_flight,
        };
        let sent = self.control.send_chunk_request(sensor_id, request).await;
        debug!(sensor_id = %sensor_id, window_id = %window_id, since_sequence, sent, "chunk request");
        sent
    }

    /// Fan a request out to each sensor concurrently.
    pub async fn request_sensors(&self, sensor_ids: &[String]) {
        join_all(
            sensor_ids
                .iter()
                .map(|id| self.request_sensor(id, RequestOverrides::default())),
        )
        .await;
    }
}

fn epoch_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
