//! Server half of the pipeline: control, scheduling, ingest, snapshots.

pub mod control;
pub mod ingest;
pub mod offsets;
pub mod scheduler;
pub mod snapshot;
pub mod store;
pub mod stream;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{retention_seconds, ServerConfig};
use crate::error::Error;
use crate::wire::{ControlEnvelope, Heartbeat};

use control::{ControlHandler, ControlManager};
use ingest::{DashboardProvider, IngestService};
use offsets::OffsetTracker;
use scheduler::{RequestOverrides, RequestScheduler};
use snapshot::SnapshotCache;
use store::{ChunkStore, IngestResult};
use stream::SnapshotStreamer;

/// Pull policy: every heartbeat advances the offset tracker, and a non-empty
/// sensor queue triggers an immediate chunk request.
struct HeartbeatDrivenScheduler {
    offsets: Arc<OffsetTracker>,
    scheduler: Arc<RequestScheduler>,
}

#[async_trait]
impl ControlHandler for HeartbeatDrivenScheduler {
    async fn on_heartbeat(&self, sensor_id: &str, heartbeat: &Heartbeat) {
        self.offsets
            .update(sensor_id, heartbeat.last_committed_sequence);
        if heartbeat.queue_depth > 0 {
            self.scheduler
                .request_sensor(sensor_id, RequestOverrides::default())
                .await;
        }
    }

    async fn on_message(&self, sensor_id: &str, envelope: &ControlEnvelope) {
        debug!(sensor_id = %sensor_id, body_type = envelope.body.type_name(), "unhandled control message");
    }
}

fn dashboard_provider(
    cache: Arc<SnapshotCache>,
    offsets: Arc<OffsetTracker>,
) -> DashboardProvider {
    Arc::new(move || {
        let committed = offsets.all();
        let sensors: Vec<serde_json::Value> = cache
            .all()
            .values()
            .map(|snapshot| {
                serde_json::json!({
                    "sensor_id": snapshot.sensor_id,
                    "event_id": snapshot.event_id,
                    "logical_timestamp_ms": snapshot.logical_timestamp_ms,
                    "updated_at": snapshot.updated_at,
                    "last_committed_sequence":
                        committed.get(&snapshot.sensor_id).copied().unwrap_or(0),
                    "payload_json": snapshot.payload_json(),
                })
            })
            .collect();
        serde_json::json!({
            "sensors": sensors,
            "generated_at": crate::wire::utc_now_rfc3339(),
        })
    })
}

/// Run control, ingest, and stream services until ctrl-c.
pub async fn run(config: ServerConfig) -> Result<(), Error> {
    let store = Arc::new(ChunkStore::open(
        &config.store.path,
        retention_seconds(config.store.retention_hours),
    )?);
    info!(path = %config.store.path.display(), "chunk store opened");

    let offsets = Arc::new(OffsetTracker::new());
    let cache = Arc::new(SnapshotCache::new());
    let control = Arc::new(ControlManager::new());
    let scheduler = Arc::new(RequestScheduler::new(
        control.clone(),
        offsets.clone(),
        &config.scheduler,
    ));
    let streamer = Arc::new(SnapshotStreamer::new(
        cache.clone(),
        config.stream.token.clone(),
    ));

    let sensor_tokens = config.auth.token_map();
    if sensor_tokens.is_empty() {
        warn!("no sensor tokens configured; sensors will be rejected");
    }

    let shutdown = CancellationToken::new();

    // Completed ingests flow to the snapshot cache and then to observers.
    let (snapshot_tx, mut snapshot_rx) = mpsc::channel::<IngestResult>(100);
    let snapshot_cache = cache.clone();
    let snapshot_streamer = streamer.clone();
    let snapshot_task = tokio::spawn(async move {
        while let Some(result) = snapshot_rx.recv().await {
            if let Some(snapshot) = snapshot_cache.update_from_ingest(&result) {
                snapshot_streamer.broadcast(&snapshot).await;
            }
        }
    });

    let service = Arc::new(IngestService::new(
        store.clone(),
        control.clone(),
        offsets.clone(),
        sensor_tokens.clone(),
        Some(snapshot_tx),
        Some(dashboard_provider(cache.clone(), offsets.clone())),
        config.ingest.allowed_origins.clone(),
    ));

    let ingest_handle = {
        let service = service.clone();
        let shutdown = shutdown.clone();
        let bind = config.ingest.bind.clone();
        let port = config.ingest.port;
        tokio::spawn(async move {
            if let Err(e) = ingest::run_ingest_server(&bind, port, service, shutdown).await {
                error!("ingest server error: {e}");
            }
        })
    };

    let control_handle = {
        let manager = control.clone();
        let handler: Arc<dyn ControlHandler> = Arc::new(HeartbeatDrivenScheduler {
            offsets: offsets.clone(),
            scheduler: scheduler.clone(),
        });
        let shutdown = shutdown.clone();
        let bind = config.control.bind.clone();
        let port = config.control.port;
        tokio::spawn(async move {
            if let Err(e) =
                control::run_control_server(&bind, port, manager, sensor_tokens, handler, shutdown)
                    .await
            {
                error!("control server error: {e}");
            }
        })
    };

    let stream_handle = {
        let streamer = streamer.clone();
        let shutdown = shutdown.clone();
        let bind = config.stream.bind.clone();
        let port = config.stream.port;
        tokio::spawn(async move {
            if let Err(e) = streamer.run(&bind, port, shutdown).await {
                error!("snapshot stream error: {e}");
            }
        })
    };

    info!("pipeline server running");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down pipeline server");
        }
        _ = ingest_handle => error!("ingest server stopped unexpectedly"),
        _ = control_handle => error!("control server stopped unexpectedly"),
        _ = stream_handle => error!("stream server stopped unexpectedly"),
    }

    shutdown.cancel();
    drop(service);
    let _ = snapshot_task.await;
    store.close();
    Ok(())
}
