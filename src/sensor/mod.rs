//! Sensor half of the pipeline: durable queue, dispatcher, agent, transports.

pub mod agent;
pub mod dispatch;
pub mod queue;
pub mod time_sync;
pub mod transport;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::chunk::{chunk_payload, random_event_id, ChunkOptions};
use crate::config::{retention_seconds, SensorConfig};
use crate::error::Error;

use agent::SensorAgent;
use dispatch::ChunkDispatcher;
use queue::DurableQueue;
use time_sync::ClockSkewEstimator;
use transport::{HttpChunkSender, WebsocketControlChannel};

/// Run the sensor agent until ctrl-c.
pub async fn run(config: SensorConfig) -> Result<(), Error> {
    let queue = Arc::new(DurableQueue::open(
        &config.queue.path,
        retention_seconds(config.queue.retention_hours),
    )?);
    info!(path = %config.queue.path.display(), "sensor queue opened");

    let dispatcher = ChunkDispatcher::new(&config.sensor_id, queue.clone());

    let mut control_headers = config.control.headers.clone();
    control_headers
        .entry("X-Sensor-ID".to_string())
        .or_insert_with(|| config.sensor_id.clone());
    if !config.token.is_empty() {
        control_headers
            .entry("Authorization".to_string())
            .or_insert_with(|| format!("Bearer {}", config.token));
    }

    let control = WebsocketControlChannel::new(&config.control, control_headers);
    let chunk_sender = HttpChunkSender::new(&config.ingest, &config.token)?;
    let clock_skew = ClockSkewEstimator::new(&config.time_sync);

    let shutdown = CancellationToken::new();
    let mut agent = SensorAgent::new(
        &config.sensor_id,
        dispatcher,
        Box::new(control),
        Box::new(chunk_sender),
        config.software_version.clone(),
        Duration::from_secs_f64(config.heartbeat_interval),
        config.capabilities.clone(),
        clock_skew,
        shutdown.clone(),
    );

    let stopper = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down sensor agent");
            stopper.cancel();
        }
    });

    agent.run().await;
    queue.close();
    Ok(())
}

/// Chunk a payload file and append it to the durable queue.
///
/// Stand-in for the measurement exporters; returns the assigned sequences.
pub fn enqueue_payload(
    config: &SensorConfig,
    file: &Path,
    attributes: HashMap<String, String>,
) -> Result<Vec<i64>, Error> {
    let payload = std::fs::read(file)?;
    let queue = DurableQueue::open(
        &config.queue.path,
        retention_seconds(config.queue.retention_hours),
    )?;
    let chunks = chunk_payload(
        &payload,
        &random_event_id(),
        ChunkOptions {
            attributes,
            ..ChunkOptions::default()
        },
    )?;
    let queued = queue.enqueue(&chunks)?;
    let sequences = queued.iter().map(|c| c.sequence).collect();
    queue.close();
    Ok(sequences)
}

/// Point-in-time view of the durable queue.
#[derive(Debug, Clone, Copy)]
pub struct QueueStatus {
    pub depth: i64,
    pub oldest_age_seconds: f64,
    pub last_sequence: i64,
}

pub fn queue_status(config: &SensorConfig) -> Result<QueueStatus, Error> {
    let queue = DurableQueue::open(
        &config.queue.path,
        retention_seconds(config.queue.retention_hours),
    )?;
    let status = QueueStatus {
        depth: queue.queue_depth()?,
        oldest_age_seconds: queue.oldest_age_seconds()?,
        last_sequence: queue.last_sequence()?,
    };
    queue.close();
    Ok(status)
}
