//! The sensor agent: control loop, heartbeats, chunk retry, shutdown.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::error::Error;
use crate::wire::{ControlBody, ControlEnvelope, DataChunk, Heartbeat};

use super::dispatch::ChunkDispatcher;
use super::time_sync::ClockSkewEstimator;

/// Full-duplex control stream to the server.
///
/// One production impl (WebSocket) plus test doubles. Implementations use
/// interior mutability so receive and send can interleave.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    async fn recv(&self) -> Result<ControlEnvelope, Error>;
    async fn send(&self, envelope: &ControlEnvelope) -> Result<(), Error>;
    async fn close(&self);
}

/// Outbound path for data chunks.
#[async_trait]
pub trait ChunkSender: Send + Sync {
    async fn send_chunk(&self, chunk: &DataChunk) -> Result<(), Error>;
}

pub struct SensorAgent {
    sensor_id: String,
    dispatcher: ChunkDispatcher,
    control: Box<dyn ControlChannel>,
    chunk_sender: Box<dyn ChunkSender>,
    software_version: String,
    heartbeat_interval: Duration,
    capabilities: Vec<String>,
    clock_skew: ClockSkewEstimator,
    backoff: ExponentialBackoff,
    shutdown: CancellationToken,
}

impl SensorAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sensor_id: impl Into<String>,
        dispatcher: ChunkDispatcher,
        control: Box<dyn ControlChannel>,
        chunk_sender: Box<dyn ChunkSender>,
        software_version: impl Into<String>,
        heartbeat_interval: Duration,
        capabilities: Vec<String>,
        clock_skew: ClockSkewEstimator,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            dispatcher,
            control,
            chunk_sender,
            software_version: software_version.into(),
            heartbeat_interval,
            capabilities,
            clock_skew,
            backoff: ExponentialBackoff::default(),
            shutdown,
        }
    }

    pub fn dispatcher(&self) -> &ChunkDispatcher {
        &self.dispatcher
    }

    /// Drive the control loop until the shutdown token fires.
    ///
    /// The channel connects lazily on the first send; the initial heartbeat
    /// doubles as the handshake. Receive failures close the channel, wait
    /// out a backoff interval, and redo the handshake.
    pub async fn run(&mut self) {
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut handshake_pending = true;

        while !self.shutdown.is_cancelled() {
            if handshake_pending {
                if let Err(e) = self.send_heartbeat().await {
                    warn!(sensor_id = %self.sensor_id, "handshake failed: {e}");
                    self.control.close().await;
                    if !self.reconnect_delay().await {
                        break;
                    }
                    continue;
                }
                handshake_pending = false;
                heartbeat.reset();
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = heartbeat.tick() => {
                    // Best effort; the next tick retries.
                    if let Err(e) = self.send_heartbeat().await {
                        warn!(sensor_id = %self.sensor_id, "failed to send heartbeat: {e}");
                    }
                }
                result = self.control.recv() => match result {
                    Ok(envelope) => {
                        self.backoff.reset();
                        self.handle_control(envelope).await;
                    }
                    Err(e) => {
                        warn!(sensor_id = %self.sensor_id, "control channel receive failed: {e}");
                        self.control.close().await;
                        if !self.reconnect_delay().await {
                            break;
                        }
                        handshake_pending = true;
                    }
                }
            }
        }

        self.control.close().await;
        info!(sensor_id = %self.sensor_id, "sensor agent stopped");
    }

    /// Sleep out the current backoff interval; false when shutdown fired.
    async fn reconnect_delay(&mut self) -> bool {
        let delay = self.backoff.next_interval();
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn handle_control(&mut self, envelope: ControlEnvelope) {
        match envelope.body {
            ControlBody::ChunkRequest(request) => {
                let chunks = match self.dispatcher.build_chunks(&request) {
                    Ok(chunks) => chunks,
                    Err(e) => {
                        warn!(window_id = %request.window_id, "failed to build chunks: {e}");
                        return;
                    }
                };
                if chunks.is_empty() {
                    debug!(
                        window_id = %request.window_id,
                        since_sequence = request.since_sequence,
                        "no chunks for request"
                    );
                    return;
                }
                for chunk in chunks {
                    self.send_chunk_with_backoff(&chunk).await;
                }
            }
            ControlBody::ChunkAck(ack) => match self.dispatcher.handle_ack(&ack) {
                Ok(stats) => debug!(
                    window_id = %ack.window_id,
                    deleted = stats.deleted,
                    remaining = stats.remaining,
                    "ack processed"
                ),
                Err(e) => warn!(window_id = %ack.window_id, "failed to apply ack: {e}"),
            },
            ControlBody::Heartbeat(hb) => {
                debug!(last_committed = hb.last_committed_sequence, "received server heartbeat");
            }
            ControlBody::CommandResponse(resp) => {
                info!(command_id = %resp.command_id, success = resp.success, "server acked command");
            }
        }
    }

    /// Retry one chunk until it lands or shutdown fires. Chunks are never
    /// dropped here; unacked sequences stay queued for retransmission.
    async fn send_chunk_with_backoff(&mut self, chunk: &DataChunk) {
        let mut backoff = ExponentialBackoff::default();
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            match self.chunk_sender.send_chunk(chunk).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(sequence = chunk.sequence, "failed to send chunk, retrying: {e}");
                    let delay = backoff.next_interval();
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn send_heartbeat(&mut self) -> Result<(), Error> {
        let clock_skew_ms = self.clock_skew.estimate().await;
        let heartbeat = Heartbeat {
            software_version: self.software_version.clone(),
            last_committed_sequence: self.dispatcher.last_ack_sequence(),
            queue_depth: self.dispatcher.queue_depth()?,
            clock_skew_ms,
        };
        let envelope = ControlEnvelope::new(&self.sensor_id, ControlBody::Heartbeat(heartbeat))
            .with_capabilities(self.capabilities.clone());
        self.control.send(&envelope).await
    }
}
