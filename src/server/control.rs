//! Server-side control channel: session registry and WebSocket listener.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{constant_time_compare, extract_bearer};
use crate::error::Error;
use crate::wire::{ChunkAck, ChunkRequest, ControlBody, ControlEnvelope, Heartbeat};

/// Hooks invoked for inbound envelopes. The manager itself performs no
/// business logic.
#[async_trait]
pub trait ControlHandler: Send + Sync {
    async fn on_heartbeat(&self, _sensor_id: &str, _heartbeat: &Heartbeat) {}
    async fn on_message(&self, _sensor_id: &str, _envelope: &ControlEnvelope) {}
}

/// One live sensor connection; sends go through an outbound queue drained by
/// the connection's writer task.
pub struct ControlSession {
    pub sensor_id: String,
    outbound: mpsc::UnboundedSender<Message>,
}

impl ControlSession {
    pub fn new(sensor_id: impl Into<String>, outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            outbound,
        }
    }

    fn send_envelope(&self, envelope: &ControlEnvelope) -> Result<(), Error> {
        let raw = envelope.encode()?;
        self.outbound
            .send(Message::Text(raw))
            .map_err(|_| Error::transport("control session closed"))
    }
}

/// Registry mapping sensor id to its live control session.
#[derive(Default)]
pub struct ControlManager {
    sessions: tokio::sync::Mutex<HashMap<String, ControlSession>>,
}

impl ControlManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, session: ControlSession) {
        let sensor_id = session.sensor_id.clone();
        self.sessions.lock().await.insert(sensor_id.clone(), session);
        info!(sensor_id = %sensor_id, "sensor connected to control channel");
    }

    pub async fn unregister(&self, sensor_id: &str) {
        self.sessions.lock().await.remove(sensor_id);
        info!(sensor_id = %sensor_id, "sensor disconnected");
    }

    pub async fn connected_sensors(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    /// Send a chunk request; false when no live session exists. Callers
    /// treat false as "sensor offline" and do not retry.
    pub async fn send_chunk_request(&self, sensor_id: &str, request: ChunkRequest) -> bool {
        self.send_body(sensor_id, ControlBody::ChunkRequest(request))
            .await
    }

    /// Send an ack; false when no live session exists.
    pub async fn send_ack(
        &self,
        sensor_id: &str,
        sequences: Vec<i64>,
        window_id: String,
        reset_window: bool,
    ) -> bool {
        self.send_body(
            sensor_id,
            ControlBody::ChunkAck(ChunkAck {
                window_id,
                committed_sequences: sequences,
                reset_window,
            }),
        )
        .await
    }

    async fn send_body(&self, sensor_id: &str, body: ControlBody) -> bool {
        let sessions = self.sessions.lock().await;
        let Some(session) = sessions.get(sensor_id) else {
            return false;
        };
        match session.send_envelope(&ControlEnvelope::new(sensor_id, body)) {
            Ok(()) => true,
            Err(e) => {
                debug!(sensor_id = %sensor_id, "control send failed: {e}");
                false
            }
        }
    }
}

/// Accept sensor control connections until shutdown.
pub async fn run_control_server(
    bind: &str,
    port: u16,
    manager: Arc<ControlManager>,
    sensor_tokens: HashMap<String, String>,
    handler: Arc<dyn ControlHandler>,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let listener = TcpListener::bind((bind, port)).await?;
    info!(bind = %bind, port, "control server listening");
    let tokens = Arc::new(sensor_tokens);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "control connection accepted");
                    tokio::spawn(handle_control_socket(
                        stream,
                        manager.clone(),
                        tokens.clone(),
                        handler.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => warn!("control accept failed: {e}"),
            }
        }
    }
    Ok(())
}

async fn handle_control_socket(
    stream: TcpStream,
    manager: Arc<ControlManager>,
    tokens: Arc<HashMap<String, String>>,
    handler: Arc<dyn ControlHandler>,
    shutdown: CancellationToken,
) {
    let mut sensor_id: Option<String> = None;
    let mut bearer: Option<String> = None;
    let header_capture = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        sensor_id = request
            .headers()
            .get("X-Sensor-ID")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        bearer = request
            .headers()
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .map(|v| extract_bearer(Some(v)).to_string());
        Ok(response)
    };

    let mut websocket = match accept_hdr_async(stream, header_capture).await {
        Ok(websocket) => websocket,
        Err(e) => {
            debug!("control handshake failed: {e}");
            return;
        }
    };

    let Some(sensor_id) = sensor_id else {
        warn!("control connection missing X-Sensor-ID header");
        close_with(&mut websocket, CloseCode::Protocol, "missing sensor id").await;
        return;
    };
    let Some(expected) = tokens.get(&sensor_id) else {
        warn!(sensor_id = %sensor_id, "unexpected sensor attempted to connect");
        close_with(&mut websocket, CloseCode::Policy, "unauthorized sensor").await;
        return;
    };
    if !constant_time_compare(Some(expected), bearer.as_deref()) {
        warn!(sensor_id = %sensor_id, "invalid token");
        close_with(&mut websocket, CloseCode::Policy, "invalid token").await;
        return;
    }

    let (mut sink, mut source) = websocket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let pong_tx = tx.clone();
    manager
        .register(ControlSession::new(sensor_id.clone(), tx))
        .await;

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = pong_tx.send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "server shutdown".into(),
                })));
                break;
            }
            frame = source.next() => match frame {
                Some(Ok(Message::Text(raw))) => match ControlEnvelope::decode(&raw) {
                    Ok(envelope) => {
                        debug!(sensor_id = %sensor_id, body_type = envelope.body.type_name(), "control message");
                        match &envelope.body {
                            ControlBody::Heartbeat(heartbeat) => {
                                handler.on_heartbeat(&sensor_id, heartbeat).await;
                            }
                            _ => handler.on_message(&sensor_id, &envelope).await,
                        }
                    }
                    // Protocol errors drop the frame, not the connection.
                    Err(e) => warn!(sensor_id = %sensor_id, "dropping malformed envelope: {e}"),
                },
                Some(Ok(Message::Ping(payload))) => {
                    let _ = pong_tx.send(Message::Pong(payload));
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!(sensor_id = %sensor_id, "control channel closed");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    info!(sensor_id = %sensor_id, "control channel errored: {e}");
                    break;
                }
            }
        }
    }

    drop(pong_tx);
    manager.unregister(&sensor_id).await;
    let _ = writer.await;
}

async fn close_with(
    websocket: &mut WebSocketStream<TcpStream>,
    code: CloseCode,
    reason: &'static str,
) {
    let _ = websocket
        .close(Some(CloseFrame {
            code,
            reason: reason.into(),
        }))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_primitives_report_session_liveness() {
        let manager = ControlManager::new();
        let request = ChunkRequest {
            since_sequence: 0,
            max_chunks: 4,
            max_bytes: 1024,
            window_id: "w1".to_string(),
            max_in_flight: 4,
        };
        assert!(!manager.send_chunk_request("s1", request.clone()).await);

        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.register(ControlSession::new("s1", tx)).await;
        assert!(manager.send_chunk_request("s1", request).await);
        assert!(manager.send_ack("s1", vec![1, 2], "w1".to_string(), false).await);

        // Both envelopes were queued for the writer, tagged correctly.
        let first = rx.recv().await.unwrap();
        let Message::Text(raw) = first else { panic!("expected text frame") };
        let envelope = ControlEnvelope::decode(&raw).unwrap();
        assert!(matches!(envelope.body, ControlBody::ChunkRequest(_)));
        assert_eq!(envelope.sensor_id, "s1");

        let second = rx.recv().await.unwrap();
        let Message::Text(raw) = second else { panic!("expected text frame") };
        let envelope = ControlEnvelope::decode(&raw).unwrap();
        let ControlBody::ChunkAck(ack) = envelope.body else { panic!("expected ack") };
        assert_eq!(ack.committed_sequences, vec![1, 2]);

        manager.unregister("s1").await;
        assert!(!manager.send_ack("s1", vec![3], "w1".to_string(), false).await);
    }

    #[tokio::test]
    async fn test_send_fails_after_receiver_dropped() {
        let manager = ControlManager::new();
        let (tx, rx) = mpsc::unbounded_channel();
        manager.register(ControlSession::new("s1", tx)).await;
        drop(rx);
        assert!(!manager.send_ack("s1", vec![1], "w".to_string(), false).await);
    }
}
