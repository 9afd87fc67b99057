//! Snapshot fan-out to observer clients over WebSocket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{constant_time_compare, extract_bearer};
use crate::error::Error;

use super::snapshot::{Snapshot, SnapshotCache};

/// Broadcasts snapshot updates to every connected observer.
///
/// Ordering is per-sensor last-write-wins; a client that errors on send is
/// evicted. New observers receive a batch of all current snapshots before
/// streaming updates.
pub struct SnapshotStreamer {
    cache: Arc<SnapshotCache>,
    token: String,
    clients: tokio::sync::Mutex<HashMap<u64, mpsc::UnboundedSender<Message>>>,
    next_client_id: AtomicU64,
}

impl SnapshotStreamer {
    /// An empty `token` disables observer auth.
    pub fn new(cache: Arc<SnapshotCache>, token: String) -> Self {
        Self {
            cache,
            token,
            clients: tokio::sync::Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
        }
    }

    /// Accept observer connections until shutdown, then close every client.
    pub async fn run(
        self: Arc<Self>,
        bind: &str,
        port: u16,
        shutdown: CancellationToken,
    ) -> Result<(), Error> {
        let listener = TcpListener::bind((bind, port)).await?;
        info!(bind = %bind, port, "snapshot stream listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "observer connection accepted");
                        tokio::spawn(self.clone().handle_observer(stream, shutdown.clone()));
                    }
                    Err(e) => warn!("observer accept failed: {e}"),
                }
            }
        }
        self.close_all().await;
        Ok(())
    }

    async fn handle_observer(self: Arc<Self>, stream: TcpStream, shutdown: CancellationToken) {
        let mut bearer: Option<String> = None;
        let header_capture =
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                bearer = request
                    .headers()
                    .get("Authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(|v| extract_bearer(Some(v)).to_string());
                Ok(response)
            };

        let websocket = match accept_hdr_async(stream, header_capture).await {
            Ok(websocket) => websocket,
            Err(e) => {
                debug!("observer handshake failed: {e}");
                return;
            }
        };

        if !self.token.is_empty()
            && !constant_time_compare(Some(&self.token), bearer.as_deref())
        {
            warn!("unauthorized observer rejected");
            let mut websocket = websocket;
            let _ = websocket
                .close(Some(CloseFrame {
                    code: CloseCode::Policy,
                    reason: "unauthorized".into(),
                }))
                .await;
            return;
        }

        let (mut sink, mut source) = websocket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        self.clients.lock().await.insert(client_id, tx);
        debug!(client_id, "observer registered");

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Catch the new observer up on current state.
        self.broadcast_all().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = source.next() => match frame {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(client_id, "observer stream errored: {e}");
                        break;
                    }
                }
            }
        }

        self.clients.lock().await.remove(&client_id);
        let _ = writer.await;
        debug!(client_id, "observer disconnected");
    }

    /// Send one snapshot update to every client.
    pub async fn broadcast(&self, snapshot: &Snapshot) {
        let message = serde_json::json!({
            "type": "snapshot",
            "snapshot": serialize_snapshot(snapshot),
        });
        self.publish(message.to_string()).await;
    }

    /// Send all current snapshots as one batch message.
    pub async fn broadcast_all(&self) {
        let snapshots: Vec<serde_json::Value> = self
            .cache
            .all()
            .values()
            .map(serialize_snapshot)
            .collect();
        let message = serde_json::json!({
            "type": "snapshot_batch",
            "snapshots": snapshots,
        });
        self.publish(message.to_string()).await;
    }

    async fn publish(&self, message: String) {
        let mut clients = self.clients.lock().await;
        if clients.is_empty() {
            return;
        }
        let mut dead = Vec::new();
        for (client_id, tx) in clients.iter() {
            if tx.send(Message::Text(message.clone())).is_err() {
                dead.push(*client_id);
            }
        }
        for client_id in dead {
            clients.remove(&client_id);
            debug!(client_id, "evicted unreachable observer");
        }
    }

    /// Ask every client connection to close and drop the registry.
    pub async fn close_all(&self) {
        let mut clients = self.clients.lock().await;
        for (_, tx) in clients.drain() {
            let _ = tx.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "server shutdown".into(),
            })));
        }
    }
}

fn serialize_snapshot(snapshot: &Snapshot) -> serde_json::Value {
    serde_json::json!({
        "sensor_id": snapshot.sensor_id,
        "event_id": snapshot.event_id,
        "logical_timestamp_ms": snapshot.logical_timestamp_ms,
        "updated_at": snapshot.updated_at,
        "payload_base64": BASE64.encode(&snapshot.payload),
        "payload_json": snapshot.payload_json(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::store::IngestResult;

    fn streamer_with_snapshot() -> Arc<SnapshotStreamer> {
        let cache = Arc::new(SnapshotCache::new());
        cache.update_from_ingest(&IngestResult {
            stored: true,
            duplicate: false,
            sequence: 1,
            event_id: "e1".to_string(),
            sensor_id: "s1".to_string(),
            logical_timestamp_ms: 1_700_000_000_000,
            event_complete: true,
            assembled_payload: Some(b"{\"loss\":0.2}".to_vec()),
        });
        Arc::new(SnapshotStreamer::new(cache, String::new()))
    }

    async fn register_client(
        streamer: &SnapshotStreamer,
        id: u64,
    ) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        streamer.clients.lock().await.insert(id, tx);
        rx
    }

    #[tokio::test]
    async fn test_broadcast_all_sends_batch_with_payload_projections() {
        let streamer = streamer_with_snapshot();
        let mut rx = register_client(&streamer, 1).await;

        streamer.broadcast_all().await;
        let Message::Text(raw) = rx.recv().await.unwrap() else { panic!("expected text") };
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["type"], "snapshot_batch");
        let snapshot = &value["snapshots"][0];
        assert_eq!(snapshot["sensor_id"], "s1");
        assert_eq!(snapshot["payload_json"]["loss"], 0.2);
        assert_eq!(
            BASE64.decode(snapshot["payload_base64"].as_str().unwrap()).unwrap(),
            b"{\"loss\":0.2}"
        );
    }

    #[tokio::test]
    async fn test_unreachable_clients_are_evicted() {
        let streamer = streamer_with_snapshot();
        let rx = register_client(&streamer, 1).await;
        let mut live_rx = register_client(&streamer, 2).await;
        drop(rx);

        let snapshot = streamer.cache.get("s1").unwrap();
        streamer.broadcast(&snapshot).await;

        assert_eq!(streamer.clients.lock().await.len(), 1);
        let Message::Text(raw) = live_rx.recv().await.unwrap() else { panic!("expected text") };
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["type"], "snapshot");
        assert_eq!(value["snapshot"]["event_id"], "e1");
    }
}
