//! Production transports: WebSocket control channel and HTTP chunk sender.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{
    connect_async, connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{info, warn};

use crate::config::{ControlClientConfig, IngestClientConfig, TlsClientConfig};
use crate::error::Error;
use crate::wire::{ControlEnvelope, DataChunk};

use super::agent::{ChunkSender, ControlChannel};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Lazily connecting WebSocket control channel.
///
/// The read and write halves sit behind separate locks so a pending receive
/// never blocks an outgoing heartbeat. When the link idles longer than
/// `ping_interval`, a protocol ping is sent and traffic must arrive within
/// `ping_timeout`.
pub struct WebsocketControlChannel {
    url: String,
    headers: HashMap<String, String>,
    tls: TlsClientConfig,
    ping_interval: Duration,
    ping_timeout: Duration,
    write: tokio::sync::Mutex<Option<WsSink>>,
    read: tokio::sync::Mutex<Option<WsSource>>,
}

impl WebsocketControlChannel {
    pub fn new(config: &ControlClientConfig, headers: HashMap<String, String>) -> Self {
        Self {
            url: config.url.clone(),
            headers,
            tls: config.tls.clone(),
            ping_interval: Duration::from_secs_f64(config.ping_interval),
            ping_timeout: Duration::from_secs_f64(config.ping_timeout),
            write: tokio::sync::Mutex::new(None),
            read: tokio::sync::Mutex::new(None),
        }
    }

    async fn ensure_connected(&self) -> Result<(), Error> {
        let mut write = self.write.lock().await;
        if write.is_some() {
            return Ok(());
        }

        let mut request = self.url.as_str().into_client_request()?;
        for (key, value) in &self.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| Error::invalid_config(format!("bad header name {key}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::invalid_config(format!("bad header value for {key}: {e}")))?;
            request.headers_mut().insert(name, value);
        }

        info!(url = %self.url, "connecting control channel");
        let (stream, _response) = match build_tls_connector(&self.tls)? {
            Some(connector) => {
                connect_async_tls_with_config(request, None, false, Some(connector)).await?
            }
            None => connect_async(request).await?,
        };
        let (sink, source) = stream.split();
        *write = Some(sink);
        *self.read.lock().await = Some(source);
        Ok(())
    }

    async fn send_message(&self, message: Message) -> Result<(), Error> {
        let mut guard = self.write.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| Error::transport("control channel not connected"))?;
        sink.send(message).await?;
        Ok(())
    }

    /// Wait for the next frame, pinging through idle periods.
    async fn next_frame(&self) -> Result<Message, Error> {
        let mut guard = self.read.lock().await;
        let source = guard
            .as_mut()
            .ok_or_else(|| Error::transport("control channel not connected"))?;

        match tokio::time::timeout(self.ping_interval, source.next()).await {
            Ok(frame) => flatten_frame(frame),
            Err(_) => {
                self.send_message(Message::Ping(Vec::new())).await?;
                match tokio::time::timeout(self.ping_timeout, source.next()).await {
                    Ok(frame) => flatten_frame(frame),
                    Err(_) => Err(Error::transport("control ping timed out")),
                }
            }
        }
    }

    async fn reset(&self) {
        *self.write.lock().await = None;
        *self.read.lock().await = None;
    }
}

fn flatten_frame(
    frame: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
) -> Result<Message, Error> {
    match frame {
        Some(Ok(message)) => Ok(message),
        Some(Err(e)) => Err(e.into()),
        None => Err(Error::transport("control channel closed")),
    }
}

#[async_trait]
impl ControlChannel for WebsocketControlChannel {
    async fn recv(&self) -> Result<ControlEnvelope, Error> {
        self.ensure_connected().await?;
        loop {
            let message = match self.next_frame().await {
                Ok(message) => message,
                Err(e) => {
                    self.reset().await;
                    return Err(e);
                }
            };
            match message {
                Message::Text(raw) => match ControlEnvelope::decode(&raw) {
                    Ok(envelope) => return Ok(envelope),
                    // Malformed frames are dropped; the connection lives on.
                    Err(e) => warn!("dropping malformed control frame: {e}"),
                },
                Message::Ping(payload) => {
                    if let Err(e) = self.send_message(Message::Pong(payload)).await {
                        self.reset().await;
                        return Err(e);
                    }
                }
                Message::Close(_) => {
                    self.reset().await;
                    return Err(Error::transport("control channel closed by server"));
                }
                _ => {}
            }
        }
    }

    async fn send(&self, envelope: &ControlEnvelope) -> Result<(), Error> {
        self.ensure_connected().await?;
        let raw = envelope.encode()?;
        if let Err(e) = self.send_message(Message::Text(raw)).await {
            self.reset().await;
            return Err(e);
        }
        Ok(())
    }

    async fn close(&self) {
        {
            let mut write = self.write.lock().await;
            if let Some(sink) = write.as_mut() {
                let _ = sink.send(Message::Close(None)).await;
                let _ = sink.close().await;
            }
            *write = None;
        }
        *self.read.lock().await = None;
    }
}

fn build_tls_connector(tls: &TlsClientConfig) -> Result<Option<Connector>, Error> {
    if !tls.enabled {
        return Ok(None);
    }
    let mut builder = native_tls::TlsConnector::builder();
    if let Some(path) = &tls.ca_cert {
        let pem = std::fs::read(path)?;
        builder.add_root_certificate(native_tls::Certificate::from_pem(&pem)?);
    }
    if tls.skip_verify {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    }
    Ok(Some(Connector::NativeTls(builder.build()?)))
}

/// POSTs JSON-encoded chunks to the ingest endpoint.
pub struct HttpChunkSender {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpChunkSender {
    pub fn new(config: &IngestClientConfig, token: &str) -> Result<Self, Error> {
        let mut headers = reqwest::header::HeaderMap::new();
        for (key, value) in &config.headers {
            let name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| Error::invalid_config(format!("bad header name {key}: {e}")))?;
            let value = reqwest::header::HeaderValue::from_str(value)
                .map_err(|e| Error::invalid_config(format!("bad header value for {key}: {e}")))?;
            headers.insert(name, value);
        }
        if !token.is_empty() && !headers.contains_key(reqwest::header::AUTHORIZATION) {
            let value = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| Error::invalid_config(format!("bad token: {e}")))?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }

        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(config.timeout))
            .default_headers(headers);
        if config.tls.enabled {
            if let Some(path) = &config.tls.ca_cert {
                let pem = std::fs::read(path)?;
                builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
            }
            if config.tls.skip_verify {
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        Ok(Self {
            client: builder.build()?,
            endpoint: config.url.clone(),
        })
    }
}

#[async_trait]
impl ChunkSender for HttpChunkSender {
    async fn send_chunk(&self, chunk: &DataChunk) -> Result<(), Error> {
        let response = self.client.post(&self.endpoint).json(chunk).send().await?;
        response.error_for_status()?;
        Ok(())
    }
}
