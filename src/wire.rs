//! Wire messages for the control channel and the ingest endpoint.
//!
//! Control envelopes travel as one UTF-8 JSON object per WebSocket frame,
//! discriminated by `body_type` with the payload nested under `body`. Data
//! chunks travel as JSON bodies on the ingest POST with binary fields
//! base64-encoded.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Monotonic schema version stamped on every envelope and chunk.
pub const SCHEMA_VERSION: &str = "1.0";

fn default_schema_version() -> String {
    SCHEMA_VERSION.to_string()
}

/// Current wall clock in RFC3339 UTC.
pub fn utc_now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Sensor liveness report; also doubles as the connect handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub software_version: String,
    pub last_committed_sequence: i64,
    pub queue_depth: i64,
    pub clock_skew_ms: f64,
}

/// Server-issued request for a window of queued chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRequest {
    pub since_sequence: i64,
    pub max_chunks: u32,
    pub max_bytes: u64,
    pub window_id: String,
    pub max_in_flight: u32,
}

/// Server acknowledgement of committed sequences within a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkAck {
    pub window_id: String,
    #[serde(default)]
    pub committed_sequences: Vec<i64>,
    #[serde(default)]
    pub reset_window: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub command_id: String,
    pub success: bool,
    pub message: String,
}

/// Discriminated union carried in a [`ControlEnvelope`].
#[derive(Debug, Clone, PartialEq)]
pub enum ControlBody {
    Heartbeat(Heartbeat),
    ChunkRequest(ChunkRequest),
    ChunkAck(ChunkAck),
    CommandResponse(CommandResponse),
}

impl ControlBody {
    pub fn type_name(&self) -> &'static str {
        match self {
            ControlBody::Heartbeat(_) => "heartbeat",
            ControlBody::ChunkRequest(_) => "chunk_request",
            ControlBody::ChunkAck(_) => "chunk_ack",
            ControlBody::CommandResponse(_) => "command_response",
        }
    }
}

/// One control-channel frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlEnvelope {
    pub schema_version: String,
    pub sensor_id: String,
    pub sent_at: String,
    pub capabilities: Vec<String>,
    pub body: ControlBody,
}

/// JSON shape of an envelope on the wire.
#[derive(Serialize, Deserialize)]
struct RawEnvelope {
    #[serde(default = "default_schema_version")]
    schema_version: String,
    sensor_id: String,
    #[serde(default)]
    sent_at: String,
    #[serde(default)]
    capabilities: Vec<String>,
    body_type: String,
    body: serde_json::Value,
}

impl ControlEnvelope {
    pub fn new(sensor_id: impl Into<String>, body: ControlBody) -> Self {
        Self {
            schema_version: default_schema_version(),
            sensor_id: sensor_id.into(),
            sent_at: utc_now_rfc3339(),
            capabilities: Vec::new(),
            body,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn encode(&self) -> Result<String, Error> {
        let body = match &self.body {
            ControlBody::Heartbeat(body) => serde_json::to_value(body)?,
            ControlBody::ChunkRequest(body) => serde_json::to_value(body)?,
            ControlBody::ChunkAck(body) => serde_json::to_value(body)?,
            ControlBody::CommandResponse(body) => serde_json::to_value(body)?,
        };
        let raw = RawEnvelope {
            schema_version: self.schema_version.clone(),
            sensor_id: self.sensor_id.clone(),
            sent_at: if self.sent_at.is_empty() {
                utc_now_rfc3339()
            } else {
                self.sent_at.clone()
            },
            capabilities: self.capabilities.clone(),
            body_type: self.body.type_name().to_string(),
            body,
        };
        Ok(serde_json::to_string(&raw)?)
    }

    pub fn decode(raw: &str) -> Result<Self, Error> {
        let raw: RawEnvelope = serde_json::from_str(raw)
            .map_err(|e| Error::protocol(format!("bad envelope: {e}")))?;
        let bad_body =
            |e: serde_json::Error| Error::protocol(format!("bad {} body: {e}", raw.body_type));
        let body = match raw.body_type.as_str() {
            "heartbeat" => {
                ControlBody::Heartbeat(serde_json::from_value(raw.body).map_err(bad_body)?)
            }
            "chunk_request" => {
                ControlBody::ChunkRequest(serde_json::from_value(raw.body).map_err(bad_body)?)
            }
            "chunk_ack" => {
                ControlBody::ChunkAck(serde_json::from_value(raw.body).map_err(bad_body)?)
            }
            "command_response" => {
                ControlBody::CommandResponse(serde_json::from_value(raw.body).map_err(bad_body)?)
            }
            other => {
                return Err(Error::protocol(format!("unknown control body_type={other}")));
            }
        };
        Ok(Self {
            schema_version: raw.schema_version,
            sensor_id: raw.sensor_id,
            sent_at: raw.sent_at,
            capabilities: raw.capabilities,
            body,
        })
    }
}

/// A queued chunk rewritten for the ingest POST.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataChunk {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub sensor_id: String,
    pub event_id: String,
    pub sequence: i64,
    pub chunk_index: u32,
    pub chunk_count: u32,
    pub compression: String,
    #[serde(with = "b64")]
    pub payload: Vec<u8>,
    #[serde(with = "b64")]
    pub chunk_sha256: Vec<u8>,
    #[serde(with = "b64")]
    pub event_sha256: Vec<u8>,
    pub created_at: String,
    pub logical_timestamp_ms: i64,
    pub clock_skew_ms: f64,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

/// Serde adapter for base64-encoded binary fields.
mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD.decode(raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(body: ControlBody) {
        let envelope = ControlEnvelope::new("sensor-1", body)
            .with_capabilities(vec!["chunks".to_string(), "heartbeats".to_string()]);
        let encoded = envelope.encode().unwrap();
        let decoded = ControlEnvelope::decode(&encoded).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_envelope_round_trip_all_variants() {
        round_trip(ControlBody::Heartbeat(Heartbeat {
            software_version: "0.1.0".to_string(),
            last_committed_sequence: 42,
            queue_depth: 7,
            clock_skew_ms: -1.5,
        }));
        round_trip(ControlBody::ChunkRequest(ChunkRequest {
            since_sequence: 42,
            max_chunks: 32,
            max_bytes: 2 * 1024 * 1024,
            window_id: "sensor-1-1700000000000".to_string(),
            max_in_flight: 32,
        }));
        round_trip(ControlBody::ChunkAck(ChunkAck {
            window_id: "w1".to_string(),
            committed_sequences: vec![1, 2, 3],
            reset_window: true,
        }));
        round_trip(ControlBody::CommandResponse(CommandResponse {
            command_id: "c1".to_string(),
            success: true,
            message: "ok".to_string(),
        }));
    }

    #[test]
    fn test_envelope_discriminator_on_wire() {
        let envelope = ControlEnvelope::new(
            "sensor-1",
            ControlBody::ChunkAck(ChunkAck {
                window_id: "w1".to_string(),
                committed_sequences: vec![5],
                reset_window: false,
            }),
        );
        let value: serde_json::Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();
        assert_eq!(value["body_type"], "chunk_ack");
        assert_eq!(value["body"]["window_id"], "w1");
        assert_eq!(value["schema_version"], SCHEMA_VERSION);
        assert!(!value["sent_at"].as_str().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_body_type_rejected() {
        let raw = r#"{"schema_version":"1.0","sensor_id":"s1","body_type":"telemetry","body":{}}"#;
        let err = ControlEnvelope::decode(raw).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_ack_defaults_are_lenient() {
        let raw = r#"{"sensor_id":"s1","body_type":"chunk_ack","body":{"window_id":"w1"}}"#;
        let envelope = ControlEnvelope::decode(raw).unwrap();
        assert_eq!(envelope.schema_version, SCHEMA_VERSION);
        let ControlBody::ChunkAck(ack) = envelope.body else { panic!("expected ack") };
        assert!(ack.committed_sequences.is_empty());
        assert!(!ack.reset_window);
    }

    #[test]
    fn test_data_chunk_base64_round_trip() {
        let chunk = DataChunk {
            schema_version: SCHEMA_VERSION.to_string(),
            sensor_id: "sensor-1".to_string(),
            event_id: "e1".to_string(),
            sequence: 9,
            chunk_index: 0,
            chunk_count: 1,
            compression: "gzip".to_string(),
            payload: vec![0, 1, 2, 255],
            chunk_sha256: vec![7; 32],
            event_sha256: vec![9; 32],
            created_at: utc_now_rfc3339(),
            logical_timestamp_ms: 1_700_000_000_000,
            clock_skew_ms: 0.0,
            attributes: HashMap::from([("window_id".to_string(), "w1".to_string())]),
        };
        let encoded = serde_json::to_string(&chunk).unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["payload"], "AAEC/w==");
        let decoded: DataChunk = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, chunk);
    }
}
