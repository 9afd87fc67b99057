//! Chunking and hashing for outbound measurement payloads.

use std::collections::HashMap;
use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

use crate::error::Error;

pub const DEFAULT_CHUNK_SIZE: usize = 128 * 1024;
pub const MIN_CHUNK_SIZE: usize = 64 * 1024;
pub const MAX_CHUNK_SIZE: usize = 256 * 1024;

/// The only compression codec carried on the wire.
pub const GZIP: &str = "gzip";

/// A chunk before it receives a persistent sequence number.
///
/// Every chunk of one event shares `event_id`, `chunk_count`, and
/// `event_hash`; `payload` holds the independently compressed slice.
#[derive(Debug, Clone, PartialEq)]
pub struct EventChunk {
    pub event_id: String,
    pub chunk_index: u32,
    pub chunk_count: u32,
    pub compression: String,
    pub payload: Vec<u8>,
    pub chunk_hash: Vec<u8>,
    pub event_hash: Vec<u8>,
    pub logical_timestamp_ms: i64,
    pub clock_skew_ms: f64,
    pub attributes: HashMap<String, String>,
}

/// Options for [`chunk_payload`].
#[derive(Debug, Clone)]
pub struct ChunkOptions {
    /// Max uncompressed bytes per chunk.
    pub chunk_size: usize,
    /// Compression codec; only `"gzip"` is supported.
    pub compression: String,
    /// Event time reported by the sensor; defaults to the current wall clock.
    pub logical_timestamp_ms: Option<i64>,
    /// Estimated sensor clock skew versus the server.
    pub clock_skew_ms: f64,
    /// Metadata sent alongside each chunk.
    pub attributes: HashMap<String, String>,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            compression: GZIP.to_string(),
            logical_timestamp_ms: None,
            clock_skew_ms: 0.0,
            attributes: HashMap::new(),
        }
    }
}

fn validate_chunk_size(chunk_size: usize) -> Result<usize, Error> {
    if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
        return Err(Error::invalid_argument(format!(
            "chunk_size={} out of supported range [{}, {}]",
            chunk_size, MIN_CHUNK_SIZE, MAX_CHUNK_SIZE
        )));
    }
    Ok(chunk_size)
}

/// Split a payload into compressed chunks with hashing metadata.
///
/// Slices of at most `chunk_size` uncompressed bytes are compressed
/// independently; `chunk_hash` covers the compressed slice while
/// `event_hash` covers the full uncompressed payload.
pub fn chunk_payload(
    payload: &[u8],
    event_id: &str,
    opts: ChunkOptions,
) -> Result<Vec<EventChunk>, Error> {
    let chunk_size = validate_chunk_size(opts.chunk_size)?;
    if opts.compression != GZIP {
        return Err(Error::invalid_argument(format!(
            "unsupported compression codec {}",
            opts.compression
        )));
    }

    let logical_timestamp_ms = opts
        .logical_timestamp_ms
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

    let event_hash = sha256(payload);
    let chunk_count = payload.len().div_ceil(chunk_size).max(1) as u32;

    let mut chunks = Vec::with_capacity(chunk_count as usize);
    for index in 0..chunk_count {
        let start = index as usize * chunk_size;
        let end = (start + chunk_size).min(payload.len());
        let slice = &payload[start..end];
        if slice.is_empty() {
            break;
        }

        let compressed = gzip_compress(slice)?;
        let chunk_hash = sha256(&compressed);
        chunks.push(EventChunk {
            event_id: event_id.to_string(),
            chunk_index: index,
            chunk_count,
            compression: GZIP.to_string(),
            payload: compressed,
            chunk_hash,
            event_hash: event_hash.clone(),
            logical_timestamp_ms,
            clock_skew_ms: opts.clock_skew_ms,
            attributes: opts.attributes.clone(),
        });
    }

    Ok(chunks)
}

/// Generate a 16-byte random hex event identifier.
pub fn random_event_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub fn sha256(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

pub fn gzip_compress(data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn gzip_decompress(data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut decoder = flate2::write::GzDecoder::new(Vec::new());
    decoder.write_all(data)?;
    Ok(decoder.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunking_round_trip() {
        let data: Vec<u8> = (0..DEFAULT_CHUNK_SIZE + 1024).map(|i| (i % 251) as u8).collect();
        let event_id = random_event_id();
        let chunks = chunk_payload(&data, &event_id, ChunkOptions::default()).unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.chunk_count == 2));

        let mut reassembled = Vec::new();
        for chunk in &chunks {
            reassembled.extend(gzip_decompress(&chunk.payload).unwrap());
        }
        assert_eq!(reassembled, data);

        // All chunks share the same event hash, and it matches the payload.
        assert!(chunks.iter().all(|c| c.event_hash == chunks[0].event_hash));
        assert_eq!(chunks[0].event_hash, sha256(&data));
        for chunk in &chunks {
            assert_eq!(chunk.chunk_hash, sha256(&chunk.payload));
        }
    }

    #[test]
    fn test_single_byte_payload_is_one_chunk() {
        let chunks = chunk_payload(b"x", "e1", ChunkOptions::default()).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_count, 1);
        assert_eq!(chunks[0].chunk_index, 0);
    }

    #[test]
    fn test_chunk_size_bounds() {
        for size in [MIN_CHUNK_SIZE - 1, MAX_CHUNK_SIZE + 1] {
            let opts = ChunkOptions {
                chunk_size: size,
                ..ChunkOptions::default()
            };
            let err = chunk_payload(b"data", "e1", opts).unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)));
        }
    }

    #[test]
    fn test_unsupported_compression_rejected() {
        let opts = ChunkOptions {
            compression: "zstd".to_string(),
            ..ChunkOptions::default()
        };
        let err = chunk_payload(b"data", "e1", opts).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_random_event_id_is_hex() {
        let id = random_event_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, random_event_id());
    }
}
