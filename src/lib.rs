//! Uplink: sensor-to-server measurement delivery pipeline.
//!
//! Sensors buffer compressed, hashed payload chunks in a crash-safe queue
//! and deliver them when the server asks; the server deduplicates,
//! reassembles, acknowledges over a persistent control channel, and fans
//! assembled snapshots out to observers.

pub mod auth;
pub mod backoff;
pub mod chunk;
pub mod config;
pub mod error;
pub mod sensor;
pub mod server;
pub mod wire;

pub use error::Error;
