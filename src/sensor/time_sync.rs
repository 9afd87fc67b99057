//! Clock-skew estimation against an NTP reference.
//!
//! Shells out to `ntpdate -q` and caches the reported offset; the pipeline
//! treats the estimate as opaque metadata on heartbeats and chunks.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::process::Command;

use crate::config::TimeSyncConfig;

const SYNC_CACHE: Duration = Duration::from_secs(300);
const NTP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ClockSkewEstimator {
    enabled: bool,
    ntp_server: String,
    fallback_skew_ms: f64,
    last_skew_ms: f64,
    last_sync: Option<Instant>,
}

impl ClockSkewEstimator {
    pub fn new(config: &TimeSyncConfig) -> Self {
        Self {
            enabled: config.enabled,
            ntp_server: config.ntp_server.clone(),
            fallback_skew_ms: config.fallback_skew_ms,
            last_skew_ms: 0.0,
            last_sync: None,
        }
    }

    /// An estimator that always reports zero skew.
    pub fn disabled() -> Self {
        Self::new(&TimeSyncConfig::default())
    }

    /// Current skew estimate in milliseconds.
    ///
    /// Queries the NTP server at most every five minutes; returns the
    /// configured fallback when disabled or when the query fails.
    pub async fn estimate(&mut self) -> f64 {
        if !self.enabled {
            return self.fallback_skew_ms;
        }
        if let Some(last) = self.last_sync {
            if last.elapsed() < SYNC_CACHE {
                return self.last_skew_ms;
            }
        }
        match self.query_ntp().await {
            Some(skew) => {
                self.last_skew_ms = skew;
                self.last_sync = Some(Instant::now());
                skew
            }
            None => self.fallback_skew_ms,
        }
    }

    async fn query_ntp(&self) -> Option<f64> {
        let output = tokio::time::timeout(
            NTP_TIMEOUT,
            Command::new("ntpdate").arg("-q").arg(&self.ntp_server).output(),
        )
        .await
        .ok()?
        .ok()?;
        parse_offset_ms(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Pull the `offset <value> msec` figure out of ntpdate output.
fn parse_offset_ms(output: &str) -> Option<f64> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"offset\s+(-?\d+(?:\.\d+)?)\s*msec").expect("static pattern"));
    pattern
        .captures(output)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}
