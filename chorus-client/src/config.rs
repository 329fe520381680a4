//! Session configuration
//!
//! Everything tunable about a session lives here. The audio format itself is
//! not tunable: 48 kHz mono on the wire, fixed 40 ms mixer frames (see
//! `chorus_common::voice`). Both ends must share the same key.

use serde::Deserialize;

use chorus_common::voice::{JITTER_GATE_FRAMES, KEEPALIVE_INTERVAL_MS, MAX_QUEUE_FRAMES};

/// Smallest accepted keep-alive interval (small values are only useful in tests)
const MIN_KEEPALIVE_MS: u64 = 100;

/// Configuration for a voice session
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Destination host for all outbound datagrams (relay or peer)
    pub dest_host: String,
    /// Destination UDP port
    pub dest_port: u16,
    /// Pre-shared 256-bit key, base64 encoded
    pub key: String,
    /// Queued frames required before a channel first mixes (default 5;
    /// 3 trades ~80 ms of latency for less jitter headroom)
    #[serde(default = "default_gate_frames")]
    pub jitter_gate_frames: usize,
    /// Interval between keep-alive datagrams while not transmitting
    #[serde(default = "default_keepalive_ms")]
    pub keepalive_interval_ms: u64,
    /// Apply the noise gate on the transmit path
    #[serde(default = "default_true")]
    pub noise_gate: bool,
    /// Apply automatic gain control on the transmit path
    #[serde(default = "default_true")]
    pub agc: bool,
}

fn default_gate_frames() -> usize {
    JITTER_GATE_FRAMES
}

fn default_keepalive_ms() -> u64 {
    KEEPALIVE_INTERVAL_MS
}

fn default_true() -> bool {
    true
}

impl SessionConfig {
    /// Create a configuration with default tuning
    pub fn new(dest_host: impl Into<String>, dest_port: u16, key: impl Into<String>) -> Self {
        Self {
            dest_host: dest_host.into(),
            dest_port,
            key: key.into(),
            jitter_gate_frames: default_gate_frames(),
            keepalive_interval_ms: default_keepalive_ms(),
            noise_gate: true,
            agc: true,
        }
    }

    /// Validate tuning values before session start
    ///
    /// The key itself is validated separately when it is decoded.
    pub fn validate(&self) -> Result<(), String> {
        if self.dest_host.is_empty() {
            return Err("dest_host must not be empty".to_string());
        }
        if self.jitter_gate_frames == 0 || self.jitter_gate_frames > MAX_QUEUE_FRAMES {
            return Err(format!(
                "jitter_gate_frames must be in 1..={}, got {}",
                MAX_QUEUE_FRAMES, self.jitter_gate_frames
            ));
        }
        if self.keepalive_interval_ms < MIN_KEEPALIVE_MS {
            return Err(format!(
                "keepalive_interval_ms must be at least {}, got {}",
                MIN_KEEPALIVE_MS, self.keepalive_interval_ms
            ));
        }
        Ok(())
    }
}
