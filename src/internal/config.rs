use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const DEFAULT_RING_TIMEOUT_MS: u64 = 30_000;

/// all fields are optional in the JSON form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// base URL of the relay. the local id is appended as the last path segment
    pub relay_url: String,
    /// how long an outbound call rings before giving up
    pub outgoing_call_timeout_ms: u64,
    /// how long an inbound call rings before it is dismissed
    pub incoming_call_timeout_ms: u64,
    /// STUN/TURN urls for the peer connection
    pub ice_servers: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8080".into(),
            outgoing_call_timeout_ms: DEFAULT_RING_TIMEOUT_MS,
            incoming_call_timeout_ms: DEFAULT_RING_TIMEOUT_MS,
            ice_servers: vec![
                "stun:stun.services.mozilla.com:3478".into(),
                "stun:stun.l.google.com:19302".into(),
            ],
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn endpoint(&self, id: &str) -> String {
        format!("{}/{}", self.relay_url.trim_end_matches('/'), id)
    }

    pub fn timeouts(&self) -> RingTimeouts {
        RingTimeouts {
            outgoing: Duration::from_millis(self.outgoing_call_timeout_ms),
            incoming: Duration::from_millis(self.incoming_call_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingTimeouts {
    pub outgoing: Duration,
    pub incoming: Duration,
}

impl Default for RingTimeouts {
    fn default() -> Self {
        Config::default().timeouts()
    }
}
