//! Configuration surface for the relay binary and the client core.
//!
//! Environment variables override defaults; the relay binary additionally
//! accepts `--port`. No persisted storage anywhere — all state is
//! in-memory and lost on process restart.

use std::time::Duration;

use crate::registry::{ROOM_RETENTION, SWEEP_INTERVAL};
use crate::transport::ChannelPolicy;

// ── Constants ───────────────────────────────────────────────

/// Default relay listen port.
pub const DEFAULT_PORT: u16 = 3001;

/// Public STUN servers handed to the peer transport.
pub const ICE_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

/// Maximum relay connection attempts before the supervisor gives up.
pub const RECONNECT_ATTEMPTS: u32 = 5;

// ── Relay configuration ─────────────────────────────────────

/// Relay process configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// TCP listen port (`PAIRLINK_PORT`, `--port`).
    pub port: u16,
    /// Allowed `Origin` header values (`PAIRLINK_ALLOWED_ORIGINS`,
    /// comma-separated). Empty list allows any origin (dev default).
    pub allowed_origins: Vec<String>,
    /// How long an empty room is retained before reclamation.
    pub room_retention: Duration,
    /// Interval between idle-room sweep ticks.
    pub sweep_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            allowed_origins: Vec::new(),
            room_retention: ROOM_RETENTION,
            sweep_interval: SWEEP_INTERVAL,
        }
    }
}

impl RelayConfig {
    /// Build a config from the environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("PAIRLINK_PORT") {
            match port.parse::<u16>() {
                Ok(p) if p > 0 => config.port = p,
                _ => eprintln!("[config] ignoring invalid PAIRLINK_PORT: {}", port),
            }
        }

        if let Ok(origins) = std::env::var("PAIRLINK_ALLOWED_ORIGINS") {
            config.allowed_origins = parse_origin_list(&origins);
        }

        config
    }

    /// Whether a connection presenting `origin` (if any) may proceed.
    /// An empty allow-list admits everything; a configured list admits
    /// exact matches only, and refuses connections without an Origin.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.allowed_origins.is_empty() {
            return true;
        }
        match origin {
            Some(o) => self.allowed_origins.iter().any(|a| a == o),
            None => false,
        }
    }
}

/// Split a comma-separated origin list, trimming whitespace and dropping
/// empty entries.
pub fn parse_origin_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

// ── Client configuration ────────────────────────────────────

/// Client-side configuration for the connection supervisor.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay WebSocket URL, e.g. `ws://localhost:3001`.
    pub signaling_url: String,
    /// Connection attempts before surfacing a connectivity error.
    pub reconnect_attempts: u32,
    /// STUN/TURN URLs handed to the peer transport.
    pub ice_servers: Vec<String>,
    /// Reliability policy for the opened data channel.
    pub channel_policy: ChannelPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: format!("ws://localhost:{}", DEFAULT_PORT),
            reconnect_attempts: RECONNECT_ATTEMPTS,
            ice_servers: ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
            channel_policy: ChannelPolicy::default(),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────
