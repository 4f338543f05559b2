use serde::{Deserialize, Serialize};

/// Server configuration with the documented defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address for both listeners.
    pub host: String,
    /// Control (reliable-stream) port.
    pub tcp_port: u16,
    /// Media (datagram) port.
    pub udp_port: u16,
    /// Cap on a single control frame; sized to fit file chunks.
    pub max_frame_bytes: usize,
    /// Cap on simultaneously live meetings.
    pub max_meetings: usize,
    /// Per-transfer pending queue cap in bytes.
    pub session_queue_bytes: usize,
    /// Initial slow-start threshold, in chunks.
    pub initial_ssthresh: u32,
    /// Base file-transfer chunk size in bytes.
    pub base_chunk_bytes: usize,
    /// Silence window after which an outstanding chunk is retransmitted.
    pub ack_timeout_ms: u64,
    /// Retransmissions allowed per chunk before the session is aborted.
    pub max_retries: u32,
    /// A control connection with no inbound frame for this long is closed.
    pub idle_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            tcp_port: 5000,
            udp_port: 5001,
            max_frame_bytes: 32 * 1024 * 1024,
            max_meetings: 1024,
            session_queue_bytes: 64 * 1024 * 1024,
            initial_ssthresh: 8,
            base_chunk_bytes: 8192,
            ack_timeout_ms: 2000,
            max_retries: 5,
            idle_timeout_ms: 120_000,
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        let mut cfg: ServerConfig = toml::from_str(s)?;
        // Apply env overrides
        if let Ok(v) = std::env::var("HUDDLE_HOST") {
            cfg.host = v;
        }
        if let Ok(v) = std::env::var("HUDDLE_TCP_PORT") {
            if let Ok(p) = v.parse() {
                cfg.tcp_port = p;
            }
        }
        if let Ok(v) = std::env::var("HUDDLE_UDP_PORT") {
            if let Ok(p) = v.parse() {
                cfg.udp_port = p;
            }
        }
        if let Ok(v) = std::env::var("HUDDLE_MAX_FRAME_BYTES") {
            if let Ok(p) = v.parse() {
                cfg.max_frame_bytes = p;
            }
        }
        if let Ok(v) = std::env::var("HUDDLE_MAX_MEETINGS") {
            if let Ok(p) = v.parse() {
                cfg.max_meetings = p;
            }
        }
        if let Ok(v) = std::env::var("HUDDLE_IDLE_TIMEOUT_MS") {
            if let Ok(p) = v.parse() {
                cfg.idle_timeout_ms = p;
            }
        }
        Ok(cfg)
    }
}
