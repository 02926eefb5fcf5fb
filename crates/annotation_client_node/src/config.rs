use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Inference backend host name or IP address.
    pub address: String,

    /// Inference backend port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Capture resolution, width x height.
    pub resolution: (u32, u32),

    /// Minimum milliseconds between photo captures.
    pub capture_interval_ms: u64,
}

fn default_port() -> u16 {
    annotation_stream::session::DEFAULT_PORT
}
