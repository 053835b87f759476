//! Runtime configuration for the glue layer.

use serde::{Deserialize, Serialize};

/// Default UDP port for SCTP-over-UDP tunneling.
pub const DEFAULT_TUNNEL_PORT: u16 = 9899;

/// Floor for the reaper tick interval; requests below this are clamped
/// rather than allowed to spin.
pub const MIN_REAPER_INTERVAL_MS: u64 = 10;

/// Glue layer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlueConfig {
    /// UDP port the tunnel ingress socket binds to.
    pub tunnel_port: u16,
    /// Reaper sweep interval in milliseconds (clamped to
    /// [`MIN_REAPER_INTERVAL_MS`]).
    pub reaper_interval_ms: u64,
    /// Cap on outstanding buffer segments across the process.
    pub segment_limit: usize,
    /// Number of descriptor slots available for publishing handles.
    pub descriptor_slots: usize,
}

impl Default for GlueConfig {
    fn default() -> Self {
        Self {
            tunnel_port: DEFAULT_TUNNEL_PORT,
            reaper_interval_ms: 500,
            segment_limit: 4096,
            descriptor_slots: 1024,
        }
    }
}

impl GlueConfig {
    /// Reaper interval with the floor applied.
    pub fn reaper_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.reaper_interval_ms.max(MIN_REAPER_INTERVAL_MS))
    }
}
