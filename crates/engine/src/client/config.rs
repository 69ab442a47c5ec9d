use serde::{Deserialize, Serialize};

use crate::net::DEFAULT_MTU;
use crate::net::message::DEFAULT_PACK_SLACK_BYTES;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub sim_fps: u32,
    /// Seconds of frames kept for rollback.
    pub history_s: f64,
    /// Extra prediction margin on top of half the round trip.
    pub input_lead_s: f64,
    pub input_ttl_sends: u32,
    pub connect_timeout_s: f64,
    pub time_sync_interval_s: f64,
    pub time_sync_samples: usize,
    pub mtu: usize,
    pub pack_slack_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            sim_fps: 20,
            history_s: 2.0,
            input_lead_s: 0.05,
            input_ttl_sends: 8,
            connect_timeout_s: 5.0,
            time_sync_interval_s: 0.5,
            time_sync_samples: 8,
            mtu: DEFAULT_MTU,
            pack_slack_bytes: DEFAULT_PACK_SLACK_BYTES,
        }
    }
}

impl ClientConfig {
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}
