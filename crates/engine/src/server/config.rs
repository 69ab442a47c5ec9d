use serde::{Deserialize, Serialize};

use crate::net::DEFAULT_MTU;
use crate::net::message::DEFAULT_PACK_SLACK_BYTES;

/// Priority tuning for the component replication chooser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub initial_priority: u32,
    pub unsent_growth: u32,
    pub sent_growth: u32,
    pub acked_growth: u32,
    /// Candidates below this are not considered for sending.
    pub min_priority: u32,
    pub pack_slack_bytes: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            initial_priority: 100,
            unsent_growth: 100,
            sent_growth: 10,
            acked_growth: 1,
            min_priority: 50,
            pack_slack_bytes: DEFAULT_PACK_SLACK_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub sim_fps: u32,
    /// Scales wall-clock time into simulation time.
    pub global_simulation_rate_multiplier: f64,
    pub max_backlog_ticks: u32,
    /// Inputs aimed further than this past the current frame are dropped.
    pub max_input_lead_s: f64,
    pub peer_timeout_s: f64,
    pub mtu: usize,
    pub replication: ReplicationConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            sim_fps: 20,
            global_simulation_rate_multiplier: 1.0,
            max_backlog_ticks: 4,
            max_input_lead_s: 1.0,
            peer_timeout_s: 10.0,
            mtu: DEFAULT_MTU,
            replication: ReplicationConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}
