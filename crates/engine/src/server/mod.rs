mod config;
mod engine;
mod error;
mod events;
mod input;
mod replication;

pub use config::{ReplicationConfig, ServerConfig};
pub use engine::{ServerEngine, ServerStats};
pub use error::ServerError;
pub use events::{Authenticator, ConnectionRequest, DisconnectReason, Rejection, ServerEvent};
pub use input::{InputBuffer, ServerInputHandler};
pub use replication::{AckState, COMPONENT_UPDATE_OVERHEAD_BYTES, ComponentReplicationChooser, ReplicatedComponent};
