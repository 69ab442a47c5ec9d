use crate::codec::CodecError;
use crate::ecs::EcsError;
use crate::net::NetError;
use crate::registry::RegistryError;
use crate::simulation::SimulationError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Simulation(#[from] SimulationError),
    #[error(transparent)]
    Ecs(#[from] EcsError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Net(#[from] NetError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("short type id {0} is not a component")]
    NotAComponent(u16),
    #[error("no handshake from server within {timeout_s:.1}s")]
    ConnectTimeout { timeout_s: f64 },
    #[error("connection closed")]
    Disconnected,
}
