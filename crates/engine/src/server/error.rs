use crate::codec::CodecError;
use crate::ecs::EcsError;
use crate::net::NetError;
use crate::simulation::SimulationError;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Simulation(#[from] SimulationError),
    #[error(transparent)]
    Ecs(#[from] EcsError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Net(#[from] NetError),
    #[error("unknown player {0}")]
    UnknownPlayer(u32),
}
