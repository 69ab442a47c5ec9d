use crate::codec::CodecError;
use crate::ecs::EcsError;
use crate::registry::{RegistryError, TypeId};

#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error(transparent)]
    Ecs(#[from] EcsError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("input type {name} is already registered")]
    DuplicateInputType { name: &'static str },
    #[error("unknown input type {0}")]
    UnknownInputType(TypeId),
    #[error("simulation rate must be positive, got {0}")]
    InvalidSimFps(u32),
    #[error("system {name} failed: {reason}")]
    System { name: String, reason: String },
}
