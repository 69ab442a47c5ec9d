use crate::codec::CodecError;

use super::component::{ComponentTypeId, EntityId};

#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    #[error("entity id space exhausted")]
    EntityIdsExhausted,
    #[error("component type {name} is already registered")]
    DuplicateComponentType { name: &'static str },
    #[error("too many component types")]
    TooManyComponentTypes,
    #[error("component type {name} is not registered")]
    UnregisteredComponent { name: &'static str },
    #[error("unknown component type id {}", .0.0)]
    UnknownComponentType(ComponentTypeId),
    #[error("entity {0} does not exist")]
    NoSuchEntity(EntityId),
    #[error(transparent)]
    Codec(#[from] CodecError),
}
