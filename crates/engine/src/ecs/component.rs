use std::any::TypeId as RustTypeId;
use std::collections::HashMap;
use std::fmt;

use rkyv::{Archive, Deserialize, Serialize};

use crate::codec::Codec;

use super::error::EcsError;
use super::storage::{ErasedStorage, Storage};

/// 1-based; zero never names an entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u32);

impl EntityId {
    pub const INVALID: EntityId = EntityId(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentTypeId(pub u16);

pub const MAX_TYPE_ID: u64 = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId {
    pub type_id: ComponentTypeId,
    pub owner: EntityId,
}

impl ComponentId {
    pub fn new(type_id: ComponentTypeId, owner: EntityId) -> Self {
        Self { type_id, owner }
    }

    pub fn pack(self) -> u64 {
        u64::from(self.owner.0) * MAX_TYPE_ID + u64::from(self.type_id.0)
    }

    pub fn unpack(packed: u64) -> Self {
        Self {
            type_id: ComponentTypeId((packed % MAX_TYPE_ID) as u16),
            owner: EntityId((packed / MAX_TYPE_ID) as u32),
        }
    }
}

pub trait Component: Codec + Clone + 'static {
    const NAME: &'static str;
}

/// Attached to an entity's owner id when the entity itself is deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct DeletedTag;

impl Component for DeletedTag {
    const NAME: &'static str = "rollnet.DeletedTag";
}

pub const DELETED_TAG_TYPE_ID: ComponentTypeId = ComponentTypeId(0);

#[derive(Debug, Clone, Copy)]
pub struct ComponentTypeInfo {
    pub id: ComponentTypeId,
    pub name: &'static str,
    rust_type: RustTypeId,
    new_storage: fn() -> Box<dyn ErasedStorage>,
}

impl ComponentTypeInfo {
    fn of<T: Component>(id: ComponentTypeId) -> Self {
        Self {
            id,
            name: T::NAME,
            rust_type: RustTypeId::of::<T>(),
            new_storage: || Box::new(Storage::<T>::new()),
        }
    }

    pub fn new_storage(&self) -> Box<dyn ErasedStorage> {
        (self.new_storage)()
    }
}

/// Component types in registration order; `DeletedTag` is always type zero.
#[derive(Debug, Clone)]
pub struct ComponentTypes {
    infos: Vec<ComponentTypeInfo>,
    by_rust_type: HashMap<RustTypeId, ComponentTypeId>,
}

impl Default for ComponentTypes {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentTypes {
    pub fn new() -> Self {
        let deleted = ComponentTypeInfo::of::<DeletedTag>(DELETED_TAG_TYPE_ID);
        Self {
            by_rust_type: HashMap::from([(deleted.rust_type, deleted.id)]),
            infos: vec![deleted],
        }
    }

    pub fn register<T: Component>(&mut self) -> Result<ComponentTypeId, EcsError> {
        if self.by_rust_type.contains_key(&RustTypeId::of::<T>()) {
            return Err(EcsError::DuplicateComponentType { name: T::NAME });
        }
        let id = u16::try_from(self.infos.len())
            .map(ComponentTypeId)
            .map_err(|_| EcsError::TooManyComponentTypes)?;
        let info = ComponentTypeInfo::of::<T>(id);
        self.by_rust_type.insert(info.rust_type, id);
        self.infos.push(info);
        Ok(id)
    }

    pub fn id_of<T: Component>(&self) -> Option<ComponentTypeId> {
        self.by_rust_type.get(&RustTypeId::of::<T>()).copied()
    }

    pub fn get(&self, id: ComponentTypeId) -> Option<&ComponentTypeInfo> {
        self.infos.get(usize::from(id.0))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ComponentTypeInfo> {
        self.infos.iter()
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_id_pack_roundtrip() {
        let id = ComponentId::new(ComponentTypeId(65535), EntityId(u32::MAX));
        assert_eq!(ComponentId::unpack(id.pack()), id);
        assert_eq!(ComponentId::new(ComponentTypeId(3), EntityId(2)).pack(), 2 * 65536 + 3);
    }

    #[test]
    fn test_deleted_tag_is_type_zero() {
        let types = ComponentTypes::new();
        assert_eq!(types.id_of::<DeletedTag>(), Some(DELETED_TAG_TYPE_ID));
        assert_eq!(types.get(DELETED_TAG_TYPE_ID).unwrap().name, DeletedTag::NAME);
    }

    #[test]
    fn test_duplicate_type_registration_fails() {
        let mut types = ComponentTypes::new();
        assert!(matches!(
            types.register::<DeletedTag>(),
            Err(EcsError::DuplicateComponentType { .. })
        ));
    }
}
