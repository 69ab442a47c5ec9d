use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use bytes::BufMut;

use crate::codec;

use super::component::{
    Component, ComponentId, ComponentTypeId, ComponentTypes, DELETED_TAG_TYPE_ID, DeletedTag, EntityId,
};
use super::error::EcsError;
use super::storage::{ErasedStorage, Storage, StoredComponent};
use super::view::{EntityComponentState, EntityComponentStateRef};

/// Raw component store. Deleted entities and components stay visible here
/// until released; simulation code goes through the hiding views instead.
pub struct EntityComponentDb {
    types: Rc<ComponentTypes>,
    storages: Vec<Box<dyn ErasedStorage>>,
    entities: BTreeMap<EntityId, BTreeSet<ComponentTypeId>>,
    next_entity_id: u32,
}

impl Clone for EntityComponentDb {
    fn clone(&self) -> Self {
        Self {
            types: Rc::clone(&self.types),
            storages: self.storages.iter().map(|storage| storage.clone_box()).collect(),
            entities: self.entities.clone(),
            next_entity_id: self.next_entity_id,
        }
    }
}

impl std::fmt::Debug for EntityComponentDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityComponentDb")
            .field("entities", &self.entities.len())
            .field("next_entity_id", &self.next_entity_id)
            .finish()
    }
}

impl EntityComponentDb {
    pub fn new(types: Rc<ComponentTypes>) -> Self {
        let storages = types.iter().map(|info| info.new_storage()).collect();
        Self {
            types,
            storages,
            entities: BTreeMap::new(),
            next_entity_id: 1,
        }
    }

    pub fn types(&self) -> &Rc<ComponentTypes> {
        &self.types
    }

    pub fn next_entity_id(&self) -> u32 {
        self.next_entity_id
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn contains_entity(&self, entity: EntityId) -> bool {
        self.entities.contains_key(&entity)
    }

    pub fn entity_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities.keys().copied()
    }

    pub fn component_types_of(&self, entity: EntityId) -> impl Iterator<Item = ComponentTypeId> + '_ {
        self.entities.get(&entity).into_iter().flatten().copied()
    }

    pub fn view(&self) -> EntityComponentStateRef<'_> {
        EntityComponentStateRef::new(self)
    }

    pub fn view_mut(&mut self) -> EntityComponentState<'_> {
        EntityComponentState::new(self)
    }

    pub fn create_entity(&mut self) -> Result<EntityId, EcsError> {
        let id = self.next_entity_id;
        if id == u32::MAX {
            return Err(EcsError::EntityIdsExhausted);
        }
        self.next_entity_id += 1;
        let entity = EntityId(id);
        self.entities.insert(entity, BTreeSet::new());
        Ok(entity)
    }

    fn track(&mut self, id: ComponentId) {
        self.entities.entry(id.owner).or_default().insert(id.type_id);
        if id.owner.0 >= self.next_entity_id {
            self.next_entity_id = id.owner.0.saturating_add(1);
        }
    }

    fn type_id<T: Component>(&self) -> Result<ComponentTypeId, EcsError> {
        self.types
            .id_of::<T>()
            .ok_or(EcsError::UnregisteredComponent { name: T::NAME })
    }

    pub fn storage<T: Component>(&self) -> Option<&Storage<T>> {
        let type_id = self.types.id_of::<T>()?;
        self.storages
            .get(usize::from(type_id.0))?
            .as_any()
            .downcast_ref::<Storage<T>>()
    }

    pub fn storage_mut<T: Component>(&mut self) -> Option<&mut Storage<T>> {
        let type_id = self.types.id_of::<T>()?;
        self.storages
            .get_mut(usize::from(type_id.0))?
            .as_any_mut()
            .downcast_mut::<Storage<T>>()
    }

    fn erased(&self, type_id: ComponentTypeId) -> Result<&dyn ErasedStorage, EcsError> {
        self.storages
            .get(usize::from(type_id.0))
            .map(|storage| storage.as_ref())
            .ok_or(EcsError::UnknownComponentType(type_id))
    }

    fn erased_mut(&mut self, type_id: ComponentTypeId) -> Result<&mut Box<dyn ErasedStorage>, EcsError> {
        self.storages
            .get_mut(usize::from(type_id.0))
            .ok_or(EcsError::UnknownComponentType(type_id))
    }

    /// Inserts or replaces; a replaced tombstoned component comes back alive.
    pub fn insert<T: Component>(&mut self, entity: EntityId, value: T) -> Result<ComponentId, EcsError> {
        let id = ComponentId::new(self.type_id::<T>()?, entity);
        self.storage_mut::<T>()
            .ok_or(EcsError::UnregisteredComponent { name: T::NAME })?
            .upsert(entity, value);
        self.track(id);
        Ok(id)
    }

    pub fn get_stored<T: Component>(&self, entity: EntityId) -> Option<&StoredComponent<T>> {
        self.storage::<T>()?.get(entity)
    }

    pub fn get<T: Component>(&self, entity: EntityId) -> Option<&T> {
        self.get_stored::<T>(entity).map(|stored| &stored.data)
    }

    pub fn get_mut<T: Component>(&mut self, entity: EntityId) -> Option<&mut T> {
        self.storage_mut::<T>()?.get_mut(entity).map(|stored| &mut stored.data)
    }

    pub fn is_component_deleted(&self, id: ComponentId) -> Option<bool> {
        self.storages.get(usize::from(id.type_id.0))?.is_deleted(id.owner)
    }

    pub fn is_entity_deleted(&self, entity: EntityId) -> bool {
        self.is_component_deleted(ComponentId::new(DELETED_TAG_TYPE_ID, entity))
            .is_some()
    }

    /// Marks a component deleted. It stays readable until released.
    pub fn delete_component(&mut self, id: ComponentId) -> bool {
        self.storages
            .get_mut(usize::from(id.type_id.0))
            .is_some_and(|storage| storage.set_deleted(id.owner))
    }

    /// Marks every component of the entity deleted and tags the owner.
    pub fn delete_entity(&mut self, entity: EntityId) -> Result<(), EcsError> {
        let types: Vec<ComponentTypeId> = self
            .entities
            .get(&entity)
            .ok_or(EcsError::NoSuchEntity(entity))?
            .iter()
            .copied()
            .collect();
        for type_id in types {
            if type_id != DELETED_TAG_TYPE_ID {
                self.erased_mut(type_id)?.set_deleted(entity);
            }
        }
        self.insert(entity, DeletedTag)?;
        Ok(())
    }

    pub fn release_component(&mut self, id: ComponentId) -> bool {
        let released = self
            .storages
            .get_mut(usize::from(id.type_id.0))
            .is_some_and(|storage| storage.release(id.owner));
        if released {
            if let Some(types) = self.entities.get_mut(&id.owner) {
                types.remove(&id.type_id);
            }
        }
        released
    }

    pub fn release_entity(&mut self, entity: EntityId) -> bool {
        let Some(types) = self.entities.remove(&entity) else {
            return false;
        };
        for type_id in types {
            if let Some(storage) = self.storages.get_mut(usize::from(type_id.0)) {
                storage.release(entity);
            }
        }
        true
    }

    /// Components marked deleted on live entities, and entities marked deleted.
    pub fn deletions(&self) -> (Vec<ComponentId>, Vec<EntityId>) {
        let mut components = Vec::new();
        let mut entities = Vec::new();
        for (&entity, types) in &self.entities {
            if self.is_entity_deleted(entity) {
                entities.push(entity);
                continue;
            }
            for &type_id in types {
                let id = ComponentId::new(type_id, entity);
                if self.is_component_deleted(id) == Some(true) {
                    components.push(id);
                }
            }
        }
        (components, entities)
    }

    /// Physically drops everything marked deleted.
    pub fn release_deleted_state(&mut self) {
        let (components, entities) = self.deletions();
        for entity in entities {
            self.release_entity(entity);
        }
        for id in components {
            self.release_component(id);
        }
    }

    /// Components that are neither tombstoned nor owned by a deleted entity.
    pub fn live_components(&self) -> Vec<ComponentId> {
        let mut live = Vec::new();
        for (&entity, types) in &self.entities {
            if self.is_entity_deleted(entity) {
                continue;
            }
            for &type_id in types {
                let id = ComponentId::new(type_id, entity);
                if self.is_component_deleted(id) == Some(false) {
                    live.push(id);
                }
            }
        }
        live
    }

    pub fn encode_component(&self, id: ComponentId) -> Result<Option<Vec<u8>>, EcsError> {
        Ok(self.erased(id.type_id)?.encode(id.owner)?)
    }

    pub fn upsert_encoded(&mut self, id: ComponentId, bytes: &[u8]) -> Result<(), EcsError> {
        self.erased_mut(id.type_id)?.upsert_encoded(id.owner, bytes, false)?;
        self.track(id);
        Ok(())
    }

    pub fn clear(&mut self) {
        for storage in &mut self.storages {
            storage.clear();
        }
        self.entities.clear();
        self.next_entity_id = 1;
    }

    /// Id generator state, the entity ids, then per type: type id, count
    /// and `(owner, bytes, deleted)` tuples. Entities without components
    /// survive the round trip.
    pub fn serialize(&self) -> Result<Vec<u8>, EcsError> {
        let mut out = Vec::new();
        out.put_u32(self.next_entity_id);
        out.put_u32(self.entities.len() as u32);
        for entity in self.entities.keys() {
            out.put_u32(entity.0);
        }
        out.put_u16(self.storages.len() as u16);
        for (index, storage) in self.storages.iter().enumerate() {
            let entries = storage.entries();
            out.put_u16(index as u16);
            out.put_u32(entries.len() as u32);
            for (owner, deleted) in entries {
                let bytes = storage.encode(owner)?.unwrap_or_default();
                out.put_u32(owner.0);
                codec::put_u32_prefixed(&mut out, &bytes)?;
                out.put_u8(u8::from(deleted));
            }
        }
        Ok(out)
    }

    /// Full-state load: everything currently held is discarded first.
    pub fn deserialize(&mut self, data: &[u8]) -> Result<(), EcsError> {
        self.clear();
        let mut buf = data;
        let next_entity_id = codec::read_u32(&mut buf)?;
        let entity_count = codec::read_u32(&mut buf)?;
        for _ in 0..entity_count {
            let entity = EntityId(codec::read_u32(&mut buf)?);
            self.entities.entry(entity).or_default();
        }
        let type_count = codec::read_u16(&mut buf)?;
        for _ in 0..type_count {
            let type_id = ComponentTypeId(codec::read_u16(&mut buf)?);
            let count = codec::read_u32(&mut buf)?;
            for _ in 0..count {
                let owner = EntityId(codec::read_u32(&mut buf)?);
                let bytes = codec::read_u32_prefixed(&mut buf)?;
                let deleted = codec::read_u8(&mut buf)? != 0;
                self.erased_mut(type_id)?.upsert_encoded(owner, bytes, deleted)?;
                self.track(ComponentId::new(type_id, owner));
            }
        }
        self.next_entity_id = next_entity_id;
        Ok(())
    }

    pub fn copy_from(&mut self, other: &EntityComponentDb) -> Result<(), EcsError> {
        self.deserialize(&other.serialize()?)
    }

    /// Round-trips the state through its wire form in place.
    pub fn quantize(&mut self) -> Result<(), EcsError> {
        let bytes = self.serialize()?;
        self.deserialize(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rkyv::{Archive, Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
    struct Position {
        x: f32,
        y: f32,
    }

    impl Component for Position {
        const NAME: &'static str = "test.Position";
    }

    #[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
    struct Label(String);

    impl Component for Label {
        const NAME: &'static str = "test.Label";
    }

    fn db() -> EntityComponentDb {
        let mut types = ComponentTypes::new();
        types.register::<Position>().unwrap();
        types.register::<Label>().unwrap();
        EntityComponentDb::new(Rc::new(types))
    }

    #[test]
    fn test_create_entity_ids_are_one_based() {
        let mut db = db();
        assert_eq!(db.create_entity().unwrap(), EntityId(1));
        assert_eq!(db.create_entity().unwrap(), EntityId(2));
    }

    #[test]
    fn test_entity_id_exhaustion_is_an_error() {
        let mut db = db();
        db.next_entity_id = u32::MAX - 1;
        assert!(db.create_entity().is_ok());
        assert!(matches!(db.create_entity(), Err(EcsError::EntityIdsExhausted)));
    }

    #[test]
    fn test_two_phase_entity_deletion() {
        let mut db = db();
        let entity = db.create_entity().unwrap();
        db.insert(entity, Position { x: 1.0, y: 2.0 }).unwrap();
        db.insert(entity, Label("a".into())).unwrap();

        db.delete_entity(entity).unwrap();
        assert!(db.is_entity_deleted(entity));
        // Still physically present for replication to announce.
        assert!(db.get::<Position>(entity).is_some());
        assert_eq!(db.deletions(), (Vec::new(), vec![entity]));
        assert!(db.live_components().is_empty());

        db.release_deleted_state();
        assert!(!db.contains_entity(entity));
        assert!(db.get::<Position>(entity).is_none());
        assert_eq!(db.deletions(), (Vec::new(), Vec::new()));
    }

    #[test]
    fn test_component_deletion_keeps_entity_alive() {
        let mut db = db();
        let entity = db.create_entity().unwrap();
        let position = db.insert(entity, Position { x: 0.0, y: 0.0 }).unwrap();
        db.insert(entity, Label("keep".into())).unwrap();

        assert!(db.delete_component(position));
        assert_eq!(db.deletions(), (vec![position], Vec::new()));

        db.release_deleted_state();
        assert!(db.contains_entity(entity));
        assert!(db.get::<Position>(entity).is_none());
        assert_eq!(db.get::<Label>(entity).unwrap().0, "keep");
    }

    #[test]
    fn test_serialize_is_a_full_state_load() {
        let mut source = db();
        let a = source.create_entity().unwrap();
        let b = source.create_entity().unwrap();
        source.insert(a, Position { x: 1.5, y: -2.0 }).unwrap();
        source.insert(b, Label(String::new())).unwrap();
        source.delete_entity(b).unwrap();

        let mut target = db();
        let stale = target.create_entity().unwrap();
        target.insert(stale, Label("stale".into())).unwrap();
        target.insert(EntityId(9), Position { x: 0.0, y: 0.0 }).unwrap();

        target.deserialize(&source.serialize().unwrap()).unwrap();
        assert_eq!(target.next_entity_id(), 3);
        assert!(target.get::<Position>(EntityId(9)).is_none());
        assert_eq!(target.get::<Position>(a), Some(&Position { x: 1.5, y: -2.0 }));
        assert!(target.is_entity_deleted(b));
        assert_eq!(target.serialize().unwrap(), source.serialize().unwrap());
    }

    #[test]
    fn test_componentless_entity_survives_quantize() {
        let mut db = db();
        let bare = db.create_entity().unwrap();
        let other = db.create_entity().unwrap();
        db.insert(other, Label("x".into())).unwrap();

        db.quantize().unwrap();
        assert!(db.contains_entity(bare));
        assert_eq!(db.component_types_of(bare).count(), 0);
        assert_eq!(db.entity_ids().collect::<Vec<_>>(), vec![bare, other]);
        assert_eq!(db.next_entity_id(), 3);
    }

    #[test]
    fn test_upsert_encoded_advances_id_generator() {
        let mut db = db();
        let bytes = crate::codec::Codec::encode(&Position { x: 3.0, y: 4.0 }).unwrap();
        let type_id = db.types().id_of::<Position>().unwrap();
        db.upsert_encoded(ComponentId::new(type_id, EntityId(7)), &bytes).unwrap();
        assert_eq!(db.next_entity_id(), 8);
        assert_eq!(db.get::<Position>(EntityId(7)).unwrap().x, 3.0);
    }

    #[test]
    fn test_unregistered_component_is_rejected() {
        let mut types = ComponentTypes::new();
        types.register::<Position>().unwrap();
        let mut db = EntityComponentDb::new(Rc::new(types));
        let entity = db.create_entity().unwrap();
        assert!(matches!(
            db.insert(entity, Label("x".into())),
            Err(EcsError::UnregisteredComponent { .. })
        ));
    }
}
