use super::component::{Component, ComponentId, EntityId};
use super::db::EntityComponentDb;
use super::error::EcsError;

/// Read-only view that treats deleted entities and components as absent.
#[derive(Clone, Copy)]
pub struct EntityComponentStateRef<'a> {
    db: &'a EntityComponentDb,
}

impl<'a> EntityComponentStateRef<'a> {
    pub(crate) fn new(db: &'a EntityComponentDb) -> Self {
        Self { db }
    }

    pub fn raw(self) -> &'a EntityComponentDb {
        self.db
    }

    pub fn contains_entity(self, entity: EntityId) -> bool {
        self.db.contains_entity(entity) && !self.db.is_entity_deleted(entity)
    }

    pub fn entities(self) -> impl Iterator<Item = EntityId> + 'a {
        let db = self.db;
        db.entity_ids().filter(move |entity| !db.is_entity_deleted(*entity))
    }

    pub fn get<T: Component>(self, entity: EntityId) -> Option<&'a T> {
        if self.db.is_entity_deleted(entity) {
            return None;
        }
        self.db
            .get_stored::<T>(entity)
            .filter(|stored| !stored.deleted)
            .map(|stored| &stored.data)
    }

    pub fn query<T: Component>(self) -> impl Iterator<Item = (EntityId, &'a T)> + 'a {
        let db = self.db;
        db.storage::<T>()
            .into_iter()
            .flat_map(|storage| storage.iter())
            .filter(move |stored| !stored.deleted && !db.is_entity_deleted(stored.owner))
            .map(|stored| (stored.owner, &stored.data))
    }

    /// Entities holding both component types.
    pub fn query2<A: Component, B: Component>(self) -> impl Iterator<Item = (EntityId, &'a A, &'a B)> + 'a {
        self.query::<A>()
            .filter_map(move |(entity, a)| self.get::<B>(entity).map(|b| (entity, a, b)))
    }
}

/// Mutable view handed to systems. Deleted state is invisible but the
/// underlying store keeps it for replication.
pub struct EntityComponentState<'a> {
    db: &'a mut EntityComponentDb,
}

impl<'a> EntityComponentState<'a> {
    pub(crate) fn new(db: &'a mut EntityComponentDb) -> Self {
        Self { db }
    }

    pub fn read(&self) -> EntityComponentStateRef<'_> {
        EntityComponentStateRef::new(self.db)
    }

    pub fn contains_entity(&self, entity: EntityId) -> bool {
        self.read().contains_entity(entity)
    }

    pub fn get<T: Component>(&self, entity: EntityId) -> Option<&T> {
        self.read().get::<T>(entity)
    }

    pub fn get_mut<T: Component>(&mut self, entity: EntityId) -> Option<&mut T> {
        if self.db.is_entity_deleted(entity) {
            return None;
        }
        let stored = self.db.storage_mut::<T>()?.get_mut(entity)?;
        if stored.deleted {
            return None;
        }
        Some(&mut stored.data)
    }

    pub fn query<T: Component>(&self) -> impl Iterator<Item = (EntityId, &T)> + '_ {
        EntityComponentStateRef::new(self.db).query::<T>()
    }

    /// Snapshot of the live owners of `T`, for mutating while iterating.
    pub fn entities_with<T: Component>(&self) -> Vec<EntityId> {
        self.query::<T>().map(|(entity, _)| entity).collect()
    }

    pub fn create_entity(&mut self) -> Result<EntityId, EcsError> {
        self.db.create_entity()
    }

    pub fn insert<T: Component>(&mut self, entity: EntityId, value: T) -> Result<ComponentId, EcsError> {
        if self.db.is_entity_deleted(entity) {
            return Err(EcsError::NoSuchEntity(entity));
        }
        self.db.insert(entity, value)
    }

    pub fn delete_entity(&mut self, entity: EntityId) -> Result<(), EcsError> {
        if !self.contains_entity(entity) {
            return Err(EcsError::NoSuchEntity(entity));
        }
        self.db.delete_entity(entity)
    }

    pub fn delete_component<T: Component>(&mut self, entity: EntityId) -> bool {
        match self.db.types().id_of::<T>() {
            Some(type_id) => self.db.delete_component(ComponentId::new(type_id, entity)),
            None => false,
        }
    }
}
