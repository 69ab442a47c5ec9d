use std::any::Any;
use std::collections::BTreeMap;

use crate::codec::CodecError;

use super::component::{Component, EntityId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone)]
pub struct StoredComponent<T> {
    pub owner: EntityId,
    pub data: T,
    pub deleted: bool,
}

#[derive(Debug, Clone)]
struct Slot<T> {
    generation: u32,
    value: Option<StoredComponent<T>>,
}

/// Generation-tagged slots for one component type. Deleting flips a tombstone
/// flag; `release` reclaims the slot and bumps its generation.
#[derive(Debug, Clone)]
pub struct Storage<T> {
    slots: Vec<Slot<T>>,
    by_owner: BTreeMap<EntityId, SlotKey>,
    free: Vec<u32>,
}

impl<T> Default for Storage<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            by_owner: BTreeMap::new(),
            free: Vec::new(),
        }
    }
}

impl<T: Component> Storage<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key_of(&self, owner: EntityId) -> Option<SlotKey> {
        self.by_owner.get(&owner).copied()
    }

    pub fn get_by_key(&self, key: SlotKey) -> Option<&StoredComponent<T>> {
        let slot = self.slots.get(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get(&self, owner: EntityId) -> Option<&StoredComponent<T>> {
        self.get_by_key(self.key_of(owner)?)
    }

    pub fn get_mut(&mut self, owner: EntityId) -> Option<&mut StoredComponent<T>> {
        let key = self.key_of(owner)?;
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.value.as_mut()
    }

    /// Inserts or overwrites, clearing any tombstone.
    pub fn upsert(&mut self, owner: EntityId, data: T) -> SlotKey {
        if let Some(key) = self.key_of(owner) {
            if let Some(existing) = self.slots[key.index as usize].value.as_mut() {
                existing.data = data;
                existing.deleted = false;
                return key;
            }
        }

        let stored = StoredComponent {
            owner,
            data,
            deleted: false,
        };
        let key = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.value = Some(stored);
                SlotKey {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    value: Some(stored),
                });
                SlotKey {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        };
        self.by_owner.insert(owner, key);
        key
    }

    pub fn iter(&self) -> impl Iterator<Item = &StoredComponent<T>> {
        self.by_owner.values().filter_map(|key| self.get_by_key(*key))
    }

    pub fn owners(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.by_owner.keys().copied()
    }
}

pub trait ErasedStorage {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn clone_box(&self) -> Box<dyn ErasedStorage>;
    fn len(&self) -> usize;
    fn is_deleted(&self, owner: EntityId) -> Option<bool>;
    fn set_deleted(&mut self, owner: EntityId) -> bool;
    fn release(&mut self, owner: EntityId) -> bool;
    /// Owners in ascending id order with their tombstone flag.
    fn entries(&self) -> Vec<(EntityId, bool)>;
    fn encode(&self, owner: EntityId) -> Result<Option<Vec<u8>>, CodecError>;
    fn upsert_encoded(&mut self, owner: EntityId, bytes: &[u8], deleted: bool) -> Result<(), CodecError>;
    fn clear(&mut self);
}

impl<T: Component> ErasedStorage for Storage<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn clone_box(&self) -> Box<dyn ErasedStorage> {
        Box::new(self.clone())
    }

    fn len(&self) -> usize {
        self.by_owner.len()
    }

    fn is_deleted(&self, owner: EntityId) -> Option<bool> {
        self.get(owner).map(|stored| stored.deleted)
    }

    fn set_deleted(&mut self, owner: EntityId) -> bool {
        match self.get_mut(owner) {
            Some(stored) => {
                stored.deleted = true;
                true
            }
            None => false,
        }
    }

    fn release(&mut self, owner: EntityId) -> bool {
        let Some(key) = self.by_owner.remove(&owner) else {
            return false;
        };
        let slot = &mut self.slots[key.index as usize];
        slot.value = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        true
    }

    fn entries(&self) -> Vec<(EntityId, bool)> {
        self.iter().map(|stored| (stored.owner, stored.deleted)).collect()
    }

    fn encode(&self, owner: EntityId) -> Result<Option<Vec<u8>>, CodecError> {
        self.get(owner).map(|stored| stored.data.encode()).transpose()
    }

    fn upsert_encoded(&mut self, owner: EntityId, bytes: &[u8], deleted: bool) -> Result<(), CodecError> {
        let data = T::decode(bytes)?;
        self.upsert(owner, data);
        if deleted {
            self.set_deleted(owner);
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.slots.clear();
        self.by_owner.clear();
        self.free.clear();
    }
}
