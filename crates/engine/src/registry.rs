use std::collections::HashMap;
use std::fmt;

use crate::codec::CodecError;
use crate::ecs::ComponentTypeId;
use crate::protocol::Message;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Stable 64-bit id derived from a globally unique type name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u64);

impl TypeId {
    pub const fn from_name(name: &str) -> Self {
        let bytes = name.as_bytes();
        let mut hash = FNV_OFFSET_BASIS;
        let mut i = 0;
        while i < bytes.len() {
            hash ^= bytes[i] as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
            i += 1;
        }
        Self(hash)
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Connection-local class index. Zero is the handshake and never renegotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShortTypeId(pub u16);

pub const HANDSHAKE_SHORT_TYPE_ID: ShortTypeId = ShortTypeId(0);

pub type MessageDecoder = fn(&[u8]) -> Result<Message, CodecError>;

#[derive(Debug, Clone, Copy)]
pub enum ClassKind {
    Message(MessageDecoder),
    Component(ComponentTypeId),
    Input(usize),
}

#[derive(Debug, Clone)]
pub struct ClassEntry {
    pub name: &'static str,
    pub type_id: TypeId,
    pub short_id: ShortTypeId,
    pub kind: ClassKind,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("class {name} is already registered")]
    Duplicate { name: &'static str },
    #[error("class {name} collides with {existing} on type id {type_id}")]
    HashCollision {
        name: &'static str,
        existing: &'static str,
        type_id: TypeId,
    },
    #[error("too many registered classes")]
    Exhausted,
    #[error("unknown short type id {0}")]
    UnknownShortId(u16),
    #[error("remote dictionary maps short id {0} twice")]
    DuplicateRemoteShortId(u16),
    #[error("remote dictionary must not rebind the handshake id")]
    HandshakeRebound,
    #[error("type {0} is not registered")]
    UnknownTypeId(TypeId),
}

/// Name, type id and short id of every class that may cross the wire.
#[derive(Debug, Clone)]
pub struct ClassRegistry {
    entries: Vec<ClassEntry>,
    by_type_id: HashMap<TypeId, ShortTypeId>,
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassRegistry {
    /// Starts at short id 1; id 0 belongs to the handshake.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            by_type_id: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &'static str, kind: ClassKind) -> Result<ShortTypeId, RegistryError> {
        let type_id = TypeId::from_name(name);
        if let Some(existing) = self.by_type_id.get(&type_id).and_then(|id| self.get(*id)) {
            return Err(if existing.name == name {
                RegistryError::Duplicate { name }
            } else {
                RegistryError::HashCollision {
                    name,
                    existing: existing.name,
                    type_id,
                }
            });
        }

        let index = u16::try_from(self.entries.len() + 1).map_err(|_| RegistryError::Exhausted)?;
        let short_id = ShortTypeId(index);
        self.entries.push(ClassEntry {
            name,
            type_id,
            short_id,
            kind,
        });
        self.by_type_id.insert(type_id, short_id);
        log::debug!("Registered class {} as {} ({})", name, short_id.0, type_id);
        Ok(short_id)
    }

    pub fn get(&self, short_id: ShortTypeId) -> Option<&ClassEntry> {
        let index = usize::from(short_id.0).checked_sub(1)?;
        self.entries.get(index)
    }

    pub fn entry(&self, short_id: ShortTypeId) -> Result<&ClassEntry, RegistryError> {
        self.get(short_id)
            .ok_or(RegistryError::UnknownShortId(short_id.0))
    }

    pub fn short_id_of(&self, type_id: TypeId) -> Option<ShortTypeId> {
        self.by_type_id.get(&type_id).copied()
    }

    pub fn short_id_of_name(&self, name: &str) -> Result<ShortTypeId, RegistryError> {
        let type_id = TypeId::from_name(name);
        self.short_id_of(type_id)
            .ok_or(RegistryError::UnknownTypeId(type_id))
    }

    pub fn entries(&self) -> impl Iterator<Item = &ClassEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The `(type id, short id)` pairs sent in the handshake.
    pub fn dictionary(&self) -> Vec<(TypeId, ShortTypeId)> {
        self.entries
            .iter()
            .map(|entry| (entry.type_id, entry.short_id))
            .collect()
    }
}

/// Maps the remote side's short ids onto ours.
#[derive(Debug, Clone, Default)]
pub struct RemoteClassMap {
    remote_to_local: HashMap<u16, ShortTypeId>,
}

impl RemoteClassMap {
    pub fn from_dictionary(
        registry: &ClassRegistry,
        dictionary: impl IntoIterator<Item = (TypeId, ShortTypeId)>,
    ) -> Result<Self, RegistryError> {
        let mut remote_to_local = HashMap::new();
        for (type_id, remote) in dictionary {
            if remote == HANDSHAKE_SHORT_TYPE_ID {
                return Err(RegistryError::HandshakeRebound);
            }
            // Classes only the remote knows about stay unmapped until used.
            let Some(local) = registry.short_id_of(type_id) else {
                log::debug!("Remote class {} has no local counterpart", type_id);
                continue;
            };
            if remote_to_local.insert(remote.0, local).is_some() {
                return Err(RegistryError::DuplicateRemoteShortId(remote.0));
            }
        }
        Ok(Self { remote_to_local })
    }

    pub fn resolve(&self, remote: u16) -> Result<ShortTypeId, RegistryError> {
        if remote == HANDSHAKE_SHORT_TYPE_ID.0 {
            return Ok(HANDSHAKE_SHORT_TYPE_ID);
        }
        self.remote_to_local
            .get(&remote)
            .copied()
            .ok_or(RegistryError::UnknownShortId(remote))
    }

    pub fn len(&self) -> usize {
        self.remote_to_local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remote_to_local.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_id_is_stable_fnv1a() {
        // Reference FNV-1a 64 values.
        assert_eq!(TypeId::from_name("").0, 0xcbf2_9ce4_8422_2325);
        assert_eq!(TypeId::from_name("a").0, 0xaf63_dc4c_8601_ec8c);
        assert_ne!(TypeId::from_name("demo.Position"), TypeId::from_name("demo.Velocity"));
    }

    #[test]
    fn test_short_ids_start_after_handshake() {
        let mut registry = ClassRegistry::new();
        let first = registry.register("a.First", ClassKind::Input(0)).unwrap();
        let second = registry.register("a.Second", ClassKind::Input(1)).unwrap();
        assert_eq!(first, ShortTypeId(1));
        assert_eq!(second, ShortTypeId(2));
        assert!(registry.get(HANDSHAKE_SHORT_TYPE_ID).is_none());
        assert_eq!(registry.entry(second).unwrap().name, "a.Second");
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = ClassRegistry::new();
        registry.register("a.Same", ClassKind::Input(0)).unwrap();
        assert!(matches!(
            registry.register("a.Same", ClassKind::Input(1)),
            Err(RegistryError::Duplicate { .. })
        ));
    }

    #[test]
    fn test_remote_map_translates_differing_orders() {
        let mut local = ClassRegistry::new();
        local.register("x.A", ClassKind::Input(0)).unwrap();
        local.register("x.B", ClassKind::Input(1)).unwrap();

        let mut remote = ClassRegistry::new();
        remote.register("x.Only", ClassKind::Input(0)).unwrap();
        remote.register("x.B", ClassKind::Input(1)).unwrap();
        remote.register("x.A", ClassKind::Input(2)).unwrap();

        let map = RemoteClassMap::from_dictionary(&local, remote.dictionary()).unwrap();
        assert_eq!(map.resolve(3).unwrap(), ShortTypeId(1));
        assert_eq!(map.resolve(2).unwrap(), ShortTypeId(2));
        assert!(matches!(map.resolve(1), Err(RegistryError::UnknownShortId(1))));
        assert_eq!(map.resolve(0).unwrap(), HANDSHAKE_SHORT_TYPE_ID);
    }

    #[test]
    fn test_remote_map_rejects_handshake_rebinding() {
        let local = ClassRegistry::new();
        let result = RemoteClassMap::from_dictionary(&local, [(TypeId(1), HANDSHAKE_SHORT_TYPE_ID)]);
        assert!(matches!(result, Err(RegistryError::HandshakeRebound)));
    }
}
