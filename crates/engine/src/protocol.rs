use rkyv::{Archive, Deserialize, Serialize};

use crate::codec::{Codec, CodecError};
use crate::registry::{ClassKind, ClassRegistry, RegistryError, ShortTypeId, TypeId};

pub const DEFAULT_PORT: u16 = 27016;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ClassDictionaryEntry {
    pub type_id: u64,
    pub short_type_id: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct HandshakeMessage {
    pub classes: Vec<ClassDictionaryEntry>,
}

impl HandshakeMessage {
    pub fn from_registry(registry: &ClassRegistry) -> Self {
        Self {
            classes: registry
                .dictionary()
                .into_iter()
                .map(|(type_id, short_id)| ClassDictionaryEntry {
                    type_id: type_id.0,
                    short_type_id: short_id.0,
                })
                .collect(),
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (TypeId, ShortTypeId)> + '_ {
        self.classes
            .iter()
            .map(|entry| (TypeId(entry.type_id), ShortTypeId(entry.short_type_id)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct TimeSyncRequest {
    pub client_time_s: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct TimeSyncResponse {
    pub client_time_s: f64,
    pub server_time_s: f64,
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct InputFrameMessage {
    pub target_simulation_time_s: f64,
    pub input_frame: Vec<u8>,
    pub sequence_number: u32,
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct PlayerInputs {
    pub player_id: u32,
    pub input_frame: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct InputsUsedMessage {
    pub frame_index: u32,
    pub simulation_time_s: f64,
    pub inputs: Vec<PlayerInputs>,
}

/// `short_type_id` is in the sender's numbering.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ComponentUpdate {
    pub short_type_id: u16,
    pub owner_id: u32,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ComponentStateMessage {
    pub frame_index: u32,
    pub simulation_time_s: f64,
    pub components: Vec<ComponentUpdate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ComponentRef {
    pub short_type_id: u16,
    pub owner_id: u32,
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct DeletionsMessage {
    pub frame_index: u32,
    pub simulation_time_s: f64,
    pub component_ids: Vec<ComponentRef>,
    pub entity_ids: Vec<u32>,
}

impl DeletionsMessage {
    pub fn is_empty(&self) -> bool {
        self.component_ids.is_empty() && self.entity_ids.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Handshake(HandshakeMessage),
    TimeSyncRequest(TimeSyncRequest),
    TimeSyncResponse(TimeSyncResponse),
    InputFrame(InputFrameMessage),
    InputsUsed(InputsUsedMessage),
    ComponentState(ComponentStateMessage),
    Deletions(DeletionsMessage),
}

pub trait ProtocolMessage: Codec + Into<Message> {
    const NAME: &'static str;
}

macro_rules! protocol_message {
    ($ty:ident, $variant:ident, $name:literal) => {
        impl ProtocolMessage for $ty {
            const NAME: &'static str = $name;
        }

        impl From<$ty> for Message {
            fn from(message: $ty) -> Self {
                Message::$variant(message)
            }
        }
    };
}

protocol_message!(HandshakeMessage, Handshake, "rollnet.Handshake");
protocol_message!(TimeSyncRequest, TimeSyncRequest, "rollnet.TimeSyncRequest");
protocol_message!(TimeSyncResponse, TimeSyncResponse, "rollnet.TimeSyncResponse");
protocol_message!(InputFrameMessage, InputFrame, "rollnet.InputFrame");
protocol_message!(InputsUsedMessage, InputsUsed, "rollnet.InputsUsed");
protocol_message!(ComponentStateMessage, ComponentState, "rollnet.ComponentState");
protocol_message!(DeletionsMessage, Deletions, "rollnet.Deletions");

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::Handshake(_) => HandshakeMessage::NAME,
            Message::TimeSyncRequest(_) => TimeSyncRequest::NAME,
            Message::TimeSyncResponse(_) => TimeSyncResponse::NAME,
            Message::InputFrame(_) => InputFrameMessage::NAME,
            Message::InputsUsed(_) => InputsUsedMessage::NAME,
            Message::ComponentState(_) => ComponentStateMessage::NAME,
            Message::Deletions(_) => DeletionsMessage::NAME,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        match self {
            Message::Handshake(message) => message.encode(),
            Message::TimeSyncRequest(message) => message.encode(),
            Message::TimeSyncResponse(message) => message.encode(),
            Message::InputFrame(message) => message.encode(),
            Message::InputsUsed(message) => message.encode(),
            Message::ComponentState(message) => message.encode(),
            Message::Deletions(message) => message.encode(),
        }
    }
}

fn decode_as<T: ProtocolMessage>(bytes: &[u8]) -> Result<Message, CodecError> {
    T::decode(bytes).map(Into::into)
}

pub fn decode_handshake(bytes: &[u8]) -> Result<HandshakeMessage, CodecError> {
    HandshakeMessage::decode(bytes)
}

fn register<T: ProtocolMessage>(registry: &mut ClassRegistry) -> Result<ShortTypeId, RegistryError> {
    registry.register(T::NAME, ClassKind::Message(decode_as::<T>))
}

/// Registers every built-in message except the handshake, which is fixed at
/// short id zero.
pub fn register_messages(registry: &mut ClassRegistry) -> Result<(), RegistryError> {
    register::<TimeSyncRequest>(registry)?;
    register::<TimeSyncResponse>(registry)?;
    register::<InputFrameMessage>(registry)?;
    register::<InputsUsedMessage>(registry)?;
    register::<ComponentStateMessage>(registry)?;
    register::<DeletionsMessage>(registry)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_registered(registry: &ClassRegistry, message: &Message) -> Message {
        let short_id = registry.short_id_of_name(message.name()).unwrap();
        let ClassKind::Message(decode) = registry.entry(short_id).unwrap().kind else {
            panic!("{} is not a message class", message.name());
        };
        decode(&message.encode().unwrap()).unwrap()
    }

    #[test]
    fn test_builtin_messages_roundtrip_through_registry() {
        let mut registry = ClassRegistry::new();
        register_messages(&mut registry).unwrap();

        let messages = vec![
            Message::from(TimeSyncRequest { client_time_s: 1.5 }),
            Message::from(TimeSyncResponse {
                client_time_s: 1.5,
                server_time_s: 9.25,
            }),
            Message::from(InputFrameMessage {
                target_simulation_time_s: 3.0,
                input_frame: Vec::new(),
                sequence_number: 42,
            }),
            Message::from(InputsUsedMessage {
                frame_index: 7,
                simulation_time_s: 0.35,
                inputs: vec![PlayerInputs {
                    player_id: 1,
                    input_frame: vec![1, 2, 3],
                }],
            }),
            Message::from(ComponentStateMessage {
                frame_index: 7,
                simulation_time_s: 0.35,
                components: vec![ComponentUpdate {
                    short_type_id: 2,
                    owner_id: 5,
                    bytes: Vec::new(),
                }],
            }),
            Message::from(DeletionsMessage {
                frame_index: 8,
                simulation_time_s: 0.4,
                component_ids: vec![ComponentRef {
                    short_type_id: 3,
                    owner_id: 9,
                }],
                entity_ids: vec![9, 10],
            }),
        ];

        for message in &messages {
            assert_eq!(&decode_registered(&registry, message), message);
        }
    }

    #[test]
    fn test_handshake_carries_registry_dictionary() {
        let mut registry = ClassRegistry::new();
        register_messages(&mut registry).unwrap();
        let handshake = HandshakeMessage::from_registry(&registry);
        let decoded = decode_handshake(&handshake.encode().unwrap()).unwrap();
        assert_eq!(decoded.entries().collect::<Vec<_>>(), registry.dictionary());
    }

    #[test]
    fn test_empty_deletions() {
        let message = DeletionsMessage {
            frame_index: 1,
            simulation_time_s: 0.0,
            component_ids: Vec::new(),
            entity_ids: Vec::new(),
        };
        assert!(message.is_empty());
    }
}
