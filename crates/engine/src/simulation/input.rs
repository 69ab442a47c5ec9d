use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use bytes::BufMut;

use crate::codec::{self, Codec, CodecError};
use crate::registry::TypeId;

use super::error::SimulationError;

/// A continuous input: its value holds from frame to frame until overwritten.
pub trait Input: Codec + Clone + Default + PartialEq + 'static {
    const NAME: &'static str;

    fn input_type_id() -> TypeId {
        TypeId::from_name(Self::NAME)
    }
}

trait ErasedInput {
    fn as_any(&self) -> &dyn Any;
    fn clone_box(&self) -> Box<dyn ErasedInput>;
    fn encode(&self) -> Result<Vec<u8>, CodecError>;
}

impl<T: Input> ErasedInput for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn clone_box(&self) -> Box<dyn ErasedInput> {
        Box::new(self.clone())
    }

    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Codec::encode(self)
    }
}

type InputDecoder = fn(&[u8]) -> Result<Box<dyn ErasedInput>, CodecError>;

fn decode_boxed<T: Input>(bytes: &[u8]) -> Result<Box<dyn ErasedInput>, CodecError> {
    Ok(Box::new(T::decode(bytes)?))
}

#[derive(Clone, Copy)]
pub struct InputTypeInfo {
    pub index: usize,
    pub name: &'static str,
    pub type_id: TypeId,
    decode: InputDecoder,
}

impl fmt::Debug for InputTypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputTypeInfo")
            .field("index", &self.index)
            .field("name", &self.name)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct InputTypes {
    infos: Vec<InputTypeInfo>,
    by_type_id: HashMap<TypeId, usize>,
}

impl InputTypes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Input>(&mut self) -> Result<usize, SimulationError> {
        let type_id = T::input_type_id();
        if self.by_type_id.contains_key(&type_id) {
            return Err(SimulationError::DuplicateInputType { name: T::NAME });
        }
        let index = self.infos.len();
        self.infos.push(InputTypeInfo {
            index,
            name: T::NAME,
            type_id,
            decode: decode_boxed::<T>,
        });
        self.by_type_id.insert(type_id, index);
        Ok(index)
    }

    pub fn get(&self, type_id: TypeId) -> Option<&InputTypeInfo> {
        self.infos.get(*self.by_type_id.get(&type_id)?)
    }

    pub fn iter(&self) -> impl Iterator<Item = &InputTypeInfo> {
        self.infos.iter()
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }
}

/// One player's inputs for one simulation instant, keyed by input type.
#[derive(Default)]
pub struct InputFrame {
    values: BTreeMap<TypeId, Box<dyn ErasedInput>>,
}

impl Clone for InputFrame {
    fn clone(&self) -> Self {
        Self {
            values: self
                .values
                .iter()
                .map(|(type_id, value)| (*type_id, value.clone_box()))
                .collect(),
        }
    }
}

impl fmt::Debug for InputFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

impl InputFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: Input>(mut self, value: T) -> Self {
        self.set(value);
        self
    }

    pub fn set<T: Input>(&mut self, value: T) {
        self.values.insert(T::input_type_id(), Box::new(value));
    }

    pub fn get<T: Input>(&self) -> Option<&T> {
        self.values.get(&T::input_type_id())?.as_any().downcast_ref::<T>()
    }

    /// Missing inputs read as their default value.
    pub fn get_or_default<T: Input>(&self) -> T {
        self.get::<T>().cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Count, then `(type id, length-prefixed bytes)` per input.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        out.put_u16(self.values.len() as u16);
        for (type_id, value) in &self.values {
            out.put_u64(type_id.0);
            codec::put_u32_prefixed(&mut out, &value.encode()?)?;
        }
        Ok(out)
    }

    pub fn decode(types: &InputTypes, data: &[u8]) -> Result<Self, SimulationError> {
        let mut buf = data;
        let mut frame = Self::new();
        if buf.is_empty() {
            return Ok(frame);
        }
        let count = codec::read_u16(&mut buf)?;
        for _ in 0..count {
            let type_id = TypeId(codec::read_u64(&mut buf)?);
            let bytes = codec::read_u32_prefixed(&mut buf)?;
            let info = types
                .get(type_id)
                .ok_or(SimulationError::UnknownInputType(type_id))?;
            frame.values.insert(type_id, (info.decode)(bytes)?);
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rkyv::{Archive, Deserialize, Serialize};

    #[derive(Debug, Clone, Default, PartialEq, Archive, Serialize, Deserialize)]
    struct Stick {
        x: i8,
        y: i8,
    }

    impl Input for Stick {
        const NAME: &'static str = "test.Stick";
    }

    #[derive(Debug, Clone, Default, PartialEq, Archive, Serialize, Deserialize)]
    struct Trigger(bool);

    impl Input for Trigger {
        const NAME: &'static str = "test.Trigger";
    }

    #[test]
    fn test_input_frame_encoding() {
        let mut types = InputTypes::new();
        types.register::<Stick>().unwrap();
        types.register::<Trigger>().unwrap();

        let frame = InputFrame::new().with(Stick { x: -3, y: 7 }).with(Trigger(true));
        let decoded = InputFrame::decode(&types, &frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.get::<Stick>(), Some(&Stick { x: -3, y: 7 }));
        assert_eq!(decoded.get::<Trigger>(), Some(&Trigger(true)));
        assert_eq!(decoded.encode().unwrap(), frame.encode().unwrap());
    }

    #[test]
    fn test_empty_bytes_decode_to_empty_frame() {
        let frame = InputFrame::decode(&InputTypes::new(), &[]).unwrap();
        assert!(frame.is_empty());
        assert_eq!(frame.get_or_default::<Trigger>(), Trigger(false));
    }

    #[test]
    fn test_unknown_input_type_is_rejected() {
        let frame = InputFrame::new().with(Trigger(true));
        let result = InputFrame::decode(&InputTypes::new(), &frame.encode().unwrap());
        assert!(matches!(result, Err(SimulationError::UnknownInputType(_))));
    }
}
