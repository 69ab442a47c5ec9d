use bytes::{Buf, BufMut};
use rkyv::api::high::{HighDeserializer, HighSerializer, HighValidator};
use rkyv::bytecheck::CheckBytes;
use rkyv::rancor;
use rkyv::ser::allocator::ArenaHandle;
use rkyv::util::AlignedVec;
use rkyv::Archive;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
    #[error("buffer truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    #[error("length {len} does not fit in a {max}-byte prefix")]
    LengthOverflow { len: usize, max: usize },
}

/// Binary encoding for payload types. Implemented for every rkyv-archivable
/// type whose archive can be validated.
pub trait Codec: Sized {
    fn encode(&self) -> Result<Vec<u8>, CodecError>;
    fn decode(bytes: &[u8]) -> Result<Self, CodecError>;
}

impl<T> Codec for T
where
    T: Archive + for<'a> rkyv::Serialize<HighSerializer<AlignedVec, ArenaHandle<'a>, rancor::Error>>,
    T::Archived: for<'a> CheckBytes<HighValidator<'a, rancor::Error>>
        + rkyv::Deserialize<T, HighDeserializer<rancor::Error>>,
{
    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(CodecError::Serialize)
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        // Slices cut out of a packet carry no alignment guarantee.
        let mut aligned = AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<T, rancor::Error>(&aligned).map_err(CodecError::Deserialize)
    }
}

fn ensure(buf: &[u8], needed: usize) -> Result<(), CodecError> {
    if buf.remaining() < needed {
        return Err(CodecError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

pub fn read_u8(buf: &mut &[u8]) -> Result<u8, CodecError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn read_u16(buf: &mut &[u8]) -> Result<u16, CodecError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

pub fn read_u32(buf: &mut &[u8]) -> Result<u32, CodecError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

pub fn read_u64(buf: &mut &[u8]) -> Result<u64, CodecError> {
    ensure(buf, 8)?;
    Ok(buf.get_u64())
}

pub fn read_bytes<'a>(buf: &mut &'a [u8], len: usize) -> Result<&'a [u8], CodecError> {
    ensure(buf, len)?;
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

pub fn read_u16_prefixed<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], CodecError> {
    let len = read_u16(buf)? as usize;
    read_bytes(buf, len)
}

pub fn read_u32_prefixed<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], CodecError> {
    let len = read_u32(buf)? as usize;
    read_bytes(buf, len)
}

pub fn put_u16_prefixed<B: BufMut>(out: &mut B, bytes: &[u8]) -> Result<(), CodecError> {
    let len = u16::try_from(bytes.len()).map_err(|_| CodecError::LengthOverflow {
        len: bytes.len(),
        max: 2,
    })?;
    out.put_u16(len);
    out.put_slice(bytes);
    Ok(())
}

pub fn put_u32_prefixed<B: BufMut>(out: &mut B, bytes: &[u8]) -> Result<(), CodecError> {
    let len = u32::try_from(bytes.len()).map_err(|_| CodecError::LengthOverflow {
        len: bytes.len(),
        max: 4,
    })?;
    out.put_u32(len);
    out.put_slice(bytes);
    Ok(())
}
