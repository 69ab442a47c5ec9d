use bytes::BufMut;

use crate::codec::{self, CodecError};

use super::sequence::SequenceNumber;

/// sequence + ack + bitfield + payload length prefix.
pub const PACKET_HEADER_SIZE: usize = 2 + 2 + 4 + 2;
pub const DEFAULT_MTU: usize = 1200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub sequence: SequenceNumber,
    pub ack_sequence: SequenceNumber,
    pub ack_bitfield: u32,
}

impl PacketHeader {
    pub fn new(sequence: SequenceNumber, ack_sequence: SequenceNumber, ack_bitfield: u32) -> Self {
        Self {
            sequence,
            ack_sequence,
            ack_bitfield,
        }
    }

    /// Every sequence number this header acknowledges: the direct ack first,
    /// then one per set bit.
    pub fn acked_sequences(&self) -> impl Iterator<Item = SequenceNumber> + '_ {
        std::iter::once(self.ack_sequence).chain(
            (0..32u16)
                .filter(|bit| self.ack_bitfield & (1u32 << *bit) != 0)
                .map(|bit| self.ack_sequence.wrapping_sub(bit + 1)),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet<'a> {
    pub header: PacketHeader,
    pub payload: &'a [u8],
}

impl<'a> Packet<'a> {
    pub fn encode(header: &PacketHeader, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(PACKET_HEADER_SIZE + payload.len());
        out.put_u16(header.sequence.value());
        out.put_u16(header.ack_sequence.value());
        out.put_u32(header.ack_bitfield);
        codec::put_u16_prefixed(&mut out, payload)?;
        Ok(out)
    }

    pub fn decode(data: &'a [u8]) -> Result<Self, CodecError> {
        let mut buf = data;
        let sequence = SequenceNumber(codec::read_u16(&mut buf)?);
        let ack_sequence = SequenceNumber(codec::read_u16(&mut buf)?);
        let ack_bitfield = codec::read_u32(&mut buf)?;
        let payload = codec::read_u16_prefixed(&mut buf)?;
        Ok(Self {
            header: PacketHeader::new(sequence, ack_sequence, ack_bitfield),
            payload,
        })
    }
}
