use std::collections::BTreeMap;

use bytes::BufMut;

use crate::codec;

use super::acking::{AckingPeer, PACKET_HISTORY_SIZE};
use super::error::NetError;
use super::sequence::{AbsoluteSequenceNumberTranslator, HALFWAY_POINT, QUARTER_POINT, SequenceNumber};
use super::transport::Transport;

/// sequence + payload type + payload length prefix.
pub const WIRE_MESSAGE_HEADER_SIZE: usize = 2 + 2 + 2;
pub const RECEIVE_HISTORY_SIZE: usize = QUARTER_POINT as usize;
pub const DEFAULT_PACK_SLACK_BYTES: usize = 8;
const WINDOW_WARNING_INTERVAL_S: f64 = 1.0;
const EMPTY_SLOT: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageHandle(pub u64);

#[derive(Debug, Clone)]
struct OutgoingMessage {
    sequence: SequenceNumber,
    payload_type: u16,
    payload: Vec<u8>,
    priority: u32,
    /// `None` retries until acked; `Some(0)` is dropped on the next flush.
    ttl: Option<u32>,
    acked: bool,
}

impl OutgoingMessage {
    fn wire_size(&self) -> usize {
        WIRE_MESSAGE_HEADER_SIZE + self.payload.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub payload_type: u16,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct ReceivedMessages {
    pub messages: Vec<IncomingMessage>,
    /// Reported once per message, even if it expired before the ack arrived.
    pub acked: Vec<MessageHandle>,
}

pub fn write_wire_message(
    out: &mut Vec<u8>,
    sequence: SequenceNumber,
    payload_type: u16,
    payload: &[u8],
) -> Result<(), NetError> {
    out.put_u16(sequence.value());
    out.put_u16(payload_type);
    codec::put_u16_prefixed(out, payload)?;
    Ok(())
}

/// Prioritized, unordered, optionally TTL-bounded messages over one
/// [`AckingPeer`].
pub struct MessagePeer {
    peer: AckingPeer,
    next_absolute: u64,
    outgoing: BTreeMap<u64, OutgoingMessage>,
    in_flight: Vec<Option<(SequenceNumber, Vec<u64>)>>,
    acked_history: Vec<u64>,
    translator: AbsoluteSequenceNumberTranslator,
    received_history: Vec<u64>,
    pack_slack_bytes: usize,
    last_window_warning_s: Option<f64>,
}

impl MessagePeer {
    pub fn new(transport: Box<dyn Transport>, mtu: usize) -> Self {
        Self::from_acking_peer(AckingPeer::with_mtu(transport, mtu))
    }

    pub fn from_acking_peer(peer: AckingPeer) -> Self {
        Self {
            peer,
            next_absolute: 0,
            outgoing: BTreeMap::new(),
            in_flight: vec![None; PACKET_HISTORY_SIZE],
            acked_history: vec![EMPTY_SLOT; RECEIVE_HISTORY_SIZE],
            translator: AbsoluteSequenceNumberTranslator::new(),
            received_history: vec![EMPTY_SLOT; RECEIVE_HISTORY_SIZE],
            pack_slack_bytes: DEFAULT_PACK_SLACK_BYTES,
            last_window_warning_s: None,
        }
    }

    pub fn with_pack_slack(mut self, bytes: usize) -> Self {
        self.pack_slack_bytes = bytes;
        self
    }

    pub fn peer(&self) -> &AckingPeer {
        &self.peer
    }

    pub fn peer_mut(&mut self) -> &mut AckingPeer {
        &mut self.peer
    }

    pub fn mtu(&self) -> usize {
        self.peer.mtu()
    }

    pub fn pending_messages(&self) -> usize {
        self.outgoing.len()
    }

    pub fn send_message(
        &mut self,
        payload_type: u16,
        payload: Vec<u8>,
        ttl: Option<u32>,
    ) -> Result<MessageHandle, NetError> {
        if self.peer.is_closed() {
            return Err(NetError::Closed);
        }
        if payload.len() > usize::from(u16::MAX) {
            return Err(NetError::PayloadTooLarge {
                len: payload.len(),
                max: usize::from(u16::MAX),
            });
        }

        let absolute = self.next_absolute;
        self.next_absolute += 1;
        self.outgoing.insert(
            absolute,
            OutgoingMessage {
                sequence: SequenceNumber(absolute as u16),
                payload_type,
                payload,
                priority: 0,
                ttl,
                acked: false,
            },
        );
        Ok(MessageHandle(absolute))
    }

    /// Stops retransmitting a message. A later ack is still reported.
    pub fn expire(&mut self, handle: MessageHandle) {
        if let Some(message) = self.outgoing.get_mut(&handle.0) {
            message.ttl = Some(0);
        }
    }

    /// Packs the highest-priority messages into one packet and sends it.
    pub fn flush(&mut self, now_s: f64) -> Result<Option<SequenceNumber>, NetError> {
        self.outgoing
            .retain(|_, message| !message.acked && message.ttl != Some(0));

        let Some(&oldest_unacked) = self.outgoing.keys().next() else {
            return Ok(None);
        };
        let window_end = oldest_unacked + u64::from(HALFWAY_POINT);

        let mut candidates: Vec<(u32, u64)> = self
            .outgoing
            .iter_mut()
            .map(|(&absolute, message)| {
                message.priority = message.priority.saturating_add(1);
                (message.priority, absolute)
            })
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let budget = self.peer.max_payload_size();
        let mut payload = Vec::with_capacity(budget);
        let mut included = Vec::new();
        let mut deferred = 0usize;

        for (_, absolute) in candidates {
            if absolute >= window_end {
                deferred += 1;
                continue;
            }
            let Some(message) = self.outgoing.get(&absolute) else {
                continue;
            };
            // The first candidate always goes out, even oversized.
            if !included.is_empty() && payload.len() + message.wire_size() > budget {
                continue;
            }
            write_wire_message(&mut payload, message.sequence, message.payload_type, &message.payload)?;
            included.push(absolute);
            if budget.saturating_sub(payload.len()) <= self.pack_slack_bytes {
                break;
            }
        }

        if deferred > 0 {
            let due = self
                .last_window_warning_s
                .is_none_or(|last| now_s - last >= WINDOW_WARNING_INTERVAL_S);
            if due {
                log::warn!(
                    "Deferred {} messages beyond the receive window (oldest unacked {})",
                    deferred,
                    oldest_unacked
                );
                self.last_window_warning_s = Some(now_s);
            }
        }

        if included.is_empty() {
            return Ok(None);
        }

        let sequence = self.peer.send_packet(&payload, now_s)?;
        for absolute in &included {
            if let Some(message) = self.outgoing.get_mut(absolute) {
                message.priority = 0;
                if let Some(ttl) = message.ttl.as_mut() {
                    *ttl = ttl.saturating_sub(1);
                }
            }
        }
        self.peer.stats_mut().messages_sent += included.len() as u64;
        self.in_flight[sequence.value() as usize % PACKET_HISTORY_SIZE] = Some((sequence, included));

        Ok(Some(sequence))
    }

    pub fn receive(&mut self, data: &[u8], now_s: f64) -> Result<ReceivedMessages, NetError> {
        let packet = self.peer.receive_packet(data, now_s)?;
        let mut received = ReceivedMessages::default();

        for sequence in packet.acked {
            let slot = sequence.value() as usize % PACKET_HISTORY_SIZE;
            let Some((in_flight_sequence, messages)) = self.in_flight[slot].take() else {
                continue;
            };
            if in_flight_sequence != sequence {
                self.in_flight[slot] = Some((in_flight_sequence, messages));
                continue;
            }
            for absolute in messages {
                if self.mark_acked(absolute) {
                    received.acked.push(MessageHandle(absolute));
                }
            }
        }

        let Some(payload) = packet.payload else {
            return Ok(received);
        };

        let mut buf = &payload[..];
        while !buf.is_empty() {
            let sequence = SequenceNumber(codec::read_u16(&mut buf)?);
            let payload_type = codec::read_u16(&mut buf)?;
            let bytes = codec::read_u16_prefixed(&mut buf)?;

            let absolute = self.translator.translate(sequence);
            let slot = (absolute % RECEIVE_HISTORY_SIZE as u64) as usize;
            let seen = self.received_history[slot];
            if seen != EMPTY_SLOT && seen >= absolute {
                self.peer.stats_mut().duplicate_messages += 1;
                continue;
            }
            self.received_history[slot] = absolute;
            self.peer.stats_mut().messages_received += 1;
            received.messages.push(IncomingMessage {
                payload_type,
                payload: bytes.to_vec(),
            });
        }

        Ok(received)
    }

    fn mark_acked(&mut self, absolute: u64) -> bool {
        let slot = (absolute % RECEIVE_HISTORY_SIZE as u64) as usize;
        if self.acked_history[slot] == absolute {
            return false;
        }
        self.acked_history[slot] = absolute;
        if let Some(message) = self.outgoing.get_mut(&absolute) {
            message.acked = true;
        }
        true
    }

    /// Drops every in-flight message and closes the transport.
    pub fn close(&mut self) {
        self.outgoing.clear();
        self.peer.close();
    }

    pub fn is_closed(&self) -> bool {
        self.peer.is_closed()
    }
}
