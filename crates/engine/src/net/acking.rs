use super::error::NetError;
use super::packet::{DEFAULT_MTU, PACKET_HEADER_SIZE, Packet, PacketHeader};
use super::sequence::SequenceNumber;
use super::stats::NetworkStats;
use super::transport::Transport;

/// Must exceed worst plausible RTT times the peak packet rate.
pub const PACKET_HISTORY_SIZE: usize = 128;
pub const ACK_BITFIELD_BITS: u16 = 32;
const ACK_FLUSH_THRESHOLD: u32 = ACK_BITFIELD_BITS as u32 / 2;
const DEFAULT_LOSS_GRACE_S: f64 = 1.0;

#[derive(Debug, Clone)]
struct SentPacket {
    sequence: SequenceNumber,
    send_time_s: f64,
    acked_time_s: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPacket {
    pub sequence: SequenceNumber,
    /// `None` for ack-only packets and duplicates.
    pub payload: Option<Vec<u8>>,
    /// Our own packets newly acknowledged by this one.
    pub acked: Vec<SequenceNumber>,
}

pub struct AckingPeer {
    transport: Box<dyn Transport>,
    mtu: usize,
    next_sequence: SequenceNumber,
    sent: Vec<Option<SentPacket>>,
    received: Vec<Option<SequenceNumber>>,
    highest_received: Option<SequenceNumber>,
    received_since_send: u32,
    stats: NetworkStats,
    closed: bool,
}

fn slot(sequence: SequenceNumber) -> usize {
    sequence.value() as usize % PACKET_HISTORY_SIZE
}

impl AckingPeer {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self::with_mtu(transport, DEFAULT_MTU)
    }

    pub fn with_mtu(transport: Box<dyn Transport>, mtu: usize) -> Self {
        Self {
            transport,
            mtu: mtu.max(PACKET_HEADER_SIZE + 1),
            next_sequence: SequenceNumber(0),
            sent: vec![None; PACKET_HISTORY_SIZE],
            received: vec![None; PACKET_HISTORY_SIZE],
            highest_received: None,
            received_since_send: 0,
            stats: NetworkStats::default(),
            closed: false,
        }
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn max_payload_size(&self) -> usize {
        self.mtu - PACKET_HEADER_SIZE
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut NetworkStats {
        &mut self.stats
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn next_sequence(&self) -> SequenceNumber {
        self.next_sequence
    }

    fn has_received(&self, sequence: SequenceNumber) -> bool {
        self.received[slot(sequence)] == Some(sequence)
    }

    pub fn ack_data(&self) -> (SequenceNumber, u32) {
        let Some(highest) = self.highest_received else {
            // Points at a slot the remote has never filled.
            return (SequenceNumber(u16::MAX), 0);
        };

        let mut bitfield = 0u32;
        for bit in 0..ACK_BITFIELD_BITS {
            if self.has_received(highest.wrapping_sub(bit + 1)) {
                bitfield |= 1 << bit;
            }
        }
        (highest, bitfield)
    }

    pub fn send_packet(&mut self, payload: &[u8], now_s: f64) -> Result<SequenceNumber, NetError> {
        if self.closed {
            return Err(NetError::Closed);
        }

        let sequence = self.next_sequence;
        let (ack_sequence, ack_bitfield) = self.ack_data();
        let header = PacketHeader::new(sequence, ack_sequence, ack_bitfield);
        let bytes = Packet::encode(&header, payload)?;

        self.transport.send(&bytes)?;

        self.next_sequence = sequence.next();
        self.sent[slot(sequence)] = Some(SentPacket {
            sequence,
            send_time_s: now_s,
            acked_time_s: None,
        });
        self.received_since_send = 0;
        self.stats.record_sent(bytes.len());
        if payload.is_empty() {
            self.stats.ack_only_packets_sent += 1;
        }

        Ok(sequence)
    }

    pub fn receive_packet(&mut self, data: &[u8], now_s: f64) -> Result<ReceivedPacket, NetError> {
        let packet = Packet::decode(data)?;
        let sequence = packet.header.sequence;
        self.stats.record_received(data.len());

        match self.highest_received {
            Some(highest) if sequence.is_greater_than(highest) => {
                // Skipped slots may still hold "received" marks from a previous lap.
                let gap = sequence.distance_from(highest) as usize;
                for step in 1..gap.min(PACKET_HISTORY_SIZE + 1) {
                    self.received[slot(highest.wrapping_add(step as u16))] = None;
                }
                self.highest_received = Some(sequence);
            }
            Some(_) => {}
            None => self.highest_received = Some(sequence),
        }

        // Too old to have a history slot of its own; writing one would evict
        // a newer sequence still inside the ack window.
        let stale = self
            .highest_received
            .is_some_and(|highest| usize::from(highest.distance_from(sequence)) >= PACKET_HISTORY_SIZE);
        let duplicate = stale || self.has_received(sequence);
        if !stale {
            self.received[slot(sequence)] = Some(sequence);
        }

        let mut acked = Vec::new();
        for candidate in packet.header.acked_sequences() {
            if let Some(record) = self.sent[slot(candidate)].as_mut() {
                if record.sequence == candidate && record.acked_time_s.is_none() {
                    record.acked_time_s = Some(now_s);
                    acked.push(candidate);
                }
            }
        }

        let payload = if stale {
            log::trace!("Stale packet {}", sequence);
            None
        } else if duplicate {
            self.stats.duplicate_packets += 1;
            log::trace!("Duplicate packet {}", sequence);
            None
        } else {
            self.received_since_send += 1;
            (!packet.payload.is_empty()).then(|| packet.payload.to_vec())
        };

        if self.received_since_send > ACK_FLUSH_THRESHOLD && !self.closed {
            self.send_packet(&[], now_s)?;
        }

        Ok(ReceivedPacket {
            sequence,
            payload,
            acked,
        })
    }

    /// Mean RTT over the acknowledged packets still in history. Scans the
    /// whole history; meant for diagnostics.
    pub fn rtt_s(&self) -> Option<f64> {
        let (total, count) = self
            .sent
            .iter()
            .flatten()
            .filter_map(|record| record.acked_time_s.map(|acked| acked - record.send_time_s))
            .fold((0.0, 0usize), |(total, count), rtt| (total + rtt, count + 1));
        (count > 0).then(|| total / count as f64)
    }

    /// Fraction of packets old enough to have been acked that never were.
    /// Scans the whole history; meant for diagnostics.
    pub fn packet_loss(&self, now_s: f64) -> Option<f64> {
        let grace_s = self.rtt_s().map_or(DEFAULT_LOSS_GRACE_S, |rtt| (rtt * 2.0).max(0.05));
        let (lost, total) = self
            .sent
            .iter()
            .flatten()
            .filter(|record| now_s - record.send_time_s >= grace_s)
            .fold((0usize, 0usize), |(lost, total), record| {
                (lost + usize::from(record.acked_time_s.is_none()), total + 1)
            });
        (total > 0).then(|| lost as f64 / total as f64)
    }

    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.transport.close();
        }
    }
}
