use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use super::error::TransportError;

/// An unreliable, unordered datagram channel. Inbound datagrams are pushed
/// into the owning peer by whoever drives the socket.
pub trait Transport {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;
    fn close(&mut self);
}

#[derive(Debug, Clone, Default)]
pub struct PacketLossSimulation {
    pub enabled: bool,
    pub loss_percent: f32,
    pub seed: u64,
}

impl PacketLossSimulation {
    pub fn lossy(loss_percent: f32, seed: u64) -> Self {
        Self {
            enabled: true,
            loss_percent,
            seed,
        }
    }
}

#[derive(Debug)]
struct LinkQueue {
    datagrams: VecDeque<Vec<u8>>,
    loss: PacketLossSimulation,
    rng_state: u64,
    dropped: u64,
}

impl LinkQueue {
    fn new(loss: PacketLossSimulation) -> Self {
        let rng_state = loss.seed | 1;
        Self {
            datagrams: VecDeque::new(),
            loss,
            rng_state,
            dropped: 0,
        }
    }

    fn should_drop(&mut self) -> bool {
        if !self.loss.enabled || self.loss.loss_percent <= 0.0 {
            return false;
        }
        // xorshift64*
        self.rng_state ^= self.rng_state >> 12;
        self.rng_state ^= self.rng_state << 25;
        self.rng_state ^= self.rng_state >> 27;
        let sample = self.rng_state.wrapping_mul(0x2545_F491_4F6C_DD1D) >> 40;
        let percent = sample as f32 / (1u64 << 24) as f32 * 100.0;
        percent < self.loss.loss_percent
    }
}

/// Sending half of an in-process datagram link.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    queue: Rc<RefCell<LinkQueue>>,
    closed: Rc<Cell<bool>>,
}

impl Transport for MemoryTransport {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.closed.get() {
            return Err(TransportError::Closed);
        }
        let mut queue = self.queue.borrow_mut();
        if queue.should_drop() {
            queue.dropped += 1;
            return Ok(());
        }
        queue.datagrams.push_back(bytes.to_vec());
        Ok(())
    }

    fn close(&mut self) {
        self.closed.set(true);
    }
}

/// Receiving half of an in-process datagram link.
#[derive(Debug, Clone)]
pub struct MemoryReceiver {
    queue: Rc<RefCell<LinkQueue>>,
    closed: Rc<Cell<bool>>,
}

impl MemoryReceiver {
    pub fn drain(&self) -> Vec<Vec<u8>> {
        self.queue.borrow_mut().datagrams.drain(..).collect()
    }

    pub fn pending(&self) -> usize {
        self.queue.borrow().datagrams.len()
    }

    pub fn dropped(&self) -> u64 {
        self.queue.borrow().dropped
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }
}

pub struct MemoryEndpoint {
    pub transport: MemoryTransport,
    pub receiver: MemoryReceiver,
}

fn one_way(loss: PacketLossSimulation, closed: &Rc<Cell<bool>>) -> (MemoryTransport, MemoryReceiver) {
    let queue = Rc::new(RefCell::new(LinkQueue::new(loss)));
    (
        MemoryTransport {
            queue: Rc::clone(&queue),
            closed: Rc::clone(closed),
        },
        MemoryReceiver {
            queue,
            closed: Rc::clone(closed),
        },
    )
}

/// Builds a bidirectional link; closing either side closes both directions.
pub fn memory_link(
    a_to_b: PacketLossSimulation,
    b_to_a: PacketLossSimulation,
) -> (MemoryEndpoint, MemoryEndpoint) {
    let closed = Rc::new(Cell::new(false));
    let (a_tx, b_rx) = one_way(a_to_b, &closed);
    let (b_tx, a_rx) = one_way(b_to_a, &closed);
    (
        MemoryEndpoint {
            transport: a_tx,
            receiver: a_rx,
        },
        MemoryEndpoint {
            transport: b_tx,
            receiver: b_rx,
        },
    )
}
