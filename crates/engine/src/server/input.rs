use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};

use crate::simulation::{InputFrame, PlayerId};

#[derive(Debug, Clone)]
struct BufferedInput {
    target_simulation_time_s: f64,
    input_frame: InputFrame,
    sequence_number: u32,
}

impl PartialEq for BufferedInput {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for BufferedInput {}

impl PartialOrd for BufferedInput {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BufferedInput {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap
        other
            .target_simulation_time_s
            .total_cmp(&self.target_simulation_time_s)
            .then(other.sequence_number.cmp(&self.sequence_number))
    }
}

/// One player's pending inputs, ordered by the simulation time they target.
#[derive(Debug)]
pub struct InputBuffer {
    heap: BinaryHeap<BufferedInput>,
}

impl Default for InputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl InputBuffer {
    pub fn new() -> Self {
        let mut heap = BinaryHeap::new();
        heap.push(BufferedInput {
            target_simulation_time_s: 0.0,
            input_frame: InputFrame::new(),
            sequence_number: 0,
        });
        Self { heap }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn push(&mut self, target_simulation_time_s: f64, input_frame: InputFrame, sequence_number: u32) {
        self.heap.push(BufferedInput {
            target_simulation_time_s,
            input_frame,
            sequence_number,
        });
    }

    /// Coalesces everything due by `simulation_time_s` into the entry with
    /// the highest sequence number, which then stays queued at exactly
    /// `simulation_time_s` as the floor for later queries.
    pub fn get_input_frame_for_sim_time(&mut self, simulation_time_s: f64) -> InputFrame {
        let mut latest: Option<BufferedInput> = None;
        while self
            .heap
            .peek()
            .is_some_and(|entry| entry.target_simulation_time_s <= simulation_time_s)
        {
            let Some(entry) = self.heap.pop() else {
                break;
            };
            if latest
                .as_ref()
                .is_none_or(|best| entry.sequence_number > best.sequence_number)
            {
                latest = Some(entry);
            }
        }

        match latest {
            Some(mut entry) => {
                let frame = entry.input_frame.clone();
                entry.target_simulation_time_s = simulation_time_s;
                self.heap.push(entry);
                frame
            }
            None => InputFrame::new(),
        }
    }
}

/// Per-player input buffers plus the lead-time guard.
#[derive(Debug)]
pub struct ServerInputHandler {
    buffers: BTreeMap<PlayerId, InputBuffer>,
    max_input_lead_s: f64,
    discarded: u64,
}

impl ServerInputHandler {
    pub fn new(max_input_lead_s: f64) -> Self {
        Self {
            buffers: BTreeMap::new(),
            max_input_lead_s,
            discarded: 0,
        }
    }

    pub fn add_player(&mut self, player: PlayerId) {
        self.buffers.entry(player).or_default();
    }

    pub fn remove_player(&mut self, player: PlayerId) {
        self.buffers.remove(&player);
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Returns `false` when the input was dropped.
    pub fn on_input(
        &mut self,
        player: PlayerId,
        target_simulation_time_s: f64,
        input_frame: InputFrame,
        sequence_number: u32,
        current_simulation_time_s: f64,
    ) -> bool {
        if target_simulation_time_s > current_simulation_time_s + self.max_input_lead_s {
            self.discarded += 1;
            log::debug!(
                "Discarding input {} from player {}: targets {:.3}s, now {:.3}s",
                sequence_number,
                player,
                target_simulation_time_s,
                current_simulation_time_s
            );
            return false;
        }
        let Some(buffer) = self.buffers.get_mut(&player) else {
            return false;
        };
        buffer.push(target_simulation_time_s, input_frame, sequence_number);
        true
    }

    pub fn get_inputs_for_sim_time(&mut self, simulation_time_s: f64) -> BTreeMap<PlayerId, InputFrame> {
        self.buffers
            .iter_mut()
            .map(|(player, buffer)| (*player, buffer.get_input_frame_for_sim_time(simulation_time_s)))
            .collect()
    }
}
