use std::collections::BTreeMap;

use crate::ecs::{ComponentId, EntityId};
use crate::simulation::{InputFrame, PlayerId, SimulationEngine, SimulationError, SimulationFrameData};

const TIME_EPSILON_S: f64 = 1e-9;

/// Everything known about a frame besides its resolved state.
#[derive(Debug, Clone, Default)]
struct FrameRecord {
    predicted_input: Option<InputFrame>,
    authoritative_inputs: Option<BTreeMap<PlayerId, InputFrame>>,
    upserts: Vec<(ComponentId, Vec<u8>)>,
    deleted_components: Vec<ComponentId>,
    deleted_entities: Vec<EntityId>,
}

#[derive(Debug, Clone)]
struct FrameSlot {
    frame: SimulationFrameData,
    record: FrameRecord,
}

/// Two neighbouring frames around a point in time, for interpolation.
#[derive(Debug, Clone, Copy)]
pub struct SimulationFrames<'a> {
    pub previous: &'a SimulationFrameData,
    pub next: &'a SimulationFrameData,
    /// Position of the query time between `previous` and `next`, in `[0, 1]`.
    pub alpha: f64,
}

fn slot_pair_mut(
    slots: &mut [Option<FrameSlot>],
    a: usize,
    b: usize,
) -> (&mut Option<FrameSlot>, &mut Option<FrameSlot>) {
    if a < b {
        let (left, right) = slots.split_at_mut(b);
        (&mut left[a], &mut right[0])
    } else {
        let (left, right) = slots.split_at_mut(a);
        (&mut right[0], &mut left[b])
    }
}

fn apply_authority(frame: &mut SimulationFrameData, record: &FrameRecord) -> Result<(), SimulationError> {
    for (id, bytes) in &record.upserts {
        frame.state.upsert_encoded(*id, bytes)?;
    }
    for id in &record.deleted_components {
        frame.state.release_component(*id);
    }
    for entity in &record.deleted_entities {
        frame.state.release_entity(*entity);
    }
    Ok(())
}

/// Client-side frame history with rollback.
///
/// Frames `oldest_frame_index..=newest_frame_index` live in a ring sized to
/// the configured history. Authoritative data and predicted input are kept
/// per frame and reapplied whenever a frame is resimulated, so a late
/// message only ever moves the dirty checkpoint backward.
pub struct ClientSimulation {
    engine: SimulationEngine,
    local_player: PlayerId,
    slots: Vec<Option<FrameSlot>>,
    oldest_frame_index: u32,
    newest_frame_index: u32,
    oldest_dirty_frame_index: Option<u32>,
    pending: BTreeMap<u32, FrameRecord>,
    discarded_stale: u64,
}

impl ClientSimulation {
    pub fn new(engine: SimulationEngine, history_s: f64, local_player: PlayerId) -> Self {
        let capacity = ((history_s * f64::from(engine.sim_fps())).round() as usize).max(2);
        let mut slots: Vec<Option<FrameSlot>> = (0..capacity).map(|_| None).collect();
        slots[0] = Some(FrameSlot {
            frame: engine.new_frame(0),
            record: FrameRecord::default(),
        });
        Self {
            engine,
            local_player,
            slots,
            oldest_frame_index: 0,
            newest_frame_index: 0,
            oldest_dirty_frame_index: None,
            pending: BTreeMap::new(),
            discarded_stale: 0,
        }
    }

    pub fn engine(&self) -> &SimulationEngine {
        &self.engine
    }

    pub fn local_player(&self) -> PlayerId {
        self.local_player
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn oldest_frame_index(&self) -> u32 {
        self.oldest_frame_index
    }

    pub fn newest_frame_index(&self) -> u32 {
        self.newest_frame_index
    }

    pub fn oldest_dirty_frame_index(&self) -> Option<u32> {
        self.oldest_dirty_frame_index
    }

    /// Authoritative messages dropped for being older than the history.
    pub fn discarded_stale(&self) -> u64 {
        self.discarded_stale
    }

    fn slot_index(&self, frame_index: u32) -> usize {
        frame_index as usize % self.slots.len()
    }

    fn slot(&self, frame_index: u32) -> Option<&FrameSlot> {
        if frame_index < self.oldest_frame_index || frame_index > self.newest_frame_index {
            return None;
        }
        self.slots[self.slot_index(frame_index)]
            .as_ref()
            .filter(|slot| slot.frame.frame_index == frame_index)
    }

    pub fn frame(&self, frame_index: u32) -> Option<&SimulationFrameData> {
        self.slot(frame_index).map(|slot| &slot.frame)
    }

    pub fn newest_frame(&self) -> Option<&SimulationFrameData> {
        self.frame(self.newest_frame_index)
    }

    pub fn frames(&self) -> impl Iterator<Item = &SimulationFrameData> {
        (self.oldest_frame_index..=self.newest_frame_index).filter_map(|index| self.frame(index))
    }

    fn frame_at_time(&self, time_s: f64) -> u32 {
        if time_s <= 0.0 {
            return 0;
        }
        (time_s * f64::from(self.engine.sim_fps()) + TIME_EPSILON_S).floor() as u32
    }

    fn record_mut(&mut self, frame_index: u32) -> Option<&mut FrameRecord> {
        if frame_index < self.oldest_frame_index {
            return None;
        }
        if frame_index > self.newest_frame_index {
            return Some(self.pending.entry(frame_index).or_default());
        }
        let index = self.slot_index(frame_index);
        self.slots[index]
            .as_mut()
            .filter(|slot| slot.frame.frame_index == frame_index)
            .map(|slot| &mut slot.record)
    }

    fn mark_dirty(&mut self, frame_index: u32) {
        if frame_index <= self.newest_frame_index {
            self.oldest_dirty_frame_index = Some(
                self.oldest_dirty_frame_index
                    .map_or(frame_index, |dirty| dirty.min(frame_index)),
            );
        }
    }

    fn record_authority(&mut self, frame_index: u32, kind: &str, apply: impl FnOnce(&mut FrameRecord)) -> bool {
        let oldest = self.oldest_frame_index;
        let Some(record) = self.record_mut(frame_index) else {
            self.discarded_stale += 1;
            log::warn!(
                "Discarding {} for frame {}: history starts at {}",
                kind,
                frame_index,
                oldest
            );
            return false;
        };
        apply(record);
        self.mark_dirty(frame_index);
        true
    }

    /// Records the local player's input for a frame. Returns `false` if the
    /// frame has already left the history.
    pub fn set_predicted_input(&mut self, frame_index: u32, input: InputFrame) -> bool {
        let Some(record) = self.record_mut(frame_index) else {
            log::debug!("Predicted input for evicted frame {}", frame_index);
            return false;
        };
        record.predicted_input = Some(input);
        self.mark_dirty(frame_index);
        true
    }

    pub fn on_inputs_used(&mut self, frame_index: u32, inputs: BTreeMap<PlayerId, InputFrame>) -> bool {
        self.record_authority(frame_index, "inputs", |record| {
            record.authoritative_inputs = Some(inputs);
        })
    }

    pub fn on_component_state(&mut self, frame_index: u32, updates: Vec<(ComponentId, Vec<u8>)>) -> bool {
        self.record_authority(frame_index, "component state", |record| {
            record.upserts.extend(updates);
        })
    }

    pub fn on_deletions(&mut self, frame_index: u32, components: Vec<ComponentId>, entities: Vec<EntityId>) -> bool {
        self.record_authority(frame_index, "deletions", |record| {
            record.deleted_components.extend(components);
            record.deleted_entities.extend(entities);
        })
    }

    /// Resimulates from the dirty checkpoint, then simulates forward until
    /// the next frame would start after `target_time_s`.
    pub fn do_simulation_work(&mut self, target_time_s: f64) -> Result<(), SimulationError> {
        let target_frame = self.frame_at_time(target_time_s);
        let capacity = self.slots.len() as u32;
        if target_frame >= self.newest_frame_index.saturating_add(capacity) {
            self.rebase(target_frame + 1 - capacity)?;
        }

        self.resimulate()?;
        while self.newest_frame_index < target_frame {
            self.push_frame()?;
        }
        Ok(())
    }

    fn resimulate(&mut self) -> Result<(), SimulationError> {
        let Some(dirty) = self.oldest_dirty_frame_index else {
            return Ok(());
        };
        let mut index = dirty.max(self.oldest_frame_index);
        if index == self.oldest_frame_index {
            self.resolve_oldest()?;
            index += 1;
        }
        while index <= self.newest_frame_index {
            self.oldest_dirty_frame_index = Some(index);
            self.resolve(index)?;
            index += 1;
        }
        self.oldest_dirty_frame_index = None;
        Ok(())
    }

    /// The oldest frame has no predecessor; authority is applied in place.
    fn resolve_oldest(&mut self) -> Result<(), SimulationError> {
        let frame_index = self.oldest_frame_index;
        let local_player = self.local_player;
        let index = self.slot_index(frame_index);
        let Some(slot) = self.slots[index]
            .as_mut()
            .filter(|slot| slot.frame.frame_index == frame_index)
        else {
            return Ok(());
        };

        let FrameSlot { frame, record } = slot;
        if let Some(inputs) = &record.authoritative_inputs {
            frame.inputs = inputs.clone();
        } else if let Some(input) = &record.predicted_input {
            frame.inputs.insert(local_player, input.clone());
        }
        apply_authority(frame, record)?;
        frame.state.quantize()?;
        frame.state.release_deleted_state();
        Ok(())
    }

    fn resolve(&mut self, frame_index: u32) -> Result<(), SimulationError> {
        let local_player = self.local_player;
        let previous_index = self.slot_index(frame_index - 1);
        let next_index = self.slot_index(frame_index);
        let (previous, next) = slot_pair_mut(&mut self.slots, previous_index, next_index);
        let (Some(previous), Some(next)) = (previous.as_ref(), next.as_mut()) else {
            log::warn!("Frame {} has no predecessor to resimulate from", frame_index);
            return Ok(());
        };

        let FrameSlot { frame, record } = next;
        frame.inputs = match &record.authoritative_inputs {
            Some(inputs) => inputs.clone(),
            None => {
                let mut inputs = previous.frame.inputs.clone();
                if let Some(input) = &record.predicted_input {
                    inputs.insert(local_player, input.clone());
                }
                inputs
            }
        };
        self.engine.step_simulation(&previous.frame, frame)?;
        apply_authority(frame, record)?;
        frame.state.quantize()?;
        frame.state.release_deleted_state();
        Ok(())
    }

    fn push_frame(&mut self) -> Result<(), SimulationError> {
        let frame_index = self.newest_frame_index + 1;
        let capacity = self.slots.len() as u32;
        if frame_index >= self.oldest_frame_index + capacity {
            // The new frame takes the oldest frame's slot. Resolve anything
            // that still needs it as a base first.
            if self
                .oldest_dirty_frame_index
                .is_some_and(|dirty| dirty <= self.oldest_frame_index + 1)
            {
                self.resimulate()?;
            }
            self.oldest_frame_index += 1;
        }

        let record = self.pending.remove(&frame_index).unwrap_or_default();
        let index = self.slot_index(frame_index);
        self.slots[index] = Some(FrameSlot {
            frame: self.engine.new_frame(frame_index),
            record,
        });
        self.newest_frame_index = frame_index;
        self.resolve(frame_index)
    }

    /// Restarts the history at `frame_index`, carrying the newest state over.
    fn rebase(&mut self, frame_index: u32) -> Result<(), SimulationError> {
        log::info!(
            "Jumping simulation from frame {} to {}",
            self.newest_frame_index,
            frame_index
        );
        let mut frame = self.engine.new_frame(frame_index);
        if let Some(newest) = self.newest_frame() {
            frame.state.copy_from(&newest.state)?;
            frame.inputs = newest.inputs.clone();
        }

        for slot in &mut self.slots {
            *slot = None;
        }
        self.pending = self.pending.split_off(&frame_index);
        let record = self.pending.remove(&frame_index).unwrap_or_default();
        let index = self.slot_index(frame_index);
        self.slots[index] = Some(FrameSlot { frame, record });
        self.oldest_frame_index = frame_index;
        self.newest_frame_index = frame_index;
        self.oldest_dirty_frame_index = Some(frame_index);
        Ok(())
    }

    /// Finds the first retained frame whose time exceeds `time_s` and pairs
    /// it with its predecessor. Past the newest frame both sides are the
    /// newest frame.
    pub fn get_simulation_frames(&self, time_s: f64) -> Option<SimulationFrames<'_>> {
        let oldest = self.slot(self.oldest_frame_index)?;
        if time_s < oldest.frame.simulation_time_s {
            return None;
        }

        let mut low = self.oldest_frame_index;
        let mut high = self.newest_frame_index + 1;
        while low < high {
            let mid = low + (high - low) / 2;
            if self.slot(mid)?.frame.simulation_time_s > time_s {
                high = mid;
            } else {
                low = mid + 1;
            }
        }

        if low > self.newest_frame_index {
            let newest = self.newest_frame()?;
            return Some(SimulationFrames {
                previous: newest,
                next: newest,
                alpha: 0.0,
            });
        }

        let previous = self.frame(low - 1)?;
        let next = self.frame(low)?;
        let span = next.simulation_time_s - previous.simulation_time_s;
        let alpha = if span > 0.0 {
            ((time_s - previous.simulation_time_s) / span).clamp(0.0, 1.0)
        } else {
            0.0
        };
        Some(SimulationFrames { previous, next, alpha })
    }
}
