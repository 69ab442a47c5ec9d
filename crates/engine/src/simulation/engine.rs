use std::collections::BTreeMap;
use std::rc::Rc;

use crate::ecs::{
    Component, ComponentTypeId, ComponentTypes, EntityComponentDb, EntityComponentState, EntityComponentStateRef,
};
use crate::protocol;
use crate::registry::{ClassKind, ClassRegistry, ShortTypeId};

use super::error::SimulationError;
use super::input::{Input, InputFrame, InputTypes};

pub type PlayerId = u32;

#[derive(Debug, Clone)]
pub struct SimulationFrameData {
    pub frame_index: u32,
    pub simulation_time_s: f64,
    pub inputs: BTreeMap<PlayerId, InputFrame>,
    pub state: EntityComponentDb,
}

pub struct StepContext<'a> {
    pub dt_s: f64,
    pub frame_index: u32,
    pub simulation_time_s: f64,
    pub inputs: &'a BTreeMap<PlayerId, InputFrame>,
    pub state: EntityComponentState<'a>,
    pub previous: &'a SimulationFrameData,
}

impl<'a> StepContext<'a> {
    pub fn input(&self, player: PlayerId) -> Option<&'a InputFrame> {
        self.inputs.get(&player)
    }

    pub fn previous_state(&self) -> EntityComponentStateRef<'a> {
        self.previous.state.view()
    }
}

/// Runs once per frame, in registration order.
pub trait System {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn step(&self, ctx: &mut StepContext<'_>) -> Result<(), SimulationError>;
}

impl<F> System for F
where
    F: Fn(&mut StepContext<'_>) -> Result<(), SimulationError>,
{
    fn step(&self, ctx: &mut StepContext<'_>) -> Result<(), SimulationError> {
        self(ctx)
    }
}

pub struct SimulationEngineBuilder {
    sim_fps: u32,
    components: ComponentTypes,
    inputs: InputTypes,
    registry: ClassRegistry,
    systems: Vec<Box<dyn System>>,
}

impl SimulationEngineBuilder {
    fn new(sim_fps: u32) -> Result<Self, SimulationError> {
        let mut registry = ClassRegistry::new();
        protocol::register_messages(&mut registry)?;
        Ok(Self {
            sim_fps,
            components: ComponentTypes::new(),
            inputs: InputTypes::new(),
            registry,
            systems: Vec::new(),
        })
    }

    pub fn component<T: Component>(mut self) -> Result<Self, SimulationError> {
        let id = self.components.register::<T>()?;
        self.registry.register(T::NAME, ClassKind::Component(id))?;
        Ok(self)
    }

    pub fn input<T: Input>(mut self) -> Result<Self, SimulationError> {
        let index = self.inputs.register::<T>()?;
        self.registry.register(T::NAME, ClassKind::Input(index))?;
        Ok(self)
    }

    pub fn system(mut self, system: impl System + 'static) -> Self {
        self.systems.push(Box::new(system));
        self
    }

    pub fn build(self) -> Result<SimulationEngine, SimulationError> {
        if self.sim_fps == 0 {
            return Err(SimulationError::InvalidSimFps(self.sim_fps));
        }

        let mut component_short_ids = vec![None; self.components.len()];
        for entry in self.registry.entries() {
            if let ClassKind::Component(type_id) = entry.kind {
                component_short_ids[usize::from(type_id.0)] = Some(entry.short_id);
            }
        }

        log::debug!(
            "Simulation at {} fps with {} component types, {} input types, {} systems",
            self.sim_fps,
            self.components.len(),
            self.inputs.len(),
            self.systems.len()
        );

        Ok(SimulationEngine {
            sim_fps: self.sim_fps,
            components: Rc::new(self.components),
            inputs: Rc::new(self.inputs),
            registry: Rc::new(self.registry),
            systems: self.systems,
            component_short_ids,
        })
    }
}

/// Registered types plus the ordered system list. Advances one frame from
/// its predecessor.
pub struct SimulationEngine {
    sim_fps: u32,
    components: Rc<ComponentTypes>,
    inputs: Rc<InputTypes>,
    registry: Rc<ClassRegistry>,
    systems: Vec<Box<dyn System>>,
    component_short_ids: Vec<Option<ShortTypeId>>,
}

impl SimulationEngine {
    pub fn builder(sim_fps: u32) -> Result<SimulationEngineBuilder, SimulationError> {
        SimulationEngineBuilder::new(sim_fps)
    }

    pub fn sim_fps(&self) -> u32 {
        self.sim_fps
    }

    pub fn dt_s(&self) -> f64 {
        1.0 / f64::from(self.sim_fps)
    }

    pub fn frame_time_s(&self, frame_index: u32) -> f64 {
        f64::from(frame_index) / f64::from(self.sim_fps)
    }

    pub fn registry(&self) -> &Rc<ClassRegistry> {
        &self.registry
    }

    pub fn component_types(&self) -> &Rc<ComponentTypes> {
        &self.components
    }

    pub fn input_types(&self) -> &InputTypes {
        &self.inputs
    }

    pub fn component_short_id(&self, type_id: ComponentTypeId) -> Option<ShortTypeId> {
        self.component_short_ids.get(usize::from(type_id.0)).copied().flatten()
    }

    pub fn component_type_of(&self, short_id: ShortTypeId) -> Option<ComponentTypeId> {
        match self.registry.get(short_id)?.kind {
            ClassKind::Component(type_id) => Some(type_id),
            _ => None,
        }
    }

    pub fn new_state(&self) -> EntityComponentDb {
        EntityComponentDb::new(Rc::clone(&self.components))
    }

    pub fn new_frame(&self, frame_index: u32) -> SimulationFrameData {
        SimulationFrameData {
            frame_index,
            simulation_time_s: self.frame_time_s(frame_index),
            inputs: BTreeMap::new(),
            state: self.new_state(),
        }
    }

    pub fn encode_input_frame(&self, frame: &InputFrame) -> Result<Vec<u8>, SimulationError> {
        Ok(frame.encode()?)
    }

    pub fn decode_input_frame(&self, bytes: &[u8]) -> Result<InputFrame, SimulationError> {
        InputFrame::decode(&self.inputs, bytes)
    }

    /// Copies `prev.state` into `next.state` through its serialized form,
    /// then runs every system against `next`.
    pub fn step_simulation(
        &self,
        prev: &SimulationFrameData,
        next: &mut SimulationFrameData,
    ) -> Result<(), SimulationError> {
        next.state.copy_from(&prev.state)?;

        let mut ctx = StepContext {
            dt_s: self.dt_s(),
            frame_index: next.frame_index,
            simulation_time_s: next.simulation_time_s,
            inputs: &next.inputs,
            state: next.state.view_mut(),
            previous: prev,
        };
        for system in &self.systems {
            system.step(&mut ctx)?;
        }
        Ok(())
    }

    pub fn quantize(&self, frame: &mut SimulationFrameData) -> Result<(), SimulationError> {
        frame.state.quantize()?;
        Ok(())
    }
}
