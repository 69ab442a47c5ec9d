mod engine;
mod error;
mod input;

pub use engine::{PlayerId, SimulationEngine, SimulationEngineBuilder, SimulationFrameData, StepContext, System};
pub use error::SimulationError;
pub use input::{Input, InputFrame, InputTypeInfo, InputTypes};
