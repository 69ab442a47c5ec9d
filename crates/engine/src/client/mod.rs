mod config;
mod engine;
mod error;
mod simulation;
mod time_sync;

pub use config::ClientConfig;
pub use engine::{ClientEngine, ClientState};
pub use error::ClientError;
pub use simulation::{ClientSimulation, SimulationFrames};
pub use time_sync::{TimeSample, TimeSync};
