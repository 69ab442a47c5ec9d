pub mod client;
pub mod codec;
pub mod ecs;
pub mod net;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod simulation;

pub use client::{ClientConfig, ClientEngine, ClientError, ClientSimulation, ClientState, SimulationFrames, TimeSync};
pub use codec::{Codec, CodecError};
pub use ecs::{
    Component, ComponentId, ComponentTypeId, EcsError, EntityComponentDb, EntityComponentState,
    EntityComponentStateRef, EntityId,
};
pub use net::{
    AbsoluteSequenceNumberTranslator, AckingPeer, Connection, MemoryEndpoint, MessageHandle, MessagePeer, NetError,
    NetworkStats, PacketLossSimulation, SequenceNumber, Transport, TransportError, UdpTransport, memory_link,
};
pub use protocol::{DEFAULT_PORT, Message, ProtocolMessage};
pub use registry::{ClassRegistry, RegistryError, ShortTypeId, TypeId};
pub use server::{
    Authenticator, ComponentReplicationChooser, ConnectionRequest, DisconnectReason, InputBuffer, Rejection,
    ReplicationConfig, ServerConfig, ServerEngine, ServerError, ServerEvent, ServerInputHandler,
};
pub use simulation::{
    Input, InputFrame, PlayerId, SimulationEngine, SimulationError, SimulationFrameData, StepContext, System,
};
