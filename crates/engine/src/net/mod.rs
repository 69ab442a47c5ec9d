pub mod acking;
pub mod connection;
pub mod error;
pub mod message;
pub mod packet;
pub mod sequence;
pub mod stats;
pub mod transport;
pub mod udp;

pub use acking::{AckingPeer, PACKET_HISTORY_SIZE, ReceivedPacket};
pub use connection::{Connection, ConnectionEvents, HandshakeState};
pub use error::{NetError, TransportError};
pub use message::{IncomingMessage, MessageHandle, MessagePeer, ReceivedMessages};
pub use packet::{DEFAULT_MTU, PACKET_HEADER_SIZE, Packet, PacketHeader};
pub use sequence::{AbsoluteSequenceNumberTranslator, SequenceNumber, sequence_greater_than};
pub use stats::NetworkStats;
pub use transport::{MemoryEndpoint, MemoryReceiver, MemoryTransport, PacketLossSimulation, Transport, memory_link};
pub use udp::{MAX_DATAGRAM_SIZE, UdpTransport};
