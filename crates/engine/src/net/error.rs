use crate::codec::CodecError;
use crate::registry::RegistryError;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("payload of {len} bytes exceeds the {max}-byte length prefix")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("class {name} cannot be decoded as a message")]
    NotAMessage { name: String },
    #[error("no handler for message {name}")]
    UnhandledMessage { name: &'static str },
    #[error("connection closed")]
    Closed,
}
