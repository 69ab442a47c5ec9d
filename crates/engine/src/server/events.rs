use std::collections::BTreeMap;

use crate::simulation::PlayerId;

/// An inbound connection attempt, as seen by the authenticator.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRequest {
    pub peer: String,
    pub headers: BTreeMap<String, String>,
}

impl ConnectionRequest {
    pub fn new(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

impl Rejection {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            headers: Vec::new(),
        }
    }
}

/// Maps an inbound connection to a player id or a rejection.
pub trait Authenticator {
    fn authenticate(&mut self, request: &ConnectionRequest) -> Result<PlayerId, Rejection>;
}

impl<F> Authenticator for F
where
    F: FnMut(&ConnectionRequest) -> Result<PlayerId, Rejection>,
{
    fn authenticate(&mut self, request: &ConnectionRequest) -> Result<PlayerId, Rejection> {
        self(request)
    }
}

#[derive(Debug, Clone)]
pub enum ServerEvent {
    PlayerConnected {
        player_id: PlayerId,
        peer: String,
    },
    PlayerDisconnected {
        player_id: PlayerId,
        reason: DisconnectReason,
    },
    ConnectionRejected {
        peer: String,
        rejection: Rejection,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    Graceful,
    Timeout,
    Kicked,
    TransportClosed,
    ProtocolError(String),
}

impl DisconnectReason {
    pub fn as_str(&self) -> &str {
        match self {
            DisconnectReason::Graceful => "disconnected",
            DisconnectReason::Timeout => "timed out",
            DisconnectReason::Kicked => "kicked",
            DisconnectReason::TransportClosed => "transport closed",
            DisconnectReason::ProtocolError(message) => message,
        }
    }
}
