use std::rc::Rc;

use crate::codec::Codec;
use crate::protocol::{self, HandshakeMessage, Message, ProtocolMessage};
use crate::registry::{ClassKind, ClassRegistry, HANDSHAKE_SHORT_TYPE_ID, RemoteClassMap};

use super::error::NetError;
use super::message::{IncomingMessage, MessageHandle, MessagePeer};
use super::stats::NetworkStats;
use super::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingRemote,
    Complete,
    Closed,
}

#[derive(Debug, Default)]
pub struct ConnectionEvents {
    pub messages: Vec<Message>,
    pub acked: Vec<MessageHandle>,
    /// Set on the call that applied the remote dictionary.
    pub handshake_completed: bool,
}

/// Typed messaging over one [`MessagePeer`].
///
/// Our dictionary goes out first. Typed messages that arrive before the
/// remote dictionary are held back, since their short ids mean nothing yet.
pub struct Connection {
    messages: MessagePeer,
    registry: Rc<ClassRegistry>,
    remote: Option<RemoteClassMap>,
    buffered: Vec<IncomingMessage>,
    state: HandshakeState,
}

impl Connection {
    pub fn new(
        transport: Box<dyn Transport>,
        registry: Rc<ClassRegistry>,
        mtu: usize,
        pack_slack_bytes: usize,
    ) -> Result<Self, NetError> {
        let mut messages = MessagePeer::new(transport, mtu).with_pack_slack(pack_slack_bytes);
        let handshake = HandshakeMessage::from_registry(&registry).encode()?;
        messages.send_message(HANDSHAKE_SHORT_TYPE_ID.0, handshake, None)?;

        Ok(Self {
            messages,
            registry,
            remote: None,
            buffered: Vec::new(),
            state: HandshakeState::AwaitingRemote,
        })
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.state == HandshakeState::Complete
    }

    pub fn is_closed(&self) -> bool {
        self.state == HandshakeState::Closed
    }

    pub fn registry(&self) -> &ClassRegistry {
        &self.registry
    }

    pub fn remote_classes(&self) -> Option<&RemoteClassMap> {
        self.remote.as_ref()
    }

    pub fn mtu(&self) -> usize {
        self.messages.mtu()
    }

    pub fn stats(&self) -> &NetworkStats {
        self.messages.peer().stats()
    }

    pub fn rtt_s(&self) -> Option<f64> {
        self.messages.peer().rtt_s()
    }

    pub fn packet_loss(&self, now_s: f64) -> Option<f64> {
        self.messages.peer().packet_loss(now_s)
    }

    pub fn pending_messages(&self) -> usize {
        self.messages.pending_messages()
    }

    pub fn send<M: ProtocolMessage>(&mut self, message: &M, ttl: Option<u32>) -> Result<MessageHandle, NetError> {
        if self.is_closed() {
            return Err(NetError::Closed);
        }
        let short_id = self.registry.short_id_of_name(M::NAME)?;
        self.messages.send_message(short_id.0, message.encode()?, ttl)
    }

    pub fn expire(&mut self, handle: MessageHandle) {
        self.messages.expire(handle);
    }

    pub fn flush(&mut self, now_s: f64) -> Result<(), NetError> {
        if self.is_closed() {
            return Ok(());
        }
        self.messages.flush(now_s)?;
        Ok(())
    }

    pub fn receive(&mut self, data: &[u8], now_s: f64) -> Result<ConnectionEvents, NetError> {
        if self.is_closed() {
            return Err(NetError::Closed);
        }
        let received = self.messages.receive(data, now_s)?;
        let mut events = ConnectionEvents {
            acked: received.acked,
            ..Default::default()
        };

        for incoming in received.messages {
            if incoming.payload_type == HANDSHAKE_SHORT_TYPE_ID.0 {
                if self.apply_handshake(&incoming.payload)? {
                    events.handshake_completed = true;
                    for held in std::mem::take(&mut self.buffered) {
                        events.messages.push(self.decode(&held)?);
                    }
                }
                continue;
            }

            if self.remote.is_none() {
                self.buffered.push(incoming);
                continue;
            }
            events.messages.push(self.decode(&incoming)?);
        }

        Ok(events)
    }

    fn apply_handshake(&mut self, payload: &[u8]) -> Result<bool, NetError> {
        if self.remote.is_some() {
            log::debug!("Ignoring repeated handshake");
            return Ok(false);
        }
        let handshake = protocol::decode_handshake(payload)?;
        let remote = RemoteClassMap::from_dictionary(&self.registry, handshake.entries())?;
        log::debug!(
            "Handshake complete: {} of {} remote classes mapped",
            remote.len(),
            handshake.classes.len()
        );
        self.remote = Some(remote);
        self.state = HandshakeState::Complete;
        Ok(true)
    }

    fn decode(&self, incoming: &IncomingMessage) -> Result<Message, NetError> {
        let remote = self.remote.as_ref().ok_or(NetError::Closed)?;
        let local = remote.resolve(incoming.payload_type)?;
        let entry = self.registry.entry(local)?;
        match entry.kind {
            ClassKind::Message(decode) => Ok(decode(&incoming.payload)?),
            ClassKind::Component(_) | ClassKind::Input(_) => Err(NetError::NotAMessage {
                name: entry.name.to_string(),
            }),
        }
    }

    /// Drops in-flight messages and closes the transport. Returns `true` only
    /// on the call that actually closed.
    pub fn close(&mut self) -> bool {
        if self.is_closed() {
            return false;
        }
        self.state = HandshakeState::Closed;
        self.buffered.clear();
        self.messages.close();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::transport::{MemoryReceiver, memory_link};
    use crate::protocol::{TimeSyncRequest, TimeSyncResponse};

    fn registry_with(extra: &[&'static str]) -> Rc<ClassRegistry> {
        let mut registry = ClassRegistry::new();
        for name in extra {
            registry.register(name, ClassKind::Input(0)).unwrap();
        }
        protocol::register_messages(&mut registry).unwrap();
        Rc::new(registry)
    }

    fn pump(to: &mut Connection, rx: &MemoryReceiver, now_s: f64) -> ConnectionEvents {
        let mut all = ConnectionEvents::default();
        for datagram in rx.drain() {
            let events = to.receive(&datagram, now_s).unwrap();
            all.messages.extend(events.messages);
            all.acked.extend(events.acked);
            all.handshake_completed |= events.handshake_completed;
        }
        all
    }

    #[test]
    fn test_messages_decode_across_differing_registries() {
        let (a, b) = memory_link(Default::default(), Default::default());
        let mut client = Connection::new(Box::new(a.transport), registry_with(&[]), 1200, 8).unwrap();
        let mut server = Connection::new(Box::new(b.transport), registry_with(&["x.Extra"]), 1200, 8).unwrap();

        client.send(&TimeSyncRequest { client_time_s: 2.0 }, None).unwrap();
        client.flush(0.0).unwrap();
        let events = pump(&mut server, &b.receiver, 0.0);
        assert!(events.handshake_completed);
        assert_eq!(
            events.messages,
            vec![Message::TimeSyncRequest(TimeSyncRequest { client_time_s: 2.0 })]
        );

        server
            .send(
                &TimeSyncResponse {
                    client_time_s: 2.0,
                    server_time_s: 5.0,
                },
                Some(1),
            )
            .unwrap();
        server.flush(0.1).unwrap();
        let events = pump(&mut client, &a.receiver, 0.1);
        assert!(client.is_handshake_complete());
        assert!(matches!(events.messages[0], Message::TimeSyncResponse(_)));
    }

    #[test]
    fn test_messages_before_handshake_are_buffered() {
        let (a, b) = memory_link(Default::default(), Default::default());
        let mut client = Connection::new(Box::new(a.transport), registry_with(&[]), 1200, 8).unwrap();
        let mut server = Connection::new(Box::new(b.transport), registry_with(&[]), 1200, 8).unwrap();

        // The handshake packet is lost; the typed message arrives alone.
        client.flush(0.0).unwrap();
        let lost = b.receiver.drain();
        assert_eq!(lost.len(), 1);
        client.expire(MessageHandle(0));
        client.send(&TimeSyncRequest { client_time_s: 1.0 }, None).unwrap();
        client.flush(0.1).unwrap();
        let events = pump(&mut server, &b.receiver, 0.1);
        assert!(events.messages.is_empty());
        assert!(!server.is_handshake_complete());

        let events = server.receive(&lost[0], 0.2).unwrap();
        assert!(server.is_handshake_complete());
        assert_eq!(
            events.messages,
            vec![Message::TimeSyncRequest(TimeSyncRequest { client_time_s: 1.0 })]
        );
    }

    #[test]
    fn test_unknown_short_id_is_an_error() {
        let (a, b) = memory_link(Default::default(), Default::default());
        let mut client = Connection::new(Box::new(a.transport), registry_with(&[]), 1200, 8).unwrap();
        let mut server = Connection::new(Box::new(b.transport), registry_with(&[]), 1200, 8).unwrap();
        client.flush(0.0).unwrap();
        pump(&mut server, &b.receiver, 0.0);

        client.messages.send_message(999, Vec::new(), None).unwrap();
        client.flush(0.1).unwrap();
        let datagram = b.receiver.drain().remove(0);
        assert!(server.receive(&datagram, 0.1).is_err());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (a, _b) = memory_link(Default::default(), Default::default());
        let mut client = Connection::new(Box::new(a.transport), registry_with(&[]), 1200, 8).unwrap();
        assert!(client.close());
        assert!(!client.close());
        assert_eq!(client.state(), HandshakeState::Closed);
        assert_eq!(client.pending_messages(), 0);
    }
}
