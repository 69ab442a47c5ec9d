use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::rc::Rc;

use super::error::TransportError;
use super::transport::Transport;

/// Receive buffer size. Covers any datagram UDP can carry, so a packet
/// holding one oversized message is never cut short by `recv_from`.
pub const MAX_DATAGRAM_SIZE: usize = 65536;

const HELLO_MAGIC: [u8; 4] = *b"RNHI";
const HELLO_SIZE: usize = HELLO_MAGIC.len() + 4;

pub fn bind_nonblocking<A: ToSocketAddrs>(addr: A) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind(addr)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Drains every datagram currently queued on a nonblocking socket.
pub fn receive_all(socket: &UdpSocket, buffer: &mut [u8]) -> io::Result<Vec<(Vec<u8>, SocketAddr)>> {
    let mut datagrams = Vec::new();
    loop {
        match socket.recv_from(buffer) {
            Ok((size, addr)) => datagrams.push((buffer[..size].to_vec(), addr)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            // Some platforms surface ICMP port-unreachable as a receive error.
            Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(datagrams)
}

/// Announces the player id ahead of the connection handshake, so a server
/// sharing one socket between peers knows whom a new address belongs to.
pub fn encode_hello(player_id: u32) -> [u8; HELLO_SIZE] {
    let mut hello = [0u8; HELLO_SIZE];
    hello[..HELLO_MAGIC.len()].copy_from_slice(&HELLO_MAGIC);
    hello[HELLO_MAGIC.len()..].copy_from_slice(&player_id.to_le_bytes());
    hello
}

pub fn decode_hello(data: &[u8]) -> Option<u32> {
    if data.len() != HELLO_SIZE || data[..HELLO_MAGIC.len()] != HELLO_MAGIC {
        return None;
    }
    let mut id = [0u8; 4];
    id.copy_from_slice(&data[HELLO_MAGIC.len()..]);
    Some(u32::from_le_bytes(id))
}

/// Sends to one remote over a socket that may be shared with other peers.
pub struct UdpTransport {
    socket: Rc<UdpSocket>,
    remote: SocketAddr,
    closed: bool,
}

impl UdpTransport {
    pub fn new(socket: Rc<UdpSocket>, remote: SocketAddr) -> Self {
        Self {
            socket,
            remote,
            closed: false,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        match self.socket.send_to(bytes, self.remote) {
            Ok(_) => Ok(()),
            // A full send buffer is just another lost datagram.
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                log::debug!("Send buffer full, dropped datagram to {}", self.remote);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_round_trip() {
        let hello = encode_hello(42);
        assert_eq!(decode_hello(&hello), Some(42));
        assert_eq!(decode_hello(&hello[..7]), None);
        assert_eq!(decode_hello(b"XXXX\x01\x00\x00\x00"), None);
    }

    #[test]
    fn test_loopback_delivery() {
        let a = Rc::new(bind_nonblocking("127.0.0.1:0").unwrap());
        let b = bind_nonblocking("127.0.0.1:0").unwrap();
        let b_addr = b.local_addr().unwrap();

        let mut transport = UdpTransport::new(Rc::clone(&a), b_addr);
        transport.send(b"ping").unwrap();

        let mut buffer = [0u8; MAX_DATAGRAM_SIZE];
        let mut received = Vec::new();
        for _ in 0..200 {
            received.extend(receive_all(&b, &mut buffer).unwrap());
            if !received.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, b"ping");
        assert_eq!(received[0].1, a.local_addr().unwrap());

        transport.close();
        assert!(matches!(transport.send(b"x"), Err(TransportError::Closed)));
    }
}
