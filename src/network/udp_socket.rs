use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use tracing::trace;

use crate::network::codec;
use crate::network::messages::Message;
use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{NonBlockingSocket, PeerAddress};

const RECV_BUFFER_SIZE: usize = 4096;
const SEND_BUFFER_SIZE: usize = 1024;
/// Larger packets may be fragmented on the way.
const IDEAL_MAX_UDP_PACKET_SIZE: usize = 508;

/// A non-blocking UDP socket listening on `0.0.0.0:port`.
///
/// Only [`PeerAddress::Ip`] destinations are reachable; messages addressed to a
/// platform identity are dropped with a warning.
#[derive(Debug)]
pub struct UdpNonBlockingSocket {
    socket: UdpSocket,
    recv_buffer: [u8; RECV_BUFFER_SIZE],
    send_buffer: [u8; SEND_BUFFER_SIZE],
}

impl UdpNonBlockingSocket {
    /// Binds to `0.0.0.0:port` in non-blocking mode. Port 0 lets the OS choose.
    pub fn bind_to_port(port: u16) -> Result<Self, std::io::Error> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            recv_buffer: [0; RECV_BUFFER_SIZE],
            send_buffer: [0; SEND_BUFFER_SIZE],
        })
    }

    /// The port the socket is bound to.
    pub fn local_port(&self) -> Result<u16, std::io::Error> {
        self.socket.local_addr().map(|addr| addr.port())
    }

    fn send_encoded(&self, buf: &[u8], addr: SocketAddr) {
        if buf.len() > IDEAL_MAX_UDP_PACKET_SIZE {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "sending UDP packet of {} bytes, more than the ideal {}",
                buf.len(),
                IDEAL_MAX_UDP_PACKET_SIZE
            );
        }
        // best effort; a lost datagram is retransmitted by the protocol
        if let Err(e) = self.socket.send_to(buf, addr) {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "failed to send UDP packet to {}: {}",
                addr,
                e
            );
        }
    }
}

impl NonBlockingSocket for UdpNonBlockingSocket {
    fn send_to(&mut self, msg: &Message, addr: &PeerAddress) {
        let PeerAddress::Ip(addr) = *addr else {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "UDP socket cannot reach {}; message dropped",
                addr
            );
            return;
        };

        match codec::encode_into(msg, &mut self.send_buffer) {
            Ok(len) => {
                if let Some(buf) = self.send_buffer.get(..len) {
                    self.send_encoded(buf, addr);
                }
            },
            Err(codec::CodecError::BufferTooSmall { .. }) => match codec::encode(msg) {
                Ok(buf) => self.send_encoded(&buf, addr),
                Err(e) => report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::NetworkProtocol,
                    "failed to serialize message: {}",
                    e
                ),
            },
            Err(e) => report_violation!(
                ViolationSeverity::Error,
                ViolationKind::NetworkProtocol,
                "failed to serialize message: {}",
                e
            ),
        }
    }

    fn receive_all_messages(&mut self) -> Vec<(PeerAddress, Message)> {
        let mut received = Vec::with_capacity(4);
        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((len, src_addr)) => {
                    let Some(buf) = self.recv_buffer.get(..len) else {
                        continue;
                    };
                    match codec::decode_value::<Message>(buf) {
                        Ok(msg) => received.push((PeerAddress::Ip(src_addr), msg)),
                        Err(e) => trace!("dropping undecodable datagram from {}: {}", src_addr, e),
                    }
                },
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return received,
                // datagram sockets report an earlier send_to failure this way
                Err(ref err) if err.kind() == ErrorKind::ConnectionReset => continue,
                Err(err) => {
                    report_violation!(
                        ViolationSeverity::Error,
                        ViolationKind::NetworkProtocol,
                        "unexpected socket error {:?}: {}",
                        err.kind(),
                        err
                    );
                    return received;
                },
            }
        }
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::network::messages::{MessageBody, MessageHeader};

    fn keep_alive(magic: u16) -> Message {
        Message {
            header: MessageHeader { magic },
            body: MessageBody::KeepAlive,
        }
    }

    fn loopback(socket: &UdpNonBlockingSocket) -> PeerAddress {
        PeerAddress::Ip(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            socket.local_port().unwrap(),
        ))
    }

    fn wait_for(socket: &mut UdpNonBlockingSocket, count: usize) -> Vec<(PeerAddress, Message)> {
        let mut all = Vec::new();
        for _ in 0..20 {
            all.extend(socket.receive_all_messages());
            if all.len() >= count {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        all
    }

    #[test]
    fn empty_socket_returns_immediately() {
        let mut socket = UdpNonBlockingSocket::bind_to_port(0).unwrap();
        assert!(socket.receive_all_messages().is_empty());
        assert_ne!(socket.local_port().unwrap(), 0);
    }

    #[test]
    fn send_and_receive() {
        let mut a = UdpNonBlockingSocket::bind_to_port(0).unwrap();
        let mut b = UdpNonBlockingSocket::bind_to_port(0).unwrap();
        let a_port = a.local_port().unwrap();

        a.send_to(&keep_alive(0x1234), &loopback(&b));
        let received = wait_for(&mut b, 1);
        assert_eq!(received.len(), 1);
        let PeerAddress::Ip(from) = received[0].0 else {
            panic!("expected an IP sender");
        };
        assert_eq!(from.port(), a_port);
        assert_eq!(received[0].1, keep_alive(0x1234));
    }

    #[test]
    fn platform_addresses_are_dropped() {
        let mut socket = UdpNonBlockingSocket::bind_to_port(0).unwrap();
        socket.send_to(&keep_alive(1), &PeerAddress::Platform(76_561_198_000_000_000));
        assert!(socket.receive_all_messages().is_empty());
    }

    #[test]
    fn garbage_datagrams_are_skipped() {
        let mut socket = UdpNonBlockingSocket::bind_to_port(0).unwrap();
        let raw = UdpSocket::bind("127.0.0.1:0").unwrap();
        let PeerAddress::Ip(target) = loopback(&socket) else {
            unreachable!()
        };
        raw.send_to(&[0xFF, 0xFF, 0xFF], target).unwrap();
        socket.send_to(&keep_alive(9), &loopback(&socket));

        let received = wait_for(&mut socket, 1);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].1.magic(), 9);
    }
}
