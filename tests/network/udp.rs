//! Sessions over real UDP sockets on localhost.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serial_test::serial;

use crate::common::stubs::GameStub;
use crate::common::{poll_with_sleep, test_builder, PortAllocator};
use rollback_session::{
    PeerAddress, PlayerType, SessionError, SessionState, UdpNonBlockingSocket,
};

fn localhost(port: u16) -> PeerAddress {
    PeerAddress::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
}

#[test]
#[serial]
fn test_bind_reports_the_port() {
    let port = PortAllocator::next_port();
    let socket = UdpNonBlockingSocket::bind_to_port(port).unwrap();
    assert_eq!(socket.local_port().unwrap(), port);

    let ephemeral = UdpNonBlockingSocket::bind_to_port(0).unwrap();
    assert_ne!(ephemeral.local_port().unwrap(), 0);
}

#[test]
#[serial]
fn test_two_peers_over_udp() {
    let ports = [PortAllocator::next_port(), PortAllocator::next_port()];
    let stubs = [GameStub::new(), GameStub::new()];
    let mut sessions = [0, 1].map(|i| {
        let socket = UdpNonBlockingSocket::bind_to_port(ports[i]).unwrap();
        test_builder()
            .start_p2p_session(stubs[i].callbacks(), socket)
            .unwrap()
    });
    let mut locals = Vec::new();
    for (i, session) in sessions.iter_mut().enumerate() {
        locals.push(session.add_player(PlayerType::Local, i).unwrap());
        session
            .add_player(PlayerType::Remote(localhost(ports[1 - i])), 1 - i)
            .unwrap();
    }

    assert!(poll_with_sleep(
        || {
            for session in &mut sessions {
                session.idle(Duration::ZERO).unwrap();
            }
            sessions
                .iter()
                .all(|s| s.current_state() == SessionState::Running)
        },
        Duration::from_secs(5),
    ));

    let mut frames = [0i64; 2];
    assert!(poll_with_sleep(
        || {
            for i in 0..2 {
                if frames[i] >= 40 {
                    sessions[i].idle(Duration::ZERO).unwrap();
                    continue;
                }
                match sessions[i].add_local_input(locals[i], frames[i] * 2 + i as i64) {
                    Ok(()) => {
                        let inputs = sessions[i].synchronize_input().unwrap();
                        stubs[i].simulate(&inputs);
                        sessions[i].advance_frame().unwrap();
                        frames[i] += 1;
                    },
                    Err(SessionError::PredictionThreshold) => {
                        sessions[i].idle(Duration::ZERO).unwrap();
                    },
                    Err(err) => panic!("unexpected error: {err}"),
                }
            }
            frames.iter().all(|&f| f >= 40)
                && sessions.iter().all(|s| s.confirmed_frame().as_i32() >= 39)
        },
        Duration::from_secs(10),
    ));

    assert_eq!(stubs[0].value(), stubs[1].value());
    for frame in 1..=39 {
        assert_eq!(stubs[0].checksum_at(frame), stubs[1].checksum_at(frame));
    }
}
