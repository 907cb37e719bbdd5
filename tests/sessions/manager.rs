//! Driving every session variant through the `SessionManager` façade.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use crate::common::stubs::GameStub;
use crate::common::{platform, test_builder, MemoryNetwork, MAX_SYNC_ITERATIONS, POLL_INTERVAL};
use rollback_session::{
    ErrorCode, EventCode, Frame, PlayerStatus, PlayerType, SessionBuilder, SessionError,
    SessionHandle, SessionManager,
};

fn run_tick(
    manager: &mut SessionManager,
    session: SessionHandle,
    player: rollback_session::PlayerHandle,
    stub: &GameStub,
    input: i64,
) -> bool {
    match manager.add_local_input(session, player, input) {
        Ok(()) => {
            let inputs = manager.synchronize_input(session).unwrap();
            stub.simulate(&inputs);
            manager.advance_frame(session).unwrap();
            true
        },
        Err(SessionError::PredictionThreshold) => {
            manager.idle(session, 0).unwrap();
            false
        },
        Err(err) => panic!("unexpected error: {err}"),
    }
}

#[test]
fn test_two_peers_in_one_manager() {
    let network = MemoryNetwork::new();
    let mut manager = SessionManager::new();
    let stubs = [GameStub::new(), GameStub::new()];
    let addrs = [platform(1), platform(2)];

    let mut sessions = Vec::new();
    let mut locals = Vec::new();
    for i in 0..2 {
        let session = manager
            .start_session_with_socket(test_builder(), stubs[i].callbacks(), network.socket(addrs[i]))
            .unwrap();
        locals.push(manager.add_player(session, PlayerType::Local, i).unwrap());
        manager
            .add_player(session, PlayerType::Remote(addrs[1 - i]), 1 - i)
            .unwrap();
        manager.set_disconnect_timeout(session, 3000).unwrap();
        manager.set_disconnect_notify_start(session, 1000).unwrap();
        sessions.push(session);
    }
    assert_ne!(sessions[0], sessions[1]);
    assert_eq!(manager.len(), 2);

    for _ in 0..MAX_SYNC_ITERATIONS {
        for &session in &sessions {
            manager.idle(session, 0).unwrap();
        }
        if stubs.iter().all(|stub| stub.count(EventCode::Running) == 1) {
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    assert!(stubs.iter().all(|stub| stub.count(EventCode::Running) == 1));

    let mut frames = [0; 2];
    while frames.iter().any(|&f| f < 30) {
        for i in 0..2 {
            if frames[i] < 30 && run_tick(&mut manager, sessions[i], locals[i], &stubs[i], frames[i] * 5 + i as i64) {
                frames[i] += 1;
            }
        }
    }
    for _ in 0..4 {
        for &session in &sessions {
            manager.idle(session, 0).unwrap();
        }
    }

    assert_eq!(manager.current_frame(sessions[0]), Ok(Frame::new(30)));
    assert_eq!(stubs[0].value(), stubs[1].value());
    assert_eq!(
        manager.player_status(sessions[0], locals[0]),
        Ok(PlayerStatus::Running)
    );
    assert_eq!(
        ErrorCode::from_result(&manager.network_stats(sessions[0], locals[0])),
        ErrorCode::InvalidPlayerHandle
    );

    for &session in &sessions {
        manager.close_session(session).unwrap();
    }
    assert!(manager.is_empty());
    for stub in &stubs {
        let log = stub.log.borrow();
        assert_eq!(log.frees, log.saves);
    }
}

#[test]
fn test_closed_session_is_invalid() {
    let network = MemoryNetwork::new();
    let mut manager = SessionManager::new();
    let stub = GameStub::new();
    let session = manager
        .start_session_with_socket(test_builder(), stub.callbacks(), network.socket(platform(1)))
        .unwrap();
    manager.close_session(session).unwrap();

    let player = rollback_session::PlayerHandle::new(0, 0);
    let results = [
        ErrorCode::from_result(&manager.add_player(session, PlayerType::Local, 0)),
        ErrorCode::from_result(&manager.add_local_input(session, player, 1)),
        ErrorCode::from_result(&manager.synchronize_input(session)),
        ErrorCode::from_result(&manager.advance_frame(session)),
        ErrorCode::from_result(&manager.idle(session, 0)),
        ErrorCode::from_result(&manager.disconnect_player(session, player)),
        ErrorCode::from_result(&manager.set_frame_delay(session, player, 1)),
        ErrorCode::from_result(&manager.set_disconnect_timeout(session, 1)),
        ErrorCode::from_result(&manager.set_disconnect_notify_start(session, 1)),
        ErrorCode::from_result(&manager.network_stats(session, player)),
        ErrorCode::from_result(&manager.player_status(session, player)),
        ErrorCode::from_result(&manager.current_frame(session)),
        ErrorCode::from_result(&manager.log(session, "hi")),
        ErrorCode::from_result(&manager.close_session(session)),
    ];
    assert!(results.iter().all(|&code| code == ErrorCode::InvalidSession));
}

#[test]
fn test_synctest_through_manager() {
    let mut manager = SessionManager::new();
    let stub = GameStub::new();
    let builder = SessionBuilder::new("stub-game").with_num_players(1).unwrap();
    let session = manager.start_synctest(builder, stub.callbacks(), 3).unwrap();
    let player = manager.add_player(session, PlayerType::Local, 0).unwrap();
    manager.set_frame_delay(session, player, 1).unwrap();

    for i in 0..20 {
        assert!(run_tick(&mut manager, session, player, &stub, i));
    }
    assert_eq!(manager.current_frame(session), Ok(Frame::new(20)));
    assert_eq!(stub.count(EventCode::DesyncDetected), 0);
    assert_eq!(
        ErrorCode::from_result(&manager.set_disconnect_timeout(session, 100)),
        ErrorCode::Unsupported
    );
}

#[test]
fn test_start_session_binds_a_udp_port() {
    let mut manager = SessionManager::new();
    let first = manager
        .start_session(test_builder(), GameStub::new().callbacks(), 0)
        .unwrap();
    assert_eq!(manager.len(), 1);
    manager.close_session(first).unwrap();
}

#[test]
fn test_spectating_through_manager() {
    let network = MemoryNetwork::new();
    let mut manager = SessionManager::new();
    let stub = GameStub::new();
    let session = manager
        .start_spectating_with_socket(
            test_builder(),
            stub.callbacks(),
            network.socket(platform(5)),
            platform(1),
        )
        .unwrap();

    assert_eq!(
        manager.synchronize_input(session),
        Err(SessionError::NotSynchronized)
    );
    assert_eq!(manager.current_frame(session), Ok(Frame::new(0)));
    // the handshake request went out to the host
    assert!(network.sent() > 0);
    manager.close_session(session).unwrap();
}
