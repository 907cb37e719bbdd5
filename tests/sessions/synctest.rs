//! Sync test session integration tests.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use crate::common::stubs::{GameStub, NondeterministicStub};
use rollback_session::{
    Event, EventCode, PlayerType, SessionBuilder, SessionError, SyncTestSession,
};

fn start(stub: &GameStub, players: usize, check_distance: usize) -> SyncTestSession {
    SessionBuilder::new("stub-game")
        .with_num_players(players)
        .unwrap()
        .start_synctest_session(stub.callbacks(), check_distance)
        .unwrap()
}

fn step(session: &mut SyncTestSession, stub: &GameStub, inputs: &[i64]) -> Result<(), SessionError> {
    for (index, &input) in inputs.iter().enumerate() {
        let handle = rollback_session::PlayerHandle::new(index as u32, 0);
        session.add_local_input(handle, input)?;
    }
    let synced = session.synchronize_input()?;
    stub.simulate(&synced);
    session.advance_frame()
}

#[test]
fn test_create_session() {
    let stub = GameStub::new();
    let session = start(&stub, 2, 2);
    assert_eq!(session.check_distance(), 2);
    assert_eq!(session.num_players(), 2);
    assert_eq!(stub.log.borrow().began, vec!["stub-game"]);
}

#[test]
fn test_check_distance_must_fit_the_prediction_window() {
    for distance in [0, 8, 9] {
        let result = SessionBuilder::new("g").start_synctest_session(GameStub::new().callbacks(), distance);
        assert!(
            matches!(result, Err(SessionError::InvalidRequest { .. })),
            "distance {distance} accepted"
        );
    }
    let builder = SessionBuilder::new("g").with_max_prediction_window(4).unwrap();
    assert!(builder.start_synctest_session(GameStub::new().callbacks(), 3).is_ok());
}

#[test]
fn test_advance_frame_with_rollbacks() {
    let stub = GameStub::new();
    let mut session = start(&stub, 2, 2);
    session.add_player(PlayerType::Local, 0).unwrap();
    session.add_player(PlayerType::Local, 1).unwrap();

    for i in 0..200 {
        step(&mut session, &stub, &[i, i * 2]).unwrap();
        assert_eq!(stub.frame(), i as i32 + 1);
        assert_eq!(session.current_frame().as_i32(), i as i32 + 1);
    }

    let log = stub.log.borrow();
    // frames 3..=200 each replay two frames
    assert_eq!(log.replayed, 198 * 2);
    assert_eq!(log.loads, 198);
    assert_eq!(log.count(EventCode::DesyncDetected), 0);
}

#[test]
fn test_long_check_distance() {
    let stub = GameStub::new();
    let mut session = start(&stub, 1, 7);
    session.add_player(PlayerType::Local, 0).unwrap();

    for i in 0..50 {
        step(&mut session, &stub, &[i % 3]).unwrap();
    }
    assert_eq!(stub.count(EventCode::DesyncDetected), 0);
    assert_eq!(session.frames_replayed(), 43 * 7);
}

#[test]
fn test_advance_frames_with_delayed_input() {
    let stub = GameStub::new();
    let mut session = SessionBuilder::new("stub-game")
        .with_num_players(1)
        .unwrap()
        .with_input_delay(2)
        .unwrap()
        .start_synctest_session(stub.callbacks(), 5)
        .unwrap();
    let player = session.add_player(PlayerType::Local, 0).unwrap();

    for i in 0..40 {
        session.add_local_input(player, i + 100).unwrap();
        let synced = session.synchronize_input().unwrap();
        let expected = if i < 2 { 0 } else { i - 2 + 100 };
        assert_eq!(synced.inputs[0], expected, "frame {i}");
        stub.simulate(&synced);
        session.advance_frame().unwrap();
    }
    assert_eq!(stub.count(EventCode::DesyncDetected), 0);
}

#[test]
fn test_nondeterministic_replays_are_reported() {
    let game = NondeterministicStub::default();
    let stub = game.inner.clone();
    let mut session = SessionBuilder::new("stub-game")
        .with_num_players(1)
        .unwrap()
        .start_synctest_session(Box::new(game), 2)
        .unwrap();
    session.add_player(PlayerType::Local, 0).unwrap();

    for i in 0..10 {
        // desyncs are events, not errors
        step(&mut session, &stub, &[i]).unwrap();
    }

    let events = stub.events();
    let desync = events
        .iter()
        .find(|e| e.code() == EventCode::DesyncDetected)
        .expect("no desync reported");
    let Event::DesyncDetected {
        local_checksum,
        remote_checksum,
        ..
    } = desync
    else {
        unreachable!();
    };
    assert_ne!(local_checksum, remote_checksum);

    let logged = stub.log.borrow().logged.clone();
    assert!(logged.iter().any(|line| line.starts_with("original")));
    assert!(logged.iter().any(|line| line.starts_with("replay")));
}

#[test]
fn test_input_before_all_players_joined() {
    let stub = GameStub::new();
    let mut session = start(&stub, 2, 2);
    let first = session.add_player(PlayerType::Local, 0).unwrap();
    assert_eq!(
        session.add_local_input(first, 1),
        Err(SessionError::NotSynchronized)
    );
}

#[test]
fn test_missing_input_is_rejected() {
    let stub = GameStub::new();
    let mut session = start(&stub, 2, 2);
    let first = session.add_player(PlayerType::Local, 0).unwrap();
    session.add_player(PlayerType::Local, 1).unwrap();

    session.add_local_input(first, 1).unwrap();
    assert!(matches!(
        session.synchronize_input(),
        Err(SessionError::InvalidRequest { .. })
    ));

    // the frame can still be completed
    session
        .add_local_input(rollback_session::PlayerHandle::new(1, 0), 2)
        .unwrap();
    let synced = session.synchronize_input().unwrap();
    assert_eq!(synced.inputs.as_slice(), &[1, 2]);
}

#[test]
fn test_remote_players_are_unsupported() {
    let stub = GameStub::new();
    let mut session = start(&stub, 2, 2);
    let addr = crate::common::platform(9);
    assert!(matches!(
        session.add_player(PlayerType::Remote(addr), 1),
        Err(SessionError::Unsupported { .. })
    ));
    assert!(matches!(
        session.add_player(PlayerType::Spectator(addr), 0),
        Err(SessionError::Unsupported { .. })
    ));
}

#[test]
fn test_close_frees_every_snapshot() {
    let stub = GameStub::new();
    let mut session = start(&stub, 1, 3);
    session.add_player(PlayerType::Local, 0).unwrap();
    for i in 0..30 {
        step(&mut session, &stub, &[i]).unwrap();
    }
    session.close();
    let log = stub.log.borrow();
    assert_eq!(log.frees, log.saves);
}

#[test]
fn test_failed_replay_returns_to_the_frame_before() {
    let stub = GameStub::new();
    let mut session = start(&stub, 1, 2);
    let player = session.add_player(PlayerType::Local, 0).unwrap();
    for i in 0..4 {
        step(&mut session, &stub, &[i]).unwrap();
    }
    let frees = stub.log.borrow().frees;

    stub.fail_replays(true);
    let err = step(&mut session, &stub, &[4]).unwrap_err();
    assert!(matches!(err, SessionError::GeneralFailure { .. }));
    assert_eq!(session.current_frame().as_i32(), 4);
    assert_eq!(stub.frame(), 4, "host state was not reloaded");
    // one eviction, then the snapshot of frame 5 itself
    assert_eq!(stub.log.borrow().frees, frees + 2);

    // the input of frame 4 is still queued
    stub.fail_replays(false);
    assert!(matches!(
        session.add_local_input(player, 4),
        Err(SessionError::InputDropped { .. })
    ));
    let synced = session.synchronize_input().unwrap();
    stub.simulate(&synced);
    session.advance_frame().unwrap();
    for i in 5..10 {
        step(&mut session, &stub, &[i]).unwrap();
    }

    assert_eq!(session.current_frame().as_i32(), 10);
    assert_eq!(stub.count(EventCode::DesyncDetected), 0);
    session.close();
    let log = stub.log.borrow();
    assert_eq!(log.frees, log.saves);
}

#[test]
fn test_player_handles_past_the_player_slots_are_out_of_range() {
    let stub = GameStub::new();
    let mut session = start(&stub, 2, 2);
    session.add_player(PlayerType::Local, 0).unwrap();
    session.add_player(PlayerType::Local, 1).unwrap();

    for index in [2, 3] {
        assert_eq!(
            session.add_local_input(rollback_session::PlayerHandle::new(index, 0), 1),
            Err(SessionError::PlayerOutOfRange {
                index: index as usize,
                limit: 2
            })
        );
    }
}
