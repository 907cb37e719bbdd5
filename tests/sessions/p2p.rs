//! Peer-to-peer session integration tests over the in-memory network.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::time::Duration;

use crate::common::stubs::GameStub;
use crate::common::{platform, poll_with_sleep, test_builder, MemoryNetwork, PeerPair};
use rollback_session::{
    DesyncDetection, Event, EventCode, InputStatus, PlayerHandle, PlayerStatus, PlayerType,
    SessionError, SessionState,
};

fn varied(peer: usize, frame: i32) -> i64 {
    i64::from(frame) * 3 + peer as i64 * 101 + i64::from(frame % 5)
}

fn assert_confirmed_history_agrees(pair: &PeerPair) {
    let confirmed = std::cmp::min(
        pair.sessions[0].confirmed_frame(),
        pair.sessions[1].confirmed_frame(),
    );
    assert!(confirmed.as_i32() > 0);
    for frame in 1..=confirmed.as_i32() {
        let a = pair.stubs[0].checksum_at(frame);
        let b = pair.stubs[1].checksum_at(frame);
        assert!(a.is_some(), "frame {frame} was never saved");
        assert_eq!(a, b, "peers disagree at frame {frame}");
    }
}

#[test]
fn test_peers_synchronize() {
    let mut pair = PeerPair::new(&test_builder());
    assert_eq!(pair.sessions[0].current_state(), SessionState::Synchronizing);
    assert_eq!(
        pair.sessions[0].add_local_input(pair.locals[0], 1),
        Err(SessionError::NotSynchronized)
    );

    pair.synchronize();

    for i in 0..2 {
        let stub = &pair.stubs[i];
        assert_eq!(stub.count(EventCode::ConnectedToPeer), 1);
        assert_eq!(stub.count(EventCode::SynchronizedWithPeer), 1);
        assert_eq!(stub.count(EventCode::Running), 1);
        assert_eq!(
            pair.sessions[i].player_status(pair.remotes[i]),
            Ok(PlayerStatus::Running)
        );
        assert_eq!(
            pair.sessions[i].player_status(pair.locals[i]),
            Ok(PlayerStatus::Running)
        );
    }
    assert_eq!(pair.stubs[0].log.borrow().began, vec!["stub-game"]);
}

#[test]
fn test_handshake_reports_progress_in_order() {
    let mut pair = PeerPair::new(&test_builder());
    pair.synchronize();

    let events = pair.stubs[0].events();
    let progress: Vec<u32> = events
        .iter()
        .filter_map(|event| match event {
            Event::SynchronizingWithPeer { count, .. } => Some(*count),
            _ => None,
        })
        .collect();
    // the lan profile needs three round trips; the last one completes the handshake
    assert_eq!(progress, vec![1, 2]);

    let connected = events
        .iter()
        .position(|e| e.code() == EventCode::ConnectedToPeer)
        .unwrap();
    let synced = events
        .iter()
        .position(|e| e.code() == EventCode::SynchronizedWithPeer)
        .unwrap();
    let running = events
        .iter()
        .position(|e| e.code() == EventCode::Running)
        .unwrap();
    assert!(connected < synced && synced < running);
}

#[test]
fn test_states_agree_after_rollbacks() {
    let mut pair = PeerPair::new(&test_builder());
    pair.synchronize();

    pair.run(60, varied);
    pair.settle();

    assert_eq!(pair.stubs[0].frame(), 60);
    assert_eq!(pair.stubs[1].frame(), 60);
    assert!(pair.sessions[0].rollbacks() > 0, "peer 0 never corrected a prediction");
    assert!(pair.stubs[0].log.borrow().loads > 0);
    assert_eq!(pair.stubs[0].value(), pair.stubs[1].value());
    assert_confirmed_history_agrees(&pair);
}

#[test]
fn test_constant_input_needs_no_rollback() {
    let mut pair = PeerPair::new(&test_builder());
    pair.synchronize();

    pair.run(40, |_, _| 0);
    pair.settle();

    for i in 0..2 {
        assert_eq!(pair.sessions[i].rollbacks(), 0);
        assert_eq!(pair.stubs[i].log.borrow().replayed, 0);
    }
    assert_eq!(pair.stubs[0].value(), pair.stubs[1].value());
}

#[test]
fn test_remote_inputs_become_confirmed() {
    let mut pair = PeerPair::new(&test_builder());
    pair.synchronize();

    pair.run(10, varied);
    pair.settle();

    // peer 1 has seen every input of peer 0 up to frame 9
    let session = &mut pair.sessions[1];
    session.add_local_input(pair.locals[1], 0).unwrap();
    let inputs = session.synchronize_input().unwrap();
    assert_eq!(inputs.frame.as_i32(), 10);
    assert_eq!(inputs.status(1), InputStatus::Confirmed);
    assert_eq!(inputs.status(0), InputStatus::Predicted);
    assert_eq!(inputs.inputs[0], varied(0, 9));
    assert_eq!(session.confirmed_frame().as_i32(), 9);
}

#[test]
fn test_input_delay_shifts_local_input() {
    let builder = test_builder().with_input_delay(2).unwrap();
    let mut pair = PeerPair::new(&builder);
    pair.synchronize();

    let session = &mut pair.sessions[0];
    session.add_local_input(pair.locals[0], 42).unwrap();
    let inputs = session.synchronize_input().unwrap();
    assert_eq!(inputs.frame.as_i32(), 0);
    assert_eq!(inputs.inputs[0], 0);
    assert_eq!(inputs.status(0), InputStatus::Confirmed);

    pair.stubs[0].simulate(&inputs);
    pair.sessions[0].advance_frame().unwrap();
    for frame in 1..3 {
        pair.sessions[0].add_local_input(pair.locals[0], 42 + frame).unwrap();
        let inputs = pair.sessions[0].synchronize_input().unwrap();
        let expected = if frame < 2 { 0 } else { 42 };
        assert_eq!(inputs.inputs[0], expected, "frame {frame}");
        pair.stubs[0].simulate(&inputs);
        pair.sessions[0].advance_frame().unwrap();
    }
}

#[test]
fn test_set_frame_delay_rejects_remote_players() {
    let mut pair = PeerPair::new(&test_builder());
    let remote = pair.remotes[0];
    assert_eq!(
        pair.sessions[0].set_frame_delay(remote, 1),
        Err(SessionError::InvalidPlayerHandle { handle: remote })
    );
    assert!(pair.sessions[0].set_frame_delay(pair.locals[0], 3).is_ok());
}

#[test]
fn test_prediction_threshold_stalls_until_peer_catches_up() {
    let mut pair = PeerPair::new(&test_builder());
    pair.synchronize();

    let mut simulated = 0;
    loop {
        let session = &mut pair.sessions[0];
        match session.add_local_input(pair.locals[0], 1) {
            Ok(()) => {
                let inputs = session.synchronize_input().unwrap();
                pair.stubs[0].simulate(&inputs);
                session.advance_frame().unwrap();
                simulated += 1;
            },
            Err(SessionError::PredictionThreshold) => break,
            Err(err) => panic!("unexpected error: {err}"),
        }
        assert!(simulated <= 8, "threshold never hit");
    }
    assert_eq!(simulated, 8);

    for _ in 0..3 {
        assert!(pair.tick(1, 2).unwrap());
    }
    pair.settle();
    assert!(pair.tick(0, 1).unwrap());
}

#[test]
fn test_desync_is_reported() {
    let builder = test_builder().with_desync_detection(DesyncDetection::On { interval: 5 });
    let stubs = [GameStub::new(), GameStub::corrupting_checksums_from(20)];
    let mut pair = PeerPair::with_stubs(&builder, stubs);
    pair.synchronize();

    pair.run(80, varied);
    pair.settle();

    for i in 0..2 {
        let desyncs: Vec<Event> = pair.stubs[i]
            .events()
            .into_iter()
            .filter(|e| e.code() == EventCode::DesyncDetected)
            .collect();
        assert!(!desyncs.is_empty(), "peer {i} saw no desync");
        for event in desyncs {
            let Event::DesyncDetected {
                frame,
                local_checksum,
                remote_checksum,
                player,
            } = event
            else {
                unreachable!();
            };
            assert!(frame.as_i32() >= 20);
            assert_eq!(frame.as_i32() % 5, 0);
            assert_ne!(local_checksum, remote_checksum);
            assert_eq!(player, pair.remotes[i]);
        }
    }
}

#[test]
fn test_matching_checksums_are_silent() {
    let builder = test_builder().with_desync_detection(DesyncDetection::On { interval: 3 });
    let mut pair = PeerPair::new(&builder);
    pair.synchronize();

    pair.run(60, varied);
    pair.settle();

    assert_eq!(pair.stubs[0].count(EventCode::DesyncDetected), 0);
    assert_eq!(pair.stubs[1].count(EventCode::DesyncDetected), 0);
}

#[test]
fn test_silent_peer_is_disconnected() {
    let mut pair = PeerPair::new(&test_builder());
    pair.synchronize();
    pair.run(5, varied);
    pair.settle();

    let session = &mut pair.sessions[0];
    session.set_disconnect_notify_start(Duration::from_millis(60));
    session.set_disconnect_timeout(Duration::from_millis(250));

    // peer 1 stops polling entirely
    let stub = pair.stubs[0].clone();
    let disconnected = poll_with_sleep(
        || {
            session.idle(Duration::ZERO).unwrap();
            stub.count(EventCode::DisconnectedFromPeer) > 0
        },
        Duration::from_secs(3),
    );
    assert!(disconnected);

    let events = pair.stubs[0].events();
    let interrupted = events
        .iter()
        .position(|e| matches!(e, Event::ConnectionInterrupted { .. }))
        .expect("no interruption before the disconnect");
    let gone = events
        .iter()
        .position(|e| e.code() == EventCode::DisconnectedFromPeer)
        .unwrap();
    assert!(interrupted < gone);
    assert_eq!(
        pair.sessions[0].player_status(pair.remotes[0]),
        Ok(PlayerStatus::Disconnected)
    );

    // the survivor keeps playing with blank input for the missing player
    for _ in 0..20 {
        assert!(pair.tick(0, 7).unwrap());
    }
    let session = &mut pair.sessions[0];
    session.add_local_input(pair.locals[0], 7).unwrap();
    let inputs = session.synchronize_input().unwrap();
    assert_eq!(inputs.status(1), InputStatus::Disconnected);
    assert_eq!(inputs.inputs[1], 0);
}

#[test]
fn test_interrupted_peer_resumes() {
    let mut pair = PeerPair::new(&test_builder());
    pair.synchronize();
    pair.sessions[0].set_disconnect_notify_start(Duration::from_millis(50));
    pair.sessions[0].set_disconnect_timeout(Duration::from_secs(10));

    let addr = platform(2);
    pair.network.cut(addr);
    let stub = pair.stubs[0].clone();
    assert!(poll_with_sleep(
        || {
            for session in &mut pair.sessions {
                session.idle(Duration::ZERO).unwrap();
            }
            stub.count(EventCode::ConnectionInterrupted) > 0
        },
        Duration::from_secs(3),
    ));
    assert_eq!(
        pair.sessions[0].player_status(pair.remotes[0]),
        Ok(PlayerStatus::Interrupted)
    );

    pair.network.restore(addr);
    assert!(poll_with_sleep(
        || {
            for session in &mut pair.sessions {
                session.idle(Duration::ZERO).unwrap();
            }
            stub.count(EventCode::ConnectionResumed) > 0
        },
        Duration::from_secs(3),
    ));
    assert_eq!(
        pair.sessions[0].player_status(pair.remotes[0]),
        Ok(PlayerStatus::Running)
    );
}

#[test]
fn test_manual_disconnect() {
    let mut pair = PeerPair::new(&test_builder());
    pair.synchronize();
    pair.run(10, varied);

    let remote = pair.remotes[0];
    pair.sessions[0].disconnect_player(remote).unwrap();
    assert_eq!(
        pair.sessions[0].disconnect_player(remote),
        Err(SessionError::PlayerDisconnected { handle: remote })
    );
    assert_eq!(
        pair.sessions[0].player_status(remote),
        Ok(PlayerStatus::Disconnected)
    );
    for _ in 0..15 {
        assert!(pair.tick(0, 1).unwrap());
    }
}

#[test]
fn test_network_stats() {
    let mut pair = PeerPair::new(&test_builder());
    pair.synchronize();

    let local = pair.locals[0];
    assert_eq!(
        pair.sessions[0].network_stats(local),
        Err(SessionError::InvalidPlayerHandle { handle: local })
    );
    assert_eq!(
        pair.sessions[0].network_stats(pair.remotes[0]),
        Err(SessionError::NotSynchronized)
    );

    let remote = pair.remotes[0];
    let mut stats = None;
    assert!(poll_with_sleep(
        || {
            for session in &mut pair.sessions {
                session.idle(Duration::ZERO).unwrap();
            }
            stats = pair.sessions[0].network_stats(remote).ok();
            stats.is_some()
        },
        Duration::from_secs(3),
    ));
    let stats = stats.unwrap();
    assert!(stats.kbps_sent < 1000);
}

#[test]
fn test_hosts_a_spectator() {
    let mut pair = PeerPair::new(&test_builder());
    let spectator_addr = platform(3);
    let handle = pair.sessions[0]
        .add_player(PlayerType::Spectator(spectator_addr), 0)
        .unwrap();
    assert_eq!(handle.index(), 2);
    assert_eq!(pair.sessions[0].num_spectators(), 1);

    let watcher = GameStub::new();
    let mut spectator = test_builder()
        .start_spectator_session(
            watcher.callbacks(),
            platform(1),
            pair.network.socket(spectator_addr),
        )
        .unwrap();

    for _ in 0..crate::common::MAX_SYNC_ITERATIONS {
        for session in &mut pair.sessions {
            session.idle(Duration::ZERO).unwrap();
        }
        spectator.idle(Duration::ZERO).unwrap();
        if pair.sessions[0].current_state() == SessionState::Running
            && spectator.current_state() == SessionState::Running
        {
            break;
        }
        std::thread::sleep(crate::common::POLL_INTERVAL);
    }
    assert_eq!(spectator.current_state(), SessionState::Running);

    pair.run(30, varied);
    pair.settle();

    let confirmed = pair.sessions[0].confirmed_frame().as_i32();
    assert!(confirmed >= 29);
    let done = poll_with_sleep(
        || {
            pair.sessions[0].idle(Duration::ZERO).unwrap();
            for _ in 0..spectator.frames_to_advance() {
                match spectator.synchronize_input() {
                    Ok(inputs) => {
                        assert!(inputs.predicted.is_empty());
                        watcher.simulate(&inputs);
                        spectator.advance_frame().unwrap();
                    },
                    Err(SessionError::PredictionThreshold) => break,
                    Err(err) => panic!("unexpected error: {err}"),
                }
            }
            watcher.frame() > confirmed
        },
        Duration::from_secs(5),
    );
    assert!(done);

    let frame = watcher.frame();
    assert_eq!(
        pair.stubs[0].checksum_at(frame),
        Some(watcher.state.borrow().checksum())
    );
    assert_eq!(watcher.log.borrow().replayed, 0);
    assert_eq!(watcher.log.borrow().saves, 0);
}

#[test]
fn test_duplicate_spectator_is_rejected() {
    let mut pair = PeerPair::new(&test_builder());
    let addr = platform(3);
    pair.sessions[0]
        .add_player(PlayerType::Spectator(addr), 0)
        .unwrap();
    assert!(matches!(
        pair.sessions[0].add_player(PlayerType::Spectator(addr), 0),
        Err(SessionError::InvalidRequest { .. })
    ));
    assert_eq!(pair.sessions[0].num_spectators(), 1);
}

#[test]
fn test_close_frees_every_snapshot() {
    let mut pair = PeerPair::new(&test_builder());
    pair.synchronize();
    pair.run(25, varied);

    for i in 0..2 {
        pair.sessions[i].close();
        let log = pair.stubs[i].log.borrow();
        assert_eq!(log.frees, log.saves, "peer {i} leaked snapshots");
    }
}

#[test]
fn test_player_handles_past_the_player_slots_are_out_of_range() {
    let stub = GameStub::new();
    let mut session = test_builder()
        .start_p2p_session(stub.callbacks(), MemoryNetwork::new().socket(platform(1)))
        .unwrap();
    session.add_player(PlayerType::Local, 0).unwrap();
    session.add_player(PlayerType::Local, 1).unwrap();
    assert_eq!(session.current_state(), SessionState::Running);

    for index in [2, 3] {
        assert_eq!(
            session.add_local_input(PlayerHandle::new(index, 0), 1),
            Err(SessionError::PlayerOutOfRange {
                index: index as usize,
                limit: 2
            })
        );
    }
}

/// Runs both peers to frame 5 on blank input, then lets peer 1 alone play three frames
/// with input 9 so that peer 0's next advance has to correct frame 5.
fn diverge_after_five_frames(pair: &mut PeerPair) {
    pair.synchronize();
    pair.run(5, |_, _| 0);
    pair.settle();
    assert_eq!(pair.sessions[0].current_frame().as_i32(), 5);
    for _ in 0..3 {
        assert!(pair.tick(1, 9).unwrap());
    }
}

#[test]
fn test_failed_correction_returns_to_the_frame_before() {
    let mut pair = PeerPair::new(&test_builder());
    diverge_after_five_frames(&mut pair);
    let confirmed = pair.sessions[0].confirmed_frame();

    pair.stubs[0].fail_replays(true);
    let err = pair.tick(0, 0).unwrap_err();
    assert!(matches!(err, SessionError::GeneralFailure { .. }));
    assert_eq!(pair.sessions[0].current_frame().as_i32(), 5);
    assert_eq!(pair.sessions[0].confirmed_frame(), confirmed);
    assert_eq!(pair.sessions[0].rollbacks(), 0);
    assert_eq!(pair.stubs[0].frame(), 5, "host state was not reloaded");

    // the frame is repeated with the input already queued, now confirmed
    pair.stubs[0].fail_replays(false);
    assert!(matches!(
        pair.sessions[0].add_local_input(pair.locals[0], 0),
        Err(SessionError::InputDropped { .. })
    ));
    let inputs = pair.sessions[0].synchronize_input().unwrap();
    assert_eq!(inputs.frame.as_i32(), 5);
    assert_eq!(inputs.inputs[1], 9);
    assert_eq!(inputs.status(1), InputStatus::Confirmed);
    pair.stubs[0].simulate(&inputs);
    pair.sessions[0].advance_frame().unwrap();
    assert_eq!(pair.sessions[0].rollbacks(), 1);

    while pair.stubs[0].frame() < 8 {
        assert!(pair.tick(0, 0).unwrap());
    }
    pair.run(10, |peer, _| if peer == 1 { 9 } else { 0 });
    pair.settle();

    assert_eq!(pair.stubs[0].frame(), 18);
    assert_eq!(pair.stubs[0].value(), pair.stubs[1].value());
    assert_confirmed_history_agrees(&pair);
}

#[test]
fn test_failed_load_during_correction_keeps_confirmed_frame() {
    let mut pair = PeerPair::new(&test_builder());
    diverge_after_five_frames(&mut pair);
    let confirmed = pair.sessions[0].confirmed_frame();
    let frees = pair.stubs[0].log.borrow().frees;
    let saves = pair.stubs[0].log.borrow().saves;

    pair.stubs[0].fail_loads(true);
    let err = pair.tick(0, 0).unwrap_err();
    assert!(matches!(err, SessionError::GeneralFailure { .. }));
    assert_eq!(pair.sessions[0].confirmed_frame(), confirmed);
    assert_eq!(pair.sessions[0].current_frame().as_i32(), 5);
    assert_eq!(pair.sessions[0].rollbacks(), 0);

    // the snapshot saved by the failed advance went back to the host
    let log = pair.stubs[0].log.borrow();
    assert_eq!(log.saves, saves + 1);
    assert!(log.frees > frees);
}
