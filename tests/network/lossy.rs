//! Sessions over an in-memory network that loses packets.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::time::Duration;

use crate::common::{poll_with_sleep, test_builder, PeerPair};
use rollback_session::SessionState;

#[test]
fn test_handshake_survives_loss() {
    let mut pair = PeerPair::new(&test_builder());
    pair.network.drop_every(3);

    assert!(poll_with_sleep(
        || {
            for session in &mut pair.sessions {
                session.idle(Duration::ZERO).unwrap();
            }
            pair.sessions
                .iter()
                .all(|s| s.current_state() == SessionState::Running)
        },
        Duration::from_secs(5),
    ));
    assert!(pair.network.dropped() > 0);
}

#[test]
fn test_inputs_are_retransmitted() {
    let mut pair = PeerPair::new(&test_builder());
    pair.synchronize();
    pair.network.drop_every(4);

    let mut frames = [0i64; 2];
    let converged = poll_with_sleep(
        || {
            for i in 0..2 {
                if frames[i] < 50 {
                    let frame = frames[i];
                    if pair.tick(i, frame * 11 + i as i64).unwrap() {
                        frames[i] += 1;
                    }
                } else {
                    pair.sessions[i].idle(Duration::ZERO).unwrap();
                }
            }
            frames.iter().all(|&f| f >= 50)
                && pair
                    .sessions
                    .iter()
                    .all(|s| s.confirmed_frame().as_i32() >= 49)
        },
        Duration::from_secs(10),
    );
    assert!(converged, "peers never confirmed every frame");
    assert!(pair.network.dropped() > 0);

    pair.settle();
    assert_eq!(pair.stubs[0].value(), pair.stubs[1].value());
    for frame in 1..=49 {
        assert_eq!(pair.stubs[0].checksum_at(frame), pair.stubs[1].checksum_at(frame));
    }
}
