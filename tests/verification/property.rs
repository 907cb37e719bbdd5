//! Property-based tests for the wire layer, the slot arena and whole sync test sessions.
//!
//! # Properties
//!
//! - Input bundles decode to exactly the records that were encoded, for any reference
//! - Records equal to the reference compress to a handful of bytes
//! - Arbitrary bytes never panic the bundle or message decoders
//! - Removed arena handles never resolve again, even after the slot is reused
//! - A deterministic game never reports a desync, whatever the input or check distance
//! - Simulated state does not depend on the check distance
//! - Peers that exchange input ahead of time never roll back

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::time::Duration;

use crate::common::stubs::GameStub;
use crate::common::{test_builder, PeerPair};
use proptest::prelude::*;
use rollback_session::arena::{Arena, LookupError};
use rollback_session::network::{codec, compression};
use rollback_session::{EventCode, Message, PlayerHandle, PlayerType, SessionBuilder};

// ============================================================================
// Strategies
// ============================================================================

/// Inputs are eight-byte records on the wire.
fn record_strategy() -> impl Strategy<Value = i64> {
    prop_oneof![
        3 => Just(0i64),
        3 => 0i64..16,
        1 => any::<i64>(),
    ]
}

fn records_strategy() -> impl Strategy<Value = Vec<i64>> {
    prop::collection::vec(record_strategy(), 0..64)
}

#[derive(Debug, Clone, Copy)]
enum ArenaOp {
    Insert(u16),
    Remove(usize),
}

fn arena_ops_strategy() -> impl Strategy<Value = Vec<ArenaOp>> {
    prop::collection::vec(
        prop_oneof![
            any::<u16>().prop_map(ArenaOp::Insert),
            (0usize..32).prop_map(ArenaOp::Remove),
        ],
        1..100,
    )
}

fn run_synctest(stub: &GameStub, check_distance: usize, inputs: &[(i64, i64)]) {
    let mut session = SessionBuilder::new("stub-game")
        .with_num_players(2)
        .unwrap()
        .start_synctest_session(stub.callbacks(), check_distance)
        .unwrap();
    let first = session.add_player(PlayerType::Local, 0).unwrap();
    let second = session.add_player(PlayerType::Local, 1).unwrap();

    for &(a, b) in inputs {
        session.add_local_input(first, a).unwrap();
        session.add_local_input(second, b).unwrap();
        let synced = session.synchronize_input().unwrap();
        stub.simulate(&synced);
        session.advance_frame().unwrap();
    }
}

// ============================================================================
// Input bundles
// ============================================================================

proptest! {
    /// Decoding recovers every record in order.
    #[test]
    fn prop_bundle_recovers_records(reference in any::<i64>(), records in records_strategy()) {
        let reference = reference.to_le_bytes();
        let bytes: Vec<[u8; 8]> = records.iter().map(|r| r.to_le_bytes()).collect();

        let encoded = compression::encode(&reference, bytes.iter().map(|b| b.as_slice()));
        let decoded = compression::decode(&reference, &encoded).unwrap();

        prop_assert_eq!(decoded.len(), records.len());
        for (record, original) in decoded.iter().zip(&records) {
            let value = i64::from_le_bytes(record.as_slice().try_into().unwrap());
            prop_assert_eq!(value, *original);
        }
    }

    /// A run of unchanged input costs almost nothing.
    #[test]
    fn prop_unchanged_input_compresses(reference in any::<i64>(), count in 1usize..128) {
        let reference = reference.to_le_bytes();
        let records = vec![reference; count];

        let encoded = compression::encode(&reference, records.iter().map(|b| b.as_slice()));
        prop_assert!(
            encoded.len() <= 4,
            "{} unchanged records took {} bytes",
            count,
            encoded.len()
        );
    }

    /// Garbage from the network is rejected, never a panic.
    #[test]
    fn prop_bundle_decode_is_total(
        reference in prop::collection::vec(any::<u8>(), 0..12),
        data in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        if let Ok(records) = compression::decode(&reference, &data) {
            prop_assert!(records.iter().all(|r| r.len() == reference.len()));
        }
    }

    /// Whatever decodes as a message re-encodes to the same message.
    #[test]
    fn prop_message_decode_is_total(data in prop::collection::vec(any::<u8>(), 0..256)) {
        if let Ok(message) = codec::decode_value::<Message>(&data) {
            let bytes = codec::encode(&message).unwrap();
            let again: Message = codec::decode_value(&bytes).unwrap();
            prop_assert_eq!(again, message);
        }
    }

    /// Handles keep their identity on the wire.
    #[test]
    fn prop_handles_survive_the_codec(index in 0u32..64, generation in any::<u32>()) {
        let handle = PlayerHandle::new(index, generation);
        let bytes = codec::encode(&handle).unwrap();
        let (decoded, read) = codec::decode::<PlayerHandle>(&bytes).unwrap();
        prop_assert_eq!(decoded, handle);
        prop_assert_eq!(read, bytes.len());
    }
}

// ============================================================================
// Arena
// ============================================================================

proptest! {
    /// Live handles resolve to their value; removed handles stay dead.
    #[test]
    fn prop_removed_handles_stay_stale(ops in arena_ops_strategy()) {
        let mut arena = Arena::new();
        let mut live = Vec::new();
        let mut dead = Vec::new();

        for op in ops {
            match op {
                ArenaOp::Insert(value) => {
                    let handle = arena.insert(value);
                    live.push((handle, value));
                },
                ArenaOp::Remove(pick) => {
                    if live.is_empty() {
                        continue;
                    }
                    let (handle, value) = live.swap_remove(pick % live.len());
                    prop_assert_eq!(arena.remove(handle), Ok(value));
                    dead.push(handle);
                },
            }

            prop_assert_eq!(arena.len(), live.len());
            for &(handle, value) in &live {
                prop_assert_eq!(arena.get(handle), Ok(&value));
            }
            for &handle in &dead {
                prop_assert!(matches!(
                    arena.get(handle),
                    Err(LookupError::Stale | LookupError::Vacant)
                ));
            }
        }
    }
}

// ============================================================================
// Sync test sessions
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Replays of a deterministic game always match.
    #[test]
    fn prop_deterministic_game_never_desyncs(
        check_distance in 1usize..8,
        inputs in prop::collection::vec((record_strategy(), record_strategy()), 1..80),
    ) {
        let stub = GameStub::new();
        run_synctest(&stub, check_distance, &inputs);

        prop_assert_eq!(stub.count(EventCode::DesyncDetected), 0);
        prop_assert_eq!(stub.frame(), inputs.len() as i32);
    }

    /// Rolling back further changes how often frames run, not what they produce.
    #[test]
    fn prop_state_is_independent_of_check_distance(
        near in 1usize..4,
        far in 4usize..8,
        inputs in prop::collection::vec((record_strategy(), record_strategy()), 1..60),
    ) {
        let short = GameStub::new();
        let long = GameStub::new();
        run_synctest(&short, near, &inputs);
        run_synctest(&long, far, &inputs);

        prop_assert_eq!(short.value(), long.value());
        for frame in 0..short.frame() {
            if let (Some(a), Some(b)) = (short.checksum_at(frame), long.checksum_at(frame)) {
                prop_assert_eq!(a, b, "frame {}", frame);
            }
        }
    }
}

// ============================================================================
// Peer-to-peer sessions
// ============================================================================

/// Both peers submit their input, let it cross the network, then simulate.
fn run_lockstep(pair: &mut PeerPair, inputs: &[(i64, i64)]) {
    for &(a, b) in inputs {
        for (i, input) in [a, b].into_iter().enumerate() {
            pair.sessions[i].add_local_input(pair.locals[i], input).unwrap();
        }
        for session in &mut pair.sessions {
            session.idle(Duration::ZERO).unwrap();
        }
        for i in 0..2 {
            let synced = pair.sessions[i].synchronize_input().unwrap();
            assert_nothing_predicted(&synced);
            pair.stubs[i].simulate(&synced);
            pair.sessions[i].advance_frame().unwrap();
        }
    }
}

fn assert_nothing_predicted(synced: &rollback_session::SyncedInputs) {
    assert!(
        synced.predicted.is_empty(),
        "frame {} was predicted",
        synced.frame
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// With input delay, remote input arrives before its frame is simulated, so no
    /// prediction is ever corrected.
    #[test]
    fn prop_delayed_input_never_rolls_back(
        delay in 1usize..4,
        inputs in prop::collection::vec((record_strategy(), record_strategy()), 1..50),
    ) {
        let builder = test_builder().with_input_delay(delay).unwrap();
        let mut pair = PeerPair::new(&builder);
        pair.synchronize();
        run_lockstep(&mut pair, &inputs);
        pair.settle();

        for i in 0..2 {
            prop_assert_eq!(pair.sessions[i].rollbacks(), 0, "peer {} rolled back", i);
            prop_assert_eq!(pair.stubs[i].log.borrow().replayed, 0);
            prop_assert_eq!(pair.stubs[i].frame(), inputs.len() as i32);
        }
        prop_assert_eq!(pair.stubs[0].value(), pair.stubs[1].value());
    }
}
