//! Spectator session integration tests: one single-player host streaming to a watcher.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::time::Duration;

use crate::common::stubs::GameStub;
use crate::common::{platform, poll_with_sleep, MemoryNetwork, MAX_SYNC_ITERATIONS, POLL_INTERVAL};
use rollback_session::{
    EventCode, P2PSession, PlayerHandle, PlayerStatus, PlayerType, Session, SessionBuilder,
    SessionError, SessionState, SpectatorConfig, SpectatorSession, SyncConfig,
};

struct Broadcast {
    network: MemoryNetwork,
    host: P2PSession,
    host_stub: GameStub,
    player: PlayerHandle,
    spectator: SpectatorSession,
    watcher: GameStub,
}

fn builder() -> SessionBuilder {
    SessionBuilder::new("stub-game")
        .with_num_players(1)
        .unwrap()
        .with_sync_config(SyncConfig::lan())
}

impl Broadcast {
    fn new(spectator_config: SpectatorConfig) -> Self {
        let network = MemoryNetwork::new();
        let host_stub = GameStub::new();
        let mut host = builder()
            .start_p2p_session(host_stub.callbacks(), network.socket(platform(1)))
            .unwrap();
        let player = host.add_player(PlayerType::Local, 0).unwrap();
        host.add_player(PlayerType::Spectator(platform(2)), 0).unwrap();

        let watcher = GameStub::new();
        let spectator = builder()
            .with_spectator_config(spectator_config)
            .start_spectator_session(watcher.callbacks(), platform(1), network.socket(platform(2)))
            .unwrap();

        Self {
            network,
            host,
            host_stub,
            player,
            spectator,
            watcher,
        }
    }

    fn synchronize(&mut self) {
        for _ in 0..MAX_SYNC_ITERATIONS {
            self.host.idle(Duration::ZERO).unwrap();
            self.spectator.idle(Duration::ZERO).unwrap();
            if self.host.current_state() == SessionState::Running
                && self.spectator.current_state() == SessionState::Running
            {
                return;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        panic!("spectator did not synchronize");
    }

    fn host_frames(&mut self, frames: i64) {
        for _ in 0..frames {
            let frame = i64::from(self.host_stub.frame());
            self.host.add_local_input(self.player, frame * 7 + 1).unwrap();
            let inputs = self.host.synchronize_input().unwrap();
            self.host_stub.simulate(&inputs);
            self.host.advance_frame().unwrap();
        }
        self.host.idle(Duration::ZERO).unwrap();
    }

    /// Simulates on the watcher until it reaches `frame` or runs out of input.
    fn watch_until(&mut self, frame: i32) -> Result<(), SessionError> {
        while self.watcher.frame() < frame {
            for _ in 0..self.spectator.frames_to_advance() {
                let inputs = self.spectator.synchronize_input()?;
                self.watcher.simulate(&inputs);
                self.spectator.advance_frame()?;
            }
        }
        Ok(())
    }
}

#[test]
fn test_spectator_synchronizes_with_host() {
    let mut broadcast = Broadcast::new(SpectatorConfig::default());
    assert_eq!(
        broadcast.spectator.synchronize_input(),
        Err(SessionError::NotSynchronized)
    );
    broadcast.synchronize();

    assert_eq!(broadcast.watcher.count(EventCode::Running), 1);
    assert_eq!(broadcast.host_stub.count(EventCode::Running), 1);
    assert_eq!(
        broadcast.spectator.player_status(PlayerHandle::new(0, 0)),
        Ok(PlayerStatus::Running)
    );
    assert_eq!(broadcast.spectator.host_addr(), platform(1));
}

#[test]
fn test_spectator_replays_host_inputs() {
    let mut broadcast = Broadcast::new(SpectatorConfig::default());
    broadcast.synchronize();

    broadcast.host_frames(20);
    // frames the host has not confirmed yet are not available
    assert_eq!(broadcast.watch_until(40), Err(SessionError::PredictionThreshold));
    assert_eq!(broadcast.watcher.frame(), 20);

    let host_checksum = broadcast.host_stub.checksum_at(20);
    assert_eq!(host_checksum, Some(broadcast.watcher.state.borrow().checksum()));
    assert_eq!(broadcast.spectator.current_frame().as_i32(), 20);
}

#[test]
fn test_spectator_catches_up() {
    let config = SpectatorConfig {
        buffer_size: 60,
        catchup_speed: 3,
        max_frames_behind: 5,
    };
    let mut broadcast = Broadcast::new(config);
    broadcast.synchronize();

    broadcast.host_frames(30);
    broadcast.spectator.idle(Duration::ZERO).unwrap();
    assert_eq!(broadcast.spectator.frames_behind_host(), 30);
    assert_eq!(broadcast.spectator.frames_to_advance(), 3);

    broadcast.watch_until(27).unwrap();
    assert!(broadcast.spectator.frames_behind_host() <= 5);
    assert_eq!(broadcast.spectator.frames_to_advance(), 1);
}

#[test]
fn test_spectator_too_far_behind() {
    let config = SpectatorConfig {
        buffer_size: 8,
        catchup_speed: 1,
        max_frames_behind: 4,
    };
    let mut broadcast = Broadcast::new(config);
    broadcast.synchronize();

    broadcast.host_frames(20);
    assert!(matches!(
        broadcast.spectator.synchronize_input(),
        Err(SessionError::InvalidRequest { .. })
    ));
}

#[test]
fn test_spectator_notices_silent_host() {
    let mut broadcast = Broadcast::new(SpectatorConfig::default());
    broadcast.synchronize();
    broadcast.spectator.set_disconnect_notify_start(Duration::from_millis(50));
    broadcast.spectator.set_disconnect_timeout(Duration::from_millis(200));

    broadcast.network.cut(platform(1));
    let watcher = broadcast.watcher.clone();
    let spectator = &mut broadcast.spectator;
    assert!(poll_with_sleep(
        || {
            spectator.idle(Duration::ZERO).unwrap();
            watcher.count(EventCode::DisconnectedFromPeer) > 0
        },
        Duration::from_secs(3),
    ));
    assert!(watcher.count(EventCode::ConnectionInterrupted) > 0);
}

#[test]
fn test_spectator_rejects_player_operations() {
    let mut broadcast = Broadcast::new(SpectatorConfig::default());
    broadcast.synchronize();

    let player = PlayerHandle::new(0, 0);
    let session: &mut dyn Session = &mut broadcast.spectator;
    assert!(matches!(
        session.add_local_input(player, 1),
        Err(SessionError::Unsupported { .. })
    ));
    assert!(matches!(
        session.add_player(PlayerType::Local, 0),
        Err(SessionError::Unsupported { .. })
    ));
    assert!(matches!(
        session.disconnect_player(player),
        Err(SessionError::Unsupported { .. })
    ));
    assert!(matches!(
        session.network_stats(PlayerHandle::new(3, 0)),
        Err(SessionError::PlayerOutOfRange { .. })
    ));
}
