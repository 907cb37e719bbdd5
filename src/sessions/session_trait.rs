use web_time::Duration;

use crate::{
    Frame, NetworkStats, PlayerHandle, PlayerStatus, PlayerType, SessionError, SyncedInputs,
};

/// The operations every session variant answers. [`SessionManager`] drives sessions
/// through this trait; operations a variant cannot perform return
/// [`SessionError::Unsupported`].
///
/// [`SessionManager`]: crate::SessionManager
pub trait Session {
    /// Registers a player or spectator. `player_num` is the player slot and is ignored
    /// for spectators.
    fn add_player(
        &mut self,
        _player_type: PlayerType,
        _player_num: usize,
    ) -> Result<PlayerHandle, SessionError> {
        Err(SessionError::Unsupported {
            operation: "add_player",
        })
    }

    /// Submits the input of a local player for the current frame.
    fn add_local_input(&mut self, _player: PlayerHandle, _input: i64) -> Result<(), SessionError> {
        Err(SessionError::Unsupported {
            operation: "add_local_input",
        })
    }

    /// Input vector the host simulates the current frame with.
    fn synchronize_input(&mut self) -> Result<SyncedInputs, SessionError>;

    /// Tells the session that the host simulated the current frame.
    fn advance_frame(&mut self) -> Result<(), SessionError>;

    /// Runs network and timers without advancing. Returns within `timeout`.
    fn idle(&mut self, timeout: Duration) -> Result<(), SessionError>;

    /// Disconnects a remote player or spectator immediately.
    fn disconnect_player(&mut self, _player: PlayerHandle) -> Result<(), SessionError> {
        Err(SessionError::Unsupported {
            operation: "disconnect_player",
        })
    }

    /// Changes the input delay of a local player.
    fn set_frame_delay(&mut self, _player: PlayerHandle, _delay: usize) -> Result<(), SessionError> {
        Err(SessionError::Unsupported {
            operation: "set_frame_delay",
        })
    }

    /// Silence after which peers are disconnected.
    fn set_disconnect_timeout(&mut self, _timeout: Duration) -> Result<(), SessionError> {
        Err(SessionError::Unsupported {
            operation: "set_disconnect_timeout",
        })
    }

    /// Silence after which an interruption is reported.
    fn set_disconnect_notify_start(&mut self, _notify_start: Duration) -> Result<(), SessionError> {
        Err(SessionError::Unsupported {
            operation: "set_disconnect_notify_start",
        })
    }

    /// Connection quality towards a remote player or spectator.
    fn network_stats(&self, _player: PlayerHandle) -> Result<NetworkStats, SessionError> {
        Err(SessionError::Unsupported {
            operation: "network_stats",
        })
    }

    /// Connection status of a participant.
    fn player_status(&self, player: PlayerHandle) -> Result<PlayerStatus, SessionError>;

    /// The frame the host simulates next.
    fn current_frame(&self) -> Frame;

    /// Releases every snapshot back to the host. The session is unusable afterwards.
    fn close(&mut self);
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used, dead_code)]
mod tests {
    use super::*;

    struct Inert;

    impl Session for Inert {
        fn synchronize_input(&mut self) -> Result<SyncedInputs, SessionError> {
            Err(SessionError::NotSynchronized)
        }

        fn advance_frame(&mut self) -> Result<(), SessionError> {
            Ok(())
        }

        fn idle(&mut self, _timeout: Duration) -> Result<(), SessionError> {
            Ok(())
        }

        fn player_status(&self, player: PlayerHandle) -> Result<PlayerStatus, SessionError> {
            Err(SessionError::InvalidPlayerHandle { handle: player })
        }

        fn current_frame(&self) -> Frame {
            Frame::new(0)
        }

        fn close(&mut self) {}
    }

    fn _assert_object_safe(_: &dyn Session) {}

    #[test]
    fn defaults_are_unsupported() {
        let mut session = Inert;
        let player = PlayerHandle::new(0, 0);
        let unsupported = |r: Result<(), SessionError>| {
            matches!(r, Err(SessionError::Unsupported { .. }))
        };
        assert!(unsupported(session.add_local_input(player, 1)));
        assert!(unsupported(session.disconnect_player(player)));
        assert!(unsupported(session.set_frame_delay(player, 1)));
        assert!(unsupported(
            session.set_disconnect_timeout(Duration::from_millis(1))
        ));
        assert!(unsupported(
            session.set_disconnect_notify_start(Duration::from_millis(1))
        ));
        assert!(matches!(
            session.network_stats(player),
            Err(SessionError::Unsupported {
                operation: "network_stats"
            })
        ));
        assert!(matches!(
            session.add_player(PlayerType::Local, 0),
            Err(SessionError::Unsupported { .. })
        ));
    }
}
