//! The façade hosts drive sessions through.
//!
//! A [`SessionManager`] owns any number of sessions and hands out a [`SessionHandle`]
//! for each. Every call validates the handle first; a closed or foreign handle yields
//! [`SessionError::InvalidSession`]. Calls run with the session's [`SessionLogger`]
//! installed, so everything a session logs lands in its own subscriber.
//!
//! ```
//! use rollback_session::{
//!     CallbackError, Event, Frame, PlayerType, SaveBuffer, SessionBuilder,
//!     SessionCallbacks, SessionManager, SyncedInputs,
//! };
//!
//! struct Counter(i64);
//!
//! impl SessionCallbacks for Counter {
//!     fn begin_game(&mut self, _game: &str) -> Result<(), CallbackError> {
//!         Ok(())
//!     }
//!     fn advance_frame(&mut self, inputs: &SyncedInputs, _flags: u32) -> Result<(), CallbackError> {
//!         self.0 += inputs.inputs.iter().sum::<i64>();
//!         Ok(())
//!     }
//!     fn save_game_state(&mut self, _frame: Frame) -> Result<(SaveBuffer, u64), CallbackError> {
//!         Ok((SaveBuffer::new(self.0.to_le_bytes().to_vec()), self.0 as u64))
//!     }
//!     fn load_game_state(&mut self, buffer: &SaveBuffer) -> Result<(), CallbackError> {
//!         let bytes = buffer.as_bytes().try_into().map_err(|_| CallbackError::new("size"))?;
//!         self.0 = i64::from_le_bytes(bytes);
//!         Ok(())
//!     }
//!     fn on_event(&mut self, _event: &Event) -> Result<(), CallbackError> {
//!         Ok(())
//!     }
//! }
//!
//! let mut manager = SessionManager::new();
//! let builder = SessionBuilder::new("demo").with_num_players(1)?;
//! let session = manager.start_synctest(builder, Box::new(Counter(0)), 2)?;
//! let player = manager.add_player(session, PlayerType::Local, 0)?;
//!
//! manager.add_local_input(session, player, 1)?;
//! let inputs = manager.synchronize_input(session)?;
//! assert_eq!(inputs.inputs.as_slice(), &[1]);
//! manager.advance_frame(session)?;
//! assert_eq!(manager.current_frame(session)?, Frame::new(1));
//!
//! manager.close_session(session)?;
//! assert!(manager.current_frame(session).is_err());
//! # Ok::<(), rollback_session::SessionError>(())
//! ```

use tracing::info;
use web_time::Duration;

use crate::arena::Arena;
use crate::callbacks::SessionCallbacks;
use crate::sessions::builder::SessionBuilder;
use crate::{
    Frame, NetworkStats, NonBlockingSocket, PeerAddress, PlayerHandle, PlayerStatus, PlayerType,
    Session, SessionError, SessionHandle, SessionLogger, SyncedInputs, UdpNonBlockingSocket,
};

struct SessionEntry {
    session: Box<dyn Session>,
    logger: SessionLogger,
}

/// Owns every live session and routes calls to them by handle.
#[derive(Default)]
pub struct SessionManager {
    sessions: Arena<SessionEntry>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

fn bind(port: u16) -> Result<UdpNonBlockingSocket, SessionError> {
    UdpNonBlockingSocket::bind_to_port(port)
        .map_err(|err| SessionError::general(format!("cannot bind UDP port {}: {}", port, err)))
}

impl SessionManager {
    /// A manager without sessions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns `true` if no session is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Starts a peer-to-peer session listening on UDP `local_port`. Players are added
    /// with [`add_player`](Self::add_player) afterwards.
    ///
    /// # Errors
    /// - [`SessionError::GeneralFailure`] if the port cannot be bound or
    ///   [`SessionCallbacks::begin_game`] fails.
    /// - [`SessionError::InvalidRequest`] if the builder holds an invalid configuration.
    pub fn start_session(
        &mut self,
        builder: SessionBuilder,
        callbacks: Box<dyn SessionCallbacks>,
        local_port: u16,
    ) -> Result<SessionHandle, SessionError> {
        let logger = builder.logger.clone();
        let socket = logger.in_scope(|| bind(local_port))?;
        self.start_session_with_socket(builder, callbacks, socket)
    }

    /// Starts a peer-to-peer session on a host-supplied transport, for example one that
    /// reaches [`PeerAddress::Platform`] identities.
    ///
    /// # Errors
    /// As [`start_session`](Self::start_session), minus the bind failure.
    pub fn start_session_with_socket(
        &mut self,
        builder: SessionBuilder,
        callbacks: Box<dyn SessionCallbacks>,
        socket: impl NonBlockingSocket + 'static,
    ) -> Result<SessionHandle, SessionError> {
        let logger = builder.logger.clone();
        let session = logger.in_scope(|| builder.start_p2p_session(callbacks, socket))?;
        Ok(self.insert(Box::new(session), logger))
    }

    /// Starts an offline determinism check that rolls back `check_distance` frames on
    /// every advance.
    ///
    /// # Errors
    /// - [`SessionError::InvalidRequest`] unless `0 < check_distance < max_prediction`.
    /// - [`SessionError::GeneralFailure`] if [`SessionCallbacks::begin_game`] fails.
    pub fn start_synctest(
        &mut self,
        builder: SessionBuilder,
        callbacks: Box<dyn SessionCallbacks>,
        check_distance: usize,
    ) -> Result<SessionHandle, SessionError> {
        let logger = builder.logger.clone();
        let session =
            logger.in_scope(|| builder.start_synctest_session(callbacks, check_distance))?;
        Ok(self.insert(Box::new(session), logger))
    }

    /// Starts watching the match hosted at `host`, listening on UDP `local_port`.
    ///
    /// # Errors
    /// - [`SessionError::GeneralFailure`] if the port cannot be bound or
    ///   [`SessionCallbacks::begin_game`] fails.
    /// - [`SessionError::InvalidRequest`] if the builder holds an invalid configuration.
    pub fn start_spectating(
        &mut self,
        builder: SessionBuilder,
        callbacks: Box<dyn SessionCallbacks>,
        local_port: u16,
        host: PeerAddress,
    ) -> Result<SessionHandle, SessionError> {
        let logger = builder.logger.clone();
        let socket = logger.in_scope(|| bind(local_port))?;
        self.start_spectating_with_socket(builder, callbacks, socket, host)
    }

    /// Starts watching the match hosted at `host` over a host-supplied transport.
    ///
    /// # Errors
    /// As [`start_spectating`](Self::start_spectating), minus the bind failure.
    pub fn start_spectating_with_socket(
        &mut self,
        builder: SessionBuilder,
        callbacks: Box<dyn SessionCallbacks>,
        socket: impl NonBlockingSocket + 'static,
        host: PeerAddress,
    ) -> Result<SessionHandle, SessionError> {
        let logger = builder.logger.clone();
        let session =
            logger.in_scope(|| builder.start_spectator_session(callbacks, host, socket))?;
        Ok(self.insert(Box::new(session), logger))
    }

    /// Registers a player or spectator. See [`P2PSession::add_player`](crate::P2PSession::add_player).
    pub fn add_player(
        &mut self,
        session: SessionHandle,
        player_type: PlayerType,
        player_num: usize,
    ) -> Result<PlayerHandle, SessionError> {
        self.with_session(session, |s| s.add_player(player_type, player_num))
    }

    /// Disconnects a player or spectator immediately.
    pub fn disconnect_player(
        &mut self,
        session: SessionHandle,
        player: PlayerHandle,
    ) -> Result<(), SessionError> {
        self.with_session(session, |s| s.disconnect_player(player))
    }

    /// Sets the input delay, in frames, of a local player.
    pub fn set_frame_delay(
        &mut self,
        session: SessionHandle,
        player: PlayerHandle,
        delay: usize,
    ) -> Result<(), SessionError> {
        self.with_session(session, |s| s.set_frame_delay(player, delay))
    }

    /// Milliseconds of silence after which a peer is disconnected.
    pub fn set_disconnect_timeout(
        &mut self,
        session: SessionHandle,
        timeout_ms: u64,
    ) -> Result<(), SessionError> {
        self.with_session(session, |s| {
            s.set_disconnect_timeout(Duration::from_millis(timeout_ms))
        })
    }

    /// Milliseconds of silence after which [`Event::ConnectionInterrupted`] is raised.
    ///
    /// [`Event::ConnectionInterrupted`]: crate::Event::ConnectionInterrupted
    pub fn set_disconnect_notify_start(
        &mut self,
        session: SessionHandle,
        notify_start_ms: u64,
    ) -> Result<(), SessionError> {
        self.with_session(session, |s| {
            s.set_disconnect_notify_start(Duration::from_millis(notify_start_ms))
        })
    }

    /// Submits the input of a local player for the current frame.
    pub fn add_local_input(
        &mut self,
        session: SessionHandle,
        player: PlayerHandle,
        input: i64,
    ) -> Result<(), SessionError> {
        self.with_session(session, |s| s.add_local_input(player, input))
    }

    /// The input vector to simulate the current frame with.
    pub fn synchronize_input(&mut self, session: SessionHandle) -> Result<SyncedInputs, SessionError> {
        self.with_session(session, |s| s.synchronize_input())
    }

    /// Tells the session the current frame has been simulated.
    pub fn advance_frame(&mut self, session: SessionHandle) -> Result<(), SessionError> {
        self.with_session(session, |s| s.advance_frame())
    }

    /// Drives network and timers for up to `timeout_ms` milliseconds.
    pub fn idle(&mut self, session: SessionHandle, timeout_ms: u64) -> Result<(), SessionError> {
        self.with_session(session, |s| s.idle(Duration::from_millis(timeout_ms)))
    }

    /// Connection quality towards a remote player or spectator.
    pub fn network_stats(
        &mut self,
        session: SessionHandle,
        player: PlayerHandle,
    ) -> Result<NetworkStats, SessionError> {
        self.with_session(session, |s| s.network_stats(player))
    }

    /// Connection status of a participant.
    pub fn player_status(
        &mut self,
        session: SessionHandle,
        player: PlayerHandle,
    ) -> Result<PlayerStatus, SessionError> {
        self.with_session(session, |s| s.player_status(player))
    }

    /// The frame the host simulates next.
    pub fn current_frame(&mut self, session: SessionHandle) -> Result<Frame, SessionError> {
        self.with_session(session, |s| Ok(s.current_frame()))
    }

    /// Writes host-provided text to the session's log.
    pub fn log(&self, session: SessionHandle, text: &str) -> Result<(), SessionError> {
        let entry = self
            .sessions
            .get(session.arena_handle())
            .map_err(|_| SessionError::InvalidSession)?;
        entry.logger.log(text);
        Ok(())
    }

    /// Closes the session and releases every snapshot back to the host. The handle is
    /// invalid afterwards.
    pub fn close_session(&mut self, session: SessionHandle) -> Result<(), SessionError> {
        let mut entry = self
            .sessions
            .remove(session.arena_handle())
            .map_err(|_| SessionError::InvalidSession)?;
        let SessionEntry { session: inner, logger } = &mut entry;
        logger.in_scope(|| {
            inner.close();
            info!("closed {}", session);
        });
        Ok(())
    }

    fn insert(&mut self, session: Box<dyn Session>, logger: SessionLogger) -> SessionHandle {
        let handle = SessionHandle::from_arena(self.sessions.insert(SessionEntry { session, logger }));
        info!("started {}", handle);
        handle
    }

    fn with_session<R>(
        &mut self,
        session: SessionHandle,
        f: impl FnOnce(&mut dyn Session) -> Result<R, SessionError>,
    ) -> Result<R, SessionError> {
        let entry = self
            .sessions
            .get_mut(session.arena_handle())
            .map_err(|_| SessionError::InvalidSession)?;
        let SessionEntry { session, logger } = entry;
        logger.in_scope(|| f(session.as_mut()))
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        for mut entry in self.sessions.drain() {
            let SessionEntry { session, logger } = &mut entry;
            logger.in_scope(|| session.close());
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
    use std::io;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::callbacks::{CallbackError, SaveBuffer};
    use crate::network::messages::Message;
    use crate::{ErrorCode, Event};

    struct NullSocket;

    impl NonBlockingSocket for NullSocket {
        fn send_to(&mut self, _msg: &Message, _addr: &PeerAddress) {}

        fn receive_all_messages(&mut self) -> Vec<(PeerAddress, Message)> {
            Vec::new()
        }
    }

    #[derive(Default)]
    struct Stats {
        began: Vec<String>,
        freed: usize,
    }

    struct Game {
        state: i64,
        stats: Arc<Mutex<Stats>>,
        refuse_begin: bool,
    }

    impl Game {
        fn boxed(stats: &Arc<Mutex<Stats>>) -> Box<dyn SessionCallbacks> {
            Box::new(Self {
                state: 0,
                stats: Arc::clone(stats),
                refuse_begin: false,
            })
        }
    }

    impl SessionCallbacks for Game {
        fn begin_game(&mut self, game: &str) -> Result<(), CallbackError> {
            if self.refuse_begin {
                return Err(CallbackError::new("no"));
            }
            self.stats.lock().began.push(game.to_owned());
            Ok(())
        }

        fn advance_frame(&mut self, inputs: &SyncedInputs, _flags: u32) -> Result<(), CallbackError> {
            self.state += inputs.inputs.iter().sum::<i64>();
            Ok(())
        }

        fn save_game_state(&mut self, _frame: Frame) -> Result<(SaveBuffer, u64), CallbackError> {
            Ok((SaveBuffer::new(self.state.to_le_bytes().to_vec()), self.state as u64))
        }

        fn load_game_state(&mut self, buffer: &SaveBuffer) -> Result<(), CallbackError> {
            self.state = i64::from_le_bytes(buffer.as_bytes().try_into().unwrap());
            Ok(())
        }

        fn free_buffer(&mut self, _buffer: SaveBuffer) {
            self.stats.lock().freed += 1;
        }

        fn on_event(&mut self, _event: &Event) -> Result<(), CallbackError> {
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn logger_into(buffer: &Buffer) -> SessionLogger {
        let writer = buffer.clone();
        SessionLogger::from_subscriber(
            tracing_subscriber::fmt()
                .with_writer(move || writer.clone())
                .with_ansi(false)
                .finish(),
        )
    }

    fn host() -> PeerAddress {
        PeerAddress::Platform(42)
    }

    #[test]
    fn closed_handles_are_invalid() {
        let stats = Arc::new(Mutex::new(Stats::default()));
        let mut manager = SessionManager::new();
        let builder = SessionBuilder::new("g").with_num_players(1).unwrap();
        let session = manager.start_synctest(builder, Game::boxed(&stats), 1).unwrap();
        assert_eq!(manager.len(), 1);

        manager.close_session(session).unwrap();
        assert!(manager.is_empty());
        assert_eq!(manager.close_session(session), Err(SessionError::InvalidSession));
        assert_eq!(manager.advance_frame(session), Err(SessionError::InvalidSession));
        assert_eq!(manager.log(session, "x"), Err(SessionError::InvalidSession));
        assert_eq!(
            manager.current_frame(SessionHandle::new(7, 0)),
            Err(SessionError::InvalidSession)
        );
    }

    #[test]
    fn reused_slot_rejects_old_handle() {
        let stats = Arc::new(Mutex::new(Stats::default()));
        let mut manager = SessionManager::new();
        let builder = SessionBuilder::new("g").with_num_players(1).unwrap();
        let first = manager
            .start_synctest(builder.clone(), Game::boxed(&stats), 1)
            .unwrap();
        manager.close_session(first).unwrap();
        let second = manager.start_synctest(builder, Game::boxed(&stats), 1).unwrap();
        assert_ne!(first, second);
        assert_eq!(manager.current_frame(first), Err(SessionError::InvalidSession));
        assert_eq!(manager.current_frame(second), Ok(Frame::new(0)));
    }

    #[test]
    fn begin_game_runs_once_per_start() {
        let stats = Arc::new(Mutex::new(Stats::default()));
        let mut manager = SessionManager::new();
        let builder = SessionBuilder::new("arena-v2");
        manager
            .start_session_with_socket(builder.clone(), Game::boxed(&stats), NullSocket)
            .unwrap();
        manager
            .start_spectating_with_socket(builder, Game::boxed(&stats), NullSocket, host())
            .unwrap();
        assert_eq!(stats.lock().began, vec!["arena-v2", "arena-v2"]);
    }

    #[test]
    fn failing_begin_game_aborts_start() {
        let stats = Arc::new(Mutex::new(Stats::default()));
        let mut manager = SessionManager::new();
        let callbacks = Box::new(Game {
            state: 0,
            stats,
            refuse_begin: true,
        });
        let err = manager
            .start_synctest(SessionBuilder::new("g"), callbacks, 1)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::GeneralFailure);
        assert!(manager.is_empty());
    }

    #[test]
    fn unsupported_combinations() {
        let stats = Arc::new(Mutex::new(Stats::default()));
        let mut manager = SessionManager::new();
        let builder = SessionBuilder::new("g").with_num_players(1).unwrap();

        let synctest = manager
            .start_synctest(builder.clone(), Game::boxed(&stats), 1)
            .unwrap();
        let player = manager.add_player(synctest, PlayerType::Local, 0).unwrap();
        let code = |r: Result<(), SessionError>| ErrorCode::from_result(&r);
        assert_eq!(
            code(manager.network_stats(synctest, player).map(|_| ())),
            ErrorCode::Unsupported
        );
        assert_eq!(
            code(manager.disconnect_player(synctest, player)),
            ErrorCode::Unsupported
        );

        let spectator = manager
            .start_spectating_with_socket(builder, Game::boxed(&stats), NullSocket, host())
            .unwrap();
        assert_eq!(
            code(manager.add_local_input(spectator, player, 1)),
            ErrorCode::Unsupported
        );
        assert_eq!(
            code(manager.add_player(spectator, PlayerType::Local, 0).map(|_| ())),
            ErrorCode::Unsupported
        );
        assert!(manager.set_disconnect_timeout(spectator, 5000).is_ok());
    }

    #[test]
    fn notify_start_after_timeout_is_accepted_per_call() {
        let stats = Arc::new(Mutex::new(Stats::default()));
        let mut manager = SessionManager::new();
        let session = manager
            .start_session_with_socket(SessionBuilder::new("g"), Game::boxed(&stats), NullSocket)
            .unwrap();
        assert!(manager.set_disconnect_timeout(session, 1000).is_ok());
        assert!(manager.set_disconnect_notify_start(session, 250).is_ok());
        assert!(manager.idle(session, 0).is_ok());
    }

    #[test]
    fn logs_go_to_the_session_logger() {
        let stats = Arc::new(Mutex::new(Stats::default()));
        let buffer = Buffer::default();
        let mut manager = SessionManager::new();
        let builder = SessionBuilder::new("g")
            .with_num_players(1)
            .unwrap()
            .with_logger(logger_into(&buffer));
        let session = manager.start_synctest(builder, Game::boxed(&stats), 1).unwrap();

        manager.log(session, "hello from the host").unwrap();
        manager.close_session(session).unwrap();

        let out = String::from_utf8_lossy(&buffer.0.lock()).into_owned();
        assert!(out.contains("hello from the host"));
        assert!(out.contains("sync test closed"));
    }

    #[test]
    fn drop_closes_every_session() {
        let stats = Arc::new(Mutex::new(Stats::default()));
        {
            let mut manager = SessionManager::new();
            let builder = SessionBuilder::new("g").with_num_players(1).unwrap();
            let session = manager.start_synctest(builder, Game::boxed(&stats), 1).unwrap();
            let player = manager.add_player(session, PlayerType::Local, 0).unwrap();
            for _ in 0..3 {
                manager.add_local_input(session, player, 1).unwrap();
                manager.synchronize_input(session).unwrap();
                manager.advance_frame(session).unwrap();
            }
        }
        assert!(stats.lock().freed > 0);
    }
}
