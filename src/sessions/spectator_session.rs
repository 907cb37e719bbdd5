use std::collections::VecDeque;

use smallvec::SmallVec;
use tracing::{debug, info, trace};
use web_time::{Duration, Instant};

use crate::callbacks::SessionCallbacks;
use crate::frame_info::PlayerInput;
use crate::network::messages::ConnectionStatus;
use crate::network::protocol::{ProtocolEvent, UdpProtocol};
use crate::report_violation;
use crate::sessions::builder::SessionBuilder;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{
    Event, Frame, NetworkStats, NonBlockingSocket, PeerAddress, PlayerHandle, PlayerSet,
    PlayerStatus, Session, SessionError, SessionState, SyncedInputs, MAX_PLAYERS,
};

/// Frames advanced per tick while not catching up.
const NORMAL_SPEED: usize = 1;

type FrameInputs = SmallVec<[PlayerInput; MAX_PLAYERS]>;

/// Watches a peer-to-peer session from the outside.
///
/// The host peer forwards every confirmed frame's inputs; they are kept in a ring of
/// [`SpectatorConfig::buffer_size`](crate::SpectatorConfig::buffer_size) frames and
/// replayed in order. A spectator never predicts, never rolls back and contributes no
/// input. Events about the host are reported with the handle of player slot 0.
pub struct SpectatorSession {
    state: SessionState,
    num_players: usize,
    buffer_size: usize,
    max_frames_behind: usize,
    catchup_speed: usize,

    callbacks: Box<dyn SessionCallbacks>,
    socket: Box<dyn NonBlockingSocket>,
    host: UdpProtocol,
    host_connect_status: Vec<ConnectionStatus>,

    inputs: Vec<FrameInputs>,
    /// The frame the host simulates next.
    current_frame: Frame,
    last_recv_frame: Frame,

    event_queue: VecDeque<Event>,
    event_queue_size: usize,
    closed: bool,
}

impl std::fmt::Debug for SpectatorSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectatorSession")
            .field("state", &self.state)
            .field("host", &self.host.peer_addr())
            .field("current_frame", &self.current_frame)
            .field("last_recv_frame", &self.last_recv_frame)
            .finish_non_exhaustive()
    }
}

impl SpectatorSession {
    pub(crate) fn new(
        builder: SessionBuilder,
        mut callbacks: Box<dyn SessionCallbacks>,
        host: PeerAddress,
        socket: Box<dyn NonBlockingSocket>,
    ) -> Result<Self, SessionError> {
        callbacks.begin_game(&builder.game)?;
        info!("spectating {} hosted at {}", builder.game, host);

        let num_players = builder.num_players;
        let handles = (0..num_players)
            .map(|index| PlayerHandle::new(index as u32, 0))
            .collect();
        let mut endpoint = UdpProtocol::new(handles, host, builder.endpoint_settings());
        endpoint.synchronize()?;

        let spectator_config = builder.spectator_config;
        let buffer_size = spectator_config.buffer_size.max(1);
        let blank: FrameInputs = SmallVec::from_elem(PlayerInput::default(), num_players);

        Ok(Self {
            state: SessionState::Synchronizing,
            num_players,
            buffer_size,
            max_frames_behind: spectator_config.max_frames_behind,
            catchup_speed: spectator_config.catchup_speed,
            callbacks,
            socket,
            host: endpoint,
            host_connect_status: vec![ConnectionStatus::default(); num_players],
            inputs: vec![blank; buffer_size],
            current_frame: Frame::new(0),
            last_recv_frame: Frame::NULL,
            event_queue: VecDeque::new(),
            event_queue_size: builder.event_queue_size,
            closed: false,
        })
    }

    /// Whether the handshake with the host completed.
    #[must_use]
    pub fn current_state(&self) -> SessionState {
        self.state
    }

    /// The frame the host simulates next.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.current_frame
    }

    /// Number of players of the watched session.
    #[must_use]
    pub fn num_players(&self) -> usize {
        self.num_players
    }

    /// Address of the peer being watched.
    #[must_use]
    pub fn host_addr(&self) -> PeerAddress {
        self.host.peer_addr()
    }

    /// Frames received from the host but not simulated yet.
    #[must_use]
    pub fn frames_behind_host(&self) -> usize {
        let behind = self.last_recv_frame + 1 - self.current_frame;
        usize::try_from(behind).unwrap_or(0)
    }

    /// How many frames the host should simulate this tick: more than one while the
    /// spectator lags more than `max_frames_behind` frames behind.
    #[must_use]
    pub fn frames_to_advance(&self) -> usize {
        if self.frames_behind_host() > self.max_frames_behind {
            self.catchup_speed.max(NORMAL_SPEED)
        } else {
            NORMAL_SPEED
        }
    }

    /// The host's inputs for the current frame.
    ///
    /// # Errors
    /// - [`SessionError::NotSynchronized`] before the handshake with the host completed.
    /// - [`SessionError::PredictionThreshold`] if the frame has not arrived yet.
    /// - [`SessionError::InvalidRequest`] if the frame was already overwritten because the
    ///   spectator fell more than the buffer size behind.
    pub fn synchronize_input(&mut self) -> Result<SyncedInputs, SessionError> {
        self.poll_network();
        if self.state != SessionState::Running {
            return Err(SessionError::NotSynchronized);
        }
        self.inputs_at_frame(self.current_frame)
    }

    /// Moves to the next frame once the current one has been simulated.
    ///
    /// # Errors
    /// - [`SessionError::NotSynchronized`] before the handshake with the host completed.
    /// - The errors of [`synchronize_input`](Self::synchronize_input) if the current
    ///   frame's inputs are not available.
    pub fn advance_frame(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Running {
            return Err(SessionError::NotSynchronized);
        }
        self.inputs_at_frame(self.current_frame)?;
        self.current_frame += 1;
        trace!("spectator advanced to frame {}", self.current_frame);

        self.poll_network();
        self.flush_events()
    }

    /// Drives the network and delivers events.
    ///
    /// # Errors
    /// Returns [`SessionError::GeneralFailure`] if the host rejects an event.
    pub fn idle(&mut self, timeout: Duration) -> Result<(), SessionError> {
        let start = Instant::now();
        self.poll_network();
        let result = self.flush_events();
        if start.elapsed() > timeout {
            debug!("idle took {:?}, budget was {:?}", start.elapsed(), timeout);
        }
        result
    }

    /// Silence after which the host is considered gone.
    pub fn set_disconnect_timeout(&mut self, timeout: Duration) {
        self.host.set_disconnect_timeout(timeout);
    }

    /// Silence after which [`Event::ConnectionInterrupted`] is raised.
    pub fn set_disconnect_notify_start(&mut self, notify_start: Duration) {
        self.host.set_disconnect_notify_start(notify_start);
    }

    /// Connection quality towards the host. Any player handle of the watched session
    /// names the host connection.
    ///
    /// # Errors
    /// - [`SessionError::PlayerOutOfRange`] / [`SessionError::InvalidPlayerHandle`] for
    ///   handles that name no player.
    /// - [`SessionError::NotSynchronized`] until traffic has been measured.
    pub fn network_stats(&self, player: PlayerHandle) -> Result<NetworkStats, SessionError> {
        self.check_handle(player)?;
        let mut stats = self.host.network_stats()?;
        stats.recv_queue_len = self.frames_behind_host();
        Ok(stats)
    }

    /// Status of a player of the watched session, as reported by the host.
    ///
    /// # Errors
    /// [`SessionError::PlayerOutOfRange`] / [`SessionError::InvalidPlayerHandle`] for
    /// handles that name no player.
    pub fn player_status(&self, player: PlayerHandle) -> Result<PlayerStatus, SessionError> {
        self.check_handle(player)?;
        let reported = self
            .host_connect_status
            .get(player.index())
            .copied()
            .unwrap_or_default();
        if reported.disconnected {
            return Ok(PlayerStatus::Disconnected);
        }
        Ok(self.host.player_status())
    }

    /// Disconnects from the host.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.host.disconnect();
        self.host.send_all_messages(self.socket.as_mut());
        info!("stopped spectating at frame {}", self.current_frame);
    }

    fn check_handle(&self, player: PlayerHandle) -> Result<(), SessionError> {
        if player.index() >= self.num_players {
            return Err(SessionError::PlayerOutOfRange {
                index: player.index(),
                limit: self.num_players,
            });
        }
        if player.generation() != 0 {
            return Err(SessionError::InvalidPlayerHandle { handle: player });
        }
        Ok(())
    }

    fn host_handle() -> PlayerHandle {
        PlayerHandle::new(0, 0)
    }

    fn inputs_at_frame(&self, frame: Frame) -> Result<SyncedInputs, SessionError> {
        let slot = self
            .inputs
            .get(frame.as_i32() as usize % self.buffer_size)
            .ok_or_else(|| SessionError::general(format!("no ring slot for frame {}", frame)))?;
        let stored = slot.first().map_or(Frame::NULL, |input| input.frame);

        if stored < frame {
            return Err(SessionError::PredictionThreshold);
        }
        if stored > frame {
            return Err(SessionError::invalid_request(format!(
                "inputs of frame {} were overwritten by frame {}; the spectator is too far behind",
                frame, stored
            )));
        }

        let mut disconnected = PlayerSet::new();
        for (index, status) in self.host_connect_status.iter().enumerate() {
            if status.disconnected && status.last_frame < frame {
                disconnected.insert(index);
            }
        }
        let inputs = slot
            .iter()
            .enumerate()
            .map(|(index, input)| {
                if disconnected.contains(index) {
                    0
                } else {
                    input.input
                }
            })
            .collect();

        Ok(SyncedInputs {
            frame,
            inputs,
            predicted: PlayerSet::new(),
            disconnected,
        })
    }

    fn poll_network(&mut self) {
        for (from, msg) in self.socket.receive_all_messages() {
            if self.host.is_handling_message(&from) {
                self.host.handle_message(&msg);
            } else {
                trace!("dropping {} from {}, not the host", msg.kind(), from);
            }
        }

        let events: Vec<ProtocolEvent> = self.host.poll(&self.host_connect_status).collect();
        for event in events {
            self.handle_event(event);
        }

        self.host.send_all_messages(self.socket.as_mut());
    }

    fn handle_event(&mut self, event: ProtocolEvent) {
        let player = Self::host_handle();
        match event {
            ProtocolEvent::Connected => self.push_event(Event::ConnectedToPeer { player }),
            ProtocolEvent::Synchronizing { total, count } => {
                self.push_event(Event::SynchronizingWithPeer {
                    player,
                    count,
                    total,
                });
            },
            ProtocolEvent::Synchronized => {
                self.push_event(Event::SynchronizedWithPeer { player });
                if self.state == SessionState::Synchronizing {
                    self.state = SessionState::Running;
                    self.push_event(Event::Running);
                }
            },
            ProtocolEvent::NetworkInterrupted { disconnect_timeout } => {
                self.push_event(Event::ConnectionInterrupted {
                    player,
                    disconnect_timeout,
                });
            },
            ProtocolEvent::NetworkResumed => self.push_event(Event::ConnectionResumed { player }),
            ProtocolEvent::Disconnected => {
                self.push_event(Event::DisconnectedFromPeer { player });
            },
            ProtocolEvent::Input { input, player } => self.store_input(input, player),
        }
    }

    fn store_input(&mut self, input: PlayerInput, player: PlayerHandle) {
        if !input.frame.is_valid() {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::FrameSync,
                "host sent input for invalid frame {}",
                input.frame
            );
            return;
        }
        let index = input.frame.as_i32() as usize % self.buffer_size;
        let Some(stored) = self
            .inputs
            .get_mut(index)
            .and_then(|slot| slot.get_mut(player.index()))
        else {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "host sent input for {} beyond {} players",
                player,
                self.num_players
            );
            return;
        };
        *stored = input;

        if input.frame > self.last_recv_frame {
            self.last_recv_frame = input.frame;
        }
        self.host.update_local_frame_advantage(self.current_frame);
        for (index, status) in self.host_connect_status.iter_mut().enumerate() {
            *status = self.host.peer_connect_status(index);
        }
    }

    fn push_event(&mut self, event: Event) {
        self.event_queue.push_back(event);
        while self.event_queue.len() > self.event_queue_size {
            self.event_queue.pop_front();
        }
    }

    fn flush_events(&mut self) -> Result<(), SessionError> {
        let mut result = Ok(());
        while let Some(event) = self.event_queue.pop_front() {
            if let Err(err) = self.callbacks.on_event(&event) {
                if result.is_ok() {
                    result = Err(err.into());
                }
            }
        }
        result
    }
}

impl Session for SpectatorSession {
    fn synchronize_input(&mut self) -> Result<SyncedInputs, SessionError> {
        Self::synchronize_input(self)
    }

    fn advance_frame(&mut self) -> Result<(), SessionError> {
        Self::advance_frame(self)
    }

    fn idle(&mut self, timeout: Duration) -> Result<(), SessionError> {
        Self::idle(self, timeout)
    }

    fn set_disconnect_timeout(&mut self, timeout: Duration) -> Result<(), SessionError> {
        Self::set_disconnect_timeout(self, timeout);
        Ok(())
    }

    fn set_disconnect_notify_start(&mut self, notify_start: Duration) -> Result<(), SessionError> {
        Self::set_disconnect_notify_start(self, notify_start);
        Ok(())
    }

    fn network_stats(&self, player: PlayerHandle) -> Result<NetworkStats, SessionError> {
        Self::network_stats(self, player)
    }

    fn player_status(&self, player: PlayerHandle) -> Result<PlayerStatus, SessionError> {
        Self::player_status(self, player)
    }

    fn current_frame(&self) -> Frame {
        Self::current_frame(self)
    }

    fn close(&mut self) {
        Self::close(self);
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
    use std::net::SocketAddr;

    use super::*;
    use crate::callbacks::{CallbackError, SaveBuffer};
    use crate::network::messages::Message;
    use crate::SpectatorConfig;

    struct NullSocket;

    impl NonBlockingSocket for NullSocket {
        fn send_to(&mut self, _msg: &Message, _addr: &PeerAddress) {}

        fn receive_all_messages(&mut self) -> Vec<(PeerAddress, Message)> {
            Vec::new()
        }
    }

    struct Quiet;

    impl SessionCallbacks for Quiet {
        fn begin_game(&mut self, _game: &str) -> Result<(), CallbackError> {
            Ok(())
        }

        fn advance_frame(&mut self, _inputs: &SyncedInputs, _flags: u32) -> Result<(), CallbackError> {
            Err(CallbackError::new("spectators never replay"))
        }

        fn save_game_state(&mut self, _frame: Frame) -> Result<(SaveBuffer, u64), CallbackError> {
            Err(CallbackError::new("spectators never save"))
        }

        fn load_game_state(&mut self, _buffer: &SaveBuffer) -> Result<(), CallbackError> {
            Err(CallbackError::new("spectators never load"))
        }

        fn on_event(&mut self, _event: &Event) -> Result<(), CallbackError> {
            Ok(())
        }
    }

    fn spectator(buffer_size: usize) -> SpectatorSession {
        let host = PeerAddress::Ip(SocketAddr::from(([127, 0, 0, 1], 7000)));
        SessionBuilder::new("watch")
            .with_num_players(2)
            .unwrap()
            .with_spectator_config(SpectatorConfig {
                buffer_size,
                catchup_speed: 3,
                max_frames_behind: 4.min(buffer_size - 1),
            })
            .start_spectator_session(Box::new(Quiet), host, NullSocket)
            .unwrap()
    }

    /// Stores a frame as if it had arrived from the host.
    fn deliver(s: &mut SpectatorSession, frame: i32, values: [i64; 2]) {
        for (index, value) in values.into_iter().enumerate() {
            s.store_input(
                PlayerInput::new(Frame::new(frame), value),
                PlayerHandle::new(index as u32, 0),
            );
        }
    }

    #[test]
    fn waits_for_the_handshake() {
        let mut s = spectator(60);
        assert_eq!(s.current_state(), SessionState::Synchronizing);
        assert_eq!(s.synchronize_input(), Err(SessionError::NotSynchronized));
        assert_eq!(s.advance_frame(), Err(SessionError::NotSynchronized));
    }

    #[test]
    fn replays_frames_in_order() {
        let mut s = spectator(60);
        s.state = SessionState::Running;
        deliver(&mut s, 0, [1, 2]);
        deliver(&mut s, 1, [3, 4]);

        let inputs = s.synchronize_input().unwrap();
        assert_eq!(inputs.frame, Frame::new(0));
        assert_eq!(inputs.inputs.as_slice(), &[1, 2]);
        assert!(inputs.predicted.is_empty());
        s.advance_frame().unwrap();
        assert_eq!(s.synchronize_input().unwrap().inputs.as_slice(), &[3, 4]);
        s.advance_frame().unwrap();

        assert_eq!(s.synchronize_input(), Err(SessionError::PredictionThreshold));
        assert_eq!(s.advance_frame(), Err(SessionError::PredictionThreshold));
        assert_eq!(s.current_frame(), Frame::new(2));
    }

    #[test]
    fn overwritten_frames_are_reported() {
        let mut s = spectator(4);
        s.state = SessionState::Running;
        for frame in 0..6 {
            deliver(&mut s, frame, [frame as i64, 0]);
        }
        let err = s.synchronize_input().unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::InvalidRequest);
    }

    #[test]
    fn catches_up_when_far_behind() {
        let mut s = spectator(60);
        s.state = SessionState::Running;
        assert_eq!(s.frames_to_advance(), 1);
        for frame in 0..10 {
            deliver(&mut s, frame, [1, 1]);
        }
        assert_eq!(s.frames_behind_host(), 10);
        assert_eq!(s.frames_to_advance(), 3);
        for _ in 0..6 {
            s.synchronize_input().unwrap();
            s.advance_frame().unwrap();
        }
        assert_eq!(s.frames_behind_host(), 4);
        assert_eq!(s.frames_to_advance(), 1);
    }

    #[test]
    fn player_input_is_unsupported() {
        let mut s = spectator(60);
        let session: &mut dyn Session = &mut s;
        let player = PlayerHandle::new(0, 0);
        assert!(matches!(
            session.add_local_input(player, 1),
            Err(SessionError::Unsupported { .. })
        ));
        assert!(matches!(
            session.add_player(crate::PlayerType::Local, 0),
            Err(SessionError::Unsupported { .. })
        ));
        assert_eq!(session.player_status(player), Ok(PlayerStatus::Connecting));
        assert!(matches!(
            session.player_status(PlayerHandle::new(5, 0)),
            Err(SessionError::PlayerOutOfRange { .. })
        ));
        assert_eq!(session.network_stats(player), Err(SessionError::NotSynchronized));
    }
}
