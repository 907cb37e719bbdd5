use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, info, trace};
use web_time::{Duration, Instant};

use crate::callbacks::SessionCallbacks;
use crate::network::messages::ConnectionStatus;
use crate::network::protocol::{EndpointSettings, ProtocolEvent, ProtocolState, UdpProtocol};
use crate::debug_check_invariants;
use crate::report_violation;
use crate::rollback::RollbackController;
use crate::sessions::builder::SessionBuilder;
use crate::sessions::player_table::{HandleVec, PlayerTable};
use crate::sync_layer::SyncLayer;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::time_sync::{MIN_RECOMMENDATION, RECOMMENDATION_INTERVAL};
use crate::{
    DesyncDetection, Event, Frame, NetworkStats, NonBlockingSocket, PeerAddress, PlayerHandle,
    PlayerStatus, PlayerType, Session, SessionError, SessionState, SyncedInputs,
};

/// The earlier of two frames, where [`Frame::NULL`] means "none".
fn earliest(a: Frame, b: Frame) -> Frame {
    match (a.is_null(), b.is_null()) {
        (true, _) => b,
        (_, true) => a,
        _ => std::cmp::min(a, b),
    }
}

/// A session between peers that each run the simulation locally.
///
/// Local input is sent to every remote peer as soon as it is submitted. Remote input
/// that has not arrived yet is predicted; when it arrives and differs, the session
/// loads an earlier snapshot and replays the affected frames through
/// [`SessionCallbacks::advance_frame`]. Confirmed inputs are forwarded to spectators.
pub struct P2PSession {
    num_players: usize,
    max_prediction: usize,
    input_delay: usize,
    settings: EndpointSettings,
    state: SessionState,

    callbacks: Box<dyn SessionCallbacks>,
    socket: Box<dyn NonBlockingSocket>,
    sync_layer: SyncLayer,
    rollback: RollbackController,

    players: PlayerTable,
    remotes: BTreeMap<PeerAddress, UdpProtocol>,
    spectators: BTreeMap<PeerAddress, UdpProtocol>,
    local_connect_status: Vec<ConnectionStatus>,

    /// Next frame of local input to send to the remote peers.
    next_send_frame: Frame,
    /// Next frame of confirmed input to forward to spectators.
    next_spectator_frame: Frame,
    /// A player disconnected before this frame; the frames after it need a replay.
    disconnect_frame: Frame,
    next_recommended_sleep: Frame,
    frames_ahead: i32,

    local_checksum_history: BTreeMap<Frame, u64>,
    last_sent_checksum_frame: Frame,

    event_queue: VecDeque<Event>,
    event_queue_size: usize,
    closed: bool,
}

impl std::fmt::Debug for P2PSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("P2PSession")
            .field("num_players", &self.num_players)
            .field("state", &self.state)
            .field("current_frame", &self.sync_layer.current_frame())
            .field("confirmed_frame", &self.sync_layer.last_confirmed_frame())
            .field("remotes", &self.remotes.len())
            .field("spectators", &self.spectators.len())
            .finish_non_exhaustive()
    }
}

impl P2PSession {
    pub(crate) fn new(
        builder: SessionBuilder,
        mut callbacks: Box<dyn SessionCallbacks>,
        socket: Box<dyn NonBlockingSocket>,
    ) -> Result<Self, SessionError> {
        callbacks.begin_game(&builder.game)?;
        info!(
            "starting {} player session for {}",
            builder.num_players, builder.game
        );

        Ok(Self {
            num_players: builder.num_players,
            max_prediction: builder.max_prediction,
            input_delay: builder.input_delay,
            settings: builder.endpoint_settings(),
            state: SessionState::Synchronizing,
            callbacks,
            socket,
            sync_layer: SyncLayer::new(
                builder.num_players,
                builder.max_prediction,
                builder.prediction,
            ),
            rollback: RollbackController::default(),
            players: PlayerTable::new(builder.num_players),
            remotes: BTreeMap::new(),
            spectators: BTreeMap::new(),
            local_connect_status: vec![ConnectionStatus::default(); builder.num_players],
            next_send_frame: Frame::new(0),
            next_spectator_frame: Frame::new(0),
            disconnect_frame: Frame::NULL,
            next_recommended_sleep: Frame::new(0),
            frames_ahead: 0,
            local_checksum_history: BTreeMap::new(),
            last_sent_checksum_frame: Frame::NULL,
            event_queue: VecDeque::new(),
            event_queue_size: builder.event_queue_size,
            closed: false,
        })
    }

    /// Registers a participant. Players must all be added before the session runs;
    /// spectators get the next free slot after the players.
    ///
    /// # Errors
    /// - [`SessionError::PlayerOutOfRange`] if `player_num` is not a player slot.
    /// - [`SessionError::TooManySpectators`] if every spectator slot is taken.
    /// - [`SessionError::InvalidRequest`] if the slot is taken or the session already runs.
    pub fn add_player(
        &mut self,
        player_type: PlayerType,
        player_num: usize,
    ) -> Result<PlayerHandle, SessionError> {
        if self.state == SessionState::Running {
            return Err(SessionError::invalid_request(
                "participants cannot join a running session",
            ));
        }
        if let PlayerType::Spectator(addr) = player_type {
            if self.spectators.contains_key(&addr) {
                return Err(SessionError::invalid_request(format!(
                    "a spectator at {} is already registered",
                    addr
                )));
            }
        }
        let handle = self.players.add(player_type, player_num)?;

        match player_type {
            PlayerType::Local => {
                self.sync_layer
                    .set_frame_delay(handle.index(), self.input_delay)?;
            },
            PlayerType::Remote(addr) => {
                if let Some(endpoint) = self.remotes.get_mut(&addr) {
                    endpoint.add_handle(handle);
                } else {
                    let mut endpoint = UdpProtocol::new(vec![handle], addr, self.settings);
                    endpoint.synchronize()?;
                    self.remotes.insert(addr, endpoint);
                }
            },
            PlayerType::Spectator(addr) => {
                // the spectator receives the input of every player
                let handles = (0..self.num_players)
                    .map(|index| PlayerHandle::new(index as u32, 0))
                    .collect();
                let mut endpoint = UdpProtocol::new(handles, addr, self.settings);
                endpoint.synchronize()?;
                self.spectators.insert(addr, endpoint);
            },
        }
        debug!("added {:?} as {}", player_type, handle);

        self.check_initial_sync();
        Ok(handle)
    }

    /// Submits the input of a local player for the current frame and sends it to the
    /// remote peers.
    ///
    /// # Errors
    /// - [`SessionError::InRollback`] while replaying.
    /// - [`SessionError::NotSynchronized`] before every peer is synchronized.
    /// - [`SessionError::InvalidPlayerHandle`] unless `player` is a local player.
    /// - [`SessionError::PlayerOutOfRange`] if `player` is past the player slots.
    /// - [`SessionError::PlayerDisconnected`] if the player was disconnected.
    /// - [`SessionError::PredictionThreshold`] if remote input is too far behind.
    /// - [`SessionError::InputDropped`] if the queue rejected the input.
    pub fn add_local_input(&mut self, player: PlayerHandle, input: i64) -> Result<(), SessionError> {
        if self.rollback.in_rollback() {
            return Err(SessionError::InRollback);
        }
        if self.state != SessionState::Running {
            return Err(SessionError::NotSynchronized);
        }
        let player_type = self.players.player(player)?;
        if self.connect_status(player.index())?.disconnected {
            return Err(SessionError::PlayerDisconnected { handle: player });
        }
        if player_type != PlayerType::Local {
            return Err(SessionError::InvalidPlayerHandle { handle: player });
        }

        self.ensure_initial_snapshot()?;
        self.check_prediction_threshold()?;

        let frame = self.sync_layer.current_frame();
        let actual_frame = self.sync_layer.add_local_input(player.index(), input);
        if actual_frame.is_null() {
            return Err(SessionError::InputDropped {
                handle: player,
                frame,
            });
        }
        trace!("{} input {} for frame {} lands at {}", player, input, frame, actual_frame);
        if let Some(status) = self.local_connect_status.get_mut(player.index()) {
            status.last_frame = actual_frame;
        }

        self.send_local_inputs();
        Ok(())
    }

    /// Inputs of every player for the current frame, predicted where remote input is
    /// missing.
    ///
    /// # Errors
    /// - [`SessionError::InRollback`] while replaying.
    /// - [`SessionError::NotSynchronized`] before every peer is synchronized.
    pub fn synchronize_input(&mut self) -> Result<SyncedInputs, SessionError> {
        if self.rollback.in_rollback() {
            return Err(SessionError::InRollback);
        }
        if self.state != SessionState::Running {
            return Err(SessionError::NotSynchronized);
        }
        self.ensure_initial_snapshot()?;
        self.sync_layer
            .synchronized_inputs(&self.local_connect_status)
            .ok_or_else(|| {
                SessionError::general(format!(
                    "no inputs for frame {}",
                    self.sync_layer.current_frame()
                ))
            })
    }

    /// Marks the current frame as simulated. Saves the new state, corrects earlier
    /// frames if confirmed input contradicts a prediction, and delivers events.
    ///
    /// If a callback fails the session goes back to the frame it was at: the snapshot
    /// saved by this call is freed, the host state is reloaded to the start of that frame
    /// and a failed correction stays pending. The frame's input stays queued; synchronize,
    /// simulate and advance again.
    ///
    /// # Errors
    /// - [`SessionError::InRollback`] while replaying.
    /// - [`SessionError::NotSynchronized`] before every peer is synchronized.
    /// - [`SessionError::PredictionThreshold`] if remote input is too far behind.
    /// - [`SessionError::GeneralFailure`] if a host callback fails.
    pub fn advance_frame(&mut self) -> Result<(), SessionError> {
        if self.rollback.in_rollback() {
            return Err(SessionError::InRollback);
        }
        if self.state != SessionState::Running {
            return Err(SessionError::NotSynchronized);
        }

        self.poll_network();
        self.ensure_initial_snapshot()?;
        self.check_prediction_threshold()?;

        let frame = self.sync_layer.current_frame();
        self.sync_layer.increment_frame();
        let advanced = match self.sync_layer.save_current_state(self.callbacks.as_mut()) {
            Ok(_) => {
                trace!("advanced to frame {}", self.sync_layer.current_frame());
                self.settle()
            },
            Err(err) => Err(err),
        };
        if let Err(err) = advanced {
            self.rewind(frame);
            if let Err(event_err) = self.flush_events() {
                debug!("event delivery after a failed advance also failed: {}", event_err);
            }
            return Err(err);
        }
        debug_check_invariants!(self.sync_layer, "P2PSession::advance_frame");

        self.flush_events()
    }

    /// Drives the network and timers. Handshakes and timeouts only make progress while
    /// this is called.
    ///
    /// # Errors
    /// Returns [`SessionError::GeneralFailure`] if a correction or event delivery fails.
    pub fn idle(&mut self, timeout: Duration) -> Result<(), SessionError> {
        let start = Instant::now();
        self.poll_network();
        let mut settled = Ok(());
        if self.state == SessionState::Running && !self.rollback.in_rollback() {
            let frame = self.sync_layer.current_frame();
            settled = self.settle();
            if settled.is_err() {
                self.rewind(frame);
            } else {
                debug_check_invariants!(self.sync_layer, "P2PSession::idle");
            }
        }
        let flushed = self.flush_events();
        if start.elapsed() > timeout {
            debug!("idle took {:?}, budget was {:?}", start.elapsed(), timeout);
        }
        settled.and(flushed)
    }

    /// Disconnects a player or spectator right away. A local player's input becomes
    /// blank; a remote player's input becomes blank after the last frame received from it.
    ///
    /// # Errors
    /// - [`SessionError::InRollback`] while replaying.
    /// - [`SessionError::PlayerDisconnected`] if it already is.
    /// - [`SessionError::InvalidPlayerHandle`] / [`SessionError::PlayerOutOfRange`] for
    ///   unknown handles.
    pub fn disconnect_player(&mut self, player: PlayerHandle) -> Result<(), SessionError> {
        if self.rollback.in_rollback() {
            return Err(SessionError::InRollback);
        }
        match self.players.get(player)? {
            PlayerType::Local | PlayerType::Remote(_) => {
                let status = self.connect_status(player.index())?;
                if status.disconnected {
                    return Err(SessionError::PlayerDisconnected { handle: player });
                }
                self.disconnect_player_at_frame(player, status.last_frame);
            },
            PlayerType::Spectator(addr) => {
                let endpoint = self.spectators.get_mut(&addr).ok_or_else(|| {
                    SessionError::general(format!("no endpoint for spectator at {}", addr))
                })?;
                if matches!(
                    endpoint.state(),
                    ProtocolState::Disconnected | ProtocolState::Shutdown
                ) {
                    return Err(SessionError::PlayerDisconnected { handle: player });
                }
                endpoint.disconnect();
            },
        }
        info!("disconnected {}", player);
        Ok(())
    }

    /// Changes the input delay of a local player.
    ///
    /// # Errors
    /// - [`SessionError::InvalidPlayerHandle`] unless `player` is a local player.
    /// - [`SessionError::InvalidRequest`] if the delay does not fit the input ring.
    pub fn set_frame_delay(&mut self, player: PlayerHandle, delay: usize) -> Result<(), SessionError> {
        if self.players.get(player)? != PlayerType::Local {
            return Err(SessionError::InvalidPlayerHandle { handle: player });
        }
        self.sync_layer.set_frame_delay(player.index(), delay)
    }

    /// Silence after which peers are disconnected.
    pub fn set_disconnect_timeout(&mut self, timeout: Duration) {
        self.settings.disconnect_timeout = timeout;
        for endpoint in self.remotes.values_mut().chain(self.spectators.values_mut()) {
            endpoint.set_disconnect_timeout(timeout);
        }
    }

    /// Silence after which [`Event::ConnectionInterrupted`] is raised.
    pub fn set_disconnect_notify_start(&mut self, notify_start: Duration) {
        self.settings.disconnect_notify_start = notify_start;
        for endpoint in self.remotes.values_mut().chain(self.spectators.values_mut()) {
            endpoint.set_disconnect_notify_start(notify_start);
        }
    }

    /// Connection quality towards a remote player or spectator.
    ///
    /// # Errors
    /// - [`SessionError::InvalidPlayerHandle`] for local players and unknown handles.
    /// - [`SessionError::NotSynchronized`] until traffic has been measured.
    pub fn network_stats(&self, player: PlayerHandle) -> Result<NetworkStats, SessionError> {
        match self.players.get(player)? {
            PlayerType::Local => Err(SessionError::InvalidPlayerHandle { handle: player }),
            PlayerType::Remote(addr) => {
                let mut stats = self.endpoint(&self.remotes, addr)?.network_stats()?;
                let status = self.connect_status(player.index())?;
                let buffered = status.last_frame - self.sync_layer.current_frame() + 1;
                stats.recv_queue_len = usize::try_from(buffered).unwrap_or(0);
                Ok(stats)
            },
            PlayerType::Spectator(addr) => self.endpoint(&self.spectators, addr)?.network_stats(),
        }
    }

    /// Connection status of a participant.
    ///
    /// # Errors
    /// [`SessionError::InvalidPlayerHandle`] / [`SessionError::PlayerOutOfRange`] for
    /// unknown handles.
    pub fn player_status(&self, player: PlayerHandle) -> Result<PlayerStatus, SessionError> {
        match self.players.get(player)? {
            PlayerType::Local => Ok(if self.connect_status(player.index())?.disconnected {
                PlayerStatus::Disconnected
            } else {
                PlayerStatus::Running
            }),
            PlayerType::Remote(addr) => {
                if self.connect_status(player.index())?.disconnected {
                    return Ok(PlayerStatus::Disconnected);
                }
                Ok(self.endpoint(&self.remotes, addr)?.player_status())
            },
            PlayerType::Spectator(addr) => Ok(self.endpoint(&self.spectators, addr)?.player_status()),
        }
    }

    /// The frame the host simulates next.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.sync_layer.current_frame()
    }

    /// Newest frame whose input is confirmed for every player.
    #[must_use]
    pub fn confirmed_frame(&self) -> Frame {
        self.sync_layer.last_confirmed_frame()
    }

    /// Whether the session accepts input yet.
    #[must_use]
    pub fn current_state(&self) -> SessionState {
        self.state
    }

    /// Number of player slots.
    #[must_use]
    pub fn num_players(&self) -> usize {
        self.num_players
    }

    /// Number of spectators registered.
    #[must_use]
    pub fn num_spectators(&self) -> usize {
        self.spectators.len()
    }

    /// Handles of the players on this device.
    #[must_use]
    pub fn local_player_handles(&self) -> Vec<PlayerHandle> {
        self.players.local_handles().into_vec()
    }

    /// Handles of the players on other devices.
    #[must_use]
    pub fn remote_player_handles(&self) -> Vec<PlayerHandle> {
        self.players.remote_handles().into_vec()
    }

    /// Frames this peer is ahead of the slowest remote peer, averaged.
    #[must_use]
    pub fn frames_ahead(&self) -> i32 {
        self.frames_ahead
    }

    /// Number of corrections performed so far.
    #[must_use]
    pub fn rollbacks(&self) -> u64 {
        self.rollback.rollbacks()
    }

    /// Frames re-simulated by corrections so far.
    #[must_use]
    pub fn frames_replayed(&self) -> u64 {
        self.rollback.frames_replayed()
    }

    /// The desync detection mode the session was built with.
    #[must_use]
    pub fn desync_detection(&self) -> DesyncDetection {
        self.settings.desync_detection
    }

    /// Disconnects every endpoint and hands all snapshots back to the host.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for endpoint in self.remotes.values_mut().chain(self.spectators.values_mut()) {
            endpoint.disconnect();
        }
        self.sync_layer.release_all(self.callbacks.as_mut());
        info!("session closed at frame {}", self.sync_layer.current_frame());
    }

    /*
     *  INTERNALS
     */

    fn connect_status(&self, index: usize) -> Result<ConnectionStatus, SessionError> {
        self.local_connect_status
            .get(index)
            .copied()
            .ok_or(SessionError::PlayerOutOfRange {
                index,
                limit: self.num_players,
            })
    }

    fn endpoint<'a>(
        &self,
        endpoints: &'a BTreeMap<PeerAddress, UdpProtocol>,
        addr: PeerAddress,
    ) -> Result<&'a UdpProtocol, SessionError> {
        endpoints
            .get(&addr)
            .ok_or_else(|| SessionError::general(format!("no endpoint for {}", addr)))
    }

    /// Frame 0 is saved once, before the first frame is simulated.
    fn ensure_initial_snapshot(&mut self) -> Result<(), SessionError> {
        if self.sync_layer.last_saved_frame().is_null() {
            trace!("saving initial state");
            self.sync_layer.save_current_state(self.callbacks.as_mut())?;
        }
        Ok(())
    }

    fn check_prediction_threshold(&self) -> Result<(), SessionError> {
        let frames_ahead = self.sync_layer.current_frame() - self.sync_layer.last_confirmed_frame();
        if frames_ahead > self.max_prediction as i32 {
            debug!(
                "prediction threshold reached at frame {} (confirmed {})",
                self.sync_layer.current_frame(),
                self.sync_layer.last_confirmed_frame()
            );
            return Err(SessionError::PredictionThreshold);
        }
        Ok(())
    }

    /// Sends every frame for which all local players have input.
    fn send_local_inputs(&mut self) {
        let locals = self.players.local_handles();
        if locals.is_empty() {
            return;
        }
        loop {
            let frame = self.next_send_frame;
            let inputs: Option<Vec<i64>> = locals
                .iter()
                .map(|handle| self.sync_layer.confirmed_input(handle.index(), frame))
                .collect();
            let Some(inputs) = inputs else {
                break;
            };
            for endpoint in self.remotes.values_mut() {
                endpoint.send_input(frame, &inputs, &self.local_connect_status);
                endpoint.send_all_messages(self.socket.as_mut());
            }
            self.next_send_frame += 1;
        }
    }

    /// Receives and dispatches packets, runs endpoint timers and sends what they queued.
    fn poll_network(&mut self) {
        for (from, msg) in self.socket.receive_all_messages() {
            if let Some(endpoint) = self.remotes.get_mut(&from) {
                endpoint.handle_message(&msg);
            } else if let Some(endpoint) = self.spectators.get_mut(&from) {
                endpoint.handle_message(&msg);
            } else {
                trace!("dropping {} from unknown address {}", msg.kind(), from);
            }
        }

        let current_frame = self.sync_layer.current_frame();
        for endpoint in self.remotes.values_mut() {
            if endpoint.is_running() {
                endpoint.update_local_frame_advantage(current_frame);
            }
        }

        let mut events = Vec::new();
        for endpoint in self.remotes.values_mut().chain(self.spectators.values_mut()) {
            let addr = endpoint.peer_addr();
            for event in endpoint.poll(&self.local_connect_status) {
                events.push((addr, event));
            }
        }
        for (addr, event) in events {
            self.handle_event(addr, event);
        }

        for endpoint in self.remotes.values_mut().chain(self.spectators.values_mut()) {
            endpoint.send_all_messages(self.socket.as_mut());
        }
    }

    fn handle_event(&mut self, addr: PeerAddress, event: ProtocolEvent) {
        let handles: HandleVec = self.players.handles_at(addr);
        match event {
            ProtocolEvent::Connected => {
                for &player in &handles {
                    self.push_event(Event::ConnectedToPeer { player });
                }
            },
            ProtocolEvent::Synchronizing { total, count } => {
                for &player in &handles {
                    self.push_event(Event::SynchronizingWithPeer {
                        player,
                        count,
                        total,
                    });
                }
            },
            ProtocolEvent::Synchronized => {
                for &player in &handles {
                    self.push_event(Event::SynchronizedWithPeer { player });
                }
                self.check_initial_sync();
            },
            ProtocolEvent::NetworkInterrupted { disconnect_timeout } => {
                for &player in &handles {
                    self.push_event(Event::ConnectionInterrupted {
                        player,
                        disconnect_timeout,
                    });
                }
            },
            ProtocolEvent::NetworkResumed => {
                for &player in &handles {
                    self.push_event(Event::ConnectionResumed { player });
                }
            },
            ProtocolEvent::Disconnected => {
                for &player in &handles {
                    let last_frame = self
                        .local_connect_status
                        .get(player.index())
                        .map_or(Frame::NULL, |status| status.last_frame);
                    self.disconnect_player_at_frame(player, last_frame);
                    self.push_event(Event::DisconnectedFromPeer { player });
                }
            },
            ProtocolEvent::Input { input, player } => {
                if self.spectators.contains_key(&addr) {
                    report_violation!(
                        ViolationSeverity::Warning,
                        ViolationKind::NetworkProtocol,
                        "spectator at {} sent input",
                        addr
                    );
                    return;
                }
                let Some(status) = self.local_connect_status.get_mut(player.index()) else {
                    report_violation!(
                        ViolationSeverity::Error,
                        ViolationKind::NetworkProtocol,
                        "input for unknown {}",
                        player
                    );
                    return;
                };
                if status.disconnected {
                    return;
                }
                if !status.last_frame.is_null() && status.last_frame + 1 != input.frame {
                    report_violation!(
                        ViolationSeverity::Error,
                        ViolationKind::NetworkProtocol,
                        "input of {} out of sequence: expected frame {}, got {}",
                        player,
                        status.last_frame + 1,
                        input.frame
                    );
                    return;
                }
                status.last_frame = input.frame;
                self.sync_layer.add_remote_input(player.index(), input);
            },
        }
    }

    fn disconnect_player_at_frame(&mut self, player: PlayerHandle, last_frame: Frame) {
        match self.players.get(player) {
            Ok(PlayerType::Local) => {
                if let Some(status) = self.local_connect_status.get_mut(player.index()) {
                    status.disconnected = true;
                }
            },
            Ok(PlayerType::Remote(addr)) => {
                let Some(endpoint) = self.remotes.get_mut(&addr) else {
                    return;
                };
                for handle in endpoint.handles() {
                    if let Some(status) = self.local_connect_status.get_mut(handle.index()) {
                        status.disconnected = true;
                    }
                }
                endpoint.disconnect();

                if self.sync_layer.current_frame() > last_frame {
                    // frames after the disconnect were simulated with predicted input
                    self.disconnect_frame = earliest(self.disconnect_frame, last_frame + 1);
                }
            },
            Ok(PlayerType::Spectator(addr)) => {
                if let Some(endpoint) = self.spectators.get_mut(&addr) {
                    endpoint.disconnect();
                }
            },
            Err(err) => {
                report_violation!(
                    ViolationSeverity::Warning,
                    ViolationKind::InternalError,
                    "cannot disconnect {}: {}",
                    player,
                    err
                );
            },
        }
        self.check_initial_sync();
    }

    /// Starts running once every player slot is filled and every endpoint completed
    /// its handshake.
    fn check_initial_sync(&mut self) {
        if self.state != SessionState::Synchronizing {
            return;
        }
        if self.players.num_registered_players() < self.num_players {
            return;
        }
        if self
            .remotes
            .values()
            .chain(self.spectators.values())
            .any(|endpoint| !endpoint.is_synchronized())
        {
            return;
        }
        info!("all peers synchronized; session is running");
        self.state = SessionState::Running;
        self.push_event(Event::Running);
    }

    /// Newest frame whose input is known for every connected player.
    fn min_confirmed_frame(&self) -> Frame {
        self.local_connect_status
            .iter()
            .filter(|status| !status.disconnected)
            .map(|status| status.last_frame)
            .min()
            .unwrap_or_else(|| self.sync_layer.current_frame())
    }

    /// Pulls disconnects that other peers observed earlier than we did.
    fn update_player_disconnects(&mut self) {
        for index in 0..self.num_players {
            let mut queue_connected = true;
            let mut queue_min_confirmed = Frame::new(i32::MAX);

            for endpoint in self.remotes.values() {
                if !endpoint.is_running() {
                    continue;
                }
                let status = endpoint.peer_connect_status(index);
                queue_connected &= !status.disconnected;
                queue_min_confirmed = std::cmp::min(queue_min_confirmed, status.last_frame);
            }

            let Some(local) = self.local_connect_status.get(index).copied() else {
                continue;
            };
            if !local.disconnected {
                queue_min_confirmed = std::cmp::min(queue_min_confirmed, local.last_frame);
            }

            if !queue_connected && (!local.disconnected || local.last_frame > queue_min_confirmed)
            {
                if let Some(handle) = self.players.handle_at_index(index) {
                    debug!("peers report {} disconnected at {}", handle, queue_min_confirmed);
                    self.disconnect_player_at_frame(handle, queue_min_confirmed);
                    if let Some(status) = self.local_connect_status.get_mut(index) {
                        status.last_frame = queue_min_confirmed;
                    }
                }
            }
        }
    }

    /// Returns to `frame` after a failed advance or correction.
    fn rewind(&mut self, frame: Frame) {
        match self.sync_layer.rewind_to(frame, self.callbacks.as_mut()) {
            Ok(reloaded) => debug!(
                "back at frame {} (state reloaded: {}, pending correction: {})",
                frame,
                reloaded,
                self.rollback.pending()
            ),
            Err(err) => report_violation!(
                ViolationSeverity::Error,
                ViolationKind::StateManagement,
                "could not reload frame {} after a failed advance: {}",
                frame,
                err
            ),
        }
    }

    /// Corrects mispredictions, moves the confirmed watermark and does the work that
    /// depends on it. Nothing confirmed changes if a correction fails.
    fn settle(&mut self) -> Result<(), SessionError> {
        self.update_player_disconnects();

        let first_incorrect = self
            .sync_layer
            .check_simulation_consistency(earliest(self.disconnect_frame, self.rollback.pending()));
        if !first_incorrect.is_null() {
            self.rollback.roll_back(
                &mut self.sync_layer,
                &self.local_connect_status,
                first_incorrect,
                self.callbacks.as_mut(),
            )?;
            self.disconnect_frame = Frame::NULL;
        }

        let confirmed = std::cmp::min(self.min_confirmed_frame(), self.sync_layer.current_frame());
        self.send_confirmed_inputs_to_spectators(confirmed)?;
        self.sync_layer.set_last_confirmed_frame(confirmed);

        if let DesyncDetection::On { interval } = self.settings.desync_detection {
            self.send_checksums(interval);
            self.compare_checksums();
        }
        self.check_wait_recommendation();
        Ok(())
    }

    fn send_confirmed_inputs_to_spectators(&mut self, confirmed: Frame) -> Result<(), SessionError> {
        if self.spectators.is_empty() {
            return Ok(());
        }
        while !confirmed.is_null() && self.next_spectator_frame <= confirmed {
            let frame = self.next_spectator_frame;
            let inputs = self
                .sync_layer
                .confirmed_inputs(frame, &self.local_connect_status)?;
            for endpoint in self.spectators.values_mut() {
                if endpoint.is_running() {
                    endpoint.send_input(frame, &inputs, &self.local_connect_status);
                }
            }
            self.next_spectator_frame += 1;
        }
        Ok(())
    }

    fn send_checksums(&mut self, interval: u32) {
        let interval = interval as i32;
        let confirmed = self.sync_layer.last_confirmed_frame();
        loop {
            let frame = if self.last_sent_checksum_frame.is_null() {
                Frame::new(interval)
            } else {
                self.last_sent_checksum_frame + interval
            };
            if frame > confirmed || frame > self.sync_layer.last_saved_frame() {
                break;
            }
            self.last_sent_checksum_frame = frame;

            let Some(checksum) = self.sync_layer.checksum(frame) else {
                report_violation!(
                    ViolationSeverity::Warning,
                    ViolationKind::StateManagement,
                    "no snapshot of frame {} left to checksum",
                    frame
                );
                continue;
            };
            for endpoint in self.remotes.values_mut() {
                endpoint.send_checksum_report(frame, checksum);
            }
            self.local_checksum_history.insert(frame, checksum);
        }

        let max_history = self.settings.protocol_config.max_checksum_history;
        while self.local_checksum_history.len() > max_history {
            self.local_checksum_history.pop_first();
        }
    }

    fn compare_checksums(&mut self) {
        let confirmed = self.sync_layer.last_confirmed_frame();
        if confirmed.is_null() {
            return;
        }
        let mut mismatches = Vec::new();
        for endpoint in self.remotes.values_mut() {
            for (&frame, &remote_checksum) in endpoint.pending_checksums() {
                if frame >= confirmed {
                    break;
                }
                let Some(&local_checksum) = self.local_checksum_history.get(&frame) else {
                    continue;
                };
                if local_checksum != remote_checksum {
                    mismatches.push((endpoint.peer_addr(), frame, local_checksum, remote_checksum));
                }
            }
            endpoint.forget_checksums_through(confirmed - 1);
        }

        for (addr, frame, local_checksum, remote_checksum) in mismatches {
            let Some(&player) = self.players.handles_at(addr).first() else {
                continue;
            };
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::StateManagement,
                "desync at frame {} with {}: local {:#018x}, remote {:#018x}",
                frame,
                player,
                local_checksum,
                remote_checksum
            );
            self.push_event(Event::DesyncDetected {
                frame,
                local_checksum,
                remote_checksum,
                player,
            });
        }
    }

    fn max_frame_advantage(&self) -> i32 {
        self.remotes
            .values()
            .filter(|endpoint| {
                endpoint.handles().iter().any(|handle| {
                    self.local_connect_status
                        .get(handle.index())
                        .is_some_and(|status| !status.disconnected)
                })
            })
            .map(UdpProtocol::average_frame_advantage)
            .max()
            .unwrap_or(0)
    }

    fn check_wait_recommendation(&mut self) {
        self.frames_ahead = self.max_frame_advantage();
        let current = self.sync_layer.current_frame();
        if current > self.next_recommended_sleep && self.frames_ahead >= MIN_RECOMMENDATION as i32 {
            self.next_recommended_sleep = current + RECOMMENDATION_INTERVAL;
            let frames_ahead = u32::try_from(self.frames_ahead).unwrap_or(0);
            debug!("recommending {} idle frames", frames_ahead);
            self.push_event(Event::TimeSync { frames_ahead });
        }
    }

    fn push_event(&mut self, event: Event) {
        self.event_queue.push_back(event);
        while self.event_queue.len() > self.event_queue_size {
            self.event_queue.pop_front();
        }
    }

    /// Hands queued events to the host in arrival order. Every event is delivered even
    /// if one is rejected; the first rejection is returned.
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

impl Session for P2PSession {
    fn add_player(
        &mut self,
        player_type: PlayerType,
        player_num: usize,
    ) -> Result<PlayerHandle, SessionError> {
        Self::add_player(self, player_type, player_num)
    }

    fn add_local_input(&mut self, player: PlayerHandle, input: i64) -> Result<(), SessionError> {
        Self::add_local_input(self, player, input)
    }

    fn synchronize_input(&mut self) -> Result<SyncedInputs, SessionError> {
        Self::synchronize_input(self)
    }

    fn advance_frame(&mut self) -> Result<(), SessionError> {
        Self::advance_frame(self)
    }

    fn idle(&mut self, timeout: Duration) -> Result<(), SessionError> {
        Self::idle(self, timeout)
    }

    fn disconnect_player(&mut self, player: PlayerHandle) -> Result<(), SessionError> {
        Self::disconnect_player(self, player)
    }

    fn set_frame_delay(&mut self, player: PlayerHandle, delay: usize) -> Result<(), SessionError> {
        Self::set_frame_delay(self, player, delay)
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
    use std::cell::RefCell;
    use std::net::SocketAddr;
    use std::rc::Rc;

    use super::*;
    use crate::callbacks::{CallbackError, SaveBuffer};
    use crate::network::messages::Message;
    use crate::telemetry::InvariantChecker;
    use crate::ErrorCode;

    struct NullSocket;

    impl NonBlockingSocket for NullSocket {
        fn send_to(&mut self, _msg: &Message, _addr: &PeerAddress) {}

        fn receive_all_messages(&mut self) -> Vec<(PeerAddress, Message)> {
            Vec::new()
        }
    }

    #[derive(Default)]
    struct Log {
        saved: Vec<Frame>,
        freed: usize,
        events: Vec<Event>,
        fail_save: bool,
    }

    /// State is a single counter; the host adds every input to it.
    struct Counter {
        state: Rc<RefCell<i64>>,
        log: Rc<RefCell<Log>>,
    }

    impl SessionCallbacks for Counter {
        fn begin_game(&mut self, _game: &str) -> Result<(), CallbackError> {
            Ok(())
        }

        fn advance_frame(&mut self, inputs: &SyncedInputs, _flags: u32) -> Result<(), CallbackError> {
            *self.state.borrow_mut() += inputs.inputs.iter().sum::<i64>();
            Ok(())
        }

        fn save_game_state(&mut self, frame: Frame) -> Result<(SaveBuffer, u64), CallbackError> {
            if self.log.borrow().fail_save {
                return Err(CallbackError::new("disk full"));
            }
            self.log.borrow_mut().saved.push(frame);
            let value = *self.state.borrow();
            Ok((SaveBuffer::new(value.to_le_bytes().to_vec()), value as u64))
        }

        fn load_game_state(&mut self, buffer: &SaveBuffer) -> Result<(), CallbackError> {
            let bytes: [u8; 8] = buffer.as_bytes().try_into().unwrap();
            *self.state.borrow_mut() = i64::from_le_bytes(bytes);
            Ok(())
        }

        fn free_buffer(&mut self, _buffer: SaveBuffer) {
            self.log.borrow_mut().freed += 1;
        }

        fn on_event(&mut self, event: &Event) -> Result<(), CallbackError> {
            self.log.borrow_mut().events.push(event.clone());
            Ok(())
        }
    }

    fn addr(port: u16) -> PeerAddress {
        PeerAddress::Ip(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn session(players: usize) -> (P2PSession, Rc<RefCell<i64>>, Rc<RefCell<Log>>) {
        let state = Rc::new(RefCell::new(0));
        let log = Rc::new(RefCell::new(Log::default()));
        let callbacks = Counter {
            state: Rc::clone(&state),
            log: Rc::clone(&log),
        };
        let session = SessionBuilder::new("test")
            .with_num_players(players)
            .unwrap()
            .start_p2p_session(Box::new(callbacks), NullSocket)
            .unwrap();
        (session, state, log)
    }

    /// One tick of a host that simulates by summing inputs.
    fn tick(session: &mut P2PSession, state: &Rc<RefCell<i64>>) -> Result<(), SessionError> {
        let inputs = session.synchronize_input()?;
        *state.borrow_mut() += inputs.inputs.iter().sum::<i64>();
        session.advance_frame()
    }

    #[test]
    fn local_session_runs_once_all_players_are_added() {
        let (mut s, _, log) = session(2);
        let p0 = s.add_player(PlayerType::Local, 0).unwrap();
        assert_eq!(s.current_state(), SessionState::Synchronizing);
        assert_eq!(s.add_local_input(p0, 1), Err(SessionError::NotSynchronized));
        s.add_player(PlayerType::Local, 1).unwrap();
        assert_eq!(s.current_state(), SessionState::Running);

        s.idle(Duration::ZERO).unwrap();
        assert_eq!(log.borrow().events, vec![Event::Running]);
    }

    #[test]
    fn cannot_join_running_session() {
        let (mut s, _, _) = session(1);
        s.add_player(PlayerType::Local, 0).unwrap();
        let err = s.add_player(PlayerType::Spectator(addr(9000)), 0).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRequest);
    }

    #[test]
    fn local_frames_advance_and_save() {
        let (mut s, state, log) = session(2);
        let p0 = s.add_player(PlayerType::Local, 0).unwrap();
        let p1 = s.add_player(PlayerType::Local, 1).unwrap();

        for frame in 0..20 {
            s.add_local_input(p0, 1).unwrap();
            s.add_local_input(p1, 2).unwrap();
            tick(&mut s, &state).unwrap();
            assert_eq!(s.current_frame(), Frame::new(frame + 1));
        }
        assert_eq!(*state.borrow(), 60);
        assert_eq!(s.rollbacks(), 0);
        assert_eq!(log.borrow().saved.first(), Some(&Frame::new(0)));
        assert_eq!(log.borrow().saved.last(), Some(&Frame::new(20)));
        assert_eq!(s.confirmed_frame(), Frame::new(19));
        assert!(s.sync_layer.check_invariants().is_ok());
    }

    #[test]
    fn failed_save_rewinds_and_still_delivers_events() {
        let (mut s, state, log) = session(1);
        let p0 = s.add_player(PlayerType::Local, 0).unwrap();
        s.add_local_input(p0, 3).unwrap();

        log.borrow_mut().fail_save = true;
        let err = tick(&mut s, &state).unwrap_err();
        assert_eq!(err.code(), ErrorCode::GeneralFailure);
        assert_eq!(s.current_frame(), Frame::new(0));
        assert_eq!(*state.borrow(), 0);
        assert_eq!(log.borrow().events, vec![Event::Running]);

        log.borrow_mut().fail_save = false;
        assert!(matches!(
            s.add_local_input(p0, 3),
            Err(SessionError::InputDropped { .. })
        ));
        tick(&mut s, &state).unwrap();
        assert_eq!(s.current_frame(), Frame::new(1));
        assert_eq!(*state.borrow(), 3);
        assert_eq!(log.borrow().saved, vec![Frame::new(0), Frame::new(1)]);
    }

    #[test]
    fn double_input_is_dropped() {
        let (mut s, _, _) = session(1);
        let p0 = s.add_player(PlayerType::Local, 0).unwrap();
        s.add_local_input(p0, 1).unwrap();
        assert!(matches!(
            s.add_local_input(p0, 1),
            Err(SessionError::InputDropped { .. })
        ));
    }

    #[test]
    fn handle_errors() {
        let (mut s, _, _) = session(1);
        let p0 = s.add_player(PlayerType::Local, 0).unwrap();
        assert_eq!(
            s.add_local_input(PlayerHandle::new(0, 9), 1),
            Err(SessionError::InvalidPlayerHandle {
                handle: PlayerHandle::new(0, 9)
            })
        );
        assert!(matches!(
            s.add_local_input(PlayerHandle::new(100, 0), 1),
            Err(SessionError::PlayerOutOfRange { .. })
        ));
        assert_eq!(
            s.network_stats(p0),
            Err(SessionError::InvalidPlayerHandle { handle: p0 })
        );
        assert_eq!(s.player_status(p0), Ok(PlayerStatus::Running));
    }

    #[test]
    fn remote_player_keeps_session_synchronizing() {
        let (mut s, _, log) = session(2);
        let local = s.add_player(PlayerType::Local, 0).unwrap();
        let remote = s.add_player(PlayerType::Remote(addr(7000)), 1).unwrap();
        assert_eq!(s.current_state(), SessionState::Synchronizing);
        assert_eq!(s.player_status(remote), Ok(PlayerStatus::Connecting));
        assert_eq!(s.synchronize_input(), Err(SessionError::NotSynchronized));
        assert_eq!(s.advance_frame(), Err(SessionError::NotSynchronized));
        assert_eq!(s.network_stats(remote), Err(SessionError::NotSynchronized));
        assert_eq!(
            s.set_frame_delay(remote, 2),
            Err(SessionError::InvalidPlayerHandle { handle: remote })
        );
        assert!(s.set_frame_delay(local, 2).is_ok());
        s.idle(Duration::ZERO).unwrap();
        assert!(log.borrow().events.is_empty());
    }

    #[test]
    fn disconnecting_twice() {
        let (mut s, _, _) = session(2);
        s.add_player(PlayerType::Local, 0).unwrap();
        let remote = s.add_player(PlayerType::Remote(addr(7000)), 1).unwrap();
        s.disconnect_player(remote).unwrap();
        assert_eq!(s.player_status(remote), Ok(PlayerStatus::Disconnected));
        assert_eq!(
            s.disconnect_player(remote),
            Err(SessionError::PlayerDisconnected { handle: remote })
        );
        // the disconnected endpoint no longer blocks the session
        assert_eq!(s.current_state(), SessionState::Running);
        assert_eq!(
            s.add_local_input(remote, 1),
            Err(SessionError::PlayerDisconnected { handle: remote })
        );
    }

    #[test]
    fn disconnected_player_contributes_blank_input() {
        let (mut s, state, _) = session(2);
        let local = s.add_player(PlayerType::Local, 0).unwrap();
        let remote = s.add_player(PlayerType::Remote(addr(7000)), 1).unwrap();
        s.disconnect_player(remote).unwrap();

        for _ in 0..30 {
            s.add_local_input(local, 3).unwrap();
            let inputs = s.synchronize_input().unwrap();
            assert_eq!(inputs.status(1), crate::InputStatus::Disconnected);
            *state.borrow_mut() += inputs.inputs.iter().sum::<i64>();
            s.advance_frame().unwrap();
        }
        assert_eq!(*state.borrow(), 90);
    }

    #[test]
    fn close_releases_snapshots() {
        let (mut s, state, log) = session(1);
        let p0 = s.add_player(PlayerType::Local, 0).unwrap();
        for _ in 0..3 {
            s.add_local_input(p0, 1).unwrap();
            tick(&mut s, &state).unwrap();
        }
        s.close();
        let log = log.borrow();
        assert_eq!(log.freed, log.saved.len());
    }
}
