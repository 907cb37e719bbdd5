use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, info, trace};
use web_time::Duration;

use crate::callbacks::{SaveBuffer, SessionCallbacks};
use crate::network::messages::ConnectionStatus;
use crate::debug_check_invariants;
use crate::report_violation;
use crate::rollback::RollbackController;
use crate::sessions::builder::SessionBuilder;
use crate::sessions::player_table::PlayerTable;
use crate::sync_layer::SyncLayer;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{
    Event, Frame, PlayerHandle, PlayerStatus, PlayerType, Session, SessionError, SessionState,
    SyncedInputs,
};

/// An offline harness for the host's simulation. Every advanced frame is followed by a
/// rollback of `check_distance` frames; the re-simulated checksums must equal the ones
/// saved the first time around.
///
/// A mismatch is reported as [`Event::DesyncDetected`] (local = first run, remote =
/// replay), and both buffers are handed to [`SessionCallbacks::log_game_state`] with the
/// labels `"original"` and `"replay"`.
pub struct SyncTestSession {
    num_players: usize,
    check_distance: usize,
    input_delay: usize,
    callbacks: Box<dyn SessionCallbacks>,
    sync_layer: SyncLayer,
    rollback: RollbackController,
    players: PlayerTable,
    /// Every player counts as connected and confirmed up to the newest input.
    dummy_connect_status: Vec<ConnectionStatus>,
    /// First-run checksum and a copy of the buffer of each frame still in the check
    /// window. The copies never go through `free_buffer`.
    originals: BTreeMap<Frame, (u64, SaveBuffer)>,
    event_queue: VecDeque<Event>,
    event_queue_size: usize,
    closed: bool,
}

impl std::fmt::Debug for SyncTestSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncTestSession")
            .field("num_players", &self.num_players)
            .field("check_distance", &self.check_distance)
            .field("current_frame", &self.sync_layer.current_frame())
            .finish_non_exhaustive()
    }
}

impl SyncTestSession {
    pub(crate) fn new(
        builder: SessionBuilder,
        mut callbacks: Box<dyn SessionCallbacks>,
        check_distance: usize,
    ) -> Result<Self, SessionError> {
        callbacks.begin_game(&builder.game)?;
        info!(
            "starting sync test for {} with check distance {}",
            builder.game, check_distance
        );

        Ok(Self {
            num_players: builder.num_players,
            check_distance,
            input_delay: builder.input_delay,
            callbacks,
            sync_layer: SyncLayer::with_store_capacity(
                builder.num_players,
                builder.max_prediction,
                builder.prediction,
                check_distance + 2,
            ),
            rollback: RollbackController::default(),
            players: PlayerTable::new(builder.num_players),
            dummy_connect_status: vec![ConnectionStatus::default(); builder.num_players],
            originals: BTreeMap::new(),
            event_queue: VecDeque::new(),
            event_queue_size: builder.event_queue_size,
            closed: false,
        })
    }

    /// Registers a local player. Every player of a sync test is local.
    ///
    /// # Errors
    /// - [`SessionError::Unsupported`] for remote players and spectators.
    /// - [`SessionError::PlayerOutOfRange`] / [`SessionError::InvalidRequest`] for bad slots.
    pub fn add_player(
        &mut self,
        player_type: PlayerType,
        player_num: usize,
    ) -> Result<PlayerHandle, SessionError> {
        if player_type != PlayerType::Local {
            return Err(SessionError::Unsupported {
                operation: "add_player (remote or spectator in a sync test)",
            });
        }
        let handle = self.players.add(player_type, player_num)?;
        self.sync_layer
            .set_frame_delay(handle.index(), self.input_delay)?;
        Ok(handle)
    }

    /// Submits a player's input for the current frame.
    ///
    /// # Errors
    /// - [`SessionError::NotSynchronized`] until every player slot is registered.
    /// - [`SessionError::InvalidPlayerHandle`] / [`SessionError::PlayerOutOfRange`] for
    ///   unknown handles.
    /// - [`SessionError::InputDropped`] if the player already has input for this frame.
    pub fn add_local_input(&mut self, player: PlayerHandle, input: i64) -> Result<(), SessionError> {
        self.players.player(player)?;
        self.check_running()?;

        let frame = self.sync_layer.current_frame();
        let actual_frame = self.sync_layer.add_local_input(player.index(), input);
        if actual_frame.is_null() {
            return Err(SessionError::InputDropped {
                handle: player,
                frame,
            });
        }
        if let Some(status) = self.dummy_connect_status.get_mut(player.index()) {
            status.last_frame = actual_frame;
        }
        Ok(())
    }

    /// Inputs of every player for the current frame.
    ///
    /// # Errors
    /// - [`SessionError::NotSynchronized`] until every player slot is registered.
    /// - [`SessionError::InvalidRequest`] if some player has no input for the frame.
    pub fn synchronize_input(&mut self) -> Result<SyncedInputs, SessionError> {
        self.check_running()?;
        self.ensure_initial_snapshot()?;

        let inputs = self
            .sync_layer
            .synchronized_inputs(&self.dummy_connect_status)
            .ok_or_else(|| {
                SessionError::general(format!(
                    "no inputs for frame {}",
                    self.sync_layer.current_frame()
                ))
            })?;
        if let Some(index) = inputs.predicted.iter().next() {
            self.sync_layer.reset_prediction();
            return Err(SessionError::invalid_request(format!(
                "player {} has no input for frame {}",
                index, inputs.frame
            )));
        }
        Ok(inputs)
    }

    /// Saves the simulated frame, rolls back `check_distance` frames and replays them,
    /// comparing every re-saved checksum with the first one.
    ///
    /// If a callback fails the session goes back to the frame it was at: the snapshot
    /// saved by this call is freed and the host state is reloaded to the start of that
    /// frame. The frame's input stays queued; synchronize, simulate and advance again.
    ///
    /// # Errors
    /// - [`SessionError::NotSynchronized`] until every player slot is registered.
    /// - [`SessionError::GeneralFailure`] if a host callback fails.
    pub fn advance_frame(&mut self) -> Result<(), SessionError> {
        self.check_running()?;
        self.ensure_initial_snapshot()?;

        let frame = self.sync_layer.current_frame();
        self.sync_layer.increment_frame();
        if let Err(err) = self.save_original() {
            self.rewind(frame);
            return Err(err);
        }

        let current = self.sync_layer.current_frame();
        let distance = self.check_distance as i32;
        if current.as_i32() > distance {
            let from = current - distance;
            let mut replayed = Vec::with_capacity(self.check_distance);
            let result = self.rollback.replay(
                &mut self.sync_layer,
                &self.dummy_connect_status,
                from,
                self.callbacks.as_mut(),
                |frame, checksum| {
                    replayed.push((frame, checksum));
                    Ok(())
                },
            );
            if let Err(err) = result {
                self.rewind(frame);
                return Err(err);
            }
            trace!("replayed frames {}..{}", from, current);
            for (frame, checksum) in replayed {
                self.compare_with_original(frame, checksum);
            }
        }

        let confirmed = current - distance;
        if confirmed.is_valid() {
            self.sync_layer.set_last_confirmed_frame(confirmed);
        }
        let oldest = current - distance;
        self.originals.retain(|&frame, _| frame >= oldest);
        debug_check_invariants!(self.sync_layer, "SyncTestSession::advance_frame");

        self.flush_events()
    }

    /// Only delivers queued events; a sync test has no network.
    ///
    /// # Errors
    /// Returns [`SessionError::GeneralFailure`] if the host rejects an event.
    pub fn idle(&mut self, _timeout: Duration) -> Result<(), SessionError> {
        self.flush_events()
    }

    /// Changes the input delay of a player.
    ///
    /// # Errors
    /// [`SessionError::InvalidPlayerHandle`] / [`SessionError::PlayerOutOfRange`] for unknown
    /// handles.
    pub fn set_frame_delay(&mut self, player: PlayerHandle, delay: usize) -> Result<(), SessionError> {
        self.players.player(player)?;
        self.sync_layer.set_frame_delay(player.index(), delay)
    }

    /// Every registered player is local and running.
    ///
    /// # Errors
    /// [`SessionError::InvalidPlayerHandle`] / [`SessionError::PlayerOutOfRange`] for unknown
    /// handles.
    pub fn player_status(&self, player: PlayerHandle) -> Result<PlayerStatus, SessionError> {
        self.players.player(player)?;
        Ok(PlayerStatus::Running)
    }

    /// The frame the host simulates next.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.sync_layer.current_frame()
    }

    /// Number of player slots.
    #[must_use]
    pub fn num_players(&self) -> usize {
        self.num_players
    }

    /// Length of the simulated rollbacks.
    #[must_use]
    pub fn check_distance(&self) -> usize {
        self.check_distance
    }

    /// Running once every player slot is registered.
    #[must_use]
    pub fn current_state(&self) -> SessionState {
        if self.players.num_registered_players() == self.num_players {
            SessionState::Running
        } else {
            SessionState::Synchronizing
        }
    }

    /// Frames re-simulated so far.
    #[must_use]
    pub fn frames_replayed(&self) -> u64 {
        self.rollback.frames_replayed()
    }

    /// Hands every snapshot back to the host.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.sync_layer.release_all(self.callbacks.as_mut());
        self.originals.clear();
        info!("sync test closed at frame {}", self.sync_layer.current_frame());
    }

    fn check_running(&self) -> Result<(), SessionError> {
        match self.current_state() {
            SessionState::Running => Ok(()),
            SessionState::Synchronizing => Err(SessionError::NotSynchronized),
        }
    }

    fn ensure_initial_snapshot(&mut self) -> Result<(), SessionError> {
        if self.sync_layer.last_saved_frame().is_null() {
            self.save_original()?;
        }
        Ok(())
    }

    /// Returns to `frame` after a failed advance. Falls back to the first-run copy when a
    /// partial replay already replaced the snapshot of `frame`.
    fn rewind(&mut self, frame: Frame) {
        self.originals.retain(|&saved, _| saved <= frame);
        let result = match self.sync_layer.rewind_to(frame, self.callbacks.as_mut()) {
            Ok(true) => Ok(()),
            Ok(false) => match self.originals.get(&frame) {
                Some((_, original)) => self
                    .callbacks
                    .load_game_state(original)
                    .map_err(SessionError::from),
                None => Ok(()),
            },
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => debug!("advance failed, back at frame {}", frame),
            Err(err) => report_violation!(
                ViolationSeverity::Error,
                ViolationKind::StateManagement,
                "could not reload frame {} after a failed advance: {}",
                frame,
                err
            ),
        }
    }

    /// Saves the current frame and remembers its first checksum and bytes.
    fn save_original(&mut self) -> Result<(), SessionError> {
        let checksum = self.sync_layer.save_current_state(self.callbacks.as_mut())?;
        let frame = self.sync_layer.current_frame();
        if let Some(snapshot) = self.sync_layer.snapshot(frame) {
            let buffer = snapshot.buffer.clone();
            self.originals.insert(frame, (checksum, buffer));
        }
        Ok(())
    }

    fn compare_with_original(&mut self, frame: Frame, replay_checksum: u64) {
        let Some((original_checksum, original)) = self.originals.get(&frame) else {
            return;
        };
        if *original_checksum == replay_checksum {
            return;
        }
        let original_checksum = *original_checksum;

        report_violation!(
            ViolationSeverity::Error,
            ViolationKind::StateManagement,
            "replay of frame {} produced checksum {:#018x}, first run produced {:#018x}",
            frame,
            replay_checksum,
            original_checksum
        );
        self.callbacks.log_game_state("original", original);
        if let Some(replay) = self.sync_layer.snapshot(frame) {
            self.callbacks.log_game_state("replay", &replay.buffer);
        }

        let Some(player) = self.players.handle_at_index(0) else {
            return;
        };
        self.event_queue.push_back(Event::DesyncDetected {
            frame,
            local_checksum: original_checksum,
            remote_checksum: replay_checksum,
            player,
        });
        while self.event_queue.len() > self.event_queue_size {
            self.event_queue.pop_front();
        }
    }

    fn flush_events(&mut self) -> Result<(), SessionError> {
        let mut result = Ok(());
        while let Some(event) = self.event_queue.pop_front() {
            debug!("delivering {:?}", event);
            if let Err(err) = self.callbacks.on_event(&event) {
                if result.is_ok() {
                    result = Err(err.into());
                }
            }
        }
        result
    }
}

impl Session for SyncTestSession {
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

    fn set_frame_delay(&mut self, player: PlayerHandle, delay: usize) -> Result<(), SessionError> {
        Self::set_frame_delay(self, player, delay)
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
    use std::rc::Rc;

    use super::*;
    use crate::callbacks::CallbackError;
    use crate::telemetry::InvariantChecker;

    #[derive(Default)]
    struct Shared {
        state: i64,
        frames_simulated: u64,
        advance_calls: u64,
        logged: Vec<String>,
        events: Vec<Event>,
        saved: usize,
        freed: usize,
        /// Makes the replay of this frame diverge.
        corrupt_replay_of: Option<Frame>,
        fail_replay_of: Option<Frame>,
        fail_load: bool,
    }

    struct Game(Rc<RefCell<Shared>>);

    fn step(shared: &mut Shared, inputs: &SyncedInputs) {
        shared.state = shared.state * 31 + inputs.inputs.iter().sum::<i64>();
        shared.frames_simulated += 1;
    }

    impl SessionCallbacks for Game {
        fn begin_game(&mut self, _game: &str) -> Result<(), CallbackError> {
            Ok(())
        }

        fn advance_frame(&mut self, inputs: &SyncedInputs, _flags: u32) -> Result<(), CallbackError> {
            let mut shared = self.0.borrow_mut();
            shared.advance_calls += 1;
            if shared.fail_replay_of == Some(inputs.frame) {
                return Err(CallbackError::new("replay refused"));
            }
            step(&mut shared, inputs);
            if shared.corrupt_replay_of == Some(inputs.frame) {
                shared.state += 1;
            }
            Ok(())
        }

        fn save_game_state(&mut self, _frame: Frame) -> Result<(SaveBuffer, u64), CallbackError> {
            let mut shared = self.0.borrow_mut();
            shared.saved += 1;
            let state = shared.state;
            Ok((SaveBuffer::new(state.to_le_bytes().to_vec()), state as u64))
        }

        fn load_game_state(&mut self, buffer: &SaveBuffer) -> Result<(), CallbackError> {
            let mut shared = self.0.borrow_mut();
            if shared.fail_load {
                return Err(CallbackError::new("load refused"));
            }
            shared.state = i64::from_le_bytes(buffer.as_bytes().try_into().unwrap());
            Ok(())
        }

        fn log_game_state(&mut self, label: &str, _buffer: &SaveBuffer) {
            self.0.borrow_mut().logged.push(label.to_owned());
        }

        fn free_buffer(&mut self, _buffer: SaveBuffer) {
            self.0.borrow_mut().freed += 1;
        }

        fn on_event(&mut self, event: &Event) -> Result<(), CallbackError> {
            self.0.borrow_mut().events.push(event.clone());
            Ok(())
        }
    }

    fn session(players: usize, check_distance: usize) -> (SyncTestSession, Rc<RefCell<Shared>>) {
        let shared = Rc::new(RefCell::new(Shared::default()));
        let session = SessionBuilder::new("synctest")
            .with_num_players(players)
            .unwrap()
            .start_synctest_session(Box::new(Game(Rc::clone(&shared))), check_distance)
            .unwrap();
        (session, shared)
    }

    fn run_frames(
        s: &mut SyncTestSession,
        shared: &Rc<RefCell<Shared>>,
        frames: i64,
    ) -> Result<(), SessionError> {
        let handles: Vec<_> = (0..s.num_players())
            .map(|index| PlayerHandle::new(index as u32, 0))
            .collect();
        for frame in 0..frames {
            for (index, &handle) in handles.iter().enumerate() {
                s.add_local_input(handle, frame * 10 + index as i64)?;
            }
            let inputs = s.synchronize_input()?;
            step(&mut shared.borrow_mut(), &inputs);
            s.advance_frame()?;
        }
        Ok(())
    }

    #[test]
    fn deterministic_simulation_reports_nothing() {
        let (mut s, shared) = session(2, 2);
        s.add_player(PlayerType::Local, 0).unwrap();
        s.add_player(PlayerType::Local, 1).unwrap();
        run_frames(&mut s, &shared, 30).unwrap();

        let shared = shared.borrow();
        assert!(shared.events.is_empty());
        assert!(shared.logged.is_empty());
        assert_eq!(s.current_frame(), Frame::new(30));
        // frames 3..=30 each replay two frames
        assert_eq!(s.frames_replayed(), 28 * 2);
        assert_eq!(shared.advance_calls, 28 * 2);
        assert!(s.sync_layer.check_invariants().is_ok());
    }

    #[test]
    fn two_runs_agree() {
        let run = || {
            let (mut s, shared) = session(1, 3);
            s.add_player(PlayerType::Local, 0).unwrap();
            run_frames(&mut s, &shared, 20).unwrap();
            let state = shared.borrow().state;
            state
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn nondeterministic_replay_is_reported() {
        let (mut s, shared) = session(1, 2);
        let player = s.add_player(PlayerType::Local, 0).unwrap();
        shared.borrow_mut().corrupt_replay_of = Some(Frame::new(4));
        run_frames(&mut s, &shared, 8).unwrap();

        let shared = shared.borrow();
        let desyncs: Vec<_> = shared
            .events
            .iter()
            .filter_map(|event| match event {
                Event::DesyncDetected {
                    frame,
                    player: p,
                    local_checksum,
                    remote_checksum,
                } => Some((*frame, *p, local_checksum != remote_checksum)),
                _ => None,
            })
            .collect();
        assert!(!desyncs.is_empty());
        assert_eq!(desyncs[0], (Frame::new(5), player, true));
        assert_eq!(&shared.logged[..2], ["original", "replay"]);
    }

    #[test]
    fn requires_every_player() {
        let (mut s, _) = session(2, 1);
        let p0 = s.add_player(PlayerType::Local, 0).unwrap();
        assert_eq!(s.current_state(), SessionState::Synchronizing);
        assert_eq!(s.add_local_input(p0, 1), Err(SessionError::NotSynchronized));
        let p1 = s.add_player(PlayerType::Local, 1).unwrap();
        s.add_local_input(p0, 1).unwrap();
        let err = s.synchronize_input().unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::InvalidRequest);
        s.add_local_input(p1, 1).unwrap();
        assert!(s.synchronize_input().is_ok());
    }

    #[test]
    fn network_operations_are_unsupported() {
        let (mut s, _) = session(1, 1);
        let p0 = s.add_player(PlayerType::Local, 0).unwrap();
        let session: &mut dyn Session = &mut s;
        assert!(matches!(
            session.network_stats(p0),
            Err(SessionError::Unsupported { .. })
        ));
        assert!(matches!(
            session.disconnect_player(p0),
            Err(SessionError::Unsupported { .. })
        ));
        let remote = PlayerType::Remote(crate::PeerAddress::Platform(7));
        assert!(matches!(
            session.add_player(remote, 0),
            Err(SessionError::Unsupported { .. })
        ));
        assert_eq!(session.player_status(p0), Ok(PlayerStatus::Running));
    }

    #[test]
    fn failed_load_rewinds_to_the_frame_before() {
        let (mut s, shared) = session(1, 2);
        let player = s.add_player(PlayerType::Local, 0).unwrap();
        run_frames(&mut s, &shared, 4).unwrap();
        let (saved, freed) = {
            let shared = shared.borrow();
            (shared.saved, shared.freed)
        };

        shared.borrow_mut().fail_load = true;
        let err = run_frames(&mut s, &shared, 1).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::GeneralFailure);
        assert_eq!(s.current_frame(), Frame::new(4));
        {
            let shared = shared.borrow();
            assert_eq!(shared.saved, saved + 1);
            // one eviction, then the snapshot of frame 5 itself
            assert_eq!(shared.freed, freed + 2);
        }

        shared.borrow_mut().fail_load = false;
        assert!(matches!(
            s.add_local_input(player, 0),
            Err(SessionError::InputDropped { .. })
        ));
        assert_eq!(s.synchronize_input().unwrap().frame, Frame::new(4));
    }

    #[test]
    fn failed_replay_restores_the_first_run_state() {
        let (mut s, shared) = session(1, 3);
        let player = s.add_player(PlayerType::Local, 0).unwrap();
        run_frames(&mut s, &shared, 5).unwrap();
        let before = shared.borrow().state;

        // the replay re-saves frame 4, replacing every later snapshot, then fails
        shared.borrow_mut().fail_replay_of = Some(Frame::new(4));
        let err = run_frames(&mut s, &shared, 1).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::GeneralFailure);
        assert_eq!(s.current_frame(), Frame::new(5));
        assert_eq!(shared.borrow().state, before);

        shared.borrow_mut().fail_replay_of = None;
        assert!(s.add_local_input(player, 0).is_err());
        let inputs = s.synchronize_input().unwrap();
        assert_eq!(inputs.frame, Frame::new(5));
        step(&mut shared.borrow_mut(), &inputs);
        s.advance_frame().unwrap();
        assert_eq!(s.current_frame(), Frame::new(6));
        assert!(shared.borrow().events.is_empty());
    }

    #[test]
    fn close_frees_every_buffer() {
        let (mut s, shared) = session(1, 2);
        s.add_player(PlayerType::Local, 0).unwrap();
        run_frames(&mut s, &shared, 10).unwrap();
        s.close();
        let shared = shared.borrow();
        assert_eq!(shared.freed, shared.saved);
    }
}
