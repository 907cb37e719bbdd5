//! Frame bookkeeping shared by every session variant.
//!
//! The [`SyncLayer`] owns the per-player [`InputQueue`]s, the [`StateStore`] and the
//! frame counters. It merges confirmed and predicted inputs into [`SyncedInputs`],
//! checkpoints host state through the callback trait, and reports the earliest
//! mispredicted frame to the rollback controller.
//!
//! Snapshot semantics: the snapshot saved at frame `f` is the state *before* frame `f`
//! is simulated. Frame `0` is saved once before any input is submitted.

use std::sync::Arc;

use smallvec::SmallVec;
use tracing::trace;

use crate::callbacks::{SaveBuffer, SessionCallbacks};
use crate::frame_info::PlayerInput;
use crate::input_queue::{InputQueue, PredictionStrategy};
use crate::network::messages::ConnectionStatus;
use crate::report_violation;
use crate::state_store::{Snapshot, StateStore};
use crate::telemetry::{InvariantChecker, InvariantViolation, ViolationKind, ViolationSeverity};
use crate::{Frame, InputStatus, PlayerSet, SessionError, SyncedInputs, MAX_PLAYERS};

#[derive(Debug)]
pub(crate) struct SyncLayer {
    num_players: usize,
    max_prediction: usize,
    last_confirmed_frame: Frame,
    current_frame: Frame,
    input_queues: Vec<InputQueue>,
    state_store: StateStore,
}

impl SyncLayer {
    /// Creates a sync layer whose state store retains `max_prediction + 2` frames: every
    /// frame that may still be rolled back to, plus the newest one.
    pub(crate) fn new(
        num_players: usize,
        max_prediction: usize,
        strategy: Arc<dyn PredictionStrategy>,
    ) -> Self {
        Self::with_store_capacity(num_players, max_prediction, strategy, max_prediction + 2)
    }

    pub(crate) fn with_store_capacity(
        num_players: usize,
        max_prediction: usize,
        strategy: Arc<dyn PredictionStrategy>,
        store_capacity: usize,
    ) -> Self {
        let input_queues = (0..num_players)
            .map(|index| InputQueue::new(index, Arc::clone(&strategy)))
            .collect();
        Self {
            num_players,
            max_prediction,
            last_confirmed_frame: Frame::NULL,
            current_frame: Frame::new(0),
            input_queues,
            state_store: StateStore::new(store_capacity),
        }
    }

    pub(crate) fn current_frame(&self) -> Frame {
        self.current_frame
    }

    pub(crate) fn last_confirmed_frame(&self) -> Frame {
        self.last_confirmed_frame
    }

    pub(crate) fn last_saved_frame(&self) -> Frame {
        self.state_store.newest_frame()
    }

    pub(crate) fn increment_frame(&mut self) {
        self.current_frame += 1;
    }

    /// Puts the frame counter back after an aborted replay.
    pub(crate) fn restore_frame(&mut self, frame: Frame) {
        self.current_frame = frame;
    }

    /// Moves back to `frame` after an advance failed part way. Snapshots newer than
    /// `frame` go back to the host, and the host state is reloaded from the snapshot of
    /// `frame` when the store still has one. Returns whether a state was reloaded.
    pub(crate) fn rewind_to(
        &mut self,
        frame: Frame,
        callbacks: &mut dyn SessionCallbacks,
    ) -> Result<bool, SessionError> {
        let released = self.state_store.discard_after(frame);
        release(callbacks, released);
        self.current_frame = frame;

        let Some(snapshot) = self.state_store.get(frame) else {
            return Ok(false);
        };
        callbacks.load_game_state(&snapshot.buffer)?;
        trace!("rewound to frame {}", frame);
        Ok(true)
    }

    /// Asks the host for the state of the current frame and stores it. Buffers the store
    /// stops referencing go straight back to the host.
    pub(crate) fn save_current_state(
        &mut self,
        callbacks: &mut dyn SessionCallbacks,
    ) -> Result<u64, SessionError> {
        let frame = self.current_frame;
        let (buffer, checksum) = callbacks.save_game_state(frame)?;
        trace!("saved frame {} ({} bytes, checksum {:#018x})", frame, buffer.len(), checksum);
        let released = self.state_store.insert(Snapshot {
            frame,
            buffer,
            checksum,
        });
        release(callbacks, released);
        Ok(checksum)
    }

    /// Loads the newest snapshot at or before `frame` and moves the frame counter to it.
    /// Returns the frame that was actually loaded.
    pub(crate) fn load_frame(
        &mut self,
        frame: Frame,
        callbacks: &mut dyn SessionCallbacks,
    ) -> Result<Frame, SessionError> {
        if frame.is_null() {
            return Err(SessionError::general("cannot load the null frame"));
        }
        if frame >= self.current_frame {
            return Err(SessionError::general(format!(
                "cannot load frame {} at current frame {}",
                frame, self.current_frame
            )));
        }
        if frame.as_i32() < self.current_frame.as_i32() - self.max_prediction as i32 - 1 {
            return Err(SessionError::general(format!(
                "frame {} is outside the rollback window of current frame {}",
                frame, self.current_frame
            )));
        }

        let snapshot = self.state_store.nearest_at_or_before(frame).ok_or_else(|| {
            SessionError::general(format!("no snapshot at or before frame {}", frame))
        })?;
        callbacks.load_game_state(&snapshot.buffer)?;
        trace!("loaded frame {} (asked for {})", snapshot.frame, frame);
        self.current_frame = snapshot.frame;
        Ok(snapshot.frame)
    }

    pub(crate) fn checksum(&self, frame: Frame) -> Option<u64> {
        self.state_store.checksum(frame)
    }

    pub(crate) fn snapshot(&self, frame: Frame) -> Option<&Snapshot> {
        self.state_store.get(frame)
    }

    /// Releases every snapshot to the host.
    pub(crate) fn release_all(&mut self, callbacks: &mut dyn SessionCallbacks) {
        let released = self.state_store.clear();
        release(callbacks, released);
    }

    pub(crate) fn set_frame_delay(
        &mut self,
        player_index: usize,
        delay: usize,
    ) -> Result<(), SessionError> {
        let limit = self.input_queues.len();
        self.input_queues
            .get_mut(player_index)
            .ok_or(SessionError::PlayerOutOfRange {
                index: player_index,
                limit,
            })?
            .set_frame_delay(delay)
    }

    pub(crate) fn reset_prediction(&mut self) {
        for queue in &mut self.input_queues {
            queue.reset_prediction();
        }
    }

    /// Adds a local input for the current frame. Returns the frame it was stored at
    /// (shifted by the frame delay), or [`Frame::NULL`] if the queue dropped it.
    pub(crate) fn add_local_input(&mut self, player_index: usize, input: i64) -> Frame {
        let frame = self.current_frame;
        self.input_queues
            .get_mut(player_index)
            .map_or(Frame::NULL, |queue| {
                queue.add_input(PlayerInput::new(frame, input))
            })
    }

    /// Adds an input received from the network. It was checked on the sending side.
    pub(crate) fn add_remote_input(&mut self, player_index: usize, input: PlayerInput) -> Frame {
        match self.input_queues.get_mut(player_index) {
            Some(queue) => queue.add_input(input),
            None => {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::NetworkProtocol,
                    "remote input for unknown player index {}",
                    player_index
                );
                Frame::NULL
            },
        }
    }

    /// Merged inputs for the current frame. Disconnected players contribute the blank
    /// input from the frame after their last confirmed one.
    ///
    /// Returns `None` if a queue cannot serve the frame.
    pub(crate) fn synchronized_inputs(
        &mut self,
        connect_status: &[ConnectionStatus],
    ) -> Option<SyncedInputs> {
        let frame = self.current_frame;
        let mut inputs: SmallVec<[i64; MAX_PLAYERS]> = SmallVec::new();
        let mut predicted = PlayerSet::new();
        let mut disconnected = PlayerSet::new();

        for (index, queue) in self.input_queues.iter_mut().enumerate() {
            let status = connect_status.get(index).copied().unwrap_or_default();
            if status.disconnected && status.last_frame < frame {
                inputs.push(0);
                disconnected.insert(index);
                continue;
            }
            let (value, input_status) = queue.input(frame)?;
            if input_status == InputStatus::Predicted {
                predicted.insert(index);
            }
            inputs.push(value);
        }

        Some(SyncedInputs {
            frame,
            inputs,
            predicted,
            disconnected,
        })
    }

    /// Confirmed inputs of every player for `frame`. Disconnected players contribute the
    /// blank input.
    pub(crate) fn confirmed_inputs(
        &self,
        frame: Frame,
        connect_status: &[ConnectionStatus],
    ) -> Result<SmallVec<[i64; MAX_PLAYERS]>, SessionError> {
        let mut inputs = SmallVec::new();
        for (index, queue) in self.input_queues.iter().enumerate() {
            let status = connect_status.get(index).copied().unwrap_or_default();
            if status.disconnected && status.last_frame < frame {
                inputs.push(0);
                continue;
            }
            let confirmed = queue.confirmed_input(frame).ok_or_else(|| {
                SessionError::general(format!(
                    "no confirmed input for player {} at frame {}",
                    index, frame
                ))
            })?;
            inputs.push(confirmed.input);
        }
        Ok(inputs)
    }

    /// Confirmed input of one player, if it is still retained.
    pub(crate) fn confirmed_input(&self, player_index: usize, frame: Frame) -> Option<i64> {
        self.input_queues
            .get(player_index)?
            .confirmed_input(frame)
            .map(|input| input.input)
    }

    /// Raises the confirmed watermark and lets the queues drop inputs before it.
    pub(crate) fn set_last_confirmed_frame(&mut self, mut frame: Frame) {
        let first_incorrect = self
            .input_queues
            .iter()
            .map(InputQueue::first_incorrect_frame)
            .filter(|f| !f.is_null())
            .min()
            .unwrap_or(Frame::NULL);

        frame = std::cmp::min(frame, self.current_frame);

        if !first_incorrect.is_null() && first_incorrect < frame {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::FrameSync,
                "clamping confirmed frame {} to unresolved misprediction at {}",
                frame,
                first_incorrect
            );
            frame = first_incorrect;
        }

        self.last_confirmed_frame = frame;
        if frame.as_i32() > 0 {
            let discard = frame - 1;
            for queue in &mut self.input_queues {
                queue.discard_confirmed_frames(discard);
            }
        }
    }

    /// Earliest mispredicted frame across all queues, or `first_incorrect` if that is
    /// earlier. Returns [`Frame::NULL`] if nothing needs correcting.
    pub(crate) fn check_simulation_consistency(&self, mut first_incorrect: Frame) -> Frame {
        for queue in &self.input_queues {
            let incorrect = queue.first_incorrect_frame();
            if !incorrect.is_null() && (first_incorrect.is_null() || incorrect < first_incorrect)
            {
                first_incorrect = incorrect;
            }
        }
        first_incorrect
    }
}

fn release(callbacks: &mut dyn SessionCallbacks, buffers: Vec<SaveBuffer>) {
    for buffer in buffers {
        callbacks.free_buffer(buffer);
    }
}

impl InvariantChecker for SyncLayer {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.num_players == 0 {
            return Err(InvariantViolation::new("SyncLayer", "no players"));
        }
        if self.input_queues.len() != self.num_players {
            return Err(
                InvariantViolation::new("SyncLayer", "queue count differs from player count")
                    .with_details(format!(
                        "queues={}, players={}",
                        self.input_queues.len(),
                        self.num_players
                    )),
            );
        }
        if self.current_frame.as_i32() < 0 {
            return Err(InvariantViolation::new("SyncLayer", "negative current frame"));
        }
        if !self.last_confirmed_frame.is_null() && self.last_confirmed_frame > self.current_frame
        {
            return Err(InvariantViolation::new(
                "SyncLayer",
                "confirmed frame is ahead of the current frame",
            )
            .with_details(format!(
                "confirmed={}, current={}",
                self.last_confirmed_frame, self.current_frame
            )));
        }
        self.state_store.check_invariants()?;
        for queue in &self.input_queues {
            queue.check_invariants()?;
        }
        Ok(())
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
    use super::*;
    use crate::callbacks::CallbackError;
    use crate::input_queue::RepeatLastConfirmed;
    use crate::Event;

    /// Host whose state is just the frame it was saved at.
    #[derive(Default)]
    struct Recorder {
        saved: Vec<Frame>,
        loaded: Vec<Vec<u8>>,
        freed: usize,
    }

    impl SessionCallbacks for Recorder {
        fn begin_game(&mut self, _game: &str) -> Result<(), CallbackError> {
            Ok(())
        }
        fn advance_frame(&mut self, _inputs: &SyncedInputs, _flags: u32) -> Result<(), CallbackError> {
            Ok(())
        }
        fn save_game_state(&mut self, frame: Frame) -> Result<(SaveBuffer, u64), CallbackError> {
            self.saved.push(frame);
            let bytes = frame.as_i32().to_le_bytes().to_vec();
            Ok((SaveBuffer::from(bytes), frame.as_i32() as u64))
        }
        fn load_game_state(&mut self, buffer: &SaveBuffer) -> Result<(), CallbackError> {
            self.loaded.push(buffer.as_bytes().to_vec());
            Ok(())
        }
        fn free_buffer(&mut self, _buffer: SaveBuffer) {
            self.freed += 1;
        }
        fn on_event(&mut self, _event: &Event) -> Result<(), CallbackError> {
            Ok(())
        }
    }

    fn layer(players: usize) -> SyncLayer {
        SyncLayer::new(players, 8, Arc::new(RepeatLastConfirmed))
    }

    fn connected(players: usize) -> Vec<ConnectionStatus> {
        vec![ConnectionStatus::default(); players]
    }

    #[test]
    fn different_delays_shift_inputs() {
        let mut sync_layer = layer(2);
        sync_layer.set_frame_delay(0, 2).unwrap();
        let status = connected(2);

        for i in 0..20 {
            sync_layer.add_local_input(0, i64::from(i));
            sync_layer.add_local_input(1, i64::from(i));
            if i >= 3 {
                let synced = sync_layer.synchronized_inputs(&status).unwrap();
                assert_eq!(synced.inputs[0], i64::from(i - 2));
                assert_eq!(synced.inputs[1], i64::from(i));
                assert!(synced.predicted.is_empty());
            }
            sync_layer.increment_frame();
        }
    }

    #[test]
    fn set_frame_delay_out_of_range() {
        let mut sync_layer = layer(2);
        assert!(matches!(
            sync_layer.set_frame_delay(5, 1),
            Err(SessionError::PlayerOutOfRange { index: 5, limit: 2 })
        ));
    }

    #[test]
    fn missing_remote_input_is_predicted() {
        let mut sync_layer = layer(2);
        sync_layer.add_local_input(0, 4);
        let synced = sync_layer.synchronized_inputs(&connected(2)).unwrap();
        assert_eq!(synced.inputs.as_slice(), &[4, 0]);
        assert!(synced.predicted.contains(1));
        assert!(!synced.predicted.contains(0));
    }

    #[test]
    fn disconnected_player_contributes_blank_input() {
        let mut sync_layer = layer(2);
        let mut status = connected(2);
        status[1] = ConnectionStatus {
            disconnected: true,
            last_frame: Frame::NULL,
        };
        sync_layer.add_local_input(0, 3);
        let synced = sync_layer.synchronized_inputs(&status).unwrap();
        assert_eq!(synced.inputs.as_slice(), &[3, 0]);
        assert!(synced.disconnected.contains(1));
        assert!(synced.predicted.is_empty());

        let confirmed = sync_layer.confirmed_inputs(Frame::new(0), &status).unwrap();
        assert_eq!(confirmed.as_slice(), &[3, 0]);
    }

    #[test]
    fn save_and_load_round_trip_through_callbacks() {
        let mut host = Recorder::default();
        let mut sync_layer = layer(1);
        for _ in 0..4 {
            sync_layer.save_current_state(&mut host).unwrap();
            sync_layer.increment_frame();
        }
        assert_eq!(host.saved.len(), 4);
        assert_eq!(sync_layer.load_frame(Frame::new(1), &mut host), Ok(Frame::new(1)));
        assert_eq!(sync_layer.current_frame(), Frame::new(1));
        assert_eq!(host.loaded, vec![1i32.to_le_bytes().to_vec()]);
    }

    #[test]
    fn rewind_frees_newer_snapshots_and_reloads() {
        let mut host = Recorder::default();
        let mut sync_layer = layer(1);
        for _ in 0..3 {
            sync_layer.save_current_state(&mut host).unwrap();
            sync_layer.increment_frame();
        }
        sync_layer.save_current_state(&mut host).unwrap();

        assert_eq!(sync_layer.rewind_to(Frame::new(2), &mut host), Ok(true));
        assert_eq!(sync_layer.current_frame(), Frame::new(2));
        assert_eq!(sync_layer.last_saved_frame(), Frame::new(2));
        assert_eq!(host.freed, 1);
        assert_eq!(host.loaded, vec![2i32.to_le_bytes().to_vec()]);
        assert!(sync_layer.check_invariants().is_ok());
    }

    #[test]
    fn rewind_without_snapshot_only_moves_the_counter() {
        let mut host = Recorder::default();
        let mut sync_layer = layer(1);
        sync_layer.save_current_state(&mut host).unwrap();
        sync_layer.increment_frame();
        sync_layer.increment_frame();

        assert_eq!(sync_layer.rewind_to(Frame::new(1), &mut host), Ok(false));
        assert_eq!(sync_layer.current_frame(), Frame::new(1));
        assert!(host.loaded.is_empty());
        assert_eq!(host.freed, 0);
    }

    #[test]
    fn load_frame_rejects_bad_frames() {
        let mut host = Recorder::default();
        let mut sync_layer = layer(1);
        sync_layer.save_current_state(&mut host).unwrap();
        assert!(sync_layer.load_frame(Frame::NULL, &mut host).is_err());
        assert!(sync_layer.load_frame(Frame::new(0), &mut host).is_err());
        for _ in 0..20 {
            sync_layer.increment_frame();
        }
        assert!(sync_layer.load_frame(Frame::new(0), &mut host).is_err());
    }

    #[test]
    fn store_window_frees_old_buffers() {
        let mut host = Recorder::default();
        let mut sync_layer = layer(1);
        for _ in 0..20 {
            sync_layer.save_current_state(&mut host).unwrap();
            sync_layer.increment_frame();
        }
        // window is max_prediction + 2
        assert_eq!(host.freed, 20 - 10);
        sync_layer.release_all(&mut host);
        assert_eq!(host.freed, 20);
    }

    #[test]
    fn set_last_confirmed_frame_clamps_to_current() {
        let mut sync_layer = layer(1);
        sync_layer.add_local_input(0, 1);
        sync_layer.increment_frame();
        sync_layer.set_last_confirmed_frame(Frame::new(10));
        assert_eq!(sync_layer.last_confirmed_frame(), Frame::new(1));
        assert!(sync_layer.check_invariants().is_ok());
    }

    #[test]
    fn consistency_reports_earliest_misprediction() {
        let mut sync_layer = layer(2);
        let status = connected(2);
        for f in 0..4 {
            sync_layer.add_local_input(0, 0);
            sync_layer.synchronized_inputs(&status).unwrap();
            if f < 3 {
                sync_layer.increment_frame();
            }
        }
        assert!(sync_layer.check_simulation_consistency(Frame::NULL).is_null());

        sync_layer.add_remote_input(1, PlayerInput::new(Frame::new(0), 0));
        sync_layer.add_remote_input(1, PlayerInput::new(Frame::new(1), 5));
        assert_eq!(sync_layer.check_simulation_consistency(Frame::NULL), Frame::new(1));
        assert_eq!(sync_layer.check_simulation_consistency(Frame::new(0)), Frame::new(0));
        assert_eq!(sync_layer.confirmed_input(1, Frame::new(1)), Some(5));
    }
}
