//! Rollback controller.
//!
//! When a confirmed input contradicts the prediction a frame was simulated with, the
//! controller loads the newest snapshot at or before that frame and re-simulates up to
//! the frame the session was at, re-saving every frame on the way. The host's
//! `advance_frame` callback receives the corrected inputs of each replayed frame.

use tracing::debug;

use crate::callbacks::SessionCallbacks;
use crate::network::messages::ConnectionStatus;
use crate::report_violation;
use crate::sync_layer::SyncLayer;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{Frame, SessionError};

#[derive(Debug, Default)]
pub(crate) struct RollbackController {
    active: bool,
    /// Divergence point of a replay that failed; retried on the next advance.
    pending: Option<Frame>,
    rollbacks: u64,
    frames_replayed: u64,
}

impl RollbackController {
    pub(crate) fn in_rollback(&self) -> bool {
        self.active
    }

    pub(crate) fn pending(&self) -> Frame {
        self.pending.unwrap_or(Frame::NULL)
    }

    pub(crate) fn rollbacks(&self) -> u64 {
        self.rollbacks
    }

    pub(crate) fn frames_replayed(&self) -> u64 {
        self.frames_replayed
    }

    /// Corrects the simulation from `first_incorrect` up to the current frame.
    ///
    /// On failure the frame counter is restored and the divergence point is kept, so
    /// nothing already confirmed is touched and the next call tries again.
    pub(crate) fn roll_back(
        &mut self,
        sync_layer: &mut SyncLayer,
        connect_status: &[ConnectionStatus],
        first_incorrect: Frame,
        callbacks: &mut dyn SessionCallbacks,
    ) -> Result<usize, SessionError> {
        let current = sync_layer.current_frame();

        // misprediction at or after the current frame; nothing was simulated with it
        if first_incorrect >= current {
            sync_layer.reset_prediction();
            self.pending = None;
            return Ok(0);
        }

        debug!(
            "rolling back from frame {} to frame {}",
            current, first_incorrect
        );

        self.active = true;
        let result = self.replay(sync_layer, connect_status, first_incorrect, callbacks, |_, _| {
            Ok(())
        });
        self.active = false;

        match result {
            Ok(count) => {
                self.pending = None;
                self.rollbacks += 1;
                Ok(count)
            },
            Err(err) => {
                sync_layer.restore_frame(current);
                self.pending = Some(
                    self.pending
                        .map_or(first_incorrect, |p| std::cmp::min(p, first_incorrect)),
                );
                Err(err)
            },
        }
    }

    /// Loads the snapshot at or before `from`, then advances back to the current frame.
    /// `after_save` sees every re-saved frame with its new checksum.
    pub(crate) fn replay<F>(
        &mut self,
        sync_layer: &mut SyncLayer,
        connect_status: &[ConnectionStatus],
        from: Frame,
        callbacks: &mut dyn SessionCallbacks,
        mut after_save: F,
    ) -> Result<usize, SessionError>
    where
        F: FnMut(Frame, u64) -> Result<(), SessionError>,
    {
        let target = sync_layer.current_frame();
        let loaded = sync_layer.load_frame(from, callbacks)?;
        sync_layer.reset_prediction();

        let count = (target - loaded) as usize;
        for _ in 0..count {
            let inputs = sync_layer
                .synchronized_inputs(connect_status)
                .ok_or_else(|| {
                    SessionError::general(format!(
                        "no inputs for replayed frame {}",
                        sync_layer.current_frame()
                    ))
                })?;
            callbacks.advance_frame(&inputs, 0)?;
            sync_layer.increment_frame();
            self.frames_replayed += 1;
            let checksum = sync_layer.save_current_state(callbacks)?;
            after_save(sync_layer.current_frame(), checksum)?;
        }

        if sync_layer.current_frame() != target {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::FrameSync,
                "replay ended at frame {} instead of {}",
                sync_layer.current_frame(),
                target
            );
        }
        Ok(count)
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
    use std::sync::Arc;

    use super::*;
    use crate::callbacks::{CallbackError, SaveBuffer};
    use crate::frame_info::PlayerInput;
    use crate::input_queue::RepeatLastConfirmed;
    use crate::{Event, SyncedInputs};

    /// Sums every input it is given. The state is the running sum.
    #[derive(Default)]
    struct Summer {
        sum: i64,
        replayed: Vec<Frame>,
        fail_advance: bool,
    }

    impl SessionCallbacks for Summer {
        fn begin_game(&mut self, _game: &str) -> Result<(), CallbackError> {
            Ok(())
        }
        fn advance_frame(&mut self, inputs: &SyncedInputs, _flags: u32) -> Result<(), CallbackError> {
            if self.fail_advance {
                return Err(CallbackError::new("boom"));
            }
            self.replayed.push(inputs.frame);
            self.sum += inputs.inputs.iter().sum::<i64>();
            Ok(())
        }
        fn save_game_state(&mut self, _frame: Frame) -> Result<(SaveBuffer, u64), CallbackError> {
            Ok((SaveBuffer::from(self.sum.to_le_bytes().to_vec()), self.sum as u64))
        }
        fn load_game_state(&mut self, buffer: &SaveBuffer) -> Result<(), CallbackError> {
            let bytes: [u8; 8] = buffer.as_bytes().try_into().unwrap();
            self.sum = i64::from_le_bytes(bytes);
            Ok(())
        }
        fn on_event(&mut self, _event: &Event) -> Result<(), CallbackError> {
            Ok(())
        }
    }

    /// Runs `frames` frames with local input 1 and an unknown remote player.
    fn run_predicted(host: &mut Summer, frames: i32) -> (SyncLayer, Vec<ConnectionStatus>) {
        let mut sync_layer = SyncLayer::new(2, 8, Arc::new(RepeatLastConfirmed));
        let status = vec![ConnectionStatus::default(); 2];
        sync_layer.save_current_state(host).unwrap();
        for _ in 0..frames {
            sync_layer.add_local_input(0, 1);
            let inputs = sync_layer.synchronized_inputs(&status).unwrap();
            host.sum += inputs.inputs.iter().sum::<i64>();
            sync_layer.increment_frame();
            sync_layer.save_current_state(host).unwrap();
        }
        (sync_layer, status)
    }

    #[test]
    fn corrected_inputs_are_replayed() {
        let mut host = Summer::default();
        let (mut sync_layer, status) = run_predicted(&mut host, 4);
        assert_eq!(host.sum, 4);

        for f in 0..4 {
            sync_layer.add_remote_input(1, PlayerInput::new(Frame::new(f), 10));
        }
        let first_incorrect = sync_layer.check_simulation_consistency(Frame::NULL);
        assert_eq!(first_incorrect, Frame::new(0));

        let mut controller = RollbackController::default();
        let replayed = controller
            .roll_back(&mut sync_layer, &status, first_incorrect, &mut host)
            .unwrap();
        assert_eq!(replayed, 4);
        assert_eq!(host.sum, 44);
        assert_eq!(host.replayed, (0..4).map(Frame::new).collect::<Vec<_>>());
        assert_eq!(sync_layer.current_frame(), Frame::new(4));
        assert_eq!(sync_layer.checksum(Frame::new(4)), Some(44));
        assert!(!controller.in_rollback());
        assert_eq!(controller.rollbacks(), 1);
        assert_eq!(controller.frames_replayed(), 4);
    }

    #[test]
    fn failed_replay_keeps_divergence_point() {
        let mut host = Summer::default();
        let (mut sync_layer, status) = run_predicted(&mut host, 3);
        sync_layer.add_remote_input(1, PlayerInput::new(Frame::new(0), 0));
        sync_layer.add_remote_input(1, PlayerInput::new(Frame::new(1), 7));

        host.fail_advance = true;
        let mut controller = RollbackController::default();
        let err = controller
            .roll_back(&mut sync_layer, &status, Frame::new(1), &mut host)
            .unwrap_err();
        assert!(matches!(err, SessionError::GeneralFailure { .. }));
        assert_eq!(sync_layer.current_frame(), Frame::new(3));
        assert_eq!(controller.pending(), Frame::new(1));

        host.fail_advance = false;
        controller
            .roll_back(&mut sync_layer, &status, controller.pending(), &mut host)
            .unwrap();
        assert!(controller.pending().is_null());
        // frame 2 still predicts the last confirmed remote input
        assert_eq!(host.sum, 1 + 8 + 8);
    }

    #[test]
    fn misprediction_at_current_frame_only_resets() {
        let mut host = Summer::default();
        let (mut sync_layer, status) = run_predicted(&mut host, 2);
        let mut controller = RollbackController::default();
        let replayed = controller
            .roll_back(&mut sync_layer, &status, Frame::new(2), &mut host)
            .unwrap();
        assert_eq!(replayed, 0);
        assert!(host.replayed.is_empty());
    }
}
