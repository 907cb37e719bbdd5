//! Per-player input ring.
//!
//! Every player has one [`InputQueue`]. Entries are appended in frame order once they
//! are confirmed (authored locally or received from a peer) and are never overwritten.
//! Frames that are requested before their input exists are served from a prediction;
//! when the real input later arrives it is compared against that prediction, and the
//! first mismatch is remembered as the divergence point for the rollback controller.

mod prediction;

use std::cmp;
use std::sync::Arc;

pub use prediction::{BlankPrediction, PredictionStrategy, RepeatLastConfirmed};

use crate::frame_info::PlayerInput;
use crate::report_violation;
use crate::telemetry::{InvariantChecker, InvariantViolation, ViolationKind, ViolationSeverity};
use crate::{Frame, InputStatus, SessionError};

/// Capacity of every input ring.
pub const INPUT_QUEUE_LENGTH: usize = 128;

/// Largest frame delay a queue can hold.
pub const MAX_FRAME_DELAY: usize = INPUT_QUEUE_LENGTH - 1;

#[derive(Debug, Clone)]
pub(crate) struct InputQueue {
    /// Position where the next input is written.
    head: usize,
    /// Position of the oldest retained input.
    tail: usize,
    length: usize,
    first_frame: bool,

    last_added_frame: Frame,
    first_incorrect_frame: Frame,
    last_requested_frame: Frame,

    frame_delay: usize,
    player_index: usize,

    inputs: Vec<PlayerInput>,
    prediction: PlayerInput,
    last_confirmed_input: Option<i64>,
    strategy: Arc<dyn PredictionStrategy>,
}

impl InputQueue {
    pub(crate) fn new(player_index: usize, strategy: Arc<dyn PredictionStrategy>) -> Self {
        Self {
            head: 0,
            tail: 0,
            length: 0,
            first_frame: true,
            last_added_frame: Frame::NULL,
            first_incorrect_frame: Frame::NULL,
            last_requested_frame: Frame::NULL,
            frame_delay: 0,
            player_index,
            inputs: vec![PlayerInput::blank_input(Frame::NULL); INPUT_QUEUE_LENGTH],
            prediction: PlayerInput::blank_input(Frame::NULL),
            last_confirmed_input: None,
            strategy,
        }
    }

    pub(crate) fn first_incorrect_frame(&self) -> Frame {
        self.first_incorrect_frame
    }

    pub(crate) fn last_added_frame(&self) -> Frame {
        self.last_added_frame
    }

    pub(crate) fn set_frame_delay(&mut self, delay: usize) -> Result<(), SessionError> {
        if delay > MAX_FRAME_DELAY {
            return Err(SessionError::invalid_request(format!(
                "frame delay {} exceeds the maximum of {}",
                delay, MAX_FRAME_DELAY
            )));
        }
        self.frame_delay = delay;
        Ok(())
    }

    /// Leaves prediction mode. Called right after a rollback reloads an older state.
    pub(crate) fn reset_prediction(&mut self) {
        self.prediction.frame = Frame::NULL;
        self.first_incorrect_frame = Frame::NULL;
        self.last_requested_frame = Frame::NULL;
    }

    /// Returns the confirmed input for `requested_frame`, if it is still retained.
    pub(crate) fn confirmed_input(&self, requested_frame: Frame) -> Option<PlayerInput> {
        if requested_frame.is_null() || requested_frame > self.last_added_frame {
            return None;
        }
        let offset = requested_frame.as_i32() as usize % INPUT_QUEUE_LENGTH;
        let stored = self.inputs[offset];
        (stored.frame == requested_frame).then_some(stored)
    }

    /// Drops retained inputs up to (excluding) `frame`. The most recent input is always kept.
    pub(crate) fn discard_confirmed_frames(&mut self, mut frame: Frame) {
        // keep everything a pending prediction may still be checked against
        if !self.last_requested_frame.is_null() {
            frame = cmp::min(frame, self.last_requested_frame);
        }

        if self.length == 0 {
            return;
        }

        if frame >= self.last_added_frame {
            self.tail = if self.head == 0 {
                INPUT_QUEUE_LENGTH - 1
            } else {
                self.head - 1
            };
            self.length = 1;
        } else if frame > self.inputs[self.tail].frame {
            let offset = (frame - self.inputs[self.tail].frame) as usize;
            self.tail = (self.tail + offset) % INPUT_QUEUE_LENGTH;
            self.length -= offset;
        }
    }

    /// Returns the input for `requested_frame`: the confirmed value when known, otherwise
    /// a prediction. Returns `None` while an unresolved misprediction exists or when the
    /// frame has already been discarded.
    pub(crate) fn input(&mut self, requested_frame: Frame) -> Option<(i64, InputStatus)> {
        // never extend a path already known to be wrong
        if !self.first_incorrect_frame.is_null() {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::InputQueue,
                "player {} asked for frame {} while frame {} is known to be mispredicted",
                self.player_index,
                requested_frame,
                self.first_incorrect_frame
            );
            return None;
        }

        self.last_requested_frame = requested_frame;

        if self.length > 0 && requested_frame < self.inputs[self.tail].frame {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::InputQueue,
                "requested frame {} is older than the oldest retained frame {}",
                requested_frame,
                self.inputs[self.tail].frame
            );
            return None;
        }

        if self.prediction.frame.is_null() {
            if self.length > 0 {
                let offset = (requested_frame - self.inputs[self.tail].frame) as usize;
                if offset < self.length {
                    let position = (offset + self.tail) % INPUT_QUEUE_LENGTH;
                    let stored = self.inputs[position];
                    if stored.frame != requested_frame {
                        report_violation!(
                            ViolationSeverity::Critical,
                            ViolationKind::InputQueue,
                            "ring index mismatch: wanted frame {}, found frame {}",
                            requested_frame,
                            stored.frame
                        );
                        return None;
                    }
                    return Some((stored.input, InputStatus::Confirmed));
                }
            }

            let predicted = self.strategy.predict(
                requested_frame,
                self.last_confirmed_input,
                self.player_index,
            );
            self.prediction = PlayerInput::new(requested_frame, predicted);
        }

        Some((self.prediction.input, InputStatus::Predicted))
    }

    /// Appends a confirmed input. The frame must directly follow the previously added one
    /// (before delay is applied). Returns the frame the input was stored at, or
    /// [`Frame::NULL`] if it was dropped.
    pub(crate) fn add_input(&mut self, input: PlayerInput) -> Frame {
        if !self.last_added_frame.is_null()
            && input.frame + self.frame_delay as i32 != self.last_added_frame + 1
        {
            return Frame::NULL;
        }

        let new_frame = self.advance_queue_head(input.frame);
        if !new_frame.is_null() && !self.add_input_by_frame(input, new_frame) {
            return Frame::NULL;
        }
        new_frame
    }

    fn previous_position(&self) -> usize {
        match self.head {
            0 => INPUT_QUEUE_LENGTH - 1,
            _ => self.head - 1,
        }
    }

    fn add_input_by_frame(&mut self, input: PlayerInput, frame_number: Frame) -> bool {
        if !self.last_added_frame.is_null() && frame_number != self.last_added_frame + 1 {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::InputQueue,
                "input frame {} does not follow last added frame {}",
                frame_number,
                self.last_added_frame
            );
            return false;
        }

        if self.length == INPUT_QUEUE_LENGTH {
            report_violation!(
                ViolationSeverity::Critical,
                ViolationKind::InputQueue,
                "input ring of player {} is full at frame {}",
                self.player_index,
                frame_number
            );
            return false;
        }

        self.inputs[self.head] = PlayerInput::new(frame_number, input.input);
        self.head = (self.head + 1) % INPUT_QUEUE_LENGTH;
        self.length += 1;
        self.first_frame = false;
        self.last_added_frame = frame_number;
        self.last_confirmed_input = Some(input.input);

        if !self.prediction.frame.is_null() {
            if frame_number != self.prediction.frame {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::InputQueue,
                    "confirmed frame {} does not line up with prediction frame {}",
                    frame_number,
                    self.prediction.frame
                );
                return false;
            }

            if self.first_incorrect_frame.is_null() && !self.prediction.equal(&input, true) {
                self.first_incorrect_frame = frame_number;
            }

            // the prediction held up to the newest requested frame
            if self.prediction.frame == self.last_requested_frame
                && self.first_incorrect_frame.is_null()
            {
                self.prediction.frame = Frame::NULL;
            } else {
                self.prediction.frame += 1;
            }
        }

        true
    }

    fn advance_queue_head(&mut self, input_frame: Frame) -> Frame {
        let mut expected_frame = if self.first_frame {
            Frame::new(0)
        } else {
            self.inputs[self.previous_position()].frame + 1
        };

        let input_frame = input_frame + self.frame_delay as i32;

        // frame delay shrank; this frame is already covered
        if expected_frame > input_frame {
            return Frame::NULL;
        }

        // frame delay grew; fill the gap with copies of the previous input
        while expected_frame < input_frame {
            let replicated = self.inputs[self.previous_position()];
            if !self.add_input_by_frame(replicated, expected_frame) {
                return Frame::NULL;
            }
            expected_frame += 1;
        }

        input_frame
    }
}

impl InvariantChecker for InputQueue {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.length > INPUT_QUEUE_LENGTH {
            return Err(
                InvariantViolation::new("InputQueue", "length exceeds capacity")
                    .with_details(format!("length={}", self.length)),
            );
        }

        if self.head >= INPUT_QUEUE_LENGTH || self.tail >= INPUT_QUEUE_LENGTH {
            return Err(
                InvariantViolation::new("InputQueue", "head or tail out of bounds")
                    .with_details(format!("head={}, tail={}", self.head, self.tail)),
            );
        }

        let distance = (self.head + INPUT_QUEUE_LENGTH - self.tail) % INPUT_QUEUE_LENGTH;
        let consistent = if distance == 0 {
            self.length == 0 || self.length == INPUT_QUEUE_LENGTH
        } else {
            self.length == distance
        };
        if !consistent {
            return Err(InvariantViolation::new(
                "InputQueue",
                "length does not match head/tail positions",
            )
            .with_details(format!(
                "length={}, head={}, tail={}",
                self.length, self.head, self.tail
            )));
        }

        if !self.first_incorrect_frame.is_null() && self.prediction.frame.is_null() {
            return Err(InvariantViolation::new(
                "InputQueue",
                "misprediction recorded outside prediction mode",
            ));
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

    fn queue() -> InputQueue {
        InputQueue::new(0, Arc::new(RepeatLastConfirmed))
    }

    fn add(queue: &mut InputQueue, frame: i32, input: i64) -> Frame {
        queue.add_input(PlayerInput::new(Frame::new(frame), input))
    }

    #[test]
    fn add_input_wrong_frame_is_dropped() {
        let mut queue = queue();
        assert_eq!(add(&mut queue, 0, 0), Frame::new(0));
        assert_eq!(add(&mut queue, 3, 0), Frame::NULL);
    }

    #[test]
    fn add_input_twice_is_dropped() {
        let mut queue = queue();
        assert_eq!(add(&mut queue, 0, 1), Frame::new(0));
        assert_eq!(add(&mut queue, 0, 1), Frame::NULL);
    }

    #[test]
    fn inputs_come_back_confirmed() {
        let mut queue = queue();
        for i in 0..10 {
            add(&mut queue, i, i64::from(i) * 3);
            assert_eq!(queue.last_added_frame(), Frame::new(i));
            assert_eq!(
                queue.input(Frame::new(i)),
                Some((i64::from(i) * 3, InputStatus::Confirmed))
            );
        }
        assert!(queue.check_invariants().is_ok());
    }

    #[test]
    fn delayed_inputs_are_shifted_and_gap_filled() {
        let mut queue = queue();
        queue.set_frame_delay(2).unwrap();
        for i in 0..10 {
            add(&mut queue, i, i64::from(i) + 100);
            assert_eq!(queue.last_added_frame(), Frame::new(i + 2));
            let (value, status) = queue.input(Frame::new(i)).unwrap();
            assert_eq!(status, InputStatus::Confirmed);
            let expected = if i < 2 { 100 } else { i64::from(i - 2) + 100 };
            assert_eq!(value, expected);
        }
    }

    #[test]
    fn shrinking_delay_drops_overlapping_input() {
        let mut queue = queue();
        queue.set_frame_delay(2).unwrap();
        add(&mut queue, 0, 1);
        queue.set_frame_delay(0).unwrap();
        assert_eq!(add(&mut queue, 1, 1), Frame::NULL);
    }

    #[test]
    fn delay_beyond_capacity_is_rejected() {
        let mut queue = queue();
        assert!(queue.set_frame_delay(MAX_FRAME_DELAY + 1).is_err());
        assert_eq!(queue.frame_delay, 0);
    }

    #[test]
    fn missing_frame_is_predicted_from_last_confirmed() {
        let mut queue = queue();
        add(&mut queue, 0, 7);
        assert_eq!(queue.input(Frame::new(1)), Some((7, InputStatus::Predicted)));
        assert_eq!(queue.input(Frame::new(2)), Some((7, InputStatus::Predicted)));
        assert_eq!(queue.prediction.frame, Frame::new(1));
        assert!(queue.confirmed_input(Frame::new(2)).is_none());
    }

    #[test]
    fn correct_prediction_leaves_prediction_mode() {
        let mut queue = queue();
        add(&mut queue, 0, 7);
        queue.input(Frame::new(1));
        queue.input(Frame::new(2));
        add(&mut queue, 1, 7);
        add(&mut queue, 2, 7);
        assert!(queue.first_incorrect_frame().is_null());
        assert_eq!(queue.confirmed_input(Frame::new(2)).map(|i| i.input), Some(7));
        assert_eq!(queue.input(Frame::new(3)), Some((7, InputStatus::Predicted)));
    }

    #[test]
    fn wrong_prediction_marks_divergence_point() {
        let mut queue = queue();
        add(&mut queue, 0, 7);
        for f in 1..=4 {
            queue.input(Frame::new(f));
        }
        add(&mut queue, 1, 7);
        add(&mut queue, 2, 9);
        add(&mut queue, 3, 9);
        assert_eq!(queue.first_incorrect_frame(), Frame::new(2));
        // no more input may be served until the rollback resets prediction
        assert_eq!(queue.input(Frame::new(5)), None);

        queue.reset_prediction();
        assert!(queue.first_incorrect_frame().is_null());
        assert_eq!(queue.input(Frame::new(2)), Some((9, InputStatus::Confirmed)));
        assert_eq!(queue.input(Frame::new(4)), Some((9, InputStatus::Predicted)));
    }

    #[test]
    fn blank_prediction_strategy_is_used() {
        let mut queue = InputQueue::new(1, Arc::new(BlankPrediction));
        add(&mut queue, 0, 5);
        assert_eq!(queue.input(Frame::new(1)), Some((0, InputStatus::Predicted)));
    }

    #[test]
    fn confirmed_input_lookup() {
        let mut queue = queue();
        for i in 0..5 {
            add(&mut queue, i, i64::from(i) * 10);
        }
        assert_eq!(queue.confirmed_input(Frame::new(2)).unwrap().input, 20);
        assert!(queue.confirmed_input(Frame::new(10)).is_none());
        assert!(queue.confirmed_input(Frame::NULL).is_none());
    }

    #[test]
    fn discard_keeps_requested_and_newest_frames() {
        let mut queue = queue();
        for i in 0..10 {
            add(&mut queue, i, i64::from(i));
        }
        queue.discard_confirmed_frames(Frame::new(5));
        assert!(queue.confirmed_input(Frame::new(5)).is_some());
        assert!(queue.check_invariants().is_ok());

        queue.discard_confirmed_frames(Frame::new(100));
        assert_eq!(queue.input(Frame::new(9)), Some((9, InputStatus::Confirmed)));
        assert!(queue.check_invariants().is_ok());
    }

    #[test]
    fn ring_wraps_around_with_discards() {
        let mut queue = queue();
        for i in 0..(INPUT_QUEUE_LENGTH as i32 * 3) {
            assert_eq!(add(&mut queue, i, i64::from(i)), Frame::new(i));
            assert_eq!(
                queue.input(Frame::new(i)),
                Some((i64::from(i), InputStatus::Confirmed))
            );
            queue.discard_confirmed_frames(Frame::new(i - 4));
            assert!(queue.check_invariants().is_ok());
        }
    }

    #[test]
    fn full_ring_refuses_more_input() {
        let mut queue = queue();
        for i in 0..INPUT_QUEUE_LENGTH as i32 {
            assert_eq!(add(&mut queue, i, 1), Frame::new(i));
        }
        assert_eq!(add(&mut queue, INPUT_QUEUE_LENGTH as i32, 1), Frame::NULL);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn confirmed_inputs_are_never_rewritten(inputs in proptest::collection::vec(any::<i64>(), 1..100)) {
                let mut queue = queue();
                for (i, value) in inputs.iter().enumerate() {
                    prop_assert_eq!(add(&mut queue, i as i32, *value), Frame::new(i as i32));
                }
                for (i, value) in inputs.iter().enumerate() {
                    prop_assert_eq!(queue.confirmed_input(Frame::new(i as i32)).map(|p| p.input), Some(*value));
                }
            }

            #[test]
            fn matching_input_never_flags_divergence(value in any::<i64>(), ahead in 1i32..8) {
                let mut queue = queue();
                add(&mut queue, 0, value);
                for f in 1..=ahead {
                    queue.input(Frame::new(f));
                }
                for f in 1..=ahead {
                    add(&mut queue, f, value);
                }
                prop_assert!(queue.first_incorrect_frame().is_null());
            }
        }
    }
}
