//! Fixed-width records of one frame's inputs.

use smallvec::SmallVec;

use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{Frame, MAX_PLAYERS};

const INPUT_SIZE: usize = std::mem::size_of::<i64>();

/// The inputs of every player an endpoint speaks for, little endian, in player order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct InputBytes {
    pub frame: Frame,
    pub bytes: Vec<u8>,
}

impl InputBytes {
    /// Blank record of `num_players` inputs, used as the first delta reference.
    pub fn zeroed(num_players: usize) -> Self {
        Self {
            frame: Frame::NULL,
            bytes: vec![0; num_players * INPUT_SIZE],
        }
    }

    pub fn from_inputs(frame: Frame, inputs: &[i64]) -> Self {
        Self {
            frame,
            bytes: inputs.iter().flat_map(|input| input.to_le_bytes()).collect(),
        }
    }

    /// Splits the record back into inputs. `None` if it does not hold exactly
    /// `num_players` inputs.
    pub fn to_inputs(&self, num_players: usize) -> Option<SmallVec<[i64; MAX_PLAYERS]>> {
        if self.bytes.len() != num_players * INPUT_SIZE {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::NetworkProtocol,
                "input record for frame {} has {} bytes, expected {} players",
                self.frame,
                self.bytes.len(),
                num_players
            );
            return None;
        }
        Some(
            self.bytes
                .chunks_exact(INPUT_SIZE)
                .map(|chunk| {
                    let mut raw = [0u8; INPUT_SIZE];
                    raw.copy_from_slice(chunk);
                    i64::from_le_bytes(raw)
                })
                .collect(),
        )
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

    #[test]
    fn zeroed_has_one_slot_per_player() {
        let record = InputBytes::zeroed(3);
        assert_eq!(record.bytes.len(), 24);
        assert!(record.frame.is_null());
        assert_eq!(record.to_inputs(3).unwrap().as_slice(), &[0, 0, 0]);
    }

    #[test]
    fn inputs_keep_their_order() {
        let record = InputBytes::from_inputs(Frame::new(4), &[-2, 0, i64::MAX]);
        assert_eq!(record.frame, Frame::new(4));
        assert_eq!(record.to_inputs(3).unwrap().as_slice(), &[-2, 0, i64::MAX]);
    }

    #[test]
    fn wrong_player_count_is_rejected() {
        let record = InputBytes::from_inputs(Frame::new(0), &[1, 2]);
        assert!(record.to_inputs(3).is_none());
        assert!(record.to_inputs(0).is_none());
    }
}
