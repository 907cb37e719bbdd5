//! Input prediction strategies.
//!
//! When a frame has to be simulated before a remote player's input for it arrived, the
//! input queue asks a [`PredictionStrategy`] for a stand-in value. Every peer must
//! predict the same value from the same arguments, or replays diverge.

use std::fmt::Debug;

use crate::Frame;

/// Produces a stand-in input for a frame whose real input has not arrived.
///
/// Implementations must be deterministic: the same arguments always yield the same
/// value on every peer.
pub trait PredictionStrategy: Debug + Send + Sync {
    /// Predicts the input of `player_index` for `frame`.
    ///
    /// `last_confirmed_input` is the newest confirmed input of that player, or `None`
    /// before any input was confirmed.
    fn predict(&self, frame: Frame, last_confirmed_input: Option<i64>, player_index: usize) -> i64;
}

/// Repeats the last confirmed input. Human-driven controls tend to stay the same from
/// one frame to the next, so this is the default.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RepeatLastConfirmed;

impl PredictionStrategy for RepeatLastConfirmed {
    fn predict(&self, _frame: Frame, last_confirmed_input: Option<i64>, _player_index: usize) -> i64 {
        last_confirmed_input.unwrap_or_default()
    }
}

/// Always predicts the blank input (`0`).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlankPrediction;

impl PredictionStrategy for BlankPrediction {
    fn predict(&self, _frame: Frame, _last_confirmed: Option<i64>, _player_index: usize) -> i64 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeat_last_confirmed_uses_last_input() {
        let strategy = RepeatLastConfirmed;
        assert_eq!(strategy.predict(Frame::new(5), Some(42), 0), 42);
    }

    #[test]
    fn repeat_last_confirmed_defaults_to_blank() {
        assert_eq!(RepeatLastConfirmed.predict(Frame::new(0), None, 1), 0);
    }

    #[test]
    fn blank_prediction_ignores_history() {
        assert_eq!(BlankPrediction.predict(Frame::new(9), Some(-7), 3), 0);
    }

    #[test]
    fn strategies_work_as_trait_objects() {
        let strategies: [&dyn PredictionStrategy; 2] = [&RepeatLastConfirmed, &BlankPrediction];
        let predicted: Vec<i64> = strategies
            .iter()
            .map(|s| s.predict(Frame::new(1), Some(3), 0))
            .collect();
        assert_eq!(predicted, vec![3, 0]);
    }
}
