use crate::Frame;

/// Represents an input for a single player in a single frame. The associated frame is
/// denoted with `frame`; [`Frame::NULL`] represents an unset slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PlayerInput {
    /// The frame to which this input belongs.
    pub frame: Frame,
    /// The input value given by the host.
    pub input: i64,
}

impl PlayerInput {
    /// Creates a new `PlayerInput` with the given frame and input.
    #[must_use]
    pub const fn new(frame: Frame, input: i64) -> Self {
        Self { frame, input }
    }

    /// Creates the blank input used for disconnected players and unset slots.
    #[must_use]
    pub const fn blank_input(frame: Frame) -> Self {
        Self { frame, input: 0 }
    }

    pub(crate) fn equal(&self, other: &Self, input_only: bool) -> bool {
        (input_only || self.frame == other.frame) && self.input == other.input
    }
}

impl Default for PlayerInput {
    fn default() -> Self {
        Self::blank_input(Frame::NULL)
    }
}

// #########
// # TESTS #
// #########
