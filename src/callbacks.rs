//! The contract between a session and the host simulation.
//!
//! The host implements [`SessionCallbacks`] once per session. The session calls into it
//! to capture and restore simulation state, to re-simulate frames while rolling back,
//! and to report [`Event`]s. Ownership of saved state moves into the session as a
//! [`SaveBuffer`] and comes back out through [`SessionCallbacks::free_buffer`] exactly
//! once, when the snapshot holding it is evicted.

use std::fmt;

use crate::{Event, Frame, SyncedInputs};

/// An owned, opaque serialized simulation state.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SaveBuffer(Box<[u8]>);

impl SaveBuffer {
    /// Wraps serialized bytes.
    #[must_use]
    pub fn new(bytes: impl Into<Box<[u8]>>) -> Self {
        Self(bytes.into())
    }

    /// The serialized bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the buffer holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Gives the bytes back to the caller.
    #[must_use]
    pub fn into_vec(self) -> Vec<u8> {
        self.0.into_vec()
    }
}

impl From<Vec<u8>> for SaveBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl AsRef<[u8]> for SaveBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SaveBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaveBuffer")
            .field("len", &self.0.len())
            .finish()
    }
}

/// Failure reported by a host callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackError {
    reason: String,
}

impl CallbackError {
    /// Creates an error with a human-readable reason.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// The reason given by the host.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl fmt::Display for CallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host callback failed: {}", self.reason)
    }
}

impl std::error::Error for CallbackError {}

/// Host simulation hooks driven by a session.
///
/// None of these may call back into the session; everything the host needs is passed
/// in as an argument.
pub trait SessionCallbacks {
    /// One-time setup, called when the session starts.
    fn begin_game(&mut self, game: &str) -> Result<(), CallbackError>;

    /// Simulates one frame with `inputs`. Only called while replaying frames.
    /// `flags` is reserved and always `0`.
    fn advance_frame(&mut self, inputs: &SyncedInputs, flags: u32) -> Result<(), CallbackError>;

    /// Captures the current simulation state, which corresponds to `frame`.
    /// Returns the serialized state and its checksum.
    fn save_game_state(&mut self, frame: Frame) -> Result<(SaveBuffer, u64), CallbackError>;

    /// Restores a state previously produced by [`save_game_state`](Self::save_game_state).
    fn load_game_state(&mut self, buffer: &SaveBuffer) -> Result<(), CallbackError>;

    /// Dumps a state for offline inspection. Called with the labels `"original"` and
    /// `"replay"` when a synchronization test finds differing checksums.
    fn log_game_state(&mut self, label: &str, buffer: &SaveBuffer) {
        let _ = (label, buffer);
    }

    /// Takes back a buffer the session no longer references.
    fn free_buffer(&mut self, buffer: SaveBuffer) {
        drop(buffer);
    }

    /// Receives a session notification.
    fn on_event(&mut self, event: &Event) -> Result<(), CallbackError>;
}
