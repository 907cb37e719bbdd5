use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::callbacks::CallbackError;
use crate::{Frame, PlayerHandle};

/// Numeric result codes for hosts that need a flat integer surface.
///
/// `Success` is zero. Each recoverable condition has its own positive code, and
/// `GeneralFailure` is the negative sentinel for unexpected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i32)]
pub enum ErrorCode {
    /// The operation succeeded.
    Success = 0,
    /// Unexpected internal fault or a host callback reported failure.
    GeneralFailure = -1,
    /// The session handle is closed or unknown.
    InvalidSession = 1,
    /// The player handle is stale, vacant or of the wrong kind.
    InvalidPlayerHandle = 2,
    /// The player index is outside the player table.
    PlayerOutOfRange = 3,
    /// Advancing would predict further than can be rolled back.
    PredictionThreshold = 4,
    /// The session variant does not support the operation.
    Unsupported = 5,
    /// Some peer has not finished the handshake.
    NotSynchronized = 6,
    /// The operation is not allowed during rollback replay.
    InRollback = 7,
    /// The input could not be queued.
    InputDropped = 8,
    /// The player is disconnected.
    PlayerDisconnected = 9,
    /// All spectator slots are taken.
    TooManySpectators = 10,
    /// The request is malformed.
    InvalidRequest = 11,
}

impl ErrorCode {
    /// Returns the raw integer value.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// Returns `true` only for [`ErrorCode::Success`].
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// Classifies the outcome of a session operation.
    #[must_use]
    pub fn from_result<T>(result: &Result<T, SessionError>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(err) => err.code(),
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.as_i32())
    }
}

/// Every error a session operation can return. Most API functions return a
/// [`SessionResult`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Unexpected fault, including a host callback returning failure.
    GeneralFailure {
        /// What failed.
        context: String,
    },
    /// The session handle is closed or was never issued.
    InvalidSession,
    /// The handle does not name a player this operation can act on.
    InvalidPlayerHandle {
        /// The rejected handle.
        handle: PlayerHandle,
    },
    /// The player index lies outside `0..limit`.
    PlayerOutOfRange {
        /// The requested index.
        index: usize,
        /// Number of addressable slots.
        limit: usize,
    },
    /// Too many frames are unconfirmed to simulate another one.
    PredictionThreshold,
    /// This session variant does not implement the operation.
    Unsupported {
        /// Name of the rejected operation.
        operation: &'static str,
    },
    /// Some peer has not completed synchronization yet.
    NotSynchronized,
    /// Rejected while the rollback controller replays frames.
    InRollback,
    /// The input queue refused the input.
    InputDropped {
        /// Player whose input was dropped.
        handle: PlayerHandle,
        /// Frame the input was meant for.
        frame: Frame,
    },
    /// The player has been disconnected.
    PlayerDisconnected {
        /// The disconnected player.
        handle: PlayerHandle,
    },
    /// All spectator slots are in use.
    TooManySpectators,
    /// The request was malformed.
    InvalidRequest {
        /// Why the request was rejected.
        info: String,
    },
}

impl SessionError {
    /// Returns the numeric code of this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::GeneralFailure { .. } => ErrorCode::GeneralFailure,
            Self::InvalidSession => ErrorCode::InvalidSession,
            Self::InvalidPlayerHandle { .. } => ErrorCode::InvalidPlayerHandle,
            Self::PlayerOutOfRange { .. } => ErrorCode::PlayerOutOfRange,
            Self::PredictionThreshold => ErrorCode::PredictionThreshold,
            Self::Unsupported { .. } => ErrorCode::Unsupported,
            Self::NotSynchronized => ErrorCode::NotSynchronized,
            Self::InRollback => ErrorCode::InRollback,
            Self::InputDropped { .. } => ErrorCode::InputDropped,
            Self::PlayerDisconnected { .. } => ErrorCode::PlayerDisconnected,
            Self::TooManySpectators => ErrorCode::TooManySpectators,
            Self::InvalidRequest { .. } => ErrorCode::InvalidRequest,
        }
    }

    pub(crate) fn invalid_request(info: impl Into<String>) -> Self {
        Self::InvalidRequest { info: info.into() }
    }

    pub(crate) fn general(context: impl Into<String>) -> Self {
        Self::GeneralFailure {
            context: context.into(),
        }
    }
}

impl Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GeneralFailure { context } => write!(f, "General failure: {}", context),
            Self::InvalidSession => write!(f, "The session handle is not valid."),
            Self::InvalidPlayerHandle { handle } => {
                write!(f, "The player handle {} is not valid here.", handle)
            },
            Self::PlayerOutOfRange { index, limit } => {
                write!(f, "Player index {} is outside 0..{}.", index, limit)
            },
            Self::PredictionThreshold => write!(
                f,
                "Prediction threshold is reached, cannot proceed without confirmed input."
            ),
            Self::Unsupported { operation } => {
                write!(f, "Operation {} is not supported by this session.", operation)
            },
            Self::NotSynchronized => write!(
                f,
                "The session is not synchronized yet. Keep calling idle until it is."
            ),
            Self::InRollback => write!(f, "The session is replaying frames."),
            Self::InputDropped { handle, frame } => {
                write!(f, "Input of player {} for frame {} was dropped.", handle, frame)
            },
            Self::PlayerDisconnected { handle } => {
                write!(f, "Player {} is disconnected.", handle)
            },
            Self::TooManySpectators => write!(f, "All spectator slots are taken."),
            Self::InvalidRequest { info } => write!(f, "Invalid request: {}", info),
        }
    }
}

impl Error for SessionError {}

impl From<CallbackError> for SessionError {
    fn from(err: CallbackError) -> Self {
        Self::GeneralFailure {
            context: err.to_string(),
        }
    }
}

/// Result alias used across the crate.
pub type SessionResult<T> = Result<T, SessionError>;

// #########
// # TESTS #
// #########
