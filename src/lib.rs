//! # rollback-session
//!
//! A rollback network session engine for frame-deterministic multiplayer simulations.
//!
//! Every peer runs the same simulation locally. Remote input that has not arrived yet is
//! predicted; when the real input turns out to differ, the session restores the newest
//! checkpoint before the divergence and re-simulates forward with corrected input. The
//! host plugs its simulation in through [`SessionCallbacks`] and drives each session
//! through a [`SessionManager`]:
//!
//! ```text
//! every tick:  add_local_input (each local player)
//!              synchronize_input  -> inputs for this frame
//!              simulate the frame
//!              advance_frame      -> may replay earlier frames through the callbacks
//! otherwise:   idle(budget)       -> drives the network and timers
//! ```
//!
//! Sessions come in three variants: peer-to-peer ([`P2PSession`]), an offline
//! determinism harness ([`SyncTestSession`]) and a read-only [`SpectatorSession`].

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;

use smallvec::SmallVec;

pub use callbacks::{CallbackError, SaveBuffer, SessionCallbacks};
pub use error::{ErrorCode, SessionError, SessionResult};
pub use input_queue::{BlankPrediction, PredictionStrategy, RepeatLastConfirmed};
pub use network::messages::Message;
pub use network::network_stats::NetworkStats;
pub use network::udp_socket::UdpNonBlockingSocket;
pub use sessions::builder::SessionBuilder;
pub use sessions::config::{ProtocolConfig, SpectatorConfig, SyncConfig};
pub use sessions::manager::SessionManager;
pub use sessions::p2p_session::P2PSession;
pub use sessions::session_trait::Session;
pub use sessions::spectator_session::SpectatorSession;
pub use sessions::sync_test_session::SyncTestSession;
pub use telemetry::SessionLogger;
pub use time_sync::TimeSyncConfig;

pub mod arena;
pub mod callbacks;
/// Error types and result codes returned by sessions.
pub mod error;
/// Per-frame player input records.
pub mod frame_info;
pub mod input_queue;
pub(crate) mod rollback;
pub mod rng;
pub(crate) mod state_store;
pub(crate) mod sync_layer;
pub mod telemetry;
pub mod time_sync;

/// Session variants, their configuration and the façade that owns them.
pub mod sessions {
    /// Builder that configures and constructs sessions.
    pub mod builder;
    pub mod config;
    pub mod manager;
    /// Peer-to-peer session.
    pub mod p2p_session;
    pub(crate) mod player_table;
    /// The trait every session variant implements.
    pub mod session_trait;
    /// Read-only spectator session.
    pub mod spectator_session;
    /// Offline determinism test session.
    pub mod sync_test_session;
}

/// Wire messages, encoding and the per-endpoint protocol.
pub mod network {
    pub mod codec;
    pub mod compression;
    pub mod messages;
    /// Connection statistics for remote endpoints.
    pub mod network_stats;
    pub(crate) mod protocol;
    /// Non-blocking UDP socket transport.
    pub mod udp_socket;
}

// #############
// # CONSTANTS #
// #############

/// Largest number of players in a session.
pub const MAX_PLAYERS: usize = 4;

/// Largest number of frames that may be simulated ahead of confirmed input.
pub const MAX_PREDICTION_FRAMES: usize = 8;

/// Largest number of spectators a peer-to-peer session can host.
pub const MAX_SPECTATORS: usize = 32;

/// Internally, -1 represents no frame / invalid frame.
pub const NULL_FRAME: i32 = -1;

/// A frame is a single step of simulation. Frame numbers start at 0 and increase by one
/// per step; [`Frame::NULL`] stands for "no frame".
///
/// ```
/// use rollback_session::Frame;
///
/// let frame = Frame::new(0);
/// assert!(frame.is_valid());
/// assert!(Frame::NULL.is_null());
/// assert_eq!((frame + 1).as_i32(), 1);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Frame(i32);

impl Frame {
    /// The null frame.
    pub const NULL: Self = Self(NULL_FRAME);

    /// Creates a frame. The value is not validated.
    #[inline]
    #[must_use]
    pub const fn new(frame: i32) -> Self {
        Self(frame)
    }

    /// Returns the underlying `i32` value.
    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Returns `true` for [`Frame::NULL`].
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_FRAME
    }

    /// Returns `true` if the frame is non-negative.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "NULL_FRAME")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl std::ops::Add<i32> for Frame {
    type Output = Self;

    #[inline]
    fn add(self, rhs: i32) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl std::ops::AddAssign<i32> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: i32) {
        self.0 += rhs;
    }
}

impl std::ops::Sub<i32> for Frame {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: i32) -> Self::Output {
        Self(self.0 - rhs)
    }
}

impl std::ops::Sub<Self> for Frame {
    type Output = i32;

    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

impl std::ops::Rem<i32> for Frame {
    type Output = i32;

    #[inline]
    fn rem(self, rhs: i32) -> Self::Output {
        self.0 % rhs
    }
}

impl From<i32> for Frame {
    #[inline]
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl From<Frame> for i32 {
    #[inline]
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

// ###########
// # HANDLES #
// ###########

/// Identifies a player or spectator inside one session.
///
/// Handles are only valid for the session that issued them. A handle whose slot was
/// vacated and reused resolves to [`SessionError::InvalidPlayerHandle`].
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct PlayerHandle(arena::Handle);

impl PlayerHandle {
    /// Creates a handle from a slot index and generation.
    #[must_use]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self(arena::Handle::new(index, generation))
    }

    /// The player slot. Slots `0..num_players` are players, later slots are spectators.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0.index()
    }

    /// Generation of the slot when the handle was issued.
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.0.generation()
    }

    pub(crate) const fn from_arena(handle: arena::Handle) -> Self {
        Self(handle)
    }

    pub(crate) const fn arena_handle(self) -> arena::Handle {
        self.0
    }
}

impl fmt::Display for PlayerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "player {}", self.0)
    }
}

/// Identifies a session inside a [`SessionManager`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionHandle(arena::Handle);

impl SessionHandle {
    /// Creates a handle from a slot index and generation.
    #[must_use]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self(arena::Handle::new(index, generation))
    }

    /// The session slot.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0.index()
    }

    /// Generation of the slot when the handle was issued.
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.0.generation()
    }

    pub(crate) const fn from_arena(handle: arena::Handle) -> Self {
        Self(handle)
    }

    pub(crate) const fn arena_handle(self) -> arena::Handle {
        self.0
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session {}", self.0)
    }
}

/// Where a remote participant can be reached.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum PeerAddress {
    /// An IP endpoint.
    Ip(SocketAddr),
    /// An identity on an external platform (for example a Steam id). Only reachable
    /// through a socket supplied by the host.
    Platform(u64),
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::Ip(addr)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(addr) => write!(f, "{}", addr),
            Self::Platform(id) => write!(f, "platform:{}", id),
        }
    }
}

// #############
// #   ENUMS   #
// #############

/// Desync detection by comparing checksums between peers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum DesyncDetection {
    /// Exchange a checksum every `interval` confirmed frames.
    On {
        /// Frames between two reports.
        interval: u32,
    },
    /// No checksums are exchanged.
    #[default]
    Off,
}

/// The three kinds of participants.
#[derive(Debug, Default, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum PlayerType {
    /// Plays on this device.
    #[default]
    Local,
    /// Plays on another device.
    Remote(PeerAddress),
    /// Watches from another device without contributing input.
    Spectator(PeerAddress),
}

/// Connection status of a player as seen from this peer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PlayerStatus {
    /// Added, no handshake reply yet.
    Connecting,
    /// Handshake in progress.
    Synchronizing,
    /// Exchanging input. Local players are always running.
    Running,
    /// Running, but nothing has been heard for longer than the notify threshold.
    Interrupted,
    /// Gone. Its input is blank from the disconnect frame onwards.
    Disconnected,
}

/// Whether a session accepts input yet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Some peer has not completed the handshake.
    Synchronizing,
    /// All peers are synchronized.
    Running,
}

/// Where a player's input for a frame came from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InputStatus {
    /// Authored locally or received from the network.
    Confirmed,
    /// Guessed by the prediction strategy.
    Predicted,
    /// The player disconnected at or before this frame; the input is blank.
    Disconnected,
}

/// A set of player indices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PlayerSet(BTreeSet<usize>);

impl PlayerSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a player index. Returns `false` if it was already present.
    pub fn insert(&mut self, index: usize) -> bool {
        self.0.insert(index)
    }

    /// Returns `true` if the index is in the set.
    #[must_use]
    pub fn contains(&self, index: usize) -> bool {
        self.0.contains(&index)
    }

    /// Number of indices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if no index is in the set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<usize> for PlayerSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// The merged input vector of one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncedInputs {
    /// The frame these inputs belong to.
    pub frame: Frame,
    /// One input per player, indexed by player slot.
    pub inputs: SmallVec<[i64; MAX_PLAYERS]>,
    /// Players whose input is a prediction.
    pub predicted: PlayerSet,
    /// Players that are disconnected; their input is blank.
    pub disconnected: PlayerSet,
}

impl SyncedInputs {
    /// Status of one player's input.
    #[must_use]
    pub fn status(&self, index: usize) -> InputStatus {
        if self.disconnected.contains(index) {
            InputStatus::Disconnected
        } else if self.predicted.contains(index) {
            InputStatus::Predicted
        } else {
            InputStatus::Confirmed
        }
    }
}

// ##########
// # EVENTS #
// ##########

/// Numeric tags of [`Event`] variants.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum EventCode {
    /// [`Event::ConnectedToPeer`]
    ConnectedToPeer = 1000,
    /// [`Event::SynchronizingWithPeer`]
    SynchronizingWithPeer = 1001,
    /// [`Event::SynchronizedWithPeer`]
    SynchronizedWithPeer = 1002,
    /// [`Event::Running`]
    Running = 1003,
    /// [`Event::DisconnectedFromPeer`]
    DisconnectedFromPeer = 1004,
    /// [`Event::TimeSync`]
    TimeSync = 1005,
    /// [`Event::ConnectionInterrupted`]
    ConnectionInterrupted = 1006,
    /// [`Event::ConnectionResumed`]
    ConnectionResumed = 1007,
    /// [`Event::DesyncDetected`]
    DesyncDetected = 1008,
}

impl EventCode {
    /// Returns the numeric value.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Notifications delivered to [`SessionCallbacks::on_event`] in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The first handshake reply from a peer arrived.
    ConnectedToPeer {
        /// The peer.
        player: PlayerHandle,
    },
    /// Handshake progress: `count` of `total` round trips are done.
    SynchronizingWithPeer {
        /// The peer.
        player: PlayerHandle,
        /// Completed round trips.
        count: u32,
        /// Required round trips.
        total: u32,
    },
    /// The handshake with a peer completed.
    SynchronizedWithPeer {
        /// The peer.
        player: PlayerHandle,
    },
    /// Every peer is synchronized; input is accepted from now on.
    Running,
    /// A peer was disconnected.
    DisconnectedFromPeer {
        /// The peer.
        player: PlayerHandle,
    },
    /// This peer runs ahead; idling for `frames_ahead` frames lets the others catch up.
    TimeSync {
        /// Recommended number of frames to wait.
        frames_ahead: u32,
    },
    /// Nothing has been heard from a peer for a while.
    ConnectionInterrupted {
        /// The peer.
        player: PlayerHandle,
        /// Milliseconds left until the peer is disconnected.
        disconnect_timeout: u64,
    },
    /// Traffic from an interrupted peer resumed.
    ConnectionResumed {
        /// The peer.
        player: PlayerHandle,
    },
    /// A peer reported a different checksum for a confirmed frame.
    DesyncDetected {
        /// Frame of the checksums.
        frame: Frame,
        /// Checksum computed locally.
        local_checksum: u64,
        /// Checksum reported by the peer.
        remote_checksum: u64,
        /// The peer.
        player: PlayerHandle,
    },
}

impl Event {
    /// Numeric tag of this event.
    #[must_use]
    pub const fn code(&self) -> EventCode {
        match self {
            Self::ConnectedToPeer { .. } => EventCode::ConnectedToPeer,
            Self::SynchronizingWithPeer { .. } => EventCode::SynchronizingWithPeer,
            Self::SynchronizedWithPeer { .. } => EventCode::SynchronizedWithPeer,
            Self::Running => EventCode::Running,
            Self::DisconnectedFromPeer { .. } => EventCode::DisconnectedFromPeer,
            Self::TimeSync { .. } => EventCode::TimeSync,
            Self::ConnectionInterrupted { .. } => EventCode::ConnectionInterrupted,
            Self::ConnectionResumed { .. } => EventCode::ConnectionResumed,
            Self::DesyncDetected { .. } => EventCode::DesyncDetected,
        }
    }
}

// ##########
// # TRAITS #
// ##########

/// Transport used by network sessions. Messages are sent UDP-style: unordered and
/// unreliable. The session's own protocol takes care of resending what matters.
pub trait NonBlockingSocket {
    /// Sends `msg` to `addr`.
    fn send_to(&mut self, msg: &Message, addr: &PeerAddress);

    /// Returns every message received since the previous call, with its sender.
    fn receive_all_messages(&mut self) -> Vec<(PeerAddress, Message)>;
}

// ###################
// # UNIT TESTS      #
// ###################
