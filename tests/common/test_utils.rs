//! Shared helpers for integration tests: an in-memory network, port allocation for
//! real sockets, and loops that drive sessions until a condition holds.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    dead_code
)]

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rollback_session::{
    Message, NonBlockingSocket, P2PSession, PeerAddress, PlayerHandle, SessionBuilder,
    SessionError, SessionState, SyncConfig,
};

use super::stubs::GameStub;

/// Upper bound on polling rounds before a test gives up waiting.
pub const MAX_SYNC_ITERATIONS: usize = 500;

/// Pause between polling rounds when real time has to pass.
pub const POLL_INTERVAL: Duration = Duration::from_millis(5);

// ============================================================================
// In-memory network
// ============================================================================

#[derive(Default)]
struct NetworkInner {
    mailboxes: BTreeMap<PeerAddress, VecDeque<(PeerAddress, Message)>>,
    cut: BTreeSet<PeerAddress>,
    drop_every: Option<usize>,
    sent: usize,
    dropped: usize,
}

/// A lossless network between [`MemorySocket`]s, unless told otherwise. Delivery is
/// immediate; the receiver sees a message on its next poll.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Rc<RefCell<NetworkInner>>,
}

impl MemoryNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn socket(&self, addr: PeerAddress) -> MemorySocket {
        self.inner.borrow_mut().mailboxes.entry(addr).or_default();
        MemorySocket {
            addr,
            inner: Rc::clone(&self.inner),
        }
    }

    /// Drops everything sent to or from `addr` until [`restore`](Self::restore).
    pub fn cut(&self, addr: PeerAddress) {
        self.inner.borrow_mut().cut.insert(addr);
    }

    pub fn restore(&self, addr: PeerAddress) {
        self.inner.borrow_mut().cut.remove(&addr);
    }

    /// Drops every `n`th message.
    pub fn drop_every(&self, n: usize) {
        self.inner.borrow_mut().drop_every = Some(n);
    }

    #[must_use]
    pub fn sent(&self) -> usize {
        self.inner.borrow().sent
    }

    #[must_use]
    pub fn dropped(&self) -> usize {
        self.inner.borrow().dropped
    }
}

pub struct MemorySocket {
    addr: PeerAddress,
    inner: Rc<RefCell<NetworkInner>>,
}

impl NonBlockingSocket for MemorySocket {
    fn send_to(&mut self, msg: &Message, addr: &PeerAddress) {
        let mut inner = self.inner.borrow_mut();
        inner.sent += 1;
        let lossy = inner.drop_every.is_some_and(|n| inner.sent % n == 0);
        if lossy || inner.cut.contains(&self.addr) || inner.cut.contains(addr) {
            inner.dropped += 1;
            return;
        }
        let from = self.addr;
        if let Some(mailbox) = inner.mailboxes.get_mut(addr) {
            mailbox.push_back((from, msg.clone()));
        }
    }

    fn receive_all_messages(&mut self) -> Vec<(PeerAddress, Message)> {
        let mut inner = self.inner.borrow_mut();
        inner
            .mailboxes
            .get_mut(&self.addr)
            .map(|mailbox| mailbox.drain(..).collect())
            .unwrap_or_default()
    }
}

#[must_use]
pub fn platform(id: u64) -> PeerAddress {
    PeerAddress::Platform(id)
}

// ============================================================================
// Port allocation for real sockets
// ============================================================================

const PORT_ALLOCATOR_START: u16 = 30000;
const PORTS_PER_PROCESS: u16 = 20;

static PORT_COUNTER: AtomicU16 = AtomicU16::new(0);

/// Hands out ports unique within this test binary, offset by process id so that
/// parallel test binaries do not collide.
pub struct PortAllocator;

impl PortAllocator {
    #[must_use]
    pub fn next_port() -> u16 {
        let offset = (std::process::id() % 1000) as u16 * PORTS_PER_PROCESS;
        let count = PORT_COUNTER.fetch_add(1, Ordering::SeqCst) % PORTS_PER_PROCESS;
        PORT_ALLOCATOR_START + offset + count
    }
}

// ============================================================================
// Session drivers
// ============================================================================

/// Two peers in a two player session, each with one local player in its own slot.
pub struct PeerPair {
    pub network: MemoryNetwork,
    pub sessions: [P2PSession; 2],
    pub stubs: [GameStub; 2],
    pub locals: [PlayerHandle; 2],
    pub remotes: [PlayerHandle; 2],
}

/// Builder settings used by most peer tests: fast handshakes.
#[must_use]
pub fn test_builder() -> SessionBuilder {
    SessionBuilder::new("stub-game")
        .with_num_players(2)
        .unwrap()
        .with_sync_config(SyncConfig::lan())
}

impl PeerPair {
    #[must_use]
    pub fn new(builder: &SessionBuilder) -> Self {
        Self::with_stubs(builder, [GameStub::new(), GameStub::new()])
    }

    #[must_use]
    pub fn with_stubs(builder: &SessionBuilder, stubs: [GameStub; 2]) -> Self {
        use rollback_session::PlayerType;

        let network = MemoryNetwork::new();
        let addrs = [platform(1), platform(2)];
        let mut sessions = [0, 1].map(|i| {
            builder
                .clone()
                .start_p2p_session(stubs[i].callbacks(), network.socket(addrs[i]))
                .unwrap()
        });

        let mut locals = [PlayerHandle::new(0, 0); 2];
        let mut remotes = [PlayerHandle::new(0, 0); 2];
        for (i, session) in sessions.iter_mut().enumerate() {
            let other = 1 - i;
            locals[i] = session.add_player(PlayerType::Local, i).unwrap();
            remotes[i] = session
                .add_player(PlayerType::Remote(addrs[other]), other)
                .unwrap();
        }

        Self {
            network,
            sessions,
            stubs,
            locals,
            remotes,
        }
    }

    /// Idles both peers until both run.
    pub fn synchronize(&mut self) {
        for _ in 0..MAX_SYNC_ITERATIONS {
            for session in &mut self.sessions {
                session.idle(Duration::ZERO).unwrap();
            }
            if self
                .sessions
                .iter()
                .all(|session| session.current_state() == SessionState::Running)
            {
                return;
            }
            thread::sleep(POLL_INTERVAL);
        }
        panic!("peers did not synchronize");
    }

    /// One tick on peer `i`. Returns `false` if the peer had to wait for remote input.
    pub fn tick(&mut self, i: usize, input: i64) -> Result<bool, SessionError> {
        let session = &mut self.sessions[i];
        match session.add_local_input(self.locals[i], input) {
            Ok(()) => (),
            Err(SessionError::PredictionThreshold) => {
                session.idle(Duration::ZERO)?;
                return Ok(false);
            },
            Err(err) => return Err(err),
        }
        let inputs = session.synchronize_input()?;
        self.stubs[i].simulate(&inputs);
        session.advance_frame()?;
        Ok(true)
    }

    /// Ticks both peers `frames` times each, feeding `input(peer, frame)`.
    pub fn run(&mut self, frames: i32, input: impl Fn(usize, i32) -> i64) {
        let start = Instant::now();
        let targets = [0, 1].map(|i| self.stubs[i].frame() + frames);
        while (0..2).any(|i| self.stubs[i].frame() < targets[i]) {
            assert!(start.elapsed() < Duration::from_secs(10), "peers stalled");
            for i in 0..2 {
                if self.stubs[i].frame() < targets[i] {
                    let frame = self.stubs[i].frame();
                    self.tick(i, input(i, frame)).unwrap();
                }
            }
        }
    }

    /// Idles both peers a few rounds so that in-flight input lands.
    pub fn settle(&mut self) {
        for _ in 0..4 {
            for session in &mut self.sessions {
                session.idle(Duration::ZERO).unwrap();
            }
        }
    }
}

/// Polls `step` until it returns `true`, sleeping between attempts.
pub fn poll_with_sleep(mut step: impl FnMut() -> bool, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if step() {
            return true;
        }
        thread::sleep(POLL_INTERVAL);
    }
    false
}
