//! Common test infrastructure shared across integration tests.
//!
//! - `stubs`: games implementing `SessionCallbacks` with inspectable shared state
//! - `test_utils`: an in-memory network, port allocation and session drivers
//!
//! ```ignore
//! mod common;
//! use common::stubs::GameStub;
//! use common::test_utils::{test_builder, PeerPair};
//! ```

pub mod stubs;
pub mod test_utils;

#[allow(unused_imports)]
pub use test_utils::{
    platform, poll_with_sleep, test_builder, MemoryNetwork, PeerPair, PortAllocator,
    MAX_SYNC_ITERATIONS, POLL_INTERVAL,
};
