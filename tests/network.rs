//! Network integration tests.
//!
//! - Sessions over a lossy in-memory network
//! - Sessions over real UDP sockets on localhost

// Shared test infrastructure
#[path = "common/mod.rs"]
mod common;

// Network test modules
mod network {
    pub mod lossy;
    pub mod udp;
}
