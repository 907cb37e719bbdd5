//! Verification integration tests.
//!
//! - Property tests with proptest against the public codecs and sessions
//! - Log output checks with a captured tracing subscriber

// Shared test infrastructure
#[path = "common/mod.rs"]
mod common;

// Verification test modules
mod verification {
    pub mod logging;
    pub mod property;
}
