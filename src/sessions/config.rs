//! Tuning knobs for the handshake, the wire protocol and spectators.
//!
//! | Config Type | Purpose | Presets |
//! |-------------|---------|---------|
//! | `SyncConfig` | Handshake and retransmission cadence | `lan()`, `high_latency()`, `lossy()` |
//! | `ProtocolConfig` | Quality reports, checksums, shutdown | `competitive()`, `deterministic(seed)` |
//! | `SpectatorConfig` | Spectator buffering and catch-up | `fast_paced()`, `broadcast()` |
//!
//! ```
//! use rollback_session::{ProtocolConfig, SessionBuilder, SyncConfig};
//!
//! let builder = SessionBuilder::new("demo")
//!     .with_sync_config(SyncConfig::lan())
//!     .with_protocol_config(ProtocolConfig::deterministic(7))
//!     .with_num_players(3);
//! assert!(builder.is_ok());
//! ```

use web_time::Duration;

use crate::SessionError;

fn out_of_range(field: &str, min: u128, max: u128, actual: u128) -> SessionError {
    SessionError::invalid_request(format!(
        "{field} must be within {min}..={max}, got {actual}"
    ))
}

fn check_millis(field: &str, value: Duration, min: u128, max: u128) -> Result<(), SessionError> {
    let millis = value.as_millis();
    if millis < min || millis > max {
        return Err(out_of_range(field, min, max, millis));
    }
    Ok(())
}

/// Handshake and retransmission cadence.
///
/// The defaults suit networks with under 15% loss and under 100 ms round trips.
///
/// ```
/// use rollback_session::SyncConfig;
/// use web_time::Duration;
///
/// let lossy = SyncConfig {
///     num_sync_packets: 8,
///     ..SyncConfig::default()
/// };
/// assert!(lossy.validate().is_ok());
/// assert_eq!(lossy.sync_retry_interval, Duration::from_millis(200));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "SyncConfig has no effect unless passed to SessionBuilder::with_sync_config()"]
pub struct SyncConfig {
    /// Successful round trips required before a peer counts as synchronized.
    ///
    /// Default: 5
    pub num_sync_packets: u32,
    /// Time between handshake retries while synchronizing.
    ///
    /// Default: 200ms
    pub sync_retry_interval: Duration,
    /// Unacknowledged input is resent after this long without receiving input.
    ///
    /// Default: 200ms
    pub running_retry_interval: Duration,
    /// A keepalive is sent after this long without sending anything.
    ///
    /// Default: 200ms
    pub keepalive_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            num_sync_packets: 5,
            sync_retry_interval: Duration::from_millis(200),
            running_retry_interval: Duration::from_millis(200),
            keepalive_interval: Duration::from_millis(200),
        }
    }
}

impl SyncConfig {
    /// Default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Round trips of 100 to 200 ms; slower retries.
    pub fn high_latency() -> Self {
        Self {
            num_sync_packets: 5,
            sync_retry_interval: Duration::from_millis(400),
            running_retry_interval: Duration::from_millis(400),
            keepalive_interval: Duration::from_millis(400),
        }
    }

    /// 5 to 15% packet loss; more round trips for confidence.
    pub fn lossy() -> Self {
        Self {
            num_sync_packets: 8,
            ..Self::default()
        }
    }

    /// Local network play.
    pub fn lan() -> Self {
        Self {
            num_sync_packets: 3,
            sync_retry_interval: Duration::from_millis(100),
            running_retry_interval: Duration::from_millis(100),
            keepalive_interval: Duration::from_millis(100),
        }
    }

    /// Rejects values the protocol cannot work with.
    pub fn validate(&self) -> Result<(), SessionError> {
        if !(1..=64).contains(&self.num_sync_packets) {
            return Err(out_of_range(
                "num_sync_packets",
                1,
                64,
                u128::from(self.num_sync_packets),
            ));
        }
        check_millis("sync_retry_interval", self.sync_retry_interval, 1, 10_000)?;
        check_millis(
            "running_retry_interval",
            self.running_retry_interval,
            1,
            10_000,
        )?;
        check_millis("keepalive_interval", self.keepalive_interval, 1, 10_000)
    }
}

/// Wire protocol settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "ProtocolConfig has no effect unless passed to SessionBuilder::with_protocol_config()"]
pub struct ProtocolConfig {
    /// Time between quality reports, which measure ping and frame advantage.
    ///
    /// Default: 200ms
    pub quality_report_interval: Duration,
    /// Time a disconnected endpoint lingers before it stops processing messages.
    ///
    /// Default: 5000ms
    pub shutdown_delay: Duration,
    /// Checksums remembered per side for desync detection.
    ///
    /// Default: 32
    pub max_checksum_history: usize,
    /// Unacknowledged inputs tolerated before the peer is dropped. Only a spectator
    /// can get this far behind; players are held back by the prediction threshold.
    ///
    /// Default: 128
    pub pending_output_limit: usize,
    /// Handshake requests after which a warning is logged.
    ///
    /// Default: 10
    pub sync_retry_warning_threshold: u32,
    /// Handshake duration in milliseconds after which a warning is logged.
    ///
    /// Default: 3000
    pub sync_duration_warning_ms: u128,
    /// Received input is kept for `input_history_multiplier * max_prediction` frames
    /// behind the newest frame, to decode late bundles.
    ///
    /// Default: 2
    pub input_history_multiplier: usize,
    /// Seed for session magic and handshake nonces. `None` draws them from the
    /// thread-local generator.
    ///
    /// ```
    /// use rollback_session::ProtocolConfig;
    ///
    /// let config = ProtocolConfig::deterministic(42);
    /// assert_eq!(config.rng_seed, Some(42));
    /// ```
    pub rng_seed: Option<u64>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            quality_report_interval: Duration::from_millis(200),
            shutdown_delay: Duration::from_millis(5000),
            max_checksum_history: 32,
            pending_output_limit: 128,
            sync_retry_warning_threshold: 10,
            sync_duration_warning_ms: 3000,
            input_history_multiplier: 2,
            rng_seed: None,
        }
    }
}

impl ProtocolConfig {
    /// Default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Frequent quality reports for tight pacing.
    pub fn competitive() -> Self {
        Self {
            quality_report_interval: Duration::from_millis(100),
            shutdown_delay: Duration::from_millis(3000),
            sync_duration_warning_ms: 2000,
            ..Self::default()
        }
    }

    /// Reproducible magic numbers and nonces.
    pub fn deterministic(seed: u64) -> Self {
        Self {
            rng_seed: Some(seed),
            ..Self::default()
        }
    }

    /// Rejects values out of their supported range.
    pub fn validate(&self) -> Result<(), SessionError> {
        check_millis(
            "quality_report_interval",
            self.quality_report_interval,
            1,
            10_000,
        )?;
        check_millis("shutdown_delay", self.shutdown_delay, 1, 300_000)?;
        let counts = [
            ("max_checksum_history", self.max_checksum_history, 1024),
            ("pending_output_limit", self.pending_output_limit, 4096),
            ("input_history_multiplier", self.input_history_multiplier, 16),
        ];
        for (field, value, max) in counts {
            if !(1..=max).contains(&value) {
                return Err(out_of_range(field, 1, max as u128, value as u128));
            }
        }
        if !(1..=1000).contains(&self.sync_retry_warning_threshold) {
            return Err(out_of_range(
                "sync_retry_warning_threshold",
                1,
                1000,
                u128::from(self.sync_retry_warning_threshold),
            ));
        }
        if !(1..=300_000).contains(&self.sync_duration_warning_ms) {
            return Err(out_of_range(
                "sync_duration_warning_ms",
                1,
                300_000,
                self.sync_duration_warning_ms,
            ));
        }
        Ok(())
    }
}

/// Spectator buffering.
///
/// ```
/// use rollback_session::SpectatorConfig;
///
/// let config = SpectatorConfig {
///     buffer_size: 120,
///     ..SpectatorConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "SpectatorConfig has no effect unless passed to SessionBuilder::with_spectator_config()"]
pub struct SpectatorConfig {
    /// Frames of host input the spectator buffers. Falling further behind than this
    /// overwrites frames not yet consumed.
    ///
    /// Default: 60
    pub buffer_size: usize,
    /// Frames to advance per host tick while catching up.
    ///
    /// Default: 1
    pub catchup_speed: usize,
    /// Lag in frames at which catching up starts.
    ///
    /// Default: 10
    pub max_frames_behind: usize,
}

impl Default for SpectatorConfig {
    fn default() -> Self {
        Self {
            buffer_size: 60,
            catchup_speed: 1,
            max_frames_behind: 10,
        }
    }
}

impl SpectatorConfig {
    /// Default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bigger buffer, faster catch-up.
    pub fn fast_paced() -> Self {
        Self {
            buffer_size: 90,
            catchup_speed: 2,
            max_frames_behind: 15,
        }
    }

    /// Three seconds of buffer and gentle catch-up.
    pub fn broadcast() -> Self {
        Self {
            buffer_size: 180,
            catchup_speed: 1,
            max_frames_behind: 30,
        }
    }

    /// Rejects an empty buffer, a zero catch-up speed, or a lag limit the buffer
    /// cannot hold.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.buffer_size == 0 {
            return Err(SessionError::invalid_request(
                "spectator buffer_size must be at least 1",
            ));
        }
        if self.catchup_speed == 0 {
            return Err(SessionError::invalid_request(
                "spectator catchup_speed must be at least 1",
            ));
        }
        if self.max_frames_behind >= self.buffer_size {
            return Err(SessionError::invalid_request(format!(
                "spectator max_frames_behind ({}) must be below buffer_size ({})",
                self.max_frames_behind, self.buffer_size
            )));
        }
        Ok(())
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
    fn defaults_validate() {
        SyncConfig::default().validate().unwrap();
        ProtocolConfig::default().validate().unwrap();
        SpectatorConfig::default().validate().unwrap();
    }

    #[test]
    fn presets_validate() {
        for config in [SyncConfig::lan(), SyncConfig::lossy(), SyncConfig::high_latency()] {
            config.validate().unwrap();
        }
        ProtocolConfig::competitive().validate().unwrap();
        ProtocolConfig::deterministic(1).validate().unwrap();
        SpectatorConfig::fast_paced().validate().unwrap();
        SpectatorConfig::broadcast().validate().unwrap();
    }

    #[test]
    fn default_values() {
        let sync = SyncConfig::new();
        assert_eq!(sync.num_sync_packets, 5);
        assert_eq!(sync.keepalive_interval, Duration::from_millis(200));
        let protocol = ProtocolConfig::new();
        assert_eq!(protocol.shutdown_delay, Duration::from_millis(5000));
        assert_eq!(protocol.max_checksum_history, 32);
        assert_eq!(protocol.rng_seed, None);
        assert_eq!(SpectatorConfig::new().buffer_size, 60);
    }

    #[test]
    fn zero_sync_packets_rejected() {
        let config = SyncConfig {
            num_sync_packets: 0,
            ..SyncConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::InvalidRequest);
        assert!(err.to_string().contains("num_sync_packets"));
    }

    #[test]
    fn zero_interval_rejected() {
        let config = SyncConfig {
            keepalive_interval: Duration::ZERO,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn protocol_counts_checked() {
        let config = ProtocolConfig {
            max_checksum_history: 0,
            ..ProtocolConfig::default()
        };
        assert!(config.validate().is_err());
        let config = ProtocolConfig {
            pending_output_limit: 5000,
            ..ProtocolConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn spectator_lag_must_fit_buffer() {
        let config = SpectatorConfig {
            buffer_size: 10,
            max_frames_behind: 10,
            ..SpectatorConfig::default()
        };
        assert!(config.validate().is_err());
        let config = SpectatorConfig {
            catchup_speed: 0,
            ..SpectatorConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
