//! Frame advantage tracking.
//!
//! Each endpoint records, per frame, how far the local simulation runs ahead of the
//! remote one and how far the remote thinks it runs ahead of us. The average over a
//! sliding window tells a peer that keeps running ahead to idle for a few frames.

use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{Frame, SessionError};

const DEFAULT_FRAME_WINDOW_SIZE: usize = 30;

/// Frames between two [`Event::TimeSync`](crate::Event::TimeSync) recommendations.
pub const RECOMMENDATION_INTERVAL: i32 = 60;

/// Smallest frame advantage worth a recommendation.
pub const MIN_RECOMMENDATION: u32 = 3;

/// Configuration for time synchronization.
///
/// ```
/// use rollback_session::TimeSyncConfig;
///
/// let smooth = TimeSyncConfig { window_size: 60 };
/// assert!(smooth.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSyncConfig {
    /// Frames averaged when computing the frame advantage. Larger windows react
    /// slower and jitter less.
    ///
    /// Default: 30 frames (0.5 seconds at 60 FPS)
    pub window_size: usize,
}

impl Default for TimeSyncConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_FRAME_WINDOW_SIZE,
        }
    }
}

impl TimeSyncConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Small window; reacts quickly.
    #[must_use]
    pub fn responsive() -> Self {
        Self { window_size: 15 }
    }

    /// Large window; stable pacing.
    #[must_use]
    pub fn smooth() -> Self {
        Self { window_size: 60 }
    }

    /// Rejects a zero window.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.window_size == 0 {
            return Err(SessionError::invalid_request(
                "time sync window_size must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Sliding windows of local and remote frame advantage.
#[derive(Debug)]
pub struct TimeSync {
    local: Vec<i32>,
    remote: Vec<i32>,
    window_size: usize,
}

impl Default for TimeSync {
    fn default() -> Self {
        Self::with_config(TimeSyncConfig::default())
    }
}

impl TimeSync {
    /// Creates a tracker with the given configuration.
    #[must_use]
    pub fn with_config(config: TimeSyncConfig) -> Self {
        let window_size = config.window_size.max(1);
        Self {
            local: vec![0; window_size],
            remote: vec![0; window_size],
            window_size,
        }
    }

    /// Records the advantages observed at `frame`.
    pub fn advance_frame(&mut self, frame: Frame, local_adv: i32, remote_adv: i32) {
        if !frame.is_valid() {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::FrameSync,
                "time sync update for invalid frame {} skipped",
                frame
            );
            return;
        }
        let slot = frame.as_i32() as usize % self.window_size;
        self.local[slot] = local_adv;
        self.remote[slot] = remote_adv;
    }

    /// Average number of frames this peer runs ahead. Positive means the local
    /// simulation should wait.
    #[must_use]
    pub fn average_frame_advantage(&self) -> i32 {
        let local_avg = self.local.iter().sum::<i32>() as f32 / self.window_size as f32;
        let remote_avg = self.remote.iter().sum::<i32>() as f32 / self.window_size as f32;

        // meet in the middle
        ((remote_avg - local_avg) / 2.0) as i32
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

    fn fill(time_sync: &mut TimeSync, frames: std::ops::Range<i32>, local: i32, remote: i32) {
        for i in frames {
            time_sync.advance_frame(Frame::new(i), local, remote);
        }
    }

    #[test]
    fn no_advantage() {
        let mut time_sync = TimeSync::default();
        fill(&mut time_sync, 0..60, 0, 0);
        assert_eq!(time_sync.average_frame_advantage(), 0);
    }

    #[test]
    fn remote_ahead_means_we_are_behind() {
        let mut time_sync = TimeSync::default();
        fill(&mut time_sync, 0..60, 5, -5);
        assert_eq!(time_sync.average_frame_advantage(), -5);
    }

    #[test]
    fn local_ahead_is_positive() {
        let mut time_sync = TimeSync::default();
        fill(&mut time_sync, 0..60, -4, 4);
        assert_eq!(time_sync.average_frame_advantage(), 4);
    }

    #[test]
    fn window_slides() {
        let mut time_sync = TimeSync::default();
        fill(&mut time_sync, 0..30, 10, -10);
        assert_eq!(time_sync.average_frame_advantage(), -10);
        fill(&mut time_sync, 30..60, -10, 10);
        assert_eq!(time_sync.average_frame_advantage(), 10);
    }

    #[test]
    fn partial_window_is_diluted() {
        let mut time_sync = TimeSync::default();
        fill(&mut time_sync, 0..15, 10, -10);
        assert_eq!(time_sync.average_frame_advantage(), -5);
    }

    #[test]
    fn asymmetric_advantage() {
        let mut time_sync = TimeSync::with_config(TimeSyncConfig::responsive());
        fill(&mut time_sync, 0..15, 0, 6);
        assert_eq!(time_sync.average_frame_advantage(), 3);
    }

    #[test]
    fn large_frames_wrap_into_window() {
        let mut time_sync = TimeSync::default();
        time_sync.advance_frame(Frame::new(1000), 5, -5);
        assert_eq!(time_sync.local[1000 % 30], 5);
        assert_eq!(time_sync.remote[1000 % 30], -5);
    }

    #[test]
    fn invalid_frames_are_skipped() {
        let mut time_sync = TimeSync::default();
        time_sync.advance_frame(Frame::new(0), 10, 20);
        time_sync.advance_frame(Frame::NULL, 99, 99);
        time_sync.advance_frame(Frame::new(-5), 99, 99);
        assert_eq!(time_sync.local[0], 10);
        assert_eq!(time_sync.remote[0], 20);
    }

    #[test]
    fn config_validation() {
        assert!(TimeSyncConfig::default().validate().is_ok());
        assert!(TimeSyncConfig::smooth().validate().is_ok());
        assert!(TimeSyncConfig { window_size: 0 }.validate().is_err());
    }
}
