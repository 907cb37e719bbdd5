use std::fmt;

/// Connection statistics for one remote endpoint, computed when queried.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use = "NetworkStats should be inspected or used after being queried"]
pub struct NetworkStats {
    /// Local inputs sent to the peer and not acknowledged yet. A long queue points at
    /// a high round-trip time or packet loss.
    pub send_queue_len: usize,
    /// Frames of the peer's input received ahead of the local simulation.
    pub recv_queue_len: usize,
    /// Round-trip time in milliseconds, measured with quality reports.
    pub ping: u128,
    /// Estimated upstream bandwidth in kilobytes per second, UDP and IP headers included.
    pub kbps_sent: usize,
    /// How many frames the local simulation runs behind the peer. If this peer is at
    /// frame 1002 and the other one at 1009, this is roughly 7.
    pub local_frames_behind: i32,
    /// The same as [`local_frames_behind`](Self::local_frames_behind), as reported
    /// by the peer.
    pub remote_frames_behind: i32,
}

impl NetworkStats {
    /// Creates zeroed statistics.
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Display for NetworkStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            send_queue_len,
            recv_queue_len,
            ping,
            kbps_sent,
            local_frames_behind,
            remote_frames_behind,
        } = self;
        write!(
            f,
            "NetworkStats {{ ping: {}ms, send_queue: {}, recv_queue: {}, kbps: {}, local_behind: {}, remote_behind: {} }}",
            ping, send_queue_len, recv_queue_len, kbps_sent, local_frames_behind, remote_frames_behind
        )
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
    fn default_is_zeroed() {
        let stats = NetworkStats::new();
        assert_eq!(stats, NetworkStats::default());
        assert_eq!(stats.ping, 0);
        assert_eq!(stats.recv_queue_len, 0);
    }

    #[test]
    fn display_lists_every_field() {
        let stats = NetworkStats {
            send_queue_len: 3,
            recv_queue_len: 2,
            ping: 48,
            kbps_sent: 12,
            local_frames_behind: -1,
            remote_frames_behind: 1,
        };
        assert_eq!(
            stats.to_string(),
            "NetworkStats { ping: 48ms, send_queue: 3, recv_queue: 2, kbps: 12, local_behind: -1, remote_behind: 1 }"
        );
    }
}
