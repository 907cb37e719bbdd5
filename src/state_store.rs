//! Checkpoint window.
//!
//! The [`StateStore`] keeps one [`Snapshot`] per frame for the most recent frames. A
//! snapshot owns the host's [`SaveBuffer`]; the store hands buffers back whenever a
//! snapshot is replaced or falls out of the window, and the caller returns them to the
//! host through [`SessionCallbacks::free_buffer`](crate::SessionCallbacks::free_buffer).
//! That hand-back is the only way a buffer leaves the store.

use std::collections::VecDeque;

use crate::callbacks::SaveBuffer;
use crate::telemetry::{InvariantChecker, InvariantViolation};
use crate::Frame;

/// A saved simulation state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Frame the state belongs to: the state right before this frame is simulated.
    pub frame: Frame,
    /// The serialized state.
    pub buffer: SaveBuffer,
    /// Host-computed checksum of the state.
    pub checksum: u64,
}

/// Bounded window of snapshots, ordered by frame.
#[derive(Debug)]
pub(crate) struct StateStore {
    snapshots: VecDeque<Snapshot>,
    capacity: usize,
}

impl StateStore {
    /// `capacity` is the number of frames retained; it is raised to at least one.
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            snapshots: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub(crate) fn newest_frame(&self) -> Frame {
        self.snapshots.back().map_or(Frame::NULL, |s| s.frame)
    }

    /// Stores `snapshot`, returning every buffer the store stopped referencing: the
    /// previous snapshot of the same frame, and anything pushed out of the window.
    ///
    /// Saving a frame drops all snapshots of later frames; they belong to a timeline
    /// that no longer exists.
    #[must_use = "released buffers must be handed back to the host"]
    pub(crate) fn insert(&mut self, snapshot: Snapshot) -> Vec<SaveBuffer> {
        let mut released = Vec::new();

        while self
            .snapshots
            .back()
            .is_some_and(|s| s.frame >= snapshot.frame)
        {
            if let Some(old) = self.snapshots.pop_back() {
                released.push(old.buffer);
            }
        }

        self.snapshots.push_back(snapshot);

        while self.snapshots.len() > self.capacity {
            if let Some(old) = self.snapshots.pop_front() {
                released.push(old.buffer);
            }
        }

        released
    }

    /// Drops every snapshot newer than `frame` and hands their buffers back.
    #[must_use = "released buffers must be handed back to the host"]
    pub(crate) fn discard_after(&mut self, frame: Frame) -> Vec<SaveBuffer> {
        let mut released = Vec::new();
        while self.snapshots.back().is_some_and(|s| s.frame > frame) {
            if let Some(old) = self.snapshots.pop_back() {
                released.push(old.buffer);
            }
        }
        released
    }

    pub(crate) fn get(&self, frame: Frame) -> Option<&Snapshot> {
        self.snapshots.iter().find(|s| s.frame == frame)
    }

    /// Most recent snapshot at or before `frame`.
    pub(crate) fn nearest_at_or_before(&self, frame: Frame) -> Option<&Snapshot> {
        self.snapshots.iter().rev().find(|s| s.frame <= frame)
    }

    pub(crate) fn checksum(&self, frame: Frame) -> Option<u64> {
        self.get(frame).map(|s| s.checksum)
    }

    /// Empties the store and hands back every buffer.
    #[must_use = "released buffers must be handed back to the host"]
    pub(crate) fn clear(&mut self) -> Vec<SaveBuffer> {
        self.snapshots.drain(..).map(|s| s.buffer).collect()
    }
}

impl InvariantChecker for StateStore {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.snapshots.len() > self.capacity {
            return Err(InvariantViolation::new("StateStore", "more snapshots than capacity")
                .with_details(format!("len={}, capacity={}", self.snapshots.len(), self.capacity)));
        }
        let ordered = self
            .snapshots
            .iter()
            .zip(self.snapshots.iter().skip(1))
            .all(|(a, b)| a.frame < b.frame);
        if !ordered {
            return Err(InvariantViolation::new(
                "StateStore",
                "snapshots are not strictly ordered by frame",
            ));
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

    fn snap(frame: i32, tag: u8) -> Snapshot {
        Snapshot {
            frame: Frame::new(frame),
            buffer: SaveBuffer::new(vec![tag]),
            checksum: u64::from(tag),
        }
    }

    #[test]
    fn evicts_oldest_beyond_capacity() {
        let mut store = StateStore::new(3);
        for f in 0..3 {
            assert!(store.insert(snap(f, f as u8)).is_empty());
        }
        let released = store.insert(snap(3, 3));
        assert_eq!(released, vec![SaveBuffer::new(vec![0])]);
        assert_eq!(store.snapshots.front().unwrap().frame, Frame::new(1));
        assert_eq!(store.newest_frame(), Frame::new(3));
        assert!(store.check_invariants().is_ok());
    }

    #[test]
    fn resaving_a_frame_releases_the_old_buffer_and_later_frames() {
        let mut store = StateStore::new(8);
        for f in 0..5 {
            let _ = store.insert(snap(f, f as u8));
        }
        let released = store.insert(snap(2, 20));
        assert_eq!(released.len(), 3);
        assert_eq!(store.snapshots.len(), 3);
        assert_eq!(store.checksum(Frame::new(2)), Some(20));
        assert!(store.get(Frame::new(3)).is_none());
    }

    #[test]
    fn nearest_at_or_before_finds_checkpoint() {
        let mut store = StateStore::new(8);
        for f in [0, 2, 4] {
            let _ = store.insert(snap(f, f as u8));
        }
        assert_eq!(store.nearest_at_or_before(Frame::new(3)).unwrap().frame, Frame::new(2));
        assert_eq!(store.nearest_at_or_before(Frame::new(4)).unwrap().frame, Frame::new(4));
        assert!(store.nearest_at_or_before(Frame::NULL).is_none());
    }

    #[test]
    fn clear_hands_back_everything() {
        let mut store = StateStore::new(4);
        for f in 0..4 {
            let _ = store.insert(snap(f, f as u8));
        }
        assert_eq!(store.clear().len(), 4);
        assert!(store.snapshots.is_empty());
        assert!(store.newest_frame().is_null());
    }

    #[test]
    fn discard_after_keeps_the_given_frame() {
        let mut store = StateStore::new(8);
        for f in 0..5 {
            let _ = store.insert(snap(f, f as u8));
        }
        let released = store.discard_after(Frame::new(2));
        assert_eq!(released, vec![SaveBuffer::new(vec![4]), SaveBuffer::new(vec![3])]);
        assert_eq!(store.newest_frame(), Frame::new(2));
        assert!(store.discard_after(Frame::new(2)).is_empty());
        assert!(store.check_invariants().is_ok());
    }

    #[test]
    fn zero_capacity_still_holds_one() {
        let mut store = StateStore::new(0);
        assert_eq!(store.capacity, 1);
        let _ = store.insert(snap(0, 0));
        assert_eq!(store.insert(snap(1, 1)).len(), 1);
    }
}
