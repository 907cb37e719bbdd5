//! Generational slot arena.
//!
//! Sessions and players are stored in slots. A [`Handle`] names a slot index together
//! with the generation the slot had when the value was inserted; removing a value bumps
//! the generation so that old handles stop resolving. Validating a handle is a pure
//! data check.

use std::fmt;

/// Index plus generation of an arena slot.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    /// Creates a handle from raw parts.
    #[must_use]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// The slot index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.index as usize
    }

    /// The slot generation this handle expects.
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Why a handle did not resolve.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LookupError {
    /// The index is beyond the arena.
    OutOfRange {
        /// The index that was asked for.
        index: usize,
        /// Number of slots.
        len: usize,
    },
    /// The slot holds nothing.
    Vacant,
    /// The slot was reused since the handle was issued.
    Stale,
    /// The slot is already taken.
    Occupied,
}

#[derive(Debug, Clone)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            generation: 0,
            value: None,
        }
    }
}

/// Slot storage addressed by generational [`Handle`]s.
#[derive(Debug, Clone)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    /// Creates an empty arena that grows on demand.
    #[must_use]
    pub const fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Creates an arena with `len` vacant slots. Use [`Arena::insert_at`] to fill it.
    #[must_use]
    pub fn with_slots(len: usize) -> Self {
        let mut slots = Vec::with_capacity(len);
        slots.resize_with(len, Slot::default);
        Self { slots }
    }

    /// Number of slots, occupied or not.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.value.is_some()).count()
    }

    /// Returns `true` if no slot is occupied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.value.is_none())
    }

    /// Stores `value` in the first vacant slot, growing the arena if there is none.
    pub fn insert(&mut self, value: T) -> Handle {
        let index = match self.slots.iter().position(|s| s.value.is_none()) {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                self.slots.len() - 1
            },
        };
        self.fill(index, value)
    }

    /// Stores `value` at `index`. The slot must exist and be vacant; on failure the
    /// value is handed back.
    pub fn insert_at(&mut self, index: usize, value: T) -> Result<Handle, (LookupError, T)> {
        let len = self.slots.len();
        match self.slots.get(index) {
            None => Err((LookupError::OutOfRange { index, len }, value)),
            Some(slot) if slot.value.is_some() => Err((LookupError::Occupied, value)),
            Some(_) => Ok(self.fill(index, value)),
        }
    }

    /// Returns the first vacant index inside `range`.
    #[must_use]
    pub fn vacant_in(&self, mut range: std::ops::Range<usize>) -> Option<usize> {
        range.find(|&i| self.slots.get(i).is_some_and(|s| s.value.is_none()))
    }

    fn fill(&mut self, index: usize, value: T) -> Handle {
        let slot = &mut self.slots[index];
        slot.value = Some(value);
        Handle::new(index as u32, slot.generation)
    }

    fn slot(&self, handle: Handle) -> Result<&Slot<T>, LookupError> {
        let len = self.slots.len();
        let slot = self.slots.get(handle.index()).ok_or(LookupError::OutOfRange {
            index: handle.index(),
            len,
        })?;
        if slot.value.is_none() {
            return Err(LookupError::Vacant);
        }
        if slot.generation != handle.generation {
            return Err(LookupError::Stale);
        }
        Ok(slot)
    }

    /// Resolves a handle.
    pub fn get(&self, handle: Handle) -> Result<&T, LookupError> {
        self.slot(handle)?
            .value
            .as_ref()
            .ok_or(LookupError::Vacant)
    }

    /// Resolves a handle mutably.
    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut T, LookupError> {
        self.slot(handle)?;
        self.slots[handle.index()]
            .value
            .as_mut()
            .ok_or(LookupError::Vacant)
    }

    /// Removes the value behind `handle` and retires the handle.
    pub fn remove(&mut self, handle: Handle) -> Result<T, LookupError> {
        self.slot(handle)?;
        let slot = &mut self.slots[handle.index()];
        slot.generation = slot.generation.wrapping_add(1);
        slot.value.take().ok_or(LookupError::Vacant)
    }

    /// Iterates over occupied slots in index order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.value
                .as_ref()
                .map(|v| (Handle::new(i as u32, slot.generation), v))
        })
    }

    /// Iterates mutably over occupied slots in index order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle, &mut T)> + '_ {
        self.slots.iter_mut().enumerate().filter_map(|(i, slot)| {
            let generation = slot.generation;
            slot.value
                .as_mut()
                .map(|v| (Handle::new(i as u32, generation), v))
        })
    }

    /// Removes every value and retires all outstanding handles.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        for slot in &mut self.slots {
            if let Some(value) = slot.value.take() {
                slot.generation = slot.generation.wrapping_add(1);
                out.push(value);
            }
        }
        out
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
    fn insert_then_get() {
        let mut arena = Arena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");
        assert_eq!(arena.get(a), Ok(&"a"));
        assert_eq!(arena.get(b), Ok(&"b"));
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn removed_handle_goes_stale_after_reuse() {
        let mut arena = Arena::new();
        let first = arena.insert(1);
        assert_eq!(arena.remove(first), Ok(1));
        assert_eq!(arena.get(first), Err(LookupError::Vacant));

        let second = arena.insert(2);
        assert_eq!(second.index(), first.index());
        assert_ne!(second.generation(), first.generation());
        assert_eq!(arena.get(first), Err(LookupError::Stale));
        assert_eq!(arena.get(second), Ok(&2));
    }

    #[test]
    fn out_of_range_is_distinct_from_vacant() {
        let arena: Arena<u8> = Arena::with_slots(2);
        assert_eq!(
            arena.get(Handle::new(5, 0)),
            Err(LookupError::OutOfRange { index: 5, len: 2 })
        );
        assert_eq!(arena.get(Handle::new(1, 0)), Err(LookupError::Vacant));
    }

    #[test]
    fn insert_at_refuses_occupied_slot() {
        let mut arena = Arena::with_slots(3);
        let h = arena.insert_at(1, 'x').unwrap();
        assert_eq!(h.index(), 1);
        let (err, value) = arena.insert_at(1, 'y').unwrap_err();
        assert_eq!(err, LookupError::Occupied);
        assert_eq!(value, 'y');
        assert!(matches!(
            arena.insert_at(3, 'z'),
            Err((LookupError::OutOfRange { index: 3, len: 3 }, 'z'))
        ));
    }

    #[test]
    fn vacant_in_skips_occupied_slots() {
        let mut arena = Arena::with_slots(4);
        arena.insert_at(2, ()).unwrap();
        assert_eq!(arena.vacant_in(2..4), Some(3));
        arena.insert_at(3, ()).unwrap();
        assert_eq!(arena.vacant_in(2..4), None);
    }

    #[test]
    fn drain_retires_everything() {
        let mut arena = Arena::new();
        let h = arena.insert(7);
        assert_eq!(arena.drain(), vec![7]);
        assert!(arena.is_empty());
        let again = arena.insert(8);
        assert_eq!(arena.get(h), Err(LookupError::Stale));
        assert_eq!(arena.get(again), Ok(&8));
    }
}
