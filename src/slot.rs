//! Directory slots and their per-slot read/write lock.
//!
//! A [`Slot`] lives in the shared segment, paired 1:1 with an on-disk
//! cell. All fields that more than one process may touch are atomics;
//! the basics block is plain memory written only under the exclusive
//! lock and read only under a shared or exclusive lock, so the lock
//! orderings carry its happens-before edges.
//!
//! # State transition diagram
//!
//! ```text
//! Empty ──exclusive_lock + fill──▶ Writeable ──publish──▶ Readable
//! Readable ──exclusive_lock──▶ Writeable        (overwrite)
//! any ──waiting_to_be_freed + last-release──▶ Empty
//! ```

use std::cell::UnsafeCell;

use crate::entry::EntryBasics;
use crate::key::CacheKey;
use crate::sync::{AtomicU8, AtomicU32, Ordering};

/// Persistent state of a directory slot.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Nothing of value; ready for a writer to claim.
    Empty = 0,
    /// A writer holds the exclusive lock and is filling the cell.
    Writeable = 1,
    /// The cell has been fully written at least once; readable.
    Readable = 2,
}

impl SlotState {
    /// Convert from the raw stored byte.
    ///
    /// # Panics
    /// Panics if the value is not a valid state (0-2). The segment is
    /// zeroed at creation and only this crate writes state bytes.
    #[inline]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => SlotState::Empty,
            1 => SlotState::Writeable,
            2 => SlotState::Readable,
            _ => panic!("invalid slot state value: {value}"),
        }
    }
}

/// One directory slot in the shared segment.
///
/// Zeroed memory is a valid slot: state `Empty`, null key, no locks.
/// The directory casts the segment's slot array directly; slots are
/// never constructed on the heap outside tests.
#[repr(C)]
pub struct Slot {
    /// The content key, stored word-by-word under the exclusive lock.
    key: [AtomicU32; CacheKey::WORDS],
    /// Entry basics; guarded by the slot lock, not by its own atomics.
    basics: UnsafeCell<EntryBasics>,
    /// Current [`SlotState`], as a raw byte.
    state: AtomicU8,
    /// State-independent doomed mark; settable from any state.
    waiting_to_be_freed: AtomicU8,
    /// Number of holders of the shared lock.
    readers: AtomicU32,
    /// Number of holders of the exclusive lock; 0 or 1.
    writers: AtomicU32,
}

// SAFETY: every field except `basics` is atomic. `basics` is written
// only while `writers == 1` and read only while the caller holds a
// shared or exclusive lock; the acquire/release pairs on the lock words
// order those accesses across threads and processes.
unsafe impl Send for Slot {}
unsafe impl Sync for Slot {}

impl Slot {
    /// Lock for reading, or return false.
    ///
    /// Never blocks; a false return means the slot is being written and
    /// the caller should probe elsewhere.
    pub fn shared_lock(&self) -> bool {
        self.readers.fetch_add(1, Ordering::AcqRel);
        if self.writers.load(Ordering::Acquire) == 0 {
            true
        } else {
            self.readers.fetch_sub(1, Ordering::Release);
            false
        }
    }

    /// Lock for modification, or return false.
    pub fn exclusive_lock(&self) -> bool {
        if self
            .writers
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if self.readers.load(Ordering::Acquire) == 0 {
            true
        } else {
            self.writers.store(0, Ordering::Release);
            false
        }
    }

    /// Undo a successful [`shared_lock`](Self::shared_lock).
    pub fn release_shared(&self) {
        let prev = self.readers.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0, "release_shared without a shared lock");
    }

    /// Undo a successful [`exclusive_lock`](Self::exclusive_lock).
    pub fn release_exclusive(&self) {
        debug_assert_eq!(self.writers.load(Ordering::Acquire), 1);
        self.writers.store(0, Ordering::Release);
    }

    /// Atomically turn the held exclusive lock into a single shared
    /// lock.
    ///
    /// The reader count is raised before the writer bit drops, so no
    /// competing writer can slip in between.
    pub fn downgrade_to_shared(&self) {
        debug_assert_eq!(self.writers.load(Ordering::Acquire), 1);
        self.readers.fetch_add(1, Ordering::AcqRel);
        self.writers.store(0, Ordering::Release);
    }

    /// Current holders of the shared lock.
    pub fn readers(&self) -> u32 {
        self.readers.load(Ordering::Acquire)
    }

    /// Current holders of the exclusive lock (0 or 1).
    pub fn writers(&self) -> u32 {
        self.writers.load(Ordering::Acquire)
    }

    /// Current state.
    pub fn state(&self) -> SlotState {
        SlotState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Store a new state. Caller must hold the exclusive lock.
    pub fn set_state(&self, state: SlotState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Whether the slot has been marked for reclaim.
    pub fn waiting_to_be_freed(&self) -> bool {
        self.waiting_to_be_freed.load(Ordering::Acquire) != 0
    }

    /// Mark the slot for reclaim. Valid from any state, lock or no lock.
    pub fn mark_waiting_to_be_freed(&self) {
        self.waiting_to_be_freed.store(1, Ordering::Release);
    }

    /// Clear the reclaim mark. Caller must hold the exclusive lock.
    pub fn clear_waiting_to_be_freed(&self) {
        self.waiting_to_be_freed.store(0, Ordering::Release);
    }

    /// Store the key word-by-word. Caller must hold the exclusive lock.
    pub fn set_key(&self, key: &CacheKey) {
        for (word, value) in self.key.iter().zip(key.words()) {
            word.store(value, Ordering::Release);
        }
    }

    /// Whether the stored key matches `key`.
    ///
    /// Callers verify the key under a lock before trusting basics.
    pub fn check_key(&self, key: &CacheKey) -> bool {
        self.key
            .iter()
            .zip(key.words())
            .all(|(word, value)| word.load(Ordering::Acquire) == value)
    }

    /// Load the stored key.
    pub fn key(&self) -> CacheKey {
        let mut words = [0u32; CacheKey::WORDS];
        for (value, word) in words.iter_mut().zip(&self.key) {
            *value = word.load(Ordering::Acquire);
        }
        CacheKey::from_words(words)
    }

    /// Store the basics block. Caller must hold the exclusive lock.
    pub fn set_basics(&self, basics: EntryBasics) {
        // SAFETY: writers == 1 excludes all other writers and readers;
        // the release on the subsequent state/lock store publishes this.
        unsafe { *self.basics.get() = basics }
    }

    /// Load the basics block. Caller must hold a shared or exclusive
    /// lock taken after the slot became `Readable`.
    pub fn basics(&self) -> EntryBasics {
        // SAFETY: the lock held by the caller orders this read after the
        // writer's release of the basics block.
        unsafe { *self.basics.get() }
    }

    /// Reset to the zeroed `Empty` image. Caller must hold the
    /// exclusive lock.
    pub(crate) fn reset(&self) {
        for word in &self.key {
            word.store(0, Ordering::Release);
        }
        self.set_basics(EntryBasics::default());
        self.clear_waiting_to_be_freed();
        self.set_state(SlotState::Empty);
    }

    #[cfg(test)]
    pub(crate) fn new_for_tests() -> Self {
        Self {
            key: [
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
            ],
            basics: UnsafeCell::new(EntryBasics::default()),
            state: AtomicU8::new(SlotState::Empty as u8),
            waiting_to_be_freed: AtomicU8::new(0),
            readers: AtomicU32::new(0),
            writers: AtomicU32::new(0),
        }
    }
}
