//! The shared slot directory.
//!
//! [`DirMap`] maps content keys to cell numbers over a flat slot array
//! in a shared segment. Cooperating processes coordinate purely through
//! the slot atomics: a failed lock is contention and surfaces as `None`
//! or `false`, never as a wait.
//!
//! # Segment layout
//!
//! ```text
//! +-------------------+
//! | limit      u32    |
//! | count      u32    |
//! +-------------------+
//! | slot 0            |
//! | slot 1            |
//! | ...               |
//! | slot limit-1      |
//! +-------------------+
//! ```
//!
//! `limit` is immutable after creation; `count` tracks the number of
//! non-`Empty` slots at every instant.

use std::mem::size_of;
use std::path::Path;
use std::slice;

use crate::entry::EntryBasics;
use crate::error::{RockError, RockResult};
use crate::key::CacheKey;
use crate::shm::ShmSegment;
use crate::slot::{Slot, SlotState};
use crate::sync::{AtomicU32, Ordering};

/// Dense integer identifier of a cell and its directory slot.
pub type FileNo = u32;

/// Hard ceiling on the number of slots a directory may hold.
///
/// Keeps every cell offset comfortably inside `i64` for any permitted
/// cell size.
pub const ABSOLUTE_ENTRY_LIMIT: u32 = 0x00FF_FFFF;

/// Fixed header preceding the slot array in the segment.
#[repr(C)]
struct MapHeader {
    /// Maximum number of slots; immutable after creation.
    limit: u32,
    /// Current number of non-`Empty` slots.
    count: AtomicU32,
}

/// Map of used db slots indexed by fileno.
pub struct DirMap {
    shm: ShmSegment,
}

impl DirMap {
    /// Bytes of shared memory a directory of `limit` slots needs.
    pub fn shared_size(limit: u32) -> usize {
        size_of::<MapHeader>() + limit as usize * size_of::<Slot>()
    }

    /// Create a new shared directory (coordinator process only).
    pub fn create(dir_path: &Path, limit: u32) -> RockResult<Self> {
        let limit = limit.clamp(1, ABSOLUTE_ENTRY_LIMIT);
        let shm = ShmSegment::create(dir_path, Self::shared_size(limit))?;
        let map = Self { shm };
        // The zeroed segment already reads as count == 0 with every slot
        // Empty; only the limit needs stamping, before any worker can
        // observe the segment.
        // SAFETY: the header is the first bytes of our own fresh mapping.
        unsafe { (*(map.shm.base_ptr() as *mut MapHeader)).limit = limit };
        Ok(map)
    }

    /// Attach to an existing shared directory (worker process).
    pub fn open(dir_path: &Path) -> RockResult<Self> {
        let shm = ShmSegment::attach(dir_path)?;
        if shm.len() < size_of::<MapHeader>() {
            return Err(RockError::ShmAttach(invalid_segment("segment too small")));
        }
        let map = Self { shm };
        let limit = map.entry_limit();
        if limit == 0 || limit > ABSOLUTE_ENTRY_LIMIT {
            return Err(RockError::ShmAttach(invalid_segment(
                "segment holds an invalid slot limit",
            )));
        }
        if map.shm.len() != Self::shared_size(limit) {
            return Err(RockError::ShmAttach(invalid_segment(
                "segment size does not match its slot limit",
            )));
        }
        Ok(map)
    }

    fn header(&self) -> &MapHeader {
        // SAFETY: the segment starts with a MapHeader and outlives self.
        unsafe { &*(self.shm.base_ptr() as *const MapHeader) }
    }

    fn slots(&self) -> &[Slot] {
        // SAFETY: the segment holds exactly `limit` slots after the
        // header (validated in open, sized in create); zeroed memory is
        // a valid Slot image.
        unsafe {
            slice::from_raw_parts(
                self.shm.base_ptr().add(size_of::<MapHeader>()) as *const Slot,
                self.entry_limit() as usize,
            )
        }
    }

    fn slot(&self, fileno: FileNo) -> &Slot {
        &self.slots()[fileno as usize]
    }

    /// First slot probed for `key`.
    fn slot_idx(&self, key: &CacheKey) -> u32 {
        key.word(0) % self.entry_limit()
    }

    /// Maximum number of slots that can be used.
    pub fn entry_limit(&self) -> u32 {
        self.header().limit
    }

    /// Number of used slots.
    pub fn entry_count(&self) -> u32 {
        self.header().count.load(Ordering::Acquire)
    }

    /// Whether there are no empty slots left.
    pub fn full(&self) -> bool {
        self.entry_count() >= self.entry_limit()
    }

    /// Whether `fileno` is a valid slot coordinate.
    pub fn valid(&self, fileno: FileNo) -> bool {
        fileno < self.entry_limit()
    }

    /// Find space for writing the entry with `key`, or return `None`.
    ///
    /// Probes linearly from the key's home slot, at most one full pass.
    /// For each candidate the exclusive lock is taken first, then:
    /// a doomed `Readable` slot is reclaimed for the new key, a
    /// `Readable` slot holding the same key is overwritten in place
    /// (reusing its fileno), and an `Empty` slot is claimed fresh.
    /// Everything else stays untouched and the probe moves on.
    ///
    /// On success the slot is `Writeable`, the key is stored, and the
    /// caller owns the exclusive lock until
    /// [`close_for_writing`](Self::close_for_writing) or
    /// [`abort_writing`](Self::abort_writing).
    pub fn open_for_writing(&self, key: &CacheKey) -> Option<(FileNo, &Slot)> {
        let limit = self.entry_limit();
        let start = self.slot_idx(key);
        for i in 0..limit {
            let fileno = (start + i) % limit;
            let slot = self.slot(fileno);
            if !slot.exclusive_lock() {
                continue;
            }
            match slot.state() {
                SlotState::Readable if slot.waiting_to_be_freed() => {
                    // reclaim a doomed entry; the slot stays non-Empty
                    // so count is unchanged
                    slot.set_key(key);
                    slot.set_basics(EntryBasics::default());
                    slot.clear_waiting_to_be_freed();
                    slot.set_state(SlotState::Writeable);
                    return Some((fileno, slot));
                }
                SlotState::Readable if slot.check_key(key) => {
                    slot.set_state(SlotState::Writeable);
                    return Some((fileno, slot));
                }
                SlotState::Empty => {
                    slot.set_key(key);
                    slot.clear_waiting_to_be_freed();
                    slot.set_state(SlotState::Writeable);
                    self.header().count.fetch_add(1, Ordering::AcqRel);
                    return Some((fileno, slot));
                }
                _ => {
                    slot.release_exclusive();
                    self.free_if_needed(fileno);
                }
            }
        }
        None
    }

    /// Finish writing: publish the slot as `Readable`.
    ///
    /// The caller must have stored the final basics into the slot. With
    /// `keep_read_lock` the exclusive lock is downgraded to a single
    /// shared lock that the entry keeps; otherwise it is released.
    pub fn close_for_writing(&self, fileno: FileNo, keep_read_lock: bool) {
        let slot = self.slot(fileno);
        debug_assert_eq!(slot.state(), SlotState::Writeable);
        slot.set_state(SlotState::Readable);
        if keep_read_lock {
            slot.downgrade_to_shared();
        } else {
            slot.release_exclusive();
            self.free_if_needed(fileno);
        }
    }

    /// Release the exclusive lock without publishing.
    ///
    /// Used when a write fails mid-flight: the caller marks the slot
    /// with [`free`](Self::free) first, and the release here lets the
    /// pending-free finalizer reset the slot to `Empty`.
    pub fn abort_writing(&self, fileno: FileNo) {
        let slot = self.slot(fileno);
        debug_assert!(slot.waiting_to_be_freed());
        slot.release_exclusive();
        self.free_if_needed(fileno);
    }

    /// Open the slot holding `key` for reading, or return `None`.
    ///
    /// On success the slot stays read-locked until
    /// [`close_for_reading`](Self::close_for_reading). Doomed slots are
    /// invisible to new readers.
    pub fn open_for_reading(&self, key: &CacheKey) -> Option<(FileNo, &Slot)> {
        let limit = self.entry_limit();
        let start = self.slot_idx(key);
        for i in 0..limit {
            let fileno = (start + i) % limit;
            let slot = self.slot(fileno);
            if !slot.shared_lock() {
                continue;
            }
            if slot.state() == SlotState::Readable
                && !slot.waiting_to_be_freed()
                && slot.check_key(key)
            {
                return Some((fileno, slot));
            }
            slot.release_shared();
            self.free_if_needed(fileno);
        }
        None
    }

    /// Open a specific slot for reading, or return `None`.
    ///
    /// Same contract as [`open_for_reading`](Self::open_for_reading),
    /// addressed directly; used by completion paths that already hold a
    /// fileno.
    pub fn open_for_reading_at(&self, fileno: FileNo) -> Option<&Slot> {
        if !self.valid(fileno) {
            return None;
        }
        let slot = self.slot(fileno);
        if !slot.shared_lock() {
            return None;
        }
        if slot.state() == SlotState::Readable && !slot.waiting_to_be_freed() {
            return Some(slot);
        }
        slot.release_shared();
        self.free_if_needed(fileno);
        None
    }

    /// Peek at the basics of a slot the caller already holds a lock on.
    ///
    /// Returns `None` while the slot is still being filled; there is no
    /// support for reading a cell mid-write.
    pub fn peek_at_reader(&self, fileno: FileNo) -> Option<EntryBasics> {
        if !self.valid(fileno) {
            return None;
        }
        let slot = self.slot(fileno);
        match slot.state() {
            SlotState::Readable => Some(slot.basics()),
            _ => None,
        }
    }

    /// Release one shared lock on the slot.
    pub fn close_for_reading(&self, fileno: FileNo) {
        let slot = self.slot(fileno);
        slot.release_shared();
        self.free_if_needed(fileno);
    }

    /// Mark the slot as waiting to be freed and, if possible, free it.
    ///
    /// With readers or a writer still attached the reclaim is deferred
    /// to the last lock release. Freeing an `Empty` slot is a no-op
    /// beyond clearing the mark.
    pub fn free(&self, fileno: FileNo) {
        let slot = self.slot(fileno);
        slot.mark_waiting_to_be_freed();
        self.free_if_needed(fileno);
    }

    /// Store `key` and `basics` at the requested slot, or return false.
    ///
    /// Used by the rebuilder to place recovered entries at the fileno
    /// their cell occupies on disk. The slot is published `Readable`
    /// with no lock retained.
    pub fn put_at(&self, key: &CacheKey, basics: &EntryBasics, fileno: FileNo) -> bool {
        if !self.valid(fileno) {
            return false;
        }
        let slot = self.slot(fileno);
        if !slot.exclusive_lock() {
            return false;
        }
        let was_empty = slot.state() == SlotState::Empty;
        slot.set_key(key);
        slot.set_basics(*basics);
        slot.clear_waiting_to_be_freed();
        slot.set_state(SlotState::Readable);
        if was_empty {
            self.header().count.fetch_add(1, Ordering::AcqRel);
        }
        slot.release_exclusive();
        true
    }

    /// Finalize a pending free once the slot is unlocked.
    ///
    /// Every lock-release path funnels through here, so whichever
    /// holder lets go last resets the slot. Taking the exclusive lock
    /// re-checks the mark, making concurrent finalizers converge on a
    /// single reset.
    fn free_if_needed(&self, fileno: FileNo) {
        let slot = self.slot(fileno);
        if !slot.waiting_to_be_freed() {
            return;
        }
        if !slot.exclusive_lock() {
            // some other holder is still attached and will finalize
            return;
        }
        if !slot.waiting_to_be_freed() {
            slot.release_exclusive();
            return;
        }
        let was_occupied = slot.state() != SlotState::Empty;
        slot.reset();
        if was_occupied {
            self.header().count.fetch_sub(1, Ordering::AcqRel);
        }
        slot.release_exclusive();
    }
}

fn invalid_segment(reason: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, reason.to_string())
}
