//! Store entry handles and the per-slot metadata block.

use crate::dir_map::FileNo;
use crate::key::CacheKey;

/// Current time as coarse unix seconds.
pub(crate) fn now_secs() -> i64 {
    clocksource::coarse::UnixInstant::now()
        .duration_since(clocksource::coarse::UnixInstant::EPOCH)
        .as_secs() as i64
}

/// The fixed set of per-entry metadata kept in a directory slot and
/// mirrored into the cell's swap header on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryBasics {
    /// Response generation time, unix seconds.
    pub timestamp: i64,
    /// Last reference time, unix seconds.
    pub lastref: i64,
    /// Expiry time, unix seconds; negative when unknown.
    pub expires: i64,
    /// Last-modified time, unix seconds; negative when unknown.
    pub lastmod: i64,
    /// Total payload bytes stored in the cell (swap header included).
    pub swap_file_sz: u64,
    /// Reference count reported by the outer store.
    pub refcount: u16,
    /// Outer-store flag bits, carried opaquely.
    pub flags: u16,
}

impl EntryBasics {
    /// Capture the basics of an entry about to be written.
    pub fn from_entry(e: &StoreEntry) -> Self {
        Self {
            timestamp: e.timestamp,
            lastref: e.lastref,
            expires: e.expires,
            lastmod: e.lastmod,
            swap_file_sz: e.swap_file_sz,
            refcount: e.refcount,
            flags: e.flags,
        }
    }
}

/// An object handle exchanged with the outer store layer.
///
/// The swap directory synthesizes one of these from slot basics on a
/// directory hit, and consumes one when creating or opening cell I/O.
/// While `fileno` is set the entry holds a lock on that slot and must be
/// handed back through `unlink` or `disconnect`.
#[derive(Debug, Clone)]
pub struct StoreEntry {
    /// Content key of the object.
    pub key: CacheKey,
    /// Response generation time, unix seconds.
    pub timestamp: i64,
    /// Last reference time, unix seconds.
    pub lastref: i64,
    /// Expiry time, unix seconds; negative when unknown.
    pub expires: i64,
    /// Last-modified time, unix seconds; negative when unknown.
    pub lastmod: i64,
    /// Total payload bytes in the cell; filled in by the swap directory.
    pub swap_file_sz: u64,
    /// Reference count reported by the outer store.
    pub refcount: u16,
    /// Outer-store flag bits, carried opaquely.
    pub flags: u16,
    /// Body bytes the outer store expects to write after the swap header.
    ///
    /// Must be known before cell I/O is created so the cell cannot
    /// overflow.
    pub expected_reply_size: u64,
    /// The slot this entry is attached to, when locked.
    pub fileno: Option<FileNo>,
}

impl StoreEntry {
    /// Create a fresh entry for the given key, stamped with the current
    /// time and not yet attached to any slot.
    pub fn new(key: CacheKey) -> Self {
        let now = now_secs();
        Self {
            key,
            timestamp: now,
            lastref: now,
            expires: -1,
            lastmod: -1,
            swap_file_sz: 0,
            refcount: 1,
            flags: 0,
            expected_reply_size: 0,
            fileno: None,
        }
    }

    /// Synthesize an entry from slot basics after a directory hit.
    ///
    /// The caller keeps the read lock the lookup acquired; `fileno`
    /// records the locked slot.
    pub fn from_basics(key: CacheKey, fileno: FileNo, basics: &EntryBasics) -> Self {
        Self {
            key,
            timestamp: basics.timestamp,
            lastref: basics.lastref,
            expires: basics.expires,
            lastmod: basics.lastmod,
            swap_file_sz: basics.swap_file_sz,
            refcount: basics.refcount,
            flags: basics.flags,
            expected_reply_size: 0,
            fileno: Some(fileno),
        }
    }
}
