//! Per-request I/O state.
//!
//! An [`IoState`] tracks one in-flight read or write against one cell.
//! It is shared between the submitter and the completion handler (the
//! longest holder keeps it alive); the directory itself never holds a
//! strong reference.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::dir_map::{DirMap, FileNo};
use crate::error::RockError;
use crate::io::event_loop::CbGuard;
use crate::io::{DiskFlag, FileHandle};
use crate::metrics::StoreCounters;

/// Callback invoked once when a read chunk lands.
pub type ReadCb = Box<dyn FnOnce(&[u8], usize, DiskFlag) + Send + 'static>;

/// Callback invoked once when the cell write finishes, success or not.
pub type FinishCb = Box<dyn FnOnce(DiskFlag) + Send + 'static>;

struct Inner {
    /// Cumulative bytes transferred, measured from the cell start.
    offset: i64,
    read_cb: Option<ReadCb>,
    finish_cb: Option<FinishCb>,
}

/// State of one in-flight read or write against one cell.
pub struct IoState {
    swap_dirn: usize,
    fileno: FileNo,
    disk_offset: i64,
    payload_end: i64,
    disk_offset_limit: i64,
    map: Arc<DirMap>,
    file: FileHandle,
    counters: Arc<StoreCounters>,
    guard: CbGuard,
    inner: Mutex<Inner>,
}

impl IoState {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        swap_dirn: usize,
        fileno: FileNo,
        disk_offset: i64,
        payload_end: i64,
        disk_offset_limit: i64,
        map: Arc<DirMap>,
        file: FileHandle,
        counters: Arc<StoreCounters>,
        guard: CbGuard,
    ) -> Arc<Self> {
        debug_assert!(disk_offset + payload_end <= disk_offset_limit);
        Arc::new(Self {
            swap_dirn,
            fileno,
            disk_offset,
            payload_end,
            disk_offset_limit,
            map,
            file,
            counters,
            guard,
            inner: Mutex::new(Inner {
                offset: 0,
                read_cb: None,
                finish_cb: None,
            }),
        })
    }

    /// Index of the swap directory this request belongs to.
    pub fn swap_dirn(&self) -> usize {
        self.swap_dirn
    }

    /// The cell this request operates on.
    pub fn fileno(&self) -> FileNo {
        self.fileno
    }

    /// Byte offset of the cell in the db file.
    pub fn disk_offset(&self) -> i64 {
        self.disk_offset
    }

    /// Bytes from the cell start this request may touch, cell header
    /// included.
    pub fn payload_end(&self) -> i64 {
        self.payload_end
    }

    /// Cumulative bytes transferred so far.
    pub fn offset(&self) -> i64 {
        self.inner.lock().offset
    }

    pub(crate) fn file_handle(&self) -> &FileHandle {
        &self.file
    }

    pub(crate) fn set_read_cb(&self, cb: ReadCb) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.read_cb.is_none(), "read already in flight");
        inner.read_cb = Some(cb);
    }

    pub(crate) fn set_finish_cb(&self, cb: FinishCb) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.finish_cb.is_none(), "write already in flight");
        inner.finish_cb = Some(cb);
    }

    /// Account bytes at submission time, the way writes are charged.
    pub(crate) fn advance_offset(&self, bytes: i64) {
        let mut inner = self.inner.lock();
        inner.offset += bytes;
        debug_assert!(self.disk_offset + inner.offset <= self.disk_offset_limit);
    }

    /// Handle a read completion.
    ///
    /// Advances the cumulative offset on success and invokes the read
    /// callback exactly once. A vanished owner drops the payload.
    pub fn read_completed(&self, buf: Vec<u8>, len: usize, flag: DiskFlag) {
        let cb = {
            let mut inner = self.inner.lock();
            if flag == DiskFlag::Ok {
                inner.offset += len as i64;
            }
            debug_assert!(self.disk_offset + inner.offset <= self.disk_offset_limit);
            inner.read_cb.take()
        };
        if let Some(cb) = cb
            && self.guard.valid()
        {
            cb(&buf, len, flag);
        }
    }

    /// Handle a write completion.
    ///
    /// On success the slot is published readable and the entry keeps a
    /// read lock. On error the slot is marked for reclaim and the
    /// exclusive lock released, so the pending-free finalizer resets it;
    /// the cell itself is left as-is on disk. The finish callback runs
    /// exactly once either way, locks first.
    pub fn write_completed(&self, _len: usize, flag: DiskFlag) {
        if flag == DiskFlag::Ok {
            self.map.close_for_writing(self.fileno, true);
        } else {
            if flag == DiskFlag::NoSpace {
                // should not happen for a fixed-size db file
                warn!(fileno = self.fileno, "{}", RockError::DiskFull);
            }
            self.counters.record_write_error();
            self.file.set_error();
            self.map.free(self.fileno);
            self.map.abort_writing(self.fileno);
        }
        debug_assert!(self.disk_offset + self.inner.lock().offset <= self.disk_offset_limit);

        let cb = self.inner.lock().finish_cb.take();
        if let Some(cb) = cb
            && self.guard.valid()
        {
            cb(flag);
        }
    }
}
