//! Blocking I/O strategy.
//!
//! Performs the syscall on the calling thread and posts the completion
//! to the cooperative loop, so callers see the same callback-driven
//! surface as the IPC variant.

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use crate::error::{RockError, RockResult};

use super::event_loop::LoopHandle;
use super::{DiskFlag, FileHandle, FileKind, ReadDone, WriteDone, write_flag};

/// Disk I/O performed inline on the calling thread.
pub struct BlockingIo {
    loop_handle: LoopHandle,
}

impl BlockingIo {
    /// Create the strategy, posting completions through `handle`.
    pub fn new(handle: LoopHandle) -> Self {
        Self {
            loop_handle: handle,
        }
    }

    /// Open the db file on the calling process.
    pub fn open(&self, path: &Path) -> RockResult<FileHandle> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(RockError::FileOpen)?;
        Ok(FileHandle::new(FileKind::Local(Arc::new(file))))
    }

    pub(crate) fn read(&self, file: &FileHandle, offset: i64, len: usize, done: ReadDone) {
        let FileKind::Local(file) = &*file.kind else {
            unreachable!("blocking strategy opened a remote handle");
        };
        let mut buf = vec![0u8; len];
        let (transferred, flag) = match file.read_exact_at(&mut buf, offset as u64) {
            Ok(()) => (len, DiskFlag::Ok),
            Err(_) => (0, DiskFlag::Error),
        };
        self.loop_handle.submitted();
        self.loop_handle
            .post(Box::new(move || done(buf, transferred, flag)));
    }

    pub(crate) fn write(&self, file: &FileHandle, offset: i64, buf: Vec<u8>, done: WriteDone) {
        let FileKind::Local(file) = &*file.kind else {
            unreachable!("blocking strategy opened a remote handle");
        };
        let (transferred, flag) = match file.write_all_at(&buf, offset as u64) {
            Ok(()) => (buf.len(), DiskFlag::Ok),
            Err(err) => (0, write_flag(&err)),
        };
        self.loop_handle.submitted();
        self.loop_handle
            .post(Box::new(move || done(transferred, flag)));
    }

    /// Inline syscalls never queue, so there is no load to shed.
    pub fn shed_load(&self) -> bool {
        false
    }

    /// A fixed medium load; there is no queue to measure.
    pub fn load(&self) -> u8 {
        50
    }
}
