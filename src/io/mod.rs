//! Asynchronous disk I/O.
//!
//! Reads and writes are submitted against a [`FileHandle`] and complete
//! via one-shot callbacks on the cooperative loop. Two strategies exist
//! behind the [`IoStrategy`] tagged variant, monomorphised at each call
//! site rather than dispatched dynamically:
//!
//! - [`BlockingIo`]: the syscall runs on the calling thread and the
//!   completion is posted to the loop. Single-process deployments.
//! - [`IpcIo`]: the request crosses a queue to a disker owning the file
//!   handle; the disker posts the completion back. SMP deployments.
//!
//! For a given request state at most one I/O is outstanding, so a caller
//! never observes reordered completions.

pub mod event_loop;
pub mod state;

mod blocking;
mod ipc;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub use blocking::BlockingIo;
pub use ipc::IpcIo;

use crate::config::IoModule;
use crate::error::RockResult;
use self::event_loop::LoopHandle;

/// Completion flag delivered with every read and write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskFlag {
    /// The operation transferred every requested byte.
    Ok,
    /// The operation failed.
    Error,
    /// A write reported no space left.
    NoSpace,
}

/// Raw read completion: buffer, bytes transferred, flag.
pub(crate) type ReadDone = Box<dyn FnOnce(Vec<u8>, usize, DiskFlag) + Send + 'static>;

/// Raw write completion: bytes transferred, flag.
pub(crate) type WriteDone = Box<dyn FnOnce(usize, DiskFlag) + Send + 'static>;

enum FileKind {
    /// The calling process owns the descriptor.
    Local(Arc<std::fs::File>),
    /// A disker owns the descriptor; we hold its queue.
    Remote(ipc::DiskerHandle),
}

/// Handle to an opened db file under some strategy.
///
/// Carries a sticky error flag: once a write fails the file is treated
/// as unwritable until the process restarts, and `can_store` steers new
/// objects elsewhere.
#[derive(Clone)]
pub struct FileHandle {
    kind: Arc<FileKind>,
    error: Arc<AtomicBool>,
}

impl FileHandle {
    fn new(kind: FileKind) -> Self {
        Self {
            kind: Arc::new(kind),
            error: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether a write against this file has failed.
    pub fn error(&self) -> bool {
        self.error.load(Ordering::Acquire)
    }

    /// Latch the error flag.
    pub(crate) fn set_error(&self) {
        self.error.store(true, Ordering::Release);
    }

    /// Whether the file accepts new writes.
    pub fn can_write(&self) -> bool {
        !self.error()
    }
}

/// Polymorphic disk I/O, selected by configuration at startup.
pub enum IoStrategy {
    /// Syscalls on the calling thread.
    Blocking(BlockingIo),
    /// Requests queued to a disker.
    Ipc(IpcIo),
}

impl IoStrategy {
    /// Build the configured strategy, posting completions through
    /// `handle`.
    pub fn from_module(module: IoModule, handle: LoopHandle) -> Self {
        match module {
            IoModule::Blocking => IoStrategy::Blocking(BlockingIo::new(handle)),
            IoModule::IpcIo => IoStrategy::Ipc(IpcIo::new(handle)),
        }
    }

    /// Open the db file for read/write under this strategy.
    pub fn open(&self, path: &Path) -> RockResult<FileHandle> {
        match self {
            IoStrategy::Blocking(io) => io.open(path),
            IoStrategy::Ipc(io) => io.open(path),
        }
    }

    /// Submit a positional read of `len` bytes at `offset`.
    pub(crate) fn read(&self, file: &FileHandle, offset: i64, len: usize, done: ReadDone) {
        match self {
            IoStrategy::Blocking(io) => io.read(file, offset, len, done),
            IoStrategy::Ipc(io) => io.read(file, offset, len, done),
        }
    }

    /// Submit a positional write of `buf` at `offset`.
    pub(crate) fn write(&self, file: &FileHandle, offset: i64, buf: Vec<u8>, done: WriteDone) {
        match self {
            IoStrategy::Blocking(io) => io.write(file, offset, buf, done),
            IoStrategy::Ipc(io) => io.write(file, offset, buf, done),
        }
    }

    /// Whether the strategy is overloaded and new stores should be
    /// refused.
    pub fn shed_load(&self) -> bool {
        match self {
            IoStrategy::Blocking(io) => io.shed_load(),
            IoStrategy::Ipc(io) => io.shed_load(),
        }
    }

    /// Current load, scaled 0-100.
    pub fn load(&self) -> u8 {
        match self {
            IoStrategy::Blocking(io) => io.load(),
            IoStrategy::Ipc(io) => io.load(),
        }
    }
}

/// Map an I/O error to the completion flag writes report.
fn write_flag(err: &std::io::Error) -> DiskFlag {
    if err.kind() == std::io::ErrorKind::StorageFull {
        DiskFlag::NoSpace
    } else {
        DiskFlag::Error
    }
}
