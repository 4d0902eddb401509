//! IPC I/O strategy.
//!
//! Requests are serialized over a message queue to a disker that owns
//! the db file handle; the disker performs the I/O and posts the
//! completion back to the requestor's loop. The disker here is a
//! dedicated thread; the queue protocol and the shared-segment
//! coordination do not depend on which side of a process boundary it
//! sits on.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::error::{RockError, RockResult};

use super::event_loop::LoopHandle;
use super::{DiskFlag, FileHandle, FileKind, ReadDone, WriteDone, write_flag};

/// Queue depth at which new stores are refused.
const MAX_QUEUE_DEPTH: usize = 64;

enum DiskerRequest {
    Read {
        offset: i64,
        len: usize,
        done: ReadDone,
    },
    Write {
        offset: i64,
        buf: Vec<u8>,
        done: WriteDone,
    },
}

/// Sending side of one disker's request queue.
#[derive(Clone)]
pub(crate) struct DiskerHandle {
    tx: Sender<DiskerRequest>,
}

/// Disk I/O delegated to a disker over a message queue.
pub struct IpcIo {
    loop_handle: LoopHandle,
    depth: Arc<AtomicUsize>,
}

impl IpcIo {
    /// Create the strategy, posting completions through `handle`.
    pub fn new(handle: LoopHandle) -> Self {
        Self {
            loop_handle: handle,
            depth: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Open the db file on a freshly spawned disker.
    pub fn open(&self, path: &Path) -> RockResult<FileHandle> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(RockError::FileOpen)?;

        let (tx, rx) = unbounded();
        let depth = Arc::clone(&self.depth);
        let loop_handle = self.loop_handle.clone();
        thread::Builder::new()
            .name("rock-disker".into())
            .spawn(move || disker_main(file, rx, depth, loop_handle))
            .map_err(RockError::FileOpen)?;

        Ok(FileHandle::new(FileKind::Remote(DiskerHandle { tx })))
    }

    pub(crate) fn read(&self, file: &FileHandle, offset: i64, len: usize, done: ReadDone) {
        let FileKind::Remote(disker) = &*file.kind else {
            unreachable!("ipc strategy opened a local handle");
        };
        self.depth.fetch_add(1, Ordering::AcqRel);
        self.loop_handle.submitted();
        let _ = disker.tx.send(DiskerRequest::Read { offset, len, done });
    }

    pub(crate) fn write(&self, file: &FileHandle, offset: i64, buf: Vec<u8>, done: WriteDone) {
        let FileKind::Remote(disker) = &*file.kind else {
            unreachable!("ipc strategy opened a local handle");
        };
        self.depth.fetch_add(1, Ordering::AcqRel);
        self.loop_handle.submitted();
        let _ = disker.tx.send(DiskerRequest::Write { offset, buf, done });
    }

    /// Whether the disker queue is past its high-water mark.
    pub fn shed_load(&self) -> bool {
        self.depth.load(Ordering::Acquire) >= MAX_QUEUE_DEPTH
    }

    /// Queue depth scaled to 0-100.
    pub fn load(&self) -> u8 {
        let depth = self.depth.load(Ordering::Acquire);
        (depth * 100 / MAX_QUEUE_DEPTH).min(100) as u8
    }
}

/// Disker main loop: drain the queue until every sender is gone.
fn disker_main(
    file: File,
    rx: Receiver<DiskerRequest>,
    depth: Arc<AtomicUsize>,
    loop_handle: LoopHandle,
) {
    for request in rx {
        match request {
            DiskerRequest::Read { offset, len, done } => {
                let mut buf = vec![0u8; len];
                let (transferred, flag) = match file.read_exact_at(&mut buf, offset as u64) {
                    Ok(()) => (len, DiskFlag::Ok),
                    Err(_) => (0, DiskFlag::Error),
                };
                depth.fetch_sub(1, Ordering::AcqRel);
                loop_handle.post(Box::new(move || done(buf, transferred, flag)));
            }
            DiskerRequest::Write { offset, buf, done } => {
                let (transferred, flag) = match file.write_all_at(&buf, offset as u64) {
                    Ok(()) => (buf.len(), DiskFlag::Ok),
                    Err(err) => (0, write_flag(&err)),
                };
                depth.fetch_sub(1, Ordering::AcqRel);
                loop_handle.post(Box::new(move || done(transferred, flag)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::event_loop::CoopLoop;
    use std::io::Write as _;
    use tempfile::tempdir;

    #[test]
    fn disker_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&[0u8; 128])
            .unwrap();

        let mut coop = CoopLoop::new();
        let io = IpcIo::new(coop.handle());
        let file = io.open(&path).expect("open");

        let witness = Arc::new(AtomicUsize::new(0));
        {
            let witness = Arc::clone(&witness);
            io.write(
                &file,
                32,
                b"payload".to_vec(),
                Box::new(move |len, flag| {
                    assert_eq!(flag, DiskFlag::Ok);
                    assert_eq!(len, 7);
                    witness.fetch_add(1, Ordering::Relaxed);
                }),
            );
        }
        coop.run_until_idle();
        assert_eq!(witness.load(Ordering::Relaxed), 1);

        {
            let witness = Arc::clone(&witness);
            io.read(
                &file,
                32,
                7,
                Box::new(move |buf, len, flag| {
                    assert_eq!(flag, DiskFlag::Ok);
                    assert_eq!(len, 7);
                    assert_eq!(&buf, b"payload");
                    witness.fetch_add(1, Ordering::Relaxed);
                }),
            );
        }
        coop.run_until_idle();
        assert_eq!(witness.load(Ordering::Relaxed), 2);
        assert!(!io.shed_load());
        assert_eq!(io.load(), 0);
    }

    #[test]
    fn open_missing_file_fails() {
        let dir = tempdir().unwrap();
        let coop = CoopLoop::new();
        let io = IpcIo::new(coop.handle());
        assert!(matches!(
            io.open(&dir.path().join("absent")),
            Err(RockError::FileOpen(_))
        ));
    }
}
