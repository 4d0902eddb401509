//! Named shared memory segments.
//!
//! A segment is a memory-mapped file under `/dev/shm` (or the temp dir
//! on other platforms), named after the cache directory it serves, so
//! every process of a swap directory attaches the same region without a
//! broker. The coordinator process creates and unlinks the segment;
//! workers only attach.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::{RockError, RockResult};

/// Where segment files live.
fn shm_dir() -> PathBuf {
    if cfg!(target_os = "linux") {
        PathBuf::from("/dev/shm")
    } else {
        std::env::temp_dir().join("rock-store")
    }
}

/// Derive a segment file name from the cache directory path.
fn segment_name(dir_path: &Path) -> String {
    let mut name = String::from("rock");
    for part in dir_path.to_string_lossy().split(['/', '\\']) {
        if !part.is_empty() {
            name.push('.');
            name.push_str(part);
        }
    }
    name
}

/// A named shared memory region holding one directory.
#[derive(Debug)]
pub struct ShmSegment {
    mmap: MmapMut,
    base: *mut u8,
    path: PathBuf,
}

// SAFETY: the mapping is allocated once and never moves until Drop, and
// every access through `base` goes to atomics or lock-guarded memory.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Create a segment of exactly `size` bytes, zeroed.
    ///
    /// Performed once by the coordinator before any worker attaches. An
    /// existing same-named segment of the same size is recreated (its
    /// contents are discarded); one of a different size is an error, as
    /// it belongs to an incompatible configuration.
    pub fn create(dir_path: &Path, size: usize) -> RockResult<Self> {
        let dir = shm_dir();
        fs::create_dir_all(&dir).map_err(RockError::ShmCreate)?;
        let path = dir.join(segment_name(dir_path));

        if let Ok(meta) = fs::metadata(&path)
            && meta.len() != size as u64
        {
            return Err(RockError::ShmCreate(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!(
                    "segment {} exists with size {}, want {size}",
                    path.display(),
                    meta.len()
                ),
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(RockError::ShmCreate)?;
        file.set_len(size as u64).map_err(RockError::ShmCreate)?;

        // SAFETY: we created and sized the file; the mapping outlives
        // every pointer derived from it (both live in this struct).
        let mut mmap = unsafe { MmapMut::map_mut(&file) }.map_err(RockError::ShmCreate)?;
        mmap.fill(0);

        let base = mmap.as_mut_ptr();
        Ok(Self { mmap, base, path })
    }

    /// Attach to an existing segment.
    ///
    /// Fails with [`RockError::ShmAttach`] if no coordinator has created
    /// the segment yet.
    pub fn attach(dir_path: &Path) -> RockResult<Self> {
        let path = shm_dir().join(segment_name(dir_path));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(RockError::ShmAttach)?;

        // SAFETY: as in create(); the creating process sized the file.
        let mut mmap = unsafe { MmapMut::map_mut(&file) }.map_err(RockError::ShmAttach)?;
        let base = mmap.as_mut_ptr();
        Ok(Self { mmap, base, path })
    }

    /// Remove the segment's backing file. Coordinator teardown only;
    /// existing mappings stay valid until dropped.
    pub fn unlink(dir_path: &Path) {
        let _ = fs::remove_file(shm_dir().join(segment_name(dir_path)));
    }

    /// Size of the region in bytes.
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// Whether the region is empty.
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Path of the backing file, for logging.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Base pointer of the region.
    pub(crate) fn base_ptr(&self) -> *mut u8 {
        self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_then_attach() {
        let dir = tempdir().unwrap();
        let cache_dir = dir.path().join("cache");

        let segment = ShmSegment::create(&cache_dir, 4096).expect("create");
        assert_eq!(segment.len(), 4096);
        assert!(!segment.is_empty());

        let attached = ShmSegment::attach(&cache_dir).expect("attach");
        assert_eq!(attached.len(), 4096);

        drop(segment);
        drop(attached);
        ShmSegment::unlink(&cache_dir);
        assert!(ShmSegment::attach(&cache_dir).is_err());
    }

    #[test]
    fn attach_requires_existing_segment() {
        let dir = tempdir().unwrap();
        let err = ShmSegment::attach(&dir.path().join("nothing")).unwrap_err();
        assert!(matches!(err, RockError::ShmAttach(_)));
    }

    #[test]
    fn create_rejects_size_mismatch() {
        let dir = tempdir().unwrap();
        let cache_dir = dir.path().join("cache");

        let _segment = ShmSegment::create(&cache_dir, 4096).expect("create");
        let err = ShmSegment::create(&cache_dir, 8192).unwrap_err();
        assert!(matches!(err, RockError::ShmCreate(_)));

        ShmSegment::unlink(&cache_dir);
    }

    #[test]
    fn create_zeroes_existing_contents() {
        let dir = tempdir().unwrap();
        let cache_dir = dir.path().join("cache");

        {
            let segment = ShmSegment::create(&cache_dir, 64).expect("create");
            // SAFETY: exclusive access in this test.
            unsafe { *segment.base_ptr() = 0xFF };
        }
        let segment = ShmSegment::create(&cache_dir, 64).expect("recreate");
        // SAFETY: exclusive access in this test.
        assert_eq!(unsafe { *segment.base_ptr() }, 0);

        ShmSegment::unlink(&cache_dir);
    }

    #[test]
    fn names_do_not_collide() {
        let a = segment_name(Path::new("/var/cache/rock1"));
        let b = segment_name(Path::new("/var/cache/rock2"));
        assert_ne!(a, b);
        assert!(a.starts_with("rock."));
        assert!(!a.contains('/'));
    }
}
