//! The swap directory facade.
//!
//! [`SwapDir`] binds the shared directory and the I/O strategy to the
//! outer store: creating the db, attaching the segment, opening cell
//! I/O for reads and writes, unlinking entries, and purging when full.
//!
//! Process roles: the master creates the db file and the shared
//! segment once; every worker then attaches via [`SwapDir::init`],
//! which also schedules the startup rebuild on the cooperative loop.

use std::fs::{self, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, info, warn};

use crate::cell::{CellHeader, HEADER_SIZE, SwapMeta};
use crate::config::RockConfig;
use crate::dir_map::{DirMap, FileNo};
use crate::entry::{EntryBasics, StoreEntry};
use crate::error::{RockError, RockResult};
use crate::io::event_loop::{CbOwner, CoopLoop};
use crate::io::state::{FinishCb, IoState, ReadCb};
use crate::io::{FileHandle, IoStrategy};
use crate::key::CacheKey;
use crate::metrics::{CounterSnapshot, StoreCounters};
use crate::rebuild::Rebuild;
use crate::shm::ShmSegment;

/// Most entries one maintenance pass may release.
pub const MAX_FREED_PER_MAINTAIN: u32 = 1_000;

/// Most slots one maintenance pass may let the policy examine.
pub const MAX_PROBED_PER_MAINTAIN: u32 = 10_000;

/// Process-wide store state shared by every swap directory.
///
/// Passed to each directory explicitly rather than kept as ambient
/// global state.
#[derive(Debug, Default)]
pub struct StoreContext {
    dirs_rebuilding: AtomicU32,
}

impl StoreContext {
    /// Create a context with no rebuilds running.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any directory is still rebuilding.
    ///
    /// Maintenance is suppressed while this holds.
    pub fn rebuilding(&self) -> bool {
        self.dirs_rebuilding.load(Ordering::Acquire) > 0
    }

    pub(crate) fn begin_rebuild(&self) {
        self.dirs_rebuilding.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn finish_rebuild(&self) {
        self.dirs_rebuilding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Opaque purge policy walker consumed by [`SwapDir::maintain`].
///
/// Walkers are expected to carry their own probe budget; `maintain`
/// additionally stops a walk after [`MAX_PROBED_PER_MAINTAIN`] examined
/// slots or [`MAX_FREED_PER_MAINTAIN`] releases.
pub trait PurgeWalker {
    /// The next victim, or `None` when the walk is exhausted.
    fn next(&mut self) -> Option<FileNo>;

    /// Number of slots examined so far.
    fn scanned(&self) -> u32;
}

/// Point-in-time statistics for one swap directory.
#[derive(Debug, Clone)]
pub struct SwapDirStats {
    /// Configured maximum db size in bytes.
    pub maximum_size: i64,
    /// Bytes accounted to stored entries, header region included.
    pub current_size: i64,
    /// Maximum number of entries.
    pub entry_limit: u32,
    /// Current number of entries.
    pub entry_count: u32,
    /// Operation counters.
    pub counters: CounterSnapshot,
}

/// A rock swap directory.
pub struct SwapDir {
    index: usize,
    config: RockConfig,
    ctx: Arc<StoreContext>,
    counters: Arc<StoreCounters>,
    io: IoStrategy,
    map: Option<Arc<DirMap>>,
    file: Option<FileHandle>,
    owner: CbOwner,
}

impl SwapDir {
    /// Build a swap directory from validated configuration.
    ///
    /// `index` is the directory's position in the outer store's table;
    /// `coop` supplies the completion queue the I/O strategy posts to.
    pub fn new(
        index: usize,
        config: RockConfig,
        ctx: Arc<StoreContext>,
        coop: &CoopLoop,
    ) -> RockResult<Self> {
        config.validate()?;
        let io = IoStrategy::from_module(config.io_module, coop.handle());
        Ok(Self {
            index,
            config,
            ctx,
            counters: Arc::new(StoreCounters::new()),
            io,
            map: None,
            file: None,
            owner: CbOwner::new(),
        })
    }

    /// Path of the db file inside the cache directory.
    pub fn db_path(&self) -> PathBuf {
        self.config.path.join("rock")
    }

    /// Configured maximum db size in bytes.
    pub fn maximum_size(&self) -> i64 {
        self.config.max_size_bytes()
    }

    /// Number of cells the db may hold.
    pub fn entry_limit_allowed(&self) -> u32 {
        self.config.entry_limit_allowed()
    }

    /// Byte offset of cell `fileno` in the db file.
    pub fn disk_offset(&self, fileno: FileNo) -> i64 {
        HEADER_SIZE + self.config.max_objsize * fileno as i64
    }

    /// One past the last byte any cell may touch.
    pub fn disk_offset_limit(&self) -> i64 {
        let limit = match &self.map {
            Some(map) => map.entry_limit(),
            None => self.entry_limit_allowed(),
        };
        self.disk_offset(limit)
    }

    /// Bytes accounted to stored entries, header region included.
    pub fn current_size(&self) -> i64 {
        HEADER_SIZE + self.config.max_objsize * self.current_count() as i64
    }

    /// Current number of entries.
    pub fn current_count(&self) -> u32 {
        self.map.as_ref().map_or(0, |map| map.entry_count())
    }

    /// Whether there are no empty slots left.
    pub fn full(&self) -> bool {
        self.map.as_ref().is_some_and(|map| map.full())
    }

    /// Create the db: the cache directory, the backing file sized to
    /// `maximum_size()`, and the zeroed reserved header.
    ///
    /// Master process only, before any worker runs `init`.
    pub fn create(&self) -> RockResult<()> {
        fs::create_dir_all(&self.config.path).map_err(RockError::FileCreate)?;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.db_path())
            .map_err(RockError::FileCreate)?;
        file.set_len(self.maximum_size() as u64)
            .map_err(RockError::FileTruncate)?;

        let header = vec![0u8; HEADER_SIZE as usize];
        file.write_all_at(&header, 0).map_err(RockError::FileCreate)?;

        info!(
            dir = self.index,
            path = %self.db_path().display(),
            size = self.maximum_size(),
            "created rock db"
        );
        Ok(())
    }

    /// Create the shared directory segment (master process only).
    pub fn create_segment(&self) -> RockResult<()> {
        DirMap::create(&self.config.path, self.entry_limit_allowed())?;
        Ok(())
    }

    /// Remove the shared directory segment (master teardown).
    pub fn unlink_segment(&self) {
        ShmSegment::unlink(&self.config.path);
    }

    /// Attach the shared segment, open the db file, and schedule the
    /// rebuild.
    pub fn init(&mut self, coop: &mut CoopLoop) -> RockResult<()> {
        if self.map.is_some() {
            return Err(RockError::ConfigInvalid(
                "swap directory already initialized".into(),
            ));
        }

        let map = Arc::new(DirMap::open(&self.config.path)?);
        if map.entry_limit() != self.entry_limit_allowed() {
            // dynamic resize is unsupported; the segment wins
            warn!(
                dir = self.index,
                segment = map.entry_limit(),
                configured = self.entry_limit_allowed(),
                "segment entry limit differs from configuration"
            );
        }

        let file = self.io.open(&self.db_path())?;

        info!(
            dir = self.index,
            size = self.maximum_size(),
            entries = map.entry_limit(),
            "rock db limits"
        );

        let rebuild = Rebuild::new(
            self.index,
            self.db_path(),
            self.config.max_objsize,
            Arc::clone(&map),
            Arc::clone(&self.ctx),
        )?;
        // Increment before the task runs: if one directory finished its
        // rebuild before another started, the store would briefly look
        // rebuilt while it is not.
        self.ctx.begin_rebuild();
        coop.schedule(Box::new(rebuild));

        self.map = Some(map);
        self.file = Some(file);
        Ok(())
    }

    /// Apply a new configuration.
    ///
    /// The entry limit is fixed once the segment exists; a change that
    /// would alter it is rejected.
    pub fn reconfigure(&mut self, config: RockConfig) -> RockResult<()> {
        config.validate()?;
        if let Some(map) = &self.map
            && config.entry_limit_allowed() != map.entry_limit()
        {
            return Err(RockError::ConfigInvalid(
                "cannot change the entry limit of an initialized swap directory".into(),
            ));
        }
        self.config = config;
        Ok(())
    }

    /// Look up `key` and synthesize an entry from the slot basics.
    ///
    /// On a hit the slot stays read-locked until the entry is handed
    /// back through [`unlink`](Self::unlink) or
    /// [`disconnect`](Self::disconnect).
    pub fn get(&self, key: &CacheKey) -> Option<StoreEntry> {
        let map = self.map.as_ref()?;
        match map.open_for_reading(key) {
            Some((fileno, slot)) => {
                self.counters.record_get(true);
                Some(StoreEntry::from_basics(*key, fileno, &slot.basics()))
            }
            None => {
                self.counters.record_get(false);
                None
            }
        }
    }

    /// Whether this directory can accept the entry right now.
    ///
    /// On success `load` receives the strategy's current load, letting
    /// the outer store prefer idle directories.
    pub fn can_store(&self, e: &StoreEntry, disk_space_needed: i64, load: &mut u8) -> bool {
        let body = disk_space_needed.max(e.expected_reply_size as i64);
        if (CellHeader::SIZE + SwapMeta::SIZE) as i64 + body > self.config.max_objsize {
            return false;
        }
        let Some(file) = &self.file else {
            return false;
        };
        if !file.can_write() || self.map.is_none() || self.io.shed_load() {
            return false;
        }
        *load = self.io.load();
        true
    }

    /// Claim a write slot for the entry and create its cell I/O.
    ///
    /// Returns `None` when the db is unusable or every probed slot is
    /// busy; the outer store treats that as "cannot store now". On
    /// success the entry is attached to its fileno and the slot holds
    /// the stamped basics, awaiting the write.
    pub fn create_store_io(&self, e: &mut StoreEntry) -> Option<Arc<IoState>> {
        let file = self.file.as_ref()?;
        if file.error() {
            debug!(dir = self.index, "db file is unusable");
            return None;
        }
        let map = self.map.as_ref()?;

        // expected size must be known up front to prevent cell overflow
        let payload_size = SwapMeta::SIZE as u64 + e.expected_reply_size;
        let payload_end = CellHeader::SIZE as i64 + payload_size as i64;
        assert!(payload_end <= self.config.max_objsize);

        let Some((fileno, slot)) = map.open_for_writing(&e.key) else {
            debug!(dir = self.index, key = %e.key, "no write slot");
            return None;
        };
        e.swap_file_sz = payload_size;
        e.fileno = Some(fileno);
        slot.set_basics(EntryBasics::from_entry(e));
        self.counters.record_create();

        let sio = IoState::new(
            self.index,
            fileno,
            self.disk_offset(fileno),
            payload_end,
            self.disk_offset_limit(),
            Arc::clone(map),
            file.clone(),
            Arc::clone(&self.counters),
            self.owner.guard(),
        );
        debug!(
            dir = self.index,
            fileno,
            disk_offset = sio.disk_offset(),
            "created new cell io"
        );
        Some(sio)
    }

    /// Open the entry's existing cell for reading.
    ///
    /// The entry must already hold a slot lock (from a lookup or a
    /// finished write); reading a cell that is still being filled is
    /// unsupported and yields `None`.
    pub fn open_store_io(&self, e: &StoreEntry) -> Option<Arc<IoState>> {
        let file = self.file.as_ref()?;
        if file.error() {
            debug!(dir = self.index, "db file is unusable");
            return None;
        }
        let map = self.map.as_ref()?;
        let fileno = e.fileno?;

        // a Writeable slot means we were writing after all
        let basics = map.peek_at_reader(fileno)?;
        assert!(basics.swap_file_sz > 0);
        debug_assert_eq!(basics.swap_file_sz, e.swap_file_sz);

        let payload_end = CellHeader::SIZE as i64 + basics.swap_file_sz as i64;
        assert!(payload_end <= self.config.max_objsize);
        self.counters.record_open();

        debug!(dir = self.index, fileno, "opened existing cell io");
        Some(IoState::new(
            self.index,
            fileno,
            self.disk_offset(fileno),
            payload_end,
            self.disk_offset_limit(),
            Arc::clone(map),
            file.clone(),
            Arc::clone(&self.counters),
            self.owner.guard(),
        ))
    }

    /// Submit the entry's cell image: header, swap header, then `body`.
    ///
    /// One write per cell; the completion publishes the slot (keeping a
    /// read lock for the entry) or, on error, marks it for reclaim.
    pub fn write(&self, sio: &Arc<IoState>, e: &StoreEntry, body: &[u8], finish: FinishCb) {
        debug_assert_eq!(body.len() as u64, e.expected_reply_size);

        let header = CellHeader {
            payload_size: SwapMeta::SIZE as u64 + body.len() as u64,
        };
        let meta = SwapMeta {
            key: e.key,
            basics: EntryBasics::from_entry(e),
        };
        let mut buf = Vec::with_capacity(CellHeader::SIZE + header.payload_size as usize);
        buf.extend_from_slice(&header.to_bytes());
        buf.extend_from_slice(&meta.to_bytes());
        buf.extend_from_slice(body);
        debug_assert_eq!(buf.len() as i64, sio.payload_end());

        sio.set_finish_cb(finish);
        sio.advance_offset(buf.len() as i64);

        let file = sio.file_handle().clone();
        let disk_offset = sio.disk_offset();
        let sio = Arc::clone(sio);
        self.io.write(
            &file,
            disk_offset,
            buf,
            Box::new(move |len, flag| sio.write_completed(len, flag)),
        );
    }

    /// Submit a read of `len` payload bytes starting at `offset`.
    ///
    /// Offset 0 is the start of the payload, i.e. the swap header; body
    /// bytes begin at `SwapMeta::SIZE`.
    pub fn read(&self, sio: &Arc<IoState>, offset: i64, len: usize, cb: ReadCb) {
        debug_assert!(offset >= 0);
        debug_assert!(CellHeader::SIZE as i64 + offset + len as i64 <= sio.payload_end());

        sio.set_read_cb(cb);
        let file = sio.file_handle().clone();
        let disk_offset = sio.disk_offset() + CellHeader::SIZE as i64 + offset;
        let sio = Arc::clone(sio);
        self.io.read(
            &file,
            disk_offset,
            len,
            Box::new(move |buf, len, flag| sio.read_completed(buf, len, flag)),
        );
    }

    /// Doom the entry's slot and detach the entry.
    pub fn unlink(&self, e: &mut StoreEntry) {
        debug!(dir = self.index, fileno = ?e.fileno, "unlink");
        if let (Some(map), Some(fileno)) = (&self.map, e.fileno) {
            self.counters.record_unlink();
            map.free(fileno);
        }
        self.disconnect(e);
    }

    /// Release the slot lock the entry holds and detach it.
    ///
    /// Valid for entries produced by [`get`](Self::get) and for entries
    /// whose write has finished; both hold one shared lock.
    pub fn disconnect(&self, e: &mut StoreEntry) {
        if let Some(fileno) = e.fileno.take()
            && let Some(map) = &self.map
        {
            map.close_for_reading(fileno);
        }
    }

    /// Purge while full, releasing up to [`MAX_FREED_PER_MAINTAIN`]
    /// victims chosen by the policy walker.
    ///
    /// Skipped while any directory is rebuilding: victims picked from a
    /// half-rebuilt map would be arbitrary.
    pub fn maintain(&self, walker: &mut dyn PurgeWalker) {
        let Some(map) = &self.map else {
            return;
        };
        if !self.full() {
            return;
        }
        if self.ctx.rebuilding() {
            return;
        }

        let mut freed = 0;
        while freed < MAX_FREED_PER_MAINTAIN
            && walker.scanned() < MAX_PROBED_PER_MAINTAIN
            && map.full()
        {
            let Some(fileno) = walker.next() else {
                break;
            };
            map.free(fileno);
            self.counters.record_release();
            freed += 1;
        }

        debug!(
            dir = self.index,
            freed,
            scanned = walker.scanned(),
            "maintenance pass"
        );
        if map.full() {
            warn!(
                dir = self.index,
                freed, "directory still full after maintenance"
            );
        }
    }

    /// Snapshot this directory's statistics.
    pub fn stats(&self) -> SwapDirStats {
        SwapDirStats {
            maximum_size: self.maximum_size(),
            current_size: self.current_size(),
            entry_limit: self
                .map
                .as_ref()
                .map_or_else(|| self.entry_limit_allowed(), |map| map.entry_limit()),
            entry_count: self.current_count(),
            counters: self.counters.snapshot(),
        }
    }
}
