//! Startup rebuild of the directory from the db image.
//!
//! After a restart the shared segment is recreated empty while the db
//! file still holds the cells. The rebuilder walks every cell, parses
//! the cell header and swap header, and places valid entries back at
//! their fileno. It runs as a cooperative task so startup I/O never
//! monopolizes the loop, and a bad cell never aborts the pass.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::cell::{CellHeader, HEADER_SIZE, SwapMeta};
use crate::dir_map::{DirMap, FileNo};
use crate::error::{RockError, RockResult};
use crate::io::event_loop::{CoopTask, Progress};
use crate::swap_dir::StoreContext;

/// Cells examined per loop tick.
const CHUNK: u32 = 64;

/// Statistics from one rebuild pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildStats {
    /// Cells examined.
    pub scanned: u64,
    /// Valid entries placed back into the directory.
    pub recovered: u64,
    /// Cells with a zero payload size.
    pub empty: u64,
    /// Cells that failed validation.
    pub corrupted: u64,
    /// Cells whose slot was already claimed by a newer entry.
    pub occupied: u64,
}

/// The rebuild task for one swap directory.
pub struct Rebuild {
    index: usize,
    max_objsize: i64,
    file: File,
    map: Arc<DirMap>,
    ctx: Arc<StoreContext>,
    fileno: FileNo,
    stats: RebuildStats,
}

impl Rebuild {
    /// Prepare a rebuild over `db_path`.
    ///
    /// Opens its own read-only descriptor: rebuild reads bypass the
    /// store's I/O strategy so a loaded disker cannot starve startup.
    pub(crate) fn new(
        index: usize,
        db_path: PathBuf,
        max_objsize: i64,
        map: Arc<DirMap>,
        ctx: Arc<StoreContext>,
    ) -> RockResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .open(&db_path)
            .map_err(RockError::FileOpen)?;
        Ok(Self {
            index,
            max_objsize,
            file,
            map,
            ctx,
            fileno: 0,
            stats: RebuildStats::default(),
        })
    }

    /// Stats accumulated so far.
    pub fn stats(&self) -> &RebuildStats {
        &self.stats
    }

    fn reject(&mut self, fileno: FileNo, reason: &'static str) {
        self.stats.corrupted += 1;
        let err = RockError::Corruption { fileno, reason };
        warn!(dir = self.index, %err, "skipping cell");
    }

    /// Examine one cell and place it into the directory if valid.
    fn load_cell(&mut self, fileno: FileNo) {
        let offset = HEADER_SIZE + self.max_objsize * fileno as i64;
        let mut prefix = [0u8; CellHeader::SIZE + SwapMeta::SIZE];
        if self.file.read_exact_at(&mut prefix, offset as u64).is_err() {
            self.reject(fileno, "cell prefix unreadable");
            return;
        }

        let header = CellHeader::from_bytes(&prefix).expect("prefix holds a full header");
        if header.payload_size == 0 {
            self.stats.empty += 1;
            return;
        }
        if header.payload_size > (self.max_objsize as u64) - CellHeader::SIZE as u64 {
            self.reject(fileno, "payload larger than a cell");
            return;
        }
        if header.payload_size < SwapMeta::SIZE as u64 {
            self.reject(fileno, "payload too small for a swap header");
            return;
        }

        let Some(meta) = SwapMeta::from_bytes(&prefix[CellHeader::SIZE..]) else {
            self.reject(fileno, "swap header unreadable");
            return;
        };
        if meta.key.is_null() {
            self.reject(fileno, "null key");
            return;
        }
        if meta.basics.swap_file_sz != header.payload_size {
            self.reject(fileno, "swap header disagrees with cell header");
            return;
        }

        if self.map.put_at(&meta.key, &meta.basics, fileno) {
            self.stats.recovered += 1;
        } else {
            // some other, newer entry got into our cell
            self.stats.occupied += 1;
        }
    }
}

impl CoopTask for Rebuild {
    fn tick(&mut self) -> Progress {
        let limit = self.map.entry_limit();
        let end = self.fileno.saturating_add(CHUNK).min(limit);
        while self.fileno < end {
            self.load_cell(self.fileno);
            self.stats.scanned += 1;
            self.fileno += 1;
        }

        if self.fileno < limit {
            return Progress::More;
        }
        self.ctx.finish_rebuild();
        info!(
            dir = self.index,
            scanned = self.stats.scanned,
            recovered = self.stats.recovered,
            empty = self.stats.empty,
            corrupted = self.stats.corrupted,
            occupied = self.stats.occupied,
            "rebuild complete"
        );
        Progress::Done
    }
}
