//! rock-store: a fixed-cell on-disk object store for an HTTP caching
//! proxy.
//!
//! Content keys (16-byte digests) map to fixed-size cells in a single
//! db file. A slot directory in a shared memory segment lets multiple
//! cooperating processes serve concurrent readers and a single writer
//! per cell without a broker; disk I/O completes via callbacks on a
//! cooperative loop; a background rebuild reconstructs the directory
//! from the db image at startup.
//!
//! # Architecture
//!
//! ```text
//!            +-----------------------------+
//!            |          SwapDir            |
//!            | (get / create / open / io)  |
//!            +------+--------------+-------+
//!                   |              |
//!                   v              v
//!         +-----------------+   +-------------------+
//!         |     DirMap      |   |    IoStrategy     |
//!         | (shared segment |   | Blocking | IpcIo  |
//!         |  of Slots)      |   +---------+---------+
//!         +-----------------+             |
//!                   ^                     v
//!                   |              +-------------+
//!              Rebuild <-- db file | CoopLoop    |
//!              (startup)           | completions |
//!                                  +-------------+
//! ```
//!
//! # Process model
//!
//! The master process creates the db file and the shared segment;
//! workers attach. In SMP deployments the `IpcIo` strategy hands the
//! file to a disker. All cross-process coordination happens through the
//! slot atomics in the segment: a failed lock is contention, surfaced
//! as "cannot store / not found now" rather than a wait.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod cell;
mod config;
mod dir_map;
mod entry;
mod error;
mod io;
mod key;
mod metrics;
mod rebuild;
mod shm;
mod slot;
mod swap_dir;
mod sync;

// Core types
pub use error::{RockError, RockResult};
pub use key::CacheKey;

// Configuration
pub use config::{IoModule, RockConfig};

// On-disk framing
pub use cell::{CellHeader, HEADER_SIZE, SwapMeta};

// Directory
pub use dir_map::{ABSOLUTE_ENTRY_LIMIT, DirMap, FileNo};
pub use shm::ShmSegment;
pub use slot::{Slot, SlotState};

// Entries
pub use entry::{EntryBasics, StoreEntry};

// I/O
pub use io::event_loop::{CbGuard, CbOwner, CoopLoop, CoopTask, LoopHandle, Progress};
pub use io::state::{FinishCb, IoState, ReadCb};
pub use io::{BlockingIo, DiskFlag, FileHandle, IoStrategy, IpcIo};

// Facade
pub use swap_dir::{
    MAX_FREED_PER_MAINTAIN, MAX_PROBED_PER_MAINTAIN, PurgeWalker, StoreContext, SwapDir,
    SwapDirStats,
};

// Rebuild
pub use rebuild::{Rebuild, RebuildStats};

// Statistics
pub use metrics::{CounterSnapshot, StoreCounters};
