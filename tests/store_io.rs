//! End-to-end cell I/O through the swap directory facade.

use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use rock_store::{
    CacheKey, CellHeader, CoopLoop, DiskFlag, IoModule, PurgeWalker, RockConfig, StoreContext,
    StoreEntry, SwapDir, SwapMeta,
};

fn key(byte: u8) -> CacheKey {
    CacheKey::new([byte; 16])
}

fn setup(cache_dir: &Path, module: IoModule, max_objsize: i64) -> (CoopLoop, SwapDir) {
    let ctx = Arc::new(StoreContext::new());
    let mut coop = CoopLoop::new();
    let config = RockConfig::new()
        .path(cache_dir)
        .max_size_mb(1)
        .max_objsize(max_objsize)
        .io_module(module);

    let mut dir = SwapDir::new(0, config, ctx, &coop).expect("config");
    dir.create().expect("create db");
    dir.create_segment().expect("create segment");
    dir.init(&mut coop).expect("init");
    coop.run_until_idle(); // rebuild over the fresh db
    (coop, dir)
}

fn write_object(coop: &mut CoopLoop, dir: &SwapDir, key: CacheKey, body: &[u8]) -> StoreEntry {
    let mut e = StoreEntry::new(key);
    e.expected_reply_size = body.len() as u64;

    let sio = dir.create_store_io(&mut e).expect("write slot");
    let finished = Arc::new(AtomicBool::new(false));
    let witness = Arc::clone(&finished);
    dir.write(
        &sio,
        &e,
        body,
        Box::new(move |flag| {
            assert_eq!(flag, DiskFlag::Ok);
            witness.store(true, Ordering::SeqCst);
        }),
    );
    coop.run_until_idle();
    assert!(finished.load(Ordering::SeqCst), "write must complete");
    e
}

fn read_body(coop: &mut CoopLoop, dir: &SwapDir, e: &StoreEntry) -> Vec<u8> {
    let sio = dir.open_store_io(e).expect("readable cell");
    let body_len = e.swap_file_sz as usize - SwapMeta::SIZE;

    let out = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&out);
    dir.read(
        &sio,
        SwapMeta::SIZE as i64,
        body_len,
        Box::new(move |buf, len, flag| {
            assert_eq!(flag, DiskFlag::Ok);
            sink.lock().unwrap().extend_from_slice(&buf[..len]);
        }),
    );
    coop.run_until_idle();
    let body = out.lock().unwrap().clone();
    body
}

#[test]
fn create_write_read() {
    let tmp = tempfile::tempdir().unwrap();
    let cache_dir = tmp.path().join("cache");
    let (mut coop, dir) = setup(&cache_dir, IoModule::Blocking, 4096);
    assert_eq!(dir.current_count(), 0);

    let mut e = write_object(&mut coop, &dir, key(1), b"hello");
    assert_eq!(dir.current_count(), 1);
    assert_eq!(e.swap_file_sz, SwapMeta::SIZE as u64 + 5);

    // byte-level layout: cell header, swap header, then the body
    let fileno = e.fileno.expect("attached");
    let image = std::fs::read(dir.db_path()).unwrap();
    let cell = &image[dir.disk_offset(fileno) as usize..];
    let header = CellHeader::from_bytes(cell).unwrap();
    assert_eq!(header.payload_size, SwapMeta::SIZE as u64 + 5);
    let meta = SwapMeta::from_bytes(&cell[CellHeader::SIZE..]).unwrap();
    assert_eq!(meta.key, key(1));
    assert_eq!(meta.basics.swap_file_sz, e.swap_file_sz);
    let body_start = CellHeader::SIZE + SwapMeta::SIZE;
    assert_eq!(&cell[body_start..body_start + 5], b"hello");

    // lookup synthesizes an entry from the slot basics
    let mut got = dir.get(&key(1)).expect("hit");
    assert_eq!(got.fileno, Some(fileno));
    assert_eq!(got.swap_file_sz, e.swap_file_sz);
    assert_eq!(read_body(&mut coop, &dir, &got), b"hello");
    assert!(dir.get(&key(9)).is_none());

    dir.disconnect(&mut got);
    dir.disconnect(&mut e);
    dir.unlink_segment();
}

#[test]
fn overwrite_reuses_fileno() {
    let tmp = tempfile::tempdir().unwrap();
    let cache_dir = tmp.path().join("cache");
    let (mut coop, dir) = setup(&cache_dir, IoModule::Blocking, 4096);

    let mut first = write_object(&mut coop, &dir, key(1), &[b'A'; 10]);
    let fileno = first.fileno;
    dir.disconnect(&mut first);

    let mut second = write_object(&mut coop, &dir, key(1), &[b'B'; 20]);
    assert_eq!(second.fileno, fileno);
    assert_eq!(dir.current_count(), 1);

    let mut got = dir.get(&key(1)).expect("hit");
    assert_eq!(read_body(&mut coop, &dir, &got), vec![b'B'; 20]);

    dir.disconnect(&mut got);
    dir.disconnect(&mut second);
    dir.unlink_segment();
}

#[test]
fn write_error_reverts_the_slot() {
    let tmp = tempfile::tempdir().unwrap();
    let cache_dir = tmp.path().join("cache");
    let (_coop, dir) = setup(&cache_dir, IoModule::Blocking, 4096);

    let mut e = StoreEntry::new(key(3));
    e.expected_reply_size = 8;
    let sio = dir.create_store_io(&mut e).expect("write slot");
    assert_eq!(dir.current_count(), 1);

    // completion with an error flag dooms the slot instead of
    // publishing it
    sio.write_completed(0, DiskFlag::Error);
    assert_eq!(dir.current_count(), 0);
    assert!(dir.get(&key(3)).is_none());

    // the file error is sticky: this directory stops accepting stores
    let mut load = 0;
    assert!(!dir.can_store(&e, 8, &mut load));

    dir.unlink_segment();
}

#[test]
fn unlink_under_concurrent_reader_defers_reclaim() {
    let tmp = tempfile::tempdir().unwrap();
    let cache_dir = tmp.path().join("cache");
    let (mut coop, dir) = setup(&cache_dir, IoModule::Blocking, 4096);

    let mut written = write_object(&mut coop, &dir, key(4), b"doomed");
    dir.disconnect(&mut written);
    assert_eq!(dir.current_count(), 1);

    let mut reader_a = dir.get(&key(4)).expect("hit");
    let mut reader_b = dir.get(&key(4)).expect("hit");

    dir.unlink(&mut reader_a);
    // reader_b still holds its lock: reclaim is deferred
    assert_eq!(dir.current_count(), 1);
    assert!(dir.get(&key(4)).is_none(), "doomed entries are invisible");

    dir.disconnect(&mut reader_b);
    assert_eq!(dir.current_count(), 0);
    assert!(dir.get(&key(4)).is_none());

    dir.unlink_segment();
}

#[test]
fn ipc_strategy_roundtrip() {
    let tmp = tempfile::tempdir().unwrap();
    let cache_dir = tmp.path().join("cache");
    let (mut coop, dir) = setup(&cache_dir, IoModule::IpcIo, 4096);

    let mut e = write_object(&mut coop, &dir, key(7), b"via disker");
    assert_eq!(dir.current_count(), 1);

    let mut got = dir.get(&key(7)).expect("hit");
    assert_eq!(read_body(&mut coop, &dir, &got), b"via disker");

    dir.disconnect(&mut got);
    dir.disconnect(&mut e);
    dir.unlink_segment();
}

#[test]
fn can_store_enforces_cell_capacity() {
    let tmp = tempfile::tempdir().unwrap();
    let cache_dir = tmp.path().join("cache");
    let (_coop, dir) = setup(&cache_dir, IoModule::Blocking, 4096);

    let mut e = StoreEntry::new(key(5));
    let mut load = 0;

    e.expected_reply_size = 100;
    assert!(dir.can_store(&e, 100, &mut load));

    // the framing overhead must still fit
    let max_body = 4096 - (CellHeader::SIZE + SwapMeta::SIZE) as i64;
    assert!(dir.can_store(&e, max_body, &mut load));
    assert!(!dir.can_store(&e, max_body + 1, &mut load));

    dir.unlink_segment();
}

struct SeqWalker {
    next: u32,
    limit: u32,
    scanned: u32,
}

impl rock_store::PurgeWalker for SeqWalker {
    fn next(&mut self) -> Option<u32> {
        if self.next < self.limit {
            let victim = self.next;
            self.next += 1;
            self.scanned += 1;
            Some(victim)
        } else {
            None
        }
    }

    fn scanned(&self) -> u32 {
        self.scanned
    }
}

struct PanicWalker;

impl rock_store::PurgeWalker for PanicWalker {
    fn next(&mut self) -> Option<u32> {
        panic!("the policy must not be consulted during rebuild");
    }

    fn scanned(&self) -> u32 {
        0
    }
}

/// Examines several slots per victim, the way a policy walk skipping
/// unpurgeable entries does.
struct StrideWalker {
    calls: u32,
    scanned: u32,
    stride: u32,
    limit: u32,
}

impl rock_store::PurgeWalker for StrideWalker {
    fn next(&mut self) -> Option<u32> {
        self.scanned += self.stride;
        let victim = self.calls % self.limit;
        self.calls += 1;
        Some(victim)
    }

    fn scanned(&self) -> u32 {
        self.scanned
    }
}

#[test]
fn maintain_purges_when_full() {
    let tmp = tempfile::tempdir().unwrap();
    let cache_dir = tmp.path().join("cache");
    // 1 MiB minus the header in 64 KiB cells: 15 slots
    let (mut coop, dir) = setup(&cache_dir, IoModule::Blocking, 64 * 1024);
    let limit = dir.stats().entry_limit;
    assert_eq!(limit, 15);

    for byte in 0..limit as u8 {
        let mut e = write_object(&mut coop, &dir, key(0x10 + byte), b"filler");
        dir.disconnect(&mut e);
    }
    assert!(dir.full());

    // a full directory has no write slots for new keys
    let mut rejected = StoreEntry::new(key(0xEE));
    rejected.expected_reply_size = 1;
    assert!(dir.create_store_io(&mut rejected).is_none());

    let mut walker = SeqWalker {
        next: 0,
        limit,
        scanned: 0,
    };
    dir.maintain(&mut walker);
    assert!(!dir.full());
    assert!(dir.current_count() < limit);

    dir.unlink_segment();
}

#[test]
fn maintain_respects_the_probe_budget() {
    let tmp = tempfile::tempdir().unwrap();
    let cache_dir = tmp.path().join("cache");
    // 1 MiB minus the header in four 252 KiB cells
    let (mut coop, dir) = setup(&cache_dir, IoModule::Blocking, 258_048);
    let limit = dir.stats().entry_limit;
    assert_eq!(limit, 4);

    // keep every entry's read lock so frees defer and the directory
    // stays full for the whole walk
    let mut held = Vec::new();
    for byte in 0..limit as u8 {
        held.push(write_object(&mut coop, &dir, key(0x40 + byte), b"pinned"));
    }
    assert!(dir.full());

    let mut walker = StrideWalker {
        calls: 0,
        scanned: 0,
        stride: 50,
        limit,
    };
    dir.maintain(&mut walker);
    // the walk stops at the probe budget, not one probe past it
    assert_eq!(walker.scanned(), rock_store::MAX_PROBED_PER_MAINTAIN);
    assert_eq!(walker.calls, 200);
    assert_eq!(dir.current_count(), limit);

    // the doomed entries reclaim once their readers let go
    for mut e in held {
        dir.disconnect(&mut e);
    }
    assert_eq!(dir.current_count(), 0);

    dir.unlink_segment();
}

#[test]
fn maintain_is_suppressed_while_any_dir_rebuilds() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = Arc::new(StoreContext::new());
    let mut coop = CoopLoop::new();

    // 1 MiB minus the header in 64 KiB cells: 15 slots
    let make_config = |name: &str| {
        RockConfig::new()
            .path(tmp.path().join(name))
            .max_size_mb(1)
            .max_objsize(64 * 1024)
    };

    let mut dir_a = SwapDir::new(0, make_config("a"), Arc::clone(&ctx), &coop).expect("config");
    dir_a.create().expect("create db");
    dir_a.create_segment().expect("create segment");
    dir_a.init(&mut coop).expect("init");
    coop.run_until_idle();
    assert!(!ctx.rebuilding());

    let limit = dir_a.stats().entry_limit;
    for byte in 0..limit as u8 {
        let mut e = write_object(&mut coop, &dir_a, key(0x20 + byte), b"filler");
        dir_a.disconnect(&mut e);
    }
    assert!(dir_a.full());

    // a sibling directory starts rebuilding; the whole store must stop
    // purging until it finishes
    let mut dir_b = SwapDir::new(1, make_config("b"), Arc::clone(&ctx), &coop).expect("config");
    dir_b.create().expect("create db");
    dir_b.create_segment().expect("create segment");
    dir_b.init(&mut coop).expect("init");
    assert!(ctx.rebuilding());

    dir_a.maintain(&mut PanicWalker);

    coop.run_until_idle();
    assert!(!ctx.rebuilding());

    let mut walker = SeqWalker {
        next: 0,
        limit,
        scanned: 0,
    };
    dir_a.maintain(&mut walker);
    assert!(!dir_a.full());

    dir_a.unlink_segment();
    dir_b.unlink_segment();
}
