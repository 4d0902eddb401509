//! Restart recovery: the segment is discarded, the db file survives,
//! and the rebuilder repopulates the directory from cell headers.

use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use rock_store::{
    CacheKey, CoopLoop, DiskFlag, EntryBasics, IoModule, RockConfig, StoreContext, StoreEntry,
    SwapDir, SwapMeta,
};

fn key(byte: u8) -> CacheKey {
    CacheKey::new([byte; 16])
}

fn config(cache_dir: &Path) -> RockConfig {
    RockConfig::new()
        .path(cache_dir)
        .max_size_mb(1)
        .max_objsize(4096)
        .io_module(IoModule::Blocking)
}

fn boot(cache_dir: &Path, create_db: bool) -> (CoopLoop, SwapDir) {
    let ctx = Arc::new(StoreContext::new());
    let mut coop = CoopLoop::new();
    let mut dir = SwapDir::new(0, config(cache_dir), ctx, &coop).expect("config");
    if create_db {
        dir.create().expect("create db");
    }
    dir.create_segment().expect("create segment");
    dir.init(&mut coop).expect("init");
    coop.run_until_idle();
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
    assert!(finished.load(Ordering::SeqCst));
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
fn rebuild_after_restart_restores_entries() {
    let tmp = tempfile::tempdir().unwrap();
    let cache_dir = tmp.path().join("cache");

    let objects: [(CacheKey, &[u8]); 2] = [(key(1), b"first body"), (key(2), b"the second body")];
    let mut saved = Vec::new();

    {
        let (mut coop, dir) = boot(&cache_dir, true);
        for (k, body) in objects {
            let mut e = write_object(&mut coop, &dir, k, body);
            saved.push((k, e.fileno, EntryBasics::from_entry(&e)));
            dir.disconnect(&mut e);
        }
        assert_eq!(dir.current_count(), 2);
        // process goes away: the loop and directory drop, the segment
        // is discarded on the next boot, the db file survives
    }

    let (mut coop, dir) = boot(&cache_dir, false);
    assert_eq!(dir.current_count(), 2, "rebuild must restore both cells");

    for ((k, body), (_, fileno, basics)) in objects.iter().zip(&saved) {
        let mut got = dir.get(k).expect("recovered entry");
        assert_eq!(got.fileno, *fileno, "cells keep their fileno");
        assert_eq!(&EntryBasics::from_entry(&got), basics);
        assert_eq!(read_body(&mut coop, &dir, &got), *body);
        dir.disconnect(&mut got);
    }

    dir.unlink_segment();
}

#[test]
fn rebuild_of_a_fresh_db_finds_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let cache_dir = tmp.path().join("cache");

    let (_coop, dir) = boot(&cache_dir, true);
    assert_eq!(dir.current_count(), 0);
    assert!(dir.get(&key(5)).is_none());

    dir.unlink_segment();
}

#[test]
fn overwritten_entry_rebuilds_to_its_last_image() {
    let tmp = tempfile::tempdir().unwrap();
    let cache_dir = tmp.path().join("cache");

    {
        let (mut coop, dir) = boot(&cache_dir, true);
        let mut first = write_object(&mut coop, &dir, key(6), b"old");
        dir.disconnect(&mut first);
        let mut second = write_object(&mut coop, &dir, key(6), b"replacement");
        dir.disconnect(&mut second);
        assert_eq!(dir.current_count(), 1);
    }

    let (mut coop, dir) = boot(&cache_dir, false);
    assert_eq!(dir.current_count(), 1);
    let mut got = dir.get(&key(6)).expect("recovered entry");
    assert_eq!(read_body(&mut coop, &dir, &got), b"replacement");
    dir.disconnect(&mut got);

    dir.unlink_segment();
}
