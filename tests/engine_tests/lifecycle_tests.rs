//! Engine lifecycle tests
//!
//! These tests verify:
//! - Calls after shutdown fail with `Stopped`
//! - Shutdown lets in-flight calls finish
//! - Config validation and the pinned sector size

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use sectorstore::{Config, Engine, StoreError};

use super::{sector, sectors, Harness, SECTOR_SIZE};

// =============================================================================
// Shutdown Tests
// =============================================================================

#[test]
fn test_calls_after_shutdown_are_stopped() {
    let h = Harness::new();
    let engine = h.open();
    engine.add_folder(h.folder("f0"), sectors(4)).unwrap();
    let root = engine.write(&sector(1)).unwrap();

    engine.shutdown().unwrap();

    assert!(matches!(engine.write(&sector(2)), Err(StoreError::Stopped)));
    assert!(matches!(engine.read(&root), Err(StoreError::Stopped)));
    assert!(matches!(engine.delete(&root), Err(StoreError::Stopped)));
    assert!(matches!(engine.folder_usage(), Err(StoreError::Stopped)));
    assert!(matches!(
        engine.add_folder(h.folder("f1"), sectors(4)),
        Err(StoreError::Stopped)
    ));
    assert!(matches!(
        engine.resize_folder(h.folder("f0"), sectors(2)),
        Err(StoreError::Stopped)
    ));
    assert!(matches!(engine.sector_exists(&root), Err(StoreError::Stopped)));
}

#[test]
fn test_shutdown_is_idempotent() {
    let h = Harness::new();
    let engine = h.open();

    engine.shutdown().unwrap();
    engine.shutdown().unwrap();
    engine.close().unwrap();
}

#[test]
fn test_shutdown_waits_for_in_flight_writes() {
    let h = Harness::new();
    let engine = h.open();
    engine.add_folder(h.folder("f0"), sectors(512)).unwrap();
    let started = AtomicBool::new(false);

    let written: Vec<_> = thread::scope(|s| {
        let workers: Vec<_> = (0..4u64)
            .map(|t| {
                let engine = &engine;
                let started = &started;
                s.spawn(move || {
                    let mut roots = Vec::new();
                    for i in 0..100 {
                        match engine.write(&sector(t * 1000 + i)) {
                            Ok(root) => roots.push(root),
                            Err(StoreError::Stopped) => break,
                            Err(e) => panic!("unexpected error: {}", e),
                        }
                        started.store(true, Ordering::SeqCst);
                    }
                    roots
                })
            })
            .collect();

        while !started.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }
        engine.shutdown().unwrap();

        workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect()
    });
    drop(engine);

    let engine = h.open();
    assert_eq!(engine.distinct_sectors().unwrap(), written.len());
    for root in &written {
        assert!(engine.sector_exists(root).unwrap());
    }
    assert_eq!(engine.open_transactions(), 0);
}

// =============================================================================
// Config Tests
// =============================================================================

#[test]
fn test_invalid_sector_size_rejected() {
    let h = Harness::new();
    let config = Config::builder()
        .data_dir(h.temp.path().join("meta"))
        .sector_size(3000)
        .build();

    assert!(matches!(Engine::open(config), Err(StoreError::Config(_))));
}

#[test]
fn test_sector_size_pinned_on_first_open() {
    let h = Harness::new();
    h.open().close().unwrap();

    let config = Config::builder()
        .data_dir(h.temp.path().join("meta"))
        .sector_size(SECTOR_SIZE * 2)
        .build();

    assert!(matches!(Engine::open(config), Err(StoreError::Config(_))));
    h.open();
}

#[test]
fn test_open_path_uses_defaults() {
    let h = Harness::new();
    let engine = Engine::open_path(&h.temp.path().join("meta")).unwrap();

    assert_eq!(engine.data_dir(), h.temp.path().join("meta"));
    assert_eq!(engine.sector_size(), sectorstore::config::DEFAULT_SECTOR_SIZE);
    assert_eq!(*engine.recovery_report(), sectorstore::RecoveryReport::default());
}
