//! Concurrency tests
//!
//! These tests verify:
//! - Concurrent writes of the same content lose no references
//! - Overlapping batch deletes serialize on their shared sectors
//! - A batch delete holding its sectors does not block a disjoint one
//! - Disjoint workloads run side by side without interfering
//! - Reads stay correct while a folder shrink moves sectors

use std::thread;

use super::{sector, sectors, write_all, Harness};

// =============================================================================
// Same-Sector Tests
// =============================================================================

#[test]
fn test_concurrent_duplicate_writes() {
    let h = Harness::new();
    let engine = h.open();
    engine.add_folder(h.folder("f0"), sectors(16)).unwrap();

    thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                for _ in 0..20 {
                    engine.write(&sector(7)).unwrap();
                }
            });
        }
    });

    let root = sectorstore::SectorRoot::from_content(&sector(7));
    assert_eq!(engine.sector_count(&root).unwrap(), 160);
    assert_eq!(engine.folder_usage().unwrap()[0].used, 1);
}

#[test]
fn test_overlapping_batch_deletes() {
    let h = Harness::new();
    let engine = h.open();
    engine.add_folder(h.folder("f0"), sectors(16)).unwrap();

    let [a, b, c]: [_; 3] = write_all(&engine, [1, 2, 3]).try_into().unwrap();
    for _ in 0..39 {
        write_all(&engine, [1, 2, 3]);
    }

    // every thread shares `b` with every other thread
    thread::scope(|s| {
        for t in 0..4 {
            let engine = &engine;
            s.spawn(move || {
                let batch = if t % 2 == 0 { [a, b] } else { [b, c] };
                for _ in 0..5 {
                    engine.delete_batch(&batch).unwrap();
                }
            });
        }
    });

    assert_eq!(engine.sector_count(&a).unwrap(), 30);
    assert_eq!(engine.sector_count(&b).unwrap(), 20);
    assert_eq!(engine.sector_count(&c).unwrap(), 30);
}

#[test]
fn test_disjoint_delete_runs_while_another_holds_its_sectors() {
    let h = Harness::new();
    let engine = h.open();
    engine.add_folder(h.folder("f0"), sectors(16)).unwrap();
    let roots = write_all(&engine, [1, 1, 2, 2, 3, 3]);
    let (held, free) = ([roots[0], roots[2]], roots[4]);

    let hold = h.disrupter.hold("delete_batch/after_commit");
    thread::scope(|s| {
        let parked = s.spawn(|| engine.delete_batch(&held));
        hold.wait_until_reached();

        engine.delete(&free).unwrap();
        assert_eq!(engine.sector_count(&free).unwrap(), 1);
        assert!(!parked.is_finished());

        drop(hold);
        parked.join().unwrap().unwrap();
    });

    assert_eq!(engine.sector_count(&roots[0]).unwrap(), 1);
    assert_eq!(engine.sector_count(&roots[2]).unwrap(), 1);
    assert_eq!(engine.open_transactions(), 0);
}

#[test]
fn test_last_references_freed_concurrently() {
    let h = Harness::new();
    let engine = h.open();
    engine.add_folder(h.folder("f0"), sectors(16)).unwrap();

    let root = engine.write(&sector(1)).unwrap();
    for _ in 0..31 {
        engine.write(&sector(1)).unwrap();
    }

    thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                for _ in 0..4 {
                    engine.delete(&root).unwrap();
                }
            });
        }
    });

    assert!(!engine.sector_exists(&root).unwrap());
    assert_eq!(engine.folder_usage().unwrap()[0].used, 0);
}

// =============================================================================
// Disjoint Workload Tests
// =============================================================================

#[test]
fn test_disjoint_writers_and_deleters() {
    let h = Harness::new();
    let engine = h.open();
    engine.add_folder(h.folder("f0"), sectors(64)).unwrap();
    engine.add_folder(h.folder("f1"), sectors(64)).unwrap();

    let kept: Vec<Vec<_>> = thread::scope(|s| {
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let engine = &engine;
                s.spawn(move || {
                    let roots = write_all(engine, (0..20).map(|i| t * 100 + i));
                    let (gone, kept) = roots.split_at(10);
                    engine.delete_batch(gone).unwrap();
                    kept.to_vec()
                })
            })
            .collect();
        handles.into_iter().map(|w| w.join().unwrap()).collect()
    });

    assert_eq!(engine.distinct_sectors().unwrap(), 40);
    for (t, roots) in kept.iter().enumerate() {
        for (i, root) in roots.iter().enumerate() {
            let seed = t as u64 * 100 + 10 + i as u64;
            assert_eq!(&engine.read(root).unwrap()[..], &sector(seed)[..]);
        }
    }
    let used: u64 = engine.folder_usage().unwrap().iter().map(|u| u.used).sum();
    assert_eq!(used, 40);
}

// =============================================================================
// Structural Update Tests
// =============================================================================

#[test]
fn test_reads_during_shrink() {
    let h = Harness::new();
    let engine = h.open();
    engine.add_folder(h.folder("f0"), sectors(32)).unwrap();
    let roots = write_all(&engine, 0..32);
    engine.add_folder(h.folder("f1"), sectors(32)).unwrap();

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..5 {
                    for (i, root) in roots.iter().enumerate() {
                        assert_eq!(&engine.read(root).unwrap()[..], &sector(i as u64)[..]);
                    }
                }
            });
        }
        s.spawn(|| {
            engine.resize_folder(h.folder("f0"), sectors(8)).unwrap();
        });
    });

    let usage = engine.folder_usage().unwrap();
    assert_eq!((usage[0].capacity, usage[0].used), (8, 8));
    assert_eq!(usage[1].used, 24);
}
