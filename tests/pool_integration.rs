//! Buffer Pool Integration Tests
//!
//! End-to-end scenarios through the public API:
//! - Eviction order and pinning
//! - Tablespace eviction waiting for pins
//! - Random and linear read-ahead
//! - Exhaustion under the propagate policy
//! - Compressed images in buddy blocks
//! - Wait array signalling across threads

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use assert_matches::assert_matches;

use bufpool::buf::{BufferPool, PinnedPage, RecoveryPhase};
use bufpool::config::PoolConfig;
use bufpool::error::Error;
use bufpool::page::{self, PageId, SpaceId};
use bufpool::storage::{InlineIo, MemStore};

const SPACE: u32 = 1;

fn setup(config: PoolConfig, pages: u32) -> (Arc<BufferPool>, Arc<MemStore>, Arc<InlineIo>) {
    let store = Arc::new(MemStore::new(config.page_size));
    store.create_space(SpaceId(SPACE), pages);
    let io = Arc::new(InlineIo::new(store.clone()));
    let pool = BufferPool::builder(config, store.clone())
        .io(io.clone())
        .build()
        .unwrap();
    (pool, store, io)
}

fn quiet_config(capacity: usize) -> PoolConfig {
    let mut config = PoolConfig::for_testing(capacity);
    config.read_ahead.random_enabled = false;
    config.read_ahead.linear_enabled = false;
    config
}

fn touch(pool: &BufferPool, page_no: u32) {
    let _ = pool.get_page(PageId::new(SPACE, page_no)).unwrap();
}

// =============================================================================
// Eviction
// =============================================================================

mod eviction_tests {
    use super::*;

    #[test]
    fn test_full_pool_evicts_oldest_page() {
        let (pool, _, _) = setup(quiet_config(4), 16);
        for no in 0..4 {
            touch(&pool, no);
        }
        assert_eq!(pool.stats().unwrap().free, 0);

        touch(&pool, 4);
        assert!(!pool.is_cached(PageId::new(SPACE, 0)));
        for no in 1..5 {
            assert!(pool.is_cached(PageId::new(SPACE, no)));
        }
        assert_eq!(pool.metrics().snapshot().evictions, 1);
        pool.validate().unwrap();
    }

    #[test]
    fn test_pinned_and_dirty_pages_are_skipped() {
        let (pool, _, _) = setup(quiet_config(4), 16);
        let pinned = pool.get_page(PageId::new(SPACE, 0)).unwrap();
        {
            let dirty = pool.get_page(PageId::new(SPACE, 1)).unwrap();
            page::set_lsn(&mut dirty.write(), 9);
        }
        touch(&pool, 2);
        touch(&pool, 3);

        touch(&pool, 4);
        assert!(pool.is_cached(pinned.page_id()));
        assert!(pool.is_cached(PageId::new(SPACE, 1)));
        assert!(!pool.is_cached(PageId::new(SPACE, 2)));
    }

    #[test]
    fn test_flusher_cleans_tail_when_everything_is_dirty() {
        let (pool, store, _) = setup(quiet_config(2), 16);
        for no in 0..2 {
            let p = pool.get_page(PageId::new(SPACE, no)).unwrap();
            page::set_lsn(&mut p.write(), 100 + no as u64);
        }

        touch(&pool, 5);
        assert!(pool.is_cached(PageId::new(SPACE, 5)));
        let m = pool.metrics().snapshot();
        assert!(m.flush_requests >= 1);
        assert!(m.pages_written >= 1);
        assert_eq!(page::lsn(&store.page(PageId::new(SPACE, 0)).unwrap()), 100);
    }

    #[test]
    fn test_old_page_made_young_on_reaccess() {
        let mut config = quiet_config(120);
        config.lru.old_block_time_ms = 0;
        let (pool, _, _) = setup(config, 200);
        for no in 0..100 {
            touch(&pool, no);
        }
        let before = pool.metrics().snapshot().made_young;

        touch(&pool, 0);
        assert_eq!(pool.metrics().snapshot().made_young, before + 1);
        let stats = pool.stats().unwrap();
        assert!(stats.lru_old_len > 0);
        pool.validate().unwrap();
    }
}

// =============================================================================
// Tablespace eviction
// =============================================================================

mod tablespace_tests {
    use super::*;

    #[test]
    fn test_evict_tablespace_waits_for_pin() {
        let (pool, store, _) = setup(quiet_config(16), 16);
        store.create_space(SpaceId(2), 4);
        for no in 0..4 {
            touch(&pool, no);
            let _ = pool.get_page(PageId::new(2, no)).unwrap();
        }

        let released = AtomicBool::new(false);
        thread::scope(|s| {
            let pinned: PinnedPage<'_> = pool.get_page(PageId::new(SPACE, 2)).unwrap();
            let released = &released;
            s.spawn(move || {
                thread::sleep(Duration::from_millis(30));
                released.store(true, Ordering::SeqCst);
                drop(pinned);
            });

            let freed = pool.evict_tablespace(SpaceId(SPACE)).unwrap();
            assert!(released.load(Ordering::SeqCst));
            assert_eq!(freed, 4);
        });

        for no in 0..4 {
            assert!(!pool.is_cached(PageId::new(SPACE, no)));
            assert!(pool.is_cached(PageId::new(2, no)));
        }
        pool.validate().unwrap();
    }

    #[test]
    fn test_evict_tablespace_discards_dirty_pages() {
        let (pool, store, _) = setup(quiet_config(8), 8);
        {
            let p = pool.get_page(PageId::new(SPACE, 3)).unwrap();
            page::set_lsn(&mut p.write(), 77);
        }
        assert_eq!(pool.evict_tablespace(SpaceId(SPACE)).unwrap(), 1);
        assert_eq!(page::lsn(&store.page(PageId::new(SPACE, 3)).unwrap()), 0);
        assert_eq!(pool.stats().unwrap().free, 8);
    }
}

// =============================================================================
// Read-ahead
// =============================================================================

mod read_ahead_tests {
    use super::*;

    fn random_config() -> PoolConfig {
        let mut config = PoolConfig::for_testing(32);
        config.read_ahead.linear_enabled = false;
        config.read_ahead.area = 8;
        config.read_ahead.random_threshold = Some(3);
        config.read_ahead.linear_threshold = Some(6);
        config
    }

    #[test]
    fn test_random_trigger_below_threshold_reads_nothing() {
        let (pool, _, io) = setup(random_config(), 64);
        touch(&pool, 16);
        touch(&pool, 17);
        touch(&pool, 18);
        assert_eq!(io.submitted_count(), 0);
        assert!(!pool.is_cached(PageId::new(SPACE, 19)));
    }

    #[test]
    fn test_random_trigger_reads_rest_of_area() {
        let (pool, _, io) = setup(random_config(), 64);
        for no in 16..19 {
            touch(&pool, no);
        }
        touch(&pool, 19);

        assert_eq!(io.submitted_count(), 5);
        for no in 16..24 {
            assert!(pool.is_cached(PageId::new(SPACE, no)));
        }
        assert!(!pool.is_cached(PageId::new(SPACE, 24)));
        assert_eq!(pool.metrics().snapshot().read_ahead_random, 5);
        pool.validate().unwrap();
    }

    #[test]
    fn test_random_trigger_refused_during_startup() {
        let (pool, _, io) = setup(random_config(), 64);
        for no in 16..20 {
            touch(&pool, no);
        }
        let submitted = io.submitted_count();
        pool.set_recovery_phase(RecoveryPhase::Startup);
        assert_eq!(pool.read_ahead().random(PageId::new(SPACE, 40)).unwrap(), 0);
        assert_eq!(pool.read_ahead().random(PageId::new(SPACE, 21)).unwrap(), 0);
        assert_eq!(io.submitted_count(), submitted);
    }

    #[test]
    fn test_random_trigger_missing_tablespace_is_skipped() {
        let (pool, _, _) = setup(random_config(), 64);
        assert_eq!(pool.read_ahead().random(PageId::new(42, 0)).unwrap(), 0);
    }

    fn linear_config() -> PoolConfig {
        let mut config = PoolConfig::for_testing(32);
        config.read_ahead.random_enabled = false;
        config.read_ahead.area = 8;
        config.read_ahead.linear_threshold = Some(6);
        config
    }

    #[test]
    fn test_linear_trigger_on_sequential_scan() {
        let (pool, _, io) = setup(linear_config(), 64);
        for no in 0..7 {
            touch(&pool, no);
        }
        assert_eq!(io.submitted_count(), 0);

        touch(&pool, 7);
        let expected: Vec<PageId> = (8..16).map(|no| PageId::new(SPACE, no)).collect();
        assert_eq!(io.submitted(), expected);
        assert_eq!(pool.metrics().snapshot().read_ahead_linear, 8);
    }

    #[test]
    fn test_linear_trigger_needs_enough_accessed_pages() {
        let (pool, _, io) = setup(linear_config(), 64);
        // Only every other page of the area is accessed
        for no in (0..8).step_by(2) {
            touch(&pool, no);
        }
        touch(&pool, 7);
        assert_eq!(io.submitted_count(), 0);
    }

    #[test]
    fn test_linear_trigger_needs_whole_next_area() {
        let (pool, _, io) = setup(linear_config(), 12);
        for no in 0..8 {
            touch(&pool, no);
        }
        assert_eq!(io.submitted_count(), 0);
    }
}

// =============================================================================
// Exhaustion and validation
// =============================================================================

mod exhaustion_tests {
    use super::*;

    #[test]
    fn test_memory_blocks_exhaust_pool() {
        let (pool, _, _) = setup(quiet_config(20), 8);
        let mut blocks = Vec::new();
        for _ in 0..19 {
            blocks.push(pool.alloc_memory_block().unwrap());
        }
        assert_matches!(
            pool.alloc_memory_block(),
            Err(Error::PoolExhausted { capacity: 20, divisor: 10, .. })
        );

        pool.set_recovery_phase(RecoveryPhase::Recovery);
        blocks.push(pool.alloc_memory_block().unwrap());
        pool.set_recovery_phase(RecoveryPhase::Normal);

        for block in blocks {
            pool.free_memory_block(block).unwrap();
        }
        assert_eq!(pool.stats().unwrap().free, 20);
        pool.validate().unwrap();
    }

    #[test]
    fn test_diagnostics_mention_occupancy() {
        let (pool, _, _) = setup(quiet_config(8), 8);
        touch(&pool, 1);
        let text = pool.diagnostics().unwrap();
        assert!(text.contains("capacity 8"));
        assert!(text.contains("wait array"));
    }
}

// =============================================================================
// Compressed images
// =============================================================================

mod buddy_tests {
    use super::*;

    #[test]
    fn test_images_share_host_and_release_it() {
        let (pool, _, _) = setup(quiet_config(16), 16);
        let pages: Vec<_> = (0..8)
            .map(|no| pool.get_page(PageId::new(SPACE, no)).unwrap())
            .collect();
        for p in &pages {
            p.compress().unwrap();
        }
        let stats = pool.stats().unwrap();
        assert_eq!(stats.buddy.hosts, 1);
        assert_eq!(stats.buddy.used_blocks[0], 8);

        for p in pages.iter().rev() {
            assert!(p.drop_zip().unwrap());
        }
        let stats = pool.stats().unwrap();
        assert_eq!(stats.buddy.hosts, 0);
        assert_eq!(stats.memory_slots, 0);
        pool.validate().unwrap();
    }

    #[test]
    fn test_used_buddy_is_relocated_on_free() {
        let (pool, _, _) = setup(quiet_config(16), 16);
        let pages: Vec<_> = (0..9)
            .map(|no| pool.get_page(PageId::new(SPACE, no)).unwrap())
            .collect();
        for p in &pages {
            p.compress().unwrap();
        }
        assert_eq!(pool.stats().unwrap().buddy.hosts, 2);
        let first_host = pages[0].block().zip_ref().unwrap().slot;
        let second_host = pages[8].block().zip_ref().unwrap().slot;
        assert_eq!(pages[1].block().zip_ref().unwrap().slot, first_host);

        // Page 1's block is the buddy of page 0's; it moves to the second host
        assert!(pages[0].drop_zip().unwrap());
        let moved = pages[1].block().zip_ref().unwrap();
        assert_eq!((moved.slot, moved.offset), (second_host, 512));
        assert_eq!(pool.metrics().snapshot().buddy_relocations, 1);

        let image = pages[1].zip_image().unwrap();
        assert_eq!(page::page_id(&image), PageId::new(SPACE, 1));
        let frame = pool.compressor().decompress(&image, pool.page_size()).unwrap();
        assert_eq!(&frame[..], &*pages[1].read());
        pool.validate().unwrap();
    }

    #[test]
    fn test_realloc_moves_image_to_larger_block() {
        let (pool, _, _) = setup(quiet_config(16), 16);
        let p = pool.get_page(PageId::new(SPACE, 3)).unwrap();
        let before = p.compress().unwrap();
        assert_eq!(before.class, 0);

        assert!(pool.buddy().realloc(&p, 1500).unwrap());
        let after = p.block().zip_ref().unwrap();
        assert_eq!(after.class, 2);
        assert_eq!(after.len, before.len);
        assert_eq!(page::page_id(&p.zip_image().unwrap()), PageId::new(SPACE, 3));
        pool.validate().unwrap();
    }

    #[test]
    fn test_realloc_refuses_block_smaller_than_image() {
        let (pool, _, _) = setup(quiet_config(16), 16);
        let p = pool.get_page(PageId::new(SPACE, 3)).unwrap();
        let mut image = p.read()[..page::header::LEN].to_vec();
        image.resize(1500, 7);
        let before = p.attach_zip(&image).unwrap();
        assert_eq!(before.class, 2);

        assert!(!pool.buddy().realloc(&p, 600).unwrap());
        assert_eq!(p.block().zip_ref(), Some(before));
        assert_eq!(&p.zip_image().unwrap()[..], &image[..]);
        pool.validate().unwrap();
    }

    /// Compress pinned pages 0..9 into class-0 blocks: the first eight fill
    /// one host, page 8 opens a second. Page 1 carries the image of uncached
    /// page 40, so its owner cannot be found through the directory.
    fn attach_with_stray_image(store: &MemStore, pool: &BufferPool, pages: &[PinnedPage<'_>]) {
        let stray = store.page(PageId::new(SPACE, 40)).unwrap();
        let stray = pool.compressor().compress(&stray).unwrap();
        for (no, p) in pages.iter().enumerate() {
            if no == 1 {
                p.attach_zip(&stray).unwrap();
            } else {
                p.compress().unwrap();
            }
        }
    }

    #[test]
    fn test_relocation_fails_without_directory_owner() {
        let (pool, store, _) = setup(quiet_config(16), 64);
        let pages: Vec<_> = (0..9)
            .map(|no| pool.get_page(PageId::new(SPACE, no)).unwrap())
            .collect();
        attach_with_stray_image(&store, &pool, &pages);
        let first_host = pages[0].block().zip_ref().unwrap().slot;

        assert!(pages[0].drop_zip().unwrap());
        let stayed = pages[1].block().zip_ref().unwrap();
        assert_eq!((stayed.slot, stayed.offset), (first_host, 512));
        let snapshot = pool.metrics().snapshot();
        assert_eq!(snapshot.buddy_relocations, 0);
        assert_eq!(snapshot.buddy_relocation_failures, 1);
        pool.validate().unwrap();
    }

    #[test]
    fn test_shrinking_pool_finds_owner_by_scanning() {
        let (pool, store, _) = setup(quiet_config(16), 64);
        let pages: Vec<_> = (0..9)
            .map(|no| pool.get_page(PageId::new(SPACE, no)).unwrap())
            .collect();
        attach_with_stray_image(&store, &pool, &pages);
        let second_host = pages[8].block().zip_ref().unwrap().slot;
        let image = pages[1].zip_image().unwrap();

        pool.set_shrinking(true);
        assert!(pages[0].drop_zip().unwrap());
        let moved = pages[1].block().zip_ref().unwrap();
        assert_eq!((moved.slot, moved.offset), (second_host, 512));
        assert_eq!(pages[1].zip_image().unwrap(), image);
        let snapshot = pool.metrics().snapshot();
        assert_eq!(snapshot.buddy_relocations, 1);
        assert_eq!(snapshot.buddy_relocation_failures, 0);
        pool.validate().unwrap();
    }
}

// =============================================================================
// Wait array
// =============================================================================

mod wait_tests {
    use super::*;
    use bufpool::error::FatalPolicy;
    use bufpool::sync::{WaitArray, WaitKind};

    #[test]
    fn test_signal_wakes_two_waiters() {
        let array = Arc::new(WaitArray::new(8, FatalPolicy::Propagate));
        let object = array.new_object("test_object");

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let array = array.clone();
                thread::spawn(move || {
                    let cell = array.reserve(object, WaitKind::Exclusive).unwrap();
                    array.wait(cell).unwrap();
                })
            })
            .collect();

        while array.reserved_count() < 2 {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(array.signal(object), 2);
        assert_eq!(array.reserved_count(), 0);

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(array.waking_count(), 0);
        array.validate().unwrap();
    }

    #[test]
    fn test_concurrent_readers_share_pool() {
        let mut config = PoolConfig::for_testing(16);
        config.read_ahead.area = 8;
        config.read_ahead.linear_threshold = Some(6);
        let store = Arc::new(MemStore::new(config.page_size));
        store.create_space(SpaceId(SPACE), 64);
        let pool = BufferPool::new(config, store).unwrap();

        thread::scope(|s| {
            for t in 0..4u32 {
                let pool = &pool;
                s.spawn(move || {
                    for i in 0..200u32 {
                        let no = (i * 7 + t * 13) % 64;
                        let p = pool.get_page(PageId::new(SPACE, no)).unwrap();
                        assert_eq!(page::page_id(&p.read()).page_no, no);
                    }
                });
            }
        });

        while pool.io().pending_reads() > 0 {
            thread::sleep(Duration::from_millis(1));
        }
        pool.validate().unwrap();
        assert_eq!(pool.wait_array().reserved_count(), 0);
    }
}

// =============================================================================
// Configuration and stats
// =============================================================================

mod config_tests {
    use super::*;

    #[test]
    fn test_pool_from_yaml() {
        let yaml = r#"
page_size: 4096
capacity: 32
fatal_policy: propagate
buddy:
  min_size: 512
read_ahead:
  area: 16
"#;
        let config = PoolConfig::from_yaml_str(yaml).unwrap();
        let (pool, _, _) = setup(config, 8);
        assert_eq!(pool.capacity(), 32);
        assert_eq!(pool.buddy().sizes().full_class(), 3);
    }

    #[test]
    fn test_stats_serialize() {
        let (pool, _, _) = setup(quiet_config(8), 8);
        touch(&pool, 2);
        touch(&pool, 2);
        let stats = pool.stats().unwrap();
        assert_eq!(stats.lru_len, 1);
        assert!((stats.hit_ratio - 0.5).abs() < 1e-9);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["capacity"], 8);
        assert_eq!(json["recovery_phase"], "normal");
        assert!(json["captured_at"].is_string());

        let text = pool.metrics().export_text().unwrap();
        assert!(text.contains("bufpool_page_hits_total 1"));
        assert!(text.contains("bufpool_lru_len 1"));
    }

    #[test]
    fn test_watchdog_runs_and_stops() {
        let (pool, _, _) = setup(quiet_config(8), 8);
        let watchdog = pool.spawn_watchdog().unwrap();
        assert!(watchdog.is_running());
        watchdog.stop();
    }
}
