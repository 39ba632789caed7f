//! # Adaptive Hash Index
//!
//! An in-memory, latch-partitioned, opportunistic accelerator for B-tree
//! point lookups. For hot key prefixes the hash maps a record-prefix
//! fingerprint straight to a record pointer inside a resident leaf page,
//! skipping the root-to-leaf descent while the page stays cached and the
//! prefix parameters stay current.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ cursor: search_leaf / search_info_update      │
//! ├───────────────┬───────────────────────────────┤
//! │ guess_on_hash │ heuristics (index + block)    │
//! ├───────────────┴───────────────┬───────────────┤
//! │ build / drop / move / insert- │  fold (CRC32C │
//! │ and delete-side maintenance   │  of prefixes) │
//! ├───────────────────────────────┴───────────────┤
//! │ partitions: latch + cell table + node slab    │
//! ├───────────────────────────────────────────────┤
//! │ buffer pool: frames, blocks, page-hash cells  │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Correctness Stance
//!
//! The hash never improves correctness: it is a cache that must be safe to
//! disable or empty at any instant. Every failure path is a silent miss
//! that degrades to the ordinary B-tree descent; no public operation has an
//! error channel.
//!
//! ## Lock Order
//!
//! ```text
//! dict freeze  →  partition latches (ascending)  →  partition blocks_mutex
//! ```
//!
//! Block page latches join in two ways that cannot form a cycle: the guess
//! path takes them with try-lock while holding a partition latch in shared
//! mode (never blocking), and the build/drop paths receive them from the
//! caller before taking any partition latch.

pub mod fold;
pub mod heuristic;
pub mod monitor;
pub mod partition;

mod build;
mod guess;
mod maintain;
mod validate;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLockWriteGuard;
use tracing::debug;

use crate::config::{next_prime, AhiConfig, CELLS_DIVISOR};
use crate::index::Dict;
use crate::storage::BufferPool;

pub use self::fold::{rec_fold, tuple_fold, LEFT_SIDE};
pub use self::monitor::{Monitor, MonitorSnapshot};
pub use self::partition::Partition;

use self::partition::Table;

/// The process-wide adaptive hash system.
pub struct Ahi {
    enabled: AtomicBool,
    parts: Box<[Partition]>,
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) dict: Arc<Dict>,
    pub monitor: Monitor,
}

impl Ahi {
    pub fn new(pool: Arc<BufferPool>, dict: Arc<Dict>, config: AhiConfig) -> Self {
        let n_parts = config.n_parts.max(1);
        let ahi = Self {
            enabled: AtomicBool::new(false),
            parts: (0..n_parts).map(|_| Partition::new()).collect(),
            pool,
            dict,
            monitor: Monitor::new(),
        };
        if config.enabled {
            ahi.enable(false);
        }
        ahi
    }

    #[inline]
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn n_parts(&self) -> usize {
        self.parts.len()
    }

    /// The partition an index hashes into.
    #[inline]
    pub(crate) fn get_part(&self, index_id: u64) -> &Partition {
        &self.parts[(index_id % self.parts.len() as u64) as usize]
    }

    /// Exclusive guards over every partition table, in partition order.
    pub(crate) fn write_lock_all(&self) -> Vec<RwLockWriteGuard<'_, Table>> {
        self.parts.iter().map(|p| p.latch.write()).collect()
    }

    /// Turn the hash system on, sizing the cell arrays from the pool.
    /// Idempotent. `resize` tells whether a buffer-pool resize is driving
    /// the call; no resize path exists here, so it only documents intent.
    pub fn enable(&self, resize: bool) {
        let _ = resize;

        let mut guards = self.write_lock_all();

        if guards[0].is_allocated() {
            debug_assert!(self.enabled());
            return;
        }

        let cells_total = self.pool.capacity_bytes() / size_of::<*const u8>() / CELLS_DIVISOR;
        let per_part = next_prime((cells_total / self.parts.len()).max(1));
        for guard in guards.iter_mut() {
            guard.alloc(per_part);
        }

        self.enabled.store(true, Ordering::Release);
        debug!(
            parts = self.parts.len(),
            cells_per_part = per_part,
            "adaptive hash index enabled"
        );
    }

    /// Turn the hash system off and empty it: zero every index's page
    /// reference count, clear every block's hash state, release the cell
    /// arrays and hand all slab pages back to the pool.
    pub fn disable(&self) {
        let _freeze = self.dict.freeze();
        let mut guards = self.write_lock_all();

        if !self.enabled() {
            return;
        }
        self.enabled.store(false, Ordering::Release);

        self.dict.for_each_index(|index| {
            index.search_info.ref_count.store(0, Ordering::Relaxed);
        });

        let garbage = self.pool.clear_hash_index();

        for (part, guard) in self.parts.iter().zip(guards.iter_mut()) {
            part.clear(guard, &self.pool);
        }
        drop(guards);

        for index in garbage {
            self.dict.lazy_free(index);
        }
        debug!("adaptive hash index disabled and emptied");
    }

    /// Total live chain nodes across every partition.
    pub fn node_count(&self) -> usize {
        self.parts.iter().map(|p| p.latch.read().node_count()).sum()
    }

    /// Refill the partition's spare slab page ahead of an insert.
    pub(crate) fn prepare_insert(&self, part: &Partition) {
        part.prepare_insert(&self.pool, &self.enabled);
    }
}

impl Drop for Ahi {
    fn drop(&mut self) {
        for part in self.parts.iter() {
            let mut guard = part.latch.write();
            part.clear(&mut guard, &self.pool);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{IndexField, RecFormat};
    use crate::index::IndexDef;

    fn system() -> (Arc<BufferPool>, Arc<Dict>, Ahi) {
        let pool = BufferPool::new(16).unwrap();
        let dict = Dict::new();
        let ahi = Ahi::new(Arc::clone(&pool), Arc::clone(&dict), AhiConfig::default());
        (pool, dict, ahi)
    }

    #[test]
    fn test_enable_is_idempotent() {
        let (_pool, _dict, ahi) = system();
        assert!(ahi.enabled());
        ahi.enable(false);
        assert!(ahi.enabled());
        assert_eq!(ahi.node_count(), 0);
    }

    #[test]
    fn test_disable_then_enable_round_trip() {
        let (pool, _dict, ahi) = system();
        let free_before = pool.free_pages();

        ahi.disable();
        assert!(!ahi.enabled());
        assert_eq!(pool.free_pages(), free_before);

        ahi.enable(false);
        assert!(ahi.enabled());
    }

    #[test]
    fn test_disable_zeroes_ref_counts() {
        let (_pool, dict, ahi) = system();
        let index = IndexDef::new(
            5,
            RecFormat::Compact,
            vec![IndexField::fixed(4)],
            1,
        );
        dict.register(Arc::clone(&index));
        index
            .search_info
            .ref_count
            .store(3, std::sync::atomic::Ordering::Relaxed);

        ahi.disable();
        assert_eq!(
            index
                .search_info
                .ref_count
                .load(std::sync::atomic::Ordering::Relaxed),
            0
        );
    }

    #[test]
    fn test_partition_selection_by_index_id() {
        let (_pool, _dict, ahi) = system();
        let a = ahi.get_part(0) as *const Partition;
        let b = ahi.get_part(ahi.n_parts() as u64) as *const Partition;
        assert_eq!(a, b);
        let c = ahi.get_part(1) as *const Partition;
        assert_ne!(a, c);
    }
}
