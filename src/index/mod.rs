//! # Index Metadata and Dictionary
//!
//! This module holds the per-index descriptor the hash system hangs its
//! state off, and a small dictionary that owns index definitions, including
//! the deferred teardown of indexes that were dropped while buffer pages
//! still carried hash entries for them.
//!
//! ## Search Info
//!
//! `SearchInfo` is deliberately unlatched: every field is a relaxed atomic
//! and every reader tolerates torn combinations. The heuristic it feeds is
//! advisory; a stale read costs at most one wasted build or one skipped
//! guess, never correctness.
//!
//! ## Freed Indexes
//!
//! Dropping an index does not free its definition while `ref_count` hashed
//! pages still point at it: the `Arc` moves to a freed list and the hash
//! system calls [`Dict::lazy_free`] when the last page reference goes away.
//! Raw `*const IndexDef` pointers stored in block descriptors stay valid for
//! exactly that window.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::config::{HASH_ANALYSIS_LIMIT, HASH_POTENTIAL_MAX};
use crate::records::{IndexField, RecFormat};

/// Adaptive-search state of one index. Unlatched by design; see the module
/// docs.
#[derive(Debug)]
pub struct SearchInfo {
    /// Number of buffer blocks whose page is currently hashed under this
    /// index.
    pub ref_count: AtomicU32,
    /// Recommended prefix parameters: low 16 bits complete fields, next 15
    /// bits extra bytes of the following field, top bit the side of an
    /// equal-prefix run to represent.
    pub left_bytes_fields: AtomicU32,
    /// Consecutive searches the recommendation would have satisfied,
    /// saturating at [`HASH_POTENTIAL_MAX`].
    pub n_hash_potential: AtomicU8,
    /// Whether the last hash lookup on this index succeeded.
    pub last_hash_succ: AtomicBool,
    /// Searches seen since the last recommendation change; analysis is
    /// suppressed until this warms past [`HASH_ANALYSIS_LIMIT`].
    hash_analysis: AtomicU32,
}

impl SearchInfo {
    fn new() -> Self {
        Self {
            ref_count: AtomicU32::new(0),
            left_bytes_fields: AtomicU32::new(0),
            n_hash_potential: AtomicU8::new(0),
            last_hash_succ: AtomicBool::new(false),
            hash_analysis: AtomicU32::new(0),
        }
    }

    pub fn hash_analysis_reset(&self) {
        self.hash_analysis.store(0, Ordering::Relaxed);
    }

    /// Post-incrementing warm-up gate.
    pub fn hash_analysis_useful(&self) -> bool {
        self.hash_analysis.fetch_add(1, Ordering::Relaxed) >= HASH_ANALYSIS_LIMIT
    }

    /// Saturating bump of the potential counter.
    pub fn increment_potential(&self) {
        let n = self.n_hash_potential.load(Ordering::Relaxed);
        if n < HASH_POTENTIAL_MAX {
            self.n_hash_potential.store(n + 1, Ordering::Relaxed);
        }
    }
}

/// Definition of one B-tree index, as far as the hash system cares.
#[derive(Debug)]
pub struct IndexDef {
    pub id: u64,
    pub format: RecFormat,
    pub fields: Vec<IndexField>,
    /// Number of fields that determine uniqueness within the tree.
    pub n_uniq: u16,
    n_core_null_bytes: usize,
    freed: AtomicBool,
    pub search_info: SearchInfo,
}

impl IndexDef {
    pub fn new(id: u64, format: RecFormat, fields: Vec<IndexField>, n_uniq: u16) -> Arc<Self> {
        debug_assert!(n_uniq as usize <= fields.len());
        let n_nullable = fields.iter().filter(|f| f.nullable).count();
        Arc::new(Self {
            id,
            format,
            fields,
            n_uniq,
            n_core_null_bytes: n_nullable.div_ceil(8),
            freed: AtomicBool::new(false),
            search_info: SearchInfo::new(),
        })
    }

    pub fn n_core_fields(&self) -> usize {
        self.fields.len()
    }

    pub fn n_core_null_bytes(&self) -> usize {
        self.n_core_null_bytes
    }

    pub fn n_unique_in_tree(&self) -> u16 {
        self.n_uniq
    }

    pub fn not_redundant(&self) -> bool {
        self.format != RecFormat::Redundant
    }

    /// Whether the index was dropped and lives on only for hashed pages.
    pub fn freed(&self) -> bool {
        self.freed.load(Ordering::Relaxed)
    }

    fn set_freed(&self) {
        self.freed.store(true, Ordering::Relaxed);
    }
}

/// Minimal data dictionary: owns index definitions and the freed list.
pub struct Dict {
    /// Freezing the dictionary (shared mode) keeps the registry stable while
    /// the hash system sweeps it.
    latch: RwLock<()>,
    indexes: RwLock<HashMap<u64, Arc<IndexDef>>>,
    freed_indexes: Mutex<Vec<Arc<IndexDef>>>,
}

impl Dict {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            latch: RwLock::new(()),
            indexes: RwLock::new(HashMap::new()),
            freed_indexes: Mutex::new(Vec::new()),
        })
    }

    pub fn freeze(&self) -> RwLockReadGuard<'_, ()> {
        self.latch.read()
    }

    pub fn register(&self, index: Arc<IndexDef>) {
        self.indexes.write().insert(index.id, index);
    }

    pub fn get(&self, id: u64) -> Option<Arc<IndexDef>> {
        self.indexes.read().get(&id).cloned()
    }

    /// Drop an index from the dictionary. The definition stays alive on the
    /// freed list until the hash system releases its last page reference.
    pub fn drop_index(&self, id: u64) {
        let Some(index) = self.indexes.write().remove(&id) else {
            return;
        };
        index.set_freed();
        if index.search_info.ref_count.load(Ordering::Relaxed) == 0 {
            return;
        }
        self.freed_indexes.lock().push(index);
    }

    /// Release the detached definition of a freed index.
    pub(crate) fn lazy_free(&self, index: *const IndexDef) {
        let mut freed = self.freed_indexes.lock();
        if let Some(pos) = freed.iter().position(|i| Arc::as_ptr(i) == index) {
            let removed = freed.swap_remove(pos);
            debug_assert!(removed.freed());
        }
    }

    pub fn for_each_index(&self, mut f: impl FnMut(&Arc<IndexDef>)) {
        for index in self.indexes.read().values() {
            f(index);
        }
        for index in self.freed_indexes.lock().iter() {
            f(index);
        }
    }

    pub fn freed_count(&self) -> usize {
        self.freed_indexes.lock().len()
    }
}
