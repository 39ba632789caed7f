//! # Pinned Buffer Pool
//!
//! A fixed set of page frames carved into chunks, each chunk one aligned
//! allocation plus a boxed slice of block descriptors. Frames never move, so
//! raw record pointers stay resolvable for the whole pool lifetime.
//!
//! ## Pointer Resolution
//!
//! ```text
//! chunk_bases (sorted): [(base0, 0), (base1, 1), ...]
//!
//! block_from_ptr(p):  upper_bound(p) -> chunk;  (p - base) >> PAGE_SHIFT
//! ```
//!
//! The hash system stores bare record pointers in its chains; this is the
//! constant-time way back from a pointer to the block descriptor that owns
//! it, with no per-record bookkeeping.
//!
//! ## Eviction Rendezvous
//!
//! Evicting a page and guessing into it race by design. The page-hash cell
//! latch is the rendezvous: eviction flips the block to `REMOVE_HASH` and
//! unmaps it while holding the cell latch; the guess path try-locks the
//! block latch under the same cell latch and re-checks the state, so it can
//! never pin a frame that eviction already claimed.
//!
//! ## Pin Protocol
//!
//! Callers `fix()` a block before using its frame and `unfix()` when done;
//! frames with a non-zero fix count are not evictable. There is no I/O
//! anywhere in this pool: a page either is resident or does not exist.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result};
use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, RwLock};

use crate::config::{CHUNK_PAGES, PAGE_HASH_CELLS, PAGE_SHIFT, PAGE_SIZE};
use crate::index::IndexDef;
use crate::storage::block::{Block, BLOCK_NOT_USED, BLOCK_REMOVE_HASH, BLOCK_UNFIXED};

struct Chunk {
    mem: *mut u8,
    layout: Layout,
    blocks: Box<[Block]>,
}

// SAFETY: `mem` is owned by the chunk, freed exactly once in Drop, and only
// reached through Block accessors that impose the latching protocol.
unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

impl Chunk {
    fn new(n_pages: usize) -> Result<Self> {
        let layout = Layout::from_size_align(n_pages * PAGE_SIZE, PAGE_SIZE)
            .map_err(|e| eyre::eyre!("bad chunk layout: {e}"))?;
        // SAFETY: layout has non-zero size (n_pages >= 1).
        let mem = unsafe { alloc_zeroed(layout) };
        ensure!(!mem.is_null(), "chunk allocation of {} pages failed", n_pages);

        let blocks = (0..n_pages)
            // SAFETY: i < n_pages, so the offset stays inside the allocation.
            .map(|i| Block::new(unsafe { mem.add(i * PAGE_SIZE) }))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self { mem, layout, blocks })
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // SAFETY: `mem` was allocated with `layout` in Chunk::new.
        unsafe { dealloc(self.mem, self.layout) }
    }
}

/// The buffer pool. Shared, internally synchronized.
pub struct BufferPool {
    chunks: Box<[Chunk]>,
    /// Sorted (frame base address, chunk number) pairs.
    chunk_bases: Vec<(usize, usize)>,
    free: Mutex<Vec<*const Block>>,
    page_map: RwLock<HashMap<u64, *const Block>>,
    cell_latches: Box<[Mutex<()>]>,
    /// Page accesses satisfied by any path, hash guesses included.
    pub n_page_gets: AtomicU64,
}

// SAFETY: the raw block pointers in `free` and `page_map` point into
// `chunks`, which the pool owns; every access route is internally locked.
unsafe impl Send for BufferPool {}
unsafe impl Sync for BufferPool {}

impl BufferPool {
    pub fn new(n_pages: usize) -> Result<Arc<Self>> {
        ensure!(n_pages > 0, "buffer pool needs at least one page");

        let mut chunks = Vec::new();
        let mut remaining = n_pages;
        while remaining > 0 {
            let take = remaining.min(CHUNK_PAGES);
            chunks.push(Chunk::new(take)?);
            remaining -= take;
        }

        let mut chunk_bases: Vec<(usize, usize)> = chunks
            .iter()
            .enumerate()
            .map(|(i, c)| (c.mem as usize, i))
            .collect();
        chunk_bases.sort_unstable();

        let free = chunks
            .iter()
            .flat_map(|c| c.blocks.iter().map(|b| b as *const Block))
            .collect();

        Ok(Arc::new(Self {
            chunks: chunks.into_boxed_slice(),
            chunk_bases,
            free: Mutex::new(free),
            page_map: RwLock::new(HashMap::new()),
            cell_latches: (0..PAGE_HASH_CELLS)
                .map(|_| Mutex::new(()))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            n_page_gets: AtomicU64::new(0),
        }))
    }

    pub fn capacity_pages(&self) -> usize {
        self.chunks.iter().map(|c| c.blocks.len()).sum()
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_pages() * PAGE_SIZE
    }

    pub fn free_pages(&self) -> usize {
        self.free.lock().len()
    }

    /// Take a free frame out of the replacement system. Returns `None` when
    /// the pool is exhausted; callers treat that as a soft failure.
    pub fn alloc_block(&self) -> Option<&Block> {
        let ptr = self.free.lock().pop()?;
        // SAFETY: the pointer came from `chunks`, which lives as long as self.
        let block = unsafe { &*ptr };
        block.reset_for_alloc();
        Some(block)
    }

    /// Return a frame to the free list.
    pub fn free_block(&self, block: &Block) {
        debug_assert_eq!(block.fix_count(), 0);
        debug_assert!(block.index.load(Ordering::Relaxed).is_null());
        block.set_state(BLOCK_NOT_USED);
        self.free.lock().push(block as *const Block);
    }

    /// Map an allocated block to a page id.
    pub fn register_page(&self, block: &Block, page_id: u64) {
        debug_assert_eq!(block.state(), BLOCK_UNFIXED);
        block.set_page_id(page_id);
        self.page_map.write().insert(page_id, block as *const Block);
    }

    /// Peek a resident page without latching it.
    pub fn get_page(&self, page_id: u64) -> Option<&Block> {
        let ptr = *self.page_map.read().get(&page_id)?;
        // SAFETY: the pointer came from `chunks`, which lives as long as self.
        Some(unsafe { &*ptr })
    }

    /// Resolve a pointer within any frame to its block descriptor.
    ///
    /// # Panics
    /// Panics if `ptr` lies outside every chunk: a chain entry pointing
    /// outside the pool is memory corruption, not a recoverable miss.
    pub fn block_from_ptr(&self, ptr: *const u8) -> &Block {
        let addr = ptr as usize;
        let i = self.chunk_bases.partition_point(|&(base, _)| base <= addr);
        assert!(i > 0, "pointer below every chunk base");
        let (base, chunk_no) = self.chunk_bases[i - 1];

        let chunk = &self.chunks[chunk_no];
        let offs = (addr - base) >> PAGE_SHIFT;
        assert!(offs < chunk.blocks.len(), "pointer past chunk end");

        let block = &chunk.blocks[offs];
        debug_assert_eq!(
            crate::storage::page::page_align(ptr),
            block.frame() as *const u8
        );
        block
    }

    /// The latch serializing lookups of `page_id` against its eviction.
    pub fn cell_latch(&self, page_id: u64) -> &Mutex<()> {
        &self.cell_latches[page_id as usize % self.cell_latches.len()]
    }

    /// Second-chance style freshness marking on access.
    pub fn make_young_if_needed(&self, block: &Block) {
        if !block.is_visited() {
            block.mark_visited();
        }
    }

    /// Evict a resident page. `drop_hash` runs after the block has been
    /// unmapped and flagged `REMOVE_HASH` but before the frame is reused;
    /// it must remove any hash entries still pointing into the page.
    pub fn evict_page<F: FnOnce(&Block)>(&self, page_id: u64, drop_hash: F) -> bool {
        let Some(block) = self.get_page(page_id) else {
            return false;
        };

        {
            let _cell = self.cell_latch(page_id).lock();
            if !block.can_relocate() {
                return false;
            }
            block.set_state(BLOCK_REMOVE_HASH);
            self.page_map.write().remove(&page_id);
        }

        drop_hash(block);
        debug_assert!(block.index.load(Ordering::Relaxed).is_null());

        self.free_block(block);
        true
    }

    /// Clear the hash state of every block. The caller must hold every hash
    /// partition latch exclusively; returns the distinct freed indexes that
    /// lost their last page reference and now await lazy freeing.
    pub fn clear_hash_index(&self) -> Vec<*const IndexDef> {
        let mut garbage: HashSet<*const IndexDef> = HashSet::new();

        for chunk in self.chunks.iter() {
            for block in chunk.blocks.iter() {
                let index = block
                    .index
                    .swap(std::ptr::null_mut(), Ordering::Relaxed);
                if index.is_null() {
                    #[cfg(debug_assertions)]
                    debug_assert_eq!(block.n_pointers.load(Ordering::Relaxed), 0);
                    continue;
                }
                #[cfg(debug_assertions)]
                block.n_pointers.store(0, Ordering::Relaxed);
                // SAFETY: a non-null block index is kept alive by the
                // dictionary (registry or freed list) until lazy_free, which
                // only runs after this sweep completes.
                if unsafe { (*index).freed() } {
                    garbage.insert(index);
                }
            }
        }

        garbage.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{IndexField, RecFormat};
    use crate::storage::page;

    fn pool(pages: usize) -> Arc<BufferPool> {
        BufferPool::new(pages).unwrap()
    }

    #[test]
    fn test_alloc_free_cycle() {
        let pool = pool(4);
        assert_eq!(pool.free_pages(), 4);

        let block = pool.alloc_block().unwrap();
        assert_eq!(block.state(), BLOCK_UNFIXED);
        assert_eq!(pool.free_pages(), 3);

        pool.free_block(block);
        assert_eq!(pool.free_pages(), 4);
    }

    #[test]
    fn test_exhaustion_is_soft() {
        let pool = pool(2);
        let a = pool.alloc_block().unwrap();
        let _b = pool.alloc_block().unwrap();
        assert!(pool.alloc_block().is_none());
        pool.free_block(a);
        assert!(pool.alloc_block().is_some());
    }

    #[test]
    fn test_block_from_ptr_across_chunks() {
        // More pages than CHUNK_PAGES forces multiple chunks.
        let pool = pool(CHUNK_PAGES + 3);

        for _ in 0..CHUNK_PAGES + 3 {
            let block = pool.alloc_block().unwrap();
            let inside = unsafe { block.frame().add(1234) };
            let resolved = pool.block_from_ptr(inside);
            assert!(std::ptr::eq(resolved, block));
        }
    }

    #[test]
    fn test_register_and_get_page() {
        let pool = pool(4);
        let block = pool.alloc_block().unwrap();
        pool.register_page(block, 77);

        let found = pool.get_page(77).unwrap();
        assert!(std::ptr::eq(found, block));
        assert!(pool.get_page(78).is_none());
    }

    #[test]
    fn test_evict_refuses_pinned_page() {
        let pool = pool(4);
        let index = crate::index::IndexDef::new(
            1,
            RecFormat::Compact,
            vec![IndexField::fixed(4)],
            1,
        );
        let block = pool.alloc_block().unwrap();
        unsafe { page::leaf_init(block.frame(), &index) };
        pool.register_page(block, 5);

        block.fix();
        assert!(!pool.evict_page(5, |_| panic!("must not drop a pinned page")));
        block.unfix();

        let mut dropped = false;
        assert!(pool.evict_page(5, |b| {
            dropped = true;
            assert_eq!(b.state(), BLOCK_REMOVE_HASH);
        }));
        assert!(dropped);
        assert!(pool.get_page(5).is_none());
        assert_eq!(pool.free_pages(), 4);
    }
}
