//! # Hash Partitions: Cell Table and Chain-Node Slab
//!
//! Each partition owns an open-addressed cell array whose cells head
//! singly-linked chains of `Node`s, plus a bump allocator that carves those
//! nodes out of whole buffer-pool pages.
//!
//! ## Latching
//!
//! The partition latch (a reader-writer lock wrapping the table) protects
//! the cell array and every chain link. Lookups run under it in shared
//! mode; any structural change requires exclusive mode. The slab state
//! (page list, spare page, bump offsets) has its own mutex, acquired while
//! the latch is already write-held, never the other way around.
//!
//! ## Slab Shape
//!
//! ```text
//! pages: [page0][page1][page2]       spare: [pageS]
//!                       ^ tail: nodes occupy [0, free_offset)
//! ```
//!
//! Allocation bumps the tail page's `free_offset`; when the tail is full the
//! spare page becomes the new tail. No spare means the insert is silently
//! dropped; the hash is a cache and forward progress must not depend on
//! allocating inside the write latch.
//!
//! Erasure swaps the erased node with the tail page's topmost node and
//! shrinks, so live nodes always stay contiguous and an emptied page can go
//! back to the buffer pool (the first emptied page is retained as the
//! spare). The swap relocates a survivor, which is why whole-page removal
//! restarts its chain scan after every hit.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::config::PAGE_SIZE;
use crate::storage::{Block, BufferPool};

/// One chain entry: a fingerprint and the record it points at.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct Node {
    pub fold: u32,
    pub next: *mut Node,
    pub rec: *const u8,
    /// Block containing `rec`, tracked to cross-check pointer resolution.
    #[cfg(debug_assertions)]
    pub block: *const Block,
}

pub(crate) const NODE_SIZE: usize = size_of::<Node>();

const _: () = assert!(NODE_SIZE <= PAGE_SIZE);

/// The cell array. Lives inside the partition latch; empty while the hash
/// system is disabled.
pub(crate) struct Table {
    cells: Vec<*mut Node>,
}

// SAFETY: the node pointers reach memory inside slab pages owned by the same
// partition; every access happens under the partition latch.
unsafe impl Send for Table {}
unsafe impl Sync for Table {}

impl Table {
    fn empty() -> Self {
        Self { cells: Vec::new() }
    }

    pub(crate) fn is_allocated(&self) -> bool {
        !self.cells.is_empty()
    }

    pub(crate) fn n_cells(&self) -> usize {
        self.cells.len()
    }

    pub(crate) fn alloc(&mut self, n_cells: usize) {
        debug_assert!(self.cells.is_empty());
        self.cells = vec![std::ptr::null_mut(); n_cells];
    }

    #[inline]
    fn cell_index(&self, fold: u32) -> usize {
        fold as usize % self.cells.len()
    }

    #[inline]
    pub(crate) fn cell_head(&self, fold: u32) -> *mut Node {
        self.cells[self.cell_index(fold)]
    }

    #[inline]
    pub(crate) fn cell_at(&self, i: usize) -> *mut Node {
        self.cells[i]
    }

    /// Repoint the node for `(fold, rec)` at `new_rec` if it exists.
    ///
    /// # Safety
    /// The caller holds the owning partition's latch exclusively; `new_rec`
    /// points into `new_block`'s frame.
    pub(crate) unsafe fn search_and_update(
        &mut self,
        fold: u32,
        rec: *const u8,
        new_rec: *const u8,
        new_block: &Block,
    ) -> bool {
        #[cfg(not(debug_assertions))]
        let _ = new_block;

        let mut node = self.cell_head(fold);
        while !node.is_null() {
            let n = &mut *node;
            if n.rec == rec {
                #[cfg(debug_assertions)]
                {
                    (*n.block).n_pointers.fetch_sub(1, Ordering::Relaxed);
                    new_block.n_pointers.fetch_add(1, Ordering::Relaxed);
                    n.block = new_block;
                }
                n.rec = new_rec;
                return true;
            }
            node = n.next;
        }
        false
    }

    /// Total live nodes, counted the slow way. Test and validation aid.
    pub(crate) fn node_count(&self) -> usize {
        let mut n = 0;
        for &head in &self.cells {
            let mut node = head;
            while !node.is_null() {
                n += 1;
                // SAFETY: chain links are valid under the partition latch
                // our caller holds.
                node = unsafe { (*node).next };
            }
        }
        n
    }
}

struct Slab {
    /// Buffer-pool pages currently serving as node arenas, tail last.
    pages: Vec<*const Block>,
    /// Cached page so the next tail extension never allocates under the
    /// write latch.
    spare: *const Block,
}

// SAFETY: the block pointers target pool-owned descriptors that outlive the
// partition; all access is under `blocks_mutex`.
unsafe impl Send for Slab {}

/// One shard of the hash system.
pub struct Partition {
    pub(crate) latch: RwLock<Table>,
    blocks_mutex: Mutex<Slab>,
}

impl Partition {
    pub(crate) fn new() -> Self {
        Self {
            latch: RwLock::new(Table::empty()),
            blocks_mutex: Mutex::new(Slab {
                pages: Vec::new(),
                spare: std::ptr::null(),
            }),
        }
    }

    /// Ensure a spare slab page exists for a future insert. Runs without
    /// the partition latch; call before taking it.
    pub(crate) fn prepare_insert(&self, pool: &BufferPool, enabled: &AtomicBool) {
        if !self.blocks_mutex.lock().spare.is_null() || !enabled.load(Ordering::Acquire) {
            return;
        }
        let Some(block) = pool.alloc_block() else {
            return;
        };

        let mut slab = self.blocks_mutex.lock();
        if slab.spare.is_null() && enabled.load(Ordering::Acquire) {
            slab.spare = block;
        } else {
            drop(slab);
            pool.free_block(block);
        }
    }

    /// Insert `(fold, rec)`, replacing the record of an existing equal-fold
    /// node. Returns false when the entry had to be dropped because the
    /// slab could not grow.
    ///
    /// # Safety
    /// The caller holds this partition's latch exclusively (`table` is the
    /// guarded value); `rec` points into `block`'s frame.
    pub(crate) unsafe fn insert(
        &self,
        table: &mut Table,
        fold: u32,
        rec: *const u8,
        block: &Block,
    ) -> bool {
        #[cfg(not(debug_assertions))]
        let _ = block;
        #[cfg(debug_assertions)]
        debug_assert_eq!(
            crate::storage::page::page_align(rec),
            block.frame() as *const u8
        );

        let cell = table.cell_index(fold);

        let mut node = table.cells[cell];
        while !node.is_null() {
            let n = &mut *node;
            if n.fold == fold {
                #[cfg(debug_assertions)]
                {
                    (*n.block).n_pointers.fetch_sub(1, Ordering::Relaxed);
                    block.n_pointers.fetch_add(1, Ordering::Relaxed);
                    n.block = block;
                }
                n.rec = rec;
                return true;
            }
            node = n.next;
        }

        let Some(new_node) = self.alloc_node() else {
            return false;
        };

        new_node.write(Node {
            fold,
            next: std::ptr::null_mut(),
            rec,
            #[cfg(debug_assertions)]
            block: block as *const Block,
        });
        #[cfg(debug_assertions)]
        block.n_pointers.fetch_add(1, Ordering::Relaxed);

        let mut prev = &mut table.cells[cell] as *mut *mut Node;
        while !(*prev).is_null() {
            prev = &mut (**prev).next;
        }
        *prev = new_node;
        true
    }

    /// Bump-allocate one node, consuming the spare page when the tail is
    /// full. None when no spare is cached.
    fn alloc_node(&self) -> Option<*mut Node> {
        let mut slab = self.blocks_mutex.lock();

        if let Some(&last) = slab.pages.last() {
            // SAFETY: slab pages are live pool blocks owned by this slab.
            let last = unsafe { &*last };
            let offset = last.free_offset.load(Ordering::Relaxed) as usize;
            if offset + NODE_SIZE <= PAGE_SIZE {
                last.free_offset
                    .store((offset + NODE_SIZE) as u32, Ordering::Relaxed);
                // SAFETY: the offset stays within the frame.
                return Some(unsafe { last.frame().add(offset) } as *mut Node);
            }
        }

        if slab.spare.is_null() {
            return None;
        }
        let page = slab.spare;
        slab.spare = std::ptr::null();
        slab.pages.push(page);
        // SAFETY: as above.
        let page = unsafe { &*page };
        page.free_offset.store(NODE_SIZE as u32, Ordering::Relaxed);
        Some(page.frame() as *mut Node)
    }

    /// Unlink the node for `(fold, rec)` if present. Returns whether it was
    /// found and, possibly, an emptied slab page for the caller to return
    /// to the pool once latches are released.
    ///
    /// # Safety
    /// The caller holds this partition's latch exclusively.
    pub(crate) unsafe fn erase(
        &self,
        table: &mut Table,
        fold: u32,
        rec: *const u8,
    ) -> (bool, Option<*const Block>) {
        let cell = table.cell_index(fold);

        let mut prev = &mut table.cells[cell] as *mut *mut Node;
        while !(*prev).is_null() {
            let node = *prev;
            if (*node).rec == rec {
                *prev = (*node).next;
                (*node).next = std::ptr::null_mut();
                return (true, self.cleanup_after_erase(table, node));
            }
            prev = &mut (*node).next;
        }

        (false, None)
    }

    /// Keep the slab contiguous after unlinking `erase`: move the tail
    /// page's topmost node into the hole, rewire the one chain pointer that
    /// referenced it, and shrink. An emptied tail page becomes the spare;
    /// if a spare already exists the page is handed back to the caller.
    ///
    /// # Safety
    /// The caller holds this partition's latch exclusively and has already
    /// unlinked `erase` from its chain.
    unsafe fn cleanup_after_erase(
        &self,
        table: &mut Table,
        erase: *mut Node,
    ) -> Option<*const Block> {
        #[cfg(debug_assertions)]
        {
            let block = (*erase).block;
            debug_assert_eq!(
                crate::storage::page::page_align((*erase).rec),
                (*block).frame() as *const u8
            );
            (*block).n_pointers.fetch_sub(1, Ordering::Relaxed);
        }

        let mut slab = self.blocks_mutex.lock();

        let last_ptr = *slab.pages.last().expect("erase from an empty slab");
        // SAFETY: slab pages are live pool blocks owned by this slab.
        let last = &*last_ptr;
        let top_offset = last.free_offset.load(Ordering::Relaxed) as usize - NODE_SIZE;
        let top = last.frame().add(top_offset) as *mut Node;

        if erase != top {
            *erase = *top;
            let cell = table.cell_index((*erase).fold);
            let mut prev = &mut table.cells[cell] as *mut *mut Node;
            while *prev != top {
                prev = &mut (**prev).next;
            }
            *prev = erase;
        }

        last.free_offset.store(top_offset as u32, Ordering::Relaxed);

        if top_offset == 0 {
            slab.pages.pop();
            if slab.spare.is_null() {
                slab.spare = last_ptr;
            } else {
                return Some(last_ptr);
            }
        }

        None
    }

    /// Remove every node whose record lies within `page`. The erase-side
    /// compaction can relocate surviving nodes of the same chain, so the
    /// scan restarts from the cell head after every removal.
    ///
    /// # Safety
    /// The caller holds this partition's latch exclusively; `page` is a
    /// frame base address.
    pub(crate) unsafe fn remove_all_to_page(
        &self,
        table: &mut Table,
        pool: &BufferPool,
        fold: u32,
        page: *const u8,
    ) -> u64 {
        let cell = table.cell_index(fold);
        let mut removed = 0;

        'rewind: loop {
            let mut prev = &mut table.cells[cell] as *mut *mut Node;
            while !(*prev).is_null() {
                let node = *prev;
                if (((*node).rec as usize) ^ (page as usize)) < PAGE_SIZE {
                    *prev = (*node).next;
                    (*node).next = std::ptr::null_mut();
                    removed += 1;
                    if let Some(freed) = self.cleanup_after_erase(table, node) {
                        pool.free_block(&*freed);
                    }
                    continue 'rewind;
                }
                prev = &mut (*node).next;
            }
            break;
        }

        #[cfg(debug_assertions)]
        {
            let mut node = table.cells[cell];
            while !node.is_null() {
                debug_assert_ne!(
                    crate::storage::page::page_align((*node).rec),
                    page,
                    "node to the page survived removal"
                );
                node = (*node).next;
            }
        }

        removed
    }

    /// Drop every node and return all slab memory (spare included) to the
    /// pool. Used by disable and teardown.
    ///
    /// The caller holds this partition's latch exclusively.
    pub(crate) fn clear(&self, table: &mut Table, pool: &BufferPool) {
        let mut slab = self.blocks_mutex.lock();

        if !slab.spare.is_null() {
            // SAFETY: slab blocks are live pool blocks owned by this slab.
            pool.free_block(unsafe { &*slab.spare });
            slab.spare = std::ptr::null();
        }

        for page in slab.pages.drain(..) {
            // SAFETY: as above.
            let page = unsafe { &*page };
            page.free_offset.store(0, Ordering::Relaxed);
            pool.free_block(page);
        }

        table.cells = Vec::new();
    }

    /// Number of slab pages currently in use (spare excluded).
    pub(crate) fn slab_pages(&self) -> usize {
        self.blocks_mutex.lock().pages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use crate::storage::BufferPool;
    use std::sync::atomic::AtomicBool;

    struct Fixture {
        pool: std::sync::Arc<BufferPool>,
        part: Partition,
        enabled: AtomicBool,
        data: std::sync::Arc<BufferPool>,
    }

    fn fixture() -> Fixture {
        let pool = BufferPool::new(8).unwrap();
        // A second pool provides stable record addresses to point nodes at.
        let data = BufferPool::new(2).unwrap();
        let part = Partition::new();
        part.latch.write().alloc(97);
        Fixture {
            pool,
            part,
            enabled: AtomicBool::new(true),
            data,
        }
    }

    /// A fake record address inside the data block's frame.
    fn rec_at(block: &Block, offset: usize) -> *const u8 {
        unsafe { block.frame().add(offset) as *const u8 }
    }

    #[test]
    fn test_insert_lookup_replace() {
        let fx = fixture();
        let block = fx.data.alloc_block().unwrap();
        fx.part.prepare_insert(&fx.pool, &fx.enabled);

        let mut table = fx.part.latch.write();
        let r1 = rec_at(block, 100);
        let r2 = rec_at(block, 200);

        unsafe {
            assert!(fx.part.insert(&mut table, 42, r1, block));
            assert_eq!(table.node_count(), 1);

            // Same fold replaces the record: one representative per fold.
            assert!(fx.part.insert(&mut table, 42, r2, block));
            assert_eq!(table.node_count(), 1);
            assert_eq!((*table.cell_head(42)).rec, r2);
        }
    }

    #[test]
    fn test_insert_without_spare_is_dropped() {
        let fx = fixture();
        let block = fx.data.alloc_block().unwrap();
        // No prepare_insert: no spare, no slab page.
        let mut table = fx.part.latch.write();
        let r = rec_at(block, 100);
        assert!(!unsafe { fx.part.insert(&mut table, 7, r, block) });
        assert_eq!(table.node_count(), 0);
    }

    #[test]
    fn test_erase_swaps_top_and_keeps_contiguity() {
        let fx = fixture();
        let block = fx.data.alloc_block().unwrap();
        fx.part.prepare_insert(&fx.pool, &fx.enabled);

        let mut table = fx.part.latch.write();
        unsafe {
            for i in 0..10u32 {
                assert!(fx
                    .part
                    .insert(&mut table, i, rec_at(block, 64 * i as usize), block));
            }

            // Erase from the middle: the slab top node fills the hole.
            let (found, freed) = fx.part.erase(&mut table, 3, rec_at(block, 64 * 3));
            assert!(found);
            assert!(freed.is_none());
            assert_eq!(table.node_count(), 9);

            // Every survivor is still reachable under its own fold.
            for i in (0..10u32).filter(|&i| i != 3) {
                let mut node = table.cell_head(i);
                let mut hit = false;
                while !node.is_null() {
                    if (*node).fold == i {
                        hit = true;
                        break;
                    }
                    node = (*node).next;
                }
                assert!(hit, "fold {i} lost after compaction");
            }

            // Live nodes stay contiguous in the tail page.
            let slab_used = {
                let slab = fx.part.blocks_mutex.lock();
                let last = &**slab.pages.last().unwrap();
                last.free_offset.load(Ordering::Relaxed) as usize
            };
            assert_eq!(slab_used, 9 * NODE_SIZE);
        }
    }

    #[test]
    fn test_emptied_page_becomes_spare_then_returns_to_pool() {
        let fx = fixture();
        let block = fx.data.alloc_block().unwrap();
        let free_before = fx.pool.free_pages();
        fx.part.prepare_insert(&fx.pool, &fx.enabled);
        assert_eq!(fx.pool.free_pages(), free_before - 1);

        let mut table = fx.part.latch.write();
        unsafe {
            let r = rec_at(block, 128);
            assert!(fx.part.insert(&mut table, 1, r, block));
            assert_eq!(fx.part.slab_pages(), 1);

            // Last node erased: page drains and is kept as the spare.
            let (found, freed) = fx.part.erase(&mut table, 1, r);
            assert!(found);
            assert!(freed.is_none());
            assert_eq!(fx.part.slab_pages(), 0);

            // With a spare already cached, a second drained page is handed
            // back for the pool.
            assert!(fx.part.insert(&mut table, 2, r, block));
            fx.part.prepare_insert(&fx.pool, &fx.enabled);
            let (found, freed) = fx.part.erase(&mut table, 2, r);
            assert!(found);
            let freed = freed.expect("drained page should be surplus");
            fx.pool.free_block(&*freed);
        }
    }

    #[test]
    fn test_remove_all_to_page() {
        let fx = fixture();
        let block_a = fx.data.alloc_block().unwrap();
        let block_b = fx.data.alloc_block().unwrap();
        fx.part.prepare_insert(&fx.pool, &fx.enabled);

        let mut table = fx.part.latch.write();
        unsafe {
            // Two entries of the same fold cannot coexist, so spread folds
            // but keep them in one cell-sized stride apart where possible.
            fx.part
                .insert(&mut table, 5, rec_at(block_a, 100), block_a);
            fx.part
                .insert(&mut table, 5 + 97, rec_at(block_a, 200), block_a);
            fx.part
                .insert(&mut table, 5 + 2 * 97, rec_at(block_b, 100), block_b);

            // Folds 5 and 5+97 share a cell: one sweep of that cell takes
            // every node pointing into the page.
            let removed =
                fx.part
                    .remove_all_to_page(&mut table, &fx.pool, 5, block_a.frame());
            assert_eq!(removed, 2);
            let removed =
                fx.part
                    .remove_all_to_page(&mut table, &fx.pool, 5 + 97, block_a.frame());
            assert_eq!(removed, 0);

            // The other page's entry survives.
            assert_eq!(table.node_count(), 1);
        }
    }

    #[test]
    fn test_slab_grows_across_pages() {
        let fx = fixture();
        let block = fx.data.alloc_block().unwrap();
        let per_page = PAGE_SIZE / NODE_SIZE;

        let mut table = fx.part.latch.write();
        unsafe {
            for i in 0..(per_page + 5) as u32 {
                fx.part.prepare_insert(&fx.pool, &fx.enabled);
                assert!(fx.part.insert(
                    &mut table,
                    i,
                    rec_at(block, (i as usize * 16) % PAGE_SIZE),
                    block
                ));
            }
        }
        assert_eq!(fx.part.slab_pages(), 2);
        assert_eq!(table.node_count(), per_page + 5);
    }

    #[test]
    fn test_clear_returns_everything() {
        let fx = fixture();
        let block = fx.data.alloc_block().unwrap();
        let free_at_start = fx.pool.free_pages();

        let mut table = fx.part.latch.write();
        unsafe {
            fx.part.prepare_insert(&fx.pool, &fx.enabled);
            fx.part
                .insert(&mut table, 1, rec_at(block, 100), block);
        }
        fx.part.clear(&mut table, &fx.pool);

        assert_eq!(fx.pool.free_pages(), free_at_start);
        assert!(!table.is_allocated());
        assert_eq!(fx.part.slab_pages(), 0);
    }
}
