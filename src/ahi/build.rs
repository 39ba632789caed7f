//! Page-granular construction and teardown of hash coverage.
//!
//! Building and dropping both follow the same shape: fold the page's
//! records into a bounded batch with no partition latch held, then commit
//! the batch under the write latch after re-validating that the world did
//! not move (hash still enabled, block still hashed under the expected
//! index and parameters). Folding is the expensive part and must never
//! extend the latch hold.

use std::sync::atomic::Ordering;

use crate::config::{BUILD_BATCH, DROP_BATCH};
use crate::index::IndexDef;
use crate::records::{rec_is_metadata, rec_is_supremum};
use crate::storage::block::{Block, BLOCK_UNFIXED};
use crate::storage::page::{page_first_rec, page_index_id, page_rec_next};

use super::fold::{params_n_fields, rec_fold, LEFT_SIDE};
use super::monitor::Monitor;
use super::Ahi;

/// First record to hash on a page: skips the metadata record, `None` when
/// only the bounds remain.
///
/// # Safety
/// `page` must be a live leaf frame readable by the caller.
pub(super) unsafe fn first_user_rec(page: *const u8) -> Option<*const u8> {
    let mut rec = page_first_rec(page);
    if rec_is_metadata(rec) {
        rec = page_rec_next(page, rec)?;
    }
    (!rec_is_supremum(rec)).then_some(rec)
}

impl Ahi {
    /// Build a hash over one leaf page under `left_bytes_fields`. If the
    /// page is already hashed under different parameters or a different
    /// index, that coverage is dropped first. The caller holds the page
    /// latch in either mode; no partition latch may be held.
    pub fn build_page_hash_index(
        &self,
        index: &IndexDef,
        block: &Block,
        left_bytes_fields: u32,
    ) {
        if !self.enabled() {
            return;
        }
        debug_assert!(block.latch.is_locked());

        let part = self.get_part(index.id);

        let rebuild = {
            let _table = part.latch.read();
            if !self.enabled() {
                return;
            }
            let block_index = block.index.load(Ordering::Relaxed);
            !block_index.is_null()
                && (block_index != index as *const IndexDef as *mut IndexDef
                    || block.curr_left_bytes_fields.load(Ordering::Relaxed) != left_bytes_fields)
        };

        if rebuild {
            self.drop_page_hash_index(block, false);
        }

        let n_bytes_fields = left_bytes_fields & !LEFT_SIDE;
        if n_bytes_fields == 0 {
            return;
        }
        if (index.n_unique_in_tree() as usize) < params_n_fields(n_bytes_fields) {
            return;
        }

        let page = block.frame() as *const u8;
        let left_side = left_bytes_fields & LEFT_SIDE != 0;
        let mut batch: Vec<(u32, *const u8)> = Vec::with_capacity(BUILD_BATCH);
        // SAFETY: the caller's page latch keeps the frame stable.
        let mut rec_opt = unsafe { first_user_rec(page) };
        let mut rows_added = 0u64;

        loop {
            // Fold one batch of run representatives, no latch held.
            while let Some(rec) = rec_opt {
                // SAFETY: `rec` walks the latched page's record list.
                let fold = unsafe { rec_fold(rec, index, n_bytes_fields) };
                match batch.last_mut() {
                    Some(last) if last.0 == fold => {
                        if !left_side {
                            last.1 = rec;
                        }
                    }
                    _ => batch.push((fold, rec)),
                }
                // SAFETY: as above.
                rec_opt = unsafe { page_rec_next(page, rec) }
                    .filter(|&r| unsafe { !rec_is_supremum(r) });
                if batch.len() == BUILD_BATCH {
                    break;
                }
            }

            // Commit under the write latch, re-validating everything that
            // may have moved while we folded.
            self.prepare_insert(part);
            {
                let mut table = part.latch.write();
                if !self.enabled() {
                    return;
                }

                let block_index = block.index.load(Ordering::Relaxed);
                if block_index.is_null() {
                    #[cfg(debug_assertions)]
                    debug_assert_eq!(block.n_pointers.load(Ordering::Relaxed), 0);
                    index.search_info.ref_count.fetch_add(1, Ordering::Relaxed);
                } else if block.curr_left_bytes_fields.load(Ordering::Relaxed)
                    != left_bytes_fields
                {
                    // Someone built the page under other parameters while
                    // the latch was down.
                    return;
                }

                block.n_hash_helps.store(0, Ordering::Relaxed);
                block.index.store(
                    index as *const IndexDef as *mut IndexDef,
                    Ordering::Relaxed,
                );
                block
                    .curr_left_bytes_fields
                    .store(left_bytes_fields, Ordering::Relaxed);

                for (fold, rec) in batch.drain(..) {
                    // SAFETY: write latch held; rec lies in block's frame.
                    if unsafe { part.insert(&mut table, fold, rec, block) } {
                        rows_added += 1;
                    } else {
                        Monitor::inc(&self.monitor.rows_skipped_no_slab);
                    }
                }
            }

            if rec_opt.is_none() {
                break;
            }
        }

        Monitor::add(&self.monitor.rows_added, rows_added);
        Monitor::inc(&self.monitor.pages_added);
    }

    /// Drop any hash entries pointing into one page. With
    /// `garbage_collect`, drop only when the owning index has been freed.
    /// Caller holds the page latch, or owns the block exclusively through
    /// the eviction protocol.
    pub fn drop_page_hash_index(&self, block: &Block, garbage_collect: bool) {
        'retry: loop {
            if block.index.load(Ordering::Relaxed).is_null() {
                return;
            }

            let page = block.frame() as *const u8;
            // SAFETY: a hashed block's frame stays readable for the whole
            // drop: eviction routes through this very function before the
            // frame is reused.
            let index_id = unsafe { page_index_id(page) };
            let part = self.get_part(index_id);

            let index_ptr;
            let is_freed;
            let left_bytes_fields;
            let mut write_guard = None;
            {
                let read_guard = part.latch.read();
                let ptr = block.index.load(Ordering::Relaxed);
                if ptr.is_null() || !self.enabled() {
                    return;
                }
                index_ptr = ptr;
                // SAFETY: a non-null block index is dictionary-kept until
                // its last page reference is dropped, which is what this
                // function does, further down.
                if unsafe { (*ptr).freed() } {
                    drop(read_guard);
                    let guard = part.latch.write();
                    if block.index.load(Ordering::Relaxed) != ptr {
                        drop(guard);
                        continue 'retry;
                    }
                    left_bytes_fields = block.curr_left_bytes_fields.load(Ordering::Relaxed);
                    is_freed = true;
                    write_guard = Some(guard);
                } else if garbage_collect {
                    return;
                } else {
                    left_bytes_fields = block.curr_left_bytes_fields.load(Ordering::Relaxed);
                    is_freed = false;
                }
                // The block's hash fields must not be read after the latch
                // goes down: the page may only be s-latched by the caller.
            }

            let n_bytes_fields = left_bytes_fields & !LEFT_SIDE;
            debug_assert_ne!(n_bytes_fields, 0);
            // SAFETY: see index_ptr above.
            let index = unsafe { &*index_ptr };

            // SAFETY: frame stays readable, as above.
            let mut rec_opt = unsafe { first_user_rec(page) };
            let mut rows_removed = 0u64;

            loop {
                // Gather one batch of folds, consecutive duplicates merged.
                let mut folds: Vec<u32> = Vec::with_capacity(DROP_BATCH);
                while let Some(rec) = rec_opt {
                    // SAFETY: as above.
                    let fold = unsafe { rec_fold(rec, index, n_bytes_fields) };
                    rec_opt = unsafe { page_rec_next(page, rec) }
                        .filter(|&r| unsafe { !rec_is_supremum(r) });
                    if folds.last() == Some(&fold) {
                        continue;
                    }
                    folds.push(fold);
                    if folds.len() == DROP_BATCH {
                        break;
                    }
                }

                let mut table = match write_guard.take() {
                    Some(guard) => guard,
                    None => {
                        let guard = part.latch.write();
                        if block.index.load(Ordering::Relaxed).is_null() {
                            // Someone else dropped the page hash meanwhile.
                            return;
                        }
                        debug_assert_eq!(block.index.load(Ordering::Relaxed), index_ptr);
                        guard
                    }
                };

                if (block.curr_left_bytes_fields.load(Ordering::Relaxed) ^ n_bytes_fields)
                    & !LEFT_SIDE
                    != 0
                {
                    // Someone rebuilt the page hash with other parameters.
                    drop(table);
                    continue 'retry;
                }

                rows_removed += folds.len() as u64;
                for fold in folds.iter().rev() {
                    // SAFETY: write latch held; page is this block's frame.
                    unsafe {
                        part.remove_all_to_page(&mut table, &self.pool, *fold, page);
                    }
                }

                if rec_opt.is_some() {
                    if is_freed {
                        write_guard = Some(table);
                    }
                    continue;
                }

                // Complete: release the page's index reference and unhash.
                let previous = index.search_info.ref_count.fetch_sub(1, Ordering::Relaxed);
                debug_assert_ne!(previous, 0);
                if previous == 1 && index.freed() {
                    self.dict.lazy_free(index_ptr);
                }
                block.index.store(std::ptr::null_mut(), Ordering::Relaxed);

                Monitor::add(&self.monitor.rows_removed, rows_removed);
                Monitor::inc(&self.monitor.pages_removed);
                return;
            }
        }
    }

    /// Drop hash entries for a page being evicted or freed in the file,
    /// addressed by page id. A page no longer resident has nothing to drop.
    pub fn drop_page_hash_when_freed(&self, page_id: u64) {
        let Some(block) = self.pool.get_page(page_id) else {
            return;
        };

        block.latch.x_lock();
        // The block may have been recycled between lookup and latch.
        if block.page_id() == page_id && block.state() == BLOCK_UNFIXED {
            block.fix();
            if !block.index.load(Ordering::Relaxed).is_null() {
                self.drop_page_hash_index(block, false);
            }
            block.unfix();
        }
        block.latch.x_unlock();
    }

    /// Keep hash coverage coherent across a page split or merge that moved
    /// records from `block` to `new_block`. Both pages are x-latched by the
    /// caller.
    pub fn move_or_delete_hash_entries(&self, new_block: &Block, block: &Block) {
        debug_assert!(block.latch.is_locked_exclusive());
        debug_assert!(new_block.latch.is_locked_exclusive());

        if !self.enabled() {
            return;
        }

        let index_ptr = block.index.load(Ordering::Relaxed);
        let new_index_ptr = new_block.index.load(Ordering::Relaxed);

        if !new_index_ptr.is_null() {
            // The destination already carries a hash; the stale source
            // coverage goes away and gets rebuilt by later searches.
            debug_assert!(index_ptr.is_null() || index_ptr == new_index_ptr);
            self.drop_page_hash_index(block, false);
            return;
        }

        if index_ptr.is_null() {
            return;
        }
        // SAFETY: non-null block index is dictionary-kept; see drop above.
        let index = unsafe { &*index_ptr };

        let part = self.get_part(index.id);
        let left_bytes_fields = {
            let _table = part.latch.read();
            if index.freed() {
                drop(_table);
                self.drop_page_hash_index(block, false);
                return;
            }
            if block.index.load(Ordering::Relaxed).is_null() {
                return;
            }
            let left_bytes_fields = block.curr_left_bytes_fields.load(Ordering::Relaxed);
            new_block
                .next_left_bytes_fields
                .store(left_bytes_fields, Ordering::Relaxed);
            left_bytes_fields
        };

        debug_assert_ne!(left_bytes_fields & !LEFT_SIDE, 0);
        self.build_page_hash_index(index, new_block, left_bytes_fields);
    }
}
