//! The guess path: the reason the hash system exists.
//!
//! On success the cursor sits on a real record inside a buffer-fixed block
//! latched in the requested mode; on failure no latch is held, no pin is
//! taken, and the caller falls back to the ordinary descent. Every hazard,
//! chain miss, losing the block try-lock, a page mid-eviction, a freed twin
//! index, an in-page mismatch, resolves to that same silent failure.

use std::sync::atomic::Ordering;

use tracing::debug;

use crate::cursor::{Cursor, SearchFlag};
use crate::index::IndexDef;
use crate::records::{rec_is_metadata, rec_is_user, Tuple};
use crate::storage::block::{LatchMode, BLOCK_REMOVE_HASH};
use crate::storage::page::{page_index_id, page_is_comp, page_is_leaf};

use super::fold::{params_n_fields, tuple_fold, LEFT_SIDE};
use super::monitor::Monitor;
use super::Ahi;

impl Ahi {
    /// Try to position `cursor` straight onto the record a previous search
    /// of this prefix found, skipping the tree descent.
    ///
    /// `ge` selects the comparison side the caller will verify: `true` for
    /// a greater-or-equal search, `false` for less-or-equal (inserts). On
    /// `true`, the cursor holds the leaf latched in `latch_mode` and
    /// buffer-fixed; `cursor.release()` undoes both.
    pub fn guess_on_hash(
        &self,
        index: &IndexDef,
        tuple: &Tuple,
        ge: bool,
        latch_mode: LatchMode,
        cursor: &mut Cursor,
    ) -> bool {
        let info = &index.search_info;

        // Unlatched rejection tests; the search info may be torn, which at
        // worst wastes or skips one probe.
        if !info.last_hash_succ.load(Ordering::Relaxed)
            || info.n_hash_potential.load(Ordering::Relaxed) == 0
            || tuple.is_min_rec()
        {
            return false;
        }

        let n_bytes_fields = info.left_bytes_fields.load(Ordering::Relaxed) & !LEFT_SIDE;
        cursor.n_bytes_fields = n_bytes_fields;
        if tuple.n_fields() < params_n_fields(n_bytes_fields) {
            return false;
        }

        let index_id = index.id;
        let fold = tuple_fold(tuple, index, n_bytes_fields);
        cursor.fold = fold;
        cursor.flag = SearchFlag::HashHit;

        let part = self.get_part(index_id);
        let (block, rec) = {
            let table = part.latch.read();

            if !self.enabled() {
                drop(table);
                return self.guess_fail(index, cursor);
            }

            let mut node = table.cell_head(fold);
            let rec = loop {
                if node.is_null() {
                    break None;
                }
                // SAFETY: chain links are valid under the shared latch.
                let n = unsafe { &*node };
                if n.fold == fold {
                    break Some((node, n.rec));
                }
                node = n.next;
            };
            let Some((_node, rec)) = rec else {
                drop(table);
                return self.guess_fail(index, cursor);
            };

            let block = self.pool.block_from_ptr(rec);
            #[cfg(debug_assertions)]
            // SAFETY: `_node` stays valid under the shared latch.
            debug_assert!(std::ptr::eq(unsafe { (*_node).block }, block));

            // The page-hash cell latch keeps eviction from re-checking
            // relocatability between our try-lock and the state test.
            let got_latch = {
                let _cell = self.pool.cell_latch(block.page_id()).lock();
                block.latch.try_lock(latch_mode)
            };
            if !got_latch {
                drop(table);
                return self.guess_fail(index, cursor);
            }

            if block.state() == BLOCK_REMOVE_HASH {
                // The page is being torn out of the pool.
                block.latch.unlock(latch_mode);
                drop(table);
                return self.guess_fail(index, cursor);
            }

            let block_index = block.index.load(Ordering::Relaxed);
            // SAFETY: non-null block index pointers are dictionary-kept
            // while any page references them.
            if block_index.is_null()
                || (!std::ptr::eq(block_index, index)
                    && unsafe { (*block_index).id } == index_id)
            {
                // Same identity, different definition: the index was freed
                // and re-created; those entries are garbage-in-waiting.
                block.latch.unlock(latch_mode);
                drop(table);
                return self.guess_fail(index, cursor);
            }

            block.fix();
            self.pool.make_young_if_needed(block);
            (block, rec)
            // Partition latch released here, after the pin.
        };

        self.pool.n_page_gets.fetch_add(1, Ordering::Relaxed);
        cursor.position(block, rec, latch_mode);

        // Validate the guess inside the page.
        let page = block.frame() as *const u8;
        // SAFETY: the block latch acquired above keeps the frame stable.
        let valid = unsafe {
            let comp = page_is_comp(page);
            rec_is_user(rec)
                && !rec_is_metadata(rec)
                && page_is_leaf(page)
                && page_index_id(page) == index_id
                && !cursor.check_mismatch(tuple, ge, comp)
        };

        if !valid {
            // A stale or colliding entry; it stays in the table until
            // ordinary maintenance removes it.
            debug!(index_id, fold, "hash guess failed in-page validation");
            Monitor::inc(&self.monitor.guess_corrupt);
            cursor.release();
            return self.guess_fail(index, cursor);
        }

        info.increment_potential();
        info.last_hash_succ.store(true, Ordering::Relaxed);
        Monitor::inc(&self.monitor.guess_success);
        true
    }

    fn guess_fail(&self, index: &IndexDef, cursor: &mut Cursor) -> bool {
        cursor.flag = SearchFlag::HashFail;
        index
            .search_info
            .last_hash_succ
            .store(false, Ordering::Relaxed);
        Monitor::inc(&self.monitor.guess_fail);
        false
    }
}
