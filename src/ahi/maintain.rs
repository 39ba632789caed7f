//! Record-granular hash maintenance around inserts and deletes.
//!
//! When a record enters or leaves a hashed page, the single representative
//! per equal-fold run has to be preserved. The insert side decides which of
//! predecessor / new record / successor represents each affected run under
//! the page's side bit; the delete side simply erases the record's entry
//! before the record goes away. A search that failed on the hash
//! (`HashFail`) repairs the misleading entry lazily once the descent has
//! found the true position.

use std::sync::atomic::Ordering;

use smallvec::SmallVec;

use crate::cursor::{Cursor, SearchFlag};
use crate::index::IndexDef;
use crate::records::{rec_is_infimum, rec_is_metadata, rec_is_supremum};
use crate::storage::page::page_rec_next;

use super::fold::{rec_fold, LEFT_SIDE};
use super::monitor::Monitor;
use super::Ahi;

impl Ahi {
    /// Update the page hash after a record was inserted right after the
    /// cursor position. `reorg` suppresses the node-update fast path during
    /// a page reorganization, where the old record addresses are dead.
    pub fn update_hash_on_insert(&self, cursor: &Cursor, reorg: bool) {
        if !self.enabled() {
            return;
        }

        let block = cursor.block();
        debug_assert!(block.latch.is_locked_exclusive());

        let index_ptr = block.index.load(Ordering::Relaxed);
        if index_ptr.is_null() {
            return;
        }
        if !std::ptr::eq(index_ptr, &*cursor.index) {
            // SAFETY: non-null block index pointers are dictionary-kept.
            debug_assert_eq!(unsafe { (*index_ptr).id }, cursor.index.id);
            self.drop_page_hash_index(block, false);
            return;
        }
        let index: &IndexDef = &cursor.index;

        let part = self.get_part(index.id);
        let left_bytes_fields = block.curr_left_bytes_fields.load(Ordering::Relaxed);
        let page = block.frame() as *const u8;
        let rec = cursor.rec();

        // A hash-positioned insert under current parameters: the inserted
        // record replaces the cursor record as its run's representative.
        if !reorg
            && cursor.flag == SearchFlag::HashHit
            && left_bytes_fields == cursor.n_bytes_fields
        {
            let mut table = part.latch.write();
            if !self.enabled() || block.index.load(Ordering::Relaxed).is_null() {
                return;
            }
            // SAFETY: x-latched page; write latch held for the chain.
            let updated = unsafe {
                match page_rec_next(page, rec) {
                    Some(ins_rec) => {
                        table.search_and_update(cursor.fold, rec, ins_rec, block)
                    }
                    None => false,
                }
            };
            if updated {
                Monitor::inc(&self.monitor.rows_updated);
            } else {
                debug_assert!(false, "hash-positioned record lost its entry");
            }
            return;
        }

        let n_bytes_fields = left_bytes_fields & !LEFT_SIDE;
        let left_side = left_bytes_fields & LEFT_SIDE != 0;

        // SAFETY: the caller's exclusive page latch keeps the record list
        // and record bytes stable throughout.
        let inserts: SmallVec<[(u32, *const u8); 2]> = unsafe {
            let Some(ins_rec) = page_rec_next(page, rec) else {
                self.drop_page_hash_index(block, false);
                return;
            };
            let Some(next_rec) = page_rec_next(page, ins_rec) else {
                self.drop_page_hash_index(block, false);
                return;
            };

            let ins_fold = rec_fold(ins_rec, index, n_bytes_fields);
            let next_is_supremum = rec_is_supremum(next_rec);
            let next_fold = if next_is_supremum {
                None
            } else {
                Some(rec_fold(next_rec, index, n_bytes_fields))
            };
            let rec_valid = !rec_is_infimum(rec) && !rec_is_metadata(rec);

            let mut inserts = SmallVec::new();

            if !rec_valid {
                // The new record opens the page; it represents its run only
                // on the left side.
                if left_side {
                    inserts.push((ins_fold, ins_rec));
                }
            } else {
                let fold = rec_fold(rec, index, n_bytes_fields);
                if fold != ins_fold {
                    // A run boundary between predecessor and new record.
                    if left_side {
                        inserts.push((ins_fold, ins_rec));
                    } else {
                        inserts.push((fold, rec));
                    }
                }
            }

            if next_is_supremum {
                // The new record closes the page; it represents its run
                // only on the right side.
                if !left_side {
                    inserts.push((ins_fold, ins_rec));
                }
            } else if Some(ins_fold) != next_fold {
                // A run boundary between new record and successor.
                if !left_side {
                    inserts.push((ins_fold, ins_rec));
                } else {
                    inserts.push((next_fold.unwrap(), next_rec));
                }
            }

            inserts
        };

        if inserts.is_empty() {
            return;
        }

        self.prepare_insert(part);
        let mut table = part.latch.write();
        if !self.enabled() || block.index.load(Ordering::Relaxed).is_null() {
            return;
        }
        debug_assert!(std::ptr::eq(block.index.load(Ordering::Relaxed), index));

        for (fold, rec) in inserts {
            // SAFETY: write latch held; rec lies in block's frame.
            if unsafe { part.insert(&mut table, fold, rec, block) } {
                Monitor::inc(&self.monitor.rows_added);
            } else {
                Monitor::inc(&self.monitor.rows_skipped_no_slab);
            }
        }
    }

    /// Remove the hash entry of the record the cursor stands on, before
    /// that record is deleted from its page. Missing entries are tolerated
    /// and only counted.
    pub fn update_hash_on_delete(&self, cursor: &Cursor) {
        if !self.enabled() {
            return;
        }

        let block = cursor.block();
        debug_assert!(block.latch.is_locked_exclusive());

        let index_ptr = block.index.load(Ordering::Relaxed);
        if index_ptr.is_null() {
            return;
        }
        if !std::ptr::eq(index_ptr, &*cursor.index) {
            self.drop_page_hash_index(block, false);
            return;
        }
        let index: &IndexDef = &cursor.index;

        let n_bytes_fields = block.curr_left_bytes_fields.load(Ordering::Relaxed) & !LEFT_SIDE;
        debug_assert_ne!(n_bytes_fields, 0);

        let rec = cursor.rec();
        // SAFETY: x-latched page keeps the record stable.
        let fold = unsafe { rec_fold(rec, index, n_bytes_fields) };

        let part = self.get_part(index.id);
        let (found, freed) = {
            let mut table = part.latch.write();
            if block.index.load(Ordering::Relaxed).is_null() || !self.enabled() {
                return;
            }
            debug_assert!(std::ptr::eq(block.index.load(Ordering::Relaxed), index));
            // SAFETY: write latch held.
            unsafe { part.erase(&mut table, fold, rec) }
        };

        if let Some(page) = freed {
            // SAFETY: an emptied slab page handed back by the partition is
            // a live pool block owned by nobody else now.
            self.pool.free_block(unsafe { &*page });
        }

        if found {
            Monitor::inc(&self.monitor.rows_removed);
        } else {
            Monitor::inc(&self.monitor.rows_remove_not_found);
        }
    }

    /// Lazily repair a misleading hash entry after a failed guess: the
    /// descent has positioned the cursor on the true record, so insert its
    /// fold under the page's current parameters. Misleads appear at page
    /// boundaries (builds do not look across pages) and on fold collisions.
    pub(crate) fn update_hash_ref(&self, cursor: &Cursor) {
        debug_assert_eq!(cursor.flag, SearchFlag::HashFail);

        let block = cursor.block();
        debug_assert!(block.latch.is_locked());

        let index_ptr = block.index.load(Ordering::Relaxed);
        if index_ptr.is_null() {
            return;
        }
        // SAFETY: non-null block index pointers are dictionary-kept.
        if unsafe { (*index_ptr).search_info.n_hash_potential.load(Ordering::Relaxed) } == 0 {
            return;
        }
        if !std::ptr::eq(index_ptr, &*cursor.index) {
            debug_assert_eq!(unsafe { (*index_ptr).id }, cursor.index.id);
            self.drop_page_hash_index(block, false);
            return;
        }
        let index: &IndexDef = &cursor.index;

        let part = self.get_part(index.id);
        self.prepare_insert(part);

        let mut table = part.latch.write();
        let left_bytes_fields = block.curr_left_bytes_fields.load(Ordering::Relaxed);

        if block.index.load(Ordering::Relaxed).is_null()
            || left_bytes_fields != index.search_info.left_bytes_fields.load(Ordering::Relaxed)
            || !self.enabled()
        {
            return;
        }

        let rec = cursor.rec();
        // SAFETY: the cursor's page latch keeps the record stable.
        unsafe {
            if rec_is_infimum(rec) || rec_is_supremum(rec) || rec_is_metadata(rec) {
                return;
            }
            let fold = rec_fold(rec, index, left_bytes_fields & !LEFT_SIDE);
            if part.insert(&mut table, fold, rec, block) {
                Monitor::inc(&self.monitor.rows_added);
            } else {
                Monitor::inc(&self.monitor.rows_skipped_no_slab);
            }
        }
    }
}
