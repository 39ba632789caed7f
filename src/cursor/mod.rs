//! # Positioned Leaf Cursor
//!
//! A cursor is the contract between the B-tree search and the hash system:
//! after any positioned search it carries how far the search key matched
//! the records on either side of the final position (`low_match/low_bytes`
//! and `up_match/up_bytes`), which is exactly what the self-tuning
//! heuristics consume.
//!
//! The descent itself is the tree's business; this module positions within
//! a leaf. [`Cursor::search_leaf`] first offers the lookup to the hash
//! (`guess_on_hash`) and falls back to an ordered scan of the leaf,
//! finishing with [`Cursor::search_info_update`] so every search feeds the
//! heuristics.
//!
//! ## Positioning Convention
//!
//! A greater-or-equal search positions on the first record `>=` the tuple
//! (the supremum when none is); a less-or-equal search positions on the
//! last record `<=` the tuple (the infimum when none is). Inserts use the
//! latter, which is why a successful guess must leave both match counts
//! sensible.
//!
//! ## Latch Discipline
//!
//! A positioned cursor owns one buffer fix and one page latch in the mode
//! it searched with; [`Cursor::release`] returns both. Failed searches own
//! nothing.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::ahi::{heuristic, Ahi};
use crate::index::IndexDef;
use crate::records::{
    cmp_tuple_rec_with_match, rec_is_infimum, rec_is_metadata, rec_is_supremum, rec_is_user,
    Tuple,
};
use crate::storage::block::{Block, LatchMode};
use crate::storage::page::{
    page_align, page_first_rec, page_has_next, page_has_prev, page_infimum, page_rec_next,
    page_rec_prev, page_supremum,
};

/// How the cursor got where it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchFlag {
    /// Not positioned yet.
    Unset,
    /// Positioned by a successful hash guess.
    HashHit,
    /// A hash guess was attempted and failed; positioned by the scan.
    HashFail,
    /// Positioned by the ordinary scan, no guess attempted.
    Binary,
}

/// A leaf cursor over one index.
pub struct Cursor {
    pub index: Arc<IndexDef>,
    block: *const Block,
    rec: *const u8,
    latch_mode: LatchMode,
    positioned: bool,
    pub flag: SearchFlag,
    /// Matched complete fields / extra bytes against the record at or
    /// before the position.
    pub low_match: u16,
    pub low_bytes: u16,
    /// Matched complete fields / extra bytes against the record at or
    /// after the position.
    pub up_match: u16,
    pub up_bytes: u16,
    /// Prefix parameters (side bit stripped) the last guess folded with.
    pub n_bytes_fields: u32,
    /// Fold of the last guessed tuple.
    pub fold: u32,
}

// SAFETY: the raw block/record pointers target pool frames that outlive the
// cursor; a positioned cursor additionally holds the page latch and a pin.
unsafe impl Send for Cursor {}

impl Cursor {
    pub fn new(index: Arc<IndexDef>) -> Self {
        Self {
            index,
            block: std::ptr::null(),
            rec: std::ptr::null(),
            latch_mode: LatchMode::Shared,
            positioned: false,
            flag: SearchFlag::Unset,
            low_match: 0,
            low_bytes: 0,
            up_match: 0,
            up_bytes: 0,
            n_bytes_fields: 0,
            fold: 0,
        }
    }

    /// The block a positioned cursor stands on.
    pub fn block(&self) -> &Block {
        debug_assert!(self.positioned);
        // SAFETY: positioned cursors hold a pin; the descriptor outlives us.
        unsafe { &*self.block }
    }

    pub fn rec(&self) -> *const u8 {
        debug_assert!(self.positioned);
        self.rec
    }

    pub fn is_positioned(&self) -> bool {
        self.positioned
    }

    pub(crate) fn position(&mut self, block: &Block, rec: *const u8, latch_mode: LatchMode) {
        debug_assert!(!self.positioned, "repositioning a cursor that owns a latch");
        self.block = block;
        self.rec = rec;
        self.latch_mode = latch_mode;
        self.positioned = true;
    }

    /// Release the page latch and buffer fix of a positioned cursor.
    pub fn release(&mut self) {
        if !self.positioned {
            return;
        }
        let block = self.block();
        block.latch.unlock(self.latch_mode);
        block.unfix();
        self.positioned = false;
        self.block = std::ptr::null();
        self.rec = std::ptr::null();
    }

    /// Position on `leaf` for `tuple`. Offers the search to the hash first;
    /// on a miss, latches the leaf and scans. Returns whether every tuple
    /// field matched the record the cursor stands on.
    pub fn search_leaf(
        &mut self,
        ahi: &Ahi,
        leaf: &Block,
        tuple: &Tuple,
        ge: bool,
        latch_mode: LatchMode,
    ) -> bool {
        debug_assert!(!self.positioned);
        self.flag = SearchFlag::Binary;

        let index = Arc::clone(&self.index);
        if ahi.guess_on_hash(&index, tuple, ge, latch_mode, self) {
            return self.exact_match(tuple, ge);
        }

        leaf.latch.lock(latch_mode);
        leaf.fix();
        ahi.pool.n_page_gets.fetch_add(1, Ordering::Relaxed);

        let rec = self.position_within(leaf, tuple, ge);
        self.position(leaf, rec, latch_mode);
        self.search_info_update(ahi);

        self.exact_match(tuple, ge)
    }

    fn exact_match(&self, tuple: &Tuple, ge: bool) -> bool {
        let matched = if ge { self.up_match } else { self.low_match };
        matched as usize == tuple.n_fields()
    }

    /// Ordered scan of the leaf, maintaining the four match values exactly
    /// as a tree descent would.
    fn position_within(&mut self, leaf: &Block, tuple: &Tuple, ge: bool) -> *const u8 {
        let page = leaf.frame() as *const u8;
        let index = Arc::clone(&self.index);

        // SAFETY: the caller latched the leaf; the record list is stable.
        unsafe {
            let mut low_rec = page_infimum(page);
            let mut up_rec = page_supremum(page);
            self.low_match = 0;
            self.low_bytes = 0;
            self.up_match = 0;
            self.up_bytes = 0;

            let mut rec = page_first_rec(page);
            while !rec_is_supremum(rec) {
                if rec_is_metadata(rec) {
                    rec = page_rec_next(page, rec).expect("metadata record unlinked");
                    continue;
                }

                let (mut mf, mut mb) = (0u16, 0u16);
                let ord = cmp_tuple_rec_with_match(tuple, rec, &index, &mut mf, &mut mb);

                let tuple_after = match ord {
                    CmpOrdering::Greater => true,
                    // On equality a less-or-equal search keeps walking to
                    // the last equal record.
                    CmpOrdering::Equal => !ge,
                    CmpOrdering::Less => false,
                };

                if tuple_after {
                    low_rec = rec;
                    self.low_match = mf;
                    self.low_bytes = mb;
                } else {
                    up_rec = rec;
                    self.up_match = mf;
                    self.up_bytes = mb;
                    break;
                }

                rec = page_rec_next(page, rec).expect("user record unlinked");
            }

            if ge {
                up_rec
            } else {
                low_rec
            }
        }
    }

    /// In-page validation of a hash guess: the positioned record and its
    /// neighbor must bracket the tuple on the expected sides. Returns true
    /// on mismatch. On success the match values are left sensible for
    /// insert callers.
    ///
    /// # Safety
    /// The cursor must be positioned with its page latched.
    pub(crate) unsafe fn check_mismatch(&mut self, tuple: &Tuple, ge: bool, comp: bool) -> bool {
        debug_assert!(self.positioned);
        debug_assert_eq!(comp, self.index.not_redundant());

        let rec = self.rec;
        let page = page_align(rec);
        let index = Arc::clone(&self.index);

        if !rec_is_user(rec) || rec_is_metadata(rec) {
            return true;
        }

        let (mut mf, mut mb) = (0u16, 0u16);
        let ord = cmp_tuple_rec_with_match(tuple, rec, &index, &mut mf, &mut mb);

        if ge {
            // Expected: rec >= tuple, predecessor < tuple.
            if ord == CmpOrdering::Greater {
                return true;
            }
            self.up_match = mf;
            self.up_bytes = mb;

            let prev = page_rec_prev(page, rec);
            if rec_is_infimum(prev) || rec_is_metadata(prev) {
                if page_has_prev(page) {
                    return true;
                }
                self.low_match = 0;
                self.low_bytes = 0;
            } else {
                let (mut pf, mut pb) = (0u16, 0u16);
                if cmp_tuple_rec_with_match(tuple, prev, &index, &mut pf, &mut pb)
                    != CmpOrdering::Greater
                {
                    return true;
                }
                self.low_match = pf;
                self.low_bytes = pb;
            }
        } else {
            // Expected: rec <= tuple, successor > tuple.
            if ord == CmpOrdering::Less {
                return true;
            }
            self.low_match = mf;
            self.low_bytes = mb;

            let Some(next) = page_rec_next(page, rec) else {
                return true;
            };
            if rec_is_supremum(next) {
                if page_has_next(page) {
                    return true;
                }
                self.up_match = 0;
                self.up_bytes = 0;
            } else {
                let (mut nf, mut nb) = (0u16, 0u16);
                if cmp_tuple_rec_with_match(tuple, next, &index, &mut nf, &mut nb)
                    != CmpOrdering::Less
                {
                    return true;
                }
                self.up_match = nf;
                self.up_bytes = nb;
            }
        }

        false
    }

    /// Feed the heuristics from a just-positioned search: update the
    /// index's recommendation, the block's helpfulness, repair a failed
    /// guess, and build the page hash when the counters say so. Call while
    /// the cursor still holds its page latch.
    pub fn search_info_update(&self, ahi: &Ahi) {
        if !ahi.enabled() {
            return;
        }
        let info = &self.index.search_info;
        if !info.hash_analysis_useful() {
            return;
        }
        debug_assert_ne!(self.flag, SearchFlag::HashHit);

        heuristic::info_update_hash(self);

        let block = self.block();
        let build = heuristic::update_block_hash_info(info, block);

        if self.flag == SearchFlag::HashFail {
            ahi.update_hash_ref(self);
        }

        if build {
            ahi.build_page_hash_index(
                &self.index,
                block,
                block.next_left_bytes_fields.load(Ordering::Relaxed),
            );
        }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        debug_assert!(!self.positioned, "cursor dropped while holding a page latch");
    }
}
