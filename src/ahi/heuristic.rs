//! # Self-Tuning Heuristics
//!
//! Two unlatched estimators decide when a page earns hash coverage:
//!
//! 1. **Per index** ([`info_update_hash`]): after every positioned B-tree
//!    search, test whether the current recommended prefix would have found
//!    the record, and either reinforce the recommendation or derive a new
//!    one from the comparison results the descent produced.
//! 2. **Per block** ([`update_block_hash_info`]): count how often searches
//!    land on this page while the recommendation is stable, and recommend a
//!    build once both the global and the per-page thresholds are crossed.
//!
//! Neither function takes any hash latch. Every field involved tolerates a
//! torn read; a wrong decision wastes a build or delays one, nothing more.
//!
//! ## Picking a New Recommendation
//!
//! The descent leaves `(low_match, low_bytes)` and `(up_match, up_bytes)`:
//! how far the search key matched its neighbors on each side. The new
//! recommendation is the shortest prefix that still separates those
//! neighbors, capped at the tree's unique-prefix width, with the run side
//! chosen by which neighbor matched further. A search that found both
//! neighbors equal (`cmp == 0`) carries no information, so the potential
//! counter restarts from zero instead of one.

use std::sync::atomic::Ordering;

use crate::config::{BUILD_LIMIT, PAGE_BUILD_LIMIT};
use crate::cursor::Cursor;
use crate::index::SearchInfo;
use crate::storage::page::page_n_recs;
use crate::storage::Block;

use super::fold::LEFT_SIDE;

/// Update the index's search info from a just-positioned cursor.
pub(crate) fn info_update_hash(cursor: &Cursor) {
    let index = &cursor.index;
    let info = &index.search_info;
    let n_unique = index.n_unique_in_tree() as u32;

    if info.n_hash_potential.load(Ordering::Relaxed) == 0 {
        info.left_bytes_fields.store(LEFT_SIDE | 1, Ordering::Relaxed);
        info.hash_analysis_reset();
        info.increment_potential();
        return;
    }

    let left_bytes_fields = info.left_bytes_fields.load(Ordering::Relaxed);

    // The recommendation already covers the unique prefix and the search
    // matched that far: still winning.
    if u32::from(left_bytes_fields as u16) >= n_unique && u32::from(cursor.up_match) >= n_unique {
        info.increment_potential();
        return;
    }

    let left_side = left_bytes_fields & LEFT_SIDE != 0;
    let info_cmp = (((left_bytes_fields & !LEFT_SIDE) >> 16) as u16 as i32)
        | ((left_bytes_fields as u16 as i32) << 16);
    let low_cmp = (i32::from(cursor.low_match) << 16) | i32::from(cursor.low_bytes);
    let up_cmp = (i32::from(cursor.up_match) << 16) | i32::from(cursor.up_bytes);

    if left_side != (info_cmp <= low_cmp) && left_side == (info_cmp <= up_cmp) {
        info.increment_potential();
        return;
    }

    let cmp = up_cmp - low_cmp;
    let mut left_bytes_fields: u32 = if cmp >= 0 { LEFT_SIDE } else { 0 };

    if left_bytes_fields != 0 {
        if u32::from(cursor.up_match) >= n_unique {
            left_bytes_fields |= n_unique;
        } else if cursor.low_match < cursor.up_match {
            left_bytes_fields |= u32::from(cursor.low_match) + 1;
        } else {
            left_bytes_fields |= u32::from(cursor.low_match);
            left_bytes_fields |= (u32::from(cursor.low_bytes) + 1) << 16;
        }
    } else if u32::from(cursor.low_match) >= n_unique {
        left_bytes_fields |= n_unique;
    } else if cursor.low_match > cursor.up_match {
        left_bytes_fields |= u32::from(cursor.up_match) + 1;
    } else {
        left_bytes_fields |= u32::from(cursor.up_match);
        left_bytes_fields |= (u32::from(cursor.up_bytes) + 1) << 16;
    }

    // A fresh recommendation: skip the analysis for a while, there is no
    // chance of success until it stabilizes.
    info.hash_analysis_reset();
    info.left_bytes_fields
        .store(left_bytes_fields, Ordering::Relaxed);
    info.n_hash_potential
        .store(u8::from(cmp != 0), Ordering::Relaxed);
}

/// Update the block's helpfulness counters.
/// Returns whether building a (new) hash on the block is recommended.
pub(crate) fn update_block_hash_info(info: &SearchInfo, block: &Block) -> bool {
    debug_assert!(block.latch.is_locked());

    let n_hash_helps = block.n_hash_helps.load(Ordering::Relaxed);
    let n_hash_potential = info.n_hash_potential.load(Ordering::Relaxed);
    let info_left_bytes_fields = info.left_bytes_fields.load(Ordering::Relaxed);

    if n_hash_helps != 0
        && n_hash_potential != 0
        && block.next_left_bytes_fields.load(Ordering::Relaxed) == info_left_bytes_fields
    {
        let index = block.index.load(Ordering::Relaxed);
        let curr_left_bytes_fields = block.curr_left_bytes_fields.load(Ordering::Relaxed);

        info.last_hash_succ.store(
            !index.is_null() && curr_left_bytes_fields == info_left_bytes_fields,
            Ordering::Relaxed,
        );

        if n_hash_potential >= BUILD_LIMIT {
            // SAFETY: the caller holds the block latch, keeping the frame
            // readable.
            let n_recs = unsafe { page_n_recs(block.frame()) };
            if n_hash_helps / 2 > n_recs {
                return true;
            }
            if n_hash_helps >= n_recs / PAGE_BUILD_LIMIT
                && (index.is_null() || info_left_bytes_fields != curr_left_bytes_fields)
            {
                return true;
            }
        }

        let bumped = n_hash_helps.wrapping_add(1);
        if bumped != 0 {
            block.n_hash_helps.store(bumped, Ordering::Relaxed);
        }
    } else {
        info.last_hash_succ.store(false, Ordering::Relaxed);
        block.n_hash_helps.store(1, Ordering::Relaxed);
        block
            .next_left_bytes_fields
            .store(info_left_bytes_fields, Ordering::Relaxed);
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HASH_POTENTIAL_MAX;
    use crate::index::IndexDef;
    use crate::records::{IndexField, RecFormat};
    use crate::storage::page;
    use crate::storage::BufferPool;
    use std::sync::Arc;

    fn index(n_uniq: u16) -> Arc<IndexDef> {
        IndexDef::new(
            3,
            RecFormat::Compact,
            vec![
                IndexField::fixed(4),
                IndexField::fixed(4),
                IndexField::fixed(4),
            ],
            n_uniq,
        )
    }

    fn cursor_with(index: &Arc<IndexDef>, matches: (u16, u16, u16, u16)) -> Cursor {
        let mut cursor = Cursor::new(Arc::clone(index));
        cursor.low_match = matches.0;
        cursor.low_bytes = matches.1;
        cursor.up_match = matches.2;
        cursor.up_bytes = matches.3;
        cursor
    }

    #[test]
    fn test_first_update_seeds_left_one_field() {
        let index = index(2);
        let cursor = cursor_with(&index, (0, 0, 0, 0));

        info_update_hash(&cursor);
        let info = &index.search_info;
        assert_eq!(
            info.left_bytes_fields.load(Ordering::Relaxed),
            LEFT_SIDE | 1
        );
        assert_eq!(info.n_hash_potential.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_winning_recommendation_accumulates_potential() {
        let index = index(1);
        // Seed, then keep searching with a fully matching unique prefix.
        let cursor = cursor_with(&index, (0, 0, 1, 0));
        for _ in 0..BUILD_LIMIT as usize + 20 {
            info_update_hash(&cursor);
        }
        assert!(
            index.search_info.n_hash_potential.load(Ordering::Relaxed) >= BUILD_LIMIT
        );
    }

    #[test]
    fn test_potential_saturates_with_margin() {
        let index = index(1);
        let cursor = cursor_with(&index, (0, 0, 1, 0));
        for _ in 0..400 {
            info_update_hash(&cursor);
        }
        assert_eq!(
            index.search_info.n_hash_potential.load(Ordering::Relaxed),
            HASH_POTENTIAL_MAX
        );
    }

    #[test]
    fn test_unstable_comparison_resets_recommendation() {
        let index = index(3);
        let info = &index.search_info;
        info.n_hash_potential.store(50, Ordering::Relaxed);
        info.left_bytes_fields
            .store(LEFT_SIDE | 2, Ordering::Relaxed);

        // Neighbors matched further than the recommendation on the left
        // side: the recommendation cannot separate them any more.
        let cursor = cursor_with(&index, (2, 3, 2, 5));
        info_update_hash(&cursor);

        let lbf = info.left_bytes_fields.load(Ordering::Relaxed);
        assert_ne!(lbf, LEFT_SIDE | 2);
        // up > low, so the new recommendation picks the left side and the
        // shortest separating prefix: low_match fields + low_bytes+1 bytes.
        assert!(lbf & LEFT_SIDE != 0);
        assert_eq!(lbf as u16, 2);
        assert_eq!((lbf & !LEFT_SIDE) >> 16, 4);
        assert_eq!(info.n_hash_potential.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_equal_neighbors_reset_potential_to_zero() {
        let index = index(3);
        let info = &index.search_info;
        info.n_hash_potential.store(50, Ordering::Relaxed);
        info.left_bytes_fields
            .store(LEFT_SIDE | 2, Ordering::Relaxed);

        let cursor = cursor_with(&index, (2, 3, 2, 3));
        info_update_hash(&cursor);
        assert_eq!(info.n_hash_potential.load(Ordering::Relaxed), 0);
    }

    fn block_fixture() -> (Arc<BufferPool>, Arc<IndexDef>) {
        let pool = BufferPool::new(4).unwrap();
        let index = index(1);
        (pool, index)
    }

    #[test]
    fn test_block_info_seeds_on_new_recommendation() {
        let (pool, index) = block_fixture();
        let block = pool.alloc_block().unwrap();
        unsafe { page::leaf_init(block.frame(), &index) };
        block.latch.s_lock();

        let info = &index.search_info;
        info.n_hash_potential.store(10, Ordering::Relaxed);
        info.left_bytes_fields
            .store(LEFT_SIDE | 1, Ordering::Relaxed);

        assert!(!update_block_hash_info(info, block));
        assert_eq!(block.n_hash_helps.load(Ordering::Relaxed), 1);
        assert_eq!(
            block.next_left_bytes_fields.load(Ordering::Relaxed),
            LEFT_SIDE | 1
        );
        assert!(!info.last_hash_succ.load(Ordering::Relaxed));

        // Stable recommendation: helps accumulate.
        assert!(!update_block_hash_info(info, block));
        assert_eq!(block.n_hash_helps.load(Ordering::Relaxed), 2);

        block.latch.s_unlock();
    }

    #[test]
    fn test_block_info_recommends_build_past_limits() {
        let (pool, index) = block_fixture();
        let block = pool.alloc_block().unwrap();
        unsafe { page::leaf_init(block.frame(), &index) };
        block.latch.s_lock();

        let info = &index.search_info;
        info.n_hash_potential
            .store(BUILD_LIMIT, Ordering::Relaxed);
        info.left_bytes_fields
            .store(LEFT_SIDE | 1, Ordering::Relaxed);
        block.next_left_bytes_fields
            .store(LEFT_SIDE | 1, Ordering::Relaxed);
        block.n_hash_helps.store(5, Ordering::Relaxed);

        // Empty page: helps/2 > 0 records triggers immediately.
        assert!(update_block_hash_info(info, block));

        block.latch.s_unlock();
    }

    #[test]
    fn test_block_info_no_rebuild_when_params_current() {
        let (pool, index) = block_fixture();
        let block = pool.alloc_block().unwrap();
        unsafe { page::leaf_init(block.frame(), &index) };
        block.latch.s_lock();

        let info = &index.search_info;
        info.n_hash_potential
            .store(BUILD_LIMIT, Ordering::Relaxed);
        info.left_bytes_fields
            .store(LEFT_SIDE | 1, Ordering::Relaxed);
        block.next_left_bytes_fields
            .store(LEFT_SIDE | 1, Ordering::Relaxed);
        block.n_hash_helps.store(1, Ordering::Relaxed);
        // Pretend the page is already hashed under the same parameters.
        block
            .index
            .store(Arc::as_ptr(&index) as *mut _, Ordering::Relaxed);
        block
            .curr_left_bytes_fields
            .store(LEFT_SIDE | 1, Ordering::Relaxed);

        // helps/2 not past the record count and parameters are current:
        // no build, but the success flag turns on.
        assert!(!update_block_hash_info(info, block));
        assert!(info.last_hash_succ.load(Ordering::Relaxed));

        block
            .index
            .store(std::ptr::null_mut(), Ordering::Relaxed);
        block.latch.s_unlock();
    }
}
