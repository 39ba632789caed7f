//! # Block Descriptors and Page Latches
//!
//! A `Block` describes one page frame: its replacement state, pin count,
//! page latch, and the per-block hash state (which index and prefix
//! parameters the page is currently hashed under, if any).
//!
//! ## Page Latch
//!
//! Page latches are held across function boundaries (a positioned cursor
//! keeps its leaf latched until released), so RAII guards do not fit.
//! `PageLatch` wraps a raw reader-writer lock with explicit lock/unlock
//! calls; the guess path additionally needs `try_` variants to avoid lock
//! inversion against writers (it already holds a partition latch).
//!
//! ## States
//!
//! ```text
//! NOT_USED ──alloc──> UNFIXED ──evict──> REMOVE_HASH ──freed──> NOT_USED
//! ```
//!
//! `REMOVE_HASH` marks the window in which a page has been unmapped from
//! the pool but its hash entries are still being torn down; a hash lookup
//! that wins the block latch during that window must back off.
//!
//! ## Hash-State Access Rules
//!
//! `index` and `curr_left_bytes_fields` may be read under the owning
//! partition's latch in shared mode; writing them requires that latch in
//! exclusive mode (plus the block latch on the build/drop paths).
//! `next_left_bytes_fields` and `n_hash_helps` belong to the unlatched
//! heuristic and tolerate torn reads.

use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU16, AtomicU32, AtomicU64, Ordering};

use parking_lot::lock_api::RawRwLock as RawRwLockApi;
use parking_lot::RawRwLock;

use crate::index::IndexDef;

/// Latching intent of a leaf access: shared for reads, exclusive for
/// modifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchMode {
    Shared,
    Exclusive,
}

/// Reader-writer page latch with explicit unlock.
pub struct PageLatch {
    raw: RawRwLock,
}

impl Default for PageLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl PageLatch {
    pub fn new() -> Self {
        Self { raw: RawRwLock::INIT }
    }

    pub fn s_lock(&self) {
        self.raw.lock_shared();
    }

    pub fn x_lock(&self) {
        self.raw.lock_exclusive();
    }

    pub fn try_s_lock(&self) -> bool {
        self.raw.try_lock_shared()
    }

    pub fn try_x_lock(&self) -> bool {
        self.raw.try_lock_exclusive()
    }

    pub fn s_unlock(&self) {
        debug_assert!(self.raw.is_locked());
        // SAFETY: the caller owns a shared acquisition of this latch.
        unsafe { self.raw.unlock_shared() }
    }

    pub fn x_unlock(&self) {
        debug_assert!(self.raw.is_locked_exclusive());
        // SAFETY: the caller owns the exclusive acquisition of this latch.
        unsafe { self.raw.unlock_exclusive() }
    }

    pub fn lock(&self, mode: LatchMode) {
        match mode {
            LatchMode::Shared => self.s_lock(),
            LatchMode::Exclusive => self.x_lock(),
        }
    }

    pub fn try_lock(&self, mode: LatchMode) -> bool {
        match mode {
            LatchMode::Shared => self.try_s_lock(),
            LatchMode::Exclusive => self.try_x_lock(),
        }
    }

    pub fn unlock(&self, mode: LatchMode) {
        match mode {
            LatchMode::Shared => self.s_unlock(),
            LatchMode::Exclusive => self.x_unlock(),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    pub fn is_locked_exclusive(&self) -> bool {
        self.raw.is_locked_exclusive()
    }
}

pub const BLOCK_NOT_USED: u32 = 0;
pub const BLOCK_UNFIXED: u32 = 1;
pub const BLOCK_REMOVE_HASH: u32 = 2;

/// Page id of a block not mapped to any page.
pub const NO_PAGE_ID: u64 = u64::MAX;

/// Descriptor of one buffer-pool page frame.
pub struct Block {
    frame: *mut u8,
    page_id: AtomicU64,
    state: AtomicU32,
    fix_count: AtomicU32,
    visited: AtomicBool,
    pub latch: PageLatch,

    /// Index the page is hashed under, null when not hashed. See the
    /// module docs for the access rules of this group.
    pub index: AtomicPtr<IndexDef>,
    pub curr_left_bytes_fields: AtomicU32,
    pub next_left_bytes_fields: AtomicU32,
    pub n_hash_helps: AtomicU16,
    /// Bump offset when the frame serves as a chain-node slab page.
    pub free_offset: AtomicU32,
    /// Number of hash chain nodes pointing into this page.
    #[cfg(debug_assertions)]
    pub n_pointers: AtomicU32,
}

// SAFETY: `frame` points into a pool chunk that outlives every Block and is
// only dereferenced under the latching protocol above; all other fields are
// atomics or the latch itself.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl Block {
    pub(crate) fn new(frame: *mut u8) -> Self {
        Self {
            frame,
            page_id: AtomicU64::new(NO_PAGE_ID),
            state: AtomicU32::new(BLOCK_NOT_USED),
            fix_count: AtomicU32::new(0),
            visited: AtomicBool::new(false),
            latch: PageLatch::new(),
            index: AtomicPtr::new(std::ptr::null_mut()),
            curr_left_bytes_fields: AtomicU32::new(0),
            next_left_bytes_fields: AtomicU32::new(0),
            n_hash_helps: AtomicU16::new(0),
            free_offset: AtomicU32::new(0),
            #[cfg(debug_assertions)]
            n_pointers: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn frame(&self) -> *mut u8 {
        self.frame
    }

    /// # Safety
    /// The caller must hold this block's latch (any mode) or otherwise
    /// guarantee no concurrent writer.
    #[inline]
    pub unsafe fn page(&self) -> &[u8] {
        std::slice::from_raw_parts(self.frame, crate::config::PAGE_SIZE)
    }

    #[inline]
    pub fn page_id(&self) -> u64 {
        self.page_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_page_id(&self, id: u64) {
        self.page_id.store(id, Ordering::Release);
    }

    #[inline]
    pub fn state(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }

    pub(crate) fn set_state(&self, state: u32) {
        self.state.store(state, Ordering::Release);
    }

    pub fn fix(&self) {
        self.fix_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unfix(&self) {
        let prev = self.fix_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unfix called on unpinned block");
    }

    #[inline]
    pub fn fix_count(&self) -> u32 {
        self.fix_count.load(Ordering::Acquire)
    }

    pub fn mark_visited(&self) {
        self.visited.store(true, Ordering::Release);
    }

    pub fn is_visited(&self) -> bool {
        self.visited.load(Ordering::Acquire)
    }

    /// Whether eviction may take this frame: unpinned and unlatched.
    pub fn can_relocate(&self) -> bool {
        self.fix_count() == 0 && !self.latch.is_locked()
    }

    pub(crate) fn reset_for_alloc(&self) {
        self.set_state(BLOCK_UNFIXED);
        self.set_page_id(NO_PAGE_ID);
        self.visited.store(false, Ordering::Relaxed);
        self.index.store(std::ptr::null_mut(), Ordering::Relaxed);
        self.curr_left_bytes_fields.store(0, Ordering::Relaxed);
        self.next_left_bytes_fields.store(0, Ordering::Relaxed);
        self.n_hash_helps.store(0, Ordering::Relaxed);
        self.free_offset.store(0, Ordering::Relaxed);
        #[cfg(debug_assertions)]
        self.n_pointers.store(0, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("page_id", &self.page_id())
            .field("state", &self.state())
            .field("fix_count", &self.fix_count())
            .field("hashed", &!self.index.load(Ordering::Relaxed).is_null())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latch_modes() {
        let latch = PageLatch::new();

        latch.s_lock();
        assert!(latch.is_locked());
        assert!(latch.try_s_lock());
        assert!(!latch.try_x_lock());
        latch.s_unlock();
        latch.s_unlock();

        latch.x_lock();
        assert!(latch.is_locked_exclusive());
        assert!(!latch.try_s_lock());
        latch.x_unlock();
        assert!(!latch.is_locked());
    }

    #[test]
    fn test_fix_count_and_relocate() {
        let block = Block::new(std::ptr::null_mut());
        assert!(block.can_relocate());

        block.fix();
        assert!(!block.can_relocate());
        block.unfix();

        block.latch.s_lock();
        assert!(!block.can_relocate());
        block.latch.s_unlock();
        assert!(block.can_relocate());
    }
}
