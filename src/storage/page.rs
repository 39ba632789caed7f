//! # Leaf Page Layout
//!
//! Every 16KB page begins with a 32-byte header followed by the infimum and
//! supremum pseudo-records and a heap of user records linked in key order.
//!
//! ## Page Header Layout (32 bytes)
//!
//! ```text
//! Offset  Size  Field        Description
//! ------  ----  -----------  ----------------------------------------
//! 0       1     page_type    Type of page (0x02 = B-tree leaf)
//! 1       1     format       Row format (0 = compact, 1 = redundant)
//! 2       2     level        0 for leaves
//! 4       2     n_recs       Number of user records
//! 6       2     heap_top     Offset where the record heap ends
//! 8       8     index_id     Identity of the owning index
//! 16      4     prev_page    Left sibling (NO_PAGE if none)
//! 20      4     next_page    Right sibling (NO_PAGE if none)
//! 24      8     reserved
//! ```
//!
//! ## Record List
//!
//! ```text
//! +-----------+     +--------+     +--------+     +----------+
//! | infimum   | --> | rec A  | --> | rec B  | --> | supremum |
//! +-----------+     +--------+     +--------+     +----------+
//! ```
//!
//! The infimum and supremum are fixed pseudo-records bounding the list;
//! records between them are user records in ascending key order. Insertion
//! appends the encoded record to the heap and splices the `next` chain;
//! deletion unsplices (heap space is not reclaimed; pages are reorganized
//! elsewhere, which is out of scope here).
//!
//! ## Pointer Arithmetic
//!
//! Page frames are PAGE_SIZE-aligned, so a record pointer masks down to its
//! page frame and the page offset is the low bits. The hash system leans on
//! this to resolve chain entries back to blocks without back-pointers.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::PAGE_SIZE;
use crate::index::IndexDef;
use crate::records::{
    self, compact, redundant, RecFormat, REC_INFO_MIN_REC, REC_STATUS_INFIMUM,
    REC_STATUS_SUPREMUM,
};

pub const PAGE_TYPE_LEAF: u8 = 0x02;
pub const FORMAT_COMPACT: u8 = 0;
pub const FORMAT_REDUNDANT: u8 = 1;
/// Sibling link meaning "no page".
pub const NO_PAGE: u32 = u32::MAX;

pub const PAGE_HEADER_SIZE: usize = 32;
/// Origin of the infimum pseudo-record (3 extra bytes precede it).
pub const PAGE_INFIMUM: usize = PAGE_HEADER_SIZE + 3;
/// Origin of the supremum pseudo-record.
pub const PAGE_SUPREMUM: usize = PAGE_INFIMUM + 8 + 3;
/// First byte of the record heap.
pub const PAGE_HEAP_START: usize = PAGE_SUPREMUM + 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PageHeader {
    page_type: u8,
    format: u8,
    level: U16,
    n_recs: U16,
    heap_top: U16,
    index_id: U64,
    prev_page: U32,
    next_page: U32,
    reserved: [u8; 8],
}

impl PageHeader {
    zerocopy_accessors! {
        level: u16,
        n_recs: u16,
        heap_top: u16,
        index_id: u64,
        prev_page: u32,
        next_page: u32,
    }

    pub fn page_type(&self) -> u8 {
        self.page_type
    }

    pub fn is_comp(&self) -> bool {
        self.format == FORMAT_COMPACT
    }
}

const _: () = assert!(size_of::<PageHeader>() == PAGE_HEADER_SIZE);

/// Mask a pointer inside a page down to its frame base.
#[inline]
pub fn page_align(ptr: *const u8) -> *const u8 {
    (ptr as usize & !(PAGE_SIZE - 1)) as *const u8
}

/// Offset of a pointer within its page.
#[inline]
pub fn page_offset(ptr: *const u8) -> usize {
    ptr as usize & (PAGE_SIZE - 1)
}

/// # Safety
/// `page` must be a live, PAGE_SIZE-aligned page frame.
#[inline]
pub unsafe fn page_header<'a>(page: *const u8) -> &'a PageHeader {
    &*(page as *const PageHeader)
}

/// # Safety
/// `page` must be a live, writable, PAGE_SIZE-aligned page frame, and the
/// caller must hold it exclusively.
#[inline]
#[allow(clippy::mut_from_ref)]
pub unsafe fn page_header_mut<'a>(page: *mut u8) -> &'a mut PageHeader {
    &mut *(page as *mut PageHeader)
}

/// # Safety
/// `page` must be a live page frame.
#[inline]
pub unsafe fn page_is_comp(page: *const u8) -> bool {
    page_header(page).is_comp()
}

/// # Safety
/// `page` must be a live page frame.
#[inline]
pub unsafe fn page_is_leaf(page: *const u8) -> bool {
    page_header(page).level() == 0
}

/// # Safety
/// `page` must be a live page frame.
#[inline]
pub unsafe fn page_index_id(page: *const u8) -> u64 {
    page_header(page).index_id()
}

/// # Safety
/// `page` must be a live page frame.
#[inline]
pub unsafe fn page_n_recs(page: *const u8) -> u16 {
    page_header(page).n_recs()
}

/// # Safety
/// `page` must be a live page frame.
#[inline]
pub unsafe fn page_has_prev(page: *const u8) -> bool {
    page_header(page).prev_page() != NO_PAGE
}

/// # Safety
/// `page` must be a live page frame.
#[inline]
pub unsafe fn page_has_next(page: *const u8) -> bool {
    page_header(page).next_page() != NO_PAGE
}

/// # Safety
/// `page` must be a live page frame.
#[inline]
pub unsafe fn page_infimum(page: *const u8) -> *const u8 {
    page.add(PAGE_INFIMUM)
}

/// # Safety
/// `page` must be a live page frame.
#[inline]
pub unsafe fn page_supremum(page: *const u8) -> *const u8 {
    page.add(PAGE_SUPREMUM)
}

/// Successor of a record in key order; `None` past the supremum.
///
/// # Safety
/// `page` must be a live page frame and `rec` a record origin inside it.
#[inline]
pub unsafe fn page_rec_next(page: *const u8, rec: *const u8) -> Option<*const u8> {
    let next = records::rec_next_offset(rec);
    if next == 0 {
        return None;
    }
    debug_assert!((next as usize) < PAGE_SIZE);
    Some(page.add(next as usize))
}

/// Predecessor of a record, found by walking from the infimum.
///
/// # Safety
/// `page` must be a live page frame and `rec` a record origin inside it,
/// reachable from the infimum.
pub unsafe fn page_rec_prev(page: *const u8, rec: *const u8) -> *const u8 {
    let mut cur = page_infimum(page);
    loop {
        let next = page_rec_next(page, cur).expect("record not on page");
        if next == rec {
            return cur;
        }
        cur = next;
    }
}

/// First record after the infimum, possibly the supremum.
///
/// # Safety
/// `page` must be a live page frame.
#[inline]
pub unsafe fn page_first_rec(page: *const u8) -> *const u8 {
    page_rec_next(page, page_infimum(page)).expect("infimum unlinked")
}

/// Initialize an empty leaf page for `index`.
///
/// # Safety
/// `page` must be a live, writable, PAGE_SIZE-aligned frame held
/// exclusively by the caller.
pub unsafe fn leaf_init(page: *mut u8, index: &IndexDef) {
    std::ptr::write_bytes(page, 0, PAGE_HEAP_START);

    let header = page_header_mut(page);
    header.page_type = PAGE_TYPE_LEAF;
    header.format = match index.format {
        RecFormat::Compact => FORMAT_COMPACT,
        RecFormat::Redundant => FORMAT_REDUNDANT,
    };
    header.set_level(0);
    header.set_n_recs(0);
    header.set_heap_top(PAGE_HEAP_START as u16);
    header.set_index_id(index.id);
    header.set_prev_page(NO_PAGE);
    header.set_next_page(NO_PAGE);

    let infimum = page.add(PAGE_INFIMUM);
    *infimum.sub(1) = REC_STATUS_INFIMUM;
    records::rec_set_next_offset(infimum, PAGE_SUPREMUM as u16);
    infimum.copy_from_nonoverlapping(b"infimum\0".as_ptr(), 8);

    let supremum = page.add(PAGE_SUPREMUM);
    *supremum.sub(1) = REC_STATUS_SUPREMUM;
    records::rec_set_next_offset(supremum, 0);
    supremum.copy_from_nonoverlapping(b"supremum".as_ptr(), 8);
}

/// Insert a record after `prev`, keeping the caller responsible for key
/// order. `info_bits` may carry the min-record flag for a metadata record.
///
/// # Safety
/// `page` must be a live, writable frame held exclusively; `prev` must be a
/// record origin on it (infimum included).
pub unsafe fn page_insert_after(
    page: *mut u8,
    prev: *const u8,
    index: &IndexDef,
    values: &[Option<&[u8]>],
    info_bits: u8,
) -> Result<*const u8> {
    debug_assert!(!records::rec_is_supremum(prev));
    debug_assert_eq!(info_bits & !REC_INFO_MIN_REC, 0);

    let (buf, origin) = match index.format {
        RecFormat::Compact => compact::encode(index, values)?,
        RecFormat::Redundant => redundant::encode(index, values)?,
    };

    let heap_top = page_header(page).heap_top() as usize;
    ensure!(
        heap_top + buf.len() <= PAGE_SIZE,
        "page full: {} bytes needed, {} free",
        buf.len(),
        PAGE_SIZE - heap_top
    );

    page
        .add(heap_top)
        .copy_from_nonoverlapping(buf.as_ptr(), buf.len());
    let rec = page.add(heap_top + origin);
    *rec.sub(1) |= info_bits;

    records::rec_set_next_offset(rec, records::rec_next_offset(prev));
    records::rec_set_next_offset(prev as *mut u8, page_offset(rec) as u16);

    let header = page_header_mut(page);
    header.set_heap_top((heap_top + buf.len()) as u16);
    if info_bits & REC_INFO_MIN_REC == 0 {
        header.set_n_recs(header.n_recs() + 1);
    }

    Ok(rec)
}

/// Unlink the successor of `prev` from the record list. Heap space is not
/// reclaimed.
///
/// # Safety
/// `page` must be a live, writable frame held exclusively; `prev` must be a
/// record origin on it whose successor is a user record.
pub unsafe fn page_delete_after(page: *mut u8, prev: *const u8) {
    let rec = page_rec_next(page, prev).expect("no successor to delete");
    debug_assert!(records::rec_is_user(rec));

    records::rec_set_next_offset(prev as *mut u8, records::rec_next_offset(rec));
    records::rec_set_next_offset(rec as *mut u8, 0);

    let header = page_header_mut(page);
    if !records::rec_is_metadata(rec) {
        header.set_n_recs(header.n_recs() - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{rec_is_supremum, rec_is_user, IndexField};
    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use std::sync::Arc;

    struct Frame(*mut u8, Layout);

    impl Frame {
        fn new() -> Self {
            let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
            // SAFETY: non-zero sized layout.
            let ptr = unsafe { alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            Frame(ptr, layout)
        }
    }

    impl Drop for Frame {
        fn drop(&mut self) {
            // SAFETY: allocated with the stored layout in new().
            unsafe { dealloc(self.0, self.1) }
        }
    }

    fn index() -> Arc<IndexDef> {
        IndexDef::new(
            42,
            RecFormat::Compact,
            vec![IndexField::fixed(2), IndexField::variable(16)],
            1,
        )
    }

    #[test]
    fn test_leaf_init_links_bounds() {
        let frame = Frame::new();
        let index = index();
        unsafe {
            leaf_init(frame.0, &index);
            assert_eq!(page_index_id(frame.0), 42);
            assert!(page_is_leaf(frame.0));
            assert!(page_is_comp(frame.0));
            assert_eq!(page_n_recs(frame.0), 0);
            assert!(rec_is_supremum(page_first_rec(frame.0)));
        }
    }

    #[test]
    fn test_insert_and_iterate_in_order() {
        let frame = Frame::new();
        let index = index();
        unsafe {
            leaf_init(frame.0, &index);
            let inf = page_infimum(frame.0);
            let a = page_insert_after(frame.0, inf, &index, &[Some(b"aa"), Some(b"1")], 0)
                .unwrap();
            let b = page_insert_after(frame.0, a, &index, &[Some(b"bb"), Some(b"2")], 0)
                .unwrap();

            assert_eq!(page_n_recs(frame.0), 2);
            let first = page_first_rec(frame.0);
            assert_eq!(first, a);
            assert!(rec_is_user(first));
            let second = page_rec_next(frame.0, first).unwrap();
            assert_eq!(second, b);
            assert!(rec_is_supremum(page_rec_next(frame.0, second).unwrap()));
            assert_eq!(page_rec_prev(frame.0, b), a);
        }
    }

    #[test]
    fn test_delete_unlinks() {
        let frame = Frame::new();
        let index = index();
        unsafe {
            leaf_init(frame.0, &index);
            let inf = page_infimum(frame.0);
            let a = page_insert_after(frame.0, inf, &index, &[Some(b"aa"), Some(b"1")], 0)
                .unwrap();
            page_insert_after(frame.0, a, &index, &[Some(b"bb"), Some(b"2")], 0).unwrap();

            page_delete_after(frame.0, a);
            assert_eq!(page_n_recs(frame.0), 1);
            assert!(rec_is_supremum(page_rec_next(frame.0, a).unwrap()));
        }
    }

    #[test]
    fn test_metadata_record_not_counted() {
        let frame = Frame::new();
        let index = index();
        unsafe {
            leaf_init(frame.0, &index);
            let inf = page_infimum(frame.0);
            let meta = page_insert_after(
                frame.0,
                inf,
                &index,
                &[Some(b"\0\0"), Some(b"")],
                REC_INFO_MIN_REC,
            )
            .unwrap();
            assert!(records::rec_is_metadata(meta));
            assert_eq!(page_n_recs(frame.0), 0);
        }
    }

    #[test]
    fn test_page_align_and_offset() {
        let frame = Frame::new();
        let index = index();
        unsafe {
            leaf_init(frame.0, &index);
            let inf = page_infimum(frame.0);
            let rec = page_insert_after(frame.0, inf, &index, &[Some(b"aa"), Some(b"1")], 0)
                .unwrap();
            assert_eq!(page_align(rec), frame.0 as *const u8);
            assert_eq!(page_offset(rec), rec as usize - frame.0 as usize);
        }
    }
}
