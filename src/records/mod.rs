//! # Record Formats and Prefix Comparison
//!
//! This module defines the two physical row formats understood by the hash
//! system, the logical tuple used on the lookup side, and the ordered
//! comparison that drives cursor positioning.
//!
//! ## Record Binary Layout
//!
//! A record is addressed by its *origin*: the page offset of its first data
//! byte. Metadata grows backwards from the origin so that the hot path (a
//! prefix walk starting at the origin) never skips over headers.
//!
//! Both formats share the 3 bytes immediately below the origin `o`:
//!
//! ```text
//! o-3..o-1   next      u16 LE, absolute page offset of the successor origin
//! o-1        status    low 3 bits: ordinary / infimum / supremum
//!                      bit 0x10: min-record (metadata) flag
//! ```
//!
//! **Compact** continues below with a null bitmap (one bit per nullable
//! column, bytes walking downward) and then a variable-length vector (one
//! byte per variable column, or two with the high byte flagged `0x80` when the
//! column can exceed 255 bytes). NULL columns contribute no data bytes and
//! no length byte; fixed columns carry no length byte.
//!
//! **Redundant** continues with `n_fields` (`o-4`) and a one-byte-offsets
//! flag (`o-5`), then a field-end offset array: cumulative data end per
//! field, 1-byte entries (SQL NULL flag `0x80`) or 2-byte little-endian
//! entries (flag `0x8000`). NULL columns are stored as `sql_null_size`
//! zero-filled bytes so the data area stays positionally decodable.
//!
//! ## Why Two Formats
//!
//! The formats differ only in how NULLs and lengths are materialized, which
//! is exactly the part the fingerprint function must agree on between a
//! physical record and a logical tuple. Keeping both keeps that agreement
//! honest (see `ahi::fold`).
//!
//! ## Thread Safety
//!
//! All record accessors are `unsafe fn`s over raw origin pointers; callers
//! guarantee the pointer lies inside a live, appropriately latched page.

pub mod compact;
pub mod redundant;
pub mod tuple;

use std::cmp::Ordering;

use smallvec::SmallVec;

pub use self::tuple::{Tuple, TupleField};

use crate::index::IndexDef;

/// Row format of an index, fixed at index creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecFormat {
    Compact,
    Redundant,
}

/// Per-column descriptor, in index order.
#[derive(Debug, Clone)]
pub struct IndexField {
    /// Stored length for fixed-width columns; 0 for variable-width.
    pub fixed_len: u16,
    /// Upper bound on the stored length. Variable columns with
    /// `max_len > 255` need two length bytes in the compact format.
    pub max_len: u16,
    pub nullable: bool,
    /// Bytes a NULL occupies in the redundant format (zero-filled).
    pub sql_null_size: u16,
}

impl IndexField {
    pub fn fixed(len: u16) -> Self {
        Self {
            fixed_len: len,
            max_len: len,
            nullable: false,
            sql_null_size: len,
        }
    }

    pub fn fixed_nullable(len: u16) -> Self {
        Self {
            nullable: true,
            ..Self::fixed(len)
        }
    }

    pub fn variable(max_len: u16) -> Self {
        Self {
            fixed_len: 0,
            max_len,
            nullable: false,
            sql_null_size: 0,
        }
    }

    pub fn variable_nullable(max_len: u16) -> Self {
        Self {
            nullable: true,
            ..Self::variable(max_len)
        }
    }

    /// Whether the compact format needs a second length byte.
    pub fn is_big(&self) -> bool {
        self.max_len > 255
    }
}

pub const REC_STATUS_ORDINARY: u8 = 0;
pub const REC_STATUS_INFIMUM: u8 = 2;
pub const REC_STATUS_SUPREMUM: u8 = 3;
pub const REC_STATUS_MASK: u8 = 0x07;
/// Metadata / min-record flag, also understood on tuples.
pub const REC_INFO_MIN_REC: u8 = 0x10;

/// Fixed extra bytes below a compact origin (next + status).
pub const REC_COMPACT_EXTRA_BYTES: usize = 3;
/// Fixed extra bytes below a redundant origin (next + status + n_fields + flag).
pub const REC_REDUNDANT_EXTRA_BYTES: usize = 5;

/// # Safety
/// `rec` must point at a record origin inside a live page.
#[inline]
pub unsafe fn rec_info_status(rec: *const u8) -> u8 {
    *rec.sub(1)
}

/// # Safety
/// `rec` must point at a record origin inside a live page.
#[inline]
pub unsafe fn rec_status(rec: *const u8) -> u8 {
    rec_info_status(rec) & REC_STATUS_MASK
}

/// # Safety
/// `rec` must point at a record origin inside a live page.
#[inline]
pub unsafe fn rec_is_infimum(rec: *const u8) -> bool {
    rec_status(rec) == REC_STATUS_INFIMUM
}

/// # Safety
/// `rec` must point at a record origin inside a live page.
#[inline]
pub unsafe fn rec_is_supremum(rec: *const u8) -> bool {
    rec_status(rec) == REC_STATUS_SUPREMUM
}

/// # Safety
/// `rec` must point at a record origin inside a live page.
#[inline]
pub unsafe fn rec_is_user(rec: *const u8) -> bool {
    rec_status(rec) == REC_STATUS_ORDINARY
}

/// # Safety
/// `rec` must point at a record origin inside a live page.
#[inline]
pub unsafe fn rec_is_metadata(rec: *const u8) -> bool {
    rec_info_status(rec) & REC_INFO_MIN_REC != 0
}

/// Absolute page offset of the successor origin, 0 when the record is the
/// supremum.
///
/// # Safety
/// `rec` must point at a record origin inside a live page.
#[inline]
pub unsafe fn rec_next_offset(rec: *const u8) -> u16 {
    u16::from_le_bytes([*rec.sub(3), *rec.sub(2)])
}

/// # Safety
/// `rec` must point at a record origin inside a live, writable page.
#[inline]
pub unsafe fn rec_set_next_offset(rec: *mut u8, next: u16) {
    let bytes = next.to_le_bytes();
    *rec.sub(3) = bytes[0];
    *rec.sub(2) = bytes[1];
}

/// One decoded column of a physical record, relative to the origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSlice {
    pub offset: u16,
    pub len: u16,
    pub is_null: bool,
}

pub type Offsets = SmallVec<[FieldSlice; 8]>;

/// Decode the per-field layout of a user record.
///
/// # Safety
/// `rec` must point at a user-record origin of a record encoded under
/// `index`'s format and schema, inside a live page.
pub unsafe fn rec_offsets(rec: *const u8, index: &IndexDef) -> Offsets {
    match index.format {
        RecFormat::Compact => compact::offsets(rec, index),
        RecFormat::Redundant => redundant::offsets(rec, index),
    }
}

/// Compare a logical tuple against a physical record, binary collation,
/// NULL ordered lowest. Only the tuple's fields participate; a tuple that
/// is a strict prefix of an equal record compares `Equal`.
///
/// On return `matched_fields` holds the number of complete leading fields
/// that compared equal and `matched_bytes` the number of equal leading
/// bytes within the first field that differed.
///
/// # Safety
/// Same contract as [`rec_offsets`].
pub unsafe fn cmp_tuple_rec_with_match(
    tuple: &Tuple,
    rec: *const u8,
    index: &IndexDef,
    matched_fields: &mut u16,
    matched_bytes: &mut u16,
) -> Ordering {
    let offsets = rec_offsets(rec, index);
    *matched_fields = 0;
    *matched_bytes = 0;

    for (i, field) in tuple.fields.iter().enumerate() {
        let Some(slice) = offsets.get(i) else {
            // Tuple is wider than the record; treat the record as smaller.
            return Ordering::Greater;
        };

        let rec_bytes = if slice.is_null {
            None
        } else {
            Some(std::slice::from_raw_parts(
                rec.add(slice.offset as usize),
                slice.len as usize,
            ))
        };

        let ord = match (field.data.as_deref(), rec_bytes) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(t), Some(r)) => {
                let common = t.iter().zip(r.iter()).take_while(|(a, b)| a == b).count();
                if common < t.len() && common < r.len() {
                    *matched_bytes = common as u16;
                    t[common].cmp(&r[common])
                } else {
                    *matched_bytes = common as u16;
                    t.len().cmp(&r.len())
                }
            }
        };

        if ord != Ordering::Equal {
            return ord;
        }
        *matched_fields += 1;
        *matched_bytes = 0;
    }

    Ordering::Equal
}
