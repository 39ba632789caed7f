//! Redundant record format.
//!
//! Every field, NULL or not, occupies data bytes (NULLs are zero-filled to
//! the column's `sql_null_size`), and a per-field end-offset array below the
//! origin makes the layout self-describing. The array uses 1-byte entries
//! while the record stays short and 2-byte entries otherwise; the top bit of
//! an entry flags SQL NULL.

use eyre::{ensure, Result};

use super::{FieldSlice, Offsets, REC_REDUNDANT_EXTRA_BYTES, REC_STATUS_ORDINARY};
use crate::index::IndexDef;

const NULL_FLAG_1BYTE: u8 = 0x80;
const NULL_FLAG_2BYTE: u16 = 0x8000;
/// Largest cumulative end offset expressible with 1-byte entries.
const MAX_1BYTE_END: usize = 0x7f;

/// # Safety
/// `rec` must be the origin of a redundant-format user record.
#[inline]
unsafe fn offs_1byte(rec: *const u8) -> bool {
    *rec.sub(REC_REDUNDANT_EXTRA_BYTES) != 0
}

/// # Safety
/// `rec` must be the origin of a redundant-format user record.
#[inline]
unsafe fn stored_n_fields(rec: *const u8) -> usize {
    *rec.sub(REC_REDUNDANT_EXTRA_BYTES - 1) as usize
}

/// Field end info: cumulative data end offset plus the NULL flag.
///
/// # Safety
/// `rec` must be the origin of a redundant-format user record and `i` within
/// its stored field count.
unsafe fn field_end_info(rec: *const u8, i: usize) -> (usize, bool) {
    if offs_1byte(rec) {
        let raw = *rec.sub(REC_REDUNDANT_EXTRA_BYTES + 1 + i);
        ((raw & !NULL_FLAG_1BYTE) as usize, raw & NULL_FLAG_1BYTE != 0)
    } else {
        let lo = *rec.sub(REC_REDUNDANT_EXTRA_BYTES + 2 * (i + 1));
        let hi = *rec.sub(REC_REDUNDANT_EXTRA_BYTES + 2 * (i + 1) - 1);
        let raw = u16::from_le_bytes([lo, hi]);
        ((raw & !NULL_FLAG_2BYTE) as usize, raw & NULL_FLAG_2BYTE != 0)
    }
}

/// Byte length of the record prefix covering `n_fields` complete columns
/// plus `n_bytes` of the next one. NULL columns are part of the span (they
/// are stored zero-filled), so the span is a plain cumulative offset.
///
/// # Safety
/// `rec` must be the origin of a redundant-format user record encoded under
/// `index`.
pub unsafe fn prefix_len(
    rec: *const u8,
    index: &IndexDef,
    n_fields: usize,
    n_bytes: usize,
) -> usize {
    let n_f = n_fields + (n_bytes > 0) as usize;
    debug_assert!(n_f >= 1);
    debug_assert!(n_f <= stored_n_fields(rec));
    debug_assert!(n_f <= index.fields.len());

    let (mut n, _) = field_end_info(rec, n_f - 1);

    if n_bytes > 0 {
        if n_fields == 0 {
            n = n_bytes.min(n);
        } else {
            let (prev, _) = field_end_info(rec, n_f - 2);
            let len = n - prev;
            n = prev + n_bytes.min(len);
        }
    }

    n
}

/// Decode every column of a user record.
///
/// # Safety
/// `rec` must be the origin of a redundant-format user record encoded under
/// `index`.
pub unsafe fn offsets(rec: *const u8, index: &IndexDef) -> Offsets {
    let n = stored_n_fields(rec).min(index.fields.len());
    let mut out = Offsets::new();
    let mut prev_end = 0usize;

    for i in 0..n {
        let (end, is_null) = field_end_info(rec, i);
        out.push(FieldSlice {
            offset: prev_end as u16,
            len: (end - prev_end) as u16,
            is_null,
        });
        prev_end = end;
    }

    out
}

/// Serialize one record. Returns the encoded bytes and the origin offset
/// within them.
pub fn encode(index: &IndexDef, values: &[Option<&[u8]>]) -> Result<(Vec<u8>, usize)> {
    ensure!(
        values.len() == index.fields.len(),
        "value count {} does not match field count {}",
        values.len(),
        index.fields.len()
    );
    ensure!(values.len() <= u8::MAX as usize, "too many fields");

    let mut data: Vec<u8> = Vec::new();
    let mut ends: Vec<(usize, bool)> = Vec::with_capacity(values.len());

    for (field, value) in index.fields.iter().zip(values) {
        match value {
            None => {
                ensure!(field.nullable, "NULL in non-nullable column");
                data.resize(data.len() + field.sql_null_size as usize, 0);
                ends.push((data.len(), true));
            }
            Some(v) => {
                if field.fixed_len > 0 {
                    ensure!(
                        v.len() == field.fixed_len as usize,
                        "fixed column expects {} bytes, got {}",
                        field.fixed_len,
                        v.len()
                    );
                } else {
                    ensure!(
                        v.len() <= field.max_len as usize,
                        "column value of {} bytes exceeds maximum {}",
                        v.len(),
                        field.max_len
                    );
                }
                data.extend_from_slice(v);
                ends.push((data.len(), false));
            }
        }
    }

    let one_byte = data.len() <= MAX_1BYTE_END;
    ensure!(
        data.len() <= (!NULL_FLAG_2BYTE) as usize,
        "record of {} bytes exceeds the offset encoding",
        data.len()
    );

    let entry_size = if one_byte { 1 } else { 2 };
    let mut buf = Vec::with_capacity(
        ends.len() * entry_size + REC_REDUNDANT_EXTRA_BYTES + data.len(),
    );

    // End-info entries, last field at the lowest address.
    for &(end, is_null) in ends.iter().rev() {
        if one_byte {
            let mut raw = end as u8;
            if is_null {
                raw |= NULL_FLAG_1BYTE;
            }
            buf.push(raw);
        } else {
            let mut raw = end as u16;
            if is_null {
                raw |= NULL_FLAG_2BYTE;
            }
            buf.extend_from_slice(&raw.to_le_bytes());
        }
    }

    buf.push(one_byte as u8);
    buf.push(ends.len() as u8);
    buf.extend_from_slice(&[0, 0]); // next, linked by the page layer
    buf.push(REC_STATUS_ORDINARY);
    let origin = buf.len();
    buf.extend_from_slice(&data);

    Ok((buf, origin))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{IndexField, RecFormat};
    use std::sync::Arc;

    fn index() -> Arc<IndexDef> {
        IndexDef::new(
            1,
            RecFormat::Redundant,
            vec![
                IndexField::fixed(4),
                IndexField::fixed_nullable(8),
                IndexField::variable(200),
            ],
            3,
        )
    }

    #[test]
    fn test_offsets_roundtrip() {
        let index = index();
        let (buf, origin) =
            encode(&index, &[Some(b"aaaa"), Some(b"bbbbbbbb"), Some(b"cc")]).unwrap();
        let rec = unsafe { buf.as_ptr().add(origin) };
        let offs = unsafe { offsets(rec, &index) };

        assert_eq!(offs.len(), 3);
        assert_eq!((offs[0].offset, offs[0].len), (0, 4));
        assert_eq!((offs[1].offset, offs[1].len), (4, 8));
        assert_eq!((offs[2].offset, offs[2].len), (12, 2));
    }

    #[test]
    fn test_null_stored_zero_filled() {
        let index = index();
        let (buf, origin) = encode(&index, &[Some(b"aaaa"), None, Some(b"cc")]).unwrap();
        let rec = unsafe { buf.as_ptr().add(origin) };
        let offs = unsafe { offsets(rec, &index) };

        assert!(offs[1].is_null);
        assert_eq!(offs[1].len, 8);
        assert_eq!(&buf[origin + 4..origin + 12], &[0u8; 8]);
        assert_eq!((offs[2].offset, offs[2].len), (12, 2));
    }

    #[test]
    fn test_two_byte_entries_for_long_records() {
        let index = index();
        let long = vec![7u8; 180];
        let (buf, origin) =
            encode(&index, &[Some(b"aaaa"), Some(b"bbbbbbbb"), Some(&long)]).unwrap();
        let rec = unsafe { buf.as_ptr().add(origin) };
        assert!(!unsafe { offs_1byte(rec) });

        let offs = unsafe { offsets(rec, &index) };
        assert_eq!((offs[2].offset, offs[2].len), (12, 180));
    }

    #[test]
    fn test_prefix_len_includes_null_zeros() {
        let index = index();
        let (buf, origin) = encode(&index, &[Some(b"aaaa"), None, Some(b"cc")]).unwrap();
        let rec = unsafe { buf.as_ptr().add(origin) };

        assert_eq!(unsafe { prefix_len(rec, &index, 1, 0) }, 4);
        // The NULL second field is part of the span: 4 + min(3, 8) = 7.
        assert_eq!(unsafe { prefix_len(rec, &index, 1, 3) }, 7);
        assert_eq!(unsafe { prefix_len(rec, &index, 2, 0) }, 12);
        assert_eq!(unsafe { prefix_len(rec, &index, 0, 2) }, 2);
    }
}
