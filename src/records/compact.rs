//! Compact record format.
//!
//! The origin points at the first data byte; NULL columns contribute no data
//! bytes at all, so the examined prefix of a record is always one contiguous
//! span starting at the origin. That property is what lets the fingerprint
//! hash a single slice instead of reassembling columns.

use eyre::{ensure, Result};

use super::{FieldSlice, Offsets, IndexField, REC_COMPACT_EXTRA_BYTES, REC_STATUS_ORDINARY};
use crate::index::IndexDef;

/// Two-byte length marker: high byte carries this flag for columns that can
/// exceed 255 bytes.
const LEN_2BYTE_FLAG: u8 = 0x80;
/// Maximum encodable column length (14 bits).
const LEN_MAX: usize = 0x3fff;

/// Byte length of the record prefix covering `n_fields` complete columns
/// plus `n_bytes` of the next one.
///
/// A NULL column contributes nothing; a NULL in the partial position ends
/// the prefix with the bytes accumulated so far.
///
/// # Safety
/// `rec` must be the origin of a user record encoded under `index`.
pub unsafe fn prefix_len(
    rec: *const u8,
    index: &IndexDef,
    n_fields: usize,
    n_bytes: usize,
) -> usize {
    let n_f = n_fields + (n_bytes > 0) as usize;
    debug_assert!(n_f >= 1);
    debug_assert!(n_f <= index.fields.len());

    let mut nulls = rec.sub(REC_COMPACT_EXTRA_BYTES + 1);
    let mut lens = nulls.sub(index.n_core_null_bytes());
    let mut null_mask = 1u8;
    let mut n = 0usize;
    let mut len = 0usize;

    for field in index.fields.iter().take(n_f) {
        if field.nullable {
            let is_null = *nulls & null_mask != 0;
            null_mask = null_mask.wrapping_shl(1);
            if null_mask == 0 {
                null_mask = 1;
                nulls = nulls.sub(1);
            }
            if is_null {
                len = 0;
                continue;
            }
        }

        len = field.fixed_len as usize;
        if len == 0 {
            len = *lens as usize;
            lens = lens.sub(1);
            if len & LEN_2BYTE_FLAG as usize != 0 && field.is_big() {
                len <<= 8;
                len |= *lens as usize;
                lens = lens.sub(1);
                len &= LEN_MAX;
            }
        }

        n += len;
    }

    if n_bytes > 0 {
        n += n_bytes.min(len);
        n -= len;
    }

    n
}

/// Decode every column of a user record.
///
/// # Safety
/// `rec` must be the origin of a user record encoded under `index`.
pub unsafe fn offsets(rec: *const u8, index: &IndexDef) -> Offsets {
    let mut nulls = rec.sub(REC_COMPACT_EXTRA_BYTES + 1);
    let mut lens = nulls.sub(index.n_core_null_bytes());
    let mut null_mask = 1u8;
    let mut out = Offsets::new();
    let mut offset = 0usize;

    for field in &index.fields {
        let mut is_null = false;
        if field.nullable {
            is_null = *nulls & null_mask != 0;
            null_mask = null_mask.wrapping_shl(1);
            if null_mask == 0 {
                null_mask = 1;
                nulls = nulls.sub(1);
            }
        }

        if is_null {
            out.push(FieldSlice {
                offset: offset as u16,
                len: 0,
                is_null: true,
            });
            continue;
        }

        let mut len = field.fixed_len as usize;
        if len == 0 {
            len = *lens as usize;
            lens = lens.sub(1);
            if len & LEN_2BYTE_FLAG as usize != 0 && field.is_big() {
                len <<= 8;
                len |= *lens as usize;
                lens = lens.sub(1);
                len &= LEN_MAX;
            }
        }

        out.push(FieldSlice {
            offset: offset as u16,
            len: len as u16,
            is_null: false,
        });
        offset += len;
    }

    out
}

fn push_len_bytes(field: &IndexField, len: usize, read_order: &mut Vec<u8>) {
    if field.is_big() && len >= LEN_2BYTE_FLAG as usize {
        read_order.push(LEN_2BYTE_FLAG | (len >> 8) as u8);
        read_order.push(len as u8);
    } else {
        read_order.push(len as u8);
    }
}

/// Serialize one record. Returns the encoded bytes and the origin offset
/// within them; the first three bytes below the origin (next + status) are
/// zeroed except for the ordinary status.
pub fn encode(index: &IndexDef, values: &[Option<&[u8]>]) -> Result<(Vec<u8>, usize)> {
    ensure!(
        values.len() == index.fields.len(),
        "value count {} does not match field count {}",
        values.len(),
        index.fields.len()
    );

    let null_byte_count = index.n_core_null_bytes();
    let mut null_bytes = vec![0u8; null_byte_count];
    let mut len_read_order: Vec<u8> = Vec::new();
    let mut data: Vec<u8> = Vec::new();
    let mut null_i = 0usize;

    for (field, value) in index.fields.iter().zip(values) {
        if field.nullable {
            if value.is_none() {
                null_bytes[null_i / 8] |= 1 << (null_i % 8);
            }
            null_i += 1;
        }

        match value {
            None => ensure!(field.nullable, "NULL in non-nullable column"),
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
                        v.len() <= field.max_len as usize && v.len() <= LEN_MAX,
                        "column value of {} bytes exceeds maximum {}",
                        v.len(),
                        field.max_len
                    );
                    push_len_bytes(field, v.len(), &mut len_read_order);
                }
                data.extend_from_slice(v);
            }
        }
    }

    let mut buf =
        Vec::with_capacity(len_read_order.len() + null_byte_count + REC_COMPACT_EXTRA_BYTES + data.len());
    buf.extend(len_read_order.iter().rev());
    buf.extend(null_bytes.iter().rev());
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
            RecFormat::Compact,
            vec![
                IndexField::fixed(4),
                IndexField::variable_nullable(300),
                IndexField::variable(16),
            ],
            3,
        )
    }

    #[test]
    fn test_offsets_roundtrip() {
        let index = index();
        let (buf, origin) =
            encode(&index, &[Some(b"aaaa"), Some(b"bb"), Some(b"c")]).unwrap();
        let rec = unsafe { buf.as_ptr().add(origin) };
        let offs = unsafe { offsets(rec, &index) };

        assert_eq!(offs.len(), 3);
        assert_eq!((offs[0].offset, offs[0].len), (0, 4));
        assert_eq!((offs[1].offset, offs[1].len), (4, 2));
        assert_eq!((offs[2].offset, offs[2].len), (6, 1));
        assert_eq!(&buf[origin..origin + 7], b"aaaabbc");
    }

    #[test]
    fn test_null_contributes_nothing() {
        let index = index();
        let (buf, origin) = encode(&index, &[Some(b"aaaa"), None, Some(b"c")]).unwrap();
        let rec = unsafe { buf.as_ptr().add(origin) };
        let offs = unsafe { offsets(rec, &index) };

        assert!(offs[1].is_null);
        assert_eq!((offs[2].offset, offs[2].len), (4, 1));
    }

    #[test]
    fn test_big_column_two_byte_length() {
        let index = index();
        let long = vec![0x42u8; 200];
        let (buf, origin) =
            encode(&index, &[Some(b"aaaa"), Some(&long), Some(b"c")]).unwrap();
        let rec = unsafe { buf.as_ptr().add(origin) };
        let offs = unsafe { offsets(rec, &index) };

        assert_eq!(offs[1].len, 200);
        assert_eq!(offs[2].offset, 204);
    }

    #[test]
    fn test_prefix_len_partial_field() {
        let index = index();
        let (buf, origin) =
            encode(&index, &[Some(b"aaaa"), Some(b"bbbbbb"), Some(b"c")]).unwrap();
        let rec = unsafe { buf.as_ptr().add(origin) };

        assert_eq!(unsafe { prefix_len(rec, &index, 1, 0) }, 4);
        assert_eq!(unsafe { prefix_len(rec, &index, 1, 2) }, 6);
        // Requesting more bytes than the field holds is capped at its length.
        assert_eq!(unsafe { prefix_len(rec, &index, 1, 100) }, 10);
        assert_eq!(unsafe { prefix_len(rec, &index, 2, 0) }, 10);
    }

    #[test]
    fn test_prefix_len_null_partial_field_truncates() {
        let index = index();
        let (buf, origin) = encode(&index, &[Some(b"aaaa"), None, Some(b"c")]).unwrap();
        let rec = unsafe { buf.as_ptr().add(origin) };

        // The NULL second field ends the prefix after the first field.
        assert_eq!(unsafe { prefix_len(rec, &index, 1, 3) }, 4);
    }
}
