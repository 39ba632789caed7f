//! # Record-Prefix Fingerprints
//!
//! A fold is the CRC-32C of a record prefix, seeded with the identity of the
//! owning index so that equal prefixes in different indexes do not collide
//! structurally. The prefix is `(n_fields, n_bytes)`: that many complete
//! leading columns plus that many bytes of the next one.
//!
//! ## Parameter Word
//!
//! Prefix parameters travel as one packed word:
//!
//! ```text
//! bit 31      LEFT_SIDE   which end of an equal-fold run is representative
//! bits 16-30  n_bytes     extra bytes of the partial column
//! bits 0-15   n_fields    complete leading columns
//! ```
//!
//! ## Physical / Logical Agreement
//!
//! `rec_fold` (over a physical record) and `tuple_fold` (over a logical
//! tuple) MUST agree for equal prefix content under equal parameters: a
//! tuple lookup has to hit the entry built from the record. The compact
//! format stores the examined prefix contiguously with NULLs contributing
//! nothing, so the record side hashes one slice; the redundant format
//! zero-fills NULLs to `sql_null_size`, and the tuple side feeds the same
//! zeros. Both sides push their bytes through one incremental digest, so the
//! chunking cannot diverge.
//!
//! There is deliberately no dynamic dispatch here: the two record walks are
//! separate monomorphic functions selected by the index format bit.

use crc::{Crc, CRC_32_ISCSI};

use crate::index::IndexDef;
use crate::records::{self, compact, redundant, RecFormat, Tuple};

/// Top bit of the parameter word: hash the leftmost record of an equal-fold
/// run (set) or the run's successor (clear).
pub const LEFT_SIDE: u32 = 1 << 31;

const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Number of complete leading columns in a parameter word.
#[inline]
pub fn params_n_complete_fields(n_bytes_fields: u32) -> usize {
    n_bytes_fields as u16 as usize
}

/// Extra bytes of the partial column in a parameter word.
#[inline]
pub fn params_n_bytes(n_bytes_fields: u32) -> usize {
    ((n_bytes_fields & !LEFT_SIDE) >> 16) as usize
}

/// Number of accessed columns, the partial one included.
#[inline]
pub fn params_n_fields(n_bytes_fields: u32) -> usize {
    debug_assert_eq!(n_bytes_fields & LEFT_SIDE, 0);
    params_n_complete_fields(n_bytes_fields) + (n_bytes_fields >= 1 << 16) as usize
}

/// Multiplicative pair-fold of an index identity down to the CRC seed.
pub fn fold_index_id(id: u64) -> u32 {
    const MASK1: u64 = 1_463_735_687;
    const MASK2: u64 = 1_653_893_711;
    let n1 = id >> 32;
    let n2 = id & 0xffff_ffff;
    ((((n1 ^ n2 ^ MASK2) << 8).wrapping_add(n1) ^ MASK1).wrapping_add(n2)) as u32
}

/// Fingerprint a compact-format record prefix.
///
/// # Safety
/// `rec` must be the origin of a live user record encoded under `index`,
/// and `index.format` must be compact.
pub unsafe fn rec_fold_compact(rec: *const u8, index: &IndexDef, n_bytes_fields: u32) -> u32 {
    debug_assert_eq!(index.format, RecFormat::Compact);
    debug_assert!(records::rec_is_user(rec) && !records::rec_is_metadata(rec));
    let n = compact::prefix_len(
        rec,
        index,
        params_n_complete_fields(n_bytes_fields),
        params_n_bytes(n_bytes_fields),
    );
    fold_bytes(index.id, std::slice::from_raw_parts(rec, n))
}

/// Fingerprint a redundant-format record prefix.
///
/// # Safety
/// `rec` must be the origin of a live user record encoded under `index`,
/// and `index.format` must be redundant.
pub unsafe fn rec_fold_redundant(rec: *const u8, index: &IndexDef, n_bytes_fields: u32) -> u32 {
    debug_assert_eq!(index.format, RecFormat::Redundant);
    debug_assert!(records::rec_is_user(rec) && !records::rec_is_metadata(rec));
    let n = redundant::prefix_len(
        rec,
        index,
        params_n_complete_fields(n_bytes_fields),
        params_n_bytes(n_bytes_fields),
    );
    fold_bytes(index.id, std::slice::from_raw_parts(rec, n))
}

/// Format-dispatching record fingerprint.
///
/// # Safety
/// `rec` must be the origin of a live user record encoded under `index`.
#[inline]
pub unsafe fn rec_fold(rec: *const u8, index: &IndexDef, n_bytes_fields: u32) -> u32 {
    debug_assert_eq!(n_bytes_fields & LEFT_SIDE, 0);
    debug_assert!(params_n_fields(n_bytes_fields) >= 1);
    debug_assert!(params_n_fields(n_bytes_fields) <= index.n_core_fields());

    if index.not_redundant() {
        rec_fold_compact(rec, index, n_bytes_fields)
    } else {
        rec_fold_redundant(rec, index, n_bytes_fields)
    }
}

fn fold_bytes(index_id: u64, bytes: &[u8]) -> u32 {
    let mut digest = CRC32C.digest();
    digest.update(&fold_index_id(index_id).to_le_bytes());
    digest.update(bytes);
    digest.finalize()
}

/// Fingerprint a logical tuple prefix. Must agree with [`rec_fold`] for
/// equal content under equal parameters.
pub fn tuple_fold(tuple: &Tuple, index: &IndexDef, n_bytes_fields: u32) -> u32 {
    debug_assert_eq!(n_bytes_fields & LEFT_SIDE, 0);
    let comp = index.not_redundant();
    let n_fields = params_n_complete_fields(n_bytes_fields);
    let n_bytes = params_n_bytes(n_bytes_fields);
    debug_assert!(tuple.n_fields() >= params_n_fields(n_bytes_fields));

    const ZEROS: [u8; 32] = [0; 32];
    let mut digest = CRC32C.digest();
    digest.update(&fold_index_id(index.id).to_le_bytes());

    let mut feed_zeros = |digest: &mut crc::Digest<u32>, mut n: usize| {
        while n > 0 {
            let take = n.min(ZEROS.len());
            digest.update(&ZEROS[..take]);
            n -= take;
        }
    };

    for i in 0..n_fields {
        match tuple.fields[i].data.as_deref() {
            Some(data) => digest.update(data),
            // Compact NULLs contribute nothing; redundant NULLs are stored
            // zero-filled and must be hashed the same way.
            None if comp => {}
            None => feed_zeros(&mut digest, index.fields[i].sql_null_size as usize),
        }
    }

    if n_bytes > 0 {
        match tuple.fields[n_fields].data.as_deref() {
            Some(data) => digest.update(&data[..n_bytes.min(data.len())]),
            // A NULL partial column ends a compact fingerprint right here.
            None if comp => return digest.finalize(),
            None => feed_zeros(
                &mut digest,
                n_bytes.min(index.fields[n_fields].sql_null_size as usize),
            ),
        }
    }

    digest.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{IndexField, RecFormat};
    use std::sync::Arc;

    fn sample_index(id: u64, format: RecFormat) -> Arc<IndexDef> {
        IndexDef::new(
            id,
            format,
            vec![
                IndexField::fixed(4),
                IndexField::fixed_nullable(6),
                IndexField::variable(40),
            ],
            3,
        )
    }

    fn encode(index: &IndexDef, values: &[Option<&[u8]>]) -> (Vec<u8>, usize) {
        match index.format {
            RecFormat::Compact => compact::encode(index, values).unwrap(),
            RecFormat::Redundant => redundant::encode(index, values).unwrap(),
        }
    }

    /// Physical and logical folds must agree over every prefix length.
    #[test]
    fn test_fold_agreement_all_prefixes() {
        let values: &[Option<&[u8]>] = &[Some(b"key1"), Some(b"abcdef"), Some(b"payload")];
        for format in [RecFormat::Compact, RecFormat::Redundant] {
            let index = sample_index(11, format);
            let (buf, origin) = encode(&index, values);
            let rec = unsafe { buf.as_ptr().add(origin) };
            let tuple = Tuple::from_values(values);

            for n_fields in 0..=2u32 {
                for n_bytes in 0..=8u32 {
                    if n_fields == 0 && n_bytes == 0 {
                        continue;
                    }
                    let params = n_fields | (n_bytes << 16);
                    let from_rec = unsafe { rec_fold(rec, &index, params) };
                    let from_tuple = tuple_fold(&tuple, &index, params);
                    assert_eq!(
                        from_rec, from_tuple,
                        "fold disagreement, format={format:?} fields={n_fields} bytes={n_bytes}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_fold_agreement_with_nulls() {
        let values: &[Option<&[u8]>] = &[Some(b"key1"), None, Some(b"payload")];
        for format in [RecFormat::Compact, RecFormat::Redundant] {
            let index = sample_index(11, format);
            let (buf, origin) = encode(&index, values);
            let rec = unsafe { buf.as_ptr().add(origin) };
            let tuple = Tuple::from_values(values);

            for (n_fields, n_bytes) in [(1u32, 0u32), (1, 3), (2, 0), (2, 4)] {
                let params = n_fields | (n_bytes << 16);
                assert_eq!(
                    unsafe { rec_fold(rec, &index, params) },
                    tuple_fold(&tuple, &index, params),
                    "format={format:?} fields={n_fields} bytes={n_bytes}"
                );
            }
        }
    }

    #[test]
    fn test_fold_depends_on_index_id() {
        let a = sample_index(1, RecFormat::Compact);
        let b = sample_index(2, RecFormat::Compact);
        let tuple = Tuple::from_values(&[Some(b"key1")]);
        assert_ne!(tuple_fold(&tuple, &a, 1), tuple_fold(&tuple, &b, 1));
    }

    #[test]
    fn test_fold_differs_by_prefix_length() {
        let index = sample_index(1, RecFormat::Compact);
        let tuple = Tuple::from_values(&[Some(b"key1"), Some(b"abcdef")]);
        assert_ne!(
            tuple_fold(&tuple, &index, 1),
            tuple_fold(&tuple, &index, 2),
        );
        assert_ne!(
            tuple_fold(&tuple, &index, 1 | (1 << 16)),
            tuple_fold(&tuple, &index, 1 | (2 << 16)),
        );
    }

    #[test]
    fn test_equal_prefix_same_fold() {
        let index = sample_index(1, RecFormat::Compact);
        let a = Tuple::from_values(&[Some(b"key1"), Some(b"XXXXXX")]);
        let b = Tuple::from_values(&[Some(b"key1"), Some(b"YYYYYY")]);
        assert_eq!(tuple_fold(&a, &index, 1), tuple_fold(&b, &index, 1));
    }

    #[test]
    fn test_params_word_helpers() {
        let w = LEFT_SIDE | (3 << 16) | 2;
        assert!(w & LEFT_SIDE != 0);
        let stripped = w & !LEFT_SIDE;
        assert_eq!(params_n_complete_fields(stripped), 2);
        assert_eq!(params_n_bytes(stripped), 3);
        assert_eq!(params_n_fields(stripped), 3);
        assert_eq!(params_n_fields(2), 2);
    }
}
