//! Logical tuples: the lookup-side counterpart of a physical record.

use smallvec::SmallVec;

use super::REC_INFO_MIN_REC;

/// One logical column value; `None` is SQL NULL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleField {
    pub data: Option<Vec<u8>>,
}

/// A search tuple: a (possibly partial) key in index column order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple {
    pub fields: SmallVec<[TupleField; 8]>,
    pub info_bits: u8,
}

impl Tuple {
    pub fn from_values(values: &[Option<&[u8]>]) -> Self {
        Self {
            fields: values
                .iter()
                .map(|v| TupleField {
                    data: v.map(|b| b.to_vec()),
                })
                .collect(),
            info_bits: 0,
        }
    }

    /// The sentinel tuple that compares below every user record.
    pub fn min_rec(values: &[Option<&[u8]>]) -> Self {
        let mut t = Self::from_values(values);
        t.info_bits |= REC_INFO_MIN_REC;
        t
    }

    pub fn n_fields(&self) -> usize {
        self.fields.len()
    }

    pub fn is_min_rec(&self) -> bool {
        self.info_bits & REC_INFO_MIN_REC != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_rec_flag() {
        let plain = Tuple::from_values(&[Some(b"a")]);
        assert!(!plain.is_min_rec());

        let min = Tuple::min_rec(&[Some(b"a")]);
        assert!(min.is_min_rec());
        assert_eq!(min.n_fields(), 1);
    }

    #[test]
    fn test_null_field() {
        let t = Tuple::from_values(&[Some(b"a"), None]);
        assert_eq!(t.fields[0].data.as_deref(), Some(b"a".as_slice()));
        assert!(t.fields[1].data.is_none());
    }
}
