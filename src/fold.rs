//! Fingerprints of key prefixes.
//!
//! A fold is a 32-bit CRC-32C over the bytes of a key prefix, chained
//! field by field and seeded with a stable transform of the index id. The
//! load-bearing law: [`fold_record`] over a record equals [`fold_tuple`]
//! over any tuple that compares equal to it, for every prefix shape and
//! both row formats. That equivalence is the only reason hash lookups find
//! anything.
//!
//! NULL columns contribute nothing in the compact format. In the legacy
//! format a NULL fixed-length column contributes its zero-filled fixed
//! length (the bytes the record actually stores) and a NULL
//! variable-length column contributes nothing. Folds are not injective;
//! every consumer validates against the live page.

use crc::{CRC_32_ISCSI, Crc};

use crate::dict::{Index, IndexId, RowFormat, Tuple};
use crate::page::RecPtr;
use crate::page::record::{FIELD_REF_ZERO, rec_get_field};
use crate::utility::murmur3_finalize;

const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Chain one CRC-32C step.
#[inline]
fn crc32c(seed: u32, data: &[u8]) -> u32 {
    let mut digest = CRC32C.digest_with_initial(seed);
    digest.update(data);
    digest.finalize()
}

/// Stable 32-bit fold seed of an index
#[inline]
pub fn fold_seed(index_id: IndexId) -> u32 {
    murmur3_finalize(index_id.0) as u32
}

/// Number of complete or incomplete fields in a prefix shape
#[inline]
pub(crate) fn prefix_field_count(n_fields: u16, n_bytes: u16) -> usize {
    n_fields as usize + usize::from(n_bytes > 0)
}

/// Fold logical field values. `values[i]` is the i-th prefix field, `None`
/// meaning SQL NULL. Empty contributions are skipped on both the record
/// and the tuple side, keeping the chained folds identical.
fn fold_fields(index: &Index, values: &[Option<&[u8]>], n_fields: u16, n_bytes: u16) -> u32 {
    let legacy = index.format() == RowFormat::Legacy;
    let mut fold = fold_seed(index.id());

    for i in 0..n_fields as usize {
        match values[i] {
            Some(data) if !data.is_empty() => fold = crc32c(fold, data),
            Some(_) => {}
            None if legacy => {
                let len = index.fields()[i].fixed_len.unwrap_or(0) as usize;
                if len > 0 {
                    fold = crc32c(fold, &FIELD_REF_ZERO[..len]);
                }
            }
            None => {}
        }
    }

    if n_bytes > 0 {
        let i = n_fields as usize;
        match values[i] {
            Some(data) => {
                let take = (n_bytes as usize).min(data.len());
                if take > 0 {
                    fold = crc32c(fold, &data[..take]);
                }
            }
            None if legacy => {
                let len = index.fields()[i].fixed_len.unwrap_or(0) as usize;
                let take = (n_bytes as usize).min(len);
                if take > 0 {
                    fold = crc32c(fold, &FIELD_REF_ZERO[..take]);
                }
            }
            None => {}
        }
    }

    fold
}

/// Fold the prefix of a physical record.
///
/// The record must be a user record on a resident leaf page; the caller
/// holds a latch that keeps the page bytes stable.
pub fn fold_record(index: &Index, rec: RecPtr, n_fields: u16, n_bytes: u16) -> u32 {
    let n_f = prefix_field_count(n_fields, n_bytes);
    debug_assert!(n_f > 0);
    debug_assert!(n_f <= index.fields().len());

    let values: Vec<Option<&[u8]>> = (0..n_f).map(|i| rec_get_field(index, rec, i)).collect();
    fold_fields(index, &values, n_fields, n_bytes)
}

/// Fold the prefix of a logical tuple.
///
/// The tuple must have at least `n_fields + (n_bytes > 0)` fields.
pub fn fold_tuple(index: &Index, tuple: &Tuple, n_fields: u16, n_bytes: u16) -> u32 {
    let n_f = prefix_field_count(n_fields, n_bytes);
    debug_assert!(n_f > 0);
    debug_assert!(n_f <= tuple.n_fields());

    let values: Vec<Option<&[u8]>> = (0..n_f).map(|i| tuple.field(i)).collect();
    fold_fields(index, &values, n_fields, n_bytes)
}
