//! Physical record layout.
//!
//! A record is addressed by its *origin*: the position where the field data
//! starts. The header grows downward from the origin:
//!
//! ```text
//!   origin-1          info byte
//!   origin-3..=origin-2   next-record origin (u16 LE, 0 = none)
//!   compact: NULL bitmap, then length bytes in reverse column order
//!   legacy:  field-end offset array (1- or 2-byte entries)
//! ```
//!
//! In the compact format NULL columns occupy no data and no length bytes.
//! In the legacy format NULL fixed-length columns occupy their full length,
//! zero filled, and carry a NULL flag in their offset entry; NULL
//! variable-length columns occupy zero bytes.
//!
//! The accessors below take raw record addresses. The caller is responsible
//! for the frame staying resident for the duration of the returned borrow;
//! within the engine this is guaranteed by the page latch or by the
//! partition latch plus invariant I1.

use crate::dict::{Index, RowFormat, Tuple};

use super::RecPtr;

/// Fixed extra bytes of every record: info byte + next pointer.
pub(crate) const REC_N_EXTRA_BYTES: usize = 3;

/// Record is delete-marked.
pub(crate) const REC_INFO_DELETED: u8 = 0x01;
/// Record carries the minimum-record flag (hidden metadata record).
pub(crate) const REC_INFO_MIN_REC: u8 = 0x02;
/// Legacy record uses 1-byte field-end offsets.
pub(crate) const REC_INFO_SHORT_OFFS: u8 = 0x04;
/// Page infimum sentinel.
pub(crate) const REC_INFO_INFIMUM: u8 = 0x10;
/// Page supremum sentinel.
pub(crate) const REC_INFO_SUPREMUM: u8 = 0x20;

/// Zero padding substituted for NULL fixed-length columns in legacy folds.
pub(crate) static FIELD_REF_ZERO: [u8; crate::constants::MAX_FIXED_LEN] =
    [0; crate::constants::MAX_FIXED_LEN];

#[inline]
pub(crate) fn rec_info_byte(rec: RecPtr) -> u8 {
    // SAFETY: every record has at least REC_N_EXTRA_BYTES of header.
    unsafe { *rec.as_ptr().sub(1) }
}

#[inline]
pub(crate) fn rec_is_infimum(rec: RecPtr) -> bool {
    rec_info_byte(rec) & REC_INFO_INFIMUM != 0
}

#[inline]
pub(crate) fn rec_is_supremum(rec: RecPtr) -> bool {
    rec_info_byte(rec) & REC_INFO_SUPREMUM != 0
}

#[inline]
pub(crate) fn rec_is_user_rec(rec: RecPtr) -> bool {
    rec_info_byte(rec) & (REC_INFO_INFIMUM | REC_INFO_SUPREMUM) == 0
}

#[inline]
pub(crate) fn rec_is_metadata(rec: RecPtr) -> bool {
    rec_info_byte(rec) & REC_INFO_MIN_REC != 0 && rec_is_user_rec(rec)
}

#[inline]
pub(crate) fn rec_is_deleted(rec: RecPtr) -> bool {
    rec_info_byte(rec) & REC_INFO_DELETED != 0
}

#[inline]
pub(crate) fn rec_next_offset(rec: RecPtr) -> u16 {
    // SAFETY: the next pointer lives at origin-3..=origin-2.
    unsafe {
        let p = rec.as_ptr().sub(3);
        u16::from_le_bytes([*p, *p.add(1)])
    }
}

#[inline]
pub(crate) fn rec_set_next_offset(rec: RecPtr, next: u16) {
    let bytes = next.to_le_bytes();
    // SAFETY: as above; the caller holds the page exclusively.
    unsafe {
        let p = rec.as_ptr().sub(3) as *mut u8;
        *p = bytes[0];
        *p.add(1) = bytes[1];
    }
}

/// Read a field of a record. `None` means SQL NULL.
///
/// The returned slice borrows from the page frame; see the module comment
/// for the residency contract.
pub(crate) fn rec_get_field<'a>(index: &Index, rec: RecPtr, target: usize) -> Option<&'a [u8]> {
    debug_assert!(target < index.fields().len());
    match index.format() {
        RowFormat::Compact => rec_get_field_compact(index, rec, target),
        RowFormat::Legacy => rec_get_field_legacy(index, rec, target),
    }
}

fn rec_get_field_compact<'a>(index: &Index, rec: RecPtr, target: usize) -> Option<&'a [u8]> {
    let n_nullable = index.fields().iter().filter(|f| f.nullable).count();
    let null_bytes = n_nullable.div_ceil(8);
    // SAFETY: header layout per the module comment; the encoder wrote
    // exactly this many bitmap and length bytes.
    unsafe {
        let origin = rec.as_ptr();
        let mut nulls = origin.sub(REC_N_EXTRA_BYTES + 1);
        let mut lens = origin.sub(REC_N_EXTRA_BYTES + null_bytes + 1);
        let mut null_mask = 1u8;
        let mut data_off = 0usize;

        for (i, field) in index.fields().iter().enumerate().take(target + 1) {
            let mut is_null = false;
            if field.nullable {
                if null_mask == 0 {
                    null_mask = 1;
                    nulls = nulls.sub(1);
                }
                is_null = *nulls & null_mask != 0;
                null_mask <<= 1;
            }

            let len = if is_null {
                0
            } else if let Some(fixed) = field.fixed_len {
                fixed as usize
            } else {
                let mut l = *lens as usize;
                lens = lens.sub(1);
                if l & 0x80 != 0 && field.is_big() {
                    l = ((l << 8) | *lens as usize) & 0x3fff;
                    lens = lens.sub(1);
                }
                l
            };

            if i == target {
                return if is_null {
                    None
                } else {
                    Some(std::slice::from_raw_parts(origin.add(data_off), len))
                };
            }
            data_off += len;
        }
    }
    unreachable!("field index within take(target + 1)")
}

/// Legacy field-end entry: (cumulative end offset, NULL flag).
fn legacy_entry(rec: RecPtr, i: usize) -> (usize, bool) {
    let short = rec_info_byte(rec) & REC_INFO_SHORT_OFFS != 0;
    // SAFETY: entry i lives at origin - REC_N_EXTRA_BYTES - (i+1)*esz.
    unsafe {
        let origin = rec.as_ptr();
        if short {
            let b = *origin.sub(REC_N_EXTRA_BYTES + i + 1);
            ((b & 0x7f) as usize, b & 0x80 != 0)
        } else {
            let p = origin.sub(REC_N_EXTRA_BYTES + 2 * (i + 1));
            let v = u16::from_le_bytes([*p, *p.add(1)]);
            ((v & 0x7fff) as usize, v & 0x8000 != 0)
        }
    }
}

fn rec_get_field_legacy<'a>(_index: &Index, rec: RecPtr, target: usize) -> Option<&'a [u8]> {
    let (end, is_null) = legacy_entry(rec, target);
    if is_null {
        return None;
    }
    let start = if target == 0 {
        0
    } else {
        legacy_entry(rec, target - 1).0
    };
    debug_assert!(end >= start);
    // SAFETY: field data lies within the record's data area.
    unsafe {
        Some(std::slice::from_raw_parts(
            rec.as_ptr().add(start),
            end - start,
        ))
    }
}

/// Stored data length of one legacy field for a tuple value.
fn legacy_field_len(index: &Index, tuple: &Tuple, i: usize) -> usize {
    let field = &index.fields()[i];
    match tuple.field(i) {
        Some(v) => v.len(),
        None => field.fixed_len.map(|l| l as usize).unwrap_or(0),
    }
}

/// Byte sizes of a record encoding the given tuple: `(header, data)`.
pub(crate) fn encoded_size(index: &Index, tuple: &Tuple) -> (usize, usize) {
    assert_eq!(tuple.n_fields(), index.fields().len());
    match index.format() {
        RowFormat::Compact => {
            let n_nullable = index.fields().iter().filter(|f| f.nullable).count();
            let null_bytes = n_nullable.div_ceil(8);
            let mut len_bytes = 0usize;
            let mut data = 0usize;
            for (i, field) in index.fields().iter().enumerate() {
                match tuple.field(i) {
                    None => {
                        debug_assert!(field.nullable);
                    }
                    Some(v) => {
                        if let Some(fixed) = field.fixed_len {
                            debug_assert_eq!(v.len(), fixed as usize);
                        } else {
                            len_bytes += if field.is_big() && v.len() > 127 { 2 } else { 1 };
                        }
                        data += v.len();
                    }
                }
            }
            (REC_N_EXTRA_BYTES + null_bytes + len_bytes, data)
        }
        RowFormat::Legacy => {
            let n_f = index.fields().len();
            let data: usize = (0..n_f).map(|i| legacy_field_len(index, tuple, i)).sum();
            let esz = if data <= 0x7f { 1 } else { 2 };
            (REC_N_EXTRA_BYTES + n_f * esz, data)
        }
    }
}

/// Encode `tuple` as a record whose origin is `frame + origin`.
///
/// The caller has reserved `encoded_size` bytes ending at
/// `origin + data_len` and holds the page exclusively.
pub(crate) unsafe fn encode_into(
    frame: *mut u8,
    origin: usize,
    index: &Index,
    tuple: &Tuple,
    info_bits: u8,
) {
    match index.format() {
        RowFormat::Compact => unsafe {
            encode_compact(frame, origin, index, tuple, info_bits)
        },
        RowFormat::Legacy => unsafe { encode_legacy(frame, origin, index, tuple, info_bits) },
    }
}

unsafe fn encode_compact(frame: *mut u8, origin: usize, index: &Index, tuple: &Tuple, info: u8) {
    let n_nullable = index.fields().iter().filter(|f| f.nullable).count();
    let null_bytes = n_nullable.div_ceil(8);
    // SAFETY: the caller reserved the header and data areas.
    unsafe {
        *frame.add(origin - 1) = info;

        // Zero the bitmap, then set bits while walking the columns the same
        // way the decoder does.
        for b in 0..null_bytes {
            *frame.add(origin - REC_N_EXTRA_BYTES - 1 - b) = 0;
        }

        let mut null_pos = origin - REC_N_EXTRA_BYTES - 1;
        let mut null_mask = 1u8;
        let mut lens_pos = origin - REC_N_EXTRA_BYTES - null_bytes - 1;
        let mut data_pos = origin;

        for (i, field) in index.fields().iter().enumerate() {
            let value = tuple.field(i);
            if field.nullable {
                if null_mask == 0 {
                    null_mask = 1;
                    null_pos -= 1;
                }
                if value.is_none() {
                    *frame.add(null_pos) |= null_mask;
                }
                null_mask <<= 1;
            }
            let Some(v) = value else {
                debug_assert!(field.nullable);
                continue;
            };
            if field.fixed_len.is_none() {
                if field.is_big() && v.len() > 127 {
                    *frame.add(lens_pos) = 0x80 | (v.len() >> 8) as u8;
                    lens_pos -= 1;
                    *frame.add(lens_pos) = (v.len() & 0xff) as u8;
                    lens_pos -= 1;
                } else {
                    *frame.add(lens_pos) = v.len() as u8;
                    lens_pos -= 1;
                }
            }
            std::ptr::copy_nonoverlapping(v.as_ptr(), frame.add(data_pos), v.len());
            data_pos += v.len();
        }
    }
}

unsafe fn encode_legacy(frame: *mut u8, origin: usize, index: &Index, tuple: &Tuple, info: u8) {
    let n_f = index.fields().len();
    let data_total: usize = (0..n_f).map(|i| legacy_field_len(index, tuple, i)).sum();
    let short = data_total <= 0x7f;
    // SAFETY: the caller reserved the header and data areas.
    unsafe {
        *frame.add(origin - 1) = info | if short { REC_INFO_SHORT_OFFS } else { 0 };

        let mut end = 0usize;
        let mut data_pos = origin;
        for i in 0..n_f {
            let len = legacy_field_len(index, tuple, i);
            let is_null = tuple.field(i).is_none();
            match tuple.field(i) {
                Some(v) => {
                    std::ptr::copy_nonoverlapping(v.as_ptr(), frame.add(data_pos), v.len());
                }
                None => {
                    std::ptr::write_bytes(frame.add(data_pos), 0, len);
                }
            }
            data_pos += len;
            end += len;

            if short {
                let mut b = end as u8;
                if is_null {
                    b |= 0x80;
                }
                *frame.add(origin - REC_N_EXTRA_BYTES - i - 1) = b;
            } else {
                let mut v = end as u16;
                if is_null {
                    v |= 0x8000;
                }
                let bytes = v.to_le_bytes();
                let p = origin - REC_N_EXTRA_BYTES - 2 * (i + 1);
                *frame.add(p) = bytes[0];
                *frame.add(p + 1) = bytes[1];
            }
        }
    }
}

/// Compare a search tuple against a record, reporting the match depth.
///
/// Returns `(cmp, matched_fields, matched_bytes)`: `cmp` is negative, zero
/// or positive as the tuple sorts before, equal to or after the record;
/// `matched_fields` counts fully matched leading fields and
/// `matched_bytes` the matched bytes in the first field that differs.
/// At most `min(tuple fields, n_uniq)` fields are compared; NULL sorts
/// before every value.
pub(crate) fn cmp_tuple_rec_with_match(
    index: &Index,
    tuple: &Tuple,
    rec: RecPtr,
) -> (i32, u16, u16) {
    debug_assert!(rec_is_user_rec(rec));
    let n_cmp = tuple.n_fields().min(index.n_uniq() as usize);
    let mut matched_fields = 0u16;

    for i in 0..n_cmp {
        let t = tuple.field(i);
        let r = rec_get_field(index, rec, i);
        match (t, r) {
            (None, None) => {
                matched_fields += 1;
            }
            (None, Some(_)) => return (-1, matched_fields, 0),
            (Some(_), None) => return (1, matched_fields, 0),
            (Some(tb), Some(rb)) => {
                let common = tb.len().min(rb.len());
                let mut j = 0usize;
                while j < common && tb[j] == rb[j] {
                    j += 1;
                }
                if j < common {
                    let ord = if tb[j] < rb[j] { -1 } else { 1 };
                    return (ord, matched_fields, j as u16);
                }
                if tb.len() == rb.len() {
                    matched_fields += 1;
                } else {
                    let ord = if tb.len() < rb.len() { -1 } else { 1 };
                    return (ord, matched_fields, j as u16);
                }
            }
        }
    }
    (0, matched_fields, 0)
}
