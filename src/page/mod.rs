//! B-tree leaf page format.
//!
//! A page is one buffer-pool frame: a fixed header, the infimum and
//! supremum sentinel records, and user records bump-allocated from the heap
//! and singly linked in key order between the sentinels. Record addresses
//! inside the frame are what the adaptive hash index stores; a record
//! address can be mapped back to its page with mask arithmetic because
//! frames are page aligned.

pub(crate) mod cursor;
pub(crate) mod record;

use crate::constants::PAGE_SIZE;
use crate::dict::{Index, IndexId, Tuple};

pub use cursor::{PageSearchResult, SearchMode, search_on_page};

use record::{
    REC_INFO_INFIMUM, REC_INFO_SUPREMUM, cmp_tuple_rec_with_match, encode_into, encoded_size,
    rec_is_metadata, rec_is_supremum, rec_is_user_rec, rec_next_offset, rec_set_next_offset,
};

/// Address of a record inside a buffer-pool page frame.
///
/// Valid while the owning page is resident and not being freed. The owning
/// block is derived from the address itself via the buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecPtr(pub(crate) *const u8);

impl RecPtr {
    /// Raw pointer to the record origin
    #[inline]
    pub fn as_ptr(self) -> *const u8 {
        self.0
    }

    #[inline]
    pub(crate) fn addr(self) -> usize {
        self.0 as usize
    }
}

// Safety: a RecPtr is a plain address; all access to the bytes behind it is
// synchronized by page latches (or the partition latch plus invariant I1).
unsafe impl Send for RecPtr {}
unsafe impl Sync for RecPtr {}

const HDR_INDEX_ID: usize = 0;
const HDR_N_RECS: usize = 8;
const HDR_FLAGS: usize = 10;
const HDR_PREV: usize = 12;
const HDR_NEXT: usize = 16;
const HDR_HEAP_TOP: usize = 20;
const HDR_PAGE_NO: usize = 22;
const PAGE_HEADER_SIZE: usize = 28;

const FLAG_LEAF: u16 = 0x0001;

const NO_SIBLING: u32 = u32::MAX;

const INFIMUM_ORIGIN: usize = PAGE_HEADER_SIZE + record::REC_N_EXTRA_BYTES;
const SUPREMUM_ORIGIN: usize = INFIMUM_ORIGIN + 1 + record::REC_N_EXTRA_BYTES;
const HEAP_START: usize = SUPREMUM_ORIGIN + 1;

/// View of one page frame.
///
/// `Page` is a cheap copyable view; it owns nothing. Mutating methods
/// require that the caller holds the page exclusively (page latch or an
/// otherwise unreachable frame).
#[derive(Clone, Copy)]
pub struct Page {
    frame: *mut u8,
}

impl Page {
    /// Wrap a page frame.
    ///
    /// # Safety
    /// `frame` must point to `PAGE_SIZE` bytes that stay valid for the
    /// lifetime of all values derived from this view.
    pub(crate) unsafe fn from_frame(frame: *mut u8) -> Self {
        debug_assert!(!frame.is_null());
        debug_assert_eq!(frame as usize % PAGE_SIZE, 0);
        Self { frame }
    }

    /// The page containing a record address.
    ///
    /// Frames are `PAGE_SIZE`-aligned, so the page start is the address
    /// rounded down.
    pub fn containing(rec: RecPtr) -> Self {
        let base = rec.addr() & !(PAGE_SIZE - 1);
        Self {
            frame: base as *mut u8,
        }
    }

    /// Base address of the frame
    #[inline]
    pub fn frame_addr(&self) -> *const u8 {
        self.frame
    }

    #[inline]
    fn read_u16(&self, off: usize) -> u16 {
        debug_assert!(off + 2 <= PAGE_SIZE);
        // SAFETY: bounded by PAGE_SIZE.
        unsafe { u16::from_le_bytes([*self.frame.add(off), *self.frame.add(off + 1)]) }
    }

    #[inline]
    fn write_u16(&self, off: usize, v: u16) {
        debug_assert!(off + 2 <= PAGE_SIZE);
        let b = v.to_le_bytes();
        // SAFETY: bounded by PAGE_SIZE; caller holds the page exclusively.
        unsafe {
            *self.frame.add(off) = b[0];
            *self.frame.add(off + 1) = b[1];
        }
    }

    #[inline]
    fn read_u32(&self, off: usize) -> u32 {
        debug_assert!(off + 4 <= PAGE_SIZE);
        let mut b = [0u8; 4];
        // SAFETY: bounded by PAGE_SIZE.
        unsafe {
            std::ptr::copy_nonoverlapping(self.frame.add(off), b.as_mut_ptr(), 4);
        }
        u32::from_le_bytes(b)
    }

    #[inline]
    fn write_u32(&self, off: usize, v: u32) {
        debug_assert!(off + 4 <= PAGE_SIZE);
        // SAFETY: bounded by PAGE_SIZE; caller holds the page exclusively.
        unsafe {
            std::ptr::copy_nonoverlapping(v.to_le_bytes().as_ptr(), self.frame.add(off), 4);
        }
    }

    #[inline]
    fn read_u64(&self, off: usize) -> u64 {
        let mut b = [0u8; 8];
        // SAFETY: bounded by PAGE_SIZE.
        unsafe {
            std::ptr::copy_nonoverlapping(self.frame.add(off), b.as_mut_ptr(), 8);
        }
        u64::from_le_bytes(b)
    }

    /// Format an empty leaf page in the frame.
    pub(crate) fn init(&self, index_id: IndexId, page_no: u32, leaf: bool) {
        // SAFETY: caller holds the frame exclusively.
        unsafe {
            std::ptr::write_bytes(self.frame, 0, HEAP_START);
        }
        self.write_u64(HDR_INDEX_ID, index_id.0);
        self.write_u16(HDR_N_RECS, 0);
        self.write_u16(HDR_FLAGS, if leaf { FLAG_LEAF } else { 0 });
        self.write_u32(HDR_PREV, NO_SIBLING);
        self.write_u32(HDR_NEXT, NO_SIBLING);
        self.write_u16(HDR_HEAP_TOP, HEAP_START as u16);
        self.write_u32(HDR_PAGE_NO, page_no);

        // Sentinels.
        // SAFETY: sentinel offsets lie inside the header area just zeroed.
        unsafe {
            *self.frame.add(INFIMUM_ORIGIN - 1) = REC_INFO_INFIMUM;
            *self.frame.add(SUPREMUM_ORIGIN - 1) = REC_INFO_SUPREMUM;
        }
        rec_set_next_offset(self.infimum(), SUPREMUM_ORIGIN as u16);
        rec_set_next_offset(self.supremum(), 0);
    }

    fn write_u64(&self, off: usize, v: u64) {
        debug_assert!(off + 8 <= PAGE_SIZE);
        // SAFETY: bounded by PAGE_SIZE; caller holds the page exclusively.
        unsafe {
            std::ptr::copy_nonoverlapping(v.to_le_bytes().as_ptr(), self.frame.add(off), 8);
        }
    }

    /// Id of the index this page belongs to
    #[inline]
    pub fn index_id(&self) -> IndexId {
        IndexId(self.read_u64(HDR_INDEX_ID))
    }

    /// Page number
    #[inline]
    pub fn page_no(&self) -> u32 {
        self.read_u32(HDR_PAGE_NO)
    }

    /// Number of user records on the page (including a metadata record)
    #[inline]
    pub fn n_recs(&self) -> u16 {
        self.read_u16(HDR_N_RECS)
    }

    /// Whether this is a leaf page
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.read_u16(HDR_FLAGS) & FLAG_LEAF != 0
    }

    /// Whether the page has a left sibling
    #[inline]
    pub fn has_prev(&self) -> bool {
        self.read_u32(HDR_PREV) != NO_SIBLING
    }

    /// Whether the page has a right sibling
    #[inline]
    pub fn has_next(&self) -> bool {
        self.read_u32(HDR_NEXT) != NO_SIBLING
    }

    /// Set or clear the left sibling
    pub fn set_prev(&self, page_no: Option<u32>) {
        self.write_u32(HDR_PREV, page_no.unwrap_or(NO_SIBLING));
    }

    /// Set or clear the right sibling
    pub fn set_next(&self, page_no: Option<u32>) {
        self.write_u32(HDR_NEXT, page_no.unwrap_or(NO_SIBLING));
    }

    #[inline]
    fn rec_at(&self, origin: usize) -> RecPtr {
        debug_assert!(origin >= INFIMUM_ORIGIN && origin < PAGE_SIZE);
        // SAFETY: origin bounded by PAGE_SIZE.
        RecPtr(unsafe { self.frame.add(origin) })
    }

    #[inline]
    fn offset_of(&self, rec: RecPtr) -> usize {
        let off = rec.addr() - self.frame as usize;
        debug_assert!(off < PAGE_SIZE);
        off
    }

    /// The infimum sentinel
    #[inline]
    pub fn infimum(&self) -> RecPtr {
        self.rec_at(INFIMUM_ORIGIN)
    }

    /// The supremum sentinel
    #[inline]
    pub fn supremum(&self) -> RecPtr {
        self.rec_at(SUPREMUM_ORIGIN)
    }

    /// Successor of a record in key order, `None` past the supremum
    pub fn rec_next(&self, rec: RecPtr) -> Option<RecPtr> {
        let off = rec_next_offset(rec);
        if off == 0 {
            None
        } else {
            Some(self.rec_at(off as usize))
        }
    }

    /// Predecessor of a record, `None` for the infimum.
    ///
    /// Walks the record list from the infimum.
    pub fn rec_prev(&self, rec: RecPtr) -> Option<RecPtr> {
        if rec == self.infimum() {
            return None;
        }
        let mut cur = self.infimum();
        loop {
            let next = self.rec_next(cur)?;
            if next == rec {
                return Some(cur);
            }
            cur = next;
        }
    }

    /// First user record, `None` on an empty page
    pub fn first_user_rec(&self) -> Option<RecPtr> {
        let rec = self.rec_next(self.infimum())?;
        rec_is_user_rec(rec).then_some(rec)
    }

    /// Whether `rec` is this page's infimum or supremum
    #[inline]
    pub fn is_sentinel(&self, rec: RecPtr) -> bool {
        !rec_is_user_rec(rec)
    }

    /// Insert a tuple at its key-ordered position.
    ///
    /// Equal keys are appended after the existing run. Returns `None` when
    /// the page is full.
    pub fn insert_tuple(&self, index: &Index, tuple: &Tuple) -> Option<RecPtr> {
        let mut prev = self.infimum();
        let mut cur = self.rec_next(prev)?;
        while rec_is_user_rec(cur) {
            // The hidden metadata record sorts before every key.
            if !rec_is_metadata(cur) {
                let (cmp, _, _) = cmp_tuple_rec_with_match(index, tuple, cur);
                if cmp < 0 {
                    break;
                }
            }
            prev = cur;
            cur = self.rec_next(cur)?;
        }
        self.insert_after(index, prev, tuple, 0)
    }

    /// Insert the hidden metadata record as the first record of the page.
    pub fn insert_metadata_rec(&self, index: &Index, tuple: &Tuple) -> Option<RecPtr> {
        self.insert_after(index, self.infimum(), tuple, record::REC_INFO_MIN_REC)
    }

    /// Insert a tuple directly after `prev`.
    ///
    /// The caller is responsible for key order. Returns `None` when the
    /// page is full.
    pub fn insert_after(
        &self,
        index: &Index,
        prev: RecPtr,
        tuple: &Tuple,
        info_bits: u8,
    ) -> Option<RecPtr> {
        debug_assert!(!rec_is_supremum(prev));
        let (header, data) = encoded_size(index, tuple);
        let heap_top = self.read_u16(HDR_HEAP_TOP) as usize;
        let origin = heap_top + header;
        if origin + data > PAGE_SIZE {
            return None;
        }

        // SAFETY: the record area [heap_top, origin + data) is unused frame
        // memory; the caller holds the page exclusively.
        unsafe {
            encode_into(self.frame, origin, index, tuple, info_bits);
        }
        let rec = self.rec_at(origin);
        rec_set_next_offset(rec, rec_next_offset(prev));
        rec_set_next_offset(prev, origin as u16);

        self.write_u16(HDR_HEAP_TOP, (origin + data) as u16);
        self.write_u16(HDR_N_RECS, self.n_recs() + 1);
        Some(rec)
    }

    /// Unlink a user record from the page.
    ///
    /// The record's heap space is not reclaimed. Returns whether the record
    /// was found on the page.
    pub fn delete_rec(&self, rec: RecPtr) -> bool {
        debug_assert!(rec_is_user_rec(rec));
        let Some(prev) = self.rec_prev(rec) else {
            return false;
        };
        rec_set_next_offset(prev, rec_next_offset(rec));
        rec_set_next_offset(rec, 0);
        debug_assert!(self.n_recs() > 0);
        self.write_u16(HDR_N_RECS, self.n_recs() - 1);
        true
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("index_id", &self.index_id())
            .field("page_no", &self.page_no())
            .field("n_recs", &self.n_recs())
            .field("leaf", &self.is_leaf())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::PAGE_SIZE;
    use crate::dict::{FieldDef, RowFormat};
    use crate::utility::AlignedBuffer;
    use std::sync::Arc;

    fn frame() -> AlignedBuffer {
        AlignedBuffer::zeroed(PAGE_SIZE, PAGE_SIZE)
    }

    fn index(format: RowFormat) -> Arc<Index> {
        Index::new(
            IndexId(7),
            vec![
                FieldDef::fixed(4, false),
                FieldDef::variable(300, true),
                FieldDef::fixed(2, true),
            ],
            format,
            2,
        )
    }

    fn tuple(a: u32, b: Option<&[u8]>, c: Option<u16>) -> Tuple {
        Tuple::new(vec![
            Some(a.to_be_bytes().to_vec()),
            b.map(|v| v.to_vec()),
            c.map(|v| v.to_be_bytes().to_vec()),
        ])
    }

    fn check_roundtrip(format: RowFormat) {
        let buf = frame();
        let index = index(format);
        let page = unsafe { Page::from_frame(buf.as_mut_ptr()) };
        page.init(index.id(), 1, true);

        let t1 = tuple(1, Some(b"alpha"), Some(10));
        let t2 = tuple(2, None, None);
        let t3 = tuple(3, Some(&[0xAB; 200]), Some(30));

        // Insert out of order; the page keeps key order.
        let r3 = page.insert_tuple(&index, &t3).unwrap();
        let r1 = page.insert_tuple(&index, &t1).unwrap();
        let r2 = page.insert_tuple(&index, &t2).unwrap();
        assert_eq!(page.n_recs(), 3);

        assert_eq!(page.first_user_rec(), Some(r1));
        assert_eq!(page.rec_next(r1), Some(r2));
        assert_eq!(page.rec_next(r2), Some(r3));
        assert_eq!(page.rec_next(r3), Some(page.supremum()));
        assert_eq!(page.rec_prev(r2), Some(r1));

        assert_eq!(
            record::rec_get_field(&index, r1, 0),
            Some(&1u32.to_be_bytes()[..])
        );
        assert_eq!(record::rec_get_field(&index, r1, 1), Some(&b"alpha"[..]));
        assert_eq!(record::rec_get_field(&index, r2, 1), None);
        assert_eq!(record::rec_get_field(&index, r2, 2), None);
        assert_eq!(record::rec_get_field(&index, r3, 1), Some(&[0xAB; 200][..]));

        let (cmp, mf, _) = record::cmp_tuple_rec_with_match(&index, &t2, r2);
        assert_eq!(cmp, 0);
        assert_eq!(mf, 2);

        assert!(page.delete_rec(r2));
        assert_eq!(page.n_recs(), 2);
        assert_eq!(page.rec_next(r1), Some(r3));
    }

    #[test]
    fn test_page_roundtrip_compact() {
        check_roundtrip(RowFormat::Compact);
    }

    #[test]
    fn test_page_roundtrip_legacy() {
        check_roundtrip(RowFormat::Legacy);
    }

    #[test]
    fn test_metadata_record_sorts_first() {
        let buf = frame();
        let index = index(RowFormat::Compact);
        let page = unsafe { Page::from_frame(buf.as_mut_ptr()) };
        page.init(index.id(), 1, true);

        let r1 = page.insert_tuple(&index, &tuple(1, None, None)).unwrap();
        let meta = page
            .insert_metadata_rec(&index, &tuple(0, None, None))
            .unwrap();
        assert!(record::rec_is_metadata(meta));
        assert_eq!(page.first_user_rec(), Some(meta));

        // Regular inserts go after the metadata record.
        let r0 = page.insert_tuple(&index, &tuple(0, None, None)).unwrap();
        assert_eq!(page.rec_next(meta), Some(r0));
        assert_eq!(page.rec_next(r0), Some(r1));
    }

    #[test]
    fn test_page_full_returns_none() {
        let buf = frame();
        let index = index(RowFormat::Compact);
        let page = unsafe { Page::from_frame(buf.as_mut_ptr()) };
        page.init(index.id(), 1, true);

        let big = vec![0x55u8; 255];
        let mut n = 0u32;
        while page
            .insert_tuple(&index, &tuple(n, Some(&big), Some(1)))
            .is_some()
        {
            n += 1;
        }
        assert!(n > 0);
        assert_eq!(page.n_recs() as u32, n);
    }

    #[test]
    fn test_sibling_links() {
        let buf = frame();
        let index = index(RowFormat::Compact);
        let page = unsafe { Page::from_frame(buf.as_mut_ptr()) };
        page.init(index.id(), 1, true);
        assert!(!page.has_prev());
        assert!(!page.has_next());
        page.set_next(Some(2));
        assert!(page.has_next());
        page.set_next(None);
        assert!(!page.has_next());
    }
}
