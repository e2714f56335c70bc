//! Positioning a cursor within one page.
//!
//! Besides the record itself, the search reports how many fields and bytes
//! of the tuple matched the records on either side of the insertion point.
//! Those match depths drive the adaptive hash index heuristic.

use crate::dict::{Index, Tuple};

use super::record::{cmp_tuple_rec_with_match, rec_is_metadata, rec_is_user_rec};
use super::{Page, RecPtr};

/// Search mode of a cursor positioning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Position on the largest record strictly less than the tuple
    L,
    /// Position on the largest record less than or equal to the tuple
    Le,
    /// Position on the smallest record strictly greater than the tuple
    G,
    /// Position on the smallest record greater than or equal to the tuple
    Ge,
}

/// Result of a page-level cursor search
#[derive(Debug, Clone, Copy)]
pub struct PageSearchResult {
    /// The record the cursor is positioned on; may be a page sentinel
    pub rec: RecPtr,
    /// Fields of the tuple matching the record below the insertion point
    pub low_match: u16,
    /// Bytes matched in the first differing field of the low record
    pub low_bytes: u16,
    /// Fields of the tuple matching the record at or above the insertion point
    pub up_match: u16,
    /// Bytes matched in the first differing field of the up record
    pub up_bytes: u16,
}

/// Position a cursor on one leaf page.
///
/// The insertion point splits the page into records that sort below the
/// tuple and records at or above it; `low_*`/`up_*` report the match depth
/// against the two border records (zero against a sentinel). The returned
/// record is the low border for [`SearchMode::L`]/[`SearchMode::Le`] and
/// the up border for [`SearchMode::G`]/[`SearchMode::Ge`].
pub fn search_on_page(
    page: Page,
    index: &Index,
    tuple: &Tuple,
    mode: SearchMode,
) -> PageSearchResult {
    let mut low = page.infimum();
    let mut low_match = 0u16;
    let mut low_bytes = 0u16;

    let mut cur = page.rec_next(low).unwrap_or_else(|| page.supremum());

    loop {
        if !rec_is_user_rec(cur) {
            // Fell off the record list; the up border is the supremum.
            return finish(mode, low, low_match, low_bytes, cur, 0, 0);
        }

        // The hidden metadata record sorts before every tuple.
        let (cmp, mf, mb) = if rec_is_metadata(cur) {
            (1, 0, 0)
        } else {
            cmp_tuple_rec_with_match(index, tuple, cur)
        };

        let is_border = match mode {
            SearchMode::L | SearchMode::Ge => cmp <= 0,
            SearchMode::Le | SearchMode::G => cmp < 0,
        };
        if is_border {
            return finish(mode, low, low_match, low_bytes, cur, mf, mb);
        }

        low = cur;
        low_match = mf;
        low_bytes = mb;
        cur = match page.rec_next(cur) {
            Some(next) => next,
            None => {
                return finish(mode, low, low_match, low_bytes, page.supremum(), 0, 0);
            }
        };
    }
}

fn finish(
    mode: SearchMode,
    low: RecPtr,
    low_match: u16,
    low_bytes: u16,
    up: RecPtr,
    up_match: u16,
    up_bytes: u16,
) -> PageSearchResult {
    let rec = match mode {
        SearchMode::L | SearchMode::Le => low,
        SearchMode::G | SearchMode::Ge => up,
    };
    PageSearchResult {
        rec,
        low_match,
        low_bytes,
        up_match,
        up_bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::PAGE_SIZE;
    use crate::dict::{FieldDef, IndexId, RowFormat};
    use crate::utility::AlignedBuffer;
    use std::sync::Arc;

    fn setup() -> (AlignedBuffer, Arc<Index>, Page) {
        let buf = AlignedBuffer::zeroed(PAGE_SIZE, PAGE_SIZE);
        let index = Index::new(
            IndexId(9),
            vec![FieldDef::fixed(4, false), FieldDef::fixed(4, false)],
            RowFormat::Compact,
            2,
        );
        let page = unsafe { Page::from_frame(buf.as_mut_ptr()) };
        page.init(index.id(), 1, true);
        (buf, index, page)
    }

    fn key(a: u32, b: u32) -> Tuple {
        Tuple::new(vec![
            Some(a.to_be_bytes().to_vec()),
            Some(b.to_be_bytes().to_vec()),
        ])
    }

    #[test]
    fn test_exact_match_ge() {
        let (_buf, index, page) = setup();
        let mut recs = Vec::new();
        for a in [10u32, 20, 30, 40] {
            recs.push(page.insert_tuple(&index, &key(a, 1)).unwrap());
        }

        let result = search_on_page(page, &index, &key(20, 1), SearchMode::Ge);
        assert_eq!(result.rec, recs[1]);
        // Full match against the up record, partial against the low one.
        assert_eq!(result.up_match, 2);
        assert_eq!(result.low_match, 0);
    }

    #[test]
    fn test_le_positions_on_low_border() {
        let (_buf, index, page) = setup();
        let r10 = page.insert_tuple(&index, &key(10, 1)).unwrap();
        let r30 = page.insert_tuple(&index, &key(30, 1)).unwrap();

        let result = search_on_page(page, &index, &key(20, 0), SearchMode::Le);
        assert_eq!(result.rec, r10);

        let result = search_on_page(page, &index, &key(30, 1), SearchMode::Le);
        assert_eq!(result.rec, r30);
        assert_eq!(result.low_match, 2);

        // L mode is strict: an exact match positions before the record.
        let result = search_on_page(page, &index, &key(30, 1), SearchMode::L);
        assert_eq!(result.rec, r10);
        assert_eq!(result.up_match, 2);
    }

    #[test]
    fn test_g_skips_equal_run() {
        let (_buf, index, page) = setup();
        page.insert_tuple(&index, &key(10, 1)).unwrap();
        let r20 = page.insert_tuple(&index, &key(20, 1)).unwrap();

        let result = search_on_page(page, &index, &key(10, 1), SearchMode::G);
        assert_eq!(result.rec, r20);

        // Past the last record: cursor lands on the supremum.
        let result = search_on_page(page, &index, &key(99, 9), SearchMode::G);
        assert_eq!(result.rec, page.supremum());
        assert_eq!(result.up_match, 0);
        assert_eq!(result.low_match, 2);
    }

    #[test]
    fn test_before_first_lands_on_infimum() {
        let (_buf, index, page) = setup();
        page.insert_tuple(&index, &key(10, 1)).unwrap();

        let result = search_on_page(page, &index, &key(1, 0), SearchMode::Le);
        assert_eq!(result.rec, page.infimum());
        assert_eq!(result.low_match, 0);
    }

    #[test]
    fn test_prefix_tuple_match_depth() {
        let (_buf, index, page) = setup();
        page.insert_tuple(&index, &key(10, 5)).unwrap();
        let r2 = page.insert_tuple(&index, &key(10, 7)).unwrap();

        // One-field prefix: equal to both records up to the prefix.
        let prefix = Tuple::new(vec![Some(10u32.to_be_bytes().to_vec())]);
        let result = search_on_page(page, &index, &prefix, SearchMode::G);
        assert_eq!(result.rec, page.supremum());
        assert_eq!(result.low_match, 1);

        let result = search_on_page(page, &index, &prefix, SearchMode::Ge);
        // GE with a prefix stops at the first record matching the prefix.
        assert_eq!(result.rec, page.first_user_rec().unwrap());
        assert_eq!(result.up_match, 1);
        let _ = r2;
    }
}
