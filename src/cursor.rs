//! Tree cursor surface.
//!
//! Only the leaf-level positioning that the adaptive hash index observes
//! and serves is modelled here: a cursor carries the record it landed on,
//! the match depths against the neighbouring records, and the hash state
//! (`fold`, prefix shape, flag) that links the fast path to the heuristic.

use std::sync::Arc;

use crate::buffer::{BlockId, BufferPool};
use crate::dict::{Index, Tuple};
use crate::page::{RecPtr, SearchMode, search_on_page};

/// How the cursor reached its position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorFlag {
    /// Regular tree search
    #[default]
    Normal,
    /// Positioned through the adaptive hash index
    Hash,
    /// A hash guess failed; the tree search that follows should repair the
    /// hash entry
    HashFail,
}

/// A leaf-level tree cursor
#[derive(Debug, Clone)]
pub struct Cursor {
    /// Index the cursor operates on
    pub index: Arc<Index>,
    /// Block holding the leaf page, once positioned
    pub block: Option<BlockId>,
    rec: Option<RecPtr>,
    /// Fields of the tuple matching the record above the insertion point
    pub up_match: u16,
    /// Bytes matched in the first differing field of the up record
    pub up_bytes: u16,
    /// Fields of the tuple matching the record below the insertion point
    pub low_match: u16,
    /// Bytes matched in the first differing field of the low record
    pub low_bytes: u16,
    /// Prefix fields used by the last hash attempt
    pub n_fields: u16,
    /// Prefix bytes used by the last hash attempt
    pub n_bytes: u16,
    /// Fold computed by the last hash attempt
    pub fold: u32,
    /// How the cursor reached its position
    pub flag: CursorFlag,
}

impl Cursor {
    /// Create an unpositioned cursor on an index
    pub fn new(index: Arc<Index>) -> Self {
        Self {
            index,
            block: None,
            rec: None,
            up_match: 0,
            up_bytes: 0,
            low_match: 0,
            low_bytes: 0,
            n_fields: 0,
            n_bytes: 0,
            fold: 0,
            flag: CursorFlag::Normal,
        }
    }

    /// Record the cursor is positioned on
    #[inline]
    pub fn rec(&self) -> Option<RecPtr> {
        self.rec
    }

    /// Position the cursor on a record
    pub fn position(&mut self, rec: RecPtr, block: BlockId) {
        self.rec = Some(rec);
        self.block = Some(block);
    }

    /// Number of complete or incomplete prefix fields of the hash shape
    #[inline]
    pub(crate) fn prefix_field_count(&self) -> usize {
        self.n_fields as usize + usize::from(self.n_bytes > 0)
    }
}

/// Position a cursor on a leaf page with a regular search.
///
/// This is the tree-search fallback the hash index is measured against: it
/// fills in the match depths the heuristic consumes. The caller holds the
/// page latch. A pending [`CursorFlag::HashFail`] is preserved so that the
/// following heuristic update can repair the hash entry.
pub fn search_leaf(
    pool: &BufferPool,
    block_id: BlockId,
    tuple: &Tuple,
    mode: SearchMode,
    cursor: &mut Cursor,
) {
    let block = pool.block(block_id);
    let result = search_on_page(block.page(), &cursor.index, tuple, mode);
    cursor.position(result.rec, block_id);
    cursor.low_match = result.low_match;
    cursor.low_bytes = result.low_bytes;
    cursor.up_match = result.up_match;
    cursor.up_bytes = result.up_bytes;
    if cursor.flag != CursorFlag::HashFail {
        cursor.flag = CursorFlag::Normal;
    }
}
