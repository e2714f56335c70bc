//! Hash-index fast path for cursor positioning.
//!
//! The lookup takes the partition latch *before* the page latch, the
//! reverse of every other path. To keep that edge from closing a cycle
//! with build/drop (page latch, then partition latch), the page latch is
//! acquired non-blocking; any contention is just a miss. Nothing found
//! here is trusted: the guessed record is re-validated against the live
//! page under the page latch before the cursor is declared positioned.

use std::sync::Arc;

use crate::buffer::BlockState;
use crate::cursor::{Cursor, CursorFlag};
use crate::dict::{Index, Tuple};
use crate::fold::fold_tuple;
use crate::mtr::{LatchMode, Mtr, PageGuard};
use crate::page::record::{
    cmp_tuple_rec_with_match, rec_is_infimum, rec_is_metadata, rec_is_supremum, rec_is_user_rec,
};
use crate::page::{Page, SearchMode};

use super::AhiSystem;

impl AhiSystem {
    /// Try to position a cursor straight from the hash index.
    ///
    /// Returns whether the guess succeeded; on success the cursor is
    /// positioned on the record and the page latch is registered with
    /// `mtr`. On failure the cursor flag is set to
    /// [`CursorFlag::HashFail`] so the tree-search fallback can repair the
    /// hash entry, and the caller falls back to a regular search. For
    /// [`SearchMode::Le`] a successful return leaves `cursor.up_match` and
    /// `cursor.low_match` with sensible values.
    pub fn guess_on_hash<'a>(
        &'a self,
        index: &Arc<Index>,
        tuple: &Tuple,
        mode: SearchMode,
        latch_mode: LatchMode,
        cursor: &mut Cursor,
        mtr: &mut Mtr<'a>,
    ) -> bool {
        // The search info is read without any latch; a torn read costs a
        // miss at worst.
        let info = &index.search_info;
        if !info.last_hash_succ() || info.n_hash_potential() == 0 || tuple.is_min_rec() {
            return false;
        }

        cursor.n_fields = info.n_fields();
        cursor.n_bytes = info.n_bytes();
        if tuple.n_fields() < cursor.prefix_field_count() {
            return false;
        }

        let index_id = index.id();
        info.inc_n_hash_succ();

        let fold = fold_tuple(index, tuple, cursor.n_fields, cursor.n_bytes);
        cursor.fold = fold;
        cursor.flag = CursorFlag::Hash;

        let table = self.part.latch.read();
        if !self.is_enabled() || !table.is_initialized() {
            drop(table);
            return self.guess_fail(index, cursor);
        }

        let Some(node) = table.lookup(fold) else {
            drop(table);
            return self.guess_fail(index, cursor);
        };
        let rec = node.rec;

        let block = self.pool.block_from_ahi(rec.as_ptr());
        let Some(page_id) = block.page_id() else {
            drop(table);
            return self.guess_fail(index, cursor);
        };

        // Atomize "this block is still the page I think it is" against
        // concurrent removal via the page-hash cell lock, and take the
        // page latch non-blocking (see the module comment).
        let guard = {
            let cell = self.pool.page_hash().cell_for(page_id);
            let _cell_lock = cell.entries.read();
            match latch_mode {
                LatchMode::Search => block.latch.try_read().map(PageGuard::S),
                LatchMode::Modify => block.latch.try_write().map(PageGuard::X),
            }
        };
        let Some(guard) = guard else {
            drop(table);
            return self.guess_fail(index, cursor);
        };

        let state = block.state();
        if !state.is_resident() {
            debug_assert_eq!(state, BlockState::RemoveHash);
            drop(guard);
            drop(table);
            return self.guess_fail(index, cursor);
        }

        match block.ahi.index() {
            Some(installed) if Arc::ptr_eq(&installed, index) => {}
            Some(installed) if installed.id() == index_id => {
                // The block was re-hashed for a freed twin of the same id.
                debug_assert!(installed.is_freed());
                drop(guard);
                drop(table);
                return self.guess_fail(index, cursor);
            }
            _ => {
                drop(guard);
                drop(table);
                return self.guess_fail(index, cursor);
            }
        }

        block.fix();
        drop(table);
        mtr.push_latched(block, guard);

        cursor.position(rec, block.id());

        // Validate the guess within the page, under the page latch we now
        // hold.
        if block.page().index_id() != index_id || !check_guess(cursor, tuple, mode) {
            mtr.release_last_page();
            return self.guess_fail(index, cursor);
        }

        if info.n_hash_potential() < self.config.build_potential_limit + 5 {
            info.inc_n_hash_potential();
        }
        info.set_last_hash_succ(true);
        self.stats.record_hash_hit();
        true
    }

    fn guess_fail(&self, index: &Arc<Index>, cursor: &mut Cursor) -> bool {
        cursor.flag = CursorFlag::HashFail;
        index.search_info.inc_n_hash_fail();
        index.search_info.dec_n_hash_succ_saturating();
        index.search_info.set_last_hash_succ(false);
        self.stats.record_hash_fail();
        false
    }
}

/// Check whether a guessed cursor position is right for the search.
///
/// Re-reads the record under the page latch and, where the record alone
/// cannot prove the position, inspects the previous or next record.
/// Falling off the page at a sentinel is accepted only when the page has
/// no sibling on that side. For [`SearchMode::Ge`] a success leaves
/// `cursor.up_match` set; for [`SearchMode::Le`], `cursor.low_match` and
/// `cursor.up_match`.
fn check_guess(cursor: &mut Cursor, tuple: &Tuple, mode: SearchMode) -> bool {
    let index = cursor.index.clone();
    let n_unique = index.n_uniq();
    let Some(rec) = cursor.rec() else {
        return false;
    };
    let page = Page::containing(rec);

    if !rec_is_user_rec(rec) || rec_is_metadata(rec) || !page.is_leaf() {
        return false;
    }

    let (cmp, matched, _) = cmp_tuple_rec_with_match(&index, tuple, rec);

    match mode {
        SearchMode::Ge => {
            if cmp > 0 {
                return false;
            }
            cursor.up_match = matched;
            if matched >= n_unique {
                return true;
            }
        }
        SearchMode::Le => {
            if cmp < 0 {
                return false;
            }
            cursor.low_match = matched;
        }
        SearchMode::G => {
            if cmp >= 0 {
                return false;
            }
        }
        SearchMode::L => {
            if cmp <= 0 {
                return false;
            }
        }
    }

    match mode {
        SearchMode::G | SearchMode::Ge => {
            let Some(prev_rec) = page.rec_prev(rec) else {
                return false;
            };
            if rec_is_infimum(prev_rec) {
                // Correct only if nothing can precede us on a sibling.
                return !page.has_prev();
            }
            if rec_is_metadata(prev_rec) {
                // The metadata record sorts below every tuple.
                return true;
            }
            let (cmp, _, _) = cmp_tuple_rec_with_match(&index, tuple, prev_rec);
            match mode {
                SearchMode::Ge => cmp > 0,
                _ => cmp >= 0,
            }
        }
        SearchMode::L | SearchMode::Le => {
            debug_assert!(!rec_is_supremum(rec));
            let Some(next_rec) = page.rec_next(rec) else {
                return false;
            };
            if rec_is_supremum(next_rec) {
                if !page.has_next() {
                    cursor.up_match = 0;
                    return true;
                }
                return false;
            }
            let (cmp, matched, _) = cmp_tuple_rec_with_match(&index, tuple, next_rec);
            match mode {
                SearchMode::Le => {
                    cursor.up_match = matched;
                    cmp < 0
                }
                _ => cmp <= 0,
            }
        }
    }
}
