//! Self-tuning heuristic.
//!
//! Observes cursor positionings, maintains the per-index prefix-shape
//! recommendation and the per-page build vote, and kicks off page builds
//! and lazy repairs.
//!
//! Everything here runs without latches over relaxed atomics. A torn read
//! can only cause a suboptimal build or no-build decision, never
//! corruption: the build path re-validates whatever matters under the
//! partition latch.

use crate::buffer::Block;
use crate::config::AhiConfig;
use crate::cursor::{Cursor, CursorFlag};
use crate::dict::{Index, SearchInfo};

use super::AhiSystem;

/// Lexicographic compare of two `(fields, bytes)` prefix depths
#[inline]
pub(crate) fn pair_cmp(a_fields: u16, a_bytes: u16, b_fields: u16, b_bytes: u16) -> i32 {
    match (a_fields, a_bytes).cmp(&(b_fields, b_bytes)) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }
}

/// Update the per-index search info from a cursor positioning.
///
/// If the current recommendation would have served this search, the
/// potential streak grows; otherwise a new recommendation is derived from
/// the cursor's match depths and the streak restarts.
pub(crate) fn update_search_info(index: &Index, cursor: &Cursor) {
    debug_assert!(cursor.flag != CursorFlag::Hash);
    let info = &index.search_info;
    let n_unique = index.n_uniq();

    if info.n_hash_potential() == 0 {
        return set_new_recommendation(info, cursor, n_unique);
    }

    // Would the recommended prefix have succeeded on this search?
    if info.n_fields() >= n_unique && cursor.up_match >= n_unique {
        info.inc_n_hash_potential();
        return;
    }

    let cmp = pair_cmp(
        info.n_fields(),
        info.n_bytes(),
        cursor.low_match,
        cursor.low_bytes,
    );
    if if info.left_side() { cmp <= 0 } else { cmp > 0 } {
        return set_new_recommendation(info, cursor, n_unique);
    }

    let cmp = pair_cmp(
        info.n_fields(),
        info.n_bytes(),
        cursor.up_match,
        cursor.up_bytes,
    );
    if if info.left_side() { cmp <= 0 } else { cmp > 0 } {
        info.inc_n_hash_potential();
        return;
    }

    set_new_recommendation(info, cursor, n_unique);
}

/// Derive a fresh recommendation from the cursor's match depths: the
/// shortest prefix that would have distinguished this search, clamped to
/// the unique prefix length.
fn set_new_recommendation(info: &SearchInfo, cursor: &Cursor, n_unique: u16) {
    let cmp = pair_cmp(
        cursor.up_match,
        cursor.up_bytes,
        cursor.low_match,
        cursor.low_bytes,
    );
    info.set_left_side(cmp >= 0);

    if cmp == 0 {
        // The search was not selective at all; fall back to a minimal
        // prefix and wait for a better signal.
        info.set_n_hash_potential(0);
        info.set_shape(1, 0);
    } else if cmp > 0 {
        info.set_n_hash_potential(1);
        if cursor.up_match >= n_unique {
            info.set_shape(n_unique, 0);
        } else if cursor.low_match < cursor.up_match {
            info.set_shape(cursor.low_match + 1, 0);
        } else {
            info.set_shape(cursor.low_match, cursor.low_bytes + 1);
        }
    } else {
        info.set_n_hash_potential(1);
        if cursor.low_match >= n_unique {
            info.set_shape(n_unique, 0);
        } else if cursor.low_match > cursor.up_match {
            info.set_shape(cursor.up_match + 1, 0);
        } else {
            info.set_shape(cursor.up_match, cursor.up_bytes + 1);
        }
    }
}

/// Update the per-page vote from a cursor positioning.
///
/// Returns whether building a (new) hash index on the page is
/// recommended. Caller holds the page latch in either mode; the counters
/// themselves are racy by design.
pub(crate) fn update_block_hash_info(config: &AhiConfig, info: &SearchInfo, block: &Block) -> bool {
    debug_assert!(block.latch.is_locked());
    info.set_last_hash_succ(false);

    let ahi = &block.ahi;
    let n_recs = block.page().n_recs() as u32;

    if ahi.n_hash_helps() > 0
        && info.n_hash_potential() > 0
        && ahi.candidate_n_fields() == info.n_fields()
        && ahi.candidate_n_bytes() == info.n_bytes()
        && ahi.candidate_left_side() == info.left_side()
    {
        if ahi.index().is_some()
            && ahi.curr_n_fields() == info.n_fields()
            && ahi.curr_n_bytes() == info.n_bytes()
            && ahi.curr_left_side() == info.left_side()
        {
            // The search would presumably have succeeded through the hash
            // index.
            info.set_last_hash_succ(true);
        }
        ahi.inc_n_hash_helps();
    } else {
        ahi.set_n_hash_helps(1);
        ahi.set_candidate(info.n_fields(), info.n_bytes(), info.left_side());
    }

    if ahi.n_hash_helps() > n_recs / config.build_per_page_limit
        && info.n_hash_potential() >= config.build_potential_limit
        && (ahi.index().is_none()
            || ahi.n_hash_helps() > 2 * n_recs
            || ahi.candidate_n_fields() != ahi.curr_n_fields()
            || ahi.candidate_n_bytes() != ahi.curr_n_bytes()
            || ahi.candidate_left_side() != ahi.curr_left_side())
    {
        return true;
    }

    false
}

impl AhiSystem {
    /// Feed a completed cursor positioning into the heuristic.
    ///
    /// Call after every tree positioning that did not come from the hash
    /// index itself, with the cursor's page still latched. May build the
    /// page hash index, and repairs the hash entry after a failed guess.
    pub fn info_update(&self, cursor: &Cursor) {
        if !self.is_enabled() {
            return;
        }
        debug_assert!(cursor.flag != CursorFlag::Hash);
        let Some(block_id) = cursor.block else {
            return;
        };

        update_search_info(&cursor.index, cursor);

        let block = self.pool.block(block_id);
        let build = update_block_hash_info(&self.config, &cursor.index.search_info, block);

        if build || cursor.flag == CursorFlag::HashFail {
            // Both paths insert under the write latch; make sure a slab is
            // ready before any latch is taken.
            self.part.prepare_insert(&self.pool, &self.enabled);
        }

        if cursor.flag == CursorFlag::HashFail {
            self.update_hash_ref(cursor);
        }

        if build {
            // The candidate fields were read without latches and may be
            // torn; the build path sanity-checks them again.
            let ahi = &block.ahi;
            self.build_page_hash_index(
                &cursor.index,
                block_id,
                ahi.candidate_n_fields(),
                ahi.candidate_n_bytes(),
                ahi.candidate_left_side(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::{FieldDef, IndexId, RowFormat};
    use std::sync::Arc;

    fn index() -> Arc<Index> {
        Index::new(
            IndexId(11),
            vec![FieldDef::fixed(4, false), FieldDef::fixed(4, false)],
            RowFormat::Compact,
            2,
        )
    }

    fn cursor_with(index: &Arc<Index>, low: (u16, u16), up: (u16, u16)) -> Cursor {
        let mut cursor = Cursor::new(index.clone());
        cursor.low_match = low.0;
        cursor.low_bytes = low.1;
        cursor.up_match = up.0;
        cursor.up_bytes = up.1;
        cursor
    }

    #[test]
    fn test_pair_cmp() {
        assert_eq!(pair_cmp(1, 0, 1, 0), 0);
        assert_eq!(pair_cmp(1, 2, 1, 3), -1);
        assert_eq!(pair_cmp(2, 0, 1, 9), 1);
    }

    #[test]
    fn test_first_decisive_search_sets_recommendation() {
        let index = index();
        // Exact-match positioning: full match above, one field below.
        let cursor = cursor_with(&index, (1, 0), (2, 0));
        update_search_info(&index, &cursor);

        let info = &index.search_info;
        assert_eq!(info.n_hash_potential(), 1);
        assert_eq!(info.n_fields(), 2);
        assert_eq!(info.n_bytes(), 0);
        assert!(info.left_side());
    }

    #[test]
    fn test_streak_grows_on_matching_searches() {
        let index = index();
        let cursor = cursor_with(&index, (1, 0), (2, 0));
        for _ in 0..5 {
            update_search_info(&index, &cursor);
        }
        assert_eq!(index.search_info.n_hash_potential(), 5);
    }

    #[test]
    fn test_undecisive_search_zeroes_potential() {
        let index = index();
        let cursor = cursor_with(&index, (1, 0), (2, 0));
        update_search_info(&index, &cursor);
        assert_eq!(index.search_info.n_hash_potential(), 1);

        // up == low: nothing distinguished this search.
        let flat = cursor_with(&index, (1, 3), (1, 3));
        update_search_info(&index, &flat);
        let info = &index.search_info;
        assert_eq!(info.n_hash_potential(), 0);
        assert_eq!(info.n_fields(), 1);
        assert_eq!(info.n_bytes(), 0);
    }

    #[test]
    fn test_partial_field_recommendation() {
        let index = index();
        // low (1,2) < up (1,4): the shortest distinguishing prefix is one
        // full field plus low_bytes + 1 bytes.
        let cursor = cursor_with(&index, (1, 2), (1, 4));
        update_search_info(&index, &cursor);

        let info = &index.search_info;
        assert_eq!(info.n_fields(), 1);
        assert_eq!(info.n_bytes(), 3);
        assert!(info.left_side());
        assert_eq!(info.n_hash_potential(), 1);
    }
}
