//! Building and tearing down the hash entries of one page.
//!
//! A build walks the page's records, folds the installed prefix shape and
//! emits one entry per run of equal folds, anchored at the run's first or
//! last record depending on the shape's side. A drop walks the page a
//! second time into a cached fold array outside the exclusive latch, then
//! deletes under it; if the installed shape changed in between, the whole
//! operation retries. Single-record inserts and deletes maintain the run
//! boundaries incrementally.

use std::sync::Arc;

use parking_lot::RwLockWriteGuard;

use crate::buffer::{Block, BlockId, BlockState, PageId};
use crate::cursor::{Cursor, CursorFlag};
use crate::dict::Index;
use crate::fold::{fold_record, prefix_field_count};
use crate::mtr::Mtr;
use crate::page::record::{
    rec_is_infimum, rec_is_metadata, rec_is_supremum, rec_is_user_rec,
};
use crate::page::{Page, RecPtr};

use super::AhiSystem;
use super::table::HashTable;

/// Fold the user records of a page, emitting `(fold, rec)` at every fold
/// boundary: the first record of each run when `left_side`, else the last
/// (including the final run ending at the supremum).
fn collect_build_entries(
    page: Page,
    index: &Index,
    n_fields: u16,
    n_bytes: u16,
    left_side: bool,
) -> Vec<(u32, RecPtr)> {
    let mut entries = Vec::new();
    let Some(mut rec) = page.rec_next(page.infimum()) else {
        return entries;
    };
    if rec_is_metadata(rec) {
        match page.rec_next(rec) {
            Some(r) => rec = r,
            None => return entries,
        }
    }
    if rec_is_supremum(rec) {
        return entries;
    }

    let mut fold = fold_record(index, rec, n_fields, n_bytes);
    if left_side {
        entries.push((fold, rec));
    }

    loop {
        let Some(next_rec) = page.rec_next(rec) else {
            break;
        };
        if rec_is_supremum(next_rec) {
            if !left_side {
                entries.push((fold, rec));
            }
            break;
        }
        let next_fold = fold_record(index, next_rec, n_fields, n_bytes);
        if fold != next_fold {
            if left_side {
                entries.push((next_fold, next_rec));
            } else {
                entries.push((fold, rec));
            }
        }
        rec = next_rec;
        fold = next_fold;
    }
    entries
}

/// Fold the user records of a page with consecutive-duplicate suppression,
/// for deletion.
fn collect_drop_folds(page: Page, index: &Index, n_fields: u16, n_bytes: u16) -> Vec<u32> {
    let mut folds = Vec::new();
    let Some(mut rec) = page.rec_next(page.infimum()) else {
        return folds;
    };
    if rec_is_metadata(rec) {
        match page.rec_next(rec) {
            Some(r) => rec = r,
            None => return folds,
        }
    }

    let mut prev_fold = 0u32;
    while rec_is_user_rec(rec) {
        let fold = fold_record(index, rec, n_fields, n_bytes);
        if fold != prev_fold || prev_fold == 0 {
            folds.push(fold);
        }
        prev_fold = fold;
        match page.rec_next(rec) {
            Some(r) => rec = r,
            None => break,
        }
    }
    folds
}

impl AhiSystem {
    /// Build a hash index on a page with the given prefix shape.
    ///
    /// If the page already carries a hash index with a different shape, the
    /// old entries are dropped first. The shape is sanity-checked here
    /// because the heuristic hands it over from unlatched counters. The
    /// caller holds the page latch in either mode.
    pub fn build_page_hash_index(
        &self,
        index: &Arc<Index>,
        block_id: BlockId,
        n_fields: u16,
        n_bytes: u16,
        left_side: bool,
    ) {
        if !self.is_enabled() {
            return;
        }
        let block = self.pool.block(block_id);
        debug_assert!(block.latch.is_locked());
        debug_assert!(block.page().is_leaf());

        let rebuild = {
            let _table = self.part.latch.read();
            if !self.is_enabled() {
                return;
            }
            block.ahi.index().is_some()
                && (block.ahi.curr_n_fields() != n_fields
                    || block.ahi.curr_n_bytes() != n_bytes
                    || block.ahi.curr_left_side() != left_side)
        };
        if rebuild {
            self.drop_page_hash_index(block_id, false);
        }

        if n_fields == 0 && n_bytes == 0 {
            return;
        }
        if (index.n_uniq() as usize) < prefix_field_count(n_fields, n_bytes) {
            return;
        }

        let page = block.page();
        if page.n_recs() == 0 {
            return;
        }
        if page.index_id() != index.id() {
            debug_assert!(false, "page does not belong to the index being built");
            return;
        }

        let entries = collect_build_entries(page, index, n_fields, n_bytes, left_side);

        self.part.prepare_insert(&self.pool, &self.enabled);
        let mut table = self.part.latch.write();
        if !self.is_enabled() || !table.is_initialized() {
            return;
        }

        // The drop path decrements ref_count; count this page only when it
        // was not hashed before. A same-shape rebuild of an already hashed
        // page keeps the count.
        match block.ahi.index() {
            None => {
                debug_assert_eq!(block.ahi.n_pointers(), 0);
                index.search_info.inc_ref_count();
            }
            Some(installed) => {
                if block.ahi.curr_n_fields() != n_fields
                    || block.ahi.curr_n_bytes() != n_bytes
                    || block.ahi.curr_left_side() != left_side
                {
                    // Someone rebuilt the page with different parameters
                    // while we were collecting.
                    return;
                }
                debug_assert!(Arc::ptr_eq(&installed, index));
            }
        }

        block.ahi.set_n_hash_helps(0);
        block.ahi.install(index.clone(), n_fields, n_bytes, left_side);

        let mut added = 0u64;
        for (fold, rec) in entries {
            if self.part.insert(&mut table, &self.pool, fold, rec) {
                added += 1;
            }
        }
        self.stats.record_page_added();
        self.stats.record_rows_added(added);
    }

    /// Drop any hash entries pointing into a page.
    ///
    /// With `garbage_collect` the entries are dropped only when the page's
    /// index has been marked freed. The caller either holds the page latch
    /// or knows the block is unreachable (state
    /// [`BlockState::RemoveHash`]).
    pub fn drop_page_hash_index(&self, block_id: BlockId, garbage_collect: bool) {
        let block = self.pool.block(block_id);
        'retry: loop {
            if block.ahi.index().is_none() {
                return;
            }
            debug_assert!(
                block.state() == BlockState::RemoveHash || block.state().is_resident()
            );
            debug_assert!(block.page().is_leaf());

            let index: Arc<Index>;
            let n_fields: u16;
            let n_bytes: u16;
            // Held across the page walk only when the index is freed: a
            // freed index may be released by whoever drops its last page,
            // so we must not let go of the latch once we have decided to
            // be that dropper.
            let held: Option<RwLockWriteGuard<'_, HashTable>>;
            {
                let rd = self.part.latch.read();
                let Some(i) = block.ahi.index() else {
                    return;
                };
                if i.is_freed() {
                    drop(rd);
                    let wr = self.part.latch.write();
                    match block.ahi.index() {
                        Some(j) if Arc::ptr_eq(&j, &i) => {}
                        _ => continue 'retry,
                    }
                    if !self.is_enabled() {
                        return;
                    }
                    index = i;
                    n_fields = block.ahi.curr_n_fields();
                    n_bytes = block.ahi.curr_n_bytes();
                    held = Some(wr);
                } else if garbage_collect {
                    return;
                } else {
                    if !self.is_enabled() {
                        return;
                    }
                    index = i;
                    n_fields = block.ahi.curr_n_fields();
                    n_bytes = block.ahi.curr_n_bytes();
                    held = None;
                    // The shared latch is released here; the shape is
                    // re-checked under the exclusive latch below.
                }
            }

            debug_assert!(n_fields > 0 || n_bytes > 0);
            let page = block.page();
            if page.n_recs() == 0 {
                debug_assert!(false, "a hashed page cannot be empty");
                return;
            }

            let folds = collect_drop_folds(page, &index, n_fields, n_bytes);

            let mut table = match held {
                Some(wr) => wr,
                None => {
                    let wr = self.part.latch.write();
                    match block.ahi.index() {
                        None => return, // someone else dropped it meanwhile
                        Some(j) => debug_assert!(Arc::ptr_eq(&j, &index)),
                    }
                    wr
                }
            };

            if block.ahi.curr_n_fields() != n_fields || block.ahi.curr_n_bytes() != n_bytes {
                // Someone built a new hash index on the page with
                // different parameters in between the two walks.
                drop(table);
                continue 'retry;
            }

            let base = block.frame() as *const u8;
            let mut removed = 0u64;
            for fold in &folds {
                removed += self.part.remove_all_for_page(&mut table, &self.pool, *fold, base);
            }
            debug_assert_eq!(block.ahi.n_pointers(), 0);

            let prev = index.search_info.dec_ref_count();
            debug_assert_ne!(prev, 0, "index ref_count underflow");
            if prev == 1 && index.is_freed() {
                self.lazy_free(&index);
            }
            block.ahi.clear_index();

            self.stats.record_page_removed();
            self.stats.record_rows_removed(removed);
            return;
        }
    }

    /// Drop hash entries for a page that is being freed in the tablespace
    /// or whose index is being dropped, latching the page by id.
    pub fn drop_page_hash_when_freed(&self, page_id: PageId) {
        let Some(block_id) = self.pool.lookup_page(page_id) else {
            return;
        };
        let block = self.pool.block(block_id);
        if block.ahi.index().is_none() {
            return;
        }
        let mut mtr = Mtr::new();
        mtr.x_latch(block);
        if block.ahi.index().is_some() {
            self.drop_page_hash_index(block_id, false);
        }
        mtr.commit();
    }

    /// Evict a page from the buffer pool, dropping its hash entries first.
    pub fn evict_page(&self, page_id: PageId) {
        let Some(block_id) = self.pool.remove_page(page_id) else {
            return;
        };
        // The block is out of the page hash and in the RemoveHash state:
        // nobody can latch it anymore, so the entries can be dropped
        // without a page latch.
        self.drop_page_hash_index(block_id, false);
        self.pool.discard_block(block_id);
    }

    /// Move or delete hash entries for records moved in a page split.
    ///
    /// If the destination page is already hashed, the source page's
    /// entries are simply dropped. Otherwise, if the source page is
    /// hashed, the destination inherits its shape and gets a fresh build;
    /// the source's obsolete entries are dropped when the source page is
    /// freed or its records are removed. Both pages are x-latched by the
    /// caller.
    pub fn move_or_delete_hash_entries(&self, new_block_id: BlockId, block_id: BlockId) {
        let block = self.pool.block(block_id);
        let new_block = self.pool.block(new_block_id);
        debug_assert!(block.latch.is_locked_exclusive());
        debug_assert!(new_block.latch.is_locked_exclusive());

        if !self.is_enabled() {
            return;
        }

        let index = block.ahi.index().or_else(|| new_block.ahi.index());

        if new_block.ahi.index().is_some() {
            self.drop_page_hash_index(block_id, false);
            return;
        }

        let Some(index) = index else {
            return;
        };

        let shape = {
            let _rd = self.part.latch.read();
            if index.is_freed() {
                None
            } else if block.ahi.index().is_some() {
                let n_fields = block.ahi.curr_n_fields();
                let n_bytes = block.ahi.curr_n_bytes();
                let left_side = block.ahi.curr_left_side();
                new_block.ahi.set_candidate(n_fields, n_bytes, left_side);
                Some((n_fields, n_bytes, left_side))
            } else {
                return;
            }
        };

        match shape {
            None => {
                self.drop_page_hash_index(block_id, false);
            }
            Some((n_fields, n_bytes, left_side)) => {
                debug_assert!(n_fields > 0 || n_bytes > 0);
                self.build_page_hash_index(&index, new_block_id, n_fields, n_bytes, left_side);
            }
        }
    }

    /// Update the page hash index after a single-record insert when the
    /// cursor reached its position through the hash index.
    ///
    /// With a right-side shape the inserted record replaces its
    /// predecessor as the run representative, so the existing node is
    /// rewritten in place. Any other case falls back to
    /// [`AhiSystem::update_hash_on_insert`]. The new record has been
    /// inserted next to the cursor; the page is x-latched.
    pub fn update_hash_node_on_insert(&self, cursor: &Cursor) {
        if !self.is_enabled() {
            return;
        }
        let Some(block_id) = cursor.block else {
            return;
        };
        let block = self.pool.block(block_id);
        debug_assert!(block.latch.is_locked_exclusive());
        let Some(rec) = cursor.rec() else {
            return;
        };
        let Some(index) = block.ahi.index() else {
            return;
        };
        if !Arc::ptr_eq(&index, &cursor.index) {
            debug_assert_eq!(index.id(), cursor.index.id());
            self.drop_page_hash_index(block_id, false);
            return;
        }

        // The installed shape cannot change while we hold the page latch
        // exclusively: build and drop require the page latch too.
        let fast_path = cursor.flag == CursorFlag::Hash
            && cursor.n_fields == block.ahi.curr_n_fields()
            && cursor.n_bytes == block.ahi.curr_n_bytes()
            && !block.ahi.curr_left_side();
        if !fast_path {
            self.update_hash_on_insert(cursor);
            return;
        }

        let mut table = self.part.latch.write();
        if block.ahi.index().is_none() || !self.is_enabled() {
            return;
        }
        if let Some(new_rec) = block.page().rec_next(rec) {
            if self
                .part
                .update_if_found(&mut table, &self.pool, cursor.fold, rec, new_rec)
            {
                self.stats.record_row_updated();
            }
        }
    }

    /// Update the page hash index after a single-record insert.
    ///
    /// Derives the folds of the predecessor, the inserted record and the
    /// successor, and inserts whichever entries cross fold boundaries,
    /// following the installed side discipline. The cursor is positioned
    /// on the record the insert went after; the page is x-latched.
    pub fn update_hash_on_insert(&self, cursor: &Cursor) {
        if !self.is_enabled() {
            return;
        }
        let Some(block_id) = cursor.block else {
            return;
        };
        let block = self.pool.block(block_id);
        debug_assert!(block.latch.is_locked_exclusive());
        debug_assert!(block.page().is_leaf());
        let Some(index) = block.ahi.index() else {
            return;
        };
        if !Arc::ptr_eq(&index, &cursor.index) {
            debug_assert_eq!(index.id(), cursor.index.id());
            self.drop_page_hash_index(block_id, false);
            return;
        }

        let n_fields = block.ahi.curr_n_fields();
        let n_bytes = block.ahi.curr_n_bytes();
        let left_side = block.ahi.curr_left_side();
        let page = block.page();

        let Some(rec) = cursor.rec() else {
            return;
        };
        let Some(ins_rec) = page.rec_next(rec) else {
            self.drop_page_hash_index(block_id, false);
            return;
        };
        let Some(next_rec) = page.rec_next(ins_rec) else {
            self.drop_page_hash_index(block_id, false);
            return;
        };

        let ins_fold = fold_record(&index, ins_rec, n_fields, n_bytes);
        let next_fold = if rec_is_supremum(next_rec) {
            None
        } else {
            Some(fold_record(&index, next_rec, n_fields, n_bytes))
        };

        self.part.prepare_insert(&self.pool, &self.enabled);
        let mut table: Option<RwLockWriteGuard<'_, HashTable>> = None;

        // Every insert below first takes the write latch (once) and
        // re-checks that the page is still hashed and the index enabled.
        let rec_fold = if !rec_is_infimum(rec) && !rec_is_metadata(rec) {
            Some(fold_record(&index, rec, n_fields, n_bytes))
        } else {
            if left_side {
                let Some(mut t) = self.lock_for_update(block) else {
                    return;
                };
                if self.part.insert(&mut t, &self.pool, ins_fold, ins_rec) {
                    self.stats.record_rows_added(1);
                }
                table = Some(t);
            }
            None
        };

        if let Some(fold) = rec_fold {
            if fold != ins_fold {
                if table.is_none() {
                    match self.lock_for_update(block) {
                        Some(t) => table = Some(t),
                        None => return,
                    }
                }
                let t = table.as_mut().expect("write latch installed above");
                let inserted = if left_side {
                    self.part.insert(t, &self.pool, ins_fold, ins_rec)
                } else {
                    self.part.insert(t, &self.pool, fold, rec)
                };
                if inserted {
                    self.stats.record_rows_added(1);
                }
            }
        }

        match next_fold {
            None => {
                // The inserted record is the last of the page.
                if !left_side {
                    if table.is_none() {
                        match self.lock_for_update(block) {
                            Some(t) => table = Some(t),
                            None => return,
                        }
                    }
                    let t = table.as_mut().expect("write latch installed above");
                    if self.part.insert(t, &self.pool, ins_fold, ins_rec) {
                        self.stats.record_rows_added(1);
                    }
                }
            }
            Some(next_fold) => {
                if ins_fold != next_fold {
                    if table.is_none() {
                        match self.lock_for_update(block) {
                            Some(t) => table = Some(t),
                            None => return,
                        }
                    }
                    let t = table.as_mut().expect("write latch installed above");
                    let inserted = if left_side {
                        self.part.insert(t, &self.pool, next_fold, next_rec)
                    } else {
                        self.part.insert(t, &self.pool, ins_fold, ins_rec)
                    };
                    if inserted {
                        self.stats.record_rows_added(1);
                    }
                }
            }
        }
    }

    /// Update the page hash index before a single-record delete.
    ///
    /// The cursor is positioned on the record about to be deleted; the
    /// page is x-latched. The deletion may leave a stale entry pointing at
    /// the wrong record of a run of equal folds; a later failed lookup
    /// repairs it lazily.
    pub fn update_hash_on_delete(&self, cursor: &Cursor) {
        if !self.is_enabled() {
            return;
        }
        let Some(block_id) = cursor.block else {
            return;
        };
        let block = self.pool.block(block_id);
        debug_assert!(block.latch.is_locked_exclusive());
        debug_assert!(block.page().is_leaf());
        let Some(index) = block.ahi.index() else {
            return;
        };
        if !Arc::ptr_eq(&index, &cursor.index) {
            self.drop_page_hash_index(block_id, false);
            return;
        }

        debug_assert!(block.ahi.curr_n_fields() > 0 || block.ahi.curr_n_bytes() > 0);
        let Some(rec) = cursor.rec() else {
            return;
        };
        let fold = fold_record(
            &index,
            rec,
            block.ahi.curr_n_fields(),
            block.ahi.curr_n_bytes(),
        );

        let mut table = self.part.latch.write();
        if block.ahi.index().is_none() || !self.is_enabled() || !table.is_initialized() {
            return;
        }
        if self.part.erase(&mut table, &self.pool, fold, rec) {
            self.stats.record_rows_removed(1);
        } else {
            self.stats.record_row_remove_miss();
        }
    }

    /// Insert the correct entry after a hash guess failed on a search that
    /// the installed shape should have served.
    ///
    /// Misleading entries exist because builds do not look across page
    /// boundaries and because folds collide; this lazily repairs both. The
    /// cursor comes from the tree-search fallback, positioned on the
    /// record the failed guess was looking for, page latched.
    pub(crate) fn update_hash_ref(&self, cursor: &Cursor) {
        debug_assert_eq!(cursor.flag, CursorFlag::HashFail);
        let Some(block_id) = cursor.block else {
            return;
        };
        let block = self.pool.block(block_id);
        debug_assert!(block.latch.is_locked());
        let Some(rec) = cursor.rec() else {
            return;
        };
        debug_assert!(std::ptr::eq(
            Page::containing(rec).frame_addr(),
            block.frame() as *const u8
        ));

        let Some(index) = block.ahi.index() else {
            return;
        };
        if index.search_info.n_hash_potential() == 0 {
            return;
        }
        if !Arc::ptr_eq(&index, &cursor.index) {
            debug_assert_eq!(index.id(), cursor.index.id());
            self.drop_page_hash_index(block_id, false);
            return;
        }

        let mut table = self.part.latch.write();
        if block.ahi.index().is_some()
            && block.ahi.curr_n_fields() == index.search_info.n_fields()
            && block.ahi.curr_n_bytes() == index.search_info.n_bytes()
            && block.ahi.curr_left_side() == index.search_info.left_side()
            && rec_is_user_rec(rec)
            && !rec_is_metadata(rec)
            && self.is_enabled()
        {
            let fold = fold_record(
                &index,
                rec,
                block.ahi.curr_n_fields(),
                block.ahi.curr_n_bytes(),
            );
            if self.part.insert(&mut table, &self.pool, fold, rec) {
                self.stats.record_rows_added(1);
            }
        }
    }

    /// Take the write latch for an incremental update, giving up when the
    /// hash index was disabled or the page unhashed in the meantime.
    fn lock_for_update(&self, block: &Block) -> Option<RwLockWriteGuard<'_, HashTable>> {
        let table = self.part.latch.write();
        if !self.is_enabled() || !table.is_initialized() || block.ahi.index().is_none() {
            None
        } else {
            Some(table)
        }
    }
}
