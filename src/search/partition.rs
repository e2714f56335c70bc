//! The hash partition: latch, table, arena, spare.
//!
//! Latch order: the caller's page latch (if any) comes first, the
//! partition latch second. The arena mutex is a leaf: it is taken only for
//! arena-structural work and never while blocking on anything else. The
//! lookup path is the one exception to the page-then-partition order and
//! uses non-blocking page latch acquisition instead (see the lookup
//! module).

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::buffer::BufferPool;
use crate::constants::PAGE_SIZE;
use crate::page::RecPtr;

use super::arena::NodeArena;
use super::table::{AhiNode, HashTable};

/// One partition of the adaptive hash index.
///
/// The current layout has a single partition; everything is written so
/// that sharding by fold would only add routing.
pub(crate) struct Partition {
    /// Guards table cells, node chains and node payloads
    pub(crate) latch: RwLock<HashTable>,
    /// Guards the slab list, free offsets and the spare slab
    pub(crate) arena: Mutex<NodeArena>,
}

impl Partition {
    pub(crate) fn new() -> Self {
        Self {
            latch: RwLock::new(HashTable::empty()),
            arena: Mutex::new(NodeArena::new()),
        }
    }

    /// Refill the spare slab before a write-latched insert section.
    ///
    /// Buffer-pool allocation may block, so it must happen before the
    /// partition latch is taken; insert paths then never allocate. The
    /// spare may be consumed by a concurrent insert or by disable between
    /// the check and the install, hence the double check.
    pub(crate) fn prepare_insert(&self, pool: &BufferPool, enabled: &AtomicBool) {
        if self.arena.lock().has_spare() || !enabled.load(Ordering::Acquire) {
            return;
        }
        let Some(frame) = pool.alloc_slab() else {
            return;
        };
        let mut arena = self.arena.lock();
        if !arena.has_spare() && enabled.load(Ordering::Acquire) {
            arena.install_spare(frame);
        } else {
            drop(arena);
            pool.free_slab(frame);
        }
    }

    /// Insert or replace an entry.
    ///
    /// Caller holds the write latch (`table` is the latched table). If a
    /// node with the same fold exists in the chain, its record pointer is
    /// replaced. Otherwise a node is bump-allocated and appended at the
    /// chain tail; if no slab space is available the insertion is silently
    /// dropped. Returns whether an entry was inserted or updated.
    pub(crate) fn insert(
        &self,
        table: &mut HashTable,
        pool: &BufferPool,
        fold: u32,
        rec: RecPtr,
    ) -> bool {
        debug_assert!(table.is_initialized());
        debug_assert!(pool.contains(rec.as_ptr()));

        let mut node = table.chain_head(fold);
        while !node.is_null() {
            // SAFETY: live chain node under the exclusive latch.
            unsafe {
                if (*node).fold == fold {
                    pool.block_from_ahi((*node).rec.as_ptr()).ahi.dec_n_pointers();
                    pool.block_from_ahi(rec.as_ptr()).ahi.inc_n_pointers();
                    (*node).rec = rec;
                    return true;
                }
                node = (*node).next;
            }
        }

        let new_node = { self.arena.lock().alloc_node() };
        let Some(new_node) = new_node else {
            // Best effort: no spare slab, drop the insertion.
            return false;
        };
        // SAFETY: `new_node` is a freshly allocated arena slot.
        unsafe {
            *new_node = AhiNode {
                fold,
                next: std::ptr::null_mut(),
                rec,
            };
        }
        pool.block_from_ahi(rec.as_ptr()).ahi.inc_n_pointers();
        table.append(new_node);
        true
    }

    /// Erase the entry for `(fold, rec)` if it exists.
    ///
    /// Caller holds the write latch. The match is by record identity; a
    /// fold-only match is left alone.
    pub(crate) fn erase(
        &self,
        table: &mut HashTable,
        pool: &BufferPool,
        fold: u32,
        rec: RecPtr,
    ) -> bool {
        debug_assert!(table.is_initialized());
        let mut prev = table.link_to_head(fold);
        // SAFETY: chain walked and unlinked under the exclusive latch.
        unsafe {
            while !(*prev).is_null() {
                let node = *prev;
                if (*node).rec == rec {
                    *prev = (*node).next;
                    (*node).next = std::ptr::null_mut();
                    self.cleanup_after_erase(table, pool, node);
                    return true;
                }
                prev = std::ptr::addr_of_mut!((*node).next);
            }
        }
        false
    }

    /// Compact the arena after a node was unlinked.
    ///
    /// The top node of the last slab is moved into the hole and the one
    /// chain link that pointed at it is fixed up; then the slab shrinks.
    /// Caller holds the write latch.
    pub(crate) fn cleanup_after_erase(
        &self,
        table: &mut HashTable,
        pool: &BufferPool,
        erased: *mut AhiNode,
    ) {
        // SAFETY: `erased` was just unlinked and is still a valid arena
        // slot; the top node is live; both are exclusive to us under the
        // write latch plus the arena mutex.
        let freed = {
            let mut arena = self.arena.lock();
            unsafe {
                pool.block_from_ahi((*erased).rec.as_ptr())
                    .ahi
                    .dec_n_pointers();

                let top = arena.top_node();
                if erased != top {
                    *erased = *top;
                    let link = table.link_to((*top).fold, top);
                    *link = erased;
                }
            }
            arena.shrink_top()
        };
        if let Some(frame) = freed {
            pool.free_slab(frame);
        }
    }

    /// Remove every entry whose record lies within the page at
    /// `page_base`, restricted to the chain of `fold`.
    ///
    /// Caller holds the write latch. Compaction may move other nodes of
    /// the same chain, so the scan restarts from the head after each
    /// removal.
    pub(crate) fn remove_all_for_page(
        &self,
        table: &mut HashTable,
        pool: &BufferPool,
        fold: u32,
        page_base: *const u8,
    ) -> u64 {
        debug_assert!(table.is_initialized());
        let base = page_base as usize;
        let mut removed = 0u64;

        'rewind: loop {
            let mut prev = table.link_to_head(fold);
            // SAFETY: chain walked and unlinked under the exclusive latch.
            unsafe {
                while !(*prev).is_null() {
                    let node = *prev;
                    if (*node).rec.addr().wrapping_sub(base) < PAGE_SIZE {
                        *prev = (*node).next;
                        (*node).next = std::ptr::null_mut();
                        self.cleanup_after_erase(table, pool, node);
                        removed += 1;
                        // The compaction may have moved other nodes of
                        // this chain; start over.
                        continue 'rewind;
                    }
                    prev = std::ptr::addr_of_mut!((*node).next);
                }
            }
            break;
        }

        #[cfg(debug_assertions)]
        {
            let mut node = table.chain_head(fold);
            while !node.is_null() {
                // SAFETY: live chain nodes under the exclusive latch.
                unsafe {
                    debug_assert!((*node).rec.addr().wrapping_sub(base) >= PAGE_SIZE);
                    node = (*node).next;
                }
            }
        }

        removed
    }

    /// Rewrite the record pointer of the entry for `(fold, old_rec)`.
    ///
    /// Caller holds the write latch. Used when a record representative
    /// moves in place (right-side insert next to a hash-positioned
    /// cursor).
    pub(crate) fn update_if_found(
        &self,
        table: &mut HashTable,
        pool: &BufferPool,
        fold: u32,
        old_rec: RecPtr,
        new_rec: RecPtr,
    ) -> bool {
        let mut node = table.chain_head(fold);
        while !node.is_null() {
            // SAFETY: live chain node under the exclusive latch.
            unsafe {
                if (*node).rec == old_rec {
                    pool.block_from_ahi(old_rec.as_ptr()).ahi.dec_n_pointers();
                    pool.block_from_ahi(new_rec.as_ptr()).ahi.inc_n_pointers();
                    (*node).rec = new_rec;
                    return true;
                }
                node = (*node).next;
            }
        }
        false
    }
}

impl HashTable {
    /// Pointer to the head link of the chain a fold hashes to.
    pub(crate) fn link_to_head(&mut self, fold: u32) -> *mut *mut AhiNode {
        let i = self.cell_index(fold);
        self.head_slot(i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PageId;
    use crate::config::PoolConfig;
    use crate::dict::IndexId;
    use crate::search::table::NODE_SIZE;

    struct Fixture {
        pool: BufferPool,
        part: Partition,
        enabled: AtomicBool,
        page_block: usize,
    }

    fn fixture() -> Fixture {
        let pool = BufferPool::new(&PoolConfig { n_pages: 64 });
        let page_block = pool.create_page(PageId(1), IndexId(1), true).unwrap();
        let part = Partition::new();
        *part.latch.write() = HashTable::create(64);
        Fixture {
            pool,
            part,
            enabled: AtomicBool::new(true),
            page_block,
        }
    }

    fn rec(f: &Fixture, off: usize) -> RecPtr {
        // Fabricated record addresses inside the page frame; the table
        // never dereferences them.
        RecPtr(unsafe { f.pool.block(f.page_block).frame().add(64 + off) })
    }

    #[test]
    fn test_insert_lookup_erase_roundtrip() {
        let f = fixture();
        f.part.prepare_insert(&f.pool, &f.enabled);
        let mut table = f.part.latch.write();

        let r = rec(&f, 0);
        assert!(f.part.insert(&mut table, &f.pool, 0xAB, r));
        assert_eq!(table.lookup(0xAB).unwrap().rec, r);
        assert!(table.lookup(0xAC).is_none());
        assert_eq!(f.pool.block(f.page_block).ahi.n_pointers(), 1);

        assert!(f.part.erase(&mut table, &f.pool, 0xAB, r));
        assert!(table.lookup(0xAB).is_none());
        assert_eq!(f.pool.block(f.page_block).ahi.n_pointers(), 0);
        // Erasing again is a miss, not an error.
        assert!(!f.part.erase(&mut table, &f.pool, 0xAB, r));
    }

    #[test]
    fn test_insert_same_fold_overwrites() {
        let f = fixture();
        f.part.prepare_insert(&f.pool, &f.enabled);
        let mut table = f.part.latch.write();

        let r1 = rec(&f, 0);
        let r2 = rec(&f, 32);
        assert!(f.part.insert(&mut table, &f.pool, 7, r1));
        assert!(f.part.insert(&mut table, &f.pool, 7, r2));
        assert_eq!(table.lookup(7).unwrap().rec, r2);
        assert_eq!(f.pool.block(f.page_block).ahi.n_pointers(), 1);
        assert_eq!(f.part.arena.lock().n_nodes(), 1);
    }

    #[test]
    fn test_insert_without_spare_is_silently_dropped() {
        let f = fixture();
        // No prepare_insert: no spare, no slabs.
        let mut table = f.part.latch.write();
        assert!(!f.part.insert(&mut table, &f.pool, 1, rec(&f, 0)));
        assert!(table.lookup(1).is_none());
        assert_eq!(f.pool.block(f.page_block).ahi.n_pointers(), 0);
    }

    #[test]
    fn test_chain_append_order() {
        let f = fixture();
        f.part.prepare_insert(&f.pool, &f.enabled);
        let mut table = f.part.latch.write();

        // Two folds in the same cell (64 cells: fold and fold + 64).
        let r1 = rec(&f, 0);
        let r2 = rec(&f, 32);
        assert!(f.part.insert(&mut table, &f.pool, 5, r1));
        assert!(f.part.insert(&mut table, &f.pool, 5 + 64, r2));

        let head = table.chain_head(5);
        // Later insert is appended after the earlier one.
        unsafe {
            assert_eq!((*head).rec, r1);
            assert_eq!((*(*head).next).rec, r2);
        }
    }

    #[test]
    fn test_compaction_moves_top_and_fixes_chain() {
        let f = fixture();
        f.part.prepare_insert(&f.pool, &f.enabled);
        let mut table = f.part.latch.write();

        let recs: Vec<RecPtr> = (0..5).map(|i| rec(&f, i * 32)).collect();
        for (i, r) in recs.iter().enumerate() {
            assert!(f.part.insert(&mut table, &f.pool, i as u32, *r));
        }
        assert_eq!(f.part.arena.lock().n_nodes(), 5);

        // Erase the first-inserted node: the top node (fold 4) is moved
        // into its slot and must still be reachable.
        assert!(f.part.erase(&mut table, &f.pool, 0, recs[0]));
        assert_eq!(f.part.arena.lock().n_nodes(), 4);
        for i in 1..5 {
            assert_eq!(table.lookup(i as u32).unwrap().rec, recs[i]);
        }
    }

    #[test]
    fn test_emptied_slab_becomes_spare_then_returns_to_pool() {
        let f = fixture();
        let free_at_start = f.pool.free_count();
        f.part.prepare_insert(&f.pool, &f.enabled);
        assert_eq!(f.pool.free_count(), free_at_start - 1);

        let per_slab = PAGE_SIZE / NODE_SIZE;
        let n = per_slab + 1; // force a second slab
        {
            let mut table = f.part.latch.write();
            for i in 0..n {
                f.part.prepare_insert_locked_test(&f.pool, &f.enabled);
                assert!(f.part.insert(&mut table, &f.pool, i as u32, rec(&f, i)));
            }
            assert_eq!(f.part.arena.lock().n_slabs(), 2);

            for i in (0..n).rev() {
                assert!(f.part.erase(&mut table, &f.pool, i as u32, rec(&f, i)));
            }
            let arena = f.part.arena.lock();
            assert!(arena.is_empty());
            assert!(arena.has_spare());
        }
        // Everything except the one spare slab went back to the pool.
        assert_eq!(f.pool.free_count(), free_at_start - 1);
    }

    impl Partition {
        /// Test helper: refill the spare while the write latch is held by
        /// the same thread (the production path refills beforehand).
        fn prepare_insert_locked_test(&self, pool: &BufferPool, enabled: &AtomicBool) {
            if self.arena.lock().has_spare() || !enabled.load(Ordering::Acquire) {
                return;
            }
            if let Some(frame) = pool.alloc_slab() {
                self.arena.lock().install_spare(frame);
            }
        }
    }

    #[test]
    fn test_remove_all_for_page_restarts_after_compaction() {
        let f = fixture();
        let other_block = f.pool.create_page(PageId(2), IndexId(1), true).unwrap();
        let other = RecPtr(unsafe { f.pool.block(other_block).frame().add(64) });

        f.part.prepare_insert(&f.pool, &f.enabled);
        let mut table = f.part.latch.write();

        // Same cell: folds congruent mod 64. Mix records of two pages.
        assert!(f.part.insert(&mut table, &f.pool, 3, rec(&f, 0)));
        assert!(f.part.insert(&mut table, &f.pool, 3 + 64, other));
        assert!(f.part.insert(&mut table, &f.pool, 3 + 128, rec(&f, 32)));

        let base = f.pool.block(f.page_block).frame() as *const u8;
        let removed = f.part.remove_all_for_page(&mut table, &f.pool, 3, base);
        assert_eq!(removed, 2);
        assert!(table.lookup(3 + 64).is_some());
        assert!(table.lookup(3).is_none());
        assert!(table.lookup(3 + 128).is_none());
        assert_eq!(f.pool.block(f.page_block).ahi.n_pointers(), 0);
        assert_eq!(f.pool.block(other_block).ahi.n_pointers(), 1);
    }

    #[test]
    fn test_update_if_found_rewrites_identity() {
        let f = fixture();
        f.part.prepare_insert(&f.pool, &f.enabled);
        let mut table = f.part.latch.write();

        let old = rec(&f, 0);
        let new = rec(&f, 32);
        assert!(f.part.insert(&mut table, &f.pool, 9, old));
        assert!(f.part.update_if_found(&mut table, &f.pool, 9, old, new));
        assert_eq!(table.lookup(9).unwrap().rec, new);
        assert!(!f.part.update_if_found(&mut table, &f.pool, 9, old, new));
        assert_eq!(f.pool.block(f.page_block).ahi.n_pointers(), 1);
    }
}
