//! Mini-transaction: ownership of page latches.
//!
//! A mini-transaction registers every page latch taken during an operation
//! and releases them (and the block pins) together when it is dropped. The
//! hash lookup fast path pushes its non-blocking latch here so that a
//! failed validation can undo exactly the last page.

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::buffer::Block;

/// Leaf latch mode requested by a cursor positioning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchMode {
    /// Shared leaf latch (plain searches)
    Search,
    /// Exclusive leaf latch (searches that will modify the leaf)
    Modify,
}

pub(crate) enum PageGuard<'a> {
    S(RwLockReadGuard<'a, ()>),
    X(RwLockWriteGuard<'a, ()>),
}

/// Latch set of one mini-transaction
#[derive(Default)]
pub struct Mtr<'a> {
    pages: Vec<(&'a Block, PageGuard<'a>)>,
}

impl<'a> Mtr<'a> {
    /// Start an empty mini-transaction
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch a page in shared mode and register it
    pub fn s_latch(&mut self, block: &'a Block) {
        let guard = block.latch.read();
        block.fix();
        self.pages.push((block, PageGuard::S(guard)));
    }

    /// Latch a page in exclusive mode and register it
    pub fn x_latch(&mut self, block: &'a Block) {
        let guard = block.latch.write();
        block.fix();
        self.pages.push((block, PageGuard::X(guard)));
    }

    /// Register an already-acquired latch. The block must have been fixed
    /// by the caller.
    pub(crate) fn push_latched(&mut self, block: &'a Block, guard: PageGuard<'a>) {
        self.pages.push((block, guard));
    }

    /// Release the most recently registered page latch and pin
    pub fn release_last_page(&mut self) {
        if let Some((block, guard)) = self.pages.pop() {
            drop(guard);
            block.unfix();
        }
    }

    /// Number of registered page latches
    pub fn n_latched(&self) -> usize {
        self.pages.len()
    }

    /// Release all latches and pins
    pub fn commit(self) {}
}

impl Drop for Mtr<'_> {
    fn drop(&mut self) {
        while let Some((block, guard)) = self.pages.pop() {
            drop(guard);
            block.unfix();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferPool, PageId};
    use crate::config::PoolConfig;
    use crate::dict::IndexId;

    #[test]
    fn test_mtr_releases_latches_and_pins() {
        let pool = BufferPool::new(&PoolConfig { n_pages: 2 });
        let id = pool.create_page(PageId(1), IndexId(1), true).unwrap();
        let block = pool.block(id);

        {
            let mut mtr = Mtr::new();
            mtr.s_latch(block);
            assert_eq!(block.fix_count(), 1);
            assert_eq!(mtr.n_latched(), 1);
            assert!(block.latch.try_write().is_none());
        }
        assert_eq!(block.fix_count(), 0);
        assert!(block.latch.try_write().is_some());
    }

    #[test]
    fn test_release_last_page() {
        let pool = BufferPool::new(&PoolConfig { n_pages: 2 });
        let a = pool.create_page(PageId(1), IndexId(1), true).unwrap();
        let b = pool.create_page(PageId(2), IndexId(1), true).unwrap();

        let mut mtr = Mtr::new();
        mtr.s_latch(pool.block(a));
        mtr.x_latch(pool.block(b));
        mtr.release_last_page();
        assert_eq!(mtr.n_latched(), 1);
        assert!(pool.block(b).latch.try_write().is_some());
        assert!(pool.block(a).latch.try_write().is_none());
        mtr.commit();
        assert_eq!(pool.block(a).fix_count(), 0);
    }
}
