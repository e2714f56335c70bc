//! Buffer pool: page frames and block management.
//!
//! One contiguous page-aligned chunk backs all frames, so any address
//! inside a frame maps back to its block with plain arithmetic
//! ([`BufferPool::block_from_ahi`]). Besides pages, frames double as the
//! arena slabs that hold adaptive hash index chain nodes.

pub(crate) mod block;

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::PoolConfig;
use crate::constants::{CACHE_LINE_BYTES, PAGE_SIZE};
use crate::dict::{Index, IndexId};
use crate::utility::{AlignedBuffer, next_power_of_two};

pub use block::{Block, BlockAhi, BlockState};

/// Identifier of a page within a tablespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(pub u32);

/// Index of a block within the buffer pool
pub type BlockId = usize;

/// A whole frame handed out to the hash-node arena.
#[derive(Debug)]
pub(crate) struct SlabFrame {
    pub(crate) block_id: BlockId,
    pub(crate) frame: *mut u8,
}

// Safety: the frame belongs to the pool chunk; access is synchronized by
// the arena mutex.
unsafe impl Send for SlabFrame {}

/// One page-hash cell: a latch over the page-id mapping entries that hash
/// to it. Aligned to avoid false sharing between cells.
#[repr(align(64))]
#[derive(Debug, Default)]
pub struct PageHashCell {
    /// Cell latch plus the `(page, block)` entries hashing to this cell
    pub(crate) entries: RwLock<Vec<(PageId, BlockId)>>,
}

const _: () = assert!(std::mem::align_of::<PageHashCell>() == CACHE_LINE_BYTES);

/// Page-id to block mapping, partitioned into independently latched cells
#[derive(Debug)]
pub struct PageHash {
    cells: Box<[PageHashCell]>,
    mask: usize,
}

impl PageHash {
    fn new(n_pages: usize) -> Self {
        let n_cells = next_power_of_two((n_pages as u64 / 4).max(8)) as usize;
        let cells = (0..n_cells)
            .map(|_| PageHashCell::default())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            cells,
            mask: n_cells - 1,
        }
    }

    /// Cell responsible for a page id
    #[inline]
    pub fn cell_for(&self, page_id: PageId) -> &PageHashCell {
        &self.cells[page_id.0 as usize & self.mask]
    }

    fn insert(&self, page_id: PageId, block_id: BlockId) {
        self.cell_for(page_id).entries.write().push((page_id, block_id));
    }

    fn remove(&self, page_id: PageId) {
        self.cell_for(page_id)
            .entries
            .write()
            .retain(|(p, _)| *p != page_id);
    }

    fn get(&self, page_id: PageId) -> Option<BlockId> {
        self.cell_for(page_id)
            .entries
            .read()
            .iter()
            .find(|(p, _)| *p == page_id)
            .map(|(_, b)| *b)
    }
}

/// The buffer pool
pub struct BufferPool {
    chunk: AlignedBuffer,
    blocks: Box<[Block]>,
    free_list: Mutex<Vec<BlockId>>,
    page_hash: PageHash,
}

// Safety: frames are only dereferenced under page latches; block control
// data is atomics and locks.
unsafe impl Send for BufferPool {}
unsafe impl Sync for BufferPool {}

impl BufferPool {
    /// Create a pool with `config.n_pages` frames
    pub fn new(config: &PoolConfig) -> Self {
        let n_pages = config.n_pages.max(1);
        let chunk = AlignedBuffer::zeroed(PAGE_SIZE, n_pages * PAGE_SIZE);
        let base = chunk.as_mut_ptr();
        let blocks = (0..n_pages)
            // SAFETY: frame i lies inside the chunk allocation.
            .map(|i| Block::new(i, unsafe { base.add(i * PAGE_SIZE) }))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let free_list = Mutex::new((0..n_pages).rev().collect());
        Self {
            chunk,
            blocks,
            free_list,
            page_hash: PageHash::new(n_pages),
        }
    }

    /// Number of frames in the pool
    #[inline]
    pub fn n_pages(&self) -> usize {
        self.blocks.len()
    }

    /// Total frame bytes in the pool
    #[inline]
    pub fn size_bytes(&self) -> usize {
        self.chunk.size()
    }

    /// Block descriptor by id
    #[inline]
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id]
    }

    /// The page-id mapping
    #[inline]
    pub fn page_hash(&self) -> &PageHash {
        &self.page_hash
    }

    /// Map an address inside a frame to its owning block.
    ///
    /// This is how the hash index finds the page of a stored record
    /// address; nodes carry no block pointer.
    pub fn block_from_ahi(&self, ptr: *const u8) -> &Block {
        let base = self.chunk.as_ptr() as usize;
        let addr = ptr as usize;
        debug_assert!(addr >= base && addr < base + self.chunk.size());
        let offs = (addr - base) / PAGE_SIZE;
        &self.blocks[offs]
    }

    /// Whether an address lies inside the pool chunk
    pub(crate) fn contains(&self, ptr: *const u8) -> bool {
        let base = self.chunk.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= base && addr < base + self.chunk.size()
    }

    /// Materialize an empty leaf page in a free frame.
    ///
    /// Returns `None` when the pool is full or the page already exists.
    pub fn create_page(&self, page_id: PageId, index_id: IndexId, leaf: bool) -> Option<BlockId> {
        if self.page_hash.get(page_id).is_some() {
            return None;
        }
        let id = self.free_list.lock().pop()?;
        let block = &self.blocks[id];
        debug_assert_eq!(block.state(), BlockState::Free);
        block.ahi.reset();
        block.page().init(index_id, page_id.0, leaf);
        block.set_page_id(Some(page_id));
        block.set_state(BlockState::Unfixed);
        self.page_hash.insert(page_id, id);
        Some(id)
    }

    /// Look up a resident page
    pub fn lookup_page(&self, page_id: PageId) -> Option<BlockId> {
        self.page_hash.get(page_id)
    }

    /// Detach a page from the page hash, transitioning the block to
    /// [`BlockState::RemoveHash`]. The frame stays readable until
    /// [`BufferPool::discard_block`].
    pub(crate) fn remove_page(&self, page_id: PageId) -> Option<BlockId> {
        let id = self.page_hash.get(page_id)?;
        self.page_hash.remove(page_id);
        let block = &self.blocks[id];
        block.set_state(BlockState::RemoveHash);
        Some(id)
    }

    /// Return a block to the free list
    pub(crate) fn discard_block(&self, id: BlockId) {
        let block = &self.blocks[id];
        debug_assert_eq!(block.fix_count(), 0);
        block.set_page_id(None);
        block.ahi.reset();
        block.set_state(BlockState::Free);
        self.free_list.lock().push(id);
    }

    /// Take a whole frame for use as a hash-node arena slab
    pub(crate) fn alloc_slab(&self) -> Option<SlabFrame> {
        let id = self.free_list.lock().pop()?;
        let block = &self.blocks[id];
        debug_assert_eq!(block.state(), BlockState::Free);
        block.set_state(BlockState::Memory);
        Some(SlabFrame {
            block_id: id,
            frame: block.frame(),
        })
    }

    /// Return an arena slab frame to the free list
    pub(crate) fn free_slab(&self, slab: SlabFrame) {
        let block = &self.blocks[slab.block_id];
        debug_assert_eq!(block.state(), BlockState::Memory);
        block.set_state(BlockState::Free);
        self.free_list.lock().push(slab.block_id);
    }

    /// Clear the hash metadata of every block.
    ///
    /// Called while disabling the hash index, with the partition latch held
    /// exclusively. Returns the freed indexes whose last references were
    /// held by hashed pages, for lazy release.
    pub(crate) fn clear_hash_index(&self) -> Vec<Arc<Index>> {
        let mut garbage: Vec<Arc<Index>> = Vec::new();
        for block in self.blocks.iter() {
            block.ahi.zero_n_pointers();
            if let Some(index) = block.ahi.clear_index() {
                if index.is_freed() && !garbage.iter().any(|i| Arc::ptr_eq(i, &index)) {
                    garbage.push(index);
                }
            }
        }
        garbage
    }

    /// Number of free frames
    pub fn free_count(&self) -> usize {
        self.free_list.lock().len()
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("n_pages", &self.n_pages())
            .field("free", &self.free_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> BufferPool {
        BufferPool::new(&PoolConfig { n_pages: n })
    }

    #[test]
    fn test_create_and_lookup_page() {
        let pool = pool(4);
        let id = pool.create_page(PageId(1), IndexId(7), true).unwrap();
        assert_eq!(pool.lookup_page(PageId(1)), Some(id));
        assert_eq!(pool.block(id).state(), BlockState::Unfixed);
        assert_eq!(pool.block(id).page().index_id(), IndexId(7));
        assert!(pool.create_page(PageId(1), IndexId(7), true).is_none());
    }

    #[test]
    fn test_block_from_ahi_maps_addresses() {
        let pool = pool(4);
        let a = pool.create_page(PageId(1), IndexId(7), true).unwrap();
        let b = pool.create_page(PageId(2), IndexId(7), true).unwrap();
        let block_b = pool.block(b);
        let inside = unsafe { block_b.frame().add(123) };
        assert_eq!(pool.block_from_ahi(inside).id(), b);
        let first = pool.block(a).frame() as *const u8;
        assert_eq!(pool.block_from_ahi(first).id(), a);
    }

    #[test]
    fn test_slab_alloc_and_free() {
        let pool = pool(2);
        let free_before = pool.free_count();
        let slab = pool.alloc_slab().unwrap();
        assert_eq!(pool.block(slab.block_id).state(), BlockState::Memory);
        assert_eq!(pool.free_count(), free_before - 1);
        pool.free_slab(slab);
        assert_eq!(pool.free_count(), free_before);
    }

    #[test]
    fn test_pool_exhaustion() {
        let pool = pool(2);
        assert!(pool.create_page(PageId(1), IndexId(1), true).is_some());
        assert!(pool.create_page(PageId(2), IndexId(1), true).is_some());
        assert!(pool.create_page(PageId(3), IndexId(1), true).is_none());
        assert!(pool.alloc_slab().is_none());
    }

    #[test]
    fn test_remove_page_transitions_state() {
        let pool = pool(2);
        let id = pool.create_page(PageId(5), IndexId(1), true).unwrap();
        let removed = pool.remove_page(PageId(5)).unwrap();
        assert_eq!(removed, id);
        assert_eq!(pool.block(id).state(), BlockState::RemoveHash);
        assert_eq!(pool.lookup_page(PageId(5)), None);
        pool.discard_block(id);
        assert_eq!(pool.block(id).state(), BlockState::Free);
        assert_eq!(pool.free_count(), 2);
    }
}
