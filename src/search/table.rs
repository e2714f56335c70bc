//! Open-chaining hash table over arena-allocated nodes.
//!
//! Cells hold the heads of singly linked chains of [`AhiNode`]s living in
//! the partition's slab arena. All chain access happens under the
//! partition latch: shared for walking, exclusive for any mutation. The
//! table itself stores nothing but pointers; node memory belongs to the
//! arena, and compaction may move a node, fixing the one chain link that
//! pointed at it.

use std::ptr;

use crate::page::RecPtr;
use crate::utility::is_power_of_two;

/// One chain node: a fold and the record it points at.
///
/// Nodes are bump-allocated from page-sized slabs; they are never
/// individually heap-allocated. The owning block of `rec` is derived from
/// the address via the buffer pool, not stored.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct AhiNode {
    /// CRC-32C of the record prefix
    pub(crate) fold: u32,
    /// Next node in the cell chain, or null
    pub(crate) next: *mut AhiNode,
    /// B-tree leaf page record
    pub(crate) rec: RecPtr,
}

/// Size of one chain node in the arena
pub(crate) const NODE_SIZE: usize = std::mem::size_of::<AhiNode>();

/// Head of one hash chain
#[derive(Clone, Copy)]
pub(crate) struct Cell {
    pub(crate) node: *mut AhiNode,
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            node: ptr::null_mut(),
        }
    }
}

/// The cell array. Empty (zero cells) while the hash index is disabled.
pub(crate) struct HashTable {
    cells: Box<[Cell]>,
}

// Safety: chain pointers are only dereferenced under the partition latch
// wrapping this table; the latch provides the synchronization.
unsafe impl Send for HashTable {}
unsafe impl Sync for HashTable {}

impl HashTable {
    /// An uninitialized (disabled) table
    pub(crate) fn empty() -> Self {
        Self {
            cells: Box::new([]),
        }
    }

    /// Allocate `n_cells` empty cells. `n_cells` must be a power of two.
    pub(crate) fn create(n_cells: usize) -> Self {
        assert!(is_power_of_two(n_cells as u64));
        Self {
            cells: vec![Cell::default(); n_cells].into_boxed_slice(),
        }
    }

    /// Whether the cell array is allocated
    #[inline]
    pub(crate) fn is_initialized(&self) -> bool {
        !self.cells.is_empty()
    }

    /// Number of cells
    #[inline]
    pub(crate) fn n_cells(&self) -> usize {
        self.cells.len()
    }

    /// Cell index of a fold
    #[inline]
    pub(crate) fn cell_index(&self, fold: u32) -> usize {
        debug_assert!(self.is_initialized());
        fold as usize & (self.cells.len() - 1)
    }

    /// Head of the chain a fold hashes to
    #[inline]
    pub(crate) fn chain_head(&self, fold: u32) -> *mut AhiNode {
        self.cells[self.cell_index(fold)].node
    }

    /// Head of the chain at a cell index
    #[inline]
    pub(crate) fn chain_head_at(&self, cell: usize) -> *mut AhiNode {
        self.cells[cell].node
    }

    /// First node in the chain with a matching fold.
    ///
    /// Caller holds the partition latch at least in shared mode. No record
    /// identity check; the caller validates against the live page.
    pub(crate) fn lookup(&self, fold: u32) -> Option<&AhiNode> {
        if !self.is_initialized() {
            return None;
        }
        let mut node = self.chain_head(fold);
        while !node.is_null() {
            // SAFETY: chain nodes are live arena nodes while the partition
            // latch is held (invariant I2).
            unsafe {
                if (*node).fold == fold {
                    return Some(&*node);
                }
                node = (*node).next;
            }
        }
        None
    }

    /// Pointer to the head link of a cell's chain
    #[inline]
    pub(crate) fn head_slot(&mut self, cell: usize) -> *mut *mut AhiNode {
        ptr::addr_of_mut!(self.cells[cell].node)
    }

    /// The link (cell head or a node's `next`) that points at `target`.
    ///
    /// Caller holds the partition latch exclusively; `target` must be
    /// reachable from the cell its fold hashes to (invariant I2).
    pub(crate) fn link_to(&mut self, fold: u32, target: *mut AhiNode) -> *mut *mut AhiNode {
        let i = self.cell_index(fold);
        let mut prev: *mut *mut AhiNode = ptr::addr_of_mut!(self.cells[i].node);
        // SAFETY: walking live chain nodes under the exclusive latch.
        unsafe {
            while *prev != target {
                debug_assert!(!(*prev).is_null(), "node not reachable from its cell");
                prev = ptr::addr_of_mut!((**prev).next);
            }
        }
        prev
    }

    /// Append a node at the tail of its chain.
    ///
    /// Caller holds the partition latch exclusively. The node's `next`
    /// must already be null.
    pub(crate) fn append(&mut self, node: *mut AhiNode) {
        // SAFETY: `node` is a freshly initialized arena node owned by the
        // caller; chain walked under the exclusive latch.
        unsafe {
            debug_assert!((*node).next.is_null());
            let i = self.cell_index((*node).fold);
            let mut prev: *mut *mut AhiNode = ptr::addr_of_mut!(self.cells[i].node);
            while !(*prev).is_null() {
                prev = ptr::addr_of_mut!((**prev).next);
            }
            *prev = node;
        }
    }

    /// Release the cell array
    pub(crate) fn destroy(&mut self) {
        self.cells = Box::new([]);
    }
}

impl Default for HashTable {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Debug for HashTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashTable")
            .field("n_cells", &self.n_cells())
            .finish()
    }
}
