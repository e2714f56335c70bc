//! Bump-allocated node arena over buffer-pool frames.
//!
//! Chain nodes live inside page-sized slabs taken from the buffer pool.
//! Allocation always bumps the last slab; erase compacts by moving the top
//! node into the hole, so the arena has no free list and both operations
//! are O(1). An emptied slab is kept as the spare (so that a latched
//! insert path never has to call into the buffer pool) or returned.
//!
//! All structure here (slab list, offsets, spare) is guarded by the
//! partition's arena mutex; node *contents* are guarded by the partition
//! latch.

use crate::buffer::SlabFrame;
use crate::constants::PAGE_SIZE;

use super::table::{AhiNode, NODE_SIZE};

struct Slab {
    frame: SlabFrame,
    /// Bytes in use; grows under allocation, shrinks under erase.
    free_offset: usize,
}

/// Slab list plus the pre-allocated spare
pub(crate) struct NodeArena {
    slabs: Vec<Slab>,
    spare: Option<SlabFrame>,
}

// Safety: frame pointers are only dereferenced by the partition while it
// holds the appropriate latches.
unsafe impl Send for NodeArena {}

impl NodeArena {
    pub(crate) fn new() -> Self {
        Self {
            slabs: Vec::new(),
            spare: None,
        }
    }

    /// Whether a spare slab is available
    pub(crate) fn has_spare(&self) -> bool {
        self.spare.is_some()
    }

    /// Install a pre-allocated spare slab
    pub(crate) fn install_spare(&mut self, frame: SlabFrame) {
        debug_assert!(self.spare.is_none());
        self.spare = Some(frame);
    }

    /// Whether no node is live
    pub(crate) fn is_empty(&self) -> bool {
        self.slabs.is_empty()
    }

    /// Number of slabs holding live nodes
    pub(crate) fn n_slabs(&self) -> usize {
        self.slabs.len()
    }

    /// Bytes in use on the last slab
    pub(crate) fn last_free_offset(&self) -> usize {
        self.slabs.last().map(|s| s.free_offset).unwrap_or(0)
    }

    /// Number of live nodes across all slabs
    pub(crate) fn n_nodes(&self) -> usize {
        self.slabs.iter().map(|s| s.free_offset / NODE_SIZE).sum()
    }

    /// Bump-allocate one node.
    ///
    /// Uses the last slab if it has room, else promotes the spare to a new
    /// last slab. Returns `None` when neither is possible; the caller
    /// silently drops the insertion.
    pub(crate) fn alloc_node(&mut self) -> Option<*mut AhiNode> {
        if let Some(last) = self.slabs.last_mut() {
            if last.free_offset + NODE_SIZE <= PAGE_SIZE {
                // SAFETY: the slab frame spans PAGE_SIZE bytes.
                let node = unsafe { last.frame.frame.add(last.free_offset) } as *mut AhiNode;
                last.free_offset += NODE_SIZE;
                return Some(node);
            }
        }
        let frame = self.spare.take()?;
        let node = frame.frame as *mut AhiNode;
        self.slabs.push(Slab {
            frame,
            free_offset: NODE_SIZE,
        });
        Some(node)
    }

    /// The node at the top of the last slab.
    ///
    /// Must not be called on an empty arena: while any node is live the
    /// last slab is non-empty (invariant I3).
    pub(crate) fn top_node(&self) -> *mut AhiNode {
        let last = self.slabs.last().expect("arena empty during erase");
        debug_assert!(last.free_offset >= NODE_SIZE);
        // SAFETY: top node lies within the slab frame.
        unsafe { last.frame.frame.add(last.free_offset - NODE_SIZE) as *mut AhiNode }
    }

    /// Give back the top node slot after a compaction.
    ///
    /// If the last slab becomes empty it is detached: kept as the spare
    /// when none exists, otherwise returned to the caller for release to
    /// the buffer pool.
    pub(crate) fn shrink_top(&mut self) -> Option<SlabFrame> {
        let last = self.slabs.last_mut().expect("arena empty during erase");
        debug_assert!(last.free_offset >= NODE_SIZE);
        last.free_offset -= NODE_SIZE;
        if last.free_offset > 0 {
            return None;
        }
        let slab = self.slabs.pop().expect("last slab vanished");
        if self.spare.is_none() {
            self.spare = Some(slab.frame);
            None
        } else {
            Some(slab.frame)
        }
    }

    /// Detach every slab and the spare for release to the buffer pool
    pub(crate) fn take_all(&mut self) -> Vec<SlabFrame> {
        let mut frames: Vec<SlabFrame> = self.slabs.drain(..).map(|s| s.frame).collect();
        if let Some(spare) = self.spare.take() {
            frames.push(spare);
        }
        frames
    }
}
