//! Buffer-pool block descriptors.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::dict::Index;
use crate::page::Page;

use super::{BlockId, PageId};

/// State of a buffer-pool block
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum BlockState {
    /// On the free list
    Free = 0,
    /// In use as plain memory (an AHI arena slab)
    Memory = 1,
    /// Page being removed from the pool; still reachable through record
    /// addresses until its hash entries are dropped
    RemoveHash = 2,
    /// Resident page, not latched for I/O
    Unfixed = 3,
    /// Resident page being read in
    ReadFix = 4,
    /// Resident page being written out
    WriteFix = 5,
}

impl BlockState {
    #[inline]
    fn from_u32(v: u32) -> Self {
        match v {
            0 => BlockState::Free,
            1 => BlockState::Memory,
            2 => BlockState::RemoveHash,
            3 => BlockState::Unfixed,
            4 => BlockState::ReadFix,
            5 => BlockState::WriteFix,
            _ => unreachable!("invalid block state"),
        }
    }

    /// Whether a page in this state is resident and may be latched
    #[inline]
    pub fn is_resident(self) -> bool {
        self >= BlockState::Unfixed
    }
}

/// Adaptive hash index metadata of one block.
///
/// The `curr_*` fields describe the prefix shape installed on the page and
/// change only under the partition exclusive latch. The unprefixed fields
/// are the candidate shape the heuristic is observing; they are read and
/// written without any latch, so readers must tolerate torn values.
#[derive(Debug, Default)]
pub struct BlockAhi {
    /// Index the page is hashed for
    index: RwLock<Option<Arc<Index>>>,
    /// Installed number of complete prefix fields
    curr_n_fields: AtomicU16,
    /// Installed number of bytes of the next field
    curr_n_bytes: AtomicU16,
    /// Installed anchor side of equal-fold runs
    curr_left_side: AtomicBool,
    /// Successful-search vote counter for the candidate shape
    n_hash_helps: AtomicU32,
    /// Candidate number of complete prefix fields
    n_fields: AtomicU16,
    /// Candidate number of bytes of the next field
    n_bytes: AtomicU16,
    /// Candidate anchor side
    left_side: AtomicBool,
    /// Hash nodes pointing into this page
    n_pointers: AtomicU32,
}

impl BlockAhi {
    /// Index this page is hashed for, if any
    pub fn index(&self) -> Option<Arc<Index>> {
        self.index.read().clone()
    }

    /// Install an index and prefix shape on the block.
    ///
    /// Caller holds the partition exclusive latch.
    pub(crate) fn install(&self, index: Arc<Index>, n_fields: u16, n_bytes: u16, left_side: bool) {
        self.curr_n_fields.store(n_fields, Ordering::Relaxed);
        self.curr_n_bytes.store(n_bytes, Ordering::Relaxed);
        self.curr_left_side.store(left_side, Ordering::Relaxed);
        *self.index.write() = Some(index);
    }

    /// Clear the installed index. Caller holds the partition exclusive
    /// latch (or the block is otherwise unreachable).
    pub(crate) fn clear_index(&self) -> Option<Arc<Index>> {
        self.index.write().take()
    }

    /// Installed number of complete prefix fields
    #[inline]
    pub fn curr_n_fields(&self) -> u16 {
        self.curr_n_fields.load(Ordering::Relaxed)
    }

    /// Installed number of bytes of the next field
    #[inline]
    pub fn curr_n_bytes(&self) -> u16 {
        self.curr_n_bytes.load(Ordering::Relaxed)
    }

    /// Installed anchor side of equal-fold runs
    #[inline]
    pub fn curr_left_side(&self) -> bool {
        self.curr_left_side.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn n_hash_helps(&self) -> u32 {
        self.n_hash_helps.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_n_hash_helps(&self, v: u32) {
        self.n_hash_helps.store(v, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_n_hash_helps(&self) {
        self.n_hash_helps.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn candidate_n_fields(&self) -> u16 {
        self.n_fields.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn candidate_n_bytes(&self) -> u16 {
        self.n_bytes.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn candidate_left_side(&self) -> bool {
        self.left_side.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_candidate(&self, n_fields: u16, n_bytes: u16, left_side: bool) {
        self.n_fields.store(n_fields, Ordering::Relaxed);
        self.n_bytes.store(n_bytes, Ordering::Relaxed);
        self.left_side.store(left_side, Ordering::Relaxed);
    }

    /// Number of hash nodes pointing into this page
    #[inline]
    pub fn n_pointers(&self) -> u32 {
        self.n_pointers.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn inc_n_pointers(&self) {
        self.n_pointers.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn dec_n_pointers(&self) {
        let prev = self.n_pointers.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "n_pointers underflow");
    }

    #[inline]
    pub(crate) fn zero_n_pointers(&self) {
        self.n_pointers.store(0, Ordering::Relaxed);
    }

    pub(crate) fn reset(&self) {
        *self.index.write() = None;
        self.curr_n_fields.store(0, Ordering::Relaxed);
        self.curr_n_bytes.store(0, Ordering::Relaxed);
        self.curr_left_side.store(false, Ordering::Relaxed);
        self.n_hash_helps.store(0, Ordering::Relaxed);
        self.n_fields.store(0, Ordering::Relaxed);
        self.n_bytes.store(0, Ordering::Relaxed);
        self.left_side.store(false, Ordering::Relaxed);
        self.n_pointers.store(0, Ordering::Relaxed);
    }
}

/// One buffer-pool frame and its control data
#[derive(Debug)]
pub struct Block {
    id: BlockId,
    frame: *mut u8,
    page_id: AtomicU32,
    state: AtomicU32,
    fix_count: AtomicU32,
    /// Page latch. Shared for reads of the page contents, exclusive for
    /// modifications.
    pub latch: RwLock<()>,
    /// Adaptive hash index metadata
    pub ahi: BlockAhi,
}

// Safety: the frame pointer is only dereferenced under the page latch (or
// while the block is otherwise unreachable); all other fields are atomics
// or locks.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

pub(crate) const NO_PAGE: u32 = u32::MAX;

impl Block {
    pub(crate) fn new(id: BlockId, frame: *mut u8) -> Self {
        Self {
            id,
            frame,
            page_id: AtomicU32::new(NO_PAGE),
            state: AtomicU32::new(BlockState::Free as u32),
            fix_count: AtomicU32::new(0),
            latch: RwLock::new(()),
            ahi: BlockAhi::default(),
        }
    }

    /// Block id within the pool
    #[inline]
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Current page id, if the block holds a page
    #[inline]
    pub fn page_id(&self) -> Option<PageId> {
        let v = self.page_id.load(Ordering::Acquire);
        (v != NO_PAGE).then_some(PageId(v))
    }

    #[inline]
    pub(crate) fn set_page_id(&self, page_id: Option<PageId>) {
        self.page_id
            .store(page_id.map(|p| p.0).unwrap_or(NO_PAGE), Ordering::Release);
    }

    /// Current block state
    #[inline]
    pub fn state(&self) -> BlockState {
        BlockState::from_u32(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: BlockState) {
        self.state.store(state as u32, Ordering::Release);
    }

    /// Raw frame pointer
    #[inline]
    pub(crate) fn frame(&self) -> *mut u8 {
        self.frame
    }

    /// View of the page in this frame
    #[inline]
    pub fn page(&self) -> Page {
        // SAFETY: the frame stays allocated for the pool's lifetime.
        unsafe { Page::from_frame(self.frame) }
    }

    /// Pin the block against eviction
    #[inline]
    pub fn fix(&self) {
        self.fix_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Release a pin
    #[inline]
    pub fn unfix(&self) {
        let prev = self.fix_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "fix count underflow");
    }

    /// Current pin count
    #[inline]
    pub fn fix_count(&self) -> u32 {
        self.fix_count.load(Ordering::Acquire)
    }
}
