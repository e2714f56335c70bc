//! oxisearch - adaptive hash search for an embedded B-tree storage engine
//!
//! An opportunistic in-memory hash index layered on top of the buffer pool:
//! for leaf pages that are searched repeatedly with the same key-prefix
//! shape, the engine materializes a hash table mapping folded key prefixes
//! to record addresses, so that point lookups can skip the tree descent and
//! jump straight to the record inside its page.
//!
//! The index is never authoritative. Any entry may be dropped at any time;
//! a miss only costs a regular tree search. It offers no durability, no
//! ordered iteration and no range queries.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use oxisearch::prelude::*;
//!
//! let pool = Arc::new(BufferPool::new(&PoolConfig::default()));
//! let dict = Arc::new(Dictionary::new());
//! let ahi = AhiSystem::new(AhiConfig::default(), pool, dict);
//!
//! // After every tree positioning that did not come from the hash index:
//! ahi.info_update(&cursor);
//!
//! // Fast path for the next positioning:
//! let mut mtr = Mtr::new();
//! if ahi.guess_on_hash(&index, &tuple, SearchMode::Ge, LatchMode::Search,
//!                      &mut cursor, &mut mtr) {
//!     // cursor is positioned, page latched in mtr
//! }
//! ```

#![warn(missing_docs)]
#![allow(dead_code)]

pub mod buffer;
pub mod config;
pub mod cursor;
pub mod dict;
pub mod fold;
pub mod mtr;
pub mod page;
pub mod search;
pub mod stats;
mod utility;

// Re-exports for convenience
pub use buffer::{BlockId, BufferPool, PageId};
pub use config::{AhiConfig, OxisearchConfig, PoolConfig};
pub use cursor::{Cursor, CursorFlag};
pub use dict::{Dictionary, Index, IndexId, Table, Tuple};
pub use mtr::{LatchMode, Mtr};
pub use page::SearchMode;
pub use search::AhiSystem;

/// Constants used throughout the library
pub mod constants {
    /// Size of a cache line in bytes
    pub const CACHE_LINE_BYTES: usize = 64;

    /// Size of a buffer-pool page frame in bytes
    pub const PAGE_SIZE: usize = 16 * 1024;

    /// If the number of records on a page divided by this parameter would
    /// have been successfully accessed through the hash index, the index is
    /// built on the page (once the global potential limit is also reached).
    pub const BUILD_PER_PAGE_LIMIT: u32 = 16;

    /// Consecutive potentially successful hash searches required before
    /// page hash index building is started.
    pub const BUILD_POTENTIAL_LIMIT: u32 = 100;

    /// Upper bound for a fixed-length field declaration.
    pub const MAX_FIXED_LEN: usize = 512;
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::buffer::{BlockId, BufferPool, PageId};
    pub use crate::config::{AhiConfig, PoolConfig};
    pub use crate::cursor::{Cursor, CursorFlag};
    pub use crate::dict::{Dictionary, Index, IndexId, Table, Tuple};
    pub use crate::mtr::{LatchMode, Mtr};
    pub use crate::page::SearchMode;
    pub use crate::search::AhiSystem;
}
