//! The adaptive hash index.
//!
//! An opportunistic hash index over B-tree leaf pages: cursor positionings
//! feed a self-tuning heuristic ([`AhiSystem::info_update`]); once a page
//! is worth indexing, its records are hashed by key prefix
//! (`build_page_hash_index`); later positionings can then jump straight to
//! the record ([`AhiSystem::guess_on_hash`]). The index is disposable by
//! construction: any entry may be dropped at any time, any miss falls back
//! to a tree search, and no error ever crosses this module's boundary.

mod arena;
mod build;
mod guess;
mod heuristic;
mod partition;
pub(crate) mod table;
mod validate;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::buffer::BufferPool;
use crate::config::AhiConfig;
use crate::dict::{Dictionary, Index};
use crate::stats::AhiStats;
use crate::utility::next_power_of_two;

use partition::Partition;
use table::HashTable;

/// The adaptive hash index system
pub struct AhiSystem {
    /// Master switch; checked again under the partition latch by every
    /// operation
    pub(crate) enabled: AtomicBool,
    /// The hash partition (single partition in the current layout)
    pub(crate) part: Partition,
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) dict: Arc<Dictionary>,
    pub(crate) config: AhiConfig,
    /// Activity counters
    pub stats: AhiStats,
}

impl AhiSystem {
    /// Create the hash index system; enables it when the configuration
    /// says so.
    pub fn new(config: AhiConfig, pool: Arc<BufferPool>, dict: Arc<Dictionary>) -> Self {
        let system = Self {
            enabled: AtomicBool::new(false),
            part: Partition::new(),
            pool,
            dict,
            config,
            stats: AhiStats::new(),
        };
        if system.config.enabled {
            system.enable();
        }
        system
    }

    /// Whether the hash index is enabled
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// The buffer pool this system indexes into
    #[inline]
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Enable the adaptive hash index.
    ///
    /// Sizes the cell array from the buffer pool; enabling an already
    /// enabled system is a no-op.
    pub fn enable(&self) {
        let mut table = self.part.latch.write();
        if table.is_initialized() {
            debug_assert!(self.is_enabled());
            return;
        }
        let n_cells = hash_table_cells(self.pool.size_bytes());
        *table = HashTable::create(n_cells);
        self.enabled.store(true, Ordering::Release);
        tracing::info!(n_cells, "adaptive hash index enabled");
    }

    /// Disable the adaptive hash index and purge everything.
    ///
    /// Clears every index's page reference count, every block's hash
    /// metadata, the cell array and all arena slabs. In-flight lookups
    /// either completed before this observed the flag under the latch or
    /// fail and fall back to a tree search.
    pub fn disable(&self) {
        let frozen = self.dict.freeze();
        let mut table = self.part.latch.write();
        if !self.is_enabled() {
            return;
        }
        self.enabled.store(false, Ordering::Release);

        for t in frozen.iter() {
            for index in t.indexes() {
                index.search_info.zero_ref_count();
            }
            for index in t.freed_indexes() {
                index.search_info.zero_ref_count();
            }
        }
        drop(frozen);

        let garbage = self.pool.clear_hash_index();
        table.destroy();
        let frames = self.part.arena.lock().take_all();
        drop(table);

        for frame in frames {
            self.pool.free_slab(frame);
        }
        for index in garbage {
            self.lazy_free(&index);
        }
        tracing::info!("adaptive hash index disabled");
    }

    /// Release a freed index whose last hashed page is gone.
    pub(crate) fn lazy_free(&self, index: &Arc<Index>) {
        debug_assert!(index.is_freed());
        debug_assert_eq!(index.search_info.ref_count(), 0);
        if let Some(table) = index.table() {
            let table_empty = table.release_freed_index(index);
            tracing::debug!(index = %index.id(), table_empty, "lazily freed index");
        }
    }

    /// Number of cells in the hash table (0 while disabled)
    pub fn n_cells(&self) -> usize {
        self.part.latch.read().n_cells()
    }

    /// Number of live hash nodes
    pub fn n_hash_nodes(&self) -> usize {
        self.part.arena.lock().n_nodes()
    }

    /// Number of arena slabs holding live nodes
    pub fn n_slabs(&self) -> usize {
        self.part.arena.lock().n_slabs()
    }

    /// Whether a spare slab is standing by
    pub fn has_spare_slab(&self) -> bool {
        self.part.arena.lock().has_spare()
    }

    /// Refill the spare arena slab outside any latched section.
    ///
    /// Called by the cursor layer before operations that may insert hash
    /// entries while holding latches.
    pub fn prepare_insert(&self) {
        self.part.prepare_insert(&self.pool, &self.enabled);
    }
}

impl std::fmt::Debug for AhiSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AhiSystem")
            .field("enabled", &self.is_enabled())
            .field("n_cells", &self.n_cells())
            .field("n_hash_nodes", &self.n_hash_nodes())
            .finish()
    }
}

/// Cell count for a pool size: one cell for every 64 pointers' worth of
/// pool memory, rounded up to a power of two.
fn hash_table_cells(pool_bytes: usize) -> usize {
    let cells = pool_bytes / std::mem::size_of::<*const u8>() / 64;
    next_power_of_two(cells.max(64) as u64) as usize
}

#[cfg(test)]
mod unit_tests {
    use super::*;
    use crate::config::PoolConfig;

    fn system(n_pages: usize) -> AhiSystem {
        let pool = Arc::new(BufferPool::new(&PoolConfig { n_pages }));
        let dict = Arc::new(Dictionary::new());
        AhiSystem::new(AhiConfig::default(), pool, dict)
    }

    #[test]
    fn test_enable_sizes_table_from_pool() {
        let system = system(64);
        assert!(system.is_enabled());
        assert_eq!(
            system.n_cells(),
            hash_table_cells(system.pool.size_bytes())
        );
    }

    #[test]
    fn test_enable_twice_is_noop() {
        let system = system(8);
        let cells = system.n_cells();
        system.enable();
        assert_eq!(system.n_cells(), cells);
    }

    #[test]
    fn test_disabled_at_startup_by_config() {
        let pool = Arc::new(BufferPool::new(&PoolConfig { n_pages: 8 }));
        let dict = Arc::new(Dictionary::new());
        let config = AhiConfig {
            enabled: false,
            ..AhiConfig::default()
        };
        let system = AhiSystem::new(config, pool, dict);
        assert!(!system.is_enabled());
        assert_eq!(system.n_cells(), 0);
    }

    #[test]
    fn test_disable_then_enable_round_trip() {
        let system = system(8);
        system.prepare_insert();
        assert!(system.has_spare_slab());

        system.disable();
        assert!(!system.is_enabled());
        assert_eq!(system.n_cells(), 0);
        assert_eq!(system.n_hash_nodes(), 0);
        assert!(!system.has_spare_slab());
        // All frames back in the pool.
        assert_eq!(system.pool.free_count(), system.pool.n_pages());

        system.enable();
        assert!(system.is_enabled());
        assert!(system.n_cells() > 0);
    }

    #[test]
    fn test_hash_table_cells_power_of_two() {
        for bytes in [1usize << 20, 1 << 24, 3 << 22] {
            let cells = hash_table_cells(bytes);
            assert!(cells.is_power_of_two());
            assert!(cells >= 64);
        }
    }
}
