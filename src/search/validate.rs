//! Structural validation of the hash index.
//!
//! Walks every cell chain and checks the structural invariants: each
//! node's fold hashes back to its cell, each node's record lies in a
//! resident (or being-removed) block that is hashed for some index, and
//! the record still folds to the node's fold under the block's installed
//! shape. The walk releases and reacquires all latches between chunks of
//! cells so that a cooperative stop signal gets through.

use crate::buffer::BlockState;
use crate::fold::fold_record;

use super::AhiSystem;

/// Cells validated between latch releases.
const VALIDATE_CHUNK: usize = 10_000;

impl AhiSystem {
    /// Validate the hash index structure.
    ///
    /// `should_stop` is polled between chunks; returning `true` aborts the
    /// walk (counting as valid). Pages must not be modified concurrently
    /// with the chunk being validated; the partition latch held here keeps
    /// hash state stable but not page contents.
    pub fn validate(&self, mut should_stop: impl FnMut() -> bool) -> bool {
        let mut ok = true;

        let mut table = self.part.latch.write();
        if !self.is_enabled() || should_stop() {
            return ok;
        }

        let mut cell_count = table.n_cells();
        let mut i = 0usize;
        while i < cell_count {
            if i != 0 && i % VALIDATE_CHUNK == 0 {
                // Give other threads a chance to run.
                drop(table);
                std::thread::yield_now();
                table = self.part.latch.write();
                if !self.is_enabled() || should_stop() {
                    return ok;
                }
                let current = table.n_cells();
                if current != cell_count {
                    cell_count = current;
                    if i >= cell_count {
                        break;
                    }
                }
            }

            let mut node = table.chain_head_at(i);
            while !node.is_null() {
                // SAFETY: live chain nodes under the exclusive latch.
                unsafe {
                    let fold = (*node).fold;
                    if table.cell_index(fold) != i {
                        tracing::error!(fold, cell = i, "hash node fold does not match its cell");
                        ok = false;
                    }

                    let rec = (*node).rec;
                    let block = self.pool.block_from_ahi(rec.as_ptr());
                    let state = block.state();
                    // A block being freed has its entries dropped after it
                    // leaves the page hash, so RemoveHash is legitimate
                    // here.
                    if state != BlockState::RemoveHash && !state.is_resident() {
                        tracing::error!(
                            block = block.id(),
                            ?state,
                            "hash node points into a non-resident block"
                        );
                        ok = false;
                    } else if let Some(index) = block.ahi.index() {
                        let expected = fold_record(
                            &index,
                            rec,
                            block.ahi.curr_n_fields(),
                            block.ahi.curr_n_bytes(),
                        );
                        if expected != fold {
                            tracing::error!(
                                block = block.id(),
                                index = %index.id(),
                                node_fold = fold,
                                rec_fold = expected,
                                "hash node fold does not match its record"
                            );
                            ok = false;
                        }
                    } else {
                        tracing::error!(
                            block = block.id(),
                            "hash node points into a block with no hash index"
                        );
                        ok = false;
                    }

                    node = (*node).next;
                }
            }

            i += 1;
        }

        ok
    }
}
