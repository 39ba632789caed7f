//! Debug validation of the whole hash structure.
//!
//! Exists to find engine bugs, not to heal them: mismatches are reported
//! and the structure is left exactly as found. Latches are released and the
//! thread yields between cell chunks so a long validation does not starve
//! the system; an external kill flag abandons the walk without touching
//! state.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::error;

use crate::config::VALIDATE_CHUNK;
use crate::storage::block::{BLOCK_REMOVE_HASH, BLOCK_UNFIXED};

use super::fold::{rec_fold, LEFT_SIDE};
use super::Ahi;

impl Ahi {
    /// Walk every partition, re-deriving each node's fold from the page it
    /// points into and checking chain membership. Returns whether the
    /// structure checked out; `kill` aborts early (reported as ok).
    pub fn validate(&self, kill: &AtomicBool) -> bool {
        for part_no in 0..self.n_parts() {
            if !self.validate_partition(part_no, kill) {
                return false;
            }
        }
        true
    }

    fn validate_partition(&self, part_no: usize, kill: &AtomicBool) -> bool {
        let mut ok = true;

        let mut guards = self.write_lock_all();
        if !self.enabled() || kill.load(Ordering::Relaxed) {
            return ok;
        }

        let mut cell_count = guards[part_no].n_cells();
        let mut i = 0;
        while i < cell_count {
            // Give other threads a chance every once in a while.
            if i != 0 && i % VALIDATE_CHUNK == 0 {
                drop(guards);
                std::thread::yield_now();
                guards = self.write_lock_all();
                if !self.enabled() || kill.load(Ordering::Relaxed) {
                    return ok;
                }
                let current = guards[part_no].n_cells();
                if current != cell_count {
                    cell_count = current;
                    if i >= cell_count {
                        break;
                    }
                }
            }

            let table = &guards[part_no];
            let mut node = table.cell_at(i);
            while !node.is_null() {
                // SAFETY: all partition latches are write-held; chain links
                // and node contents are stable.
                let n = unsafe { &*node };

                if table.n_cells() > 0 && n.fold as usize % table.n_cells() != i {
                    error!(
                        fold = n.fold,
                        cell = i,
                        "hash node fold does not match its cell"
                    );
                    ok = false;
                }

                let block = self.pool.block_from_ptr(n.rec);
                let state = block.state();
                // A block mid-eviction is legal: its drop is queued behind
                // the latches we hold.
                if state != BLOCK_UNFIXED && state != BLOCK_REMOVE_HASH {
                    error!(state, page_id = block.page_id(), "hash node in a dead block");
                    ok = false;
                } else {
                    let index_ptr = block.index.load(Ordering::Relaxed);
                    if index_ptr.is_null() {
                        error!(
                            page_id = block.page_id(),
                            "hash node to a page that is not hashed"
                        );
                        ok = false;
                    } else {
                        let n_bytes_fields =
                            block.curr_left_bytes_fields.load(Ordering::Relaxed) & !LEFT_SIDE;
                        // SAFETY: non-null block index pointers are
                        // dictionary-kept; the record is inside a frame that
                        // cannot be reused while we hold every latch.
                        let fold = unsafe { rec_fold(n.rec, &*index_ptr, n_bytes_fields) };
                        if fold != n.fold {
                            error!(
                                page_id = block.page_id(),
                                node_fold = n.fold,
                                rec_fold = fold,
                                "hash node fold does not match its record"
                            );
                            ok = false;
                        }
                    }
                }

                node = n.next;
            }

            i += 1;
        }

        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AhiConfig;
    use crate::index::Dict;
    use crate::storage::BufferPool;
    use std::sync::Arc;

    #[test]
    fn test_validate_empty_system() {
        let pool = BufferPool::new(8).unwrap();
        let ahi = Ahi::new(pool, Dict::new(), AhiConfig::default());
        assert!(ahi.validate(&AtomicBool::new(false)));
    }

    #[test]
    fn test_validate_killed_returns_ok() {
        let pool = BufferPool::new(8).unwrap();
        let ahi = Ahi::new(pool, Dict::new(), AhiConfig::default());
        assert!(ahi.validate(&AtomicBool::new(true)));
    }

    #[test]
    fn test_validate_disabled_returns_ok() {
        let pool = BufferPool::new(8).unwrap();
        let ahi = Ahi::new(pool, Dict::new(), AhiConfig::default());
        ahi.disable();
        assert!(ahi.validate(&AtomicBool::new(false)));
    }
}
