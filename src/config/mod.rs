//! # Configuration Constants
//!
//! This module centralizes all configuration constants, grouping interdependent
//! values together and documenting their relationships. Constants that depend
//! on each other are co-located to prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (16384 bytes)
//!       │
//!       ├─> PAGE_SHIFT (log2, used for pointer-to-block resolution)
//!       │
//!       ├─> slab capacity: PAGE_SIZE / size_of::<Node>() chain nodes per page
//!       │
//!       └─> CHUNK_PAGES (frames per buffer-pool chunk)
//!
//! BUILD_LIMIT (100)
//!       │
//!       ├─> HASH_POTENTIAL_MAX (BUILD_LIMIT + 5, saturation ceiling with a
//!       │     small hysteresis margin so a freshly built page is not torn
//!       │     down by the first few misses)
//!       │
//!       └─> PAGE_BUILD_LIMIT (16, per-page fraction that must have profited)
//!
//! HASH_ANALYSIS_LIMIT (17)
//!       └─> searches skipped after a recommendation change before the
//!           heuristic runs again
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `PAGE_SIZE == 1 << PAGE_SHIFT` (pointer arithmetic on page frames)
//! 2. `HASH_POTENTIAL_MAX` fits in a `u8` (the counter is a byte)
//! 3. `N_PARTITIONS` is non-zero (partition selection is `index_id % N`)

/// Size of each buffer-pool page in bytes (16KB).
/// This is the fundamental unit of frame memory and slab carving.
pub const PAGE_SIZE: usize = 16384;

/// log2(PAGE_SIZE), used to turn a record pointer into a frame index.
pub const PAGE_SHIFT: u32 = 14;

const _: () = assert!(PAGE_SIZE == 1 << PAGE_SHIFT, "PAGE_SHIFT derivation mismatch");

/// Number of page frames per buffer-pool chunk. Multiple chunks keep the
/// chunk map (pointer -> block resolution) honest even in small pools.
pub const CHUNK_PAGES: usize = 64;

/// Default number of hash partitions. A record belongs to partition
/// `index_id % N_PARTITIONS`; partitions share nothing.
pub const N_PARTITIONS: usize = 8;

const _: () = assert!(N_PARTITIONS > 0, "at least one partition required");

/// Global limit of consecutive vindicated searches before per-page hash
/// building is considered at all.
pub const BUILD_LIMIT: u8 = 100;

/// Saturation ceiling for the per-index potential counter. The margin above
/// BUILD_LIMIT absorbs a few misses before building stops being recommended.
pub const HASH_POTENTIAL_MAX: u8 = BUILD_LIMIT + 5;

/// If the number of records on a page divided by this would have been found
/// through the hash, the page is built (once the global limit is reached).
pub const PAGE_BUILD_LIMIT: u16 = 16;

/// Number of positioned searches to skip after a recommendation change, to
/// avoid burning CPU while the recommendation is unstable.
pub const HASH_ANALYSIS_LIMIT: u32 = 17;

/// Entries folded per partition-latch hold when building a page hash.
/// Folding happens outside the latch; only the install is latched.
pub const BUILD_BATCH: usize = 64;

/// Folds gathered per partition-latch hold when dropping a page hash.
pub const DROP_BATCH: usize = 128;

/// Cells validated between latch releases in the debug validator.
pub const VALIDATE_CHUNK: usize = 10_000;

/// Divisor applied to the buffer-pool byte size when sizing the cell arrays:
/// `cells = pool_bytes / size_of::<*const u8>() / CELLS_DIVISOR / n_parts`.
pub const CELLS_DIVISOR: usize = 64;

/// Number of page-hash cell latches in the buffer pool. These serialize the
/// guess path's block try-lock against eviction of the same page.
pub const PAGE_HASH_CELLS: usize = 64;

/// Runtime configuration, read once when the hash system is created.
#[derive(Debug, Clone)]
pub struct AhiConfig {
    /// Number of independent hash partitions.
    pub n_parts: usize,
    /// Whether the hash system starts enabled.
    pub enabled: bool,
}

impl Default for AhiConfig {
    fn default() -> Self {
        Self {
            n_parts: N_PARTITIONS,
            enabled: true,
        }
    }
}

/// Smallest prime >= `n`, used to size the cell arrays so that
/// `fold % n_cells` distributes well. Called once per enable.
pub fn next_prime(n: usize) -> usize {
    fn is_prime(n: usize) -> bool {
        if n < 2 {
            return false;
        }
        let mut d = 2;
        while d * d <= n {
            if n % d == 0 {
                return false;
            }
            d += 1;
        }
        true
    }

    let mut candidate = n.max(2);
    while !is_prime(candidate) {
        candidate += 1;
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_prime_basics() {
        assert_eq!(next_prime(0), 2);
        assert_eq!(next_prime(2), 2);
        assert_eq!(next_prime(4), 5);
        assert_eq!(next_prime(90), 97);
        assert_eq!(next_prime(97), 97);
    }

    #[test]
    fn test_potential_ceiling_fits_counter() {
        assert!(HASH_POTENTIAL_MAX as u16 == BUILD_LIMIT as u16 + 5);
    }
}
