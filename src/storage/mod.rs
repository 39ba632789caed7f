//! # Storage Layer
//!
//! Page layout, block descriptors, and the pinned buffer pool the hash
//! system borrows its memory from.
//!
//! - [`page`]: 16KB leaf pages with a zerocopy header, infimum/supremum
//!   bounds and a singly linked record list in key order
//! - [`block`]: per-frame descriptor carrying the page latch, fix count,
//!   replacement state and the per-block hash state
//! - [`pool`]: chunked, pointer-resolvable frame pool with page-hash cell
//!   latches rendezvousing lookups with eviction

pub mod block;
pub mod page;
pub mod pool;

pub use self::block::{Block, LatchMode, PageLatch};
pub use self::pool::BufferPool;
