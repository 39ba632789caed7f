//! # leafhash - Adaptive Hash Index for B-tree Point Lookups
//!
//! leafhash is an in-memory, latch-partitioned, opportunistic lookup
//! accelerator layered over a B-tree's leaf pages. When the same key prefix
//! is searched repeatedly, it maps a CRC-32C fingerprint of that prefix
//! directly to a record pointer inside a resident buffer-pool page, letting
//! a point lookup skip the root-to-leaf descent entirely.
//!
//! ## Design Priorities
//!
//! - **Never wrong, only absent**: the hash is a cache. A miss, a stale
//!   entry, or the whole system being disabled degrades to the ordinary
//!   tree search without an error.
//! - **Self-tuning**: unlatched heuristics watch every positioned search
//!   and decide per page whether hash coverage would pay for itself.
//! - **Latch discipline over cleverness**: a fixed acyclic lock order plus
//!   one try-lock keeps the fast path free of inversions.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │       Cursor (search + info update)         │
//! ├─────────────────────────────────────────────┤
//! │  Adaptive Hash (guess / build / drop /      │
//! │  maintain / heuristics / fold / validate)   │
//! ├──────────────────────┬──────────────────────┤
//! │  Index metadata +    │  Record formats      │
//! │  dictionary          │  (compact/redundant) │
//! ├──────────────────────┴──────────────────────┤
//! │  Storage (pages, blocks, buffer pool)       │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use leafhash::{Ahi, AhiConfig, BufferPool, Cursor, Dict, IndexDef};
//!
//! let pool = BufferPool::new(256)?;
//! let dict = Dict::new();
//! let ahi = Ahi::new(pool.clone(), dict.clone(), AhiConfig::default());
//!
//! // After every positioned search the cursor feeds the heuristics; once
//! // a page proves hot, lookups start hitting the hash:
//! let mut cursor = Cursor::new(index.clone());
//! if cursor.search_leaf(&ahi, leaf, &tuple, true, LatchMode::Shared) {
//!     // positioned on the record, leaf latched and pinned
//! }
//! cursor.release();
//! ```
//!
//! ## Module Overview
//!
//! - [`ahi`]: the hash system: partitions, fold, heuristics, guess path,
//!   build/drop/move protocols, lifecycle, validation
//! - [`cursor`]: positioned leaf cursor and the search-info driver
//! - [`storage`]: pages, block descriptors, pinned buffer pool
//! - [`records`]: physical record formats and logical tuples
//! - [`index`]: index metadata, search info, dictionary with lazy free
//! - [`config`]: constants and tuning knobs

#[macro_use]
mod macros;

pub mod ahi;
pub mod config;
pub mod cursor;
pub mod index;
pub mod records;
pub mod storage;

pub use ahi::{Ahi, Monitor, MonitorSnapshot, LEFT_SIDE};
pub use config::AhiConfig;
pub use cursor::{Cursor, SearchFlag};
pub use index::{Dict, IndexDef, SearchInfo};
pub use records::{IndexField, RecFormat, Tuple, TupleField};
pub use storage::{Block, BufferPool, LatchMode};
