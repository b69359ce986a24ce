//! Lock-free, size-classed pool of reusable memory blocks
//!
//! Blocks are grouped into power-of-two size classes (plus any number of
//! registered classes with arbitrary sizes). Freed blocks are kept around
//! for reuse up to a per-class byte budget and given back to the backing
//! allocator beyond that. Reusing a pooled block takes no lock on either
//! allocation or free. Only going to the backing allocator (a fresh block,
//! or a release) touches the mutex of the per-tag ledger.
//!
//! ```no_run
//! use lfpool::{Pool, PoolConfig};
//!
//! let pool = Pool::new(PoolConfig::default()).unwrap();
//! let p = pool.malloc(100).unwrap();
//! unsafe { pool.free(p) };
//! assert!(pool.clear().is_clean());
//! ```

pub mod backing;
pub mod bucket;
pub mod config;
pub mod entry;
pub mod error;
pub mod event;
pub mod free_list;
mod loom_testing;
pub mod pool;
pub mod util;

pub use backing::{LeakReport, RawAllocator, SystemAllocator, Tag, TagCounts};
pub use bucket::ContendedRelease;
pub use config::{total_system_memory, MemoryBudget, PoolConfig};
pub use entry::ClassId;
pub use error::PoolError;
pub use pool::{size_class, ClassStats, Pool, PoolStats, MAX_CLASSES};
