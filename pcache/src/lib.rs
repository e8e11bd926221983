//! pcache: write-back, extent-addressable local disk cache for remote files.
//!
//! A [`cache::FileCache`] keeps plaintext copies of remote byte ranges in a
//! sparse local file, tracks per-range state (clean, dirty, being written
//! back) and persists that state so it survives a restart. Dirty data is
//! drained upstream through [`writeback::WriteBackManager`].

pub mod blockmap;
pub mod cache;
pub mod config;
pub mod error;
pub mod interval;
pub mod lock;
pub mod store;
pub mod table;
pub mod writeback;

pub use cache::{CacheState, DirtyExtent, FileCache, LookupResult, MatchKind};
pub use error::{CacheError, Result};
pub use table::CacheTable;
