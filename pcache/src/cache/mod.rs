//! Per-file cache entries: extent states, dirty queues and persistence.

pub mod dirty;
pub mod extent;
pub mod file_cache;
pub mod meta;

pub use dirty::DirtyExtent;
pub use extent::{CacheState, ExtentMap};
pub use file_cache::{CacheGuard, FileCache, LookupResult, MatchKind};
pub use meta::{ExtentMeta, FileCacheMeta};

/// Round down to a multiple of `alignment` (a power of two, or 0 for none).
pub fn align_down(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    value & !(alignment - 1)
}

pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    (value + alignment - 1) & !(alignment - 1)
}

pub fn is_aligned(value: u64, alignment: u64) -> bool {
    alignment == 0 || value & (alignment - 1) == 0
}

/// Shorten `length` so that `offset + length` stays within the offset space.
pub fn clamp_length(offset: u64, length: u64) -> u64 {
    length.min(u64::MAX - offset)
}
