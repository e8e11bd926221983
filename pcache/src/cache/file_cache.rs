//! Write-back cache of one remote file.
//!
//! All bookkeeping (extent map, range locks, counters and dirty queues) sits
//! behind one coarse mutex that is only held for in-memory work. Disk I/O
//! runs outside it, protected by a range lock over the bytes involved.
//! Range locks that cannot be granted right away are retried with an
//! exponential backoff, so disjoint ranges never wait on each other.

use super::dirty::DirtyExtent;
use super::extent::{CacheState, ExtentMap};
use super::meta::{ExtentMeta, FileCacheMeta};
use super::{align_down, align_up, clamp_length};
use crate::error::{CacheError, Result};
use crate::lock::{LockKind, RangeLock};
use crate::store::BackingFile;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(1);
const MAX_BACKOFF: Duration = Duration::from_millis(2048);

/// How the cached data lines up with a looked-up range.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    NotFound = 0,
    /// Cached data starts at the requested offset but ends early.
    Front = 1,
    /// Cached data ends at the requested end but starts late.
    Back = 2,
    Full = 3,
    /// Cached data sits strictly inside the requested range.
    Middle = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupResult {
    pub kind: MatchKind,
    pub offset: u64,
    pub length: u64,
}

impl LookupResult {
    fn not_found() -> Self {
        Self {
            kind: MatchKind::NotFound,
            offset: 0,
            length: 0,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    remote_change_time: u64,
    newly_created: bool,
    extents: ExtentMap,
    address_lock: RangeLock,
    size: u64,
    dirty_size: u64,
    // waiting for the drainer, ordered by offset
    unpolled: VecDeque<DirtyExtent>,
    // read-locked for write-back right now
    locked_dirty: Vec<DirtyExtent>,
}

impl Inner {
    fn count_overlapping(&self, offset: u64, length: u64, state: Option<CacheState>) -> u64 {
        let end = offset + length;
        self.extents
            .overlapping(offset, end)
            .filter(|(_, _, s)| state.is_none_or(|want| **s == want))
            .map(|(l, u, _)| u.min(end) - l.max(offset))
            .sum()
    }

    /// Find the cached span to serve `[offset, offset + length)` and read-lock
    /// it. `None` means the lock is busy; `Some((_, 0))` means nothing cached.
    fn lookup_and_lock(&mut self, offset: u64, length: u64) -> Option<(u64, u64)> {
        let end = offset + length;
        let mut hits = self.extents.overlapping(offset, end);
        let Some((first_lower, first_upper, _)) = hits.next() else {
            return Some((0, 0));
        };
        let mut last_upper = first_upper;
        for (lower, upper, _) in hits {
            if lower != last_upper {
                break;
            }
            last_upper = upper;
        }

        let (cached_offset, cached_length) = if first_lower <= offset {
            (offset, length.min(last_upper - offset))
        } else if last_upper >= end {
            (first_lower, end - first_lower)
        } else {
            (first_lower, last_upper - first_lower)
        };
        self.address_lock
            .try_read_lock(cached_offset, cached_length)
            .then_some((cached_offset, cached_length))
    }

    /// Record `[offset, offset + length)` as `state`, padded to `alignment`
    /// only as far as existing extents reach and never over bytes another
    /// caller holds locked. The caller must own `[offset, offset + length)`.
    /// Returns the new cached size.
    fn insert_extent(&mut self, offset: u64, length: u64, state: CacheState, alignment: u64) -> u64 {
        let end = offset + length;
        let aoff = align_down(offset, alignment);
        let aend = align_up(end, alignment);

        let (mut omin, mut omax) = (offset, end);
        let (mut lo_cap, mut hi_cap) = (aoff, aend);
        for (l, u, s) in self.extents.overlapping(aoff, aend) {
            omin = omin.min(l);
            omax = omax.max(u);
            // clean padding must not land on dirty neighbours
            if state == CacheState::Clean && *s == CacheState::Dirty {
                if u <= offset {
                    lo_cap = lo_cap.max(u);
                } else if l >= end {
                    hi_cap = hi_cap.min(l);
                }
            }
        }
        let mut lo = aoff.max(omin).max(lo_cap);
        let mut hi = aend.min(omax).min(hi_cap);
        if lo < offset && self.address_lock.is_locked(lo, offset - lo) {
            lo = offset;
        }
        if hi > end && self.address_lock.is_locked(end, hi - end) {
            hi = end;
        }

        let mut overlap = 0;
        let mut dirty_overlap = 0;
        for (l, u, s) in self.extents.overlapping(lo, hi) {
            let ol = u.min(hi) - l.max(lo);
            overlap += ol;
            if *s == CacheState::Dirty {
                dirty_overlap += ol;
            }
        }

        if state == CacheState::Clean {
            // dirty bytes keep their tag until written back
            let dirty: Vec<(u64, u64)> = self
                .extents
                .overlapping(lo, hi)
                .filter(|(_, _, s)| **s == CacheState::Dirty)
                .map(|(l, u, _)| (l.max(lo), u.min(hi)))
                .collect();
            let mut cursor = lo;
            for (l, u) in dirty {
                self.extents.add(cursor, l, state);
                cursor = u;
            }
            self.extents.add(cursor, hi, state);
        } else {
            self.extents.add(lo, hi, state);
        }
        self.size += (hi - lo) - overlap;
        if state == CacheState::Dirty {
            self.dirty_size += (hi - lo) - dirty_overlap;
        }
        debug!(
            "dirty size {} after inserting [{}, {}) with alignment {}",
            self.dirty_size, lo, hi, alignment
        );
        debug_assert_eq!(self.size, self.extents.total_len(), "size mismatch");
        self.size
    }

    /// Pick the first dirty piece of `extent`'s window that is not already
    /// under write-back and read-lock it. `Some(false)` means nothing to do.
    fn lock_dirty(&mut self, max_length: u64, extent: &mut DirtyExtent) -> Option<bool> {
        let mut found = None;
        for (lower, upper, state) in self.extents.overlapping(extent.offset(), extent.end()) {
            if *state != CacheState::Dirty {
                continue;
            }
            let mut candidate = extent.descriptor();
            let offset = extent.offset().max(lower);
            candidate.set_range(offset, upper - offset);
            let busy = self
                .locked_dirty
                .iter()
                .any(|de| candidate.trim(de.offset(), de.length()));
            let length = max_length.min(candidate.length());
            if !busy && length > 0 {
                found = Some((candidate.offset(), length));
                break;
            }
        }

        let Some((offset, length)) = found else {
            extent.clear();
            return Some(false);
        };
        if !self.address_lock.try_read_lock(offset, length) {
            return None;
        }
        extent.set_range(offset, length);
        self.locked_dirty.push(extent.descriptor());
        Some(true)
    }

    fn push_dirty(&mut self, de: DirtyExtent) {
        let pos = self.unpolled.partition_point(|e| e.offset() <= de.offset());
        self.unpolled.insert(pos, de);
    }

    fn reset(&mut self) {
        self.extents.clear();
        self.size = 0;
        self.dirty_size = 0;
        self.unpolled.clear();
    }
}

/// Releases a range lock when dropped, unless released explicitly under an
/// already held cache mutex.
struct RangeLockReleaser<'a> {
    cache: &'a FileCache,
    offset: u64,
    length: u64,
    kind: LockKind,
    // also drop the matching locked-dirty registration
    dirty: bool,
    armed: bool,
}

impl<'a> RangeLockReleaser<'a> {
    fn new(cache: &'a FileCache, offset: u64, length: u64, kind: LockKind) -> Self {
        Self {
            cache,
            offset,
            length,
            kind,
            dirty: false,
            armed: true,
        }
    }

    fn for_dirty(cache: &'a FileCache, offset: u64, length: u64) -> Self {
        Self {
            cache,
            offset,
            length,
            kind: LockKind::Read,
            dirty: true,
            armed: true,
        }
    }

    fn release(mut self, inner: &mut Inner) {
        self.unlock(inner);
        self.armed = false;
    }

    fn disarm(mut self) {
        self.armed = false;
    }

    fn unlock(&self, inner: &mut Inner) {
        inner.address_lock.unlock(self.offset, self.length, self.kind);
        if self.dirty {
            if let Some(pos) = inner.locked_dirty.iter().position(|de| de.offset() == self.offset) {
                inner.locked_dirty.remove(pos);
            }
        }
    }
}

impl Drop for RangeLockReleaser<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(mut inner) = self.cache.inner.lock() {
            self.unlock(&mut inner);
        }
    }
}

/// The cache mutex held past an insert or invalidate, so follow-up
/// bookkeeping happens without a lock gap.
pub struct CacheGuard<'a> {
    inner: MutexGuard<'a, Inner>,
}

impl CacheGuard<'_> {
    pub fn size(&self) -> u64 {
        self.inner.size
    }

    pub fn dirty_data_size(&self) -> u64 {
        self.inner.dirty_size
    }

    pub fn push_dirty_extent(&mut self, de: DirtyExtent) {
        self.inner.push_dirty(de);
    }

    pub fn pop_dirty_extent(&mut self) -> Option<DirtyExtent> {
        self.inner.unpolled.pop_front()
    }
}

#[derive(Debug)]
pub struct FileCache {
    handle: Vec<u8>,
    file_name: String,
    data: BackingFile,
    meta_path: PathBuf,
    alignment: u64,
    inner: Mutex<Inner>,
}

impl FileCache {
    /// Cache entry for `handle`. Nothing touches the disk until `create`,
    /// `insert` or `load`.
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(
        handle: &[u8],
        cache_dir: P,
        meta_dir: Q,
        remote_change_time: u64,
        alignment: u64,
    ) -> Self {
        debug_assert!(alignment == 0 || alignment.is_power_of_two());
        let file_name = URL_SAFE_NO_PAD.encode(handle);
        Self {
            handle: handle.to_vec(),
            data: BackingFile::new(cache_dir.as_ref().join(&file_name)),
            meta_path: meta_dir.as_ref().join(&file_name),
            file_name,
            alignment,
            inner: Mutex::new(Inner {
                remote_change_time,
                ..Inner::default()
            }),
        }
    }

    /// Handle bytes encoded in a backing file name.
    pub fn handle_from_file_name(name: &str) -> Option<Vec<u8>> {
        URL_SAFE_NO_PAD.decode(name).ok()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("file cache mutex poisoned")
    }

    fn repeat_until_success<T, F>(&self, mut action: F) -> T
    where
        F: FnMut(&mut Inner) -> Option<T>,
    {
        let mut wait = INITIAL_BACKOFF;
        loop {
            if let Some(done) = action(&mut self.lock()) {
                return done;
            }
            debug!("range busy in {}, retry in {:?}", self.file_name, wait);
            thread::sleep(wait);
            if wait < MAX_BACKOFF {
                wait *= 2;
            }
        }
    }

    /// Create an empty backing file for a file that is new upstream.
    pub fn create(&self) -> Result<()> {
        let mut inner = self.lock();
        debug!("creating {}", self.data.path().display());
        self.data.create()?;
        inner.newly_created = true;
        Ok(())
    }

    /// Find what part of `[offset, offset + length)` is cached and, with a
    /// buffer, copy it to `buf[cached_offset - offset..]`.
    pub fn lookup(&self, offset: u64, length: u64, buf: Option<&mut [u8]>) -> Result<LookupResult> {
        let length = clamp_length(offset, length);
        if length == 0 {
            return Ok(LookupResult::not_found());
        }
        let (cached_offset, cached_length) =
            self.repeat_until_success(|inner| inner.lookup_and_lock(offset, length));
        if cached_length == 0 {
            debug!("[{}, {}) not cached", offset, offset + length);
            return Ok(LookupResult::not_found());
        }
        let releaser = RangeLockReleaser::new(self, cached_offset, cached_length, LockKind::Read);

        let kind = if cached_offset == offset {
            if cached_length == length {
                MatchKind::Full
            } else {
                MatchKind::Front
            }
        } else if cached_offset + cached_length == offset + length {
            MatchKind::Back
        } else {
            MatchKind::Middle
        };

        let mut read_length = cached_length;
        if let Some(buf) = buf {
            let start = (cached_offset - offset) as usize;
            let dst = buf
                .get_mut(start..start + cached_length as usize)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "lookup buffer too small"))?;
            let n = self.data.read_at(cached_offset, dst).map_err(|e| {
                error!(
                    "cannot read range [{}, {}) from {}: {}",
                    offset,
                    offset + length,
                    self.file_name,
                    e
                );
                e
            })?;
            read_length = read_length.min(n as u64);
        }
        releaser.release(&mut self.lock());

        Ok(LookupResult {
            kind,
            offset: cached_offset,
            length: read_length,
        })
    }

    /// Write `data` at `offset` and record it as `state`. Returns the total
    /// cached size afterwards.
    pub fn insert(&self, offset: u64, data: &[u8], state: CacheState) -> Result<u64> {
        self.insert_impl(offset, data, state).map(|(_, size)| size)
    }

    /// Like `insert` but keeps the cache mutex held on return.
    pub fn insert_and_lock(&self, offset: u64, data: &[u8], state: CacheState) -> Result<(CacheGuard<'_>, u64)> {
        self.insert_impl(offset, data, state)
            .map(|(inner, size)| (CacheGuard { inner }, size))
    }

    /// Insert dirty data and queue its aligned block range for write-back
    /// once `delay` has passed.
    pub fn insert_dirty(&self, offset: u64, data: &[u8], delay: Duration) -> Result<u64> {
        let (mut guard, size) = self.insert_and_lock(offset, data, CacheState::Dirty)?;
        let aoff = align_down(offset, self.alignment);
        let aend = align_up(offset + data.len() as u64, self.alignment);
        guard.push_dirty_extent(DirtyExtent::new(aoff, aend - aoff, delay));
        Ok(size)
    }

    fn insert_impl(&self, offset: u64, data: &[u8], state: CacheState) -> Result<(MutexGuard<'_, Inner>, u64)> {
        assert!(
            matches!(state, CacheState::Clean | CacheState::Dirty),
            "cannot insert {state:?} data"
        );
        let length = data.len() as u64;
        if offset.checked_add(length).is_none() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL).into());
        }
        let clean = state == CacheState::Clean;
        let blocked_by_dirty = self.repeat_until_success(|inner| {
            if clean && inner.count_overlapping(offset, length, Some(CacheState::Dirty)) > 0 {
                return Some(true);
            }
            inner.address_lock.try_write_lock(offset, length).then_some(false)
        });
        if blocked_by_dirty {
            error!(
                "could not overwrite dirty data within [{}, {}) of {} before it is written back",
                offset,
                offset + length,
                self.file_name
            );
            return Err(CacheError::DirtyData { offset, length });
        }
        let releaser = RangeLockReleaser::new(self, offset, length, LockKind::Write);

        let written = self.data.write_at_sync(offset, data).map_err(|e| {
            error!("cannot insert into {}: {}", self.file_name, e);
            e
        })? as u64;
        if written != length {
            error!(
                "only {} of {} bytes written at {} of {}",
                written, length, offset, self.file_name
            );
            return Err(CacheError::PartialWrite {
                expected: length,
                written,
            });
        }

        let mut inner = self.lock();
        releaser.release(&mut inner);
        let size = inner.insert_extent(offset, length, state, self.alignment);
        Ok((inner, size))
    }

    /// Read-lock and read the first dirty piece inside `extent`'s window,
    /// at most `max_length` bytes. On success `extent` is narrowed to the
    /// locked range and carries its bytes. Returns 0 when nothing in the
    /// window needs write-back.
    pub fn read_and_lock_dirty(&self, max_length: u64, extent: &mut DirtyExtent) -> Result<u64> {
        debug!(
            "read dirty data inside [{}, +{})",
            extent.offset(),
            extent.length()
        );
        let locked = self.repeat_until_success(|inner| inner.lock_dirty(max_length, extent));
        if !locked {
            debug!("no dirty data at {} in {}", extent.offset(), self.file_name);
            return Ok(0);
        }

        let (offset, length) = (extent.offset(), extent.length());
        debug!("dirty extent at {} with {} bytes", offset, length);
        let releaser = RangeLockReleaser::for_dirty(self, offset, length);

        let mut buf = Vec::new();
        buf.try_reserve_exact(length as usize)
            .map_err(|_| CacheError::NoMemory)?;
        buf.resize(length as usize, 0);
        let n = self.data.read_at(offset, &mut buf)?;
        if n as u64 != length {
            error!(
                "short read of dirty data at {}: {} of {} bytes in {}",
                offset, n, length, self.file_name
            );
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }

        releaser.disarm();
        extent.data = Some(buf);
        Ok(length)
    }

    /// Finish a write-back started by `read_and_lock_dirty`. Marks the range
    /// clean when `success`, then unlocks it. Returns the dirty bytes left
    /// and the descriptor that was registered for the range.
    pub fn cleanse_and_unlock_dirty(&self, extent: DirtyExtent, success: bool) -> (u64, DirtyExtent) {
        let (offset, length) = (extent.offset(), extent.length());
        drop(extent);

        let mut inner = self.lock();
        if success {
            inner.extents.add(offset, offset + length, CacheState::Cleansed);
            assert!(
                inner.dirty_size >= length,
                "dirty size {} below cleansed length {}",
                inner.dirty_size,
                length
            );
            inner.dirty_size -= length;
        }
        let pos = inner
            .locked_dirty
            .iter()
            .position(|de| de.offset() == offset)
            .unwrap_or_else(|| panic!("no locked dirty extent at {offset} in {}", self.file_name));
        let de = inner.locked_dirty.remove(pos);
        inner.address_lock.read_unlock(de.offset(), de.length());
        let dirty_left = inner.dirty_size;
        drop(inner);

        debug!(
            "left dirty {} after cleansing {} bytes at {}",
            dirty_left, length, offset
        );
        (dirty_left, de)
    }

    /// Queue a window for the drainer, keeping the queue ordered by offset.
    pub fn push_dirty_extent(&self, de: DirtyExtent) {
        self.lock().push_dirty(de);
    }

    pub fn pop_dirty_extent(&self) -> Option<DirtyExtent> {
        self.lock().unpolled.pop_front()
    }

    /// First queued window whose deadline has passed at `now`.
    pub fn pop_due_dirty_extent(&self, now: Instant) -> Option<DirtyExtent> {
        let mut inner = self.lock();
        let pos = inner.unpolled.iter().position(|de| de.is_due_at(now))?;
        inner.unpolled.remove(pos)
    }

    /// Drop `[offset, offset + length)` from the cache. Dirty data is only
    /// discarded when the remote file is being `deleted`. Returns the cached
    /// size afterwards.
    pub fn invalidate(&self, offset: u64, length: u64, deleted: bool) -> Result<u64> {
        self.invalidate_impl(offset, length, deleted)
            .map(|(_, size)| size)
    }

    pub fn invalidate_and_lock(&self, offset: u64, length: u64, deleted: bool) -> Result<(CacheGuard<'_>, u64)> {
        self.invalidate_impl(offset, length, deleted)
            .map(|(inner, size)| (CacheGuard { inner }, size))
    }

    fn invalidate_impl(&self, offset: u64, length: u64, deleted: bool) -> Result<(MutexGuard<'_, Inner>, u64)> {
        let length = clamp_length(offset, length);
        self.repeat_until_success(|inner| inner.address_lock.try_write_lock(offset, length).then_some(()));
        let releaser = RangeLockReleaser::new(self, offset, length, LockKind::Write);

        let (overlap, dirty, cached_file_length) = {
            let inner = self.lock();
            (
                inner.count_overlapping(offset, length, None),
                inner.count_overlapping(offset, length, Some(CacheState::Dirty)),
                inner.extents.last_upper().unwrap_or(0),
            )
        };

        if !deleted && dirty > 0 {
            error!(
                "could not invalidate dirty cache within [{}, {}) of {}",
                offset,
                offset + length,
                self.file_name
            );
            return Err(CacheError::DirtyData { offset, length });
        }

        if overlap > 0 {
            // holes beyond the cached data are pointless
            let effective = length.min(cached_file_length - offset);
            self.data.punch_hole(offset, effective).map_err(|e| {
                error!(
                    "could not punch hole at [{}, {}) of {}: {}",
                    offset,
                    offset + length,
                    self.file_name,
                    e
                );
                e
            })?;
        }

        let mut inner = self.lock();
        releaser.release(&mut inner);
        // counted again under the same hold as the erase
        let overlap = inner.count_overlapping(offset, length, None);
        let dirty = inner.count_overlapping(offset, length, Some(CacheState::Dirty));
        if overlap > 0 {
            inner.extents.erase(offset, offset + length);
        }
        inner.size -= overlap;
        inner.dirty_size -= dirty;
        debug!(
            "dirty size {} after invalidating {} dirty bytes within [{}, {}), overlap {}",
            inner.dirty_size,
            dirty,
            offset,
            offset + length,
            overlap
        );
        let size = inner.size;
        Ok((inner, size))
    }

    /// Flush the backing file and persist the extent metadata. The whole
    /// file is synced whatever the range.
    pub fn commit(&self, offset: u64, length: u64) -> Result<()> {
        self.data.sync().map_err(|e| {
            error!("could not sync cache file {}: {}", self.file_name, e);
            e
        })?;
        let meta = {
            let inner = self.lock();
            FileCacheMeta {
                file_handle: self.handle.clone(),
                newly_created: inner.newly_created,
                remote_change_time: inner.remote_change_time,
                extents: inner
                    .extents
                    .iter()
                    .map(|(l, u, s)| ExtentMeta {
                        offset: l,
                        length: u - l,
                        cache_state: s.as_u8(),
                    })
                    .collect(),
            }
        };
        meta.write_to_file(&self.meta_path)?;
        debug!(
            "committed {} extents of {} for [{}, +{})",
            meta.extents.len(),
            self.file_name,
            offset,
            length
        );
        Ok(())
    }

    /// Rebuild the in-memory state from committed metadata after checking it
    /// against the allocated ranges of the backing file. Dirty extents are
    /// queued for write-back again. Returns the cached size.
    pub fn load(&self) -> Result<u64> {
        let meta = FileCacheMeta::read_from_file(&self.meta_path)?;
        if meta.file_handle != self.handle {
            error!("metadata of {} belongs to another handle", self.file_name);
            return Err(CacheError::Inconsistent(format!(
                "handle mismatch in {}",
                self.meta_path.display()
            )));
        }
        let mut extents = Vec::with_capacity(meta.extents.len());
        for ext in meta.extents.iter().filter(|e| e.length > 0) {
            match CacheState::from_u8(ext.cache_state) {
                Some(state @ (CacheState::Clean | CacheState::Dirty)) => {
                    extents.push((ext.offset, ext.length, state))
                }
                _ => {
                    return Err(CacheError::Metadata(format!(
                        "extent [{}, +{}) has state {}",
                        ext.offset, ext.length, ext.cache_state
                    )));
                }
            }
        }
        self.validate_extents(&extents)?;

        let mut inner = self.lock();
        inner.reset();
        inner.remote_change_time = meta.remote_change_time;
        inner.newly_created = meta.newly_created;
        for &(offset, length, state) in &extents {
            // already aligned when committed
            inner.insert_extent(offset, length, state, 0);
            if state == CacheState::Dirty {
                inner.push_dirty(DirtyExtent::new(offset, length, Duration::ZERO));
            }
        }
        let size = inner.size;
        if size != inner.extents.total_len() {
            error!("file cache size mismatch: {}", self.file_name);
            return Err(CacheError::Inconsistent(format!(
                "size {} of {} disagrees with its extents",
                size, self.file_name
            )));
        }
        info!(
            "loaded {} with {} cached and {} dirty bytes",
            self.file_name, size, inner.dirty_size
        );
        Ok(size)
    }

    fn validate_extents(&self, extents: &[(u64, u64, CacheState)]) -> Result<()> {
        let mut ranges: Vec<(u64, u64)> = extents.iter().map(|&(o, l, _)| (o, o + l)).collect();
        ranges.sort_unstable();
        if ranges.windows(2).any(|w| w[0].1 > w[1].0) {
            return Err(CacheError::Metadata(format!(
                "overlapping extents in {}",
                self.meta_path.display()
            )));
        }

        let file_extents = self.data.data_extents().map_err(|e| {
            error!("could not inspect extents of {}: {}", self.file_name, e);
            e
        })?;
        let from_meta = merge_ranges(ranges, self.alignment);
        let on_disk = merge_ranges(file_extents, self.alignment);
        if from_meta != on_disk {
            error!(
                "metadata of {} does not match the cache file: {:?} vs {:?}",
                self.file_name, from_meta, on_disk
            );
            return Err(CacheError::Inconsistent(format!(
                "{} extents in metadata, {} in {}",
                from_meta.len(),
                on_disk.len(),
                self.data.path().display()
            )));
        }
        Ok(())
    }

    /// Release the entry. On `exiting` the data and metadata are committed
    /// so `load` can resume; otherwise both files are removed.
    pub fn clear(&self, exiting: bool) -> Result<()> {
        if exiting {
            let dirty = self.dirty_data_size();
            if dirty > 0 {
                warn!("{} still holds {} dirty bytes", self.file_name, dirty);
            }
            self.commit(0, 0)?;
            info!("file cache {} flushed", self.file_name);
            return Ok(());
        }

        let mut inner = self.lock();
        match self.data.remove() {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                error!("could not remove cache file {}: {}", self.file_name, e);
                return Err(e.into());
            }
        }
        // the metadata may never have been committed
        if self.meta_path.exists() {
            fs::remove_file(&self.meta_path)?;
        }
        inner.reset();
        info!("cache entry {} deleted", self.file_name);
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.lock().size
    }

    pub fn dirty_data_size(&self) -> u64 {
        self.lock().dirty_size
    }

    pub fn handle(&self) -> &[u8] {
        &self.handle
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn file_path(&self) -> &Path {
        self.data.path()
    }

    pub fn meta_path(&self) -> &Path {
        &self.meta_path
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    pub fn is_newly_created(&self) -> bool {
        self.lock().newly_created
    }

    pub fn remote_change_time(&self) -> u64 {
        self.lock().remote_change_time
    }

    pub fn set_remote_change_time(&self, t: u64) {
        self.lock().remote_change_time = t;
    }

    /// Whether the remote copy changed after time `t` was recorded.
    pub fn has_timed_out(&self, t: u64) -> bool {
        self.lock().remote_change_time < t
    }

    /// Snapshot of all cached extents.
    pub fn extents(&self) -> Vec<(u64, u64, CacheState)> {
        self.lock()
            .extents
            .iter()
            .map(|(l, u, s)| (l, u - l, *s))
            .collect()
    }

    pub fn pending_dirty_extents(&self) -> usize {
        self.lock().unpolled.len()
    }

    pub fn locked_dirty_extents(&self) -> usize {
        self.lock().locked_dirty.len()
    }
}

/// Widen sorted ranges to `alignment` and merge the ones that touch.
fn merge_ranges<I>(ranges: I, alignment: u64) -> Vec<(u64, u64)>
where
    I: IntoIterator<Item = (u64, u64)>,
{
    let mut merged: Vec<(u64, u64)> = Vec::new();
    for (lower, upper) in ranges {
        let (lower, upper) = (align_down(lower, alignment), align_up(upper, alignment));
        match merged.last_mut() {
            Some(last) if lower <= last.1 => last.1 = last.1.max(upper),
            _ => merged.push((lower, upper)),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    const B: u64 = 4096;

    fn setup(alignment: u64) -> (TempDir, FileCache) {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("data")).unwrap();
        fs::create_dir_all(dir.path().join("meta")).unwrap();
        let cache = FileCache::new(
            b"handle000",
            dir.path().join("data"),
            dir.path().join("meta"),
            0,
            alignment,
        );
        cache.create().unwrap();
        (dir, cache)
    }

    fn fill(len: u64, byte: u8) -> Vec<u8> {
        vec![byte; len as usize]
    }

    #[test]
    fn test_file_name_is_reversible() {
        let (_dir, cache) = setup(0);
        assert_eq!(
            FileCache::handle_from_file_name(cache.file_name()).unwrap(),
            b"handle000".to_vec()
        );
        assert!(cache.is_newly_created());
    }

    #[test]
    fn test_padding_only_reaches_existing_extents() {
        let (_dir, cache) = setup(B);
        assert_eq!(cache.insert(100, &fill(100, 1), CacheState::Clean).unwrap(), 100);
        assert_eq!(cache.insert(300, &fill(100, 2), CacheState::Clean).unwrap(), 300);
        assert_eq!(cache.extents(), vec![(100, 300, CacheState::Clean)]);
    }

    #[test]
    fn test_clean_padding_skips_dirty_neighbour() {
        let (_dir, cache) = setup(B);
        cache.insert(0, &fill(100, 1), CacheState::Dirty).unwrap();
        cache.insert(200, &fill(100, 2), CacheState::Clean).unwrap();
        assert_eq!(
            cache.extents(),
            vec![(0, 100, CacheState::Dirty), (100, 200, CacheState::Clean)]
        );
        assert_eq!(cache.dirty_data_size(), 100);
        assert_eq!(cache.size(), 300);
    }

    #[test]
    fn test_clean_insert_over_dirty_is_refused() {
        let (_dir, cache) = setup(0);
        cache.insert(0, &fill(B, 1), CacheState::Dirty).unwrap();
        let err = cache.insert(0, &fill(B, 2), CacheState::Clean).unwrap_err();
        assert!(matches!(err, CacheError::DirtyData { .. }));

        // the dirty bytes are untouched and the range is unlocked again
        let mut buf = fill(B, 0);
        let found = cache.lookup(0, B, Some(&mut buf)).unwrap();
        assert_eq!(found.kind, MatchKind::Full);
        assert_eq!(buf, fill(B, 1));
    }

    #[test]
    fn test_locked_dirty_is_skipped() {
        let (_dir, cache) = setup(0);
        cache.insert(0, &fill(4 * B, 1), CacheState::Dirty).unwrap();

        let mut first = DirtyExtent::new(0, 4 * B, Duration::ZERO);
        assert_eq!(cache.read_and_lock_dirty(B, &mut first).unwrap(), B);
        let mut second = DirtyExtent::new(0, 4 * B, Duration::ZERO);
        assert_eq!(cache.read_and_lock_dirty(B, &mut second).unwrap(), B);
        assert_eq!(second.offset(), B);
        assert_eq!(cache.locked_dirty_extents(), 2);

        let (left, _) = cache.cleanse_and_unlock_dirty(first, true);
        assert_eq!(left, 3 * B);
        let (left, de) = cache.cleanse_and_unlock_dirty(second, false);
        assert_eq!(left, 3 * B);
        assert_eq!((de.offset(), de.length()), (B, B));
        assert_eq!(cache.locked_dirty_extents(), 0);
    }

    #[test]
    fn test_pending_queue_is_ordered_by_offset() {
        let (_dir, cache) = setup(0);
        cache.push_dirty_extent(DirtyExtent::new(2 * B, B, Duration::ZERO));
        cache.push_dirty_extent(DirtyExtent::new(0, B, Duration::from_secs(3600)));
        cache.push_dirty_extent(DirtyExtent::new(B, B, Duration::ZERO));

        let due = cache.pop_due_dirty_extent(Instant::now()).unwrap();
        assert_eq!(due.offset(), B);
        assert_eq!(cache.pop_dirty_extent().unwrap().offset(), 0);
        assert_eq!(cache.pop_dirty_extent().unwrap().offset(), 2 * B);
        assert!(cache.pop_dirty_extent().is_none());
    }

    fn dirty_in_extents(cache: &FileCache) -> u64 {
        cache
            .extents()
            .iter()
            .filter(|(_, _, s)| *s == CacheState::Dirty)
            .map(|(_, l, _)| *l)
            .sum()
    }

    #[test]
    fn test_dirty_padding_stops_at_write_locked_range() {
        let (_dir, cache) = setup(B);
        cache.insert(0, &fill(150, 1), CacheState::Clean).unwrap();
        // a clean insert of [100, 300) is writing its bytes
        assert!(cache.lock().address_lock.try_write_lock(100, 200));

        cache.insert(512, &fill(10, 2), CacheState::Dirty).unwrap();
        assert_eq!(
            cache.extents(),
            vec![(0, 150, CacheState::Clean), (512, 10, CacheState::Dirty)]
        );
        assert_eq!(cache.dirty_data_size(), 10);

        // the clean insert finishes without running into dirty bytes
        cache.lock().address_lock.write_unlock(100, 200);
        cache.insert(100, &fill(200, 3), CacheState::Clean).unwrap();
        assert_eq!(
            cache.extents(),
            vec![(0, 512, CacheState::Clean), (512, 10, CacheState::Dirty)]
        );
        assert_eq!(cache.dirty_data_size(), 10);
        assert_eq!(cache.size(), 522);
    }

    #[test]
    fn test_clean_tag_skips_dirty_pieces() {
        let (_dir, cache) = setup(0);
        cache.insert(0, &fill(300, 1), CacheState::Clean).unwrap();
        {
            let mut inner = cache.lock();
            inner.insert_extent(100, 50, CacheState::Dirty, 0);
            inner.insert_extent(0, 300, CacheState::Clean, 0);
        }
        assert_eq!(
            cache.extents(),
            vec![
                (0, 100, CacheState::Clean),
                (100, 50, CacheState::Dirty),
                (150, 150, CacheState::Clean),
            ]
        );
        assert_eq!(cache.dirty_data_size(), 50);
        assert_eq!(cache.size(), 300);
    }

    #[test]
    fn test_dirty_padding_stays_out_of_invalidated_range() {
        let (_dir, cache) = setup(B);
        cache.insert(0, &fill(100, 1), CacheState::Clean).unwrap();
        // an invalidate of [0, 100) is punching its hole
        assert!(cache.lock().address_lock.try_write_lock(0, 100));

        cache.insert(200, &fill(100, 2), CacheState::Dirty).unwrap();
        assert_eq!(cache.dirty_data_size(), 100);

        cache.lock().address_lock.write_unlock(0, 100);
        assert_eq!(cache.invalidate(0, 100, false).unwrap(), 100);
        assert_eq!(cache.dirty_data_size(), 100);
        assert_eq!(dirty_in_extents(&cache), 100);
    }

    #[test]
    fn test_ranges_up_to_end_of_offset_space() {
        let (_dir, cache) = setup(0);
        cache.insert(B, &fill(B, 1), CacheState::Clean).unwrap();
        let found = cache.lookup(1, u64::MAX, None).unwrap();
        assert_eq!((found.kind, found.offset, found.length), (MatchKind::Middle, B, B));
        assert_eq!(cache.invalidate(1, u64::MAX, false).unwrap(), 0);
        assert!(cache.extents().is_empty());

        let err = cache.insert(u64::MAX - 1, &fill(4, 1), CacheState::Clean).unwrap_err();
        assert_eq!(err.errno(), -libc::EINVAL);
    }

    #[test]
    fn test_remote_change_time() {
        let (_dir, cache) = setup(0);
        cache.set_remote_change_time(10);
        assert!(!cache.has_timed_out(10));
        assert!(cache.has_timed_out(11));
        assert_eq!(cache.remote_change_time(), 10);
    }
}
