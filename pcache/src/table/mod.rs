//! Host-owned table of cache entries keyed by remote file handle.

mod revalidator;

pub use revalidator::Revalidator;

use crate::cache::FileCache;
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

pub struct CacheTable {
    config: CacheConfig,
    files: Mutex<HashMap<Vec<u8>, Arc<FileCache>>>,
    revalidator: Revalidator,
}

impl CacheTable {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            files: Mutex::new(HashMap::new()),
            revalidator: Revalidator::new(),
        }
    }

    fn files(&self) -> MutexGuard<'_, HashMap<Vec<u8>, Arc<FileCache>>> {
        self.files.lock().expect("cache table mutex poisoned")
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn revalidator(&self) -> &Revalidator {
        &self.revalidator
    }

    pub fn len(&self) -> usize {
        self.files().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, handle: &[u8]) -> Option<Arc<FileCache>> {
        self.files().get(handle).cloned()
    }

    pub fn handles(&self) -> Vec<Vec<u8>> {
        let mut handles: Vec<_> = self.files().keys().cloned().collect();
        handles.sort_unstable();
        handles
    }

    /// Entry for `handle`, creating an empty one stamped with the last
    /// remote change time seen for it.
    pub fn get_or_create(&self, handle: &[u8]) -> Result<Arc<FileCache>> {
        let mut files = self.files();
        if let Some(cache) = files.get(handle) {
            return Ok(cache.clone());
        }
        let cache = Arc::new(FileCache::new(
            handle,
            &self.config.cache_dir,
            &self.config.meta_dir,
            self.revalidator.remote_change_time(handle),
            self.config.alignment,
        ));
        cache.create().map_err(|e| {
            error!("error in creating file cache {}: {}", cache.file_name(), e);
            e
        })?;
        debug!("new file cache created for {}", cache.file_name());
        files.insert(handle.to_vec(), cache.clone());
        Ok(cache)
    }

    /// Rebuild the table from the entries under `cache_dir`. Entries whose
    /// name is not an encoded handle or that fail to load are skipped.
    /// Returns how many entries were loaded.
    pub fn load_all(&self) -> Result<usize> {
        let dir = fs::read_dir(&self.config.cache_dir).map_err(|e| {
            error!(
                "could not load cache from {}: {}",
                self.config.cache_dir.display(),
                e
            );
            e
        })?;

        let mut loaded = 0;
        for entry in dir {
            let entry = entry?;
            if !entry.metadata()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(handle) = name.to_str().and_then(FileCache::handle_from_file_name) else {
                warn!("ignoring foreign file {:?} in cache directory", name);
                continue;
            };
            if self.files().contains_key(&handle) {
                continue;
            }

            let cache = FileCache::new(
                &handle,
                &self.config.cache_dir,
                &self.config.meta_dir,
                0,
                self.config.alignment,
            );
            if let Err(e) = cache.load() {
                error!("fail to load cache file {}: {}. Ignored.", cache.file_name(), e);
                continue;
            }
            self.files().insert(handle, Arc::new(cache));
            loaded += 1;
        }
        info!(
            "loaded {} cache entries from {}",
            loaded,
            self.config.cache_dir.display()
        );
        Ok(loaded)
    }

    /// Record that the remote copy of `handle` changed at `time` and drop
    /// the cached data if it predates that change. Entries holding dirty
    /// data are left alone and reported as `DirtyData`. Returns whether the
    /// entry was invalidated.
    pub fn revalidate(&self, handle: &[u8], time: u64) -> Result<bool> {
        self.revalidator.add_remote_change_time(handle, time);
        let Some(cache) = self.get(handle) else {
            debug!("nothing to revalidate");
            return Ok(false);
        };
        if !cache.has_timed_out(time) {
            return Ok(false);
        }
        self.invalidate_entry(&cache, 0, u64::MAX, false)
            .inspect_err(|e| {
                if matches!(e, CacheError::DirtyData { .. }) {
                    error!("could not invalidate {} because of dirty cache", cache.file_name());
                }
            })?;
        Ok(true)
    }

    /// Drop `[offset, offset + length)` of `handle`. Entries left empty are
    /// removed from the table along with their files. Returns the cached
    /// size afterwards.
    pub fn invalidate(&self, handle: &[u8], offset: u64, length: u64, deleted: bool) -> Result<u64> {
        match self.get(handle) {
            Some(cache) => self.invalidate_entry(&cache, offset, length, deleted),
            None => {
                debug!("nothing to invalidate");
                Ok(0)
            }
        }
    }

    /// The remote file is gone: drop everything, dirty data included.
    pub fn delete(&self, handle: &[u8]) -> Result<()> {
        self.invalidate(handle, 0, u64::MAX, true).map(|_| ())
    }

    pub fn close(&self, handle: &[u8]) {
        self.revalidator.delete_remote_change_time(handle);
    }

    pub fn commit(&self, handle: &[u8], offset: u64, length: u64) -> Result<()> {
        match self.get(handle) {
            Some(cache) => cache.commit(offset, length),
            None => Ok(()),
        }
    }

    pub fn is_dirty(&self, handle: &[u8]) -> bool {
        self.get(handle).is_some_and(|c| c.dirty_data_size() > 0)
    }

    /// Release every entry; see [`FileCache::clear`].
    pub fn clear_all(&self, exiting: bool) -> Result<()> {
        let drained: Vec<_> = self.files().drain().map(|(_, c)| c).collect();
        let mut first_err = None;
        for cache in drained {
            if let Err(e) = cache.clear(exiting) {
                error!("could not clear {}: {}", cache.file_name(), e);
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn invalidate_entry(&self, cache: &Arc<FileCache>, offset: u64, length: u64, deleted: bool) -> Result<u64> {
        let size = cache.invalidate(offset, length, deleted).map_err(|e| {
            error!(
                "could not invalidate [{}, +{}) of {}: {}",
                offset,
                length,
                cache.file_name(),
                e
            );
            e
        })?;
        if size == 0 {
            debug!("evicting file cache {}", cache.file_name());
            // held across the removal so a re-creation cannot reuse the files
            let mut files = self.files();
            if files.get(cache.handle()).is_some_and(|c| Arc::ptr_eq(c, cache)) {
                files.remove(cache.handle());
            }
            cache.clear(false)?;
        }
        Ok(size)
    }
}

impl std::fmt::Debug for CacheTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheTable")
            .field("cache_dir", &self.config.cache_dir)
            .field("entries", &self.len())
            .finish()
    }
}
