//! Draining dirty cache data to the upstream store.
//!
//! The drainer pulls queued windows from a `FileCache`, reads and read-locks
//! the dirty bytes inside, pushes them through a `WriteBack` sink with no
//! cache lock held and finally marks them clean. Failed pushes are queued
//! again, so dirty data is never dropped.

use crate::cache::{DirtyExtent, FileCache};
use crate::error::{CacheError, Result};
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Upstream destination of dirty data.
pub trait WriteBack: Send + Sync {
    /// Store `data` at `offset` of the remote file `handle`. Returns the
    /// number of bytes accepted.
    fn write_back(&self, handle: &[u8], offset: u64, data: &[u8]) -> std::result::Result<usize, SinkError>;
}

/// Sink writing each remote file to `<root>/<hex handle>`, for local runs.
pub struct LocalDirSink {
    root: PathBuf,
}

impl LocalDirSink {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, handle: &[u8]) -> PathBuf {
        self.root.join(hex::encode(handle))
    }
}

impl WriteBack for LocalDirSink {
    fn write_back(&self, handle: &[u8], offset: u64, data: &[u8]) -> std::result::Result<usize, SinkError> {
        fs::create_dir_all(&self.root)?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.path_for(handle))?;
        file.write_all_at(data, offset)?;
        file.sync_data()?;
        Ok(data.len())
    }
}

/// Result of one drain step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drained {
    /// Nothing queued (or nothing due).
    Idle,
    /// A queued window held no dirty data left to push.
    Skipped,
    Written { offset: u64, length: u64, dirty_left: u64 },
    /// The sink refused the data; it is queued again.
    Failed { offset: u64, length: u64 },
}

pub struct WriteBackManager<W> {
    sink: W,
    max_length: u64,
    retry_delay: Duration,
}

impl<W: WriteBack> WriteBackManager<W> {
    pub fn new(sink: W, max_length: u64, retry_delay: Duration) -> Self {
        Self {
            sink,
            max_length,
            retry_delay,
        }
    }

    pub fn sink(&self) -> &W {
        &self.sink
    }

    /// Push one queued window upstream. Without `force` only windows past
    /// their deadline are taken.
    pub fn write_back_next(&self, cache: &FileCache, force: bool) -> Result<Drained> {
        let window = if force {
            cache.pop_dirty_extent()
        } else {
            cache.pop_due_dirty_extent(Instant::now())
        };
        let Some(window) = window else {
            return Ok(Drained::Idle);
        };

        let mut extent = window.descriptor();
        let length = match cache.read_and_lock_dirty(self.max_length, &mut extent) {
            Ok(n) => n,
            Err(e) => {
                error!(
                    "could not read dirty data at {} of {}: {}",
                    window.offset(),
                    cache.file_name(),
                    e
                );
                cache.push_dirty_extent(window);
                return Err(e);
            }
        };
        if length == 0 {
            return Ok(Drained::Skipped);
        }
        // whatever the read did not reach stays queued
        if extent.end() < window.end() {
            cache.push_dirty_extent(DirtyExtent::with_deadline(
                extent.end(),
                window.end() - extent.end(),
                window.deadline(),
            ));
        }

        let offset = extent.offset();
        let data = extent.take_data().unwrap_or_default();
        let pushed = self.sink.write_back(cache.handle(), offset, &data);
        drop(data);
        let success = matches!(&pushed, Ok(n) if *n as u64 == length);
        let (dirty_left, de) = cache.cleanse_and_unlock_dirty(extent, success);

        if success {
            debug!(
                "wrote back [{}, +{}) of {}, {} dirty bytes left",
                offset,
                length,
                cache.file_name(),
                dirty_left
            );
            return Ok(Drained::Written {
                offset,
                length,
                dirty_left,
            });
        }
        match pushed {
            Ok(n) => warn!(
                "partial write-back of {} at {}: {} of {} bytes",
                cache.file_name(),
                offset,
                n,
                length
            ),
            Err(e) => warn!("write-back of {} at {} failed: {}", cache.file_name(), offset, e),
        }
        cache.push_dirty_extent(DirtyExtent::new(de.offset(), de.length(), self.retry_delay));
        Ok(Drained::Failed { offset, length })
    }

    /// Drain every queued window regardless of deadlines. Stops at the first
    /// failed push. Returns the bytes written back.
    pub fn flush(&self, cache: &FileCache) -> Result<u64> {
        let mut total = 0;
        loop {
            match self.write_back_next(cache, true)? {
                Drained::Idle => break,
                Drained::Skipped => {}
                Drained::Written { length, .. } => total += length,
                Drained::Failed { offset, length } => {
                    return Err(CacheError::WriteBack(format!(
                        "[{}, +{}) of {}",
                        offset,
                        length,
                        cache.file_name()
                    )));
                }
            }
        }
        info!("flushed {} bytes of {}", total, cache.file_name());
        Ok(total)
    }
}

/// Background thread draining one cache until stopped.
pub struct WriteBackWorker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl WriteBackWorker {
    pub fn spawn<W>(
        manager: Arc<WriteBackManager<W>>,
        cache: Arc<FileCache>,
        poll_interval: Duration,
    ) -> io::Result<Self>
    where
        W: WriteBack + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name("pcache-wb".to_string())
            .spawn(move || {
                debug!("write-back worker for {} started", cache.file_name());
                while !flag.load(Ordering::Acquire) {
                    match manager.write_back_next(&cache, false) {
                        Ok(Drained::Written { .. }) | Ok(Drained::Skipped) => continue,
                        Ok(_) => {}
                        Err(e) => error!("write-back of {} failed: {}", cache.file_name(), e),
                    }
                    thread::park_timeout(poll_interval);
                }
                debug!("write-back worker for {} stopped", cache.file_name());
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                error!("write-back worker panicked");
            }
        }
    }
}

impl Drop for WriteBackWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_local_dir_sink_writes_at_offset() {
        let dir = tempdir().unwrap();
        let sink = LocalDirSink::new(dir.path().join("remote"));
        assert_eq!(sink.write_back(b"fh", 4, b"abcd").unwrap(), 4);
        assert_eq!(sink.write_back(b"fh", 0, b"wxyz").unwrap(), 4);
        let stored = fs::read(sink.path_for(b"fh")).unwrap();
        assert_eq!(stored, b"wxyzabcd");
        assert!(sink.path_for(b"fh").ends_with("6668"));
    }
}
