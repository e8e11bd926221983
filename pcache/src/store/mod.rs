//! Sparse local file backing one cache entry.
//!
//! Every call opens the file by path. Writes return only after the data
//! reached stable storage.

use crate::blockmap::NonOverlapSet;
use nix::errno::Errno;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct BackingFile {
    path: PathBuf,
}

impl BackingFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Create an empty file, truncating any leftover.
    pub fn create(&self) -> io::Result<()> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        Ok(())
    }

    pub fn len(&self) -> io::Result<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    pub fn remove(&self) -> io::Result<()> {
        fs::remove_file(&self.path)
    }

    /// Read into `buf` from `offset`. Stops early only at end of file.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let file = File::open(&self.path)?;
        let mut done = 0;
        while done < buf.len() {
            match file.read_at(&mut buf[done..], offset + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(done)
    }

    /// Write `data` at `offset` and flush it to disk. Returns the number of
    /// bytes written, which is short only if the device stops accepting data.
    pub fn write_at_sync(&self, offset: u64, data: &[u8]) -> io::Result<usize> {
        let file = OpenOptions::new().write(true).create(true).open(&self.path)?;
        let mut done = 0;
        while done < data.len() {
            match file.write_at(&data[done..], offset + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        file.sync_data()?;
        Ok(done)
    }

    /// Flush all data of the file.
    pub fn sync(&self) -> io::Result<()> {
        let file = OpenOptions::new().write(true).create(true).open(&self.path)?;
        file.sync_data()
    }

    /// Deallocate `[offset, offset + length)` without changing the file size.
    pub fn punch_hole(&self, offset: u64, length: u64) -> io::Result<()> {
        if length == 0 {
            return Ok(());
        }
        let file = OpenOptions::new().write(true).open(&self.path)?;
        let ret = unsafe {
            libc::fallocate(
                file.as_raw_fd(),
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                offset as libc::off_t,
                length as libc::off_t,
            )
        };
        Errno::result(ret)?;
        debug!("punched hole [{}, +{}) in {}", offset, length, self.path.display());
        Ok(())
    }

    /// Allocated data regions as `(lower, upper)` pairs in ascending order.
    pub fn data_extents(&self) -> io::Result<Vec<(u64, u64)>> {
        let file = File::open(&self.path)?;
        let fd = file.as_raw_fd();
        let mut extents = Vec::new();
        let mut pos: libc::off_t = 0;
        loop {
            let data = match Errno::result(unsafe { libc::lseek(fd, pos, libc::SEEK_DATA) }) {
                Ok(off) => off,
                // no data at or after pos
                Err(Errno::ENXIO) => break,
                Err(e) => return Err(e.into()),
            };
            let hole = Errno::result(unsafe { libc::lseek(fd, data, libc::SEEK_HOLE) })?;
            extents.push((data as u64, hole as u64));
            pos = hole;
        }
        Ok(extents)
    }

    /// Unallocated regions below the file size.
    pub fn holes(&self) -> io::Result<NonOverlapSet> {
        let size = self.len()?;
        let mut holes = NonOverlapSet::new();
        let mut cursor = 0;
        for (lower, upper) in self.data_extents()? {
            if lower > cursor {
                holes.push_back(cursor, lower - cursor);
            }
            cursor = upper;
        }
        if size > cursor {
            holes.push_back(cursor, size - cursor);
        }
        Ok(holes)
    }
}
