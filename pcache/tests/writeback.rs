use pcache::cache::{CacheState, FileCache};
use pcache::error::CacheError;
use pcache::writeback::{Drained, LocalDirSink, SinkError, WriteBack, WriteBackManager, WriteBackWorker};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::{TempDir, tempdir};

const MAX_LENGTH: u64 = 64 << 20;

#[derive(Default)]
struct RecordingSink {
    writes: Mutex<Vec<(u64, Vec<u8>)>>,
}

impl RecordingSink {
    fn ranges(&self) -> Vec<(u64, u64)> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .map(|(off, data)| (*off, data.len() as u64))
            .collect()
    }
}

impl WriteBack for RecordingSink {
    fn write_back(&self, _handle: &[u8], offset: u64, data: &[u8]) -> Result<usize, SinkError> {
        self.writes.lock().unwrap().push((offset, data.to_vec()));
        Ok(data.len())
    }
}

/// Refuses the first `failures` pushes, then accepts everything.
struct FlakySink {
    failures: AtomicUsize,
    short: bool,
}

impl WriteBack for FlakySink {
    fn write_back(&self, _handle: &[u8], _offset: u64, data: &[u8]) -> Result<usize, SinkError> {
        let left = self.failures.load(Ordering::SeqCst);
        if left == 0 {
            return Ok(data.len());
        }
        self.failures.store(left - 1, Ordering::SeqCst);
        if self.short {
            Ok(data.len() - 1)
        } else {
            Err("upstream unavailable".into())
        }
    }
}

struct Fixture {
    _dir: TempDir,
    cache: FileCache,
    rng: StdRng,
    bs: u64,
}

impl Fixture {
    fn new(bs: u64) -> Self {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("data")).unwrap();
        fs::create_dir_all(dir.path().join("meta")).unwrap();
        let cache = FileCache::new(b"handle000", dir.path().join("data"), dir.path().join("meta"), 0, bs);
        cache.create().unwrap();
        Self {
            _dir: dir,
            cache,
            rng: StdRng::seed_from_u64(8887),
            bs,
        }
    }

    fn random(&mut self, len: u64) -> Vec<u8> {
        let mut buf = vec![0u8; len as usize];
        self.rng.fill(&mut buf[..]);
        buf
    }

    fn insert_dirty(&mut self, offset: u64, length: u64) -> Vec<u8> {
        let data = self.random(length);
        self.cache.insert_dirty(offset, &data, Duration::ZERO).unwrap();
        data
    }

    fn insert_clean(&mut self, offset: u64, length: u64) -> Vec<u8> {
        let data = self.random(length);
        self.cache.insert(offset, &data, CacheState::Clean).unwrap();
        data
    }

    fn drain(&self) -> Vec<(u64, u64)> {
        let manager = WriteBackManager::new(RecordingSink::default(), MAX_LENGTH, Duration::ZERO);
        self.drain_with(&manager)
    }

    fn drain_with(&self, manager: &WriteBackManager<RecordingSink>) -> Vec<(u64, u64)> {
        loop {
            match manager.write_back_next(&self.cache, false).unwrap() {
                Drained::Idle => break,
                Drained::Skipped | Drained::Written { .. } => {}
                Drained::Failed { offset, length } => panic!("failed at [{offset}, +{length})"),
            }
        }
        assert_eq!(self.cache.dirty_data_size(), 0);
        assert_eq!(self.cache.locked_dirty_extents(), 0);
        manager.sink().ranges()
    }
}

fn block_sizes() -> [u64; 2] {
    [4096, 1 << 20]
}

#[test]
fn test_dirty_block_is_written_back() {
    for bs in block_sizes() {
        let mut f = Fixture::new(bs);
        f.insert_dirty(0, bs / 2);
        assert_eq!(f.drain(), vec![(0, bs / 2)]);
    }
}

#[test]
fn test_two_identical_writes() {
    for bs in block_sizes() {
        let mut f = Fixture::new(bs);
        f.insert_dirty(0, bs / 4);
        f.insert_dirty(0, bs / 4);
        assert_eq!(f.drain(), vec![(0, bs / 4)]);
    }
}

#[test]
fn test_large_overlapping_writes() {
    for bs in block_sizes() {
        let mut f = Fixture::new(bs);
        f.insert_dirty(bs, bs / 4);
        f.insert_dirty(bs, 5 * bs);
        assert_eq!(f.drain(), vec![(bs, 5 * bs)]);
    }
}

#[test]
fn test_writes_out_of_order() {
    for bs in block_sizes() {
        let mut f = Fixture::new(bs);
        f.insert_dirty(bs / 2, bs / 4);
        f.insert_dirty(0, bs / 4);
        f.insert_dirty(bs / 4, bs / 4);
        assert_eq!(f.drain(), vec![(0, 3 * bs / 4)]);
    }
}

#[test]
fn test_gaps_inside_a_block_are_padded() {
    for bs in block_sizes() {
        let mut f = Fixture::new(bs);
        f.insert_dirty(0, bs / 4);
        f.insert_dirty(bs / 2, bs / 4);
        f.insert_dirty(bs / 4, bs / 4);
        f.insert_dirty(3 * bs / 4, bs / 4);
        assert_eq!(f.drain(), vec![(0, bs)]);
    }
}

#[test]
fn test_writes_in_reverse_order() {
    for bs in block_sizes() {
        let mut f = Fixture::new(bs);
        f.insert_dirty(3 * bs / 4, bs / 4);
        f.insert_dirty(bs / 2, bs / 4);
        f.insert_dirty(bs / 4, bs / 4);
        f.insert_dirty(0, bs / 4);
        assert_eq!(f.drain(), vec![(0, bs)]);
    }
}

#[test]
fn test_dirty_extents_in_the_same_block_are_merged() {
    for bs in block_sizes() {
        let mut f = Fixture::new(bs);
        f.insert_dirty(0, bs / 4);
        f.insert_dirty(bs / 2, bs / 4);
        assert_eq!(f.drain(), vec![(0, 3 * bs / 4)]);
    }
}

#[test]
fn test_clean_data_in_dirty_block_is_written_back() {
    for bs in block_sizes() {
        let mut f = Fixture::new(bs);
        let clean = f.insert_clean(0, bs / 2);
        let dirty = f.insert_dirty(bs / 2, bs / 4);
        let manager = WriteBackManager::new(RecordingSink::default(), MAX_LENGTH, Duration::ZERO);
        assert_eq!(f.drain_with(&manager), vec![(0, 3 * bs / 4)]);

        let writes = manager.sink().writes.lock().unwrap();
        let pushed = &writes[0].1;
        assert_eq!(&pushed[..(bs / 2) as usize], &clean[..]);
        assert_eq!(&pushed[(bs / 2) as usize..], &dirty[..]);
    }
}

#[test]
fn test_adjacent_dirty_and_clean_blocks() {
    for bs in block_sizes() {
        let mut f = Fixture::new(bs);
        f.insert_clean(0, bs);
        f.insert_dirty(bs, bs);
        assert_eq!(f.drain(), vec![(bs, bs)]);
        assert_eq!(f.cache.extents(), vec![(0, 2 * bs, CacheState::Clean)]);
    }
}

#[test]
fn test_unaligned_dirty_across_block_boundary() {
    for bs in block_sizes() {
        let mut f = Fixture::new(bs);
        f.insert_clean(0, 2 * bs);
        f.insert_dirty(bs / 2, bs);
        assert_eq!(f.drain(), vec![(0, 2 * bs)]);
    }
}

#[test]
fn test_unaligned_dirty_merges_clean_leftover() {
    for bs in block_sizes() {
        let mut f = Fixture::new(bs);
        let first = f.insert_dirty(0, bs / 2);
        assert_eq!(f.drain(), vec![(0, bs / 2)]);

        assert_eq!(f.cache.invalidate(bs / 4, bs / 4, true).unwrap(), bs / 4);
        let second = f.insert_dirty(bs / 4, bs / 4);
        let manager = WriteBackManager::new(RecordingSink::default(), MAX_LENGTH, Duration::ZERO);
        assert_eq!(f.drain_with(&manager), vec![(0, bs / 2)]);

        let writes = manager.sink().writes.lock().unwrap();
        let pushed = &writes[0].1;
        assert_eq!(&pushed[..(bs / 4) as usize], &first[..(bs / 4) as usize]);
        assert_eq!(&pushed[(bs / 4) as usize..], &second[..]);
    }
}

#[test]
fn test_max_length_splits_a_window() {
    let mut f = Fixture::new(4096);
    f.insert_dirty(0, 4 * 4096);
    let manager = WriteBackManager::new(RecordingSink::default(), 4096, Duration::ZERO);
    assert_eq!(
        f.drain_with(&manager),
        vec![(0, 4096), (4096, 4096), (2 * 4096, 4096), (3 * 4096, 4096)]
    );
}

#[test]
fn test_windows_wait_for_their_deadline() {
    let mut f = Fixture::new(4096);
    let data = f.random(4096);
    f.cache.insert_dirty(0, &data, Duration::from_secs(3600)).unwrap();

    let manager = WriteBackManager::new(RecordingSink::default(), MAX_LENGTH, Duration::ZERO);
    assert_eq!(manager.write_back_next(&f.cache, false).unwrap(), Drained::Idle);
    assert_eq!(f.cache.pending_dirty_extents(), 1);

    assert_eq!(manager.flush(&f.cache).unwrap(), 4096);
    assert_eq!(f.cache.dirty_data_size(), 0);
}

#[test]
fn test_failed_write_back_is_queued_again() {
    for short in [false, true] {
        let mut f = Fixture::new(4096);
        f.insert_dirty(0, 2 * 4096);
        let sink = FlakySink {
            failures: AtomicUsize::new(1),
            short,
        };
        let manager = WriteBackManager::new(sink, MAX_LENGTH, Duration::from_secs(3600));

        assert_eq!(
            manager.write_back_next(&f.cache, false).unwrap(),
            Drained::Failed {
                offset: 0,
                length: 2 * 4096
            }
        );
        assert_eq!(f.cache.dirty_data_size(), 2 * 4096);
        assert_eq!(f.cache.locked_dirty_extents(), 0);
        assert_eq!(f.cache.pending_dirty_extents(), 1);

        // the retry is not due yet
        assert_eq!(manager.write_back_next(&f.cache, false).unwrap(), Drained::Idle);
        assert_eq!(manager.flush(&f.cache).unwrap(), 2 * 4096);
        assert_eq!(f.cache.dirty_data_size(), 0);
        assert_eq!(
            f.cache.extents(),
            vec![(0, 2 * 4096, CacheState::Clean)]
        );
    }
}

#[test]
fn test_flush_stops_at_first_failure() {
    let mut f = Fixture::new(4096);
    f.insert_dirty(0, 4096);
    let sink = FlakySink {
        failures: AtomicUsize::new(usize::MAX),
        short: false,
    };
    let manager = WriteBackManager::new(sink, MAX_LENGTH, Duration::ZERO);
    let err = manager.flush(&f.cache).unwrap_err();
    assert!(matches!(err, CacheError::WriteBack(_)));
    assert_eq!(f.cache.dirty_data_size(), 4096);
    assert_eq!(f.cache.pending_dirty_extents(), 1);
}

#[test]
fn test_local_dir_sink_receives_flushed_bytes() {
    let mut f = Fixture::new(4096);
    let dir = tempdir().unwrap();
    let data = f.insert_dirty(4096, 4096);
    let manager = WriteBackManager::new(LocalDirSink::new(dir.path()), MAX_LENGTH, Duration::ZERO);
    assert_eq!(manager.flush(&f.cache).unwrap(), 4096);

    let stored = fs::read(manager.sink().path_for(f.cache.handle())).unwrap();
    assert_eq!(stored.len(), 2 * 4096);
    assert_eq!(&stored[4096..], &data[..]);
}

#[test]
fn test_worker_drains_in_background() {
    let mut f = Fixture::new(4096);
    f.insert_dirty(0, 4096);
    f.insert_dirty(8 * 4096, 2 * 4096);

    let cache = Arc::new(f.cache);
    let manager = Arc::new(WriteBackManager::new(RecordingSink::default(), MAX_LENGTH, Duration::ZERO));
    let mut worker = WriteBackWorker::spawn(manager.clone(), cache.clone(), Duration::from_millis(10)).unwrap();

    let started = Instant::now();
    while cache.dirty_data_size() > 0 {
        assert!(started.elapsed() < Duration::from_secs(10), "worker did not drain");
        thread::sleep(Duration::from_millis(5));
    }
    worker.stop();

    assert_eq!(manager.sink().ranges(), vec![(0, 4096), (8 * 4096, 2 * 4096)]);
    assert_eq!(cache.pending_dirty_extents(), 0);
}
