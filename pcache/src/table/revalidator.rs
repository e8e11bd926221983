use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy)]
struct RemoteChange {
    time: u64,
    opens: u32,
}

/// Latest remote change time seen per open file handle.
///
/// Every open adds a reference; the recorded time is kept until the last
/// matching close.
#[derive(Debug, Default)]
pub struct Revalidator {
    times: Mutex<HashMap<Vec<u8>, RemoteChange>>,
}

impl Revalidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded change time of `handle`, or 0 when none is known.
    pub fn remote_change_time(&self, handle: &[u8]) -> u64 {
        self.times
            .lock()
            .expect("revalidator mutex poisoned")
            .get(handle)
            .map_or(0, |rc| rc.time)
    }

    pub fn add_remote_change_time(&self, handle: &[u8], time: u64) {
        let mut times = self.times.lock().expect("revalidator mutex poisoned");
        let rc = times
            .entry(handle.to_vec())
            .or_insert(RemoteChange { time, opens: 0 });
        rc.time = time;
        rc.opens = rc.opens.saturating_add(1);
    }

    pub fn delete_remote_change_time(&self, handle: &[u8]) {
        let mut times = self.times.lock().expect("revalidator mutex poisoned");
        if let Some(rc) = times.get_mut(handle) {
            rc.opens -= 1;
            if rc.opens == 0 {
                times.remove(handle);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.times.lock().expect("revalidator mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
