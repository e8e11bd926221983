//! Dirty ranges queued for, or currently under, write-back.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct DirtyExtent {
    offset: u64,
    length: u64,
    deadline: Instant,
    /// Bytes read from the backing file while the range is read-locked.
    pub(crate) data: Option<Vec<u8>>,
}

impl DirtyExtent {
    /// A range that becomes due for write-back after `delay`.
    pub fn new(offset: u64, length: u64, delay: Duration) -> Self {
        Self::with_deadline(offset, length, Instant::now() + delay)
    }

    pub fn with_deadline(offset: u64, length: u64, deadline: Instant) -> Self {
        Self {
            offset,
            length,
            deadline,
            data: None,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub fn take_data(&mut self) -> Option<Vec<u8>> {
        self.data.take()
    }

    pub(crate) fn set_range(&mut self, offset: u64, length: u64) {
        self.offset = offset;
        self.length = length;
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn is_due(&self) -> bool {
        self.is_due_at(Instant::now())
    }

    pub fn is_due_at(&self, now: Instant) -> bool {
        self.deadline <= now
    }

    pub fn clear(&mut self) {
        self.length = 0;
    }

    pub fn contains(&self, pos: u64) -> bool {
        pos >= self.offset && pos < self.end()
    }

    pub fn overlaps(&self, offset: u64, length: u64) -> bool {
        length > 0 && !self.is_empty() && offset < self.end() && offset + length > self.offset
    }

    /// Cut away the part overlapping `[offset, offset + length)`. When the
    /// cut falls inside the extent only the leading piece is kept. Returns
    /// whether the extent is empty afterwards.
    pub fn trim(&mut self, offset: u64, length: u64) -> bool {
        let own_end = self.end();
        let end = offset + length;
        if offset >= own_end || end <= self.offset {
            return self.is_empty();
        }
        if offset <= self.offset && end >= own_end {
            self.length = 0;
        } else if offset > self.offset {
            self.length = offset - self.offset;
        } else {
            self.offset = end;
            self.length = own_end - end;
        }
        self.is_empty()
    }

    /// Shrink to the intersection with `[offset, offset + length)`. A
    /// disjoint range leaves the extent unchanged.
    pub fn clip(&mut self, offset: u64, length: u64) -> bool {
        if self.overlaps(offset, length) {
            let lo = offset.max(self.offset);
            let hi = (offset + length).min(self.end());
            self.offset = lo;
            self.length = hi - lo;
        }
        self.is_empty()
    }

    /// Copy of the range and deadline without the payload.
    pub fn descriptor(&self) -> DirtyExtent {
        DirtyExtent::with_deadline(self.offset, self.length, self.deadline)
    }
}
