//! Byte-range read/write locks for a single cached file.
//!
//! `RangeLock` is not synchronized on its own. The owning cache holds its
//! coarse mutex around every call, including the `is_*` queries.

use crate::interval::{IntervalMap, Segment};
use std::fmt;

/// Lock state of one range. Bit 0 marks a writer, every reader adds 2.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct LockValue(u32);

impl LockValue {
    pub const UNLOCKED: LockValue = LockValue(0);
    pub const WRITE: LockValue = LockValue(1);
    pub const READ: LockValue = LockValue(2);

    /// Build from a raw encoding. Panics on an encoding that is both read
    /// and write locked.
    pub fn from_raw(raw: u32) -> Self {
        assert!(Self::is_valid(raw), "invalid lock value {raw}");
        LockValue(raw)
    }

    pub fn is_valid(raw: u32) -> bool {
        raw <= 1 || raw & 0x1 == 0
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn is_unlocked(self) -> bool {
        self.0 == 0
    }

    pub fn is_locked(self) -> bool {
        self.0 > 0
    }

    pub fn is_read_locked(self) -> bool {
        self.0 >= 2 && self.0 & 0x1 == 0
    }

    pub fn is_write_locked(self) -> bool {
        self.0 == 1
    }

    pub fn readers(self) -> u32 {
        if self.is_read_locked() { self.0 / 2 } else { 0 }
    }

    /// Whether `other` may be stacked on top of `self`.
    pub fn is_compatible(self, other: LockValue) -> bool {
        !((self.is_write_locked() && other.is_locked())
            || (self.is_locked() && other.is_write_locked()))
    }

    fn release(&mut self, held: LockValue) {
        if held.is_write_locked() {
            assert!(self.is_write_locked(), "write unlock of {self:?}");
        } else if held.is_read_locked() {
            assert!(self.is_read_locked(), "read unlock of {self:?}");
        }
        assert!(self.0 >= held.0, "unlocking {held:?} from {self:?}");
        self.0 -= held.0;
    }
}

impl fmt::Debug for LockValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unlocked() {
            write!(f, "Unlocked")
        } else if self.is_write_locked() {
            write!(f, "WriteLocked")
        } else {
            write!(f, "ReadLocked({})", self.readers())
        }
    }
}

impl Segment for LockValue {
    fn absorb(&mut self, incoming: &Self) {
        assert!(
            self.is_compatible(*incoming),
            "lock conflict between {self:?} and {incoming:?}"
        );
        self.0 = self
            .0
            .checked_add(incoming.0)
            .unwrap_or_else(|| panic!("too many readers on {self:?}"));
    }

    fn is_neutral(&self) -> bool {
        self.is_unlocked()
    }
}

/// Which kind of range lock a caller holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
}

impl LockKind {
    fn value(self) -> LockValue {
        match self {
            LockKind::Read => LockValue::READ,
            LockKind::Write => LockValue::WRITE,
        }
    }
}

#[derive(Debug, Default)]
pub struct RangeLock {
    space: IntervalMap<LockValue>,
}

impl RangeLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if any byte in `[offset, offset + length)` is locked.
    pub fn is_locked(&self, offset: u64, length: u64) -> bool {
        self.space
            .overlapping(offset, offset.saturating_add(length))
            .any(|(_, _, v)| v.is_locked())
    }

    /// True if any byte in `[offset, offset + length)` is write-locked.
    pub fn is_write_locked(&self, offset: u64, length: u64) -> bool {
        self.space
            .overlapping(offset, offset.saturating_add(length))
            .any(|(_, _, v)| v.is_write_locked())
    }

    pub fn try_write_lock(&mut self, offset: u64, length: u64) -> bool {
        if self.is_locked(offset, length) {
            return false;
        }
        self.space.add(offset, offset.saturating_add(length), LockValue::WRITE);
        true
    }

    pub fn try_read_lock(&mut self, offset: u64, length: u64) -> bool {
        if self.is_write_locked(offset, length) {
            return false;
        }
        self.space.add(offset, offset.saturating_add(length), LockValue::READ);
        true
    }

    pub fn try_lock(&mut self, offset: u64, length: u64, kind: LockKind) -> bool {
        match kind {
            LockKind::Read => self.try_read_lock(offset, length),
            LockKind::Write => self.try_write_lock(offset, length),
        }
    }

    pub fn read_unlock(&mut self, offset: u64, length: u64) {
        self.unlock(offset, length, LockKind::Read);
    }

    pub fn write_unlock(&mut self, offset: u64, length: u64) {
        self.unlock(offset, length, LockKind::Write);
    }

    /// Release a previously granted lock. Unlocking a range that does not
    /// hold `kind` over every byte is a bug and panics.
    pub fn unlock(&mut self, offset: u64, length: u64, kind: LockKind) {
        let end = offset.saturating_add(length);
        let mut covered = offset;
        for (lo, hi, _) in self.space.overlapping(offset, end) {
            assert!(
                lo <= covered,
                "{kind:?} unlock of [{offset}, {end}) finds [{covered}, {lo}) unlocked"
            );
            covered = hi;
        }
        assert!(
            covered >= end,
            "{kind:?} unlock of [{offset}, {end}) finds [{covered}, {end}) unlocked"
        );
        let held = kind.value();
        self.space.update(offset, end, |v| v.release(held));
    }

    /// Number of distinct lock ranges currently tracked.
    pub fn ranges(&self) -> usize {
        self.space.len()
    }
}
