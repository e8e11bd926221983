//! Ordered set of disjoint byte ranges.
//!
//! Used to track holes and reservation windows independently of cache state.
//! The set is not synchronized; wrap it in a mutex when sharing it.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    pub offset: u64,
    pub length: u64,
}

impl BlockRange {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonOverlapSet {
    segs: VecDeque<BlockRange>,
}

impl NonOverlapSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.segs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlockRange> {
        self.segs.iter()
    }

    // index of the first range whose offset is not below `offset`
    fn lower_bound(&self, offset: u64) -> usize {
        self.segs.partition_point(|r| r.offset < offset)
    }

    /// Insert `[offset, offset + length)` truncated so it does not run into
    /// the following range. Returns the inserted length, or 0 when the start
    /// is already covered.
    pub fn try_insert(&mut self, offset: u64, length: u64) -> u64 {
        if length == 0 {
            return 0;
        }
        let pos = self.lower_bound(offset);
        if pos > 0 && self.segs[pos - 1].end() > offset {
            return 0;
        }
        let mut length = length;
        if let Some(next) = self.segs.get(pos) {
            if next.offset == offset {
                return 0;
            }
            if offset + length > next.offset {
                length = next.offset - offset;
            }
        }
        self.segs.insert(pos, BlockRange::new(offset, length));
        debug_assert!(self.valid_at(pos));
        length
    }

    /// Remove the range previously returned by a successful `try_insert`.
    /// Panics if no such range is stored.
    pub fn remove_match(&mut self, offset: u64, length: u64) {
        let pos = self.lower_bound(offset);
        match self.segs.get(pos) {
            Some(r) if r.offset == offset && r.length == length => {
                self.segs.remove(pos);
            }
            other => panic!("no range [{offset}, +{length}) to remove, found {other:?}"),
        }
    }

    /// Append without checks; callers keep the ranges ordered and disjoint.
    pub fn push_back(&mut self, offset: u64, length: u64) {
        self.segs.push_back(BlockRange::new(offset, length));
        debug_assert!(self.valid_at(self.segs.len() - 1));
    }

    /// Cut `[offset, offset + length)` out of the set. Ranges inside the
    /// window are dropped, ranges straddling one edge are trimmed and a
    /// range containing the whole window is split in two. Returns how many
    /// stored ranges were touched.
    pub fn remove_overlap(&mut self, offset: u64, length: u64) -> usize {
        let mut affected = 0;
        if length == 0 || self.segs.is_empty() {
            return affected;
        }
        let right = offset + length;
        // the previous range may start before the window and still reach into it
        let mut pos = self.lower_bound(offset).saturating_sub(1);

        while pos < self.segs.len() && self.segs[pos].offset < right {
            let seg = self.segs[pos];
            let seg_right = seg.end();

            if seg.offset >= offset && seg_right <= right {
                self.segs.remove(pos);
                affected += 1;
                continue;
            }
            if seg.offset < offset && seg_right > offset && seg_right <= right {
                self.segs[pos].length = offset - seg.offset;
                pos += 1;
                affected += 1;
                continue;
            }
            if seg.offset < offset && seg_right > right {
                self.segs[pos].length = offset - seg.offset;
                self.segs
                    .insert(pos + 1, BlockRange::new(right, seg_right - right));
                affected += 1;
                break;
            }
            if seg_right > right {
                self.segs[pos] = BlockRange::new(right, seg_right - right);
                affected += 1;
                break;
            }
            pos += 1;
        }
        affected
    }

    /// The range containing `offset`, else the first range after it.
    pub fn find_next(&self, offset: u64) -> Option<BlockRange> {
        let pos = self.lower_bound(offset);
        if pos > 0 {
            let prev = self.segs[pos - 1];
            if offset < prev.end() {
                return Some(prev);
            }
        }
        self.segs.get(pos).copied()
    }

    fn valid_at(&self, pos: usize) -> bool {
        let cur = self.segs[pos];
        if pos > 0 && self.segs[pos - 1].end() > cur.offset {
            return false;
        }
        match self.segs.get(pos + 1) {
            Some(next) => cur.end() <= next.offset,
            None => true,
        }
    }
}

impl FromIterator<BlockRange> for NonOverlapSet {
    fn from_iter<I: IntoIterator<Item = BlockRange>>(iter: I) -> Self {
        let mut set = NonOverlapSet::new();
        for r in iter {
            set.push_back(r.offset, r.length);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn next(set: &NonOverlapSet, offset: u64) -> (u64, u64) {
        set.find_next(offset)
            .map(|r| (r.offset, r.length))
            .unwrap_or((0, 0))
    }

    #[test]
    fn test_try_insert_truncates_and_blocks() {
        let mut bm = NonOverlapSet::new();
        assert_eq!(bm.try_insert(0, 2), 2);
        assert_eq!(bm.try_insert(1, 9), 0);
        assert_eq!(bm.try_insert(4, 3), 3);
        assert_eq!(bm.try_insert(5, 3), 0);
        assert_eq!(bm.try_insert(3, 9), 1);
        assert_eq!(bm.try_insert(3, 9), 0);
        bm.remove_match(0, 2);
        assert_eq!(bm.try_insert(0, 9), 3);
        assert_eq!(bm.try_insert(10, 9), 9);
        assert_eq!(bm.try_insert(12, 9), 0);
        bm.remove_match(10, 9);
        assert_eq!(bm.try_insert(12, 9), 9);
        assert_eq!(bm.try_insert(10, 9), 2);
        assert_eq!(bm.try_insert(8, 1), 1);
        assert_eq!(bm.try_insert(9, 0), 0);
    }

    #[test]
    fn test_try_insert_adjacent_blocks() {
        let mut bm = NonOverlapSet::new();
        assert_eq!(bm.try_insert(4096, 8192), 8192);
        bm.remove_match(4096, 8192);
        assert!(bm.is_empty());
        assert_eq!(bm.try_insert(0, 8192), 8192);
        assert_eq!(bm.try_insert(8192, 8192), 8192);
        assert_eq!(bm.len(), 2);
    }

    #[test]
    #[should_panic]
    fn test_remove_match_requires_exact_range() {
        let mut bm = NonOverlapSet::new();
        bm.try_insert(0, 8);
        bm.remove_match(0, 4);
    }

    #[test]
    fn test_find_next() {
        let mut holes = NonOverlapSet::new();
        holes.push_back(0, 2);
        holes.push_back(3, 2);
        holes.push_back(8, 3);

        assert_eq!(next(&holes, 0), (0, 2));
        assert_eq!(next(&holes, 1), (0, 2));
        assert_eq!(next(&holes, 2), (3, 2));
        assert_eq!(next(&holes, 7), (8, 3));
        assert_eq!(next(&holes, 11), (0, 0));

        assert_eq!(holes.remove_overlap(1, 9), 3);
        assert_eq!(next(&holes, 8), (10, 1));
        assert_eq!(next(&holes, 0), (0, 1));
    }

    #[test]
    fn test_remove_overlap_front() {
        let mut holes = NonOverlapSet::new();
        assert_eq!(holes.remove_overlap(0, 100), 0);
        holes.push_back(0, 100);
        assert_eq!(holes.remove_overlap(0, 50), 1);
        assert_eq!(next(&holes, 0), (50, 50));
    }

    #[test]
    fn test_remove_overlap_splits_containing_range() {
        let mut holes = NonOverlapSet::new();
        holes.push_back(0, 100);
        assert_eq!(holes.remove_overlap(25, 50), 1);
        let ranges: Vec<_> = holes.iter().copied().collect();
        assert_eq!(ranges, vec![BlockRange::new(0, 25), BlockRange::new(75, 25)]);
        assert_eq!(next(&holes, 50), (75, 25));
    }

    #[test]
    fn test_remove_overlap_outside() {
        let mut holes = NonOverlapSet::new();
        holes.push_back(0, 50);
        assert_eq!(holes.remove_overlap(100, 50), 0);
        assert_eq!(next(&holes, 0), (0, 50));
    }
}
