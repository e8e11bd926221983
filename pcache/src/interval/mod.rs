//! Merge-aware interval map over half-open `[lower, upper)` ranges.
//!
//! Entries are keyed by their lower bound and never overlap. Every mutating
//! call splits the touched entries at the boundaries of the request, applies
//! the change, then drops neutral entries and coalesces touching neighbours
//! that hold equal values. The map therefore never stores two adjacent
//! entries with the same value.

use std::collections::BTreeMap;

/// Value stored per range.
pub trait Segment: Clone + PartialEq {
    /// Combine `incoming` into `self` over an overlapping sub-range.
    fn absorb(&mut self, incoming: &Self);

    /// Ranges holding a neutral value are removed from the map.
    fn is_neutral(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq)]
struct Span<V> {
    upper: u64,
    value: V,
}

#[derive(Debug, Clone)]
pub struct IntervalMap<V> {
    spans: BTreeMap<u64, Span<V>>,
}

impl<V: Segment> Default for IntervalMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Segment> IntervalMap<V> {
    pub fn new() -> Self {
        Self {
            spans: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Number of stored (already coalesced) ranges.
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn clear(&mut self) {
        self.spans.clear();
    }

    /// All entries in ascending order as `(lower, upper, value)`.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64, &V)> + '_ {
        self.spans.iter().map(|(&l, s)| (l, s.upper, &s.value))
    }

    /// Entries intersecting `[lo, hi)`, unclipped, in ascending order.
    pub fn overlapping(&self, lo: u64, hi: u64) -> impl Iterator<Item = (u64, u64, &V)> + '_ {
        let valid = lo < hi;
        let head = if valid {
            self.spans.range(..lo).next_back().filter(|(_, s)| s.upper > lo)
        } else {
            None
        };
        let tail = valid.then(|| self.spans.range(lo..hi));
        head.into_iter()
            .chain(tail.into_iter().flatten())
            .map(|(&l, s)| (l, s.upper, &s.value))
    }

    /// Value at a single position.
    pub fn get(&self, pos: u64) -> Option<&V> {
        self.spans
            .range(..=pos)
            .next_back()
            .filter(|(_, s)| s.upper > pos)
            .map(|(_, s)| &s.value)
    }

    /// Sum of the lengths of all stored ranges.
    pub fn total_len(&self) -> u64 {
        self.spans.iter().map(|(&l, s)| s.upper - l).sum()
    }

    /// Upper bound of the last stored range.
    pub fn last_upper(&self) -> Option<u64> {
        self.spans.iter().next_back().map(|(_, s)| s.upper)
    }

    /// Merge `value` into `[lo, hi)`. Covered parts absorb it, gaps adopt it.
    pub fn add(&mut self, lo: u64, hi: u64, value: V) {
        if lo >= hi {
            return;
        }
        self.split_at(lo);
        self.split_at(hi);

        let mut cursor = lo;
        let mut gaps = Vec::new();
        for (&l, span) in self.spans.range_mut(lo..hi) {
            if l > cursor {
                gaps.push((cursor, l));
            }
            span.value.absorb(&value);
            cursor = span.upper;
        }
        if cursor < hi {
            gaps.push((cursor, hi));
        }
        for (l, u) in gaps {
            self.spans.insert(
                l,
                Span {
                    upper: u,
                    value: value.clone(),
                },
            );
        }
        self.normalize(lo, hi);
    }

    /// Apply `f` to every stored part of `[lo, hi)`. Gaps are left alone.
    pub fn update<F>(&mut self, lo: u64, hi: u64, mut f: F)
    where
        F: FnMut(&mut V),
    {
        if lo >= hi {
            return;
        }
        self.split_at(lo);
        self.split_at(hi);
        for (_, span) in self.spans.range_mut(lo..hi) {
            f(&mut span.value);
        }
        self.normalize(lo, hi);
    }

    /// Remove `[lo, hi)` from the map, trimming entries that straddle it.
    pub fn erase(&mut self, lo: u64, hi: u64) {
        if lo >= hi {
            return;
        }
        self.split_at(lo);
        self.split_at(hi);
        let doomed: Vec<u64> = self.spans.range(lo..hi).map(|(&l, _)| l).collect();
        for l in doomed {
            self.spans.remove(&l);
        }
    }

    fn split_at(&mut self, pos: u64) {
        let hit = self
            .spans
            .range(..pos)
            .next_back()
            .filter(|(_, s)| s.upper > pos)
            .map(|(&l, s)| (l, s.clone()));
        if let Some((l, tail)) = hit {
            if let Some(head) = self.spans.get_mut(&l) {
                head.upper = pos;
            }
            self.spans.insert(pos, tail);
        }
    }

    fn normalize(&mut self, lo: u64, hi: u64) {
        let start = self
            .spans
            .range(..lo)
            .next_back()
            .map(|(&l, _)| l)
            .unwrap_or(lo);
        let keys: Vec<u64> = self.spans.range(start..=hi).map(|(&l, _)| l).collect();

        let mut prev: Option<u64> = None;
        for k in keys {
            let neutral = match self.spans.get(&k) {
                Some(span) => span.value.is_neutral(),
                None => continue,
            };
            if neutral {
                self.spans.remove(&k);
                prev = None;
                continue;
            }
            if let Some(p) = prev {
                let touching = match (self.spans.get(&p), self.spans.get(&k)) {
                    (Some(a), Some(b)) => a.upper == k && a.value == b.value,
                    _ => false,
                };
                if touching {
                    if let Some(tail) = self.spans.remove(&k) {
                        if let Some(head) = self.spans.get_mut(&p) {
                            head.upper = tail.upper;
                        }
                    }
                    continue;
                }
            }
            prev = Some(k);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Count(u32);

    impl Segment for Count {
        fn absorb(&mut self, incoming: &Self) {
            self.0 += incoming.0;
        }

        fn is_neutral(&self) -> bool {
            self.0 == 0
        }
    }

    fn dump(map: &IntervalMap<Count>) -> Vec<(u64, u64, u32)> {
        map.iter().map(|(l, u, v)| (l, u, v.0)).collect()
    }

    #[test]
    fn test_add_coalesces_equal_neighbours() {
        let mut map = IntervalMap::new();
        map.add(0, 4, Count(1));
        map.add(4, 8, Count(1));
        assert_eq!(dump(&map), vec![(0, 8, 1)]);
        assert_eq!(map.total_len(), 8);
    }

    #[test]
    fn test_add_splits_on_overlap() {
        let mut map = IntervalMap::new();
        map.add(0, 10, Count(1));
        map.add(4, 6, Count(1));
        assert_eq!(dump(&map), vec![(0, 4, 1), (4, 6, 2), (6, 10, 1)]);
    }

    #[test]
    fn test_add_fills_gaps() {
        let mut map = IntervalMap::new();
        map.add(2, 4, Count(1));
        map.add(0, 6, Count(1));
        assert_eq!(dump(&map), vec![(0, 2, 1), (2, 4, 2), (4, 6, 1)]);
    }

    #[test]
    fn test_update_drops_neutral_and_remerges() {
        let mut map = IntervalMap::new();
        map.add(0, 10, Count(1));
        map.add(4, 6, Count(1));
        map.update(4, 6, |v| v.0 -= 1);
        assert_eq!(dump(&map), vec![(0, 10, 1)]);
        map.update(0, 10, |v| v.0 -= 1);
        assert!(map.is_empty());
    }

    #[test]
    fn test_erase_trims_straddling_entries() {
        let mut map = IntervalMap::new();
        map.add(0, 10, Count(3));
        map.erase(2, 5);
        assert_eq!(dump(&map), vec![(0, 2, 3), (5, 10, 3)]);
        assert_eq!(map.last_upper(), Some(10));
    }

    #[test]
    fn test_overlapping_and_get() {
        let mut map = IntervalMap::new();
        map.add(0, 4, Count(1));
        map.add(8, 12, Count(2));
        let hits: Vec<_> = map.overlapping(3, 9).map(|(l, u, _)| (l, u)).collect();
        assert_eq!(hits, vec![(0, 4), (8, 12)]);
        assert_eq!(map.overlapping(4, 8).count(), 0);
        assert_eq!(map.overlapping(5, 5).count(), 0);
        assert_eq!(map.get(9), Some(&Count(2)));
        assert_eq!(map.get(4), None);
    }
}
