// SPDX-FileCopyrightText: 2025 citrus contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Half-open byte intervals over guest physical memory, plus the two
//! interval containers the cache needs: a coalescing interval set (surface
//! validity tracking) and an overwriting interval map (dirty-region
//! ownership). Both keep disjoint pieces in a BTreeMap keyed by interval
//! start and split pieces on insert/erase.

use citrus_common::PAddr;
use std::collections::BTreeMap;

/// A half-open byte range `[start, end)` in guest physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct SurfaceInterval {
    pub start: PAddr,
    pub end: PAddr,
}

impl SurfaceInterval {
    pub const fn new(start: PAddr, end: PAddr) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Intersection with another interval (possibly empty).
    pub fn intersect(&self, other: SurfaceInterval) -> SurfaceInterval {
        SurfaceInterval {
            start: self.start.max(other.start),
            end: self.end.min(other.end),
        }
    }

    pub fn overlaps(&self, other: SurfaceInterval) -> bool {
        !self.intersect(other).is_empty()
    }

    /// Whether `other` lies entirely within this interval.
    pub fn contains(&self, other: SurfaceInterval) -> bool {
        other.is_empty() || (other.start >= self.start && other.end <= self.end)
    }
}

/// A set of disjoint intervals; inserting joins overlapping and adjacent
/// pieces into one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalSet {
    pieces: BTreeMap<PAddr, PAddr>,
}

impl IntervalSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_interval(interval: SurfaceInterval) -> Self {
        let mut set = Self::new();
        set.insert(interval);
        set
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    pub fn insert(&mut self, interval: SurfaceInterval) {
        if interval.is_empty() {
            return;
        }
        let mut start = interval.start;
        let mut end = interval.end;

        // Join with any piece overlapping or touching [start, end).
        let to_merge: Vec<PAddr> = self
            .pieces
            .range(..=end)
            .filter(|&(_, &piece_end)| piece_end >= start)
            .map(|(&piece_start, _)| piece_start)
            .collect();
        for piece_start in to_merge {
            let piece_end = self.pieces.remove(&piece_start).unwrap();
            start = start.min(piece_start);
            end = end.max(piece_end);
        }
        self.pieces.insert(start, end);
    }

    pub fn erase(&mut self, interval: SurfaceInterval) {
        if interval.is_empty() {
            return;
        }
        let affected: Vec<(PAddr, PAddr)> = self
            .pieces
            .range(..interval.end)
            .filter(|&(_, &piece_end)| piece_end > interval.start)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (piece_start, piece_end) in affected {
            self.pieces.remove(&piece_start);
            if piece_start < interval.start {
                self.pieces.insert(piece_start, interval.start);
            }
            if piece_end > interval.end {
                self.pieces.insert(interval.end, piece_end);
            }
        }
    }

    /// Union with another set.
    pub fn insert_set(&mut self, other: &IntervalSet) {
        for interval in other.iter() {
            self.insert(interval);
        }
    }

    /// Subtract another set.
    pub fn erase_set(&mut self, other: &IntervalSet) {
        for interval in other.iter() {
            self.erase(interval);
        }
    }

    /// The subset of this set inside `interval`.
    pub fn intersection(&self, interval: SurfaceInterval) -> IntervalSet {
        let mut result = IntervalSet::new();
        for piece in self.iter_overlaps(interval) {
            result.insert(piece.intersect(interval));
        }
        result
    }

    /// True when no piece overlaps `interval`.
    pub fn is_disjoint(&self, interval: SurfaceInterval) -> bool {
        self.iter_overlaps(interval).next().is_none()
    }

    pub fn first(&self) -> Option<SurfaceInterval> {
        self.pieces
            .iter()
            .next()
            .map(|(&s, &e)| SurfaceInterval::new(s, e))
    }

    pub fn iter(&self) -> impl Iterator<Item = SurfaceInterval> + '_ {
        self.pieces.iter().map(|(&s, &e)| SurfaceInterval::new(s, e))
    }

    pub fn iter_overlaps(
        &self,
        interval: SurfaceInterval,
    ) -> impl Iterator<Item = SurfaceInterval> + '_ {
        self.pieces
            .range(..interval.end)
            .filter(move |&(_, &piece_end)| piece_end > interval.start)
            .map(|(&s, &e)| SurfaceInterval::new(s, e))
    }

    /// Total length of all pieces.
    pub fn total_len(&self) -> u32 {
        self.pieces.iter().map(|(&s, &e)| e - s).sum()
    }
}

/// A map from disjoint intervals to single values with overwrite-on-insert
/// semantics: setting a value over an occupied range splits the previous
/// pieces and replaces the overlap. Adjacent equal values are rejoined.
#[derive(Debug, Clone, Default)]
pub struct IntervalMap<V: Clone + PartialEq> {
    pieces: BTreeMap<PAddr, (PAddr, V)>,
}

impl<V: Clone + PartialEq> IntervalMap<V> {
    pub fn new() -> Self {
        Self {
            pieces: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    pub fn set(&mut self, interval: SurfaceInterval, value: V) {
        if interval.is_empty() {
            return;
        }
        self.erase(interval);
        self.pieces.insert(interval.start, (interval.end, value));
        self.coalesce_around(interval);
    }

    pub fn erase(&mut self, interval: SurfaceInterval) {
        if interval.is_empty() {
            return;
        }
        let affected: Vec<(PAddr, PAddr, V)> = self
            .pieces
            .range(..interval.end)
            .filter(|(_, (piece_end, _))| *piece_end > interval.start)
            .map(|(&s, (e, v))| (s, *e, v.clone()))
            .collect();
        for (piece_start, piece_end, value) in affected {
            self.pieces.remove(&piece_start);
            if piece_start < interval.start {
                self.pieces
                    .insert(piece_start, (interval.start, value.clone()));
            }
            if piece_end > interval.end {
                self.pieces.insert(interval.end, (piece_end, value));
            }
        }
    }

    /// Remove every piece of `set` from the map.
    pub fn erase_set(&mut self, set: &IntervalSet) {
        for interval in set.iter() {
            self.erase(interval);
        }
    }

    /// True when every byte of `interval` is mapped.
    pub fn contains_interval(&self, interval: SurfaceInterval) -> bool {
        let mut cursor = interval.start;
        for (piece, _) in self.iter_overlaps(interval) {
            if piece.start > cursor {
                return false;
            }
            cursor = cursor.max(piece.end);
            if cursor >= interval.end {
                return true;
            }
        }
        cursor >= interval.end
    }

    pub fn iter(&self) -> impl Iterator<Item = (SurfaceInterval, &V)> + '_ {
        self.pieces
            .iter()
            .map(|(&s, (e, v))| (SurfaceInterval::new(s, *e), v))
    }

    pub fn iter_overlaps(
        &self,
        interval: SurfaceInterval,
    ) -> impl Iterator<Item = (SurfaceInterval, &V)> + '_ {
        self.pieces
            .range(..interval.end)
            .filter(move |(_, (piece_end, _))| *piece_end > interval.start)
            .map(|(&s, (e, v))| (SurfaceInterval::new(s, *e), v))
    }

    /// Rejoin pieces adjacent to `interval` holding equal values, so the
    /// stored fragments reflect logical dirty ranges rather than insert
    /// history.
    fn coalesce_around(&mut self, interval: SurfaceInterval) {
        // Merge with the piece ending exactly at interval.start.
        let prev = self
            .pieces
            .range(..interval.start)
            .next_back()
            .map(|(&s, (e, v))| (s, *e, v.clone()));
        if let Some((prev_start, prev_end, prev_val)) = prev {
            if prev_end == interval.start {
                if let Some((cur_end, cur_val)) = self.pieces.get(&interval.start).cloned() {
                    if cur_val == prev_val {
                        self.pieces.remove(&interval.start);
                        self.pieces.insert(prev_start, (cur_end, cur_val));
                    }
                }
            }
        }
        // Merge with the piece starting exactly at the (possibly merged) end.
        let start_key = self
            .pieces
            .range(..=interval.start)
            .next_back()
            .map(|(&s, _)| s);
        if let Some(start_key) = start_key {
            if let Some((end, value)) = self.pieces.get(&start_key).cloned() {
                if let Some((next_end, next_val)) = self.pieces.get(&end).cloned() {
                    if next_val == value {
                        self.pieces.remove(&end);
                        self.pieces.insert(start_key, (next_end, value));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iv(start: PAddr, end: PAddr) -> SurfaceInterval {
        SurfaceInterval::new(start, end)
    }

    #[test]
    fn test_interval_basics() {
        let a = iv(0x100, 0x200);
        assert_eq!(a.len(), 0x100);
        assert!(!a.is_empty());
        assert!(a.overlaps(iv(0x1FF, 0x300)));
        assert!(!a.overlaps(iv(0x200, 0x300)));
        assert_eq!(a.intersect(iv(0x180, 0x280)), iv(0x180, 0x200));
        assert!(a.contains(iv(0x100, 0x200)));
        assert!(!a.contains(iv(0x100, 0x201)));
    }

    #[test]
    fn test_set_insert_coalesces() {
        let mut set = IntervalSet::new();
        set.insert(iv(0x100, 0x200));
        set.insert(iv(0x200, 0x300));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![iv(0x100, 0x300)]);

        set.insert(iv(0x80, 0x120));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![iv(0x80, 0x300)]);
    }

    #[test]
    fn test_set_erase_splits() {
        let mut set = IntervalSet::from_interval(iv(0x100, 0x400));
        set.erase(iv(0x200, 0x300));
        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            vec![iv(0x100, 0x200), iv(0x300, 0x400)]
        );
    }

    #[test]
    fn test_set_intersection() {
        let mut set = IntervalSet::new();
        set.insert(iv(0x100, 0x200));
        set.insert(iv(0x300, 0x400));
        let within = set.intersection(iv(0x180, 0x380));
        assert_eq!(
            within.iter().collect::<Vec<_>>(),
            vec![iv(0x180, 0x200), iv(0x300, 0x380)]
        );
    }

    #[test]
    fn test_set_disjoint_check() {
        let set = IntervalSet::from_interval(iv(0x100, 0x200));
        assert!(set.is_disjoint(iv(0x200, 0x300)));
        assert!(!set.is_disjoint(iv(0x1FF, 0x300)));
    }

    #[test]
    fn test_map_overwrite() {
        let mut map = IntervalMap::new();
        map.set(iv(0x100, 0x300), 'a');
        map.set(iv(0x200, 0x400), 'b');
        let pieces: Vec<_> = map.iter().map(|(i, &v)| (i, v)).collect();
        assert_eq!(
            pieces,
            vec![(iv(0x100, 0x200), 'a'), (iv(0x200, 0x400), 'b')]
        );
    }

    #[test]
    fn test_map_erase_middle() {
        let mut map = IntervalMap::new();
        map.set(iv(0x100, 0x400), 'a');
        map.erase(iv(0x200, 0x300));
        let pieces: Vec<_> = map.iter().map(|(i, &v)| (i, v)).collect();
        assert_eq!(
            pieces,
            vec![(iv(0x100, 0x200), 'a'), (iv(0x300, 0x400), 'a')]
        );
    }

    #[test]
    fn test_map_adjacent_equal_values_join() {
        let mut map = IntervalMap::new();
        map.set(iv(0x100, 0x200), 'a');
        map.set(iv(0x200, 0x300), 'a');
        let pieces: Vec<_> = map.iter().map(|(i, &v)| (i, v)).collect();
        assert_eq!(pieces, vec![(iv(0x100, 0x300), 'a')]);
    }

    #[test]
    fn test_map_contains_interval() {
        let mut map = IntervalMap::new();
        map.set(iv(0x100, 0x200), 'a');
        map.set(iv(0x200, 0x300), 'b');
        assert!(map.contains_interval(iv(0x150, 0x250)));
        assert!(!map.contains_interval(iv(0x150, 0x350)));

        map.erase(iv(0x1F0, 0x210));
        assert!(!map.contains_interval(iv(0x150, 0x250)));
    }
}
