use std::ops::Range;

/// Byte ranges of a host buffer written since the last flush.
///
/// A device-resident copy of the buffer only needs these ranges re-uploaded.
#[derive(Clone, Debug, Default)]
pub struct DirtyRanges {
    ranges: Vec<Range<u64>>,
}

impl DirtyRanges {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn mark(&mut self, range: Range<u64>) {
        if !range.is_empty() {
            self.ranges.push(range);
        }
    }
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
    /// Number of marks recorded, before merging.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Empties the set, yielding sorted ranges with overlapping and touching
    /// ranges merged.
    pub fn drain(&mut self) -> MergeRanges<std::vec::IntoIter<Range<u64>>> {
        let mut ranges = std::mem::take(&mut self.ranges);
        ranges.sort_by_key(|range| range.start);
        MergeRanges {
            inner: ranges.into_iter(),
            pending: None,
        }
    }
}

/// Merges a start-ordered sequence of ranges into disjoint, non-touching
/// ranges.
pub struct MergeRanges<ITER: Iterator<Item = Range<u64>>> {
    inner: ITER,
    pending: Option<Range<u64>>,
}

impl<ITER: Iterator<Item = Range<u64>>> Iterator for MergeRanges<ITER> {
    type Item = Range<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut current = self.pending.take().or_else(|| self.inner.next())?;
        loop {
            let Some(next) = self.inner.next() else {
                return Some(current);
            };
            if next.start <= current.end {
                current.end = current.end.max(next.end);
            } else {
                self.pending = Some(next);
                return Some(current);
            }
        }
    }
}
