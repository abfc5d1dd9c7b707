use std::ops::Range;

/// Rounds `value` up to the next multiple of `alignment`, or `None` if that
/// multiple does not fit in a `u64`.
///
/// An alignment of 0 or 1 means "unaligned". Alignments do not need to be a
/// power of two, so vertex strides such as 12 or 36 bytes are accepted.
#[inline]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    align_to(value, alignment, 0)
}

/// Smallest `n >= value` with `n % modulus == residue % modulus`.
#[inline]
pub fn align_to(value: u64, modulus: u64, residue: u64) -> Option<u64> {
    if modulus <= 1 {
        return Some(value);
    }
    let target = residue % modulus;
    let current = value % modulus;
    let step = if target >= current {
        target - current
    } else {
        modulus - current + target
    };
    value.checked_add(step)
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Least common multiple of two alignments, treating 0 as 1.
pub(crate) fn lcm(a: u64, b: u64) -> Option<u64> {
    let (a, b) = (a.max(1), b.max(1));
    (a / gcd(a, b)).checked_mul(b)
}

/// Inverse of `a` modulo `m`, for `a` and `m` coprime.
fn mod_inverse(a: u64, m: u64) -> u64 {
    let (mut old_r, mut r) = (a as i128, m as i128);
    let (mut old_s, mut s) = (1i128, 0i128);
    while r != 0 {
        let q = old_r / r;
        (old_r, r) = (r, old_r - q * r);
        (old_s, s) = (s, old_s - q * s);
    }
    old_s.rem_euclid(m as i128) as u64
}

/// Offsets that are congruent to `residue` modulo `modulus` and also a
/// multiple of `alignment`, as a `(modulus, residue)` pair. `None` when no
/// offset satisfies both or the combined modulus overflows.
pub(crate) fn congruence(modulus: u64, residue: u64, alignment: u64) -> Option<(u64, u64)> {
    let (modulus, alignment) = (modulus.max(1), alignment.max(1));
    let residue = residue % modulus;
    let g = gcd(modulus, alignment);
    if residue % g != 0 {
        return None;
    }
    let combined = lcm(modulus, alignment)?;
    let m = modulus / g;
    if m == 1 {
        return Some((combined, 0));
    }
    let t = (residue / g) as u128 * mod_inverse((alignment / g) % m, m) as u128 % m as u128;
    let solution = (alignment as u128 * t % combined as u128) as u64;
    Some((combined, solution))
}

/// A contiguous run of unreserved bytes inside an arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FreeRange {
    /// Absolute byte position.
    pub offset: u64,
    /// Size in bytes.
    pub range: u64,
}

impl FreeRange {
    pub fn new(offset: u64, range: u64) -> Self {
        Self { offset, range }
    }
    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + self.range
    }
    pub fn byte_range(&self) -> Range<u64> {
        self.offset..self.end()
    }
    /// Whether this range ends exactly where `other` begins.
    pub fn is_adjacent_to(&self, other: &FreeRange) -> bool {
        self.end() == other.offset
    }
}

/// Result of a first-fit search.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Fit {
    pub index: usize,
    /// Aligned start of the reservation.
    pub offset: u64,
    /// Bytes skipped at the start of the entry to reach `offset`.
    pub padding: u64,
}

/// Disjoint, maximal free ranges kept sorted by offset.
///
/// The first-fit scan walks entries in address order, so a reservation always
/// lands in the lowest hole able to hold it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FreeList {
    entries: Vec<FreeRange>,
}

impl FreeList {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn spanning(offset: u64, range: u64) -> Self {
        let mut list = Self::new();
        if range > 0 {
            list.entries.push(FreeRange::new(offset, range));
        }
        list
    }
    pub fn entries(&self) -> &[FreeRange] {
        &self.entries
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    /// Total number of free bytes.
    pub fn total(&self) -> u64 {
        self.entries.iter().map(|e| e.range).sum()
    }
    pub fn largest(&self) -> u64 {
        self.entries.iter().map(|e| e.range).max().unwrap_or(0)
    }

    /// First entry able to hold `size` bytes starting at an offset congruent
    /// to `residue` modulo `modulus` (`residue` 0 is plain alignment). `size`
    /// is expected to be already rounded.
    pub(crate) fn first_fit(&self, size: u64, modulus: u64, residue: u64) -> Option<Fit> {
        self.entries.iter().enumerate().find_map(|(index, entry)| {
            let offset = align_to(entry.offset, modulus, residue)?;
            let padding = offset - entry.offset;
            let needed = padding.checked_add(size)?;
            (needed <= entry.range).then_some(Fit {
                index,
                offset,
                padding,
            })
        })
    }

    /// Consumes `size` bytes at the location found by [`FreeList::first_fit`].
    ///
    /// The remainder of the entry is shrunk in place; alignment padding at its
    /// start is kept as a separate entry.
    pub(crate) fn take(&mut self, fit: Fit, size: u64) {
        let entry = self.entries[fit.index];
        let consumed = fit.padding + size;
        debug_assert!(consumed <= entry.range);
        if consumed == entry.range {
            self.entries.remove(fit.index);
        } else {
            let slot = &mut self.entries[fit.index];
            slot.offset = fit.offset + size;
            slot.range = entry.range - consumed;
        }
        if fit.padding > 0 {
            self.entries
                .insert(fit.index, FreeRange::new(entry.offset, fit.padding));
        }
    }

    /// Returns `[offset, offset + range)` to the list, merging with the entry
    /// ending at `offset` and the one starting at its end.
    pub fn release(&mut self, offset: u64, range: u64) {
        if range == 0 {
            return;
        }
        let released = FreeRange::new(offset, range);
        let index = self.entries.partition_point(|e| e.offset < offset);
        let prev = index
            .checked_sub(1)
            .filter(|&i| self.entries[i].is_adjacent_to(&released));
        let next = Some(index).filter(|&i| {
            self.entries
                .get(i)
                .map_or(false, |entry| released.is_adjacent_to(entry))
        });
        match (prev, next) {
            (Some(prev), Some(next)) => {
                let merged = self.entries[next].range;
                self.entries[prev].range += range + merged;
                self.entries.remove(next);
            }
            (Some(prev), None) => {
                self.entries[prev].range += range;
            }
            (None, Some(next)) => {
                let entry = &mut self.entries[next];
                entry.offset = offset;
                entry.range += range;
            }
            (None, None) => self.entries.insert(index, released),
        }
    }

    /// Removes `[offset, offset + range)` from the list if the whole span is
    /// free. Returns false and leaves the list untouched otherwise.
    pub(crate) fn carve(&mut self, offset: u64, range: u64) -> bool {
        if range == 0 {
            return true;
        }
        let end = offset + range;
        let index = self.entries.partition_point(|e| e.offset <= offset);
        let Some(index) = index
            .checked_sub(1)
            .filter(|&i| end <= self.entries[i].end())
        else {
            return false;
        };
        let entry = self.entries[index];
        let head = offset - entry.offset;
        let tail = entry.end() - end;
        match (head > 0, tail > 0) {
            (false, false) => {
                self.entries.remove(index);
            }
            (false, true) => self.entries[index] = FreeRange::new(end, tail),
            (true, false) => self.entries[index] = FreeRange::new(entry.offset, head),
            (true, true) => {
                self.entries[index] = FreeRange::new(entry.offset, head);
                self.entries.insert(index + 1, FreeRange::new(end, tail));
            }
        }
        true
    }

    /// Free bytes available starting exactly at `offset`.
    pub(crate) fn available_at(&self, offset: u64) -> u64 {
        self.entries
            .binary_search_by_key(&offset, |e| e.offset)
            .map_or(0, |i| self.entries[i].range)
    }

    /// Moves every entry from a list based at `old_base` to `new_base`.
    pub(crate) fn rebase(&mut self, old_base: u64, new_base: u64) {
        for entry in self.entries.iter_mut() {
            entry.offset = entry.offset - old_base + new_base;
        }
    }

    /// Replaces the whole list. `entries` must be sorted, disjoint and
    /// non-adjacent.
    pub(crate) fn replace(&mut self, entries: Vec<FreeRange>) {
        debug_assert!(entries
            .windows(2)
            .all(|w| w[0].end() <= w[1].offset && !w[0].is_adjacent_to(&w[1])));
        self.entries = entries;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), Some(0));
        assert_eq!(align_up(1, 256), Some(256));
        assert_eq!(align_up(256, 256), Some(256));
        assert_eq!(align_up(257, 256), Some(512));
        assert_eq!(align_up(13, 12), Some(24));
        assert_eq!(align_up(13, 0), Some(13));
        assert_eq!(align_up(13, 1), Some(13));
    }

    #[test]
    fn test_align_up_overflow() {
        assert_eq!(align_up(u64::MAX - 5, 16), None);
        assert_eq!(align_up(u64::MAX, 2), None);
        assert_eq!(align_up(u64::MAX, 1), Some(u64::MAX));
        assert_eq!(align_up(u64::MAX - 15, 16), Some(u64::MAX - 15));
    }

    #[test]
    fn test_align_to_residue() {
        assert_eq!(align_to(0, 16, 10), Some(10));
        assert_eq!(align_to(11, 16, 10), Some(26));
        assert_eq!(align_to(26, 16, 10), Some(26));
        assert_eq!(align_to(5, 16, 42), Some(10));
        assert_eq!(align_to(7, 0, 3), Some(7));
        assert_eq!(align_to(u64::MAX - 1, 16, 0), None);
        assert_eq!(lcm(12, 16), Some(48));
        assert_eq!(lcm(0, 256), Some(256));
        assert_eq!(lcm(0, 0), Some(1));
        assert_eq!(lcm(u64::MAX, u64::MAX - 1), None);
    }

    #[test]
    fn test_congruence() {
        assert_eq!(congruence(12, 0, 16), Some((48, 0)));
        assert_eq!(congruence(6, 4, 4), Some((12, 4)));
        assert_eq!(congruence(16, 10, 4), None);
        assert_eq!(congruence(16, 6, 0), Some((16, 6)));
        assert_eq!(congruence(1, 0, 256), Some((256, 0)));
        assert_eq!(congruence(256, 0, 16), Some((256, 0)));
        for (modulus, residue, alignment) in [(10, 4, 4), (9, 3, 12), (35, 14, 7)] {
            let (m, r) = congruence(modulus, residue, alignment).unwrap();
            assert_eq!(r % modulus, residue);
            assert_eq!(r % alignment, 0);
            assert_eq!(m % modulus, 0);
            assert_eq!(m % alignment, 0);
        }
    }

    #[test]
    fn test_free_range_adjacent() {
        let a = FreeRange::new(0, 100);
        let b = FreeRange::new(100, 200);
        let c = FreeRange::new(300, 100);
        assert!(a.is_adjacent_to(&b));
        assert!(b.is_adjacent_to(&c));
        assert!(!a.is_adjacent_to(&c));
    }

    #[test]
    fn test_first_fit_skips_small_entries() {
        let mut list = FreeList::new();
        list.release(200, 20);
        list.release(0, 10);
        list.release(50, 100);
        assert_eq!(list.entries()[0], FreeRange::new(0, 10));
        let fit = list.first_fit(15, 0, 0).unwrap();
        assert_eq!(fit.index, 1);
        assert_eq!(fit.offset, 50);
        // First fit, not best fit: the 20-byte entry would be tighter.
        let fit = list.first_fit(20, 0, 0).unwrap();
        assert_eq!(fit.offset, 50);
    }

    #[test]
    fn test_take_with_padding_keeps_prefix() {
        let mut list = FreeList::spanning(10, 100);
        let fit = list.first_fit(32, 16, 0).unwrap();
        assert_eq!(fit.offset, 16);
        assert_eq!(fit.padding, 6);
        list.take(fit, 32);
        assert_eq!(
            list.entries(),
            &[FreeRange::new(10, 6), FreeRange::new(48, 62)]
        );
        assert_eq!(list.total(), 68);
    }

    #[test]
    fn test_first_fit_with_residue() {
        let list = FreeList::spanning(0, 100);
        let fit = list.first_fit(20, 16, 6).unwrap();
        assert_eq!(fit.offset, 6);
        assert_eq!(fit.padding, 6);
        assert!(list.first_fit(95, 16, 6).is_none());
    }

    #[test]
    fn test_take_exact_removes_entry() {
        let mut list = FreeList::spanning(0, 64);
        let fit = list.first_fit(64, 0, 0).unwrap();
        list.take(fit, 64);
        assert!(list.is_empty());
        assert!(list.first_fit(1, 0, 0).is_none());
    }

    #[test]
    fn test_release_coalesces_both_sides() {
        let mut list = FreeList::new();
        list.release(0, 100);
        list.release(200, 100);
        assert_eq!(list.len(), 2);
        list.release(100, 100);
        assert_eq!(list.entries(), &[FreeRange::new(0, 300)]);
    }

    #[test]
    fn test_release_coalesces_next_only() {
        let mut list = FreeList::spanning(100, 50);
        list.release(60, 40);
        assert_eq!(list.entries(), &[FreeRange::new(60, 90)]);
    }

    #[test]
    fn test_carve() {
        let mut list = FreeList::spanning(0, 100);
        assert!(list.carve(20, 30));
        assert_eq!(
            list.entries(),
            &[FreeRange::new(0, 20), FreeRange::new(50, 50)]
        );
        assert!(!list.carve(10, 20));
        assert!(list.carve(50, 50));
        assert_eq!(list.entries(), &[FreeRange::new(0, 20)]);
        assert!(list.carve(0, 20));
        assert!(list.is_empty());
    }

    #[test]
    fn test_available_at_and_rebase() {
        let mut list = FreeList::spanning(100, 50);
        assert_eq!(list.available_at(100), 50);
        assert_eq!(list.available_at(120), 0);
        list.rebase(100, 300);
        assert_eq!(list.entries(), &[FreeRange::new(300, 50)]);
    }
}
