//! # Aggregates and Searches
//!
//! Width-specialized scans over an array's packed payload: `sum`, `minimum`,
//! `maximum`, `count`, `find_first`, `find_all`, the binary-search pair
//! `lower_bound`/`upper_bound`, and `find_gte`.
//!
//! ## Word-At-A-Time Scans
//!
//! For widths up to 16 bits, `count` and `find_first` process a 64-bit word
//! of elements per step: the target is broadcast across the word, XOR zeroes
//! matching segments, a carry cascade collapses every nonzero segment to a
//! single bit, and a population count (or a short in-word scan on a hit)
//! finishes the word. `sum` uses the sideways-addition variant of the same
//! trick for widths 1, 2 and 4. Widths 32 and 64 fall back to element-wise
//! loops.
//!
//! ## find_gte
//!
//! `find_gte` expects a sorted range and returns the leftmost index whose
//! value is `>= target`. It brackets the target with a doubling probe, then
//! bisects inside the bracket, so runs near the start of the range cost a
//! handful of probes rather than a full binary search.

use super::direct::{
    broadcast, dispatch_width, get_direct, has_zero_element, lbound_for_width, lower_bits,
    ubound_for_width,
};
use super::node::Array;
use crate::alloc::SlabAlloc;

const M2: u64 = 0x3333_3333_3333_3333;
const M4: u64 = 0x0F0F_0F0F_0F0F_0F0F;
const H01: u64 = 0x0101_0101_0101_0101;

impl Array {
    /// Sums elements `[start, end)`; `end` is clamped to the size.
    pub fn sum(&self, alloc: &SlabAlloc, start: usize, end: usize) -> i64 {
        let end = end.min(self.len());
        if start >= end {
            return 0;
        }
        let data = self.payload(alloc);
        dispatch_width!(self.width() as usize, sum_w(data, start, end))
    }

    /// Smallest element in `[start, end)` with its index, or `None` for an
    /// empty range. Ties resolve to the leftmost index.
    pub fn minimum(&self, alloc: &SlabAlloc, start: usize, end: usize) -> Option<(usize, i64)> {
        let end = end.min(self.len());
        if start >= end {
            return None;
        }
        let data = self.payload(alloc);
        Some(dispatch_width!(
            self.width() as usize,
            minmax_w(data, start, end, false)
        ))
    }

    /// Largest element in `[start, end)` with its index, or `None` for an
    /// empty range. Ties resolve to the leftmost index.
    pub fn maximum(&self, alloc: &SlabAlloc, start: usize, end: usize) -> Option<(usize, i64)> {
        let end = end.min(self.len());
        if start >= end {
            return None;
        }
        let data = self.payload(alloc);
        Some(dispatch_width!(
            self.width() as usize,
            minmax_w(data, start, end, true)
        ))
    }

    /// Number of elements equal to `value`.
    pub fn count(&self, alloc: &SlabAlloc, value: i64) -> usize {
        let end = self.len();
        let data = self.payload(alloc);
        let mut total = 0;
        let mut i = 0;

        match self.width() {
            0 => {
                return if value == 0 { end } else { 0 };
            }
            1 => {
                if value as u64 > 1 {
                    return 0;
                }
                while i + 64 <= end {
                    let mut a = read_word(data, i, 1);
                    if value == 0 {
                        a = !a;
                    }
                    total += a.count_ones() as usize;
                    i += 64;
                }
            }
            2 => {
                if value as u64 > 3 {
                    return 0;
                }
                let v = broadcast::<2>(value);
                let m = lower_bits(2);
                while i + 32 <= end {
                    let mut a = read_word(data, i, 2);
                    a ^= v; // zero matching bit segments
                    a |= (a >> 1) & m; // cascade ones in non-zeroed segments
                    a &= m; // isolate single bit in each segment
                    a ^= m; // reverse isolated bits
                    total += a.count_ones() as usize;
                    i += 32;
                }
            }
            4 => {
                if value as u64 > 15 {
                    return 0;
                }
                let v = broadcast::<4>(value);
                let m = lower_bits(4);
                let c1 = lower_bits(4) * 0x7;
                let c2 = lower_bits(4) * 0x3;
                while i + 16 <= end {
                    let mut a = read_word(data, i, 4);
                    a ^= v;
                    a |= (a >> 1) & c1;
                    a |= (a >> 2) & c2;
                    a &= m;
                    a ^= m;
                    total += a.count_ones() as usize;
                    i += 16;
                }
            }
            8 => {
                if !(-0x80..=0x7F).contains(&value) {
                    return 0;
                }
                let v = broadcast::<8>(value);
                let m = lower_bits(8);
                let c1 = lower_bits(8) * 0x7F;
                let c2 = lower_bits(8) * 0x3F;
                let c3 = lower_bits(8) * 0x0F;
                while i + 8 <= end {
                    let mut a = read_word(data, i, 8);
                    a ^= v;
                    a |= (a >> 1) & c1;
                    a |= (a >> 2) & c2;
                    a |= (a >> 4) & c3;
                    a &= m;
                    a ^= m;
                    total += a.count_ones() as usize;
                    i += 8;
                }
            }
            16 => {
                if !(-0x8000..=0x7FFF).contains(&value) {
                    return 0;
                }
                let v = broadcast::<16>(value);
                let m = lower_bits(16);
                let c1 = lower_bits(16) * 0x7FFF;
                let c2 = lower_bits(16) * 0x3FFF;
                let c3 = lower_bits(16) * 0x0FFF;
                let c4 = lower_bits(16) * 0x00FF;
                while i + 4 <= end {
                    let mut a = read_word(data, i, 16);
                    a ^= v;
                    a |= (a >> 1) & c1;
                    a |= (a >> 2) & c2;
                    a |= (a >> 4) & c3;
                    a |= (a >> 8) & c4;
                    a &= m;
                    a ^= m;
                    total += a.count_ones() as usize;
                    i += 4;
                }
            }
            _ => {}
        }

        // Remaining elements (and the whole array at widths 32/64).
        total + dispatch_width!(self.width() as usize, count_tail(data, i, end, value))
    }

    /// Lowest index in `[start, end)` holding `value`.
    pub fn find_first(
        &self,
        alloc: &SlabAlloc,
        value: i64,
        start: usize,
        end: usize,
    ) -> Option<usize> {
        let end = end.min(self.len());
        if start >= end {
            return None;
        }
        let data = self.payload(alloc);
        dispatch_width!(self.width() as usize, find_first_w(data, value, start, end))
    }

    /// Appends `base_index + i` to `result` for every `i` in `[start, end)`
    /// holding `value`.
    pub fn find_all(
        &self,
        alloc: &SlabAlloc,
        result: &mut Vec<usize>,
        value: i64,
        base_index: usize,
        start: usize,
        end: usize,
    ) {
        let mut i = start;
        while let Some(ndx) = self.find_first(alloc, value, i, end) {
            result.push(base_index + ndx);
            i = ndx + 1;
        }
    }

    /// First index whose element is `>= value`, assuming ascending order.
    pub fn lower_bound(&self, alloc: &SlabAlloc, value: i64) -> usize {
        let data = self.payload(alloc);
        let size = self.len();
        dispatch_width!(self.width() as usize, bound_w(data, size, value, false))
    }

    /// First index whose element is `> value`, assuming ascending order.
    pub fn upper_bound(&self, alloc: &SlabAlloc, value: i64) -> usize {
        let data = self.payload(alloc);
        let size = self.len();
        dispatch_width!(self.width() as usize, bound_w(data, size, value, true))
    }

    /// Leftmost index in sorted `[start, end)` whose value is `>= target`.
    ///
    /// Brackets the target with a doubling probe from `start`, then bisects
    /// within the bracket.
    pub fn find_gte(
        &self,
        alloc: &SlabAlloc,
        target: i64,
        start: usize,
        end: usize,
    ) -> Option<usize> {
        let end = end.min(self.len());
        if start >= end {
            return None;
        }
        let data = self.payload(alloc);
        dispatch_width!(self.width() as usize, find_gte_w(data, target, start, end))
    }
}

/// Reads the 64-bit word holding element `i` (which must be word-aligned for
/// the width).
#[inline]
fn read_word(data: &[u8], i: usize, width: usize) -> u64 {
    let byte = i * width / 8;
    u64::from_le_bytes(data[byte..byte + 8].try_into().unwrap())
}

fn count_tail<const W: usize>(data: &[u8], start: usize, end: usize, value: i64) -> usize {
    let mut total = 0;
    for i in start..end {
        if get_direct::<W>(data, i) == value {
            total += 1;
        }
    }
    total
}

fn sum_w<const W: usize>(data: &[u8], mut start: usize, end: usize) -> i64 {
    if W == 0 {
        return 0;
    }

    let mut s: i64 = 0;

    // Scalar until word aligned.
    while start < end && (start * W) % 64 != 0 {
        s += get_direct::<W>(data, start);
        start += 1;
    }

    if W == 1 || W == 2 || W == 4 {
        let per_word = 64 / W.max(1);
        while start + per_word <= end {
            let a = read_word(data, start, W);
            s += match W {
                1 => a.count_ones() as i64,
                2 => {
                    // Sideways addition: 2-bit fields to 4-bit sums, to byte
                    // sums, to a single byte total.
                    let a = (a & M2) + ((a >> 2) & M2);
                    let a = (a + (a >> 4)) & M4;
                    (a.wrapping_mul(H01) >> 56) as i64
                }
                _ => {
                    let a = (a & M4) + ((a >> 4) & M4);
                    (a.wrapping_mul(H01) >> 56) as i64
                }
            };
            start += per_word;
        }
    }

    while start < end {
        s += get_direct::<W>(data, start);
        start += 1;
    }
    s
}

fn minmax_w<const W: usize>(
    data: &[u8],
    start: usize,
    end: usize,
    find_max: bool,
) -> (usize, i64) {
    if W == 0 {
        return (start, 0);
    }

    let mut best_ndx = start;
    let mut best = get_direct::<W>(data, start);
    for i in start + 1..end {
        let v = get_direct::<W>(data, i);
        if if find_max { v > best } else { v < best } {
            best = v;
            best_ndx = i;
        }
    }
    (best_ndx, best)
}

fn find_first_w<const W: usize>(
    data: &[u8],
    value: i64,
    mut start: usize,
    end: usize,
) -> Option<usize> {
    if W == 0 {
        return if value == 0 { Some(start) } else { None };
    }
    if value < lbound_for_width(W as u8) || value > ubound_for_width(W as u8) {
        return None;
    }

    // Scalar until word aligned.
    while start < end && (start * W) % 64 != 0 {
        if get_direct::<W>(data, start) == value {
            return Some(start);
        }
        start += 1;
    }

    if W >= 1 && W <= 16 {
        let per_word = 64 / W.max(1);
        let pattern = broadcast::<W>(value);
        while start + per_word <= end {
            let word = read_word(data, start, W);
            if has_zero_element::<W>(word ^ pattern) {
                for i in start..start + per_word {
                    if get_direct::<W>(data, i) == value {
                        return Some(i);
                    }
                }
            }
            start += per_word;
        }
    }

    while start < end {
        if get_direct::<W>(data, start) == value {
            return Some(start);
        }
        start += 1;
    }
    None
}

fn bound_w<const W: usize>(data: &[u8], size: usize, value: i64, upper: bool) -> usize {
    let mut lo = 0;
    let mut hi = size;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let v = get_direct::<W>(data, mid);
        let go_right = if upper { v <= value } else { v < value };
        if go_right {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

fn find_gte_w<const W: usize>(
    data: &[u8],
    target: i64,
    start: usize,
    end: usize,
) -> Option<usize> {
    if target > ubound_for_width(W as u8) {
        return None;
    }

    // The first two probes are free compared to setting up the bracket; runs
    // that begin at or just past the target exit here.
    let mut lo = start;
    if start + 2 < end {
        if get_direct::<W>(data, lo) >= target {
            return Some(lo);
        }
        lo += 1;
        if get_direct::<W>(data, lo) >= target {
            return Some(lo);
        }
        lo += 1;
    }

    if target > get_direct::<W>(data, end - 1) {
        return None;
    }

    if get_direct::<W>(data, lo) >= target {
        return Some(lo);
    }

    // Invariant from here: data[lo] < target and some element in (lo, end)
    // is >= target. Double the step until the bracket closes.
    let mut step = 1;
    let hi = loop {
        let probe = lo + step;
        if probe >= end {
            break end;
        }
        if get_direct::<W>(data, probe) >= target {
            break probe + 1;
        }
        lo = probe;
        step *= 2;
    };

    // Bisect (lo, hi): data[lo] < target, leftmost match is in (lo, hi].
    let mut lo = lo;
    let mut hi = hi;
    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        if get_direct::<W>(data, mid) < target {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    Some(hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::NodeKind;

    fn build(values: &[i64]) -> (SlabAlloc, Array) {
        let mut alloc = SlabAlloc::new();
        let mut arr = Array::create(&mut alloc, NodeKind::Normal, false).unwrap();
        for &v in values {
            arr.add(&mut alloc, v).unwrap();
        }
        (alloc, arr)
    }

    #[test]
    fn sum_at_each_width() {
        let cases: &[&[i64]] = &[
            &[0, 0, 0],
            &[1, 0, 1, 1],
            &[3, 2, 1, 0, 3],
            &[15, 1, 7, 9],
            &[100, -100, 27],
            &[30000, -12, 500],
            &[1 << 20, -(1 << 19)],
            &[1 << 40, -(1 << 41), 17],
        ];
        for values in cases {
            let (alloc, arr) = build(values);
            let expected: i64 = values.iter().sum();
            assert_eq!(arr.sum(&alloc, 0, arr.len()), expected, "values {:?}", values);
        }
    }

    #[test]
    fn sum_over_word_boundaries() {
        let values: Vec<i64> = (0..200).map(|i| (i % 4) as i64).collect();
        let (alloc, arr) = build(&values);

        assert_eq!(arr.sum(&alloc, 0, 200), values.iter().sum::<i64>());
        assert_eq!(arr.sum(&alloc, 3, 131), values[3..131].iter().sum::<i64>());
    }

    #[test]
    fn sum_of_range_clamps_end() {
        let (alloc, arr) = build(&[1, 2, 3]);

        assert_eq!(arr.sum(&alloc, 0, 1000), 6);
        assert_eq!(arr.sum(&alloc, 2, 2), 0);
    }

    #[test]
    fn minimum_and_maximum_track_indices() {
        let (alloc, arr) = build(&[5, -2, 9, -2, 9]);

        assert_eq!(arr.minimum(&alloc, 0, 5), Some((1, -2)));
        assert_eq!(arr.maximum(&alloc, 0, 5), Some((2, 9)));
        assert_eq!(arr.maximum(&alloc, 3, 5), Some((4, 9)));
        assert_eq!(arr.minimum(&alloc, 0, 0), None);
    }

    #[test]
    fn count_matches_linear_scan_at_each_width() {
        let cases: &[(&[i64], i64)] = &[
            (&[0, 0, 0], 0),
            (&[1, 0, 1, 1, 0, 1], 1),
            (&[3, 2, 3, 0, 3, 3, 1], 3),
            (&[15, 1, 15, 9, 15], 15),
            (&[100, -100, 100, 27], 100),
            (&[30000, -12, 30000], 30000),
            (&[1 << 20, 5, 1 << 20], 1 << 20),
            (&[1 << 40, 1 << 40, 17], 1 << 40),
        ];
        for (values, needle) in cases {
            let (alloc, arr) = build(values);
            let expected = values.iter().filter(|v| *v == needle).count();
            assert_eq!(arr.count(&alloc, *needle), expected, "values {:?}", values);
        }
    }

    #[test]
    fn count_long_runs_use_word_path() {
        let values: Vec<i64> = (0..300).map(|i| (i % 3) as i64).collect();
        let (alloc, arr) = build(&values);

        assert_eq!(arr.count(&alloc, 0), 100);
        assert_eq!(arr.count(&alloc, 1), 100);
        assert_eq!(arr.count(&alloc, 2), 100);
        assert_eq!(arr.count(&alloc, 3), 0);
    }

    #[test]
    fn count_out_of_width_value_is_zero() {
        let (alloc, arr) = build(&[1, 1, 0]);

        assert_eq!(arr.count(&alloc, 7), 0);
    }

    #[test]
    fn find_first_hits_across_word_boundary() {
        let mut values = vec![0i64; 150];
        values[137] = 1;
        let (alloc, arr) = build(&values);

        assert_eq!(arr.find_first(&alloc, 1, 0, 150), Some(137));
        assert_eq!(arr.find_first(&alloc, 1, 138, 150), None);
    }

    #[test]
    fn find_first_at_signed_widths() {
        let (alloc, arr) = build(&[500, -1000, 42, -1000]);

        assert_eq!(arr.find_first(&alloc, -1000, 0, 4), Some(1));
        assert_eq!(arr.find_first(&alloc, -1000, 2, 4), Some(3));
        assert_eq!(arr.find_first(&alloc, 7, 0, 4), None);
    }

    #[test]
    fn find_all_collects_every_match() {
        let (alloc, arr) = build(&[2, 5, 2, 2, 9, 2]);
        let mut result = Vec::new();

        arr.find_all(&alloc, &mut result, 2, 100, 0, arr.len());

        assert_eq!(result, vec![100, 102, 103, 105]);
    }

    #[test]
    fn bounds_on_sorted_data() {
        let (alloc, arr) = build(&[1, 3, 3, 3, 7, 9]);

        assert_eq!(arr.lower_bound(&alloc, 3), 1);
        assert_eq!(arr.upper_bound(&alloc, 3), 4);
        assert_eq!(arr.lower_bound(&alloc, 0), 0);
        assert_eq!(arr.lower_bound(&alloc, 10), 6);
    }

    #[test]
    fn find_gte_picks_leftmost_match() {
        let (alloc, arr) = build(&[1, 3, 3, 3, 7, 9]);

        assert_eq!(arr.find_gte(&alloc, 3, 0, arr.len()), Some(1));
        assert_eq!(arr.find_gte(&alloc, 4, 0, arr.len()), Some(4));
        assert_eq!(arr.find_gte(&alloc, 10, 0, arr.len()), None);
        assert_eq!(arr.find_gte(&alloc, 0, 0, arr.len()), Some(0));
    }

    #[test]
    fn find_gte_matches_linear_reference() {
        let values: Vec<i64> = (0..500).map(|i| i * 3).collect();
        let (alloc, arr) = build(&values);

        for start in [0usize, 1, 2, 5, 250, 497] {
            for target in [0i64, 1, 3, 700, 749, 1497, 1498] {
                let expected = (start..500).find(|&i| values[i] >= target);
                assert_eq!(
                    arr.find_gte(&alloc, target, start, 500),
                    expected,
                    "start {} target {}",
                    start,
                    target
                );
            }
        }
    }

    #[test]
    fn find_gte_small_ranges() {
        let (alloc, arr) = build(&[5, 10]);

        assert_eq!(arr.find_gte(&alloc, 6, 0, 2), Some(1));
        assert_eq!(arr.find_gte(&alloc, 5, 0, 2), Some(0));
        assert_eq!(arr.find_gte(&alloc, 11, 0, 2), None);
        assert_eq!(arr.find_gte(&alloc, 6, 1, 2), Some(1));
    }

    #[test]
    fn find_gte_target_above_width_bound() {
        let (alloc, arr) = build(&[1, 2, 3]);

        // Width 2 cannot hold 100; nothing can match.
        assert_eq!(arr.find_gte(&alloc, 100, 0, 3), None);
    }
}
