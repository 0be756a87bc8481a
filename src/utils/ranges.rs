use core::ops::Range;

/// Sorts address ranges and merges the ones that overlap or touch. Empty ranges are dropped.
pub fn merge_overlapping_ranges<T: Ord + Copy>(ranges: &mut Vec<Range<T>>) {
    ranges.retain(|range| range.start < range.end);
    ranges.sort_unstable_by_key(|range| range.start);
    let mut out_len = 0;
    for input_i in 0..ranges.len() {
        let range = ranges[input_i].clone();
        if out_len > 0 && range.start <= ranges[out_len - 1].end {
            let last = &mut ranges[out_len - 1];
            last.end = last.end.max(range.end);
        } else {
            ranges[out_len] = range;
            out_len += 1;
        }
    }
    ranges.truncate(out_len);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_adjacent_and_overlapping() {
        let mut ranges = vec![10u32..20, 0..5, 5..7, 15..30, 40..40, 31..35];
        merge_overlapping_ranges(&mut ranges);
        assert_eq!(ranges, [0..7, 10..30, 31..35]);
    }
}
