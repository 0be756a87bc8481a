mod ranges;

pub use self::ranges::merge_overlapping_ranges;
