use chrono::Duration;

use crate::date_util::DateRange;

/// Merge overlapping/adjacent date ranges into a sorted, disjoint list.
pub fn merge_ranges(ranges: &[DateRange]) -> Vec<DateRange> {
    let mut sorted: Vec<DateRange> = ranges.iter().copied().filter(|r| r.from <= r.to).collect();
    sorted.sort_by_key(|r| r.from);

    let mut merged: Vec<DateRange> = Vec::with_capacity(sorted.len());
    for range in sorted {
        match merged.last_mut() {
            // Adjacent or overlapping (1 day gap counts as adjacent)
            Some(last) if range.from <= last.to + Duration::days(1) => {
                last.to = last.to.max(range.to);
            }
            _ => merged.push(range),
        }
    }
    merged
}

/// True when `target` lies entirely inside the union of `ranges`: an exact
/// match, containment by a broader range, or a contiguous run of narrower ones.
pub fn is_covered(ranges: &[DateRange], target: &DateRange) -> bool {
    merge_ranges(ranges).iter().any(|r| r.covers(target))
}

/// Sub-ranges of `desired` not covered by `covered`.
pub fn find_gaps(desired: DateRange, covered: &[DateRange]) -> Vec<DateRange> {
    if desired.from > desired.to {
        return vec![];
    }

    let mut gaps = Vec::new();
    let mut cursor = desired.from;
    for range in merge_ranges(covered) {
        if range.to < cursor {
            continue;
        }
        if range.from > desired.to {
            break;
        }
        if range.from > cursor {
            gaps.push(DateRange::new(cursor, range.from - Duration::days(1)));
        }
        cursor = range.to + Duration::days(1);
    }

    if cursor <= desired.to {
        gaps.push(DateRange::new(cursor, desired.to));
    }
    gaps
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn r(a: NaiveDate, b: NaiveDate) -> DateRange {
        DateRange::new(a, b)
    }

    #[test]
    fn test_exact_and_broader_match() {
        let week = r(d(2024, 1, 29), d(2024, 2, 4));
        assert!(is_covered(&[week], &week));
        assert!(is_covered(&[week], &DateRange::single(d(2024, 2, 1))));
        assert!(!is_covered(&[week], &r(d(2024, 2, 1), d(2024, 2, 5))));
    }

    #[test]
    fn test_contiguous_daily_records_cover_week() {
        let week = r(d(2024, 1, 29), d(2024, 2, 4));
        let days: Vec<DateRange> = week.iter_days().map(DateRange::single).collect();
        assert!(is_covered(&days, &week));

        let missing_one: Vec<DateRange> = days
            .iter()
            .copied()
            .filter(|r| r.from != d(2024, 2, 1))
            .collect();
        assert!(!is_covered(&missing_one, &week));
    }

    #[test]
    fn test_no_covered_ranges() {
        let gaps = find_gaps(r(d(2025, 1, 1), d(2025, 3, 31)), &[]);
        assert_eq!(gaps, vec![r(d(2025, 1, 1), d(2025, 3, 31))]);
    }

    #[test]
    fn test_fully_covered() {
        let covered = vec![r(d(2025, 1, 1), d(2025, 3, 31))];
        assert!(find_gaps(r(d(2025, 1, 1), d(2025, 3, 31)), &covered).is_empty());
    }

    #[test]
    fn test_gap_in_middle() {
        let covered = vec![
            r(d(2025, 1, 1), d(2025, 1, 31)),
            r(d(2025, 3, 1), d(2025, 3, 31)),
        ];
        let gaps = find_gaps(r(d(2025, 1, 1), d(2025, 3, 31)), &covered);
        assert_eq!(gaps, vec![r(d(2025, 2, 1), d(2025, 2, 28))]);
    }

    #[test]
    fn test_overlapping_ranges_merged() {
        let covered = vec![
            r(d(2025, 1, 1), d(2025, 1, 20)),
            r(d(2025, 1, 15), d(2025, 2, 15)),
        ];
        let gaps = find_gaps(r(d(2025, 1, 1), d(2025, 3, 31)), &covered);
        assert_eq!(gaps, vec![r(d(2025, 2, 16), d(2025, 3, 31))]);
    }

    #[test]
    fn test_covered_range_outside_window_ignored() {
        let covered = vec![r(d(2024, 12, 1), d(2024, 12, 10))];
        let gaps = find_gaps(r(d(2025, 1, 1), d(2025, 1, 5)), &covered);
        assert_eq!(gaps, vec![r(d(2025, 1, 1), d(2025, 1, 5))]);
    }
}
