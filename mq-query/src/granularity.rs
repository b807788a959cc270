//! Selection of the storage granularity and time buckets of a query.
//!
//! The backing store keeps pre-aggregated rows at three resolutions. Coarser resolutions are
//! cheaper to read, but can only be used if the query range lines up with their buckets, as
//! otherwise data outside of the requested range would be included.

use std::fmt;

use chrono::{DateTime, Duration, Timelike, Utc};
use mq_common::time::{self, DAY, HOUR, MINUTE};
use serde::{Deserialize, Serialize};

/// Maximum distance in minutes to an hour boundary for ranges to still use hourly buckets.
///
/// Only applies to ranges of at least [`HOUR_TOLERANCE_MIN_RANGE`].
pub const HOUR_TOLERANCE: u32 = 5;

/// Minimum range in seconds for [`HOUR_TOLERANCE`] to apply.
pub const HOUR_TOLERANCE_MIN_RANGE: i64 = 12 * HOUR;

/// The resolution at which pre-aggregated metrics are stored.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
pub enum Granularity {
    /// One bucket per minute.
    Minute,
    /// One bucket per hour.
    Hour,
    /// One bucket per day.
    Day,
}

impl Granularity {
    /// All granularities from the finest to the coarsest.
    pub const ALL: [Granularity; 3] = [Granularity::Minute, Granularity::Hour, Granularity::Day];

    /// Returns the bucket length in seconds.
    pub fn seconds(self) -> i64 {
        match self {
            Granularity::Minute => MINUTE,
            Granularity::Hour => HOUR,
            Granularity::Day => DAY,
        }
    }

    /// Returns the coarsest granularity whose buckets are not longer than `interval` seconds.
    ///
    /// Intervals shorter than a minute still return [`Granularity::Minute`].
    pub fn for_interval(interval: i64) -> Self {
        Self::ALL
            .into_iter()
            .rev()
            .find(|g| g.seconds() <= interval)
            .unwrap_or(Granularity::Minute)
    }
}

impl From<Granularity> for i64 {
    fn from(granularity: Granularity) -> Self {
        granularity.seconds()
    }
}

impl TryFrom<i64> for Granularity {
    type Error = String;

    fn try_from(seconds: i64) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|g| g.seconds() == seconds)
            .ok_or_else(|| format!("unsupported granularity {seconds}"))
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.seconds())
    }
}

/// Chooses the coarsest granularity that covers exactly the range `[start, end)`.
///
///  1. If both ends are at midnight and the range spans at least a day, returns
///     [`Granularity::Day`].
///  2. If both ends are on the hour and the range spans at least an hour, returns
///     [`Granularity::Hour`].
///  3. If the range spans at least 12 hours and both ends are within [`HOUR_TOLERANCE`] minutes
///     of an hour boundary, returns [`Granularity::Hour`]. Seconds are ignored.
///  4. Otherwise, returns [`Granularity::Minute`].
pub fn resolve_granularity(start: DateTime<Utc>, end: DateTime<Utc>) -> Granularity {
    let range = (end - start).num_seconds();

    if range >= DAY && time::is_aligned(start, DAY) && time::is_aligned(end, DAY) {
        return Granularity::Day;
    }

    if range >= HOUR && time::is_aligned(start, HOUR) && time::is_aligned(end, HOUR) {
        return Granularity::Hour;
    }

    if range >= HOUR_TOLERANCE_MIN_RANGE
        && time::minutes_from_hour(start) <= HOUR_TOLERANCE
        && time::minutes_from_hour(end) <= HOUR_TOLERANCE
    {
        return Granularity::Hour;
    }

    Granularity::Minute
}

/// Chooses the granularity of a series query with buckets of `interval` seconds.
///
/// The granularity never exceeds the interval, so an interval below one hour always reads minute
/// buckets even if the range would allow coarser ones.
pub fn resolve_series_granularity(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    interval: i64,
) -> Granularity {
    resolve_granularity(start, end).min(Granularity::for_interval(interval))
}

/// Returns the start times of all buckets of `interval` seconds that overlap `[start, end)`.
///
/// Buckets are aligned to the UNIX epoch. The first bucket starts at or before `start`.
pub fn get_intervals(start: DateTime<Utc>, end: DateTime<Utc>, interval: i64) -> Vec<DateTime<Utc>> {
    if interval <= 0 {
        return Vec::new();
    }

    let step = Duration::seconds(interval);
    let mut current = time::floor_to_interval(start, interval);
    let mut intervals = Vec::new();

    while current < end {
        intervals.push(current);
        current += step;
    }

    intervals
}

/// Returns the number of buckets that [`get_intervals`] yields.
pub fn get_num_intervals(start: DateTime<Utc>, end: DateTime<Utc>, interval: i64) -> usize {
    if interval <= 0 || end <= start {
        return 0;
    }

    let first = time::floor_to_interval(start, interval).timestamp();
    let end = end.timestamp() + i64::from(end.nanosecond() > 0);
    ((end - first + interval - 1) / interval) as usize
}

#[cfg(test)]
mod tests {
    use mq_test::datetime;

    use super::*;

    #[test]
    fn test_thirty_days_at_midnight() {
        let start = datetime(2015, 5, 18, 0, 0, 0);
        let end = start + Duration::days(30);
        assert_eq!(resolve_granularity(start, end), Granularity::Day);
    }

    #[test]
    fn test_shift_by_one_hour() {
        let start = datetime(2015, 5, 18, 0, 0, 0);
        let end = start + Duration::days(30);

        assert_eq!(
            resolve_granularity(start + Duration::hours(1), end),
            Granularity::Hour
        );
        assert_eq!(
            resolve_granularity(start, end - Duration::hours(1)),
            Granularity::Hour
        );
        assert_eq!(
            resolve_granularity(start, start + Duration::days(3) + Duration::hours(1)),
            Granularity::Hour
        );
    }

    #[test]
    fn test_random_offset() {
        let start = datetime(2015, 5, 18, 10, 15, 1);
        let end = datetime(2015, 5, 19, 15, 15, 1);
        assert_eq!(resolve_granularity(start, end), Granularity::Minute);
    }

    #[test]
    fn test_hour_tolerance() {
        let start = datetime(2015, 5, 18, 23, 3, 0);
        let end = datetime(2015, 5, 19, 12, 57, 59);
        assert_eq!(resolve_granularity(start, end), Granularity::Hour);

        let start = datetime(2015, 5, 18, 23, 6, 0);
        assert_eq!(resolve_granularity(start, end), Granularity::Minute);

        // The tolerance does not apply to short ranges.
        let start = datetime(2015, 5, 19, 9, 3, 0);
        assert_eq!(resolve_granularity(start, end), Granularity::Minute);
    }

    #[test]
    fn test_one_hour_exactly() {
        let start = datetime(2015, 5, 18, 10, 0, 0);
        assert_eq!(
            resolve_granularity(start, start + Duration::hours(1)),
            Granularity::Hour
        );
        assert_eq!(
            resolve_granularity(start, start + Duration::minutes(59)),
            Granularity::Minute
        );
    }

    #[test]
    fn test_series_interval_caps_granularity() {
        let start = datetime(2015, 5, 18, 0, 0, 0);
        let end = start + Duration::days(1);

        assert_eq!(resolve_series_granularity(start, end, DAY), Granularity::Day);
        assert_eq!(resolve_series_granularity(start, end, HOUR), Granularity::Hour);
        assert_eq!(
            resolve_series_granularity(start, end, 30 * MINUTE),
            Granularity::Minute
        );
        assert_eq!(
            resolve_series_granularity(start, end + Duration::minutes(1), DAY),
            Granularity::Minute
        );
    }

    #[test]
    fn test_get_intervals() {
        let start = datetime(2021, 8, 25, 10, 30, 0);
        let end = datetime(2021, 8, 25, 13, 0, 0);

        let intervals = get_intervals(start, end, HOUR);
        assert_eq!(
            intervals,
            vec![
                datetime(2021, 8, 25, 10, 0, 0),
                datetime(2021, 8, 25, 11, 0, 0),
                datetime(2021, 8, 25, 12, 0, 0),
            ]
        );
        assert_eq!(get_num_intervals(start, end, HOUR), 3);
        assert_eq!(get_num_intervals(start, end + Duration::seconds(1), HOUR), 4);
        assert!(get_intervals(start, end, 0).is_empty());
    }

    #[test]
    fn test_serde_granularity() {
        assert_eq!(serde_json::to_string(&Granularity::Hour).unwrap(), "3600");
        assert_eq!(
            serde_json::from_str::<Granularity>("86400").unwrap(),
            Granularity::Day
        );
        assert!(serde_json::from_str::<Granularity>("10").is_err());
    }
}
