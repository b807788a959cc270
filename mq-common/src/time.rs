//! Utilities to deal with time buckets on UTC timestamps.

use chrono::{DateTime, TimeZone, Timelike, Utc};

/// Number of seconds in a minute.
pub const MINUTE: i64 = 60;
/// Number of seconds in an hour.
pub const HOUR: i64 = 60 * MINUTE;
/// Number of seconds in a day.
pub const DAY: i64 = 24 * HOUR;

/// Converts a UNIX timestamp in seconds into a UTC datetime.
///
/// Returns `None` if the timestamp is out of the range representable by [`DateTime`].
pub fn from_unix(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

/// Rounds the datetime down to the closest multiple of `interval` seconds since the UNIX epoch.
///
/// Sub-second precision is dropped. An `interval` of zero or less returns the timestamp truncated
/// to full seconds.
///
/// # Example
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use mq_common::time::{floor_to_interval, HOUR};
///
/// let time = Utc.with_ymd_and_hms(2021, 8, 25, 13, 37, 12).unwrap();
/// let floored = floor_to_interval(time, HOUR);
/// assert_eq!(floored, Utc.with_ymd_and_hms(2021, 8, 25, 13, 0, 0).unwrap());
/// ```
pub fn floor_to_interval(time: DateTime<Utc>, interval: i64) -> DateTime<Utc> {
    let secs = time.timestamp();
    if interval <= 0 {
        return from_unix(secs).unwrap_or(time);
    }

    from_unix(secs - secs.rem_euclid(interval)).unwrap_or(time)
}

/// Returns `true` if the datetime falls exactly on a multiple of `interval` seconds.
pub fn is_aligned(time: DateTime<Utc>, interval: i64) -> bool {
    interval > 0 && time.nanosecond() == 0 && time.timestamp().rem_euclid(interval) == 0
}

/// Returns the distance in minutes to the closest hour boundary, ignoring seconds.
///
/// `23:03` and `00:57` are both three minutes away from an hour boundary.
pub fn minutes_from_hour(time: DateTime<Utc>) -> u32 {
    let minute = time.minute();
    minute.min(60 - minute)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_negative_timestamps() {
        let time = from_unix(-1).unwrap();
        assert_eq!(floor_to_interval(time, MINUTE).timestamp(), -60);
    }

    #[test]
    fn test_is_aligned() {
        let midnight = Utc.with_ymd_and_hms(2015, 5, 18, 0, 0, 0).unwrap();
        assert!(is_aligned(midnight, DAY));
        assert!(is_aligned(midnight, HOUR));

        let late = Utc.with_ymd_and_hms(2015, 5, 18, 10, 0, 1).unwrap();
        assert!(!is_aligned(late, HOUR));
        assert!(!is_aligned(late, 0));
    }

    #[test]
    fn test_minutes_from_hour() {
        let early = Utc.with_ymd_and_hms(2015, 5, 18, 23, 3, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2015, 5, 18, 1, 57, 59).unwrap();
        assert_eq!(minutes_from_hour(early), 3);
        assert_eq!(minutes_from_hour(late), 3);
    }
}
