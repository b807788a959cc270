//! Helpers for testing the metrics query planner.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output is
//!    captured by the test runner.
//!  - Use fixed timestamps from this crate instead of the wall clock, so that granularity and
//!    interval computations are deterministic.
//!
//! # Example
//!
//! ```no_run
//! #[test]
//! fn my_test() {
//!     mq_test::setup();
//!
//!     mq_log::debug!("hello, world!");
//! }
//! ```

use chrono::{DateTime, Duration, TimeZone, Utc};

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from this crate and mutes all other logs.
pub fn setup() {
    mq_log::init_test!();
}

/// A fixed midnight used as the base time of tests: `2021-08-25T00:00:00Z`.
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 8, 25, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

/// Returns [`base_time`] shifted by the given number of seconds.
pub fn at(offset_secs: i64) -> DateTime<Utc> {
    base_time() + Duration::seconds(offset_secs)
}

/// Returns the UTC datetime for the given calendar components.
///
/// # Panics
///
/// Panics if the components do not form a valid datetime.
pub fn datetime(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
        .single()
        .unwrap_or_else(|| panic!("invalid test datetime {year}-{month}-{day} {hour}:{min}:{sec}"))
}
