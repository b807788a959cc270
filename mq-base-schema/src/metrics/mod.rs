//! Type definitions for metric identifiers and their storage.

mod entity;
mod mri;
mod units;

pub use self::entity::*;
pub use self::mri::*;
pub use self::units::*;

use regex::Regex;
use std::{borrow::Cow, sync::OnceLock};

/// Maximum length of a metric name, excluding type, namespace and unit.
const METRIC_NAME_MAX_SIZE: usize = 150;

/// Validates a metric name and normalizes it.
///
/// Metric names cannot be empty, must begin with a letter and can consist of ASCII alphanumerics,
/// underscores and periods. Consecutive invalid characters are replaced with a single underscore.
pub fn try_normalize_metric_name(name: &str) -> Option<Cow<'_, str>> {
    static NORMALIZE_RE: OnceLock<Regex> = OnceLock::new();

    if !can_be_valid_metric_name(name) {
        return None;
    }

    let normalize_re = NORMALIZE_RE.get_or_init(|| Regex::new("[^a-zA-Z0-9_.]+").unwrap());
    let normalized_name = normalize_re.replace_all(name, "_");

    if normalized_name.len() <= METRIC_NAME_MAX_SIZE {
        return Some(normalized_name);
    }

    // After normalization every character is a single byte.
    Some(match normalized_name {
        Cow::Borrowed(value) => Cow::Borrowed(&value[..METRIC_NAME_MAX_SIZE]),
        Cow::Owned(mut value) => {
            value.truncate(METRIC_NAME_MAX_SIZE);
            Cow::Owned(value)
        }
    })
}

/// Returns whether [`try_normalize_metric_name`] can normalize the passed name.
pub fn can_be_valid_metric_name(name: &str) -> bool {
    name.starts_with(|c: char| c.is_ascii_alphabetic())
}
