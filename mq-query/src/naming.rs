//! Public names of metrics and parsing of field expressions.
//!
//! Clients refer to metrics by public names such as `transaction.duration`, or by their MRI for
//! metrics without a public name. Fields combine a metric with an aggregation, for example
//! `p95(transaction.duration)` or `percentile(transaction.duration, 0.95)`. Derived metrics are
//! selected by their bare name, for example `session.crash_free_rate`.

use std::borrow::Cow;
use std::sync::OnceLock;

use mq_base_schema::metrics::{MetricResourceIdentifier, is_derived_mri};
use regex::Regex;

use crate::error::InvalidParams;
use crate::query::{MetricField, MetricOperation};
use crate::snql::Quantile;

/// Public names of raw metrics and their MRIs.
const PUBLIC_NAMES: &[(&str, &str)] = &[
    ("sentry.sessions.session", "c:sessions/session@none"),
    ("sentry.sessions.user", "s:sessions/user@none"),
    ("sentry.sessions.session.error", "s:sessions/error@none"),
    ("sentry.sessions.session.duration", "d:sessions/duration@second"),
    ("transaction.duration", "d:transactions/duration@millisecond"),
    ("transaction.user", "s:transactions/user@none"),
    ("transaction.measurements.lcp", "d:transactions/measurements.lcp@millisecond"),
    ("transaction.measurements.fcp", "d:transactions/measurements.fcp@millisecond"),
    ("transaction.measurements.fid", "d:transactions/measurements.fid@millisecond"),
    ("transaction.measurements.cls", "d:transactions/measurements.cls@none"),
    ("transaction.measurements.ttfb", "d:transactions/measurements.ttfb@millisecond"),
    ("span.self_time", "d:spans/exclusive_time@millisecond"),
    ("span.duration", "d:spans/duration@millisecond"),
];

/// Discover-style field names that expand to metric fields.
const FIELD_ALIASES: &[(&str, Option<MetricOperation>, &str)] = &[
    ("count()", Some(MetricOperation::Count), "transaction.duration"),
    ("failure_rate()", None, "transaction.failure_rate"),
    ("failure_count()", None, "transaction.failure_count"),
];

/// Returns the MRI of a raw metric's public name.
pub fn get_mri(public_name: &str) -> Option<&'static str> {
    PUBLIC_NAMES
        .iter()
        .find(|(name, _)| *name == public_name)
        .map(|(_, mri)| *mri)
}

/// Returns the public name of a raw metric's MRI.
pub fn get_public_name_from_mri(mri: &str) -> Option<&'static str> {
    PUBLIC_NAMES
        .iter()
        .find(|(_, m)| *m == mri)
        .map(|(name, _)| *name)
}

/// Resolves a metric name to the MRI of a raw metric.
///
/// Accepts public names and MRIs. Returns `None` for derived metrics and unknown names.
pub fn resolve_raw_metric(name: &str) -> Option<MetricResourceIdentifier<'_>> {
    if is_derived_mri(name) {
        return None;
    }

    let mri = get_mri(name).unwrap_or(name);
    MetricResourceIdentifier::parse(mri).ok()
}

/// Returns `true` if the name refers to a raw metric.
pub fn is_metric_name(name: &str) -> bool {
    get_mri(name).is_some() || (name.contains(':') && resolve_raw_metric(name).is_some())
}

/// Parses a field expression.
///
/// Supported forms are:
///  - `op(metric)` for the operations in [`MetricOperation`],
///  - `pXX(metric)` for the percentiles 50, 75, 90, 95, 99 and 100,
///  - `percentile(metric, p)` for `p` in `[0, 1]` in steps of `0.01`,
///  - the aliases `count()`, `failure_rate()` and `failure_count()`,
///  - bare names, which refer to derived metrics or tags.
///
/// Fields parsed from aliases keep the alias as their name.
pub fn parse_field(field: &str) -> Result<MetricField, InvalidParams> {
    static FIELD_RE: OnceLock<Regex> = OnceLock::new();

    let field = field.trim();
    if field.is_empty() {
        return Err(InvalidParams::new("empty field"));
    }

    if let Some((alias, op, metric)) = FIELD_ALIASES.iter().find(|(a, _, _)| *a == field) {
        return Ok(MetricField {
            op: *op,
            metric: (*metric).to_owned(),
            alias: Some((*alias).to_owned()),
        });
    }

    let field_re = FIELD_RE.get_or_init(|| Regex::new(r"^(\w+)\(([^()]*)\)$").unwrap());
    let Some(captures) = field_re.captures(field) else {
        if field.contains(['(', ')']) {
            return Err(InvalidParams::new(format!("invalid field {field:?}")));
        }

        return Ok(MetricField::derived(field));
    };

    let function = &captures[1];
    let args: Vec<&str> = captures[2].split(',').map(str::trim).collect();

    let (op, metric) = match (function, args.as_slice()) {
        ("percentile", [metric, p]) => {
            let quantile = p
                .parse::<f64>()
                .ok()
                .and_then(Quantile::from_fraction)
                .ok_or_else(|| {
                    InvalidParams::new(format!(
                        "percentile must be a multiple of 0.01 between 0 and 1 in {field:?}"
                    ))
                })?;
            (MetricOperation::Percentile(quantile), *metric)
        }
        ("percentile", _) => {
            return Err(InvalidParams::new(format!(
                "percentile requires a metric and a percentile in {field:?}"
            )));
        }
        (function, [metric]) if !metric.is_empty() => {
            let op = MetricOperation::from_name(function).ok_or_else(|| {
                if is_percentile_shorthand(function) {
                    InvalidParams::new(format!(
                        "{function} is not a valid percentile, use one of p50, p75, p90, p95, p99 or p100"
                    ))
                } else {
                    InvalidParams::new(format!("unknown function {function:?}"))
                }
            })?;
            (op, *metric)
        }
        _ => return Err(InvalidParams::new(format!("invalid field {field:?}"))),
    };

    Ok(MetricField::new(op, normalize_metric_name(metric)))
}

fn is_percentile_shorthand(function: &str) -> bool {
    function
        .strip_prefix('p')
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}

fn normalize_metric_name(metric: &str) -> Cow<'_, str> {
    match get_mri(metric) {
        Some(_) => Cow::Borrowed(metric),
        None => match MetricResourceIdentifier::parse(metric) {
            Ok(mri) => get_public_name_from_mri(&mri.to_string())
                .map_or(Cow::Borrowed(metric), Cow::Borrowed),
            Err(_) => Cow::Borrowed(metric),
        },
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_public_names() {
        assert_eq!(
            get_mri("transaction.duration"),
            Some("d:transactions/duration@millisecond")
        );
        assert_eq!(
            get_public_name_from_mri("s:sessions/user@none"),
            Some("sentry.sessions.user")
        );
        assert!(resolve_raw_metric("e:sessions/crash_free_rate@ratio").is_none());
        assert!(resolve_raw_metric("c:custom/my_counter@none").is_some());
        assert!(is_metric_name("transaction.duration"));
        assert!(!is_metric_name("transaction"));
    }

    #[test]
    fn test_parse_op_field() {
        assert_eq!(
            parse_field("avg(transaction.duration)").unwrap(),
            MetricField::new(MetricOperation::Avg, "transaction.duration")
        );
        assert_eq!(
            parse_field("p100(d:transactions/duration@millisecond)").unwrap(),
            MetricField::new(MetricOperation::P100, "transaction.duration")
        );
        assert_eq!(
            parse_field("percentile(transaction.duration, 0.42)").unwrap(),
            MetricField::new(
                MetricOperation::Percentile(Quantile::from_percent(42).unwrap()),
                "transaction.duration"
            )
        );
    }

    #[test]
    fn test_parse_aliases() {
        let field = parse_field("count()").unwrap();
        assert_eq!(field.op, Some(MetricOperation::Count));
        assert_eq!(field.metric, "transaction.duration");
        assert_eq!(field.alias(), "count()");

        let field = parse_field("failure_rate()").unwrap();
        assert_eq!(field.op, None);
        assert_eq!(field.metric, "transaction.failure_rate");
    }

    #[test]
    fn test_parse_bare_name() {
        assert_eq!(
            parse_field("session.crash_free_rate").unwrap(),
            MetricField::derived("session.crash_free_rate")
        );
    }

    #[test]
    fn test_invalid_percentiles() {
        let error = parse_field("p42(transaction.duration)").unwrap_err();
        assert!(error.0.contains("p42 is not a valid percentile"));

        assert!(parse_field("percentile(transaction.duration, 0.555)").is_err());
        assert!(parse_field("percentile(transaction.duration, 2)").is_err());
        assert!(parse_field("percentile(transaction.duration)").is_err());
    }

    #[test]
    fn test_unknown_function() {
        assert_eq!(
            parse_field("histogram(transaction.duration)").unwrap_err(),
            InvalidParams::new("unknown function \"histogram\"")
        );
        assert!(parse_field("avg()").is_err());
        assert!(parse_field("avg(a(b))").is_err());
    }
}
