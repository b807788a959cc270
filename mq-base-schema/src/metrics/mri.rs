use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics::MetricUnit;

/// The type of a [`MetricResourceIdentifier`], determining its aggregation and storage.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum MetricType {
    /// Counts instances of an event.
    ///
    /// Counters are declared as `"c"` and stored in the counters entity.
    Counter,
    /// Builds a statistical distribution over values reported.
    ///
    /// Distributions allow to query the maximum, minimum, average and count of the reported
    /// values, as well as statistical quantiles. They are declared as `"d"`.
    Distribution,
    /// Counts the number of unique reported values.
    ///
    /// Sets are declared as `"s"`. It is not possible to query individual values from a set.
    Set,
    /// Stores absolute snapshots of values.
    ///
    /// Gauges are declared as `"g"`. They are parsed but cannot be queried, since there is no
    /// storage entity for them.
    Gauge,
}

impl MetricType {
    /// Return the shortcode for this metric type.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "c",
            MetricType::Distribution => "d",
            MetricType::Set => "s",
            MetricType::Gauge => "g",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MetricType {
    type Err = ParseMetricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "c" => Self::Counter,
            "d" => Self::Distribution,
            "s" => Self::Set,
            "g" => Self::Gauge,
            _ => return Err(ParseMetricError),
        })
    }
}

mq_common::impl_str_serde!(MetricType, "a metric type string");

/// An error returned when metrics or MRIs cannot be parsed.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("failed to parse metric")]
pub struct ParseMetricError;

/// The use case of a metric.
///
/// Use cases separate independent metric namespaces. Metric names, tag keys and tag values are
/// indexed separately for every use case, so the same string can map to different ids in
/// `sessions` and `transactions`.
///
/// # Parsing
///
/// Parsing a use case from strings is infallible. Unknown strings are mapped to
/// [`UseCaseId::Unsupported`].
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum UseCaseId {
    /// Release health metrics extracted from sessions.
    Sessions,
    /// Performance metrics extracted from transaction events.
    Transactions,
    /// Metrics extracted from spans.
    Spans,
    /// User-defined metrics sent by SDKs and applications.
    Custom,
    /// An unknown and unsupported use case.
    Unsupported,
}

impl UseCaseId {
    /// Returns all known use cases.
    pub const fn all() -> [Self; 5] {
        [
            Self::Sessions,
            Self::Transactions,
            Self::Spans,
            Self::Custom,
            Self::Unsupported,
        ]
    }

    /// Returns the string representation for this use case.
    pub fn as_str(&self) -> &'static str {
        match self {
            UseCaseId::Sessions => "sessions",
            UseCaseId::Transactions => "transactions",
            UseCaseId::Spans => "spans",
            UseCaseId::Custom => "custom",
            UseCaseId::Unsupported => "unsupported",
        }
    }
}

impl std::str::FromStr for UseCaseId {
    type Err = ParseMetricError;

    fn from_str(ns: &str) -> Result<Self, Self::Err> {
        match ns {
            "sessions" => Ok(UseCaseId::Sessions),
            "transactions" => Ok(UseCaseId::Transactions),
            "spans" => Ok(UseCaseId::Spans),
            "custom" => Ok(UseCaseId::Custom),
            _ => Ok(UseCaseId::Unsupported),
        }
    }
}

mq_common::impl_str_serde!(UseCaseId, "a valid metric use case");

impl fmt::Display for UseCaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type prefix of the MRIs of derived metrics.
///
/// Derived metrics are computed at query time and have no storage of their own. Their MRIs, such
/// as `e:sessions/crash_free_rate@ratio`, are only used for naming and never parse as a
/// [`MetricResourceIdentifier`].
pub const DERIVED_METRIC_TYPE: &str = "e";

/// Returns `true` if the string is the MRI of a derived metric.
pub fn is_derived_mri(mri: &str) -> bool {
    mri.split_once(':')
        .is_some_and(|(ty, _)| ty == DERIVED_METRIC_TYPE)
}

/// A unique identifier for metrics including typing and namespacing.
///
/// MRIs have the format `<type>:<namespace>/<name>[@<unit>]`. The unit is optional and defaults to
/// [`MetricUnit::None`]. A missing namespace defaults to [`UseCaseId::Custom`].
///
/// # Example
///
/// ```
/// use mq_base_schema::metrics::MetricResourceIdentifier;
///
/// let string = "d:transactions/measurements.lcp@millisecond";
/// let mri = MetricResourceIdentifier::parse(string).expect("should parse");
/// assert_eq!(mri.to_string(), string);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MetricResourceIdentifier<'a> {
    /// The type of a metric, determining its aggregation and storage entity.
    pub ty: MetricType,

    /// The use case this metric belongs to.
    pub namespace: UseCaseId,

    /// The display name of the metric in the allowed character set.
    pub name: Cow<'a, str>,

    /// The unit of the metric value.
    pub unit: MetricUnit,
}

impl<'a> MetricResourceIdentifier<'a> {
    /// Parses and validates an MRI.
    pub fn parse(name: &'a str) -> Result<Self, ParseMetricError> {
        let (raw_ty, rest) = name.split_once(':').ok_or(ParseMetricError)?;
        let ty = raw_ty.parse()?;

        Self::parse_with_type(rest, ty)
    }

    /// Parses an MRI from a string without the type and a separate type.
    pub fn parse_with_type(string: &'a str, ty: MetricType) -> Result<Self, ParseMetricError> {
        let (name_and_namespace, unit) = parse_name_unit(string).ok_or(ParseMetricError)?;

        let (namespace, name) = match name_and_namespace.split_once('/') {
            Some((raw_namespace, name)) => (raw_namespace.parse()?, name),
            None => (UseCaseId::Custom, name_and_namespace),
        };

        let name = crate::metrics::try_normalize_metric_name(name).ok_or(ParseMetricError)?;

        Ok(MetricResourceIdentifier {
            ty,
            name,
            namespace,
            unit,
        })
    }

    /// Converts the MRI into an owned version with a static lifetime.
    pub fn into_owned(self) -> MetricResourceIdentifier<'static> {
        MetricResourceIdentifier {
            ty: self.ty,
            namespace: self.namespace,
            name: Cow::Owned(self.name.into_owned()),
            unit: self.unit,
        }
    }
}

impl<'de> Deserialize<'de> for MetricResourceIdentifier<'static> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let string = <Cow<'de, str>>::deserialize(deserializer)?;
        let result = MetricResourceIdentifier::parse(&string)
            .map_err(serde::de::Error::custom)?
            .into_owned();

        Ok(result)
    }
}

impl Serialize for MetricResourceIdentifier<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl fmt::Display for MetricResourceIdentifier<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // `<ty>:<ns>/<name>@<unit>`
        write!(
            f,
            "{}:{}/{}@{}",
            self.ty, self.namespace, self.name, self.unit
        )
    }
}

/// Parses the `name[@unit]` part of a metric string.
///
/// Returns [`MetricUnit::None`] if no unit is specified. Returns `None` if value is invalid.
fn parse_name_unit(string: &str) -> Option<(&str, MetricUnit)> {
    let mut components = string.split('@');
    let name = components.next()?;

    let unit = match components.next() {
        Some(s) => s.parse().ok()?,
        None => MetricUnit::default(),
    };

    if components.next().is_some() {
        return None;
    }

    Some((name, unit))
}

#[cfg(test)]
mod tests {
    use crate::metrics::{CustomUnit, DurationUnit};

    use super::*;

    #[test]
    fn test_parse_mri_lenient() {
        assert_eq!(
            MetricResourceIdentifier::parse("c:sessions/session@none").unwrap(),
            MetricResourceIdentifier {
                ty: MetricType::Counter,
                namespace: UseCaseId::Sessions,
                name: "session".into(),
                unit: MetricUnit::None,
            },
        );
        assert_eq!(
            MetricResourceIdentifier::parse("c:foo").unwrap(),
            MetricResourceIdentifier {
                ty: MetricType::Counter,
                namespace: UseCaseId::Custom,
                name: "foo".into(),
                unit: MetricUnit::None,
            },
        );
        assert_eq!(
            MetricResourceIdentifier::parse("d:transactions/duration@millisecond").unwrap(),
            MetricResourceIdentifier {
                ty: MetricType::Distribution,
                namespace: UseCaseId::Transactions,
                name: "duration".into(),
                unit: MetricUnit::Duration(DurationUnit::MilliSecond),
            },
        );
        assert_eq!(
            MetricResourceIdentifier::parse("c:something/foo").unwrap().namespace,
            UseCaseId::Unsupported,
        );
        assert_eq!(
            MetricResourceIdentifier::parse("c:foo@something").unwrap().unit,
            MetricUnit::Custom(CustomUnit::parse("something").unwrap()),
        );
        assert!(MetricResourceIdentifier::parse("foo").is_err());
        assert!(MetricResourceIdentifier::parse("c:foo@a@b").is_err());
    }

    #[test]
    fn test_derived_mri_does_not_parse() {
        let mri = "e:sessions/crash_free_rate@ratio";
        assert!(is_derived_mri(mri));
        assert!(MetricResourceIdentifier::parse(mri).is_err());
        assert!(!is_derived_mri("c:sessions/session@none"));
    }

    #[test]
    fn test_invalid_names_should_normalize() {
        assert_eq!(
            MetricResourceIdentifier::parse("c:custom/f??o").unwrap().name,
            "f_o"
        );
        assert_eq!(
            MetricResourceIdentifier::parse("d:foo.bar.blob-size@second").unwrap().name,
            "foo.bar.blob_size"
        );
    }

    #[test]
    fn test_serde_mri() {
        let mri: MetricResourceIdentifier<'static> =
            serde_json::from_str("\"s:sessions/user@none\"").unwrap();
        assert_eq!(mri.ty, MetricType::Set);
        assert_eq!(
            serde_json::to_string(&mri).unwrap(),
            "\"s:sessions/user@none\""
        );
    }
}
