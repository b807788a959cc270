use std::fmt;

use crate::metrics::{MetricType, ParseMetricError};

/// A storage entity of the backing metrics store.
///
/// Every raw metric lives in exactly one entity, determined by its [`MetricType`]. Queries are
/// always issued against a single entity.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum EntityKey {
    /// Pre-aggregated counter values.
    Counters,
    /// Distribution values, supporting percentiles.
    Distributions,
    /// Unique values of sets.
    Sets,
}

impl EntityKey {
    /// Returns the entity storing metrics of the given type.
    ///
    /// Gauges have no entity and return `None`.
    pub fn for_metric_type(ty: MetricType) -> Option<Self> {
        match ty {
            MetricType::Counter => Some(Self::Counters),
            MetricType::Distribution => Some(Self::Distributions),
            MetricType::Set => Some(Self::Sets),
            MetricType::Gauge => None,
        }
    }

    /// Returns the name of the entity in the store.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Counters => "metrics_counters",
            Self::Distributions => "metrics_distributions",
            Self::Sets => "metrics_sets",
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityKey {
    type Err = ParseMetricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "metrics_counters" => Ok(Self::Counters),
            "metrics_distributions" => Ok(Self::Distributions),
            "metrics_sets" => Ok(Self::Sets),
            _ => Err(ParseMetricError),
        }
    }
}

mq_common::impl_str_serde!(EntityKey, "a metrics storage entity");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_for_type() {
        assert_eq!(
            EntityKey::for_metric_type(MetricType::Set),
            Some(EntityKey::Sets)
        );
        assert_eq!(EntityKey::for_metric_type(MetricType::Gauge), None);
        assert_eq!(
            "metrics_counters".parse::<EntityKey>(),
            Ok(EntityKey::Counters)
        );
        assert_eq!(EntityKey::Distributions.to_string(), "metrics_distributions");
    }
}
