use serde::{Deserialize, Serialize};

/// Limits and switches of the [`QueryBuilder`](crate::QueryBuilder).
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct QueryConfig {
    /// The number of groups returned if a query does not specify a limit.
    ///
    /// Defaults to `50`.
    pub default_limit: u64,

    /// The maximum number of groups a query may request.
    ///
    /// Defaults to `10_000`. Queries with a higher limit are rejected.
    pub max_limit: u64,

    /// The maximum number of data points returned by a single series query.
    ///
    /// Defaults to `10_000`. Queries with more intervals are rejected. If the number of groups
    /// multiplied with the number of intervals exceeds this, series queries are limited to half
    /// of this value.
    pub max_points: u64,

    /// Allows `having` conditions on fields of different entities.
    ///
    /// Defaults to `false`. Such conditions are evaluated per entity, which means groups may be
    /// missing from some entities.
    pub allow_cross_entity_having: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: 50,
            max_limit: 10_000,
            max_points: 10_000,
            allow_cross_entity_having: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config() {
        let config: QueryConfig = serde_json::from_str(r#"{"max_points": 100}"#).unwrap();
        assert_eq!(
            config,
            QueryConfig {
                max_points: 100,
                ..Default::default()
            }
        );
    }
}
