use mq_indexer::IndexerError;
use thiserror::Error;

use crate::parser::ParseError;
use crate::store::StoreError;

/// Invalid parameters in a query request.
///
/// The message names the offending expression.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("invalid query: {0}")]
pub struct InvalidParams(pub String);

impl InvalidParams {
    /// Creates a new error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// An inconsistent definition of a derived metric.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DerivedMetricParseError {
    /// The metric is not registered.
    #[error("derived metric {0:?} does not exist")]
    UnknownMetric(String),
    /// Two metrics were registered with the same name.
    #[error("derived metric {0:?} is defined more than once")]
    DuplicateMetric(String),
    /// A constituent is neither a raw metric nor a registered derived metric.
    #[error("derived metric {metric:?} references unknown constituent {constituent:?}")]
    UnknownConstituent {
        /// The derived metric.
        metric: String,
        /// The unknown constituent.
        constituent: String,
    },
    /// The constituents of a singular entity metric resolve to different entities.
    #[error("derived metric {0:?} has constituents in multiple entities")]
    MultipleEntities(String),
    /// A singular entity metric references a composite metric.
    #[error("derived metric {metric:?} cannot reference composite metric {constituent:?}")]
    CompositeConstituent {
        /// The singular entity metric.
        metric: String,
        /// The composite constituent.
        constituent: String,
    },
    /// A constituent is a metric type without storage entity.
    #[error("derived metric {metric:?} references unqueryable metric {constituent:?}")]
    UnsupportedMetricType {
        /// The derived metric.
        metric: String,
        /// The raw metric.
        constituent: String,
    },
    /// The constituents of a metric reference the metric itself.
    #[error("derived metric {0:?} depends on itself")]
    Cycle(String),
    /// A derived metric without constituents.
    #[error("derived metric {0:?} has no constituents")]
    NoConstituents(String),
}

/// An operation was invoked on a composite metric that only singular entity metrics support.
///
/// Composite metrics must be decomposed into their constituents by the query builder. This error
/// indicates a bug in the caller.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{operation} is not supported over composite entity metric {metric:?}")]
pub struct NotSupportedOverCompositeEntity {
    /// The composite metric.
    pub metric: String,
    /// The unsupported operation.
    pub operation: &'static str,
}

/// Any error that aborts a metrics query.
#[derive(Debug, Error)]
pub enum QueryError {
    /// Invalid request parameters.
    #[error(transparent)]
    InvalidParams(#[from] InvalidParams),
    /// A combination of fields that cannot be lowered to entity queries.
    #[error("incompatible metrics query: {0}")]
    IncompatibleMetricsQuery(String),
    /// A malformed filter query.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// An inconsistent derived metric.
    #[error(transparent)]
    DerivedMetric(#[from] DerivedMetricParseError),
    /// Misuse of a composite metric.
    #[error(transparent)]
    NotSupportedOverCompositeEntity(#[from] NotSupportedOverCompositeEntity),
    /// A string that must exist in the indexer was not found.
    #[error(transparent)]
    Indexer(#[from] IndexerError),
    /// The store failed to execute a query.
    #[error("failed to execute entity query")]
    Store(#[from] StoreError),
    /// The query has no aggregate and cannot be lowered to entity queries.
    #[error("query does not select any aggregates")]
    NoAggregates,
}

impl QueryError {
    pub(crate) fn incompatible(message: impl Into<String>) -> Self {
        Self::IncompatibleMetricsQuery(message.into())
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidParams(InvalidParams::new(message))
    }

    /// Returns `true` for errors caused by the request rather than the system.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidParams(_)
                | Self::IncompatibleMetricsQuery(_)
                | Self::Parse(_)
                | Self::Indexer(_)
                | Self::NoAggregates
        )
    }
}
