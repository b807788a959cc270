use thiserror::Error;

/// An error returned by strict resolution of strings.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum IndexerError {
    /// The metric name has never been indexed.
    #[error("metric {0:?} does not exist")]
    MetricNotFound(String),
    /// The tag key has never been indexed.
    #[error("tag {0:?} does not exist")]
    TagNotFound(String),
    /// The tag value has never been indexed.
    #[error("tag value {0:?} does not exist")]
    TagValueNotFound(String),
}
