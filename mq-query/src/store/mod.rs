//! Execution of entity queries.
//!
//! The planner does not store metrics itself. Entity queries are executed by a [`MetricsStore`],
//! which returns one [`Row`] per group keyed by the aliases of the select and group-by lists.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::snql::{EntityQuery, Value};

mod memory;

pub use self::memory::*;

/// A result row, keyed by alias.
pub type Row = BTreeMap<String, Value>;

/// An error returned by a [`MetricsStore`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StoreError {
    /// The store cannot evaluate an expression.
    #[error("unsupported expression {0}")]
    UnsupportedExpression(String),
    /// A recorded metric is invalid.
    #[error("invalid metric {0:?}")]
    InvalidMetric(String),
    /// A query references a tag by name instead of its indexed id.
    #[error("unresolved column {0:?}")]
    UnresolvedColumn(String),
}

/// A store that executes entity queries.
pub trait MetricsStore {
    /// Executes the query and returns its rows.
    ///
    /// Returns no rows if no data matches the conditions of the query.
    fn execute(&self, query: &EntityQuery) -> Result<Vec<Row>, StoreError>;
}

impl<T: MetricsStore + ?Sized> MetricsStore for &T {
    fn execute(&self, query: &EntityQuery) -> Result<Vec<Row>, StoreError> {
        (**self).execute(query)
    }
}
