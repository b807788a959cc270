//! Planning and execution of metrics queries.
//!
//! A metrics query selects aggregates of raw metrics and derived metrics over a time range,
//! optionally grouped by tags and filtered with a tag query. Raw metrics are stored in one of
//! several storage entities depending on their type, so a single query may touch multiple
//! entities. This crate lowers queries into entity queries, executes them against a
//! [`MetricsStore`] and merges the results.
//!
//! # Architecture
//!
//!  1. [`MetricsQuery::new`] parses field expressions with [`parse_field`] and the tag filter
//!     with [`parse_query`], and validates the combination of fields, group-bys and ordering.
//!  2. The [`QueryBuilder`] resolves tag names to indexed ids, decomposes derived metrics from
//!     the [`DerivedMetricRegistry`], and chooses the [`Granularity`] and intervals. The result
//!     is a [`QueryPlan`] with a totals and a series [`EntityQuery`] per entity.
//!  3. The entity queries are executed by a [`MetricsStore`], such as the [`MemoryStore`].
//!  4. The [`ResultConverter`] merges rows of all entities into [`Group`]s, fills gaps in series
//!     and computes composite metrics.
//!
//! [`run_metrics_query`] runs all of these steps.
//!
//! # Example
//!
//! ```
//! use mq_base_schema::metrics::UseCaseId;
//! use mq_base_schema::project::{OrganizationId, ProjectId};
//! use mq_indexer::MemoryIndexer;
//! use mq_query::{
//!     Bucket, BucketValue, DerivedMetricRegistry, MemoryStore, MetricsQuery, QueryConfig,
//!     QueryParams, Value, run_metrics_query,
//! };
//!
//! let org_id = OrganizationId::new(1);
//! let start = mq_test::datetime(2021, 8, 25, 0, 0, 0);
//! let end = mq_test::datetime(2021, 8, 26, 0, 0, 0);
//!
//! let indexer = MemoryIndexer::new();
//! let store = MemoryStore::new();
//! let bucket = Bucket::new(
//!     org_id,
//!     ProjectId::new(1),
//!     start,
//!     "d:transactions/duration@millisecond",
//!     BucketValue::Distribution(vec![150.0, 50.0]),
//! );
//! store.record(&indexer, bucket).unwrap();
//!
//! let mut params = QueryParams::new(org_id, vec![ProjectId::new(1)], UseCaseId::Transactions, start, end);
//! params.fields = vec!["avg(transaction.duration)".to_owned()];
//!
//! let registry = DerivedMetricRegistry::builtin();
//! let config = QueryConfig::default();
//! let query = MetricsQuery::new(params, &registry, &config).unwrap();
//! let result = run_metrics_query(&query, &registry, &indexer, &store, &config).unwrap();
//!
//! assert_eq!(result.groups[0].totals["avg(transaction.duration)"], Value::Float(100.0));
//! ```

#![warn(missing_docs)]

mod builder;
mod config;
mod converter;
mod error;
mod execute;
mod fields;
mod granularity;
mod naming;
mod parser;
mod query;
mod snql;
mod store;

pub use self::builder::*;
pub use self::config::*;
pub use self::converter::*;
pub use self::error::*;
pub use self::execute::*;
pub use self::fields::*;
pub use self::granularity::*;
pub use self::naming::*;
pub use self::parser::*;
pub use self::query::*;
pub use self::snql::*;
pub use self::store::*;
