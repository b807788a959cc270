//! Resolution of metric names, tag keys and tag values to indexed integer ids.
//!
//! The backing store does not persist strings. Instead, every string is replaced by an integer id
//! that is unique within an organization and a [`UseCaseId`](mq_base_schema::metrics::UseCaseId).
//! This crate defines the [`StringIndexer`] interface for such a mapping, an in-memory
//! implementation in [`MemoryIndexer`], and the request-scoped [`Resolver`] that memoizes lookups
//! while a single query is built.
//!
//! # Example
//!
//! ```
//! use mq_base_schema::metrics::UseCaseId;
//! use mq_base_schema::project::OrganizationId;
//! use mq_indexer::{MemoryIndexer, Resolver, StringKind, STRING_NOT_FOUND};
//!
//! let org_id = OrganizationId::new(1);
//! let indexer = MemoryIndexer::new();
//! let id = indexer.record(UseCaseId::Sessions, org_id, StringKind::TagKey, "release");
//!
//! let resolver = Resolver::new(&indexer, UseCaseId::Sessions, org_id);
//! assert_eq!(resolver.resolve_weak(StringKind::TagKey, "release"), id);
//! assert_eq!(resolver.resolve_weak(StringKind::TagKey, "environment"), STRING_NOT_FOUND);
//! ```

#![warn(missing_docs)]

mod error;
mod memory;
mod resolver;

pub use self::error::*;
pub use self::memory::*;
pub use self::resolver::*;

use std::fmt;

use mq_base_schema::metrics::UseCaseId;
use mq_base_schema::project::OrganizationId;

/// An indexed string.
pub type IndexedId = i64;

/// Sentinel id used in queries for strings that have never been indexed.
///
/// Filtering on this id matches no rows, which is the expected result for unknown strings.
pub const STRING_NOT_FOUND: IndexedId = -1;

/// The namespace of an indexed string.
///
/// Metric names, tag keys and tag values are indexed independently. The same string can map to
/// different ids depending on its kind.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum StringKind {
    /// The MRI of a metric.
    Metric,
    /// The key of a tag.
    TagKey,
    /// The value of a tag.
    TagValue,
}

impl StringKind {
    /// Returns the name of this kind for logs and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Metric => "metric",
            Self::TagKey => "tag key",
            Self::TagValue => "tag value",
        }
    }
}

impl fmt::Display for StringKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bidirectional mapping between strings and indexed ids.
///
/// Implementations must be consistent: if `resolve` returns an id, `reverse_resolve` of that id
/// returns the original string within the same use case, organization and kind.
pub trait StringIndexer {
    /// Looks up the id of a string.
    ///
    /// Returns `None` if the string has not been indexed.
    fn resolve(
        &self,
        use_case: UseCaseId,
        org_id: OrganizationId,
        kind: StringKind,
        string: &str,
    ) -> Option<IndexedId>;

    /// Looks up the string of an id.
    ///
    /// Returns `None` if no string with this id exists.
    fn reverse_resolve(
        &self,
        use_case: UseCaseId,
        org_id: OrganizationId,
        kind: StringKind,
        id: IndexedId,
    ) -> Option<String>;
}

impl<T: StringIndexer + ?Sized> StringIndexer for &T {
    fn resolve(
        &self,
        use_case: UseCaseId,
        org_id: OrganizationId,
        kind: StringKind,
        string: &str,
    ) -> Option<IndexedId> {
        (**self).resolve(use_case, org_id, kind, string)
    }

    fn reverse_resolve(
        &self,
        use_case: UseCaseId,
        org_id: OrganizationId,
        kind: StringKind,
        id: IndexedId,
    ) -> Option<String> {
        (**self).reverse_resolve(use_case, org_id, kind, id)
    }
}
