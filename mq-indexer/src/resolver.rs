use std::cell::RefCell;

use hashbrown::HashMap;
use mq_base_schema::metrics::UseCaseId;
use mq_base_schema::project::OrganizationId;

use crate::{IndexedId, IndexerError, STRING_NOT_FOUND, StringIndexer, StringKind};

/// Request-scoped resolution of strings for a single organization and use case.
///
/// Every distinct lookup is forwarded to the underlying [`StringIndexer`] at most once for the
/// lifetime of the resolver. This includes misses, so a string that is not indexed is not looked
/// up again either. The memoization table is not synchronized. Create one resolver per query
/// build and drop it afterwards.
pub struct Resolver<'a> {
    indexer: &'a dyn StringIndexer,
    use_case: UseCaseId,
    org_id: OrganizationId,
    forward: RefCell<HashMap<(StringKind, String), Option<IndexedId>>>,
    reverse: RefCell<HashMap<(StringKind, IndexedId), Option<String>>>,
}

impl<'a> Resolver<'a> {
    /// Creates a resolver scoped to an organization and use case.
    pub fn new(indexer: &'a dyn StringIndexer, use_case: UseCaseId, org_id: OrganizationId) -> Self {
        Self {
            indexer,
            use_case,
            org_id,
            forward: RefCell::default(),
            reverse: RefCell::default(),
        }
    }

    /// Returns the use case of this resolver.
    pub fn use_case(&self) -> UseCaseId {
        self.use_case
    }

    /// Returns the organization of this resolver.
    pub fn org_id(&self) -> OrganizationId {
        self.org_id
    }

    /// Resolves a string, returning `None` if it is not indexed.
    pub fn resolve(&self, kind: StringKind, string: &str) -> Option<IndexedId> {
        if let Some(cached) = self.forward.borrow().get(&(kind, string.to_owned())) {
            return *cached;
        }

        let id = self
            .indexer
            .resolve(self.use_case, self.org_id, kind, string);

        if id.is_none() {
            mq_log::trace!(use_case = %self.use_case, %kind, string, "string not indexed");
        }

        self.forward
            .borrow_mut()
            .insert((kind, string.to_owned()), id);
        id
    }

    /// Resolves a string, returning [`STRING_NOT_FOUND`] if it is not indexed.
    pub fn resolve_weak(&self, kind: StringKind, string: &str) -> IndexedId {
        self.resolve(kind, string).unwrap_or(STRING_NOT_FOUND)
    }

    /// Resolves a string, failing if it is not indexed.
    pub fn resolve_strict(&self, kind: StringKind, string: &str) -> Result<IndexedId, IndexerError> {
        self.resolve(kind, string).ok_or_else(|| {
            let string = string.to_owned();
            match kind {
                StringKind::Metric => IndexerError::MetricNotFound(string),
                StringKind::TagKey => IndexerError::TagNotFound(string),
                StringKind::TagValue => IndexerError::TagValueNotFound(string),
            }
        })
    }

    /// Returns the string of an indexed id.
    pub fn reverse(&self, kind: StringKind, id: IndexedId) -> Option<String> {
        if let Some(cached) = self.reverse.borrow().get(&(kind, id)) {
            return cached.clone();
        }

        let string = match id {
            STRING_NOT_FOUND => None,
            _ => self
                .indexer
                .reverse_resolve(self.use_case, self.org_id, kind, id),
        };

        self.reverse.borrow_mut().insert((kind, id), string.clone());
        string
    }
}

impl std::fmt::Debug for Resolver<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("use_case", &self.use_case)
            .field("org_id", &self.org_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use crate::MemoryIndexer;

    use super::*;

    const ORG: OrganizationId = OrganizationId::new(1);

    fn indexer() -> MemoryIndexer {
        let indexer = MemoryIndexer::new();
        indexer.record(UseCaseId::Transactions, ORG, StringKind::TagKey, "transaction");
        indexer.record(UseCaseId::Transactions, ORG, StringKind::TagValue, "/foo");
        indexer.record(
            UseCaseId::Transactions,
            ORG,
            StringKind::Metric,
            "d:transactions/duration@millisecond",
        );
        indexer
    }

    #[test]
    fn test_memoizes_hits_and_misses() {
        mq_test::setup();
        let indexer = indexer();
        let resolver = Resolver::new(&indexer, UseCaseId::Transactions, ORG);

        for _ in 0..3 {
            assert_eq!(resolver.resolve_weak(StringKind::TagKey, "transaction"), 1);
            assert_eq!(
                resolver.resolve_weak(StringKind::TagKey, "environment"),
                STRING_NOT_FOUND
            );
        }

        assert_eq!(indexer.resolve_calls(), 2);
    }

    #[test]
    fn test_kinds_are_separate_namespaces() {
        let indexer = indexer();
        let resolver = Resolver::new(&indexer, UseCaseId::Transactions, ORG);

        assert_eq!(resolver.resolve(StringKind::TagValue, "/foo"), Some(1));
        assert_eq!(resolver.resolve(StringKind::TagKey, "/foo"), None);
        assert_eq!(indexer.resolve_calls(), 2);
    }

    #[test]
    fn test_resolve_strict() {
        let indexer = indexer();
        let resolver = Resolver::new(&indexer, UseCaseId::Transactions, ORG);

        assert_eq!(
            resolver.resolve_strict(StringKind::Metric, "d:transactions/duration@millisecond"),
            Ok(1)
        );
        assert_eq!(
            resolver.resolve_strict(StringKind::Metric, "c:transactions/count@none"),
            Err(IndexerError::MetricNotFound(
                "c:transactions/count@none".to_owned()
            ))
        );
        assert_eq!(
            resolver.resolve_strict(StringKind::TagKey, "release"),
            Err(IndexerError::TagNotFound("release".to_owned()))
        );
        assert_eq!(
            resolver.resolve_strict(StringKind::TagValue, "/bar"),
            Err(IndexerError::TagValueNotFound("/bar".to_owned()))
        );
    }

    #[test]
    fn test_reverse() {
        let indexer = indexer();
        let resolver = Resolver::new(&indexer, UseCaseId::Transactions, ORG);
        let other_use_case = Resolver::new(&indexer, UseCaseId::Sessions, ORG);

        assert_eq!(
            resolver.reverse(StringKind::TagValue, 1).as_deref(),
            Some("/foo")
        );
        assert_eq!(resolver.reverse(StringKind::TagValue, STRING_NOT_FOUND), None);
        assert_eq!(other_use_case.reverse(StringKind::TagValue, 1), None);
    }
}
