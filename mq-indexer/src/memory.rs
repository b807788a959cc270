use std::sync::atomic::{AtomicUsize, Ordering};

use hashbrown::HashMap;
use mq_base_schema::metrics::UseCaseId;
use mq_base_schema::project::OrganizationId;
use parking_lot::RwLock;

use crate::{IndexedId, StringIndexer, StringKind};

/// The scope in which ids are unique.
type Scope = (UseCaseId, OrganizationId, StringKind);

/// An in-memory [`StringIndexer`].
///
/// Strings are assigned sequential ids starting at `1` in the order they are recorded, separately
/// for every use case, organization and [`StringKind`]. The indexer can be shared across threads.
#[derive(Debug, Default)]
pub struct MemoryIndexer {
    inner: RwLock<Inner>,
    resolve_calls: AtomicUsize,
}

impl MemoryIndexer {
    /// Creates an empty indexer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes a string and returns its id.
    ///
    /// Recording a string that is already indexed returns the existing id.
    pub fn record(
        &self,
        use_case: UseCaseId,
        org_id: OrganizationId,
        kind: StringKind,
        string: &str,
    ) -> IndexedId {
        let scope = (use_case, org_id, kind);
        let mut inner = self.inner.write();

        if let Some(id) = inner.get(scope, string) {
            return id;
        }

        let scoped = inner.scopes.entry(scope).or_default();
        scoped.last_id += 1;
        let id = scoped.last_id;
        scoped.forward.insert(string.to_owned(), id);
        scoped.reverse.insert(id, string.to_owned());

        mq_log::trace!(%use_case, %kind, string, id, "indexed string");
        id
    }

    /// Indexes all strings of the same kind at once.
    pub fn bulk_record<'s>(
        &self,
        use_case: UseCaseId,
        org_id: OrganizationId,
        kind: StringKind,
        strings: impl IntoIterator<Item = &'s str>,
    ) -> Vec<IndexedId> {
        strings
            .into_iter()
            .map(|string| self.record(use_case, org_id, kind, string))
            .collect()
    }

    /// Returns the number of times [`StringIndexer::resolve`] has been called.
    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::Relaxed)
    }
}

impl StringIndexer for MemoryIndexer {
    fn resolve(
        &self,
        use_case: UseCaseId,
        org_id: OrganizationId,
        kind: StringKind,
        string: &str,
    ) -> Option<IndexedId> {
        self.resolve_calls.fetch_add(1, Ordering::Relaxed);
        self.inner.read().get((use_case, org_id, kind), string)
    }

    fn reverse_resolve(
        &self,
        use_case: UseCaseId,
        org_id: OrganizationId,
        kind: StringKind,
        id: IndexedId,
    ) -> Option<String> {
        let inner = self.inner.read();
        let scoped = inner.scopes.get(&(use_case, org_id, kind))?;
        scoped.reverse.get(&id).cloned()
    }
}

/// Critical section of the [`MemoryIndexer`].
#[derive(Debug, Default)]
struct Inner {
    scopes: HashMap<Scope, ScopedStrings>,
}

impl Inner {
    fn get(&self, scope: Scope, string: &str) -> Option<IndexedId> {
        self.scopes.get(&scope)?.forward.get(string).copied()
    }
}

/// Strings of a single scope.
#[derive(Debug, Default)]
struct ScopedStrings {
    forward: HashMap<String, IndexedId>,
    reverse: HashMap<IndexedId, String>,
    last_id: IndexedId,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORG: OrganizationId = OrganizationId::new(1);

    #[test]
    fn test_sequential_ids_per_scope() {
        let indexer = MemoryIndexer::new();

        let a = indexer.record(UseCaseId::Sessions, ORG, StringKind::TagKey, "release");
        let b = indexer.record(UseCaseId::Sessions, ORG, StringKind::TagKey, "environment");
        let c = indexer.record(UseCaseId::Sessions, ORG, StringKind::TagValue, "release");
        let d = indexer.record(UseCaseId::Transactions, ORG, StringKind::TagKey, "release");

        assert_eq!((a, b, c, d), (1, 2, 1, 1));
        assert_eq!(
            indexer.record(UseCaseId::Sessions, ORG, StringKind::TagKey, "release"),
            1
        );
    }

    #[test]
    fn test_reverse_resolve() {
        let indexer = MemoryIndexer::new();
        let ids = indexer.bulk_record(
            UseCaseId::Sessions,
            ORG,
            StringKind::TagValue,
            ["crashed", "init"],
        );

        assert_eq!(
            indexer.reverse_resolve(UseCaseId::Sessions, ORG, StringKind::TagValue, ids[1]),
            Some("init".to_owned())
        );
        assert_eq!(
            indexer.reverse_resolve(UseCaseId::Sessions, ORG, StringKind::TagKey, ids[1]),
            None
        );
        assert_eq!(
            indexer.reverse_resolve(
                UseCaseId::Sessions,
                OrganizationId::new(2),
                StringKind::TagValue,
                ids[1]
            ),
            None
        );
    }

    #[test]
    fn test_counts_resolve_calls() {
        let indexer = MemoryIndexer::new();
        indexer.resolve(UseCaseId::Sessions, ORG, StringKind::Metric, "a");
        indexer.resolve(UseCaseId::Sessions, ORG, StringKind::Metric, "a");
        assert_eq!(indexer.resolve_calls(), 2);
    }
}
