//! Execution of metrics queries against a [`MetricsStore`].

use std::collections::BTreeMap;

use itertools::Itertools;
use mq_base_schema::metrics::EntityKey;
use mq_indexer::{Resolver, StringIndexer};

use crate::builder::{QueryBuilder, QueryPlan};
use crate::config::QueryConfig;
use crate::converter::{EntityRows, MetricsQueryResult, ResultConverter, group_key};
use crate::error::QueryError;
use crate::fields::DerivedMetricRegistry;
use crate::query::MetricsQuery;
use crate::snql::{EntityQuery, Value};
use crate::store::{MetricsStore, Row};

/// Builds, executes and converts a metrics query.
///
/// Entity queries run sequentially, starting with the primary entity. If the query is ordered by
/// a field, the queries of all other entities are restricted to the groups returned by the
/// primary entity. Series queries are restricted to the groups of the totals query of the same
/// entity, and are skipped if it returned no groups.
///
/// A single resolver is used for building the query and converting its results, so every string
/// is looked up at most once.
pub fn run_metrics_query(
    query: &MetricsQuery,
    registry: &DerivedMetricRegistry,
    indexer: &dyn StringIndexer,
    store: &dyn MetricsStore,
    config: &QueryConfig,
) -> Result<MetricsQueryResult, QueryError> {
    let resolver = Resolver::new(indexer, query.use_case(), query.org_id());
    let plan = QueryBuilder::new(query, registry, &resolver, config).build()?;

    if plan.entities.is_empty() {
        return Err(QueryError::NoAggregates);
    }

    let results = execute_plan(&plan, store)?;
    Ok(ResultConverter::new(&plan, registry, &resolver).convert(&results))
}

/// Executes all entity queries of a plan.
pub fn execute_plan(
    plan: &QueryPlan,
    store: &dyn MetricsStore,
) -> Result<BTreeMap<EntityKey, EntityRows>, QueryError> {
    let restrict = !plan.groupby.is_empty();
    let mut primary_groups = None::<Vec<Vec<Value>>>;
    let mut results = BTreeMap::new();

    for entity in plan.entity_order() {
        let Some(queries) = plan.entities.get(&entity) else {
            continue;
        };

        let is_primary = plan.primary_entity == Some(entity);
        let entity_groups = match (plan.ordered && !is_primary, &primary_groups) {
            (true, Some(groups)) => Some(groups.as_slice()),
            _ => None,
        };

        let mut rows = EntityRows::default();
        if let Some(ref query) = queries.totals {
            rows.totals = execute_restricted(store, query, entity_groups)?;
        }

        if let Some(ref query) = queries.series {
            let totals_groups;
            let series_groups = match queries.totals.is_some() && restrict {
                true => {
                    totals_groups = groups_of(&rows.totals, plan);
                    Some(totals_groups.as_slice())
                }
                false => entity_groups,
            };
            rows.series = execute_restricted(store, query, series_groups)?;
        }

        if is_primary && plan.ordered && restrict {
            let primary_rows = match queries.totals.is_some() {
                true => &rows.totals,
                false => &rows.series,
            };
            primary_groups = Some(groups_of(primary_rows, plan));
        }

        results.insert(entity, rows);
    }

    Ok(results)
}

fn groups_of(rows: &[Row], plan: &QueryPlan) -> Vec<Vec<Value>> {
    rows.iter()
        .map(|row| group_key(row, &plan.groupby))
        .unique()
        .collect()
}

fn execute_restricted(
    store: &dyn MetricsStore,
    query: &EntityQuery,
    groups: Option<&[Vec<Value>]>,
) -> Result<Vec<Row>, QueryError> {
    let rows = match groups {
        None => store.execute(query)?,
        Some([]) => {
            mq_log::trace!(entity = %query.entity, "skipped entity query without groups");
            return Ok(Vec::new());
        }
        Some(groups) => {
            let mut query = query.clone();
            query.restrict_to_groups(groups);
            query.offset = 0;
            mq_log::trace!(%query, "executing restricted entity query");
            store.execute(&query)?
        }
    };

    mq_log::debug!(
        entity = %query.entity,
        kind = ?query.kind,
        rows = rows.len(),
        "executed entity query"
    );

    Ok(rows)
}
