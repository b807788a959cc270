//! Lowering of metrics queries into entity queries.
//!
//! The [`QueryBuilder`] resolves every selected field to aggregate expressions on storage
//! entities. Raw metrics and singular entity metrics map to one expression in one entity.
//! Composite metrics are decomposed into their singular constituents, which are selected under
//! [`child_alias`]es. For every entity with at least one expression, the builder emits a totals
//! query and a series query that share conditions, group-bys and ordering.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use mq_base_schema::metrics::{EntityKey, MetricUnit};
use mq_indexer::{IndexedId, Resolver, StringKind};

use crate::config::QueryConfig;
use crate::error::{NotSupportedOverCompositeEntity, QueryError};
use crate::fields::{DerivedMetric, DerivedMetricRegistry, EntityResolution, child_alias};
use crate::granularity::{self, Granularity};
use crate::naming::resolve_raw_metric;
use crate::parser::resolve_tags;
use crate::query::{MetricField, MetricGroupBy, MetricsQuery, OrderByTarget, raw_entity};
use crate::snql::{
    AliasedExpr, Column, Condition, Direction, Expr, EntityQuery, Func, Op, OrderBy, QueryKind,
    Value,
};

/// Alias of the time bucket in series queries.
pub const BUCKETED_TIME_ALIAS: &str = "bucketed_time";

/// A singular constituent of a composite field.
#[derive(Clone, Debug, PartialEq)]
pub struct ChildField {
    /// The name of the derived metric.
    pub metric: String,
    /// The alias under which the constituent is selected.
    pub alias: String,
    /// The entity of the constituent.
    pub entity: EntityKey,
    /// The value of groups and time buckets without data.
    pub default: Option<f64>,
}

/// How the value of a planned field is computed.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldKind {
    /// An aggregate of a raw metric, selected in one entity.
    Raw {
        /// The entity of the raw metric.
        entity: EntityKey,
    },
    /// A singular entity metric, selected in one entity.
    Singular {
        /// The entity of all constituents.
        entity: EntityKey,
    },
    /// A composite metric, computed from its constituents after the query.
    Composite {
        /// Singular constituents selected in entity queries.
        children: Vec<ChildField>,
        /// Composite metrics to evaluate in order, ending with the field itself.
        dependencies: Vec<String>,
    },
}

/// A selected field and the way its value is computed.
#[derive(Clone, Debug, PartialEq)]
pub struct PlannedField {
    /// The name of the field in results.
    pub alias: String,
    /// The selected field.
    pub field: MetricField,
    /// How the value is computed.
    pub kind: FieldKind,
    /// The value of groups and time buckets without data.
    pub default: Option<f64>,
    /// The unit of the values.
    pub unit: MetricUnit,
    /// The type of the values in result meta data.
    pub meta_type: String,
}

impl PlannedField {
    /// Returns `true` if values are reported as integers.
    pub fn is_integer(&self) -> bool {
        matches!(self.meta_type.as_str(), "UInt64" | "integer")
    }

    /// Returns the entity of fields that are selected in a single entity.
    pub fn entity(&self) -> Option<EntityKey> {
        match self.kind {
            FieldKind::Raw { entity } | FieldKind::Singular { entity } => Some(entity),
            FieldKind::Composite { .. } => None,
        }
    }
}

/// The totals and series query of one entity.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EntityQueries {
    /// The query for totals, if requested.
    pub totals: Option<EntityQuery>,
    /// The query for series, if requested.
    pub series: Option<EntityQuery>,
}

/// The entity queries of a metrics query, along with everything needed to convert their results.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryPlan {
    /// Inclusive start of the range.
    pub start: DateTime<Utc>,
    /// Exclusive end of the range.
    pub end: DateTime<Utc>,
    /// The storage resolution of all entity queries.
    pub granularity: Granularity,
    /// The length of series buckets in seconds.
    pub interval: i64,
    /// Start times of all series buckets.
    pub intervals: Vec<DateTime<Utc>>,
    /// Whether totals are computed.
    pub include_totals: bool,
    /// Whether series are computed.
    pub include_series: bool,
    /// The entity that determines groups and their order.
    pub primary_entity: Option<EntityKey>,
    /// Whether groups are ordered by a field of the primary entity.
    pub ordered: bool,
    /// Queries by entity.
    pub entities: BTreeMap<EntityKey, EntityQueries>,
    /// Selected fields in the order of the request.
    pub fields: Vec<PlannedField>,
    /// Group-by columns in the order of the request.
    pub groupby: Vec<MetricGroupBy>,
    /// Order of merged groups as indexes into `groupby`, if not ordered by a field.
    pub group_order: Vec<(usize, Direction)>,
    /// The maximum number of groups in the result.
    pub limit: u64,
    /// The number of groups skipped before the first group in the result.
    pub offset: u64,
}

impl QueryPlan {
    /// Returns the entities in execution order, starting with the primary entity.
    pub fn entity_order(&self) -> Vec<EntityKey> {
        let mut order: Vec<_> = self.primary_entity.into_iter().collect();
        order.extend(
            self.entities
                .keys()
                .copied()
                .filter(|e| Some(*e) != self.primary_entity),
        );
        order
    }

    /// Returns all entity queries in execution order.
    pub fn queries(&self) -> impl Iterator<Item = &EntityQuery> {
        self.entity_order().into_iter().flat_map(move |entity| {
            let queries = self.entities.get(&entity);
            queries
                .and_then(|q| q.totals.as_ref())
                .into_iter()
                .chain(queries.and_then(|q| q.series.as_ref()))
        })
    }

    /// Renders all entity queries.
    ///
    /// Fails with [`QueryError::NoAggregates`] if no entity query selects an aggregate.
    pub fn to_snql(&self) -> Result<String, QueryError> {
        let has_aggregates = self
            .queries()
            .any(|q| q.select.iter().any(|s| s.expr.is_aggregate()));
        if !has_aggregates {
            return Err(QueryError::NoAggregates);
        }

        let mut output = String::new();
        for (index, query) in self.queries().enumerate() {
            if index > 0 {
                output.push_str("\n\n");
            }
            output.push_str(&query.to_string());
        }

        Ok(output)
    }
}

/// Expressions selected in one entity.
#[derive(Debug, Default)]
struct EntitySelect {
    select: Vec<AliasedExpr>,
    metric_ids: BTreeSet<IndexedId>,
}

impl EntitySelect {
    fn push(&mut self, expr: AliasedExpr) {
        if !self.select.iter().any(|s| s.alias == expr.alias) {
            self.select.push(expr);
        }
    }

    fn find(&self, alias: &str) -> Option<&Expr> {
        self.select
            .iter()
            .find(|s| s.alias.as_deref() == Some(alias))
            .map(|s| &s.expr)
    }
}

/// Builds a [`QueryPlan`] for a [`MetricsQuery`].
pub struct QueryBuilder<'a> {
    query: &'a MetricsQuery,
    registry: &'a DerivedMetricRegistry,
    resolver: &'a Resolver<'a>,
    config: &'a QueryConfig,
}

impl<'a> QueryBuilder<'a> {
    /// Creates a new builder.
    ///
    /// The resolver must be scoped to the organization and use case of the query.
    pub fn new(
        query: &'a MetricsQuery,
        registry: &'a DerivedMetricRegistry,
        resolver: &'a Resolver<'a>,
        config: &'a QueryConfig,
    ) -> Self {
        Self {
            query,
            registry,
            resolver,
            config,
        }
    }

    /// Lowers the query into entity queries.
    pub fn build(self) -> Result<QueryPlan, QueryError> {
        let query = self.query;
        let (start, end) = (query.start(), query.end());

        let interval = query
            .interval()
            .unwrap_or_else(|| granularity::resolve_granularity(start, end).seconds());
        let granularity = granularity::resolve_series_granularity(start, end, interval);
        let intervals = granularity::get_intervals(start, end, interval);

        let mut selects = BTreeMap::<EntityKey, EntitySelect>::new();
        let mut fields = Vec::with_capacity(query.select().len());
        for field in query.select() {
            fields.push(self.plan_field(field, &mut selects)?);
        }

        let groupby = self.groupby()?;

        let metric_orderby = query.orderby().iter().find_map(|o| match o.target {
            OrderByTarget::Field(ref field) => Some((field, o.direction)),
            OrderByTarget::GroupBy(_) => None,
        });

        let (primary_entity, metric_orderby) = match metric_orderby {
            Some((field, direction)) => {
                let planned = find_field(&fields, field)?;
                let entity = planned.entity().ok_or_else(|| NotSupportedOverCompositeEntity {
                    metric: planned.field.metric.clone(),
                    operation: "order by",
                })?;
                let expr = selects
                    .get(&entity)
                    .and_then(|s| s.find(&planned.alias))
                    .cloned()
                    .ok_or_else(|| {
                        QueryError::incompatible(format!("cannot order by {}", planned.alias))
                    })?;
                (Some(entity), Some((entity, OrderBy { expr, direction })))
            }
            None => (
                fields.iter().find_map(PlannedField::entity).or_else(|| {
                    fields.iter().find_map(|f| match f.kind {
                        FieldKind::Composite { ref children, .. } => {
                            children.first().map(|c| c.entity)
                        }
                        _ => None,
                    })
                }),
                None,
            ),
        };

        let having = self.having(&fields, &selects)?;

        let mut conditions = self.default_conditions();
        if let Some(condition) = query.where_() {
            match resolve_tags(condition, self.resolver) {
                Condition::And(children) => conditions.extend(children),
                condition => conditions.push(condition),
            }
        }

        let group_order = match metric_orderby {
            Some(_) => Vec::new(),
            None => self.group_order(&groupby),
        };

        // Without an order by field, groups of all entities are merged and paginated after the
        // query, so every entity returns its first `offset + limit` groups.
        let limit = query.limit().unwrap_or(self.config.default_limit);
        let (totals_limit, totals_offset) = match group_order.is_empty() {
            true => (limit, query.offset()),
            false => (query.offset().saturating_add(limit), 0),
        };

        let num_intervals = intervals.len() as u64;
        let series_limit = match totals_limit.saturating_mul(num_intervals) {
            limit if limit > self.config.max_points => self.config.max_points / 2,
            limit => limit,
        };
        let series_offset = match query.include_totals() {
            true => 0,
            false => totals_offset.saturating_mul(num_intervals),
        };

        let mut entities = BTreeMap::new();
        for (entity, select) in selects {
            let mut entity_conditions = conditions.clone();
            entity_conditions.push(Condition::new(
                Column::MetricId,
                Op::In,
                Expr::Tuple(select.metric_ids.iter().map(|id| Expr::value(*id)).collect()),
            ));

            let mut orderby: Vec<OrderBy> = group_order
                .iter()
                .map(|&(index, direction)| OrderBy {
                    expr: groupby[index].expr.clone(),
                    direction,
                })
                .collect();

            if let Some((orderby_entity, ref clause)) = metric_orderby {
                for o in query.orderby() {
                    match o.target {
                        OrderByTarget::Field(_) if orderby_entity == entity => {
                            orderby.push(clause.clone());
                        }
                        OrderByTarget::Field(_) => (),
                        OrderByTarget::GroupBy(ref g) => {
                            let expr = groupby
                                .iter()
                                .find(|e| e.alias.as_deref() == Some(g.alias()));
                            if let Some(expr) = expr {
                                orderby.push(OrderBy {
                                    expr: expr.expr.clone(),
                                    direction: o.direction,
                                });
                            }
                        }
                    }
                }
            }

            let base = EntityQuery {
                entity,
                kind: QueryKind::Totals,
                select: select.select,
                groupby: groupby.clone(),
                conditions: entity_conditions,
                having: having.get(&entity).cloned().unwrap_or_default(),
                orderby,
                limit: totals_limit,
                offset: totals_offset,
                granularity,
                interval,
            };

            let series = query.include_series().then(|| {
                let mut series = base.clone();
                series.kind = QueryKind::Series;
                series
                    .groupby
                    .push(Expr::Column(Column::BucketedTime).alias(BUCKETED_TIME_ALIAS));
                series.orderby.push(OrderBy {
                    expr: Column::BucketedTime.into(),
                    direction: Default::default(),
                });
                series.limit = series_limit;
                series.offset = series_offset;
                series
            });

            let totals = query.include_totals().then_some(base);
            entities.insert(entity, EntityQueries { totals, series });
        }

        mq_log::debug!(
            %granularity,
            interval,
            intervals = intervals.len(),
            entities = entities.len(),
            "planned metrics query"
        );

        Ok(QueryPlan {
            start,
            end,
            granularity,
            interval,
            intervals,
            include_totals: query.include_totals(),
            include_series: query.include_series(),
            primary_entity,
            ordered: metric_orderby.is_some(),
            entities,
            fields,
            groupby: query.groupby().to_vec(),
            group_order,
            limit,
            offset: query.offset(),
        })
    }

    /// Returns the group-by columns ordered by the request first, then all others ascending.
    fn group_order(&self, groupby: &[AliasedExpr]) -> Vec<(usize, Direction)> {
        let mut order = Vec::with_capacity(groupby.len());

        for o in self.query.orderby() {
            let OrderByTarget::GroupBy(ref g) = o.target else {
                continue;
            };
            let index = groupby
                .iter()
                .position(|e| e.alias.as_deref() == Some(g.alias()));
            if let Some(index) = index {
                if !order.iter().any(|&(i, _)| i == index) {
                    order.push((index, o.direction));
                }
            }
        }

        for index in 0..groupby.len() {
            if !order.iter().any(|&(i, _)| i == index) {
                order.push((index, Direction::Asc));
            }
        }

        order
    }

    fn plan_field(
        &self,
        field: &MetricField,
        selects: &mut BTreeMap<EntityKey, EntitySelect>,
    ) -> Result<PlannedField, QueryError> {
        let alias = field.alias();

        let Some(op) = field.op else {
            let metric = self.registry.get(&field.metric).ok_or_else(|| {
                QueryError::invalid(format!("unknown derived metric {}", field.metric))
            })?;
            return self.plan_derived(field, alias, metric, selects);
        };

        let mri = resolve_raw_metric(&field.metric)
            .ok_or_else(|| QueryError::invalid(format!("unknown metric {}", field.metric)))?;
        let entity = raw_entity(&mri)?;
        let func = op.snql_function(entity).ok_or_else(|| {
            QueryError::invalid(format!(
                "operation {op} is not supported for metric {} in {entity}",
                field.metric
            ))
        })?;

        let metric_id = self
            .resolver
            .resolve_weak(StringKind::Metric, &mri.to_string());
        let expr = Expr::call(
            func,
            [
                Column::Value.into(),
                Expr::call(Func::Equals, [Column::MetricId.into(), Expr::value(metric_id)]),
            ],
        );

        let select = selects.entry(entity).or_default();
        select.push(expr.alias(alias.clone()));
        select.metric_ids.insert(metric_id);

        let meta_type = match op.is_integer() {
            true => "UInt64",
            false => "Float64",
        };

        let unit = match op.is_integer() {
            true => MetricUnit::None,
            false => mri.unit.clone(),
        };

        Ok(PlannedField {
            alias,
            field: field.clone(),
            kind: FieldKind::Raw { entity },
            default: op.default_value(),
            unit,
            meta_type: meta_type.to_owned(),
        })
    }

    fn plan_derived(
        &self,
        field: &MetricField,
        alias: String,
        metric: &DerivedMetric,
        selects: &mut BTreeMap<EntityKey, EntitySelect>,
    ) -> Result<PlannedField, QueryError> {
        let kind = match metric.get_entity(self.registry)? {
            EntityResolution::Single(_) => {
                let entity = self.select_singular(metric, &alias, selects)?;
                FieldKind::Singular { entity }
            }
            EntityResolution::Multiple(constituents) => {
                let mut children = Vec::new();
                for name in constituents.into_values().flatten() {
                    let child = self.registry.get(&name).ok_or_else(|| {
                        QueryError::invalid(format!("unknown derived metric {name}"))
                    })?;
                    let child_alias = child_alias(&name, &alias);
                    let entity = self.select_singular(child, &child_alias, selects)?;
                    children.push(ChildField {
                        metric: name,
                        alias: child_alias,
                        entity,
                        default: child.generate_default_null_values(),
                    });
                }

                let dependencies = metric
                    .generate_bottom_up_derived_metrics_dependencies(self.registry)
                    .into_iter()
                    .map(str::to_owned)
                    .collect();

                FieldKind::Composite {
                    children,
                    dependencies,
                }
            }
        };

        Ok(PlannedField {
            alias,
            field: field.clone(),
            kind,
            default: metric.generate_default_null_values(),
            unit: metric.unit().clone(),
            meta_type: metric.meta_type().unwrap_or("Float64").to_owned(),
        })
    }

    fn select_singular(
        &self,
        metric: &DerivedMetric,
        alias: &str,
        selects: &mut BTreeMap<EntityKey, EntitySelect>,
    ) -> Result<EntityKey, QueryError> {
        let validated = metric.validate(self.registry)?;
        let entity = validated.entity();

        let select = selects.entry(entity).or_default();
        for expr in metric.generate_select_statements(self.registry, self.resolver, alias)? {
            select.push(expr);
        }
        select
            .metric_ids
            .extend(validated.metric_ids(self.resolver)?);

        Ok(entity)
    }

    fn groupby(&self) -> Result<Vec<AliasedExpr>, QueryError> {
        self.query
            .groupby()
            .iter()
            .map(|groupby| -> Result<AliasedExpr, QueryError> {
                let column = match groupby {
                    MetricGroupBy::Tag(name) => {
                        Column::TagId(self.resolver.resolve_strict(StringKind::TagKey, name)?)
                    }
                    MetricGroupBy::ProjectId => Column::ProjectId,
                };
                Ok(Expr::Column(column).alias(groupby.alias()))
            })
            .collect()
    }

    fn having(
        &self,
        fields: &[PlannedField],
        selects: &BTreeMap<EntityKey, EntitySelect>,
    ) -> Result<BTreeMap<EntityKey, Vec<Condition>>, QueryError> {
        let mut having = BTreeMap::<EntityKey, Vec<Condition>>::new();

        for condition in self.query.having() {
            let planned = find_field(fields, &condition.field)?;
            let entity = planned.entity().ok_or_else(|| NotSupportedOverCompositeEntity {
                metric: planned.field.metric.clone(),
                operation: "having",
            })?;
            let expr = selects
                .get(&entity)
                .and_then(|s| s.find(&planned.alias))
                .cloned()
                .ok_or_else(|| {
                    QueryError::incompatible(format!("cannot filter by {}", planned.alias))
                })?;

            having
                .entry(entity)
                .or_default()
                .push(Condition::new(expr, condition.op, Value::Float(condition.value)));
        }

        if having.len() > 1 && !self.config.allow_cross_entity_having {
            return Err(QueryError::incompatible(
                "having conditions on fields of different entities are not supported",
            ));
        }

        Ok(having)
    }

    fn default_conditions(&self) -> Vec<Condition> {
        let query = self.query;
        let projects = query
            .project_ids()
            .iter()
            .map(|p| Expr::value(p.value() as i64));

        vec![
            Condition::new(Column::OrgId, Op::Eq, Value::Int(query.org_id().value() as i64)),
            Condition::new(Column::ProjectId, Op::In, Expr::Tuple(projects.collect())),
            Condition::new(Column::Timestamp, Op::Gte, Value::DateTime(query.start())),
            Condition::new(Column::Timestamp, Op::Lt, Value::DateTime(query.end())),
        ]
    }
}

fn find_field<'f>(
    fields: &'f [PlannedField],
    field: &MetricField,
) -> Result<&'f PlannedField, QueryError> {
    let alias = field.alias();
    fields
        .iter()
        .find(|f| f.alias == alias)
        .ok_or_else(|| QueryError::incompatible(format!("{alias} is not selected")))
}

#[cfg(test)]
mod tests {
    use mq_base_schema::metrics::UseCaseId;
    use mq_base_schema::project::{OrganizationId, ProjectId};
    use mq_indexer::MemoryIndexer;
    use mq_test::datetime;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::query::{HavingParam, QueryParams};

    const ORG: OrganizationId = OrganizationId::new(1);

    struct Fixture {
        indexer: MemoryIndexer,
        registry: DerivedMetricRegistry,
        config: QueryConfig,
    }

    impl Fixture {
        fn new(use_case: UseCaseId, strings: &[(StringKind, &str)]) -> Self {
            let indexer = MemoryIndexer::new();
            for (kind, string) in strings {
                indexer.record(use_case, ORG, *kind, string);
            }

            Self {
                indexer,
                registry: DerivedMetricRegistry::builtin(),
                config: QueryConfig::default(),
            }
        }

        fn plan(&self, params: QueryParams) -> Result<QueryPlan, QueryError> {
            let query = MetricsQuery::new(params, &self.registry, &self.config)?;
            let resolver = Resolver::new(&self.indexer, query.use_case(), query.org_id());
            QueryBuilder::new(&query, &self.registry, &resolver, &self.config).build()
        }
    }

    fn params(use_case: UseCaseId, fields: &[&str]) -> QueryParams {
        let mut params = QueryParams::new(
            ORG,
            vec![ProjectId::new(1)],
            use_case,
            datetime(2021, 8, 25, 0, 0, 0),
            datetime(2021, 8, 26, 0, 0, 0),
        );
        params.fields = fields.iter().map(|f| (*f).to_owned()).collect();
        params.interval = Some(3600);
        params
    }

    fn transactions() -> Fixture {
        Fixture::new(
            UseCaseId::Transactions,
            &[
                (StringKind::Metric, "d:transactions/duration@millisecond"),
                (StringKind::TagKey, "transaction"),
                (StringKind::TagKey, "transaction.status"),
                (StringKind::TagValue, "ok"),
                (StringKind::TagValue, "cancelled"),
                (StringKind::TagValue, "unknown"),
                (StringKind::TagValue, "/foo"),
            ],
        )
    }

    fn sessions() -> Fixture {
        Fixture::new(
            UseCaseId::Sessions,
            &[
                (StringKind::Metric, "c:sessions/session@none"),
                (StringKind::Metric, "s:sessions/error@none"),
                (StringKind::TagKey, "session.status"),
                (StringKind::TagValue, "crashed"),
                (StringKind::TagValue, "abnormal"),
                (StringKind::TagValue, "errored_preaggr"),
            ],
        )
    }

    #[test]
    fn test_raw_field_queries() {
        mq_test::setup();

        let fixture = transactions();
        let mut params = params(UseCaseId::Transactions, &["p95(transaction.duration)", "count()"]);
        params.groupby = vec!["transaction".to_owned()];
        params.orderby = vec!["-count()".to_owned()];
        params.query = "transaction:/foo".to_owned();

        let plan = fixture.plan(params).unwrap();
        assert_eq!(plan.granularity, Granularity::Hour);
        assert_eq!(plan.intervals.len(), 24);
        assert_eq!(plan.primary_entity, Some(EntityKey::Distributions));

        insta::assert_snapshot!(plan.to_snql().unwrap(), @r###"
        MATCH (metrics_distributions)
        SELECT quantileIf(0.95)(value, equals(metric_id, 1)) AS `p95(transaction.duration)`, countIf(value, equals(metric_id, 1)) AS `count()`
        BY tags[1] AS `transaction`
        WHERE org_id = 1 AND project_id IN (1) AND timestamp >= toDateTime('2021-08-25T00:00:00') AND timestamp < toDateTime('2021-08-26T00:00:00') AND tags[1] = 4 AND metric_id IN (1)
        ORDER BY countIf(value, equals(metric_id, 1)) DESC
        LIMIT 50
        OFFSET 0
        GRANULARITY 3600

        MATCH (metrics_distributions)
        SELECT quantileIf(0.95)(value, equals(metric_id, 1)) AS `p95(transaction.duration)`, countIf(value, equals(metric_id, 1)) AS `count()`
        BY tags[1] AS `transaction`, bucketed_time AS `bucketed_time`
        WHERE org_id = 1 AND project_id IN (1) AND timestamp >= toDateTime('2021-08-25T00:00:00') AND timestamp < toDateTime('2021-08-26T00:00:00') AND tags[1] = 4 AND metric_id IN (1)
        ORDER BY countIf(value, equals(metric_id, 1)) DESC, bucketed_time ASC
        LIMIT 1200
        OFFSET 0
        GRANULARITY 3600
        INTERVAL 3600
        "###);
    }

    #[test]
    fn test_derived_field_query() {
        let fixture = transactions();
        let params = params(UseCaseId::Transactions, &["failure_rate()"]);
        let plan = fixture.plan(params).unwrap();

        let totals = plan.entities[&EntityKey::Distributions].totals.as_ref().unwrap();
        insta::assert_snapshot!(totals.select[0], @"divide(countIf(value, and(equals(metric_id, 1), notIn(tags[2], (1, 2, 3)))), countIf(value, equals(metric_id, 1))) AS `failure_rate()`");
        assert_eq!(plan.fields[0].default, None);
        assert_eq!(plan.fields[0].meta_type, "percentage");
    }

    #[test]
    fn test_composite_field() {
        let fixture = sessions();
        let params = params(UseCaseId::Sessions, &["session.errored"]);
        let plan = fixture.plan(params).unwrap();

        assert_eq!(
            plan.entities.keys().copied().collect::<Vec<_>>(),
            vec![EntityKey::Counters, EntityKey::Sets]
        );

        let FieldKind::Composite {
            ref children,
            ref dependencies,
        } = plan.fields[0].kind
        else {
            panic!("expected composite field");
        };

        assert_eq!(
            children.iter().map(|c| c.alias.as_str()).collect::<Vec<_>>(),
            vec![
                "session.errored_preaggregated__CHILD_OF__session.errored",
                "session.crashed_and_abnormal__CHILD_OF__session.errored",
                "session.errored_set__CHILD_OF__session.errored",
            ]
        );
        assert_eq!(
            dependencies,
            &vec!["session.errored_all".to_owned(), "session.errored".to_owned()]
        );

        let sets = plan.entities[&EntityKey::Sets].totals.as_ref().unwrap();
        insta::assert_snapshot!(sets.select[0], @"uniqIf(value, equals(metric_id, 2)) AS `session.errored_set__CHILD_OF__session.errored`");
    }

    #[test]
    fn test_orderby_composite() {
        let fixture = sessions();
        let mut params = params(UseCaseId::Sessions, &["session.errored"]);
        params.orderby = vec!["session.errored".to_owned()];

        assert!(matches!(
            fixture.plan(params),
            Err(QueryError::NotSupportedOverCompositeEntity(_))
        ));
    }

    #[test]
    fn test_series_limit() {
        let fixture = transactions();
        let mut params = params(UseCaseId::Transactions, &["count()"]);
        params.interval = Some(60);
        params.limit = Some(100);

        let plan = fixture.plan(params).unwrap();
        let series = plan.entities[&EntityKey::Distributions].series.as_ref().unwrap();
        assert_eq!(plan.granularity, Granularity::Minute);
        assert_eq!(plan.intervals.len(), 1440);
        assert_eq!(series.limit, 5000);
    }

    #[test]
    fn test_unknown_groupby_tag() {
        let fixture = transactions();
        let mut params = params(UseCaseId::Transactions, &["count()"]);
        params.groupby = vec!["release".to_owned()];

        assert_eq!(
            fixture.plan(params).unwrap_err().to_string(),
            "tag \"release\" does not exist"
        );
    }

    #[test]
    fn test_cross_entity_having() {
        let fixture = sessions();
        let mut params = params(UseCaseId::Sessions, &["session.all", "session.errored_set"]);
        params.having = vec![
            HavingParam {
                field: "session.all".to_owned(),
                op: Op::Gt,
                value: 1.0,
            },
            HavingParam {
                field: "session.errored_set".to_owned(),
                op: Op::Gt,
                value: 1.0,
            },
        ];

        assert!(matches!(
            fixture.plan(params.clone()),
            Err(QueryError::IncompatibleMetricsQuery(_))
        ));

        let mut fixture = fixture;
        fixture.config.allow_cross_entity_having = true;
        let plan = fixture.plan(params).unwrap();
        assert_eq!(plan.entities[&EntityKey::Sets].totals.as_ref().unwrap().having.len(), 1);
    }

    #[test]
    fn test_paginate_merged_groups() {
        let fixture = transactions();
        let mut params = params(UseCaseId::Transactions, &["count()"]);
        params.groupby = vec!["transaction.status".to_owned(), "transaction".to_owned()];
        params.orderby = vec!["-transaction".to_owned()];
        params.limit = Some(5);
        params.offset = 10;

        let plan = fixture.plan(params).unwrap();
        assert!(!plan.ordered);
        assert_eq!(plan.group_order, vec![(1, Direction::Desc), (0, Direction::Asc)]);
        assert_eq!((plan.limit, plan.offset), (5, 10));

        let queries = &plan.entities[&EntityKey::Distributions];
        let totals = queries.totals.as_ref().unwrap();
        assert_eq!((totals.limit, totals.offset), (15, 0));
        insta::assert_snapshot!(
            totals.orderby.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "),
            @"tags[1] DESC, tags[2] ASC"
        );

        let series = queries.series.as_ref().unwrap();
        assert_eq!((series.limit, series.offset), (360, 0));
    }

    #[test]
    fn test_no_aggregates() {
        let fixture = transactions();
        let mut params = params(UseCaseId::Transactions, &["transaction"]);
        params.groupby = vec!["transaction".to_owned()];

        let plan = fixture.plan(params).unwrap();
        assert!(matches!(plan.to_snql(), Err(QueryError::NoAggregates)));
    }

    #[test]
    fn test_resolver_memoization() {
        let fixture = transactions();
        let params = params(
            UseCaseId::Transactions,
            &["p50(transaction.duration)", "p95(transaction.duration)", "count()"],
        );

        let query = MetricsQuery::new(params, &fixture.registry, &fixture.config).unwrap();
        let resolver = Resolver::new(&fixture.indexer, query.use_case(), query.org_id());
        QueryBuilder::new(&query, &fixture.registry, &resolver, &fixture.config)
            .build()
            .unwrap();

        assert_eq!(fixture.indexer.resolve_calls(), 1);
    }
}
