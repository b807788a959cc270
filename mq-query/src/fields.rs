//! Derived metrics and their registry.
//!
//! A derived metric is a named formula over other metrics. There are two kinds:
//!
//!  - [`SingularEntityDerivedMetric`]s are computed by a single expression on one storage entity,
//!    for example the crash rate of sessions from the `session` counter.
//!  - [`CompositeEntityDerivedMetric`]s combine other derived metrics that may live in different
//!    entities. They cannot be selected directly. The query builder selects their singular
//!    constituents under [`child_alias`]es, and the result converter combines the values with a
//!    [`PostQueryFunction`].
//!
//! The [`DerivedMetricRegistry`] holds all derived metrics. It is immutable and passed explicitly
//! to the query builder and result converter.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use hashbrown::{HashMap, HashSet};
use indexmap::IndexMap;
use mq_base_schema::metrics::{EntityKey, FractionUnit, MetricUnit};
use mq_indexer::{IndexedId, Resolver, StringKind};

use crate::error::{DerivedMetricParseError, NotSupportedOverCompositeEntity, QueryError};
use crate::naming::resolve_raw_metric;
use crate::snql::{AliasedExpr, Column, Direction, Expr, Func, OrderBy};

/// Tag that holds the status of a session.
const SESSION_STATUS_TAG: &str = "session.status";

/// Tag that holds the status of a transaction.
const TRANSACTION_STATUS_TAG: &str = "transaction.status";

/// Returns the alias under which a constituent of a composite metric is selected.
pub fn child_alias(constituent: &str, parent_alias: &str) -> String {
    format!("{constituent}__CHILD_OF__{parent_alias}")
}

/// Generators of query expressions for singular entity metrics.
///
/// Variants without arguments aggregate the raw constituents of the metric. The arithmetic
/// variants combine expressions of other singular entity metrics, which are referenced with
/// [`SnqlFunction::Metric`].
#[derive(Clone, Debug, PartialEq)]
pub enum SnqlFunction {
    /// Sum of the counter for sessions with one of the given statuses.
    SessionSum {
        /// Values of the `session.status` tag.
        statuses: Vec<String>,
    },
    /// Unique values of the set, optionally only for sessions with one of the given statuses.
    SessionUniq {
        /// Values of the `session.status` tag.
        statuses: Option<Vec<String>>,
    },
    /// Unique values of the set.
    MetricUniq,
    /// Number of transactions, excluding transactions with one of the given statuses.
    TransactionCount {
        /// Values of the `transaction.status` tag.
        excluded_statuses: Vec<String>,
    },
    /// The expression of another singular entity metric.
    Metric(String),
    /// `1 - x`.
    Complement(Box<SnqlFunction>),
    /// `a / b`, null if `b` is zero.
    DivisionFloat(Box<SnqlFunction>, Box<SnqlFunction>),
    /// `a + b`.
    Addition(Box<SnqlFunction>, Box<SnqlFunction>),
    /// `a - b`.
    Subtraction(Box<SnqlFunction>, Box<SnqlFunction>),
}

impl SnqlFunction {
    fn metric(name: &str) -> Box<Self> {
        Box::new(SnqlFunction::Metric(name.to_owned()))
    }
}

/// Functions combining the values of the constituents of a composite metric.
///
/// Arguments are the values of the constituents in the order of their definition. Missing values
/// yield `None` unless noted otherwise.
#[derive(Clone, Copy)]
pub enum PostQueryFunction {
    /// Sum of all values.
    Sum,
    /// `a - b`.
    Subtraction,
    /// `max(0, a - b)`.
    ClampedSubtraction,
    /// `1 - a`.
    Complement,
    /// `a / b`, `None` if `b` is zero.
    DivisionFloat,
    /// The first value.
    Identity,
    /// A custom function.
    Custom(fn(&[Option<f64>]) -> Option<f64>),
}

impl PostQueryFunction {
    /// Applies the function to the values of the constituents.
    pub fn apply(self, values: &[Option<f64>]) -> Option<f64> {
        let binary = || match values {
            [Some(a), Some(b)] => Some((*a, *b)),
            _ => None,
        };

        match self {
            PostQueryFunction::Sum => values.iter().copied().sum(),
            PostQueryFunction::Subtraction => binary().map(|(a, b)| a - b),
            PostQueryFunction::ClampedSubtraction => binary().map(|(a, b)| (a - b).max(0.0)),
            PostQueryFunction::Complement => values.first().copied().flatten().map(|a| 1.0 - a),
            PostQueryFunction::DivisionFloat => {
                binary().and_then(|(a, b)| (b != 0.0).then(|| a / b))
            }
            PostQueryFunction::Identity => values.first().copied().flatten(),
            PostQueryFunction::Custom(f) => f(values),
        }
    }
}

impl fmt::Debug for PostQueryFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sum => write!(f, "Sum"),
            Self::Subtraction => write!(f, "Subtraction"),
            Self::ClampedSubtraction => write!(f, "ClampedSubtraction"),
            Self::Complement => write!(f, "Complement"),
            Self::DivisionFloat => write!(f, "DivisionFloat"),
            Self::Identity => write!(f, "Identity"),
            Self::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// A derived metric computed by one expression on a single entity.
#[derive(Clone, Debug, PartialEq)]
pub struct SingularEntityDerivedMetric {
    /// The public name of the metric.
    pub name: String,
    /// Raw metrics (as MRI or public name) and singular entity metrics this metric is built from.
    pub metrics: Vec<String>,
    /// The unit of the result.
    pub unit: MetricUnit,
    /// The type reported in result meta data. Defaults to `Float64`.
    pub meta_type: Option<String>,
    /// Generator of the query expression.
    pub snql: SnqlFunction,
    /// The value of groups and time buckets without data.
    pub default_null_value: Option<f64>,
}

/// A derived metric combining derived metrics of possibly multiple entities.
#[derive(Clone, Debug)]
pub struct CompositeEntityDerivedMetric {
    /// The public name of the metric.
    pub name: String,
    /// Derived metrics this metric is built from.
    pub metrics: Vec<String>,
    /// The unit of the result.
    pub unit: MetricUnit,
    /// The type reported in result meta data. Defaults to `Float64`.
    pub meta_type: Option<String>,
    /// Combines the values of [`metrics`](Self::metrics) after the query.
    pub post_query_func: PostQueryFunction,
    /// The value of groups and time buckets without data.
    pub default_null_value: Option<f64>,
}

/// The storage entities of a derived metric.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EntityResolution {
    /// All constituents live in one entity.
    Single(EntityKey),
    /// Names of the singular constituents in each entity.
    Multiple(BTreeMap<EntityKey, Vec<String>>),
}

/// Values of metrics within a single group, keyed by alias.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FieldValues {
    /// The value over the entire range.
    pub total: Option<f64>,
    /// The values of every time bucket.
    pub series: Vec<Option<f64>>,
}

impl FieldValues {
    /// Returns the total for `None`, or the value of the bucket at `idx`.
    pub fn get(&self, idx: Option<usize>) -> Option<f64> {
        match idx {
            None => self.total,
            Some(idx) => self.series.get(idx).copied().flatten(),
        }
    }

    /// Sets the total for `None`, or the value of the bucket at `idx`.
    pub fn set(&mut self, idx: Option<usize>, value: Option<f64>) {
        match idx {
            None => self.total = value,
            Some(idx) => {
                if self.series.len() <= idx {
                    self.series.resize(idx + 1, None);
                }
                self.series[idx] = value;
            }
        }
    }
}

/// A derived metric.
#[derive(Clone, Debug)]
pub enum DerivedMetric {
    /// A metric computed on a single entity.
    SingularEntity(SingularEntityDerivedMetric),
    /// A metric combining other derived metrics.
    Composite(CompositeEntityDerivedMetric),
}

impl DerivedMetric {
    /// Returns the public name of this metric.
    pub fn name(&self) -> &str {
        match self {
            DerivedMetric::SingularEntity(m) => &m.name,
            DerivedMetric::Composite(m) => &m.name,
        }
    }

    /// Returns the names of the direct constituents.
    pub fn metrics(&self) -> &[String] {
        match self {
            DerivedMetric::SingularEntity(m) => &m.metrics,
            DerivedMetric::Composite(m) => &m.metrics,
        }
    }

    /// Returns the unit of the result.
    pub fn unit(&self) -> &MetricUnit {
        match self {
            DerivedMetric::SingularEntity(m) => &m.unit,
            DerivedMetric::Composite(m) => &m.unit,
        }
    }

    /// Returns the type reported in result meta data.
    pub fn meta_type(&self) -> Option<&str> {
        match self {
            DerivedMetric::SingularEntity(m) => m.meta_type.as_deref(),
            DerivedMetric::Composite(m) => m.meta_type.as_deref(),
        }
    }

    /// Returns the names of all transitive raw constituents.
    pub fn raw_metrics<'r>(&'r self, registry: &'r DerivedMetricRegistry) -> Vec<&'r str> {
        let mut names = Vec::new();
        let mut pending: Vec<&str> = self.metrics().iter().map(String::as_str).collect();
        let mut visited = HashSet::new();

        while let Some(name) = pending.pop() {
            if !visited.insert(name) {
                continue;
            }
            match registry.get(name) {
                Some(inner) => pending.extend(inner.metrics().iter().map(String::as_str)),
                None => names.push(name),
            }
        }

        names
    }

    /// Returns `true` for composite metrics.
    pub fn is_composite(&self) -> bool {
        matches!(self, DerivedMetric::Composite(_))
    }

    /// Returns the value of groups and time buckets without data.
    ///
    /// Count-like metrics default to `0`, rates and ratios to `None` so that no data can be
    /// distinguished from zero.
    pub fn generate_default_null_values(&self) -> Option<f64> {
        match self {
            DerivedMetric::SingularEntity(m) => m.default_null_value,
            DerivedMetric::Composite(m) => m.default_null_value,
        }
    }

    /// Resolves the storage entities of this metric.
    ///
    /// Singular entity metrics fail if their transitive constituents live in different entities
    /// or reference a composite metric.
    pub fn get_entity(
        &self,
        registry: &DerivedMetricRegistry,
    ) -> Result<EntityResolution, DerivedMetricParseError> {
        match self {
            DerivedMetric::SingularEntity(metric) => {
                let mut entities = BTreeSet::new();
                collect_entities(metric, registry, &mut entities)?;

                let mut entities = entities.into_iter();
                match (entities.next(), entities.next()) {
                    (Some(entity), None) => Ok(EntityResolution::Single(entity)),
                    (Some(_), Some(_)) => {
                        Err(DerivedMetricParseError::MultipleEntities(metric.name.clone()))
                    }
                    (None, _) => Err(DerivedMetricParseError::NoConstituents(metric.name.clone())),
                }
            }
            DerivedMetric::Composite(metric) => {
                let mut grouped = BTreeMap::<EntityKey, Vec<String>>::new();
                for name in registry.singular_constituents(metric)? {
                    let constituent = registry.get_or_err(name)?;
                    let EntityResolution::Single(entity) = constituent.get_entity(registry)? else {
                        continue;
                    };
                    let names = grouped.entry(entity).or_default();
                    if !names.iter().any(|n| n == name) {
                        names.push(name.to_owned());
                    }
                }
                Ok(EntityResolution::Multiple(grouped))
            }
        }
    }

    /// Proves that a singular entity metric resolves to a single entity.
    ///
    /// Only the returned [`ValidatedMetric`] can generate query expressions.
    pub fn validate<'r>(
        &'r self,
        registry: &'r DerivedMetricRegistry,
    ) -> Result<ValidatedMetric<'r>, QueryError> {
        let metric = self.as_singular("validation")?;
        match self.get_entity(registry)? {
            EntityResolution::Single(entity) => Ok(ValidatedMetric {
                metric,
                entity,
                registry,
            }),
            EntityResolution::Multiple(_) => {
                Err(DerivedMetricParseError::MultipleEntities(metric.name.clone()).into())
            }
        }
    }

    /// Generates the aliased select expressions of a singular entity metric.
    pub fn generate_select_statements(
        &self,
        registry: &DerivedMetricRegistry,
        resolver: &Resolver<'_>,
        alias: &str,
    ) -> Result<Vec<AliasedExpr>, QueryError> {
        self.as_singular("select")?;
        let expr = self.validate(registry)?.select(resolver)?;
        Ok(vec![expr.alias(alias)])
    }

    /// Returns the indexed ids of all raw metrics this singular entity metric is built from.
    pub fn generate_metric_ids(
        &self,
        registry: &DerivedMetricRegistry,
        resolver: &Resolver<'_>,
    ) -> Result<BTreeSet<IndexedId>, QueryError> {
        self.as_singular("metric id generation")?;
        self.validate(registry)?.metric_ids(resolver)
    }

    /// Generates an order-by clause of a singular entity metric.
    pub fn generate_orderby_clause(
        &self,
        direction: Direction,
        registry: &DerivedMetricRegistry,
        resolver: &Resolver<'_>,
    ) -> Result<OrderBy, QueryError> {
        self.as_singular("order by")?;
        let expr = self.validate(registry)?.select(resolver)?;
        Ok(OrderBy { expr, direction })
    }

    /// Computes the value of this metric from the values of its constituents.
    ///
    /// `data` holds values by alias within one group. Constituents of composite metrics are
    /// looked up under their [`child_alias`] of `alias`. `idx` selects the total for `None`, or
    /// one bucket of the series. Singular entity metrics return the value stored under `alias`.
    pub fn run_post_query_function(
        &self,
        data: &HashMap<String, FieldValues>,
        idx: Option<usize>,
        alias: &str,
    ) -> Option<f64> {
        match self {
            DerivedMetric::SingularEntity(_) => data.get(alias).and_then(|v| v.get(idx)),
            DerivedMetric::Composite(metric) => {
                let values: Vec<_> = metric
                    .metrics
                    .iter()
                    .map(|name| {
                        data.get(&child_alias(name, alias))
                            .and_then(|v| v.get(idx))
                    })
                    .collect();
                metric.post_query_func.apply(&values)
            }
        }
    }

    /// Returns the composite metrics this metric depends on, deepest first, ending with itself.
    ///
    /// Evaluating the post query functions in this order guarantees that every composite
    /// constituent is computed before its parent. Singular entity metrics only return themselves.
    pub fn generate_bottom_up_derived_metrics_dependencies<'r>(
        &'r self,
        registry: &'r DerivedMetricRegistry,
    ) -> Vec<&'r str> {
        let mut ordered = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![(self, false)];

        while let Some((metric, expanded)) = stack.pop() {
            if expanded {
                if seen.insert(metric.name()) {
                    ordered.push(metric.name());
                }
                continue;
            }

            stack.push((metric, true));
            if let DerivedMetric::Composite(composite) = metric {
                for name in composite.metrics.iter().rev() {
                    if let Some(child @ DerivedMetric::Composite(_)) = registry.get(name) {
                        if !seen.contains(child.name()) {
                            stack.push((child, false));
                        }
                    }
                }
            }
        }

        ordered
    }

    fn as_singular(
        &self,
        operation: &'static str,
    ) -> Result<&SingularEntityDerivedMetric, NotSupportedOverCompositeEntity> {
        match self {
            DerivedMetric::SingularEntity(metric) => Ok(metric),
            DerivedMetric::Composite(metric) => Err(NotSupportedOverCompositeEntity {
                metric: metric.name.clone(),
                operation,
            }),
        }
    }
}

fn collect_entities(
    metric: &SingularEntityDerivedMetric,
    registry: &DerivedMetricRegistry,
    entities: &mut BTreeSet<EntityKey>,
) -> Result<(), DerivedMetricParseError> {
    for constituent in &metric.metrics {
        match registry.get(constituent) {
            Some(DerivedMetric::SingularEntity(inner)) => {
                collect_entities(inner, registry, entities)?
            }
            Some(DerivedMetric::Composite(_)) => {
                return Err(DerivedMetricParseError::CompositeConstituent {
                    metric: metric.name.clone(),
                    constituent: constituent.clone(),
                });
            }
            None => {
                let mri = resolve_raw_metric(constituent).ok_or_else(|| {
                    DerivedMetricParseError::UnknownConstituent {
                        metric: metric.name.clone(),
                        constituent: constituent.clone(),
                    }
                })?;
                let entity = EntityKey::for_metric_type(mri.ty).ok_or_else(|| {
                    DerivedMetricParseError::UnsupportedMetricType {
                        metric: metric.name.clone(),
                        constituent: constituent.clone(),
                    }
                })?;
                entities.insert(entity);
            }
        }
    }

    Ok(())
}

/// A singular entity metric whose constituents are proven to live in one entity.
#[derive(Clone, Copy, Debug)]
pub struct ValidatedMetric<'r> {
    metric: &'r SingularEntityDerivedMetric,
    entity: EntityKey,
    registry: &'r DerivedMetricRegistry,
}

impl<'r> ValidatedMetric<'r> {
    /// Returns the validated metric.
    pub fn metric(&self) -> &'r SingularEntityDerivedMetric {
        self.metric
    }

    /// Returns the entity of all constituents.
    pub fn entity(&self) -> EntityKey {
        self.entity
    }

    /// Generates the select expression.
    pub fn select(&self, resolver: &Resolver<'_>) -> Result<Expr, DerivedMetricParseError> {
        self.build(self.metric, &self.metric.snql, resolver)
    }

    /// Returns the indexed ids of all transitive raw constituents.
    pub fn metric_ids(&self, resolver: &Resolver<'_>) -> Result<BTreeSet<IndexedId>, QueryError> {
        let mut ids = BTreeSet::new();
        let mut pending = vec![self.metric];

        while let Some(metric) = pending.pop() {
            for constituent in &metric.metrics {
                match self.registry.get(constituent) {
                    Some(DerivedMetric::SingularEntity(inner)) => pending.push(inner),
                    Some(DerivedMetric::Composite(_)) => {
                        return Err(DerivedMetricParseError::CompositeConstituent {
                            metric: metric.name.clone(),
                            constituent: constituent.clone(),
                        }
                        .into());
                    }
                    None => {
                        ids.extend(raw_metric_id(constituent, resolver));
                    }
                }
            }
        }

        Ok(ids)
    }

    fn build(
        &self,
        metric: &SingularEntityDerivedMetric,
        snql: &SnqlFunction,
        resolver: &Resolver<'_>,
    ) -> Result<Expr, DerivedMetricParseError> {
        let binary = |func, a: &SnqlFunction, b: &SnqlFunction| -> Result<Expr, DerivedMetricParseError> {
            Ok(Expr::call(
                func,
                [self.build(metric, a, resolver)?, self.build(metric, b, resolver)?],
            ))
        };

        Ok(match snql {
            SnqlFunction::SessionSum { statuses } => aggregate(
                Func::SumIf,
                metric_condition(metric, resolver),
                Some(tag_condition(SESSION_STATUS_TAG, statuses, Func::Equals, resolver)),
            ),
            SnqlFunction::SessionUniq { statuses } => aggregate(
                Func::UniqIf,
                metric_condition(metric, resolver),
                statuses
                    .as_ref()
                    .map(|s| tag_condition(SESSION_STATUS_TAG, s, Func::Equals, resolver)),
            ),
            SnqlFunction::MetricUniq => {
                aggregate(Func::UniqIf, metric_condition(metric, resolver), None)
            }
            SnqlFunction::TransactionCount { excluded_statuses } => aggregate(
                Func::CountIf,
                metric_condition(metric, resolver),
                (!excluded_statuses.is_empty()).then(|| {
                    tag_condition(
                        TRANSACTION_STATUS_TAG,
                        excluded_statuses,
                        Func::NotEquals,
                        resolver,
                    )
                }),
            ),
            SnqlFunction::Metric(name) => match self.registry.get(name) {
                Some(DerivedMetric::SingularEntity(inner)) => {
                    self.build(inner, &inner.snql, resolver)?
                }
                Some(DerivedMetric::Composite(_)) => {
                    return Err(DerivedMetricParseError::CompositeConstituent {
                        metric: metric.name.clone(),
                        constituent: name.clone(),
                    });
                }
                None => return Err(DerivedMetricParseError::UnknownMetric(name.clone())),
            },
            SnqlFunction::Complement(inner) => Expr::call(
                Func::Minus,
                [Expr::value(1), self.build(metric, inner, resolver)?],
            ),
            SnqlFunction::DivisionFloat(a, b) => binary(Func::Divide, a, b)?,
            SnqlFunction::Addition(a, b) => binary(Func::Plus, a, b)?,
            SnqlFunction::Subtraction(a, b) => binary(Func::Minus, a, b)?,
        })
    }
}

fn raw_metric_id(name: &str, resolver: &Resolver<'_>) -> Option<IndexedId> {
    let mri = resolve_raw_metric(name)?;
    Some(resolver.resolve_weak(StringKind::Metric, &mri.to_string()))
}

/// `equals(metric_id, x)` or `in(metric_id, (x, ...))` for the raw constituents of a metric.
fn metric_condition(metric: &SingularEntityDerivedMetric, resolver: &Resolver<'_>) -> Expr {
    let ids: Vec<_> = metric
        .metrics
        .iter()
        .filter_map(|name| raw_metric_id(name, resolver))
        .collect();
    id_condition(Column::MetricId.into(), &ids, Func::Equals)
}

fn tag_condition(tag: &str, values: &[String], func: Func, resolver: &Resolver<'_>) -> Expr {
    let column = Column::TagId(resolver.resolve_weak(StringKind::TagKey, tag));
    let ids: Vec<_> = values
        .iter()
        .map(|value| resolver.resolve_weak(StringKind::TagValue, value))
        .collect();
    id_condition(column.into(), &ids, func)
}

/// Compares `lhs` with a single id, or with a list of ids for `in` and `notIn`.
fn id_condition(lhs: Expr, ids: &[IndexedId], func: Func) -> Expr {
    match (ids, func) {
        ([id], _) => Expr::call(func, [lhs, Expr::value(*id)]),
        (ids, Func::NotEquals) => Expr::call(Func::NotIn, [lhs, id_tuple(ids)]),
        (ids, _) => Expr::call(Func::In, [lhs, id_tuple(ids)]),
    }
}

fn id_tuple(ids: &[IndexedId]) -> Expr {
    Expr::Tuple(ids.iter().map(|id| Expr::value(*id)).collect())
}

fn aggregate(func: Func, metric_condition: Expr, condition: Option<Expr>) -> Expr {
    let condition = match condition {
        Some(condition) => Expr::call(Func::And, [metric_condition, condition]),
        None => metric_condition,
    };
    Expr::call(func, [Column::Value.into(), condition])
}

/// The registry of all derived metrics, keyed by name.
#[derive(Clone, Debug, Default)]
pub struct DerivedMetricRegistry {
    metrics: IndexMap<String, DerivedMetric>,
}

impl DerivedMetricRegistry {
    /// Creates a registry from a list of definitions.
    ///
    /// Fails if names are defined more than once, if constituents are unknown or if a metric
    /// depends on itself. Entities are checked when a metric is used, see
    /// [`DerivedMetric::get_entity`].
    pub fn new(
        definitions: impl IntoIterator<Item = DerivedMetric>,
    ) -> Result<Self, DerivedMetricParseError> {
        let mut metrics = IndexMap::new();
        for metric in definitions {
            let name = metric.name().to_owned();
            if metrics.contains_key(&name) {
                return Err(DerivedMetricParseError::DuplicateMetric(name));
            }
            metrics.insert(name, metric);
        }

        let registry = Self { metrics };
        for metric in registry.metrics.values() {
            registry.check_constituents(metric)?;
        }
        for metric in registry.metrics.values() {
            registry.check_cycles(metric)?;
        }

        Ok(registry)
    }

    /// Returns the registry of builtin derived metrics of release health and performance.
    pub fn builtin() -> Self {
        Self {
            metrics: builtin_definitions()
                .into_iter()
                .map(|metric| (metric.name().to_owned(), metric))
                .collect(),
        }
    }

    /// Returns the derived metric with the given name.
    pub fn get(&self, name: &str) -> Option<&DerivedMetric> {
        self.metrics.get(name)
    }

    /// Returns `true` if a derived metric with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.metrics.contains_key(name)
    }

    /// Iterates all derived metrics in the order of their definition.
    pub fn iter(&self) -> impl Iterator<Item = &DerivedMetric> {
        self.metrics.values()
    }

    fn get_or_err(&self, name: &str) -> Result<&DerivedMetric, DerivedMetricParseError> {
        self.get(name)
            .ok_or_else(|| DerivedMetricParseError::UnknownMetric(name.to_owned()))
    }

    /// Returns the names of all singular entity metrics a composite metric is built from.
    fn singular_constituents<'r>(
        &'r self,
        metric: &'r CompositeEntityDerivedMetric,
    ) -> Result<Vec<&'r str>, DerivedMetricParseError> {
        let mut names = Vec::new();
        let mut pending: Vec<&str> = metric.metrics.iter().rev().map(String::as_str).collect();
        let mut visited = HashSet::new();

        while let Some(name) = pending.pop() {
            if !visited.insert(name) {
                continue;
            }
            match self.get_or_err(name)? {
                DerivedMetric::SingularEntity(_) => names.push(name),
                DerivedMetric::Composite(inner) => {
                    pending.extend(inner.metrics.iter().rev().map(String::as_str))
                }
            }
        }

        Ok(names)
    }

    fn check_constituents(&self, metric: &DerivedMetric) -> Result<(), DerivedMetricParseError> {
        if metric.metrics().is_empty() {
            return Err(DerivedMetricParseError::NoConstituents(metric.name().to_owned()));
        }

        for constituent in metric.metrics() {
            let known = match metric {
                DerivedMetric::SingularEntity(_) => {
                    self.contains(constituent) || resolve_raw_metric(constituent).is_some()
                }
                DerivedMetric::Composite(_) => self.contains(constituent),
            };

            if !known {
                return Err(DerivedMetricParseError::UnknownConstituent {
                    metric: metric.name().to_owned(),
                    constituent: constituent.clone(),
                });
            }
        }

        Ok(())
    }

    fn check_cycles(&self, metric: &DerivedMetric) -> Result<(), DerivedMetricParseError> {
        let mut pending: Vec<&str> = metric.metrics().iter().map(String::as_str).collect();
        let mut visited = HashSet::new();

        while let Some(name) = pending.pop() {
            if name == metric.name() {
                return Err(DerivedMetricParseError::Cycle(name.to_owned()));
            }
            if !visited.insert(name) {
                continue;
            }
            if let Some(inner) = self.get(name) {
                pending.extend(inner.metrics().iter().map(String::as_str));
            }
        }

        Ok(())
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| (*s).to_owned()).collect()
}

fn session_sum(name: &str, statuses: &[&str]) -> DerivedMetric {
    DerivedMetric::SingularEntity(SingularEntityDerivedMetric {
        name: name.to_owned(),
        metrics: strings(&["c:sessions/session@none"]),
        unit: MetricUnit::None,
        meta_type: Some("integer".to_owned()),
        snql: SnqlFunction::SessionSum {
            statuses: strings(statuses),
        },
        default_null_value: Some(0.0),
    })
}

fn set_uniq(name: &str, mri: &str, statuses: Option<&[&str]>) -> DerivedMetric {
    let snql = match statuses {
        Some(statuses) => SnqlFunction::SessionUniq {
            statuses: Some(strings(statuses)),
        },
        None => SnqlFunction::MetricUniq,
    };

    DerivedMetric::SingularEntity(SingularEntityDerivedMetric {
        name: name.to_owned(),
        metrics: strings(&[mri]),
        unit: MetricUnit::None,
        meta_type: Some("integer".to_owned()),
        snql,
        default_null_value: Some(0.0),
    })
}

fn rate(name: &str, numerator: &str, denominator: &str, complement: bool) -> DerivedMetric {
    let division =
        SnqlFunction::DivisionFloat(SnqlFunction::metric(numerator), SnqlFunction::metric(denominator));

    DerivedMetric::SingularEntity(SingularEntityDerivedMetric {
        name: name.to_owned(),
        metrics: strings(&[numerator, denominator]),
        unit: MetricUnit::Fraction(FractionUnit::Ratio),
        meta_type: Some("percentage".to_owned()),
        snql: match complement {
            true => SnqlFunction::Complement(Box::new(division)),
            false => division,
        },
        default_null_value: None,
    })
}

fn composite(name: &str, metrics: &[&str], post_query_func: PostQueryFunction) -> DerivedMetric {
    DerivedMetric::Composite(CompositeEntityDerivedMetric {
        name: name.to_owned(),
        metrics: strings(metrics),
        unit: MetricUnit::None,
        meta_type: Some("integer".to_owned()),
        post_query_func,
        default_null_value: Some(0.0),
    })
}

fn transaction_count(name: &str, excluded_statuses: &[&str]) -> DerivedMetric {
    DerivedMetric::SingularEntity(SingularEntityDerivedMetric {
        name: name.to_owned(),
        metrics: strings(&["d:transactions/duration@millisecond"]),
        unit: MetricUnit::None,
        meta_type: Some("integer".to_owned()),
        snql: SnqlFunction::TransactionCount {
            excluded_statuses: strings(excluded_statuses),
        },
        default_null_value: Some(0.0),
    })
}

fn builtin_definitions() -> Vec<DerivedMetric> {
    vec![
        session_sum("session.all", &["init"]),
        session_sum("session.crashed", &["crashed"]),
        session_sum("session.abnormal", &["abnormal"]),
        session_sum("session.crashed_and_abnormal", &["crashed", "abnormal"]),
        session_sum("session.errored_preaggregated", &["errored_preaggr"]),
        set_uniq("session.errored_set", "s:sessions/error@none", None),
        composite(
            "session.errored_all",
            &["session.errored_preaggregated", "session.errored_set"],
            PostQueryFunction::Sum,
        ),
        composite(
            "session.errored",
            &["session.errored_all", "session.crashed_and_abnormal"],
            PostQueryFunction::ClampedSubtraction,
        ),
        composite(
            "session.healthy",
            &["session.all", "session.errored_all"],
            PostQueryFunction::ClampedSubtraction,
        ),
        rate("session.crash_free_rate", "session.crashed", "session.all", true),
        rate("session.crash_rate", "session.crashed", "session.all", false),
        set_uniq("session.all_user", "s:sessions/user@none", None),
        set_uniq("session.crashed_user", "s:sessions/user@none", Some(&["crashed"])),
        rate(
            "session.crash_free_user_rate",
            "session.crashed_user",
            "session.all_user",
            true,
        ),
        transaction_count("transaction.all", &[]),
        transaction_count("transaction.failure_count", &["ok", "cancelled", "unknown"]),
        rate(
            "transaction.failure_rate",
            "transaction.failure_count",
            "transaction.all",
            false,
        ),
    ]
}
