//! Validated metrics queries.
//!
//! Requests are described by [`QueryParams`] with plain strings for fields, group-bys and the
//! filter query. [`MetricsQuery::new`] parses and validates them once. The resulting query is
//! immutable and consumed by the [`QueryBuilder`](crate::QueryBuilder).

use std::fmt;

use chrono::{DateTime, Utc};
use mq_base_schema::metrics::{EntityKey, MetricResourceIdentifier, UseCaseId};
use mq_base_schema::project::{OrganizationId, ProjectId};
use serde::{Deserialize, Serialize};

use crate::config::QueryConfig;
use crate::error::QueryError;
use crate::fields::DerivedMetricRegistry;
use crate::granularity;
use crate::naming::{is_metric_name, parse_field, resolve_raw_metric};
use crate::parser::parse_query;
use crate::snql::{Column, Condition, Direction, Expr, Func, Op, Quantile};

/// Group-by keys that refer to the project instead of a tag.
const PROJECT_GROUPBY: &[&str] = &["project_id", "project"];

/// Aggregations of raw metrics.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum MetricOperation {
    /// Average value.
    Avg,
    /// Number of values.
    Count,
    /// Maximum value.
    Max,
    /// Minimum value.
    Min,
    /// Sum of all values.
    Sum,
    /// Number of unique values of a set.
    CountUnique,
    /// Median.
    P50,
    /// 75th percentile.
    P75,
    /// 90th percentile.
    P90,
    /// 95th percentile.
    P95,
    /// 99th percentile.
    P99,
    /// Maximum value, expressed as percentile.
    P100,
    /// An arbitrary percentile.
    Percentile(Quantile),
}

impl MetricOperation {
    /// Returns the operation with the given function name.
    ///
    /// [`MetricOperation::Percentile`] has no name, as it requires an argument.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "avg" => Self::Avg,
            "count" => Self::Count,
            "max" => Self::Max,
            "min" => Self::Min,
            "sum" => Self::Sum,
            "count_unique" => Self::CountUnique,
            "p50" => Self::P50,
            "p75" => Self::P75,
            "p90" => Self::P90,
            "p95" => Self::P95,
            "p99" => Self::P99,
            "p100" => Self::P100,
            _ => return None,
        })
    }

    /// Returns the function name of this operation.
    pub fn name(self) -> &'static str {
        match self {
            Self::Avg => "avg",
            Self::Count => "count",
            Self::Max => "max",
            Self::Min => "min",
            Self::Sum => "sum",
            Self::CountUnique => "count_unique",
            Self::P50 => "p50",
            Self::P75 => "p75",
            Self::P90 => "p90",
            Self::P95 => "p95",
            Self::P99 => "p99",
            Self::P100 => "p100",
            Self::Percentile(_) => "percentile",
        }
    }

    /// Returns the aggregate function computing this operation on the given entity.
    ///
    /// Returns `None` if the entity does not support the operation. `p100` computes the maximum.
    pub fn snql_function(self, entity: EntityKey) -> Option<Func> {
        let percentile = |percent| Quantile::from_percent(percent).map(Func::QuantileIf);

        match (entity, self) {
            (EntityKey::Counters | EntityKey::Distributions, Self::Sum) => Some(Func::SumIf),
            (EntityKey::Counters | EntityKey::Distributions, Self::Count) => Some(Func::CountIf),
            (EntityKey::Counters | EntityKey::Distributions, Self::Avg) => Some(Func::AvgIf),
            (EntityKey::Counters | EntityKey::Distributions, Self::Max) => Some(Func::MaxIf),
            (EntityKey::Counters | EntityKey::Distributions, Self::Min) => Some(Func::MinIf),
            (EntityKey::Distributions, Self::P50) => percentile(50),
            (EntityKey::Distributions, Self::P75) => percentile(75),
            (EntityKey::Distributions, Self::P90) => percentile(90),
            (EntityKey::Distributions, Self::P95) => percentile(95),
            (EntityKey::Distributions, Self::P99) => percentile(99),
            (EntityKey::Distributions, Self::P100) => Some(Func::MaxIf),
            (EntityKey::Distributions, Self::Percentile(quantile)) => {
                Some(Func::QuantileIf(quantile))
            }
            (EntityKey::Sets, Self::CountUnique) => Some(Func::UniqIf),
            _ => None,
        }
    }

    /// Returns the value of groups and time buckets without data.
    pub fn default_value(self) -> Option<f64> {
        match self {
            Self::Count | Self::Sum | Self::CountUnique => Some(0.0),
            _ => None,
        }
    }

    /// Returns `true` if the result is always an integer.
    pub fn is_integer(self) -> bool {
        matches!(self, Self::Count | Self::CountUnique)
    }
}

impl fmt::Display for MetricOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A selected metric, either a raw metric with an operation or a derived metric.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct MetricField {
    /// The aggregation of a raw metric, or `None` for derived metrics.
    pub op: Option<MetricOperation>,
    /// The public name or MRI of the metric.
    pub metric: String,
    /// The name under which the field appears in results.
    pub alias: Option<String>,
}

impl MetricField {
    /// Creates a field aggregating a raw metric.
    pub fn new(op: MetricOperation, metric: impl Into<String>) -> Self {
        Self {
            op: Some(op),
            metric: metric.into(),
            alias: None,
        }
    }

    /// Creates a field selecting a derived metric.
    pub fn derived(metric: impl Into<String>) -> Self {
        Self {
            op: None,
            metric: metric.into(),
            alias: None,
        }
    }

    /// Parses a field expression, see [`parse_field`].
    pub fn parse(field: &str) -> Result<Self, QueryError> {
        Ok(parse_field(field)?)
    }

    /// Returns the name under which the field appears in results.
    pub fn alias(&self) -> String {
        if let Some(ref alias) = self.alias {
            return alias.clone();
        }

        match self.op {
            Some(MetricOperation::Percentile(quantile)) => {
                format!("percentile({}, {quantile})", self.metric)
            }
            Some(op) => format!("{op}({})", self.metric),
            None => self.metric.clone(),
        }
    }
}

impl fmt::Display for MetricField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.alias())
    }
}

/// A group-by column.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum MetricGroupBy {
    /// A tag by name.
    Tag(String),
    /// The project.
    ProjectId,
}

impl MetricGroupBy {
    /// Returns the name under which the column appears in results.
    pub fn alias(&self) -> &str {
        match self {
            MetricGroupBy::Tag(name) => name,
            MetricGroupBy::ProjectId => "project_id",
        }
    }

    /// Returns the unresolved column of this group-by.
    pub fn column(&self) -> Column {
        match self {
            MetricGroupBy::Tag(name) => Column::Tag(name.clone()),
            MetricGroupBy::ProjectId => Column::ProjectId,
        }
    }
}

/// The target of an order-by clause.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OrderByTarget {
    /// A selected metric field.
    Field(MetricField),
    /// A group-by column.
    GroupBy(MetricGroupBy),
}

/// An order-by clause.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MetricOrderBy {
    /// The sorted field.
    pub target: OrderByTarget,
    /// The sort direction.
    pub direction: Direction,
}

/// A condition on aggregated values as requested.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HavingParam {
    /// The field expression, which must be selected.
    pub field: String,
    /// The comparison operator.
    pub op: Op,
    /// The compared value.
    pub value: f64,
}

/// A validated condition on the aggregated value of a selected field.
#[derive(Clone, Debug, PartialEq)]
pub struct HavingCondition {
    /// The selected field.
    pub field: MetricField,
    /// The comparison operator.
    pub op: Op,
    /// The compared value.
    pub value: f64,
}

/// Parameters of a metrics query request.
#[derive(Clone, Debug)]
pub struct QueryParams {
    /// The organization of all projects.
    pub org_id: OrganizationId,
    /// Projects to query.
    pub project_ids: Vec<ProjectId>,
    /// The use case of all raw metrics.
    pub use_case: UseCaseId,
    /// Inclusive start of the range.
    pub start: DateTime<Utc>,
    /// Exclusive end of the range.
    pub end: DateTime<Utc>,
    /// Length of series buckets in seconds. Defaults to the granularity of the range.
    pub interval: Option<i64>,
    /// Whether to compute totals.
    pub include_totals: bool,
    /// Whether to compute series.
    pub include_series: bool,
    /// Field expressions, see [`parse_field`].
    pub fields: Vec<String>,
    /// Tags to group by, or `project_id`.
    pub groupby: Vec<String>,
    /// The filter query, see [`parse_query`].
    pub query: String,
    /// Conditions on aggregated values.
    pub having: Vec<HavingParam>,
    /// Fields or group-bys to sort by, prefixed with `-` for descending order.
    pub orderby: Vec<String>,
    /// Maximum number of groups.
    pub limit: Option<u64>,
    /// Number of groups to skip.
    pub offset: u64,
}

impl QueryParams {
    /// Creates parameters for totals and series without fields.
    pub fn new(
        org_id: OrganizationId,
        project_ids: Vec<ProjectId>,
        use_case: UseCaseId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            org_id,
            project_ids,
            use_case,
            start,
            end,
            interval: None,
            include_totals: true,
            include_series: true,
            fields: Vec::new(),
            groupby: Vec::new(),
            query: String::new(),
            having: Vec::new(),
            orderby: Vec::new(),
            limit: None,
            offset: 0,
        }
    }
}

/// A validated metrics query.
#[derive(Clone, Debug)]
pub struct MetricsQuery {
    org_id: OrganizationId,
    project_ids: Vec<ProjectId>,
    use_case: UseCaseId,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    interval: Option<i64>,
    include_totals: bool,
    include_series: bool,
    select: Vec<MetricField>,
    groupby: Vec<MetricGroupBy>,
    where_: Option<Condition>,
    having: Vec<HavingCondition>,
    orderby: Vec<MetricOrderBy>,
    limit: Option<u64>,
    offset: u64,
}

impl MetricsQuery {
    /// Parses and validates query parameters.
    ///
    /// Fails if the parameters cannot be lowered to entity queries, for example when grouping or
    /// filtering by metrics, ordering by fields that are not selected, or selecting tags that are
    /// not grouped by.
    pub fn new(
        params: QueryParams,
        registry: &DerivedMetricRegistry,
        config: &QueryConfig,
    ) -> Result<Self, QueryError> {
        Self::validate(&params, config)?;

        let groupby = params
            .groupby
            .iter()
            .map(|name| parse_groupby(name, registry))
            .collect::<Result<Vec<_>, _>>()?;

        let mut select = Vec::<MetricField>::new();
        for field in &params.fields {
            let field = MetricField::parse(field)?;
            if !validate_field(&field, &groupby, registry, params.use_case)? {
                continue;
            }
            if !select.iter().any(|f| f.alias() == field.alias()) {
                select.push(field);
            }
        }

        let where_ = parse_query(&params.query)?;
        if let Some(ref condition) = where_ {
            validate_where(condition, registry)?;
        }

        let orderby = params
            .orderby
            .iter()
            .map(|orderby| parse_orderby(orderby, &select, &groupby))
            .collect::<Result<Vec<_>, _>>()?;

        let metric_orderbys = orderby
            .iter()
            .filter(|o| matches!(o.target, OrderByTarget::Field(_)))
            .count();
        if metric_orderbys > 1 {
            return Err(QueryError::incompatible(
                "cannot order by more than one metric expression",
            ));
        }

        let having = params
            .having
            .into_iter()
            .map(|having| {
                let field = MetricField::parse(&having.field)?;
                select
                    .iter()
                    .find(|f| f.alias() == field.alias())
                    .map(|field| HavingCondition {
                        field: field.clone(),
                        op: having.op,
                        value: having.value,
                    })
                    .ok_or_else(|| {
                        QueryError::invalid(format!(
                            "having field {} must be selected",
                            having.field
                        ))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            org_id: params.org_id,
            project_ids: params.project_ids,
            use_case: params.use_case,
            start: params.start,
            end: params.end,
            interval: params.interval,
            include_totals: params.include_totals,
            include_series: params.include_series,
            select,
            groupby,
            where_,
            having,
            orderby,
            limit: params.limit,
            offset: params.offset,
        })
    }

    /// Checks the time range, interval and limit of query parameters.
    ///
    /// The range may span at most [`QueryConfig::max_points`] intervals.
    ///
    /// This runs as part of [`MetricsQuery::new`] and does not parse any fields.
    pub fn validate(params: &QueryParams, config: &QueryConfig) -> Result<(), QueryError> {
        if params.start >= params.end {
            return Err(QueryError::invalid("start must be before end"));
        }

        if params.project_ids.is_empty() {
            return Err(QueryError::invalid("at least one project is required"));
        }

        if !params.include_totals && !params.include_series {
            return Err(QueryError::invalid("either totals or series must be included"));
        }

        if let Some(interval) = params.interval {
            if interval <= 0 || interval % 60 != 0 {
                return Err(QueryError::invalid(format!(
                    "interval {interval} must be a positive multiple of 60 seconds"
                )));
            }
        }

        let interval = params.interval.unwrap_or_else(|| {
            granularity::resolve_granularity(params.start, params.end).seconds()
        });
        let num_intervals = granularity::get_num_intervals(params.start, params.end, interval);
        if num_intervals as u64 > config.max_points {
            return Err(QueryError::invalid(format!(
                "{num_intervals} intervals of {interval} seconds exceed the maximum of {}",
                config.max_points
            )));
        }

        match params.limit {
            Some(0) => return Err(QueryError::invalid("limit must be positive")),
            Some(limit) if limit > config.max_limit => {
                return Err(QueryError::invalid(format!(
                    "limit {limit} exceeds the maximum of {}",
                    config.max_limit
                )));
            }
            _ => (),
        }

        Ok(())
    }

    /// The organization of all projects.
    pub fn org_id(&self) -> OrganizationId {
        self.org_id
    }

    /// Queried projects.
    pub fn project_ids(&self) -> &[ProjectId] {
        &self.project_ids
    }

    /// The use case of all raw metrics.
    pub fn use_case(&self) -> UseCaseId {
        self.use_case
    }

    /// Inclusive start of the range.
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Exclusive end of the range.
    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// The requested length of series buckets in seconds.
    pub fn interval(&self) -> Option<i64> {
        self.interval
    }

    /// Whether totals are computed.
    pub fn include_totals(&self) -> bool {
        self.include_totals
    }

    /// Whether series are computed.
    pub fn include_series(&self) -> bool {
        self.include_series
    }

    /// Selected metric fields. Selected tags are part of [`groupby`](Self::groupby).
    pub fn select(&self) -> &[MetricField] {
        &self.select
    }

    /// Group-by columns.
    pub fn groupby(&self) -> &[MetricGroupBy] {
        &self.groupby
    }

    /// The filter on raw rows.
    pub fn where_(&self) -> Option<&Condition> {
        self.where_.as_ref()
    }

    /// Conditions on aggregated values.
    pub fn having(&self) -> &[HavingCondition] {
        &self.having
    }

    /// Order-by clauses.
    pub fn orderby(&self) -> &[MetricOrderBy] {
        &self.orderby
    }

    /// The requested maximum number of groups.
    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// Number of groups to skip.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

fn parse_groupby(
    name: &str,
    registry: &DerivedMetricRegistry,
) -> Result<MetricGroupBy, QueryError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(QueryError::invalid("empty group-by"));
    }

    if name.contains(['(', ')']) || is_metric_name(name) || registry.contains(name) {
        return Err(QueryError::incompatible(format!(
            "cannot group by metric expression {name}"
        )));
    }

    Ok(match PROJECT_GROUPBY.contains(&name) {
        true => MetricGroupBy::ProjectId,
        false => MetricGroupBy::Tag(name.to_owned()),
    })
}

/// Validates a selected field.
///
/// Returns `false` for tags, which are selected through the group-by.
fn validate_field(
    field: &MetricField,
    groupby: &[MetricGroupBy],
    registry: &DerivedMetricRegistry,
    use_case: UseCaseId,
) -> Result<bool, QueryError> {
    let Some(op) = field.op else {
        if let Some(metric) = registry.get(&field.metric) {
            for name in metric.raw_metrics(registry) {
                let mri = resolve_raw_metric(name)
                    .ok_or_else(|| QueryError::invalid(format!("unknown metric {name}")))?;
                if mri.namespace != use_case {
                    return Err(QueryError::invalid(format!(
                        "derived metric {} does not belong to use case {use_case}",
                        field.metric
                    )));
                }
            }
            return Ok(true);
        }

        if is_metric_name(&field.metric) {
            return Err(QueryError::invalid(format!(
                "metric {} requires an aggregate function",
                field.metric
            )));
        }

        if groupby.iter().any(|g| g.alias() == field.metric) {
            return Ok(false);
        }

        return Err(QueryError::incompatible(format!(
            "tag {} must be grouped by to be selected",
            field.metric
        )));
    };

    if registry.contains(&field.metric) {
        return Err(QueryError::invalid(format!(
            "derived metric {} cannot be aggregated with {op}",
            field.metric
        )));
    }

    let mri = resolve_raw_metric(&field.metric)
        .ok_or_else(|| QueryError::invalid(format!("unknown metric {}", field.metric)))?;

    if mri.namespace != use_case {
        return Err(QueryError::invalid(format!(
            "metric {} does not belong to use case {use_case}",
            field.metric
        )));
    }

    let entity = raw_entity(&mri)?;
    if op.snql_function(entity).is_none() {
        return Err(QueryError::invalid(format!(
            "operation {op} is not supported for metric {} in {entity}",
            field.metric
        )));
    }

    Ok(true)
}

/// Returns the entity of a raw metric.
pub(crate) fn raw_entity(mri: &MetricResourceIdentifier<'_>) -> Result<EntityKey, QueryError> {
    EntityKey::for_metric_type(mri.ty)
        .ok_or_else(|| QueryError::invalid(format!("metrics of type {} cannot be queried", mri.ty)))
}

fn validate_where(condition: &Condition, registry: &DerivedMetricRegistry) -> Result<(), QueryError> {
    let mut result = Ok(());
    condition.for_each_leaf(&mut |lhs, _, _| {
        if let Expr::Column(Column::Tag(name)) = lhs {
            if result.is_ok() && (is_metric_name(name) || registry.contains(name)) {
                result = Err(QueryError::incompatible(format!(
                    "cannot filter by metric {name}"
                )));
            }
        }
    });
    result
}

fn parse_orderby(
    orderby: &str,
    select: &[MetricField],
    groupby: &[MetricGroupBy],
) -> Result<MetricOrderBy, QueryError> {
    let (direction, name) = match orderby.trim().strip_prefix('-') {
        Some(name) => (Direction::Desc, name),
        None => (Direction::Asc, orderby.trim()),
    };

    if let Some(groupby) = groupby.iter().find(|g| g.alias() == name) {
        return Ok(MetricOrderBy {
            target: OrderByTarget::GroupBy(groupby.clone()),
            direction,
        });
    }

    let field = MetricField::parse(name)?;
    let selected = select
        .iter()
        .find(|f| f.alias() == field.alias())
        .ok_or_else(|| {
            QueryError::incompatible(format!("order by {name} requires it to be selected"))
        })?;

    Ok(MetricOrderBy {
        target: OrderByTarget::Field(selected.clone()),
        direction,
    })
}
