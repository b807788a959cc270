use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use hashbrown::HashSet;
use indexmap::IndexMap;
use mq_base_schema::metrics::{EntityKey, MetricResourceIdentifier, MetricType};
use mq_base_schema::project::{OrganizationId, ProjectId};
use mq_common::time;
use mq_indexer::{IndexedId, MemoryIndexer, StringKind};
use parking_lot::RwLock;

use crate::snql::{Column, Condition, Direction, EntityQuery, Expr, Func, Op, OrderBy, Value};
use crate::store::{MetricsStore, Row, StoreError};

/// The value of a recorded [`Bucket`].
#[derive(Clone, Debug, PartialEq)]
pub enum BucketValue {
    /// A counter increment.
    Counter(f64),
    /// Individual values of a distribution.
    Distribution(Vec<f64>),
    /// Elements of a set.
    Set(Vec<u32>),
}

impl BucketValue {
    /// Returns the metric type of this value.
    pub fn ty(&self) -> MetricType {
        match self {
            BucketValue::Counter(_) => MetricType::Counter,
            BucketValue::Distribution(_) => MetricType::Distribution,
            BucketValue::Set(_) => MetricType::Set,
        }
    }

    fn values(&self) -> Vec<f64> {
        match self {
            BucketValue::Counter(value) => vec![*value],
            BucketValue::Distribution(values) => values.clone(),
            BucketValue::Set(values) => values.iter().map(|v| f64::from(*v)).collect(),
        }
    }
}

/// Metric values recorded at one point in time.
#[derive(Clone, Debug, PartialEq)]
pub struct Bucket {
    /// The organization of the project.
    pub org_id: OrganizationId,
    /// The project that reported the values.
    pub project_id: ProjectId,
    /// The time of the values.
    pub timestamp: DateTime<Utc>,
    /// The MRI of the metric.
    pub mri: String,
    /// Tags of the values. Empty values are dropped.
    pub tags: BTreeMap<String, String>,
    /// The recorded values.
    pub value: BucketValue,
}

impl Bucket {
    /// Creates a bucket without tags.
    pub fn new(
        org_id: OrganizationId,
        project_id: ProjectId,
        timestamp: DateTime<Utc>,
        mri: impl Into<String>,
        value: BucketValue,
    ) -> Self {
        Self {
            org_id,
            project_id,
            timestamp,
            mri: mri.into(),
            tags: BTreeMap::new(),
            value,
        }
    }

    /// Adds a tag to the bucket.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug)]
struct Entry {
    org_id: OrganizationId,
    project_id: ProjectId,
    metric_id: IndexedId,
    entity: EntityKey,
    timestamp: DateTime<Utc>,
    tags: BTreeMap<IndexedId, IndexedId>,
    value: f64,
}

/// A [`MetricsStore`] that keeps individual values in memory.
///
/// Metric names and tags are indexed in a [`MemoryIndexer`] when recorded, so that entity queries
/// can refer to them by id. Aggregates are computed when queries are executed. Missing tags read
/// as the id `0`, and divisions by zero yield `NULL`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<Vec<Entry>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a bucket and indexes its metric name and tags.
    pub fn record(&self, indexer: &MemoryIndexer, bucket: Bucket) -> Result<(), StoreError> {
        let invalid = || StoreError::InvalidMetric(bucket.mri.clone());

        let mri = MetricResourceIdentifier::parse(&bucket.mri).map_err(|_| invalid())?;
        if mri.ty != bucket.value.ty() {
            return Err(invalid());
        }
        let entity = EntityKey::for_metric_type(mri.ty).ok_or_else(invalid)?;

        let use_case = mri.namespace;
        let org_id = bucket.org_id;
        let metric_id = indexer.record(use_case, org_id, StringKind::Metric, &mri.to_string());

        let tags: BTreeMap<_, _> = bucket
            .tags
            .iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(key, value)| {
                (
                    indexer.record(use_case, org_id, StringKind::TagKey, key),
                    indexer.record(use_case, org_id, StringKind::TagValue, value),
                )
            })
            .collect();

        let mut entries = self.entries.write();
        for value in bucket.value.values() {
            entries.push(Entry {
                org_id,
                project_id: bucket.project_id,
                metric_id,
                entity,
                timestamp: bucket.timestamp,
                tags: tags.clone(),
                value,
            });
        }

        mq_log::trace!(mri = %mri, metric_id, "recorded bucket");
        Ok(())
    }
}

impl MetricsStore for MemoryStore {
    fn execute(&self, query: &EntityQuery) -> Result<Vec<Row>, StoreError> {
        let entries = self.entries.read();
        let interval = query.interval;

        let mut groups = IndexMap::<Vec<Value>, Vec<&Entry>>::new();
        for entry in entries.iter().filter(|e| e.entity == query.entity) {
            let mut matches = true;
            for condition in &query.conditions {
                if !eval_condition(condition, &mut |expr| eval_row(expr, entry, interval))? {
                    matches = false;
                    break;
                }
            }
            if !matches {
                continue;
            }

            let key = query
                .groupby
                .iter()
                .map(|g| eval_row(&g.expr, entry, interval))
                .collect::<Result<Vec<_>, _>>()?;
            groups.entry(key).or_default().push(entry);
        }

        let mut results = Vec::with_capacity(groups.len());
        'groups: for (key, rows) in groups {
            for condition in &query.having {
                if !eval_condition(condition, &mut |expr| eval_aggregate(expr, &rows, interval))? {
                    continue 'groups;
                }
            }

            let mut row = Row::new();
            for (groupby, value) in query.groupby.iter().zip(&key) {
                row.insert(groupby.name(), value.clone());
            }
            for select in &query.select {
                row.insert(select.name(), eval_aggregate(&select.expr, &rows, interval)?);
            }

            let sort_key = query
                .orderby
                .iter()
                .map(|o| eval_aggregate(&o.expr, &rows, interval))
                .collect::<Result<Vec<_>, _>>()?;

            results.push((sort_key, key, row));
        }

        results.sort_by(|(a, a_key, _), (b, b_key, _)| {
            compare_sort_keys(a, b, &query.orderby)
                .then_with(|| Value::Tuple(a_key.clone()).total_cmp(&Value::Tuple(b_key.clone())))
        });

        let offset = usize::try_from(query.offset).unwrap_or(usize::MAX);
        let limit = usize::try_from(query.limit).unwrap_or(usize::MAX);
        let rows: Vec<_> = results
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(_, _, row)| row)
            .collect();

        mq_log::debug!(entity = %query.entity, rows = rows.len(), "executed entity query");
        Ok(rows)
    }
}

/// Compares sort keys, placing nulls last in both directions.
fn compare_sort_keys(a: &[Value], b: &[Value], orderby: &[OrderBy]) -> Ordering {
    for ((a, b), orderby) in a.iter().zip(b).zip(orderby) {
        let ordering = match (a.is_null(), b.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => match orderby.direction {
                Direction::Asc => a.total_cmp(b),
                Direction::Desc => b.total_cmp(a),
            },
        };

        if ordering.is_ne() {
            return ordering;
        }
    }

    Ordering::Equal
}

fn eval_condition(
    condition: &Condition,
    eval: &mut impl FnMut(&Expr) -> Result<Value, StoreError>,
) -> Result<bool, StoreError> {
    match condition {
        Condition::Leaf { lhs, op, rhs } => {
            let lhs = eval(lhs)?;
            let rhs = eval(rhs)?;
            Ok(compare(&lhs, *op, &rhs))
        }
        Condition::And(children) => {
            for child in children {
                if !eval_condition(child, eval)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Condition::Or(children) => {
            for child in children {
                if eval_condition(child, eval)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

/// Evaluates an expression on a single row.
fn eval_row(expr: &Expr, entry: &Entry, interval: i64) -> Result<Value, StoreError> {
    Ok(match expr {
        Expr::Column(column) => match column {
            Column::Tag(name) => return Err(StoreError::UnresolvedColumn(name.clone())),
            Column::TagId(id) => Value::Int(entry.tags.get(id).copied().unwrap_or(0)),
            Column::TagKeys => Value::Tuple(entry.tags.keys().map(|k| Value::Int(*k)).collect()),
            Column::MetricId => Value::Int(entry.metric_id),
            Column::OrgId => Value::Int(entry.org_id.value() as i64),
            Column::ProjectId => Value::Int(entry.project_id.value() as i64),
            Column::Timestamp => Value::DateTime(entry.timestamp),
            Column::BucketedTime => {
                Value::DateTime(time::floor_to_interval(entry.timestamp, interval))
            }
            Column::Value => Value::Float(entry.value),
        },
        Expr::Value(value) => value.clone(),
        Expr::Tuple(items) => Value::Tuple(
            items
                .iter()
                .map(|item| eval_row(item, entry, interval))
                .collect::<Result<_, _>>()?,
        ),
        Expr::Function(func, _) if func.is_aggregate() => {
            return Err(StoreError::UnsupportedExpression(expr.to_string()));
        }
        Expr::Function(func, args) => {
            let args = args
                .iter()
                .map(|arg| eval_row(arg, entry, interval))
                .collect::<Result<Vec<_>, _>>()?;
            apply(*func, &args)?
        }
    })
}

/// Evaluates an expression on a group of rows.
fn eval_aggregate(expr: &Expr, rows: &[&Entry], interval: i64) -> Result<Value, StoreError> {
    Ok(match expr {
        Expr::Function(func, args) if func.is_aggregate() => {
            let [value, condition] = args.as_slice() else {
                return Err(StoreError::UnsupportedExpression(expr.to_string()));
            };

            let mut values = Vec::new();
            for entry in rows {
                if is_truthy(&eval_row(condition, entry, interval)?) {
                    values.extend(eval_row(value, entry, interval)?.as_f64());
                }
            }

            aggregate(*func, values)
        }
        Expr::Function(func, args) => {
            let args = args
                .iter()
                .map(|arg| eval_aggregate(arg, rows, interval))
                .collect::<Result<Vec<_>, _>>()?;
            apply(*func, &args)?
        }
        Expr::Column(_) => match rows.first() {
            Some(entry) => eval_row(expr, entry, interval)?,
            None => Value::Null,
        },
        Expr::Value(value) => value.clone(),
        Expr::Tuple(items) => Value::Tuple(
            items
                .iter()
                .map(|item| eval_aggregate(item, rows, interval))
                .collect::<Result<_, _>>()?,
        ),
    })
}

fn aggregate(func: Func, mut values: Vec<f64>) -> Value {
    let non_empty = |value: f64| match values.is_empty() {
        true => Value::Null,
        false => Value::Float(value),
    };

    match func {
        Func::SumIf => Value::Float(values.iter().sum()),
        Func::CountIf => Value::Int(values.len() as i64),
        Func::AvgIf => non_empty(values.iter().sum::<f64>() / values.len() as f64),
        Func::MaxIf => non_empty(values.iter().copied().fold(f64::MIN, f64::max)),
        Func::MinIf => non_empty(values.iter().copied().fold(f64::MAX, f64::min)),
        Func::UniqIf => {
            let unique: HashSet<u64> = values.iter().map(|v| v.to_bits()).collect();
            Value::Int(unique.len() as i64)
        }
        Func::QuantileIf(quantile) => {
            if values.is_empty() {
                return Value::Null;
            }

            values.sort_by(f64::total_cmp);
            let position = quantile.as_fraction() * (values.len() - 1) as f64;
            let lower = values[position.floor() as usize];
            let upper = values[position.ceil() as usize];
            Value::Float(lower + (upper - lower) * position.fract())
        }
        _ => Value::Null,
    }
}

fn apply(func: Func, args: &[Value]) -> Result<Value, StoreError> {
    let arithmetic = |f: fn(f64, f64) -> Option<f64>| match args {
        [a, b] => Ok(match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => f(a, b).map_or(Value::Null, Value::Float),
            _ => Value::Null,
        }),
        _ => Err(StoreError::UnsupportedExpression(func.to_string())),
    };

    let comparison = |op: Op| match args {
        [a, b] => Ok(Value::Int(i64::from(compare(a, op, b)))),
        _ => Err(StoreError::UnsupportedExpression(func.to_string())),
    };

    match func {
        Func::Equals => comparison(Op::Eq),
        Func::NotEquals => comparison(Op::NotEq),
        Func::In => comparison(Op::In),
        Func::NotIn => comparison(Op::NotIn),
        Func::Less => comparison(Op::Lt),
        Func::LessOrEquals => comparison(Op::Lte),
        Func::Greater => comparison(Op::Gt),
        Func::GreaterOrEquals => comparison(Op::Gte),
        Func::And => Ok(Value::Int(i64::from(args.iter().all(is_truthy)))),
        Func::Or => Ok(Value::Int(i64::from(args.iter().any(is_truthy)))),
        Func::Has => match args {
            [list, item] => Ok(Value::Int(i64::from(contains(list, item)))),
            _ => Err(StoreError::UnsupportedExpression(func.to_string())),
        },
        Func::Plus => arithmetic(|a, b| Some(a + b)),
        Func::Minus => arithmetic(|a, b| Some(a - b)),
        Func::Multiply => arithmetic(|a, b| Some(a * b)),
        Func::Divide => arithmetic(|a, b| (b != 0.0).then(|| a / b)),
        _ => Err(StoreError::UnsupportedExpression(func.to_string())),
    }
}

fn compare(lhs: &Value, op: Op, rhs: &Value) -> bool {
    if lhs.is_null() || rhs.is_null() {
        return false;
    }

    match op {
        Op::Eq => values_equal(lhs, rhs),
        Op::NotEq => !values_equal(lhs, rhs),
        Op::In => contains(rhs, lhs),
        Op::NotIn => !contains(rhs, lhs),
        Op::Lt => lhs.total_cmp(rhs).is_lt(),
        Op::Lte => lhs.total_cmp(rhs).is_le(),
        Op::Gt => lhs.total_cmp(rhs).is_gt(),
        Op::Gte => lhs.total_cmp(rhs).is_ge(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Tuple(a), Value::Tuple(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(a, b)| values_equal(a, b))
        }
        (a, b) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
    }
}

fn contains(list: &Value, item: &Value) -> bool {
    match list {
        Value::Tuple(items) => items.iter().any(|i| values_equal(i, item)),
        other => values_equal(other, item),
    }
}

fn is_truthy(value: &Value) -> bool {
    match *value {
        Value::Int(i) => i != 0,
        Value::Float(f) => f != 0.0,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use mq_base_schema::metrics::UseCaseId;
    use mq_test::at;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::granularity::Granularity;
    use crate::snql::{AliasedExpr, QueryKind};

    const ORG: OrganizationId = OrganizationId::new(1);
    const PROJECT: ProjectId = ProjectId::new(1);
    const DURATION: &str = "d:transactions/duration@millisecond";

    fn query(select: Vec<AliasedExpr>, groupby: Vec<AliasedExpr>) -> EntityQuery {
        EntityQuery {
            entity: EntityKey::Distributions,
            kind: QueryKind::Totals,
            select,
            groupby,
            conditions: vec![Condition::new(Column::OrgId, Op::Eq, Value::Int(1))],
            having: vec![],
            orderby: vec![],
            limit: 50,
            offset: 0,
            granularity: Granularity::Minute,
            interval: 60,
        }
    }

    fn value_of(func: Func) -> Expr {
        Expr::call(
            func,
            [
                Column::Value.into(),
                Expr::call(Func::Equals, [Column::MetricId.into(), Expr::value(1)]),
            ],
        )
    }

    fn store() -> (MemoryIndexer, MemoryStore) {
        let indexer = MemoryIndexer::new();
        let store = MemoryStore::new();

        for (transaction, values) in [("/a", vec![1.0, 2.0, 3.0]), ("/b", vec![10.0])] {
            let bucket = Bucket::new(ORG, PROJECT, at(0), DURATION, BucketValue::Distribution(values))
                .with_tag("transaction", transaction);
            store.record(&indexer, bucket).unwrap();
        }

        (indexer, store)
    }

    #[test]
    fn test_record_indexes_strings() {
        let (indexer, _) = store();
        let resolver = mq_indexer::Resolver::new(&indexer, UseCaseId::Transactions, ORG);
        assert_eq!(resolver.resolve(StringKind::Metric, DURATION), Some(1));
        assert_eq!(resolver.resolve(StringKind::TagValue, "/b"), Some(2));
    }

    #[test]
    fn test_record_type_mismatch() {
        let indexer = MemoryIndexer::new();
        let store = MemoryStore::new();
        let bucket = Bucket::new(ORG, PROJECT, at(0), DURATION, BucketValue::Counter(1.0));
        assert_eq!(
            store.record(&indexer, bucket),
            Err(StoreError::InvalidMetric(DURATION.to_owned()))
        );
    }

    #[test]
    fn test_aggregates() {
        let (_, store) = store();
        let query = query(
            vec![
                value_of(Func::CountIf).alias("count"),
                value_of(Func::AvgIf).alias("avg"),
                value_of(Func::MaxIf).alias("max"),
                value_of(Func::QuantileIf(crate::snql::Quantile::from_percent(50).unwrap()))
                    .alias("p50"),
            ],
            vec![],
        );

        let rows = store.execute(&query).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["count"], Value::Int(4));
        assert_eq!(rows[0]["avg"], Value::Float(4.0));
        assert_eq!(rows[0]["max"], Value::Float(10.0));
        assert_eq!(rows[0]["p50"], Value::Float(2.5));
    }

    #[test]
    fn test_group_order_and_limit() {
        let (_, store) = store();
        let mut query = query(
            vec![value_of(Func::SumIf).alias("sum")],
            vec![Expr::Column(Column::TagId(1)).alias("transaction")],
        );
        query.orderby = vec![OrderBy {
            expr: value_of(Func::SumIf),
            direction: Direction::Desc,
        }];
        query.limit = 1;

        let rows = store.execute(&query).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["transaction"], Value::Int(2));
        assert_eq!(rows[0]["sum"], Value::Float(10.0));
    }

    #[test]
    fn test_having() {
        let (_, store) = store();
        let mut query = query(
            vec![value_of(Func::CountIf).alias("count")],
            vec![Expr::Column(Column::TagId(1)).alias("transaction")],
        );
        query.having = vec![Condition::new(value_of(Func::CountIf), Op::Gt, Value::Int(1))];

        let rows = store.execute(&query).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["transaction"], Value::Int(1));
    }

    #[test]
    fn test_no_matching_rows() {
        let (_, store) = store();
        let mut query = query(vec![value_of(Func::CountIf).alias("count")], vec![]);
        query.conditions = vec![Condition::new(Column::OrgId, Op::Eq, Value::Int(2))];

        assert_eq!(store.execute(&query).unwrap(), vec![]);
    }

    #[test]
    fn test_division_by_zero() {
        let (_, store) = store();
        let ratio = Expr::call(
            Func::Divide,
            [value_of(Func::CountIf), value_of(Func::MinIf)],
        );
        let zero = Expr::call(Func::Minus, [value_of(Func::MinIf), value_of(Func::MinIf)]);
        let query = query(
            vec![
                ratio.alias("ratio"),
                Expr::call(Func::Divide, [value_of(Func::CountIf), zero]).alias("null"),
            ],
            vec![],
        );

        let rows = store.execute(&query).unwrap();
        assert_eq!(rows[0]["ratio"], Value::Float(4.0));
        assert_eq!(rows[0]["null"], Value::Null);
    }

    #[test]
    fn test_unresolved_tag() {
        let (_, store) = store();
        let query = query(
            vec![value_of(Func::CountIf).alias("count")],
            vec![Expr::Column(Column::Tag("transaction".to_owned())).into()],
        );

        assert_eq!(
            store.execute(&query),
            Err(StoreError::UnresolvedColumn("transaction".to_owned()))
        );
    }
}
