//! Typed representation of the queries issued against storage entities.
//!
//! Every query produced by the [`QueryBuilder`](crate::QueryBuilder) is an [`EntityQuery`]: a
//! select list of aggregate [`Expr`]essions, group-by columns, and [`Condition`]s on raw rows and
//! aggregated groups. The `Display` implementations render a stable SnQL-like text used for logs
//! and snapshot tests. Stores evaluate the typed form directly.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use mq_base_schema::metrics::EntityKey;
use mq_indexer::IndexedId;
use serde::{Deserialize, Serialize};

use crate::granularity::Granularity;

/// A literal value in queries and result rows.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// The absence of a value.
    Null,
    /// An integer, including indexed ids.
    Int(i64),
    /// A floating point number.
    Float(f64),
    /// A string.
    String(String),
    /// A UTC timestamp.
    DateTime(DateTime<Utc>),
    /// A tuple of values, such as the right hand side of `IN`.
    Tuple(Vec<Value>),
}

impl Value {
    /// Returns the numeric value, converting integers to floats.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Int(i) => Some(i as f64),
            Value::Float(f) => Some(f),
            _ => None,
        }
    }

    /// Returns the integer value.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int(i) => Some(i),
            _ => None,
        }
    }

    /// Returns the string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns `true` if this value is [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Compares two values, ordering `Null` after all other values.
    ///
    /// Integers and floats compare numerically. Values of unrelated types compare by type.
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Greater,
            (_, Value::Null) => Ordering::Less,
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
            (Value::Tuple(a), Value::Tuple(b)) => a
                .iter()
                .zip(b)
                .map(|(a, b)| a.total_cmp(b))
                .find(|o| o.is_ne())
                .unwrap_or_else(|| a.len().cmp(&b.len())),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => a.total_cmp(&b),
                _ => a.type_rank().cmp(&b.type_rank()),
            },
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Value::Int(_) | Value::Float(_) => 0,
            Value::String(_) => 1,
            Value::DateTime(_) => 2,
            Value::Tuple(_) => 3,
            Value::Null => 4,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Int(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::String(s) => s.hash(state),
            Value::DateTime(d) => d.hash(state),
            Value::Tuple(t) => t.hash(state),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::DateTime(value)
    }
}

impl From<Option<f64>> for Value {
    fn from(value: Option<f64>) -> Self {
        value.map_or(Value::Null, Value::Float)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(s) => write!(f, "'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            Value::DateTime(d) => write!(f, "toDateTime('{}')", d.format("%Y-%m-%dT%H:%M:%S")),
            Value::Tuple(values) => {
                f.write_str("(")?;
                write_joined(f, values, ", ")?;
                f.write_str(")")
            }
        }
    }
}

/// A column of a storage entity.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Column {
    /// A tag referenced by its name, before tag resolution.
    Tag(String),
    /// A tag referenced by its indexed key.
    TagId(IndexedId),
    /// The array of all indexed tag keys of a row.
    TagKeys,
    /// The indexed id of the metric.
    MetricId,
    /// The organization of the row.
    OrgId,
    /// The project of the row.
    ProjectId,
    /// The timestamp of the row.
    Timestamp,
    /// The timestamp floored to the interval of the query.
    BucketedTime,
    /// The metric value, only valid as the argument of an aggregate function.
    Value,
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Column::Tag(name) => write!(f, "tags[{name}]"),
            Column::TagId(id) => write!(f, "tags[{id}]"),
            Column::TagKeys => f.write_str("tags.key"),
            Column::MetricId => f.write_str("metric_id"),
            Column::OrgId => f.write_str("org_id"),
            Column::ProjectId => f.write_str("project_id"),
            Column::Timestamp => f.write_str("timestamp"),
            Column::BucketedTime => f.write_str("bucketed_time"),
            Column::Value => f.write_str("value"),
        }
    }
}

/// A quantile in hundredths, from `0` to `100`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Quantile(u8);

impl Quantile {
    /// Creates a quantile from a percentage between `0` and `100`.
    pub fn from_percent(percent: u8) -> Option<Self> {
        (percent <= 100).then_some(Self(percent))
    }

    /// Creates a quantile from a fraction in `[0, 1]` that is a multiple of `0.01`.
    pub fn from_fraction(fraction: f64) -> Option<Self> {
        if !(0.0..=1.0).contains(&fraction) {
            return None;
        }

        let percent = (fraction * 100.0).round();
        if (percent - fraction * 100.0).abs() > 1e-6 {
            return None;
        }

        Self::from_percent(percent as u8)
    }

    /// Returns the quantile as a fraction of `1`.
    pub fn as_fraction(self) -> f64 {
        f64::from(self.0) / 100.0
    }

    /// Returns the quantile as a percentage.
    pub fn as_percent(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Quantile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_fraction())
    }
}

/// Functions available in query expressions.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Func {
    /// Sum of values matching a condition.
    SumIf,
    /// Number of values matching a condition.
    CountIf,
    /// Average of values matching a condition.
    AvgIf,
    /// Maximum of values matching a condition.
    MaxIf,
    /// Minimum of values matching a condition.
    MinIf,
    /// Number of unique values matching a condition.
    UniqIf,
    /// Quantile of values matching a condition.
    QuantileIf(Quantile),
    /// `a = b`.
    Equals,
    /// `a != b`.
    NotEquals,
    /// `a IN (b, ...)`.
    In,
    /// `a NOT IN (b, ...)`.
    NotIn,
    /// `a < b`.
    Less,
    /// `a <= b`.
    LessOrEquals,
    /// `a > b`.
    Greater,
    /// `a >= b`.
    GreaterOrEquals,
    /// Logical conjunction of all arguments.
    And,
    /// Logical disjunction of all arguments.
    Or,
    /// Whether an array contains a value.
    Has,
    /// `a + b`.
    Plus,
    /// `a - b`.
    Minus,
    /// `a * b`.
    Multiply,
    /// `a / b` as floating point division.
    Divide,
}

impl Func {
    /// Returns `true` for aggregate functions.
    pub fn is_aggregate(self) -> bool {
        matches!(
            self,
            Func::SumIf
                | Func::CountIf
                | Func::AvgIf
                | Func::MaxIf
                | Func::MinIf
                | Func::UniqIf
                | Func::QuantileIf(_)
        )
    }

    /// Returns the name of the function.
    pub fn name(self) -> &'static str {
        match self {
            Func::SumIf => "sumIf",
            Func::CountIf => "countIf",
            Func::AvgIf => "avgIf",
            Func::MaxIf => "maxIf",
            Func::MinIf => "minIf",
            Func::UniqIf => "uniqIf",
            Func::QuantileIf(_) => "quantileIf",
            Func::Equals => "equals",
            Func::NotEquals => "notEquals",
            Func::In => "in",
            Func::NotIn => "notIn",
            Func::Less => "less",
            Func::LessOrEquals => "lessOrEquals",
            Func::Greater => "greater",
            Func::GreaterOrEquals => "greaterOrEquals",
            Func::And => "and",
            Func::Or => "or",
            Func::Has => "has",
            Func::Plus => "plus",
            Func::Minus => "minus",
            Func::Multiply => "multiply",
            Func::Divide => "divide",
        }
    }
}

impl fmt::Display for Func {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Func::QuantileIf(q) => write!(f, "quantileIf({q})"),
            _ => f.write_str(self.name()),
        }
    }
}

/// An expression in a query.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Expr {
    /// A column.
    Column(Column),
    /// A literal.
    Value(Value),
    /// A tuple of expressions.
    Tuple(Vec<Expr>),
    /// A function call.
    Function(Func, Vec<Expr>),
}

impl Expr {
    /// Creates a function call expression.
    pub fn call(func: Func, args: impl IntoIterator<Item = Expr>) -> Self {
        Expr::Function(func, args.into_iter().collect())
    }

    /// Creates a literal expression.
    pub fn value(value: impl Into<Value>) -> Self {
        Expr::Value(value.into())
    }

    /// Returns `true` if the expression contains an aggregate function.
    pub fn is_aggregate(&self) -> bool {
        match self {
            Expr::Function(func, args) => func.is_aggregate() || args.iter().any(Expr::is_aggregate),
            Expr::Tuple(items) => items.iter().any(Expr::is_aggregate),
            Expr::Column(_) | Expr::Value(_) => false,
        }
    }

    /// Wraps this expression with an alias.
    pub fn alias(self, alias: impl Into<String>) -> AliasedExpr {
        AliasedExpr {
            expr: self,
            alias: Some(alias.into()),
        }
    }
}

impl From<Column> for Expr {
    fn from(column: Column) -> Self {
        Expr::Column(column)
    }
}

impl From<Value> for Expr {
    fn from(value: Value) -> Self {
        Expr::Value(value)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(column) => column.fmt(f),
            Expr::Value(value) => value.fmt(f),
            Expr::Tuple(items) => {
                f.write_str("(")?;
                write_joined(f, items, ", ")?;
                f.write_str(")")
            }
            Expr::Function(func, args) => {
                write!(f, "{func}(")?;
                write_joined(f, args, ", ")?;
                f.write_str(")")
            }
        }
    }
}

/// An expression with an optional alias, used in select and group-by lists.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct AliasedExpr {
    /// The aliased expression.
    pub expr: Expr,
    /// The alias under which the expression appears in result rows.
    pub alias: Option<String>,
}

impl AliasedExpr {
    /// Returns the key of this expression in result rows.
    pub fn name(&self) -> String {
        match self.alias {
            Some(ref alias) => alias.clone(),
            None => self.expr.to_string(),
        }
    }
}

impl From<Expr> for AliasedExpr {
    fn from(expr: Expr) -> Self {
        Self { expr, alias: None }
    }
}

impl fmt::Display for AliasedExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.alias {
            Some(ref alias) => write!(f, "{} AS `{}`", self.expr, alias),
            None => self.expr.fmt(f),
        }
    }
}

/// Comparison operators of conditions.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    /// `=`
    Eq,
    /// `!=`
    NotEq,
    /// `IN`
    In,
    /// `NOT IN`
    NotIn,
    /// `<`
    Lt,
    /// `<=`
    Lte,
    /// `>`
    Gt,
    /// `>=`
    Gte,
}

impl Op {
    /// Returns the SQL representation of this operator.
    pub fn as_str(self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::NotEq => "!=",
            Op::In => "IN",
            Op::NotIn => "NOT IN",
            Op::Lt => "<",
            Op::Lte => "<=",
            Op::Gt => ">",
            Op::Gte => ">=",
        }
    }

    /// Returns the function evaluating this operator.
    pub fn func(self) -> Func {
        match self {
            Op::Eq => Func::Equals,
            Op::NotEq => Func::NotEquals,
            Op::In => Func::In,
            Op::NotIn => Func::NotIn,
            Op::Lt => Func::Less,
            Op::Lte => Func::LessOrEquals,
            Op::Gt => Func::Greater,
            Op::Gte => Func::GreaterOrEquals,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A condition tree.
///
/// Leaves compare two expressions. Inner nodes combine their children with `AND` or `OR`.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Condition {
    /// A comparison of two expressions.
    Leaf {
        /// Left hand side, usually a column.
        lhs: Expr,
        /// The comparison operator.
        op: Op,
        /// Right hand side, usually a value or a tuple of values.
        rhs: Expr,
    },
    /// All children must match.
    And(Vec<Condition>),
    /// Any child must match.
    Or(Vec<Condition>),
}

impl Condition {
    /// Creates a leaf condition.
    pub fn new(lhs: impl Into<Expr>, op: Op, rhs: impl Into<Expr>) -> Self {
        Condition::Leaf {
            lhs: lhs.into(),
            op,
            rhs: rhs.into(),
        }
    }

    /// Calls `f` for every leaf of this tree.
    pub fn for_each_leaf<'a>(&'a self, f: &mut impl FnMut(&'a Expr, Op, &'a Expr)) {
        match self {
            Condition::Leaf { lhs, op, rhs } => f(lhs, *op, rhs),
            Condition::And(children) | Condition::Or(children) => {
                for child in children {
                    child.for_each_leaf(f);
                }
            }
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_children(
            f: &mut fmt::Formatter<'_>,
            children: &[Condition],
            separator: &str,
        ) -> fmt::Result {
            for (index, child) in children.iter().enumerate() {
                if index > 0 {
                    f.write_str(separator)?;
                }
                match child {
                    Condition::Leaf { .. } => write!(f, "{child}")?,
                    _ => write!(f, "({child})")?,
                }
            }
            Ok(())
        }

        match self {
            Condition::Leaf { lhs, op, rhs } => write!(f, "{lhs} {op} {rhs}"),
            Condition::And(children) => write_children(f, children, " AND "),
            Condition::Or(children) => write_children(f, children, " OR "),
        }
    }
}

/// Sort direction of an order-by clause.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Ascending order.
    #[default]
    Asc,
    /// Descending order.
    Desc,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Asc => f.write_str("ASC"),
            Direction::Desc => f.write_str("DESC"),
        }
    }
}

/// An order-by clause.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct OrderBy {
    /// The sorted expression.
    pub expr: Expr,
    /// The sort direction.
    pub direction: Direction,
}

impl fmt::Display for OrderBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.expr, self.direction)
    }
}

/// Whether a query returns totals or a time series.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum QueryKind {
    /// One row per group.
    Totals,
    /// One row per group and time bucket.
    Series,
}

/// A query against a single storage entity.
#[derive(Clone, Debug, PartialEq)]
pub struct EntityQuery {
    /// The queried entity.
    pub entity: EntityKey,
    /// Whether this is a totals or series query.
    pub kind: QueryKind,
    /// Aggregates to compute for every group.
    pub select: Vec<AliasedExpr>,
    /// Columns to group by. Series queries group by [`Column::BucketedTime`] last.
    pub groupby: Vec<AliasedExpr>,
    /// Conditions on raw rows, all of which must match.
    pub conditions: Vec<Condition>,
    /// Conditions on aggregated groups, all of which must match.
    pub having: Vec<Condition>,
    /// Sort order of groups.
    pub orderby: Vec<OrderBy>,
    /// Maximum number of rows returned.
    pub limit: u64,
    /// Number of rows skipped.
    pub offset: u64,
    /// The storage resolution to read.
    pub granularity: Granularity,
    /// The length of buckets in seconds for [`Column::BucketedTime`].
    pub interval: i64,
}

impl EntityQuery {
    /// Returns the group-by expressions excluding the time bucket.
    pub fn tag_groupby(&self) -> impl Iterator<Item = &AliasedExpr> {
        self.groupby
            .iter()
            .filter(|g| g.expr != Expr::Column(Column::BucketedTime))
    }

    /// Restricts this query to the given groups.
    ///
    /// Each group is a tuple of values in the order of [`tag_groupby`](Self::tag_groupby).
    pub fn restrict_to_groups(&mut self, groups: &[Vec<Value>]) {
        let columns: Vec<Expr> = self.tag_groupby().map(|g| g.expr.clone()).collect();
        if columns.is_empty() {
            return;
        }

        let tuples = groups
            .iter()
            .map(|group| Expr::Tuple(group.iter().cloned().map(Expr::Value).collect()))
            .collect();

        self.conditions
            .push(Condition::new(Expr::Tuple(columns), Op::In, Expr::Tuple(tuples)));
    }
}

impl fmt::Display for EntityQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "MATCH ({})", self.entity)?;
        f.write_str("SELECT ")?;
        write_joined(f, &self.select, ", ")?;
        f.write_str("\n")?;

        if !self.groupby.is_empty() {
            f.write_str("BY ")?;
            write_joined(f, &self.groupby, ", ")?;
            f.write_str("\n")?;
        }

        if !self.conditions.is_empty() {
            f.write_str("WHERE ")?;
            write_conditions(f, &self.conditions)?;
            f.write_str("\n")?;
        }

        if !self.having.is_empty() {
            f.write_str("HAVING ")?;
            write_conditions(f, &self.having)?;
            f.write_str("\n")?;
        }

        if !self.orderby.is_empty() {
            f.write_str("ORDER BY ")?;
            write_joined(f, &self.orderby, ", ")?;
            f.write_str("\n")?;
        }

        writeln!(f, "LIMIT {}", self.limit)?;
        writeln!(f, "OFFSET {}", self.offset)?;
        write!(f, "GRANULARITY {}", self.granularity.seconds())?;
        if self.kind == QueryKind::Series {
            write!(f, "\nINTERVAL {}", self.interval)?;
        }

        Ok(())
    }
}

fn write_conditions(f: &mut fmt::Formatter<'_>, conditions: &[Condition]) -> fmt::Result {
    for (index, condition) in conditions.iter().enumerate() {
        if index > 0 {
            f.write_str(" AND ")?;
        }
        match condition {
            Condition::Or(_) => write!(f, "({condition})")?,
            _ => write!(f, "{condition}")?,
        }
    }
    Ok(())
}

fn write_joined<T: fmt::Display>(
    f: &mut fmt::Formatter<'_>,
    items: &[T],
    separator: &str,
) -> fmt::Result {
    for (index, item) in items.iter().enumerate() {
        if index > 0 {
            f.write_str(separator)?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_aggregate() {
        let expr = Expr::call(
            Func::QuantileIf(Quantile::from_percent(95).unwrap()),
            [
                Column::Value.into(),
                Expr::call(Func::Equals, [Column::MetricId.into(), Expr::value(7)]),
            ],
        );

        insta::assert_snapshot!(expr.alias("p95(transaction.duration)"), @"quantileIf(0.95)(value, equals(metric_id, 7)) AS `p95(transaction.duration)`");
    }

    #[test]
    fn test_render_condition() {
        let condition = Condition::And(vec![
            Condition::Or(vec![
                Condition::new(Column::Tag("a".into()), Op::Eq, Value::from("b")),
                Condition::new(Column::Tag("c".into()), Op::NotEq, Value::from("it's")),
            ]),
            Condition::new(
                Column::ProjectId,
                Op::In,
                Expr::Tuple(vec![Expr::value(1), Expr::value(2)]),
            ),
        ]);

        insta::assert_snapshot!(condition, @r"(tags[a] = 'b' OR tags[c] != 'it\'s') AND project_id IN (1, 2)");
    }

    #[test]
    fn test_quantile_from_fraction() {
        assert_eq!(Quantile::from_fraction(0.5), Quantile::from_percent(50));
        assert_eq!(Quantile::from_fraction(0.99), Quantile::from_percent(99));
        assert_eq!(Quantile::from_fraction(0.555), None);
        assert_eq!(Quantile::from_fraction(1.5), None);
    }

    #[test]
    fn test_value_equality_and_order() {
        assert_eq!(Value::Float(0.5), Value::Float(0.5));
        assert_ne!(Value::Int(1), Value::Float(1.0));
        assert_eq!(Value::Int(1).total_cmp(&Value::Float(1.5)), Ordering::Less);
        assert_eq!(Value::Null.total_cmp(&Value::Int(1)), Ordering::Greater);
    }

    #[test]
    fn test_value_serialize_untagged() {
        let values = vec![Value::Null, Value::Int(3), Value::from("a"), Value::Float(0.5)];
        assert_eq!(
            serde_json::to_string(&values).unwrap(),
            r#"[null,3,"a",0.5]"#
        );
    }
}
