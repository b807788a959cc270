//! Conversion of entity query results into groups of field values.
//!
//! Every entity returns rows keyed by the aliases of its select and group-by lists. The
//! [`ResultConverter`] merges these rows by their group-by values, aligns series rows on the
//! intervals of the plan, fills gaps with the default values of fields, and evaluates composite
//! metrics from their constituents.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use hashbrown::HashMap;
use indexmap::IndexMap;
use mq_base_schema::metrics::EntityKey;
use mq_indexer::{Resolver, StringKind};
use serde::{Deserialize, Serialize};

use crate::builder::{BUCKETED_TIME_ALIAS, FieldKind, PlannedField, QueryPlan};
use crate::fields::{DerivedMetricRegistry, FieldValues, child_alias};
use crate::query::MetricGroupBy;
use crate::snql::{Direction, Value};
use crate::store::Row;

/// Indexed value of tags missing on a row.
const MISSING_TAG_VALUE: i64 = 0;

/// Rows returned by the queries of a single entity.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EntityRows {
    /// Rows of the totals query.
    pub totals: Vec<Row>,
    /// Rows of the series query.
    pub series: Vec<Row>,
}

/// Type and unit of a column in query results.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    /// The name of the column.
    pub name: String,
    /// The type of the values.
    #[serde(rename = "type")]
    pub ty: String,
    /// The unit of the values, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl Meta {
    fn new(name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
            unit: None,
        }
    }
}

/// Returns the result meta data of a selected field.
pub fn translate_meta(field: &PlannedField) -> Meta {
    Meta {
        name: field.alias.clone(),
        ty: field.meta_type.clone(),
        unit: (!field.unit.is_none()).then(|| field.unit.as_str().to_owned()),
    }
}

fn groupby_meta(groupby: &MetricGroupBy) -> Meta {
    match groupby {
        MetricGroupBy::Tag(name) => Meta::new(name.as_str(), "String"),
        MetricGroupBy::ProjectId => Meta::new("project_id", "UInt64"),
    }
}

/// The values of all fields for one combination of group-by values.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Group {
    /// Group-by values by alias. Empty without group-by.
    pub by: BTreeMap<String, Value>,
    /// Values over the entire range by field alias.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub totals: BTreeMap<String, Value>,
    /// Values of every interval by field alias.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub series: BTreeMap<String, Vec<Value>>,
}

/// The result of a metrics query.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricsQueryResult {
    /// Inclusive start of the range.
    pub start: DateTime<Utc>,
    /// Exclusive end of the range.
    pub end: DateTime<Utc>,
    /// Start times of all series buckets.
    pub intervals: Vec<DateTime<Utc>>,
    /// Groups in result order.
    pub groups: Vec<Group>,
    /// Meta data of group-by columns followed by selected fields.
    pub meta: Vec<Meta>,
}

impl MetricsQueryResult {
    /// Returns totals as flat rows in the `{data, meta}` shape.
    pub fn to_totals_data(&self) -> serde_json::Value {
        let data = self
            .groups
            .iter()
            .map(|group| {
                let mut row = serde_json::Map::new();
                for (alias, value) in group.by.iter().chain(&group.totals) {
                    row.insert(alias.clone(), to_json(value));
                }
                serde_json::Value::Object(row)
            })
            .collect();

        serde_json::json!({
            "data": serde_json::Value::Array(data),
            "meta": &self.meta,
        })
    }

    /// Returns series as flat rows with a `time` column in the `{data, meta}` shape.
    ///
    /// There is one row for every group and interval, ordered by group first.
    pub fn to_series_data(&self) -> serde_json::Value {
        let mut data = Vec::new();
        for group in &self.groups {
            for (index, time) in self.intervals.iter().enumerate() {
                let mut row = serde_json::Map::new();
                row.insert("time".to_owned(), format_time(*time).into());
                for (alias, value) in &group.by {
                    row.insert(alias.clone(), to_json(value));
                }
                for (alias, values) in &group.series {
                    let value = values.get(index).map_or(serde_json::Value::Null, to_json);
                    row.insert(alias.clone(), value);
                }
                data.push(serde_json::Value::Object(row));
            }
        }

        let mut meta = vec![Meta::new("time", "DateTime('Universal')")];
        meta.extend(self.meta.iter().cloned());

        serde_json::json!({
            "data": data,
            "meta": meta,
        })
    }
}

fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Int(i) => (*i).into(),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        Value::String(s) => s.as_str().into(),
        Value::DateTime(d) => format_time(*d).into(),
        Value::Tuple(values) => values.iter().map(to_json).collect(),
    }
}

/// Returns the group-by values of a row in the order of `groupby`.
pub(crate) fn group_key(row: &Row, groupby: &[MetricGroupBy]) -> Vec<Value> {
    groupby
        .iter()
        .map(|g| row.get(g.alias()).cloned().unwrap_or(Value::Null))
        .collect()
}

/// Field values of a single group by alias, including constituents of composite metrics.
type GroupData = HashMap<String, FieldValues>;

/// Merges the rows of entity queries into a [`MetricsQueryResult`].
pub struct ResultConverter<'a> {
    plan: &'a QueryPlan,
    registry: &'a DerivedMetricRegistry,
    resolver: &'a Resolver<'a>,
}

impl<'a> ResultConverter<'a> {
    /// Creates a converter for the results of the given plan.
    ///
    /// The resolver is used to translate indexed tag values back to strings.
    pub fn new(
        plan: &'a QueryPlan,
        registry: &'a DerivedMetricRegistry,
        resolver: &'a Resolver<'a>,
    ) -> Self {
        Self {
            plan,
            registry,
            resolver,
        }
    }

    /// Converts the rows of all entities.
    ///
    /// If the plan is ordered by a field, only groups returned by the primary entity are kept in
    /// the order of its rows. Otherwise, groups of all entities are merged, sorted by their
    /// group-by values and paginated with the limit and offset of the query. Without group-by,
    /// there is always exactly one group.
    pub fn convert(&self, results: &BTreeMap<EntityKey, EntityRows>) -> MetricsQueryResult {
        let plan = self.plan;
        let mut groups = self.collect_groups(results);

        for entity in plan.entity_order() {
            let Some(rows) = results.get(&entity) else {
                continue;
            };

            for row in &rows.totals {
                self.merge_row(&mut groups, entity, row, None);
            }

            for row in &rows.series {
                let index = match row.get(BUCKETED_TIME_ALIAS) {
                    Some(Value::DateTime(time)) => plan.intervals.binary_search(time).ok(),
                    _ => None,
                };

                match index {
                    Some(index) => self.merge_row(&mut groups, entity, row, Some(index)),
                    None => mq_log::trace!(%entity, "dropped series row outside of intervals"),
                }
            }
        }

        let groups: Vec<_> = groups
            .into_iter()
            .map(|(key, data)| self.finish_group(key, data))
            .collect();

        mq_log::debug!(groups = groups.len(), "converted query results");

        let mut meta: Vec<_> = plan.groupby.iter().map(groupby_meta).collect();
        meta.extend(plan.fields.iter().map(translate_meta));

        MetricsQueryResult {
            start: plan.start,
            end: plan.end,
            intervals: match plan.include_series {
                true => plan.intervals.clone(),
                false => Vec::new(),
            },
            groups,
            meta,
        }
    }

    fn collect_groups(
        &self,
        results: &BTreeMap<EntityKey, EntityRows>,
    ) -> IndexMap<Vec<Value>, GroupData> {
        let plan = self.plan;
        let mut groups = IndexMap::new();

        if plan.groupby.is_empty() {
            groups.insert(Vec::new(), GroupData::new());
            return groups;
        }

        let entities = match (plan.ordered, plan.primary_entity) {
            (true, Some(primary)) => vec![primary],
            _ => plan.entity_order(),
        };

        for entity in entities {
            let Some(rows) = results.get(&entity) else {
                continue;
            };

            let series: &[Row] = match plan.ordered && plan.include_totals {
                true => &[],
                false => &rows.series,
            };

            for row in rows.totals.iter().chain(series) {
                groups
                    .entry(group_key(row, &plan.groupby))
                    .or_insert_with(GroupData::new);
            }
        }

        if plan.ordered {
            return groups;
        }

        groups.sort_by(|a, _, b, _| compare_groups(a, b, &plan.group_order));
        let offset = usize::try_from(plan.offset).unwrap_or(usize::MAX);
        let limit = usize::try_from(plan.limit).unwrap_or(usize::MAX);
        groups.into_iter().skip(offset).take(limit).collect()
    }

    fn merge_row(
        &self,
        groups: &mut IndexMap<Vec<Value>, GroupData>,
        entity: EntityKey,
        row: &Row,
        index: Option<usize>,
    ) {
        let key = group_key(row, &self.plan.groupby);
        let Some(data) = groups.get_mut(&key) else {
            mq_log::trace!(%entity, "dropped row of group missing in primary entity");
            return;
        };

        for (alias, value) in row {
            let is_groupby = self.plan.groupby.iter().any(|g| g.alias() == alias);
            if is_groupby || alias == BUCKETED_TIME_ALIAS {
                continue;
            }

            data.entry(alias.clone())
                .or_default()
                .set(index, value.as_f64());
        }
    }

    fn finish_group(&self, key: Vec<Value>, mut data: GroupData) -> Group {
        let plan = self.plan;

        let by = plan
            .groupby
            .iter()
            .zip(key)
            .map(|(groupby, value)| {
                let value = self.groupby_value(groupby, value);
                (groupby.alias().to_owned(), value)
            })
            .collect();

        let mut totals = BTreeMap::new();
        let mut series = BTreeMap::new();

        for field in &plan.fields {
            if plan.include_totals {
                let value = self.evaluate(field, &mut data, None);
                totals.insert(field.alias.clone(), output_value(field, value));
            }

            if plan.include_series {
                let values = (0..plan.intervals.len())
                    .map(|index| output_value(field, self.evaluate(field, &mut data, Some(index))))
                    .collect();
                series.insert(field.alias.clone(), values);
            }
        }

        Group { by, totals, series }
    }

    fn groupby_value(&self, groupby: &MetricGroupBy, value: Value) -> Value {
        match (groupby, value) {
            (MetricGroupBy::Tag(_), Value::Int(MISSING_TAG_VALUE)) => Value::Null,
            (MetricGroupBy::Tag(_), Value::Int(id)) => self
                .resolver
                .reverse(StringKind::TagValue, id)
                .map_or(Value::Null, Value::String),
            (_, value) => value,
        }
    }

    /// Computes the value of a field in the total for `None`, or in the interval at `index`.
    ///
    /// Missing values take the default of the field. For composite metrics, constituents take
    /// their own defaults and intermediate composites are stored under their child alias.
    fn evaluate(
        &self,
        field: &PlannedField,
        data: &mut GroupData,
        index: Option<usize>,
    ) -> Option<f64> {
        let value = match field.kind {
            FieldKind::Raw { .. } | FieldKind::Singular { .. } => {
                data.get(&field.alias).and_then(|values| values.get(index))
            }
            FieldKind::Composite {
                ref children,
                ref dependencies,
            } => {
                for child in children {
                    let values = data.entry(child.alias.clone()).or_default();
                    if values.get(index).is_none() {
                        values.set(index, child.default);
                    }
                }

                let mut value = None;
                for name in dependencies {
                    let Some(metric) = self.registry.get(name) else {
                        continue;
                    };

                    value = metric.run_post_query_function(data, index, &field.alias);
                    if *name != field.field.metric {
                        data.entry(child_alias(name, &field.alias))
                            .or_default()
                            .set(index, value);
                    }
                }
                value
            }
        };

        value.or(field.default)
    }
}

/// Compares raw group-by values in the given order. Nulls sort last in both directions.
fn compare_groups(a: &[Value], b: &[Value], order: &[(usize, Direction)]) -> Ordering {
    for &(index, direction) in order {
        let (Some(a), Some(b)) = (a.get(index), b.get(index)) else {
            continue;
        };

        let ordering = match (a.is_null(), b.is_null(), direction) {
            (true, true, _) => Ordering::Equal,
            (true, false, _) => Ordering::Greater,
            (false, true, _) => Ordering::Less,
            (false, false, Direction::Asc) => a.total_cmp(b),
            (false, false, Direction::Desc) => b.total_cmp(a),
        };

        if ordering.is_ne() {
            return ordering;
        }
    }

    Ordering::Equal
}

fn output_value(field: &PlannedField, value: Option<f64>) -> Value {
    match value {
        Some(value) if field.is_integer() => Value::Int(value.round() as i64),
        Some(value) => Value::Float(value),
        None => Value::Null,
    }
}
