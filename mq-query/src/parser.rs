//! Parser for the tag filter language and resolution of tags in conditions.
//!
//! Filters are a sequence of clauses, implicitly joined with `AND`:
//!
//!  - `key:value` and `key:"quoted value"` match tags equal to the value. Quoted values support
//!    `\"` and `\\` escapes. `key:""` matches an empty or missing tag.
//!  - `key:[a, "b c"]` matches tags equal to any of the listed values.
//!  - `!key:value` and `!key:[...]` negate the clause.
//!  - `has:key` and `!has:key` check for the presence of a tag.
//!  - `( ... )` groups clauses.
//!
//! Clauses are joined with `AND` or `OR`, case-insensitive. Mixed chains group from left to right,
//! so `a:1 OR b:2 AND c:3` means `(a:1 OR b:2) AND c:3`.

use mq_indexer::{Resolver, StringKind};
use pest::Parser;
use pest::error::InputLocation;
use pest::iterators::Pair;
use thiserror::Error;

use crate::snql::{Column, Condition, Expr, Func, Op, Value};

mod grammar {
    use pest_derive::Parser;

    #[derive(Parser)]
    #[grammar = "query.pest"]
    pub struct QueryParser;
}

use self::grammar::{QueryParser, Rule};

/// Tag values that refer to the project instead of a tag.
const PROJECT_KEYS: &[&str] = &["project_id", "project"];

/// The indexed id that stands for an empty or missing tag value.
const EMPTY_TAG_VALUE: i64 = 0;

/// A malformed filter query.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("parse error at column {column}: unexpected {token:?}")]
pub struct ParseError {
    /// The 1-indexed column of the offending token.
    pub column: usize,
    /// The offending token, up to the next whitespace.
    pub token: String,
}

impl ParseError {
    fn at(query: &str, pos: usize) -> Self {
        let pos = pos.min(query.len());
        let start = query[..pos]
            .rfind(char::is_whitespace)
            .map_or(0, |index| index + 1);
        let end = query[pos..]
            .find(char::is_whitespace)
            .map_or(query.len(), |index| pos + index);

        Self {
            column: query[..start].chars().count() + 1,
            token: query[start..end].to_owned(),
        }
    }
}

/// Parses a filter query into a condition tree.
///
/// Returns `None` for an empty query.
///
/// # Example
///
/// ```
/// use mq_query::parse_query;
///
/// let condition = parse_query("transaction:/foo !environment:[dev, test]").unwrap();
/// assert_eq!(
///     condition.unwrap().to_string(),
///     "tags[transaction] = '/foo' AND tags[environment] NOT IN ('dev', 'test')"
/// );
/// ```
pub fn parse_query(query: &str) -> Result<Option<Condition>, ParseError> {
    let root = QueryParser::parse(Rule::query, query)
        .map_err(|error| {
            let pos = match error.location {
                InputLocation::Pos(pos) => pos,
                InputLocation::Span((start, _)) => start,
            };
            ParseError::at(query, pos)
        })?
        .next()
        .ok_or_else(|| ParseError::at(query, 0))?;

    let mut condition = None;
    for pair in root.into_inner() {
        if pair.as_rule() == Rule::expression {
            condition = Some(handle_expression(query, pair)?);
        }
    }

    Ok(condition)
}

#[derive(Clone, Copy, Eq, PartialEq)]
enum BoolOp {
    And,
    Or,
}

fn handle_expression(query: &str, pair: Pair<'_, Rule>) -> Result<Condition, ParseError> {
    let mut current: Option<Condition> = None;
    let mut chain: Option<BoolOp> = None;
    let mut pending = BoolOp::And;

    for pair in pair.into_inner() {
        let term = match pair.as_rule() {
            Rule::and_op => {
                pending = BoolOp::And;
                continue;
            }
            Rule::or_op => {
                pending = BoolOp::Or;
                continue;
            }
            _ => handle_term(query, pair)?,
        };

        current = Some(match (current, chain) {
            (None, _) => term,
            (Some(Condition::And(mut children)), Some(BoolOp::And)) if pending == BoolOp::And => {
                children.push(term);
                Condition::And(children)
            }
            (Some(Condition::Or(mut children)), Some(BoolOp::Or)) if pending == BoolOp::Or => {
                children.push(term);
                Condition::Or(children)
            }
            (Some(previous), _) => {
                chain = Some(pending);
                match pending {
                    BoolOp::And => Condition::And(vec![previous, term]),
                    BoolOp::Or => Condition::Or(vec![previous, term]),
                }
            }
        });

        pending = BoolOp::And;
    }

    current.ok_or_else(|| ParseError::at(query, 0))
}

fn handle_term(query: &str, pair: Pair<'_, Rule>) -> Result<Condition, ParseError> {
    let start = pair.as_span().start();

    match pair.as_rule() {
        Rule::group => match pair.into_inner().next() {
            Some(inner) => handle_expression(query, inner),
            None => Err(ParseError::at(query, start)),
        },
        Rule::has_filter => {
            let mut negated = false;
            let mut key = None;
            for inner in pair.into_inner() {
                match inner.as_rule() {
                    Rule::negation => negated = true,
                    Rule::key => key = Some(inner.as_str()),
                    _ => {}
                }
            }

            let key = key.ok_or_else(|| ParseError::at(query, start))?;
            Ok(has_condition(key, !negated))
        }
        Rule::filter => handle_filter(query, pair),
        _ => Err(ParseError::at(query, start)),
    }
}

fn handle_filter(query: &str, pair: Pair<'_, Rule>) -> Result<Condition, ParseError> {
    let start = pair.as_span().start();
    let mut negated = false;
    let mut key = None;
    let mut values = None;
    let mut is_list = false;

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::negation => negated = true,
            Rule::key => key = Some(inner.as_str()),
            Rule::value_list => {
                is_list = true;
                values = Some(inner.into_inner().map(handle_value).collect::<Vec<_>>());
            }
            Rule::quoted_value | Rule::unquoted_value => values = Some(vec![handle_value(inner)]),
            _ => {}
        }
    }

    let (Some(key), Some(values)) = (key, values) else {
        return Err(ParseError::at(query, start));
    };

    let is_project = PROJECT_KEYS.contains(&key);
    let column = match is_project {
        true => Column::ProjectId,
        false => Column::Tag(key.to_owned()),
    };

    let mut values = values.into_iter().map(move |value| match is_project {
        true => value
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| ParseError::at(query, start)),
        false => Ok(Value::String(value)),
    });

    if is_list {
        let items = values
            .map(|v| v.map(Expr::Value))
            .collect::<Result<Vec<_>, _>>()?;
        let op = if negated { Op::NotIn } else { Op::In };
        Ok(Condition::new(column, op, Expr::Tuple(items)))
    } else {
        let value = values
            .next()
            .ok_or_else(|| ParseError::at(query, start))??;
        let op = if negated { Op::NotEq } else { Op::Eq };
        Ok(Condition::new(column, op, value))
    }
}

fn handle_value(pair: Pair<'_, Rule>) -> String {
    match pair.as_rule() {
        Rule::quoted_value => pair
            .into_inner()
            .next()
            .map(|inner| unescape(inner.as_str()))
            .unwrap_or_default(),
        _ => pair.as_str().to_owned(),
    }
}

fn unescape(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }

        match chars.next() {
            Some(escaped @ ('"' | '\\')) => result.push(escaped),
            Some(other) => {
                result.push('\\');
                result.push(other);
            }
            None => result.push('\\'),
        }
    }

    result
}

/// Creates the condition `has(tags.key, key) = 1`, or `= 0` if `present` is `false`.
pub fn has_condition(key: &str, present: bool) -> Condition {
    Condition::new(
        Expr::call(Func::Has, [Column::TagKeys.into(), Expr::value(key)]),
        Op::Eq,
        Value::Int(i64::from(present)),
    )
}

/// How values at a position of a condition are resolved.
#[derive(Clone, Debug)]
enum Slot {
    TagValue,
    Passthrough,
    Tuple(Vec<Slot>),
}

impl Slot {
    fn for_lhs(lhs: &Expr) -> Self {
        match lhs {
            Expr::Column(Column::Tag(_) | Column::TagId(_)) => Slot::TagValue,
            Expr::Tuple(items) => Slot::Tuple(items.iter().map(Slot::for_lhs).collect()),
            _ => Slot::Passthrough,
        }
    }
}

/// Replaces tag names and tag values with their indexed ids.
///
/// Unknown tags and values resolve to [`STRING_NOT_FOUND`](mq_indexer::STRING_NOT_FOUND), which
/// matches no rows. Empty values resolve to the id of missing tags. Project ids and other columns
/// are left unchanged. This also resolves the tuples of `(a, b) IN ((x, y), ...)` conditions and
/// the keys of `has` checks.
pub fn resolve_tags(condition: &Condition, resolver: &Resolver<'_>) -> Condition {
    map_condition(condition, &mut |lhs, op, rhs| {
        let slot = Slot::for_lhs(lhs);
        let lhs = map_columns(lhs, &mut |column| match column {
            Column::Tag(name) => Column::TagId(resolver.resolve_weak(StringKind::TagKey, name)),
            other => other.clone(),
        });
        let lhs = match lhs {
            Expr::Function(Func::Has, args) => Expr::Function(
                Func::Has,
                args.into_iter()
                    .map(|arg| match arg {
                        Expr::Value(Value::String(key)) => {
                            Expr::value(resolver.resolve_weak(StringKind::TagKey, &key))
                        }
                        other => other,
                    })
                    .collect(),
            ),
            other => other,
        };

        let rhs = map_values(rhs, &slot, &mut |value| match value {
            Value::String(s) if s.is_empty() => Value::Int(EMPTY_TAG_VALUE),
            Value::String(s) => Value::Int(resolver.resolve_weak(StringKind::TagValue, s)),
            other => other.clone(),
        });

        Condition::Leaf { lhs, op, rhs }
    })
}

/// Replaces indexed tag ids and tag value ids with their strings.
///
/// This is the inverse of [`resolve_tags`] for strings that exist in the indexer. Ids that cannot
/// be reversed are left unchanged.
pub fn reverse_resolve_tags(condition: &Condition, resolver: &Resolver<'_>) -> Condition {
    map_condition(condition, &mut |lhs, op, rhs| {
        let slot = Slot::for_lhs(lhs);
        let lhs = map_columns(lhs, &mut |column| match column {
            Column::TagId(id) => resolver
                .reverse(StringKind::TagKey, *id)
                .map_or(Column::TagId(*id), Column::Tag),
            other => other.clone(),
        });
        let lhs = match lhs {
            Expr::Function(Func::Has, args) => Expr::Function(
                Func::Has,
                args.into_iter()
                    .map(|arg| match arg {
                        Expr::Value(Value::Int(id)) => resolver
                            .reverse(StringKind::TagKey, id)
                            .map_or(Expr::value(id), Expr::value),
                        other => other,
                    })
                    .collect(),
            ),
            other => other,
        };

        let rhs = map_values(rhs, &slot, &mut |value| match value {
            Value::Int(EMPTY_TAG_VALUE) => Value::from(""),
            Value::Int(id) => resolver
                .reverse(StringKind::TagValue, *id)
                .map_or(Value::Int(*id), Value::String),
            other => other.clone(),
        });

        Condition::Leaf { lhs, op, rhs }
    })
}

fn map_condition(
    condition: &Condition,
    f: &mut impl FnMut(&Expr, Op, &Expr) -> Condition,
) -> Condition {
    match condition {
        Condition::Leaf { lhs, op, rhs } => f(lhs, *op, rhs),
        Condition::And(children) => {
            Condition::And(children.iter().map(|c| map_condition(c, f)).collect())
        }
        Condition::Or(children) => {
            Condition::Or(children.iter().map(|c| map_condition(c, f)).collect())
        }
    }
}

fn map_columns(expr: &Expr, f: &mut impl FnMut(&Column) -> Column) -> Expr {
    match expr {
        Expr::Column(column) => Expr::Column(f(column)),
        Expr::Value(value) => Expr::Value(value.clone()),
        Expr::Tuple(items) => Expr::Tuple(items.iter().map(|i| map_columns(i, f)).collect()),
        Expr::Function(func, args) => {
            Expr::Function(*func, args.iter().map(|a| map_columns(a, f)).collect())
        }
    }
}

fn map_values(expr: &Expr, slot: &Slot, f: &mut impl FnMut(&Value) -> Value) -> Expr {
    match (expr, slot) {
        (Expr::Value(value), Slot::TagValue) => Expr::Value(map_value(value, f)),
        // A list of alternatives for a single tag.
        (Expr::Tuple(items), Slot::TagValue) => {
            Expr::Tuple(items.iter().map(|i| map_values(i, slot, f)).collect())
        }
        // Either a tuple matching the columns, or a list of such tuples.
        (Expr::Tuple(items), Slot::Tuple(slots)) => {
            if items.iter().all(|i| matches!(i, Expr::Tuple(_))) && !items.is_empty() {
                Expr::Tuple(items.iter().map(|i| map_values(i, slot, f)).collect())
            } else {
                Expr::Tuple(
                    items
                        .iter()
                        .zip(slots)
                        .map(|(item, slot)| map_values(item, slot, f))
                        .collect(),
                )
            }
        }
        (other, _) => other.clone(),
    }
}

fn map_value(value: &Value, f: &mut impl FnMut(&Value) -> Value) -> Value {
    match value {
        Value::Tuple(items) => Value::Tuple(items.iter().map(|i| map_value(i, f)).collect()),
        other => f(other),
    }
}

#[cfg(test)]
mod tests {
    use mq_base_schema::metrics::UseCaseId;
    use mq_base_schema::project::OrganizationId;
    use mq_indexer::{MemoryIndexer, STRING_NOT_FOUND};
    use similar_asserts::assert_eq;

    use super::*;

    fn parse(query: &str) -> String {
        parse_query(query).unwrap().unwrap().to_string()
    }

    fn tag(name: &str) -> Expr {
        Column::Tag(name.to_owned()).into()
    }

    #[test]
    fn test_parse_empty() {
        assert_eq!(parse_query("").unwrap(), None);
        assert_eq!(parse_query("   ").unwrap(), None);
    }

    #[test]
    fn test_parse_single_clause() {
        assert_eq!(
            parse_query("release:1.0").unwrap(),
            Some(Condition::new(tag("release"), Op::Eq, Value::from("1.0")))
        );
    }

    #[test]
    fn test_parse_clause_shapes() {
        insta::assert_snapshot!(
            parse(r#"transaction:"/foo bar" !environment:dev dist:"" release:["1.0", 2.0]"#),
            @"tags[transaction] = '/foo bar' AND tags[environment] != 'dev' AND tags[dist] = '' AND tags[release] IN ('1.0', '2.0')"
        );
        insta::assert_snapshot!(
            parse("!release:[a,b] project_id:[1, 2] project:3"),
            @"tags[release] NOT IN ('a', 'b') AND project_id IN (1, 2) AND project_id = 3"
        );
    }

    #[test]
    fn test_parse_escapes() {
        assert_eq!(
            parse_query(r#"transaction:"say \"hi\" \\o/""#).unwrap(),
            Some(Condition::new(
                tag("transaction"),
                Op::Eq,
                Value::from(r#"say "hi" \o/"#)
            ))
        );
    }

    #[test]
    fn test_parse_has() {
        assert_eq!(
            parse_query("has:release !has:dist").unwrap(),
            Some(Condition::And(vec![
                has_condition("release", true),
                has_condition("dist", false),
            ]))
        );
        insta::assert_snapshot!(parse("has:release"), @"has(tags.key, 'release') = 1");
    }

    #[test]
    fn test_parse_boolean_operators() {
        insta::assert_snapshot!(parse("a:1 OR b:2"), @"tags[a] = '1' OR tags[b] = '2'");
        insta::assert_snapshot!(parse("a:1 or b:2 OR c:3"), @"tags[a] = '1' OR tags[b] = '2' OR tags[c] = '3'");
        insta::assert_snapshot!(parse("a:1 OR b:2 AND c:3"), @"(tags[a] = '1' OR tags[b] = '2') AND tags[c] = '3'");
        insta::assert_snapshot!(parse("a:1 AND b:2 c:3"), @"tags[a] = '1' AND tags[b] = '2' AND tags[c] = '3'");
        insta::assert_snapshot!(parse("a:1 (b:2 OR c:3)"), @"tags[a] = '1' AND (tags[b] = '2' OR tags[c] = '3')");
        insta::assert_snapshot!(parse("android:1 order:2"), @"tags[android] = '1' AND tags[order] = '2'");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            parse_query("transaction:foo hello"),
            Err(ParseError {
                column: 17,
                token: "hello".to_owned()
            })
        );
        assert_eq!(
            parse_query("release:1.0 ]").unwrap_err(),
            ParseError {
                column: 13,
                token: "]".to_owned()
            }
        );
        assert_eq!(parse_query("a:1 AND").unwrap_err().token, "AND");
        assert_eq!(parse_query("project_id:abc").unwrap_err().column, 1);
    }

    fn indexer() -> MemoryIndexer {
        let org = OrganizationId::new(1);
        let indexer = MemoryIndexer::new();
        indexer.bulk_record(
            UseCaseId::Transactions,
            org,
            StringKind::TagKey,
            ["transaction", "environment", "release"],
        );
        indexer.bulk_record(
            UseCaseId::Transactions,
            org,
            StringKind::TagValue,
            ["/foo", "dev", "prod", "1.0"],
        );
        indexer
    }

    #[test]
    fn test_resolve_tags() {
        let indexer = indexer();
        let resolver = Resolver::new(&indexer, UseCaseId::Transactions, OrganizationId::new(1));

        let condition = parse_query(
            "transaction:/foo !environment:[dev, staging] has:release dist:x release:\"\" project_id:5",
        )
        .unwrap()
        .unwrap();

        insta::assert_snapshot!(
            resolve_tags(&condition, &resolver),
            @"tags[1] = 1 AND tags[2] NOT IN (2, -1) AND has(tags.key, 3) = 1 AND tags[-1] = -1 AND tags[3] = 0 AND project_id = 5"
        );
    }

    #[test]
    fn test_resolve_tuple_condition() {
        let indexer = indexer();
        let resolver = Resolver::new(&indexer, UseCaseId::Transactions, OrganizationId::new(1));

        let condition = Condition::new(
            Expr::Tuple(vec![tag("transaction"), Column::ProjectId.into()]),
            Op::In,
            Expr::Tuple(vec![
                Expr::Tuple(vec![Expr::value("/foo"), Expr::value(1)]),
                Expr::Tuple(vec![Expr::value("/bar"), Expr::value(2)]),
            ]),
        );

        let resolved = resolve_tags(&condition, &resolver);
        assert_eq!(
            resolved,
            Condition::new(
                Expr::Tuple(vec![Column::TagId(1).into(), Column::ProjectId.into()]),
                Op::In,
                Expr::Tuple(vec![
                    Expr::Tuple(vec![Expr::value(1), Expr::value(1)]),
                    Expr::Tuple(vec![Expr::value(STRING_NOT_FOUND), Expr::value(2)]),
                ]),
            )
        );
    }

    #[test]
    fn test_resolve_roundtrip() {
        let indexer = indexer();
        let resolver = Resolver::new(&indexer, UseCaseId::Transactions, OrganizationId::new(1));

        let condition = parse_query(
            r#"(transaction:/foo OR !environment:[dev, prod]) has:release release:"" project_id:[1,2]"#,
        )
        .unwrap()
        .unwrap();

        let resolved = resolve_tags(&condition, &resolver);
        assert_ne!(resolved, condition);
        assert_eq!(reverse_resolve_tags(&resolved, &resolver), condition);
    }
}
