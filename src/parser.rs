//! Structural parser: YQL documents to IR.
//!
//! The parser walks the YAML tree, checks its shape and builds a `Query`.
//! String leaves are handed to the expression classifier in `expr`. Aliases
//! are checked here so that every query that parses refers only to sources
//! it binds.

use std::collections::HashSet;

use serde_yaml::{Mapping, Value};
use tracing::{debug, trace};

use crate::error::ParseError;
use crate::expr::{classify, classify_str};
use crate::import::{self, Definitions, ImportResolver, NoImports};
use crate::map::OrderMap;
use crate::ops::{self, Kind};
use crate::query::*;
use crate::schema::Schema;
use crate::util::{child_path, index_path, is_simple_ident, try_map_indexed};

pub type Result<T> = std::result::Result<T, ParseError>;

/// A parsed YQL document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub query: Query,
    /// The embedded schema, if the document has one.
    pub schema: Option<Schema>,
}

/// Parses a YQL document. Imports are refused.
pub fn parse(text: &str) -> Result<Document> {
    parse_with(text, &NoImports)
}

/// Parses a YQL document, loading imports through `resolver`.
pub fn parse_with(text: &str, resolver: &dyn ImportResolver) -> Result<Document> {
    let value: Value = serde_yaml::from_str(text).map_err(|e| ParseError::Yaml(e.to_string()))?;
    parse_value(&value, resolver)
}

/// Parses an already loaded YQL document.
pub fn parse_value(value: &Value, resolver: &dyn ImportResolver) -> Result<Document> {
    let root = match value {
        Value::Mapping(root) => root,
        Value::Null => return Err(ParseError::MissingRoot),
        _ => return Err(invalid("document", "expected a mapping")),
    };
    let defs = import::load(root, resolver)?;
    let parser = Parser { defs: &defs };
    let query = parser.root(root)?;
    let schema = field(root, "schema").map(Schema::from_value).transpose()?;
    debug!(kind = query.kind(), schema = schema.is_some(), "parsed document");
    Ok(Document { query, schema })
}

struct Parser<'d> {
    defs: &'d Definitions,
}

fn invalid(path: &str, reason: impl Into<String>) -> ParseError {
    ParseError::Invalid {
        path: path.to_string(),
        reason: reason.into(),
    }
}

/// Looks up a key, treating `null` as absent.
fn field<'a>(map: &'a Mapping, key: &str) -> Option<&'a Value> {
    match map.get(key) {
        None | Some(Value::Null) => None,
        Some(value) => Some(value),
    }
}

fn required<'a>(map: &'a Mapping, key: &str, path: &str) -> Result<&'a Value> {
    field(map, key).ok_or_else(|| ParseError::MissingField(child_path(path, key)))
}

fn as_mapping<'a>(value: &'a Value, path: &str) -> Result<&'a Mapping> {
    value
        .as_mapping()
        .ok_or_else(|| invalid(path, "expected a mapping"))
}

fn as_str<'a>(value: &'a Value, path: &str) -> Result<&'a str> {
    value.as_str().ok_or_else(|| invalid(path, "expected a string"))
}

fn key_str<'a>(key: &'a Value, path: &str) -> Result<&'a str> {
    key.as_str()
        .ok_or_else(|| invalid(path, "mapping keys must be strings"))
}

/// Reads a string or a list of strings.
fn string_list(value: &Value, path: &str) -> Result<Vec<String>> {
    match value {
        Value::String(s) => Ok(vec![s.trim().to_string()]),
        Value::Sequence(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| as_str(item, &index_path(path, i)).map(|s| s.trim().to_string()))
            .collect(),
        _ => Err(invalid(path, "expected a string or a list of strings")),
    }
}

/// Reads a single-entry `alias: table` mapping.
fn table_ref(value: &Value, path: &str) -> Result<TableRef> {
    let map = as_mapping(value, path)?;
    let mut entries = map.iter();
    match (entries.next(), entries.next()) {
        (Some((alias, table)), None) => Ok(TableRef {
            alias: key_str(alias, path)?.to_string(),
            table: as_str(table, path)?.to_string(),
        }),
        _ => Err(invalid(path, "expected a single `alias: table` entry")),
    }
}

/// Reads a condition list. A single condition may be given without a list.
fn conditions(value: &Value, path: &str) -> Result<Vec<Expression>> {
    match value {
        Value::Sequence(items) => try_map_indexed(items, path, condition),
        other => Ok(vec![condition(other, path)?]),
    }
}

fn condition(value: &Value, path: &str) -> Result<Expression> {
    match value {
        Value::Mapping(map) if map.contains_key("field") => comparison(map, path),
        other => classify(other, path),
    }
}

/// Reads a structured `{field, operator, value}` condition.
fn comparison(map: &Mapping, path: &str) -> Result<Expression> {
    let lhs = classify(required(map, "field", path)?, &child_path(path, "field"))?;
    let op_path = child_path(path, "operator");
    let written = match field(map, "operator") {
        Some(op) => as_str(op, &op_path)?,
        None => "=",
    };
    let op = ops::normalize(written);
    if ops::kind(&op) != Some(Kind::Comp) {
        return Err(invalid(&op_path, format!("unknown operator '{}'", written)));
    }
    let value_path = child_path(path, "value");
    let value = map
        .get("value")
        .ok_or_else(|| ParseError::MissingField(value_path.clone()))?;
    let rhs = if ops::takes_list(&op) {
        match value {
            Value::Sequence(items) if !items.is_empty() => Expression::List(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| classify(item, &index_path(&value_path, i)))
                    .collect::<Result<_>>()?,
            ),
            _ => return Err(invalid(&value_path, format!("{} takes a non-empty list", op))),
        }
    } else {
        classify(value, &value_path)?
    };
    Ok(Expression::Comparison {
        lhs: Box::new(lhs),
        op,
        rhs: Box::new(rhs),
    })
}

/// Reads an expression or a list of expressions.
fn expressions(value: &Value, path: &str) -> Result<Vec<Expression>> {
    match value {
        Value::Sequence(items) => try_map_indexed(items, path, classify),
        other => Ok(vec![classify(other, path)?]),
    }
}

/// Reads a list of projections.
fn projections(value: &Value, path: &str) -> Result<Vec<Projection>> {
    let mut out = Vec::new();
    match value {
        Value::Sequence(items) => {
            for (i, item) in items.iter().enumerate() {
                let here = index_path(path, i);
                match item {
                    Value::Mapping(map) => named_projections(map, &here, &mut out)?,
                    Value::String(s) => out.push(projection_str(s, &here)?),
                    _ => return Err(invalid(&here, "expected `alias: expression` or a column")),
                }
            }
        }
        Value::Mapping(map) => named_projections(map, path, &mut out)?,
        Value::String(s) => out.push(projection_str(s, path)?),
        _ => return Err(invalid(path, "expected a list of projections")),
    }

    let mut seen = HashSet::new();
    for p in &out {
        if let Projection::Named { alias, .. } = p {
            if !seen.insert(alias.as_str()) {
                return Err(ParseError::DuplicateAlias(alias.clone()));
            }
        }
    }
    Ok(out)
}

fn named_projections(map: &Mapping, path: &str, out: &mut Vec<Projection>) -> Result<()> {
    for (alias, expr) in map {
        let alias = key_str(alias, path)?;
        out.push(Projection::Named {
            alias: alias.to_string(),
            expr: classify(expr, path)?,
        });
    }
    Ok(())
}

fn projection_str(text: &str, path: &str) -> Result<Projection> {
    let text = text.trim();
    if text == "*" {
        return Ok(Projection::Wildcard { qualifier: None });
    }
    if let Some(qualifier) = text.strip_suffix(".*") {
        if is_simple_ident(qualifier) {
            return Ok(Projection::Wildcard {
                qualifier: Some(qualifier.to_string()),
            });
        }
    }
    match classify_str(text, path)? {
        Expression::Column(col) => Ok(Projection::Named {
            alias: col.name.clone(),
            expr: Expression::Column(col),
        }),
        _ => Err(invalid(path, "expression needs an alias (`alias: expression`)")),
    }
}

fn order_by(value: &Value, path: &str) -> Result<Vec<OrderSpec>> {
    match value {
        Value::Sequence(items) => items
            .iter()
            .enumerate()
            .map(|(index, item)| order_spec(item, path, index))
            .collect(),
        other => Ok(vec![order_spec(other, path, 0)?]),
    }
}

fn order_spec(item: &Value, path: &str, index: usize) -> Result<OrderSpec> {
    let err = || ParseError::InvalidOrderSpec {
        path: path.to_string(),
        index,
    };
    let here = index_path(path, index);
    let direction = |value: Option<&Value>| match value {
        None => Ok(Direction::Asc),
        Some(v) => v.as_str().and_then(|s| s.parse().ok()).ok_or_else(err),
    };
    match item {
        Value::String(s) => {
            let (expr, direction) = split_direction(s);
            Ok(OrderSpec {
                expr: classify_str(expr, &here)?,
                direction,
            })
        }
        Value::Mapping(map) if map.contains_key("field") => Ok(OrderSpec {
            expr: classify(required(map, "field", &here)?, &here)?,
            direction: direction(field(map, "direction"))?,
        }),
        Value::Mapping(map) if map.len() == 1 => {
            let (key, dir) = map.iter().next().ok_or_else(err)?;
            let key = key.as_str().ok_or_else(err)?;
            Ok(OrderSpec {
                expr: classify_str(key, &here)?,
                direction: direction(Some(dir))?,
            })
        }
        _ => Err(err()),
    }
}

/// Splits a trailing ASC or DESC off an order expression.
fn split_direction(text: &str) -> (&str, Direction) {
    let text = text.trim();
    if let Some((head, tail)) = text.rsplit_once(char::is_whitespace) {
        if let Ok(direction) = tail.parse() {
            if !head.trim().is_empty() {
                return (head.trim_end(), direction);
            }
        }
    }
    (text, Direction::Asc)
}

fn row_count(value: &Value, path: &str) -> Result<RowCount> {
    let err = || invalid(path, "expected a non-negative integer or a placeholder");
    match value {
        Value::Number(n) => n.as_u64().map(RowCount::Count).ok_or_else(err),
        Value::String(s) => {
            if let Ok(count) = s.trim().parse() {
                return Ok(RowCount::Count(count));
            }
            match classify_str(s, path)? {
                Expression::Placeholder(p) => Ok(RowCount::Param(p)),
                _ => Err(err()),
            }
        }
        _ => Err(err()),
    }
}

fn pagination(value: &Value, path: &str) -> Result<Pagination> {
    let map = as_mapping(value, path)?;
    let count = |key: &str, default: &str| -> Result<RowCount> {
        match field(map, key) {
            Some(v) => row_count(v, &child_path(path, key)),
            None => Ok(RowCount::Param(Placeholder {
                name: key.to_string(),
                default: Some(default.to_string()),
            })),
        }
    };
    let page = count("page", "1")?;
    let per_page = count("per_page", "20")?;
    if page == RowCount::Count(0) {
        return Err(invalid(&child_path(path, "page"), "pages are numbered from 1"));
    }
    Ok(Pagination { page, per_page })
}

/// Checks that every qualifier in `expr` is bound.
///
/// Aliases and tables introduced by the fragment's own FROM/JOIN clauses
/// count as bound.
fn check_expr(expr: &Expression, bound: &[&str], path: &str) -> Result<()> {
    let locals = expr.local_aliases();
    let sources = expr.sources();
    for col in expr.column_refs() {
        let qualifier = match col.qualifier.as_deref() {
            Some(q) => q,
            None => continue,
        };
        let known = bound.iter().any(|b| b.eq_ignore_ascii_case(qualifier))
            || locals.contains(&qualifier)
            || sources.iter().any(|s| s.split('.').any(|seg| seg == qualifier));
        if !known {
            return Err(ParseError::UnboundAlias {
                alias: qualifier.to_string(),
                path: path.to_string(),
            });
        }
    }
    Ok(())
}

fn check_all(exprs: &[Expression], bound: &[&str], path: &str) -> Result<()> {
    for (i, expr) in exprs.iter().enumerate() {
        check_expr(expr, bound, &index_path(path, i))?;
    }
    Ok(())
}

/// Returns the names a SELECT reads from, including those of its nested
/// CTE bodies that are not bound by the nested WITH itself.
fn select_sources(q: &SelectQuery) -> Vec<&str> {
    let mut sources = Vec::new();
    for (name, body) in q.ctes.iter() {
        sources.extend(select_sources(body).into_iter().filter(|s| *s != name.as_str()));
    }
    sources.push(q.from.table.as_str());
    sources.extend(q.joins.iter().map(|j| j.target.table.as_str()));
    for (_, expr) in q.expressions() {
        sources.extend(expr.sources());
    }
    sources.retain(|s| !q.ctes.contains(*s));
    sources
}

/// Returns the last segment of a dotted table name.
fn base_name(table: &str) -> &str {
    table.rsplit('.').next().unwrap_or(table)
}

impl<'d> Parser<'d> {
    fn root(&self, root: &Mapping) -> Result<Query> {
        if let Some(op) = field(root, "operation") {
            let op = as_str(op, "operation")?;
            return match op.trim().to_ascii_lowercase().as_str() {
                "insert" => self.insert(root).map(Query::Insert),
                "update" => self.update(root).map(Query::Update),
                "delete" => self.delete(root).map(Query::Delete),
                "upsert" => self.upsert(root).map(Query::Upsert),
                _ => Err(ParseError::UnknownOperation(op.to_string())),
            };
        }
        if let Some(query) = field(root, "query") {
            let query = as_mapping(query, "query")?;
            return self.select(query, "query", &[]).map(Query::Select);
        }
        if field(root, "select").is_some() {
            return self.select(root, "", &[]).map(Query::Select);
        }
        Err(ParseError::MissingRoot)
    }

    /// Parses a SELECT. `outer` holds the CTE names visible from enclosing
    /// queries.
    fn select(&self, map: &Mapping, path: &str, outer: &[String]) -> Result<SelectQuery> {
        let ctes = match field(map, "with_clauses") {
            Some(v) => self.ctes(v, &child_path(path, "with_clauses"), outer)?,
            None => OrderMap::new(),
        };
        let mut visible = outer.to_vec();
        visible.extend(ctes.keys().cloned());

        let select_path = child_path(path, "select");
        let select = match field(map, "select") {
            Some(v) => projections(v, &select_path)?,
            None => Vec::new(),
        };
        if select.is_empty() {
            return Err(ParseError::MissingField(select_path));
        }
        let from = table_ref(required(map, "from", path)?, &child_path(path, "from"))?;
        let joins = match field(map, "joins") {
            Some(v) => self.joins(v, &child_path(path, "joins"))?,
            None => Vec::new(),
        };

        let opt = |key: &str, f: fn(&Value, &str) -> Result<Vec<Expression>>| match field(map, key) {
            Some(v) => f(v, &child_path(path, key)),
            None => Ok(Vec::new()),
        };
        let filter = opt("where", conditions)?;
        let group_by = opt("group_by", expressions)?;
        let having = opt("having", conditions)?;
        let order_by = match field(map, "order_by") {
            Some(v) => order_by(v, &child_path(path, "order_by"))?,
            None => Vec::new(),
        };
        let limit = match field(map, "limit") {
            Some(v) => Some(row_count(v, &child_path(path, "limit"))?),
            None => None,
        };
        let offset = match field(map, "offset") {
            Some(v) => Some(row_count(v, &child_path(path, "offset"))?),
            None => None,
        };
        let pagination = match field(map, "pagination") {
            Some(v) => {
                let page_path = child_path(path, "pagination");
                if limit.is_some() || offset.is_some() {
                    return Err(invalid(&page_path, "cannot be combined with limit or offset"));
                }
                Some(pagination(v, &page_path)?)
            }
            None => None,
        };

        let query = SelectQuery {
            ctes,
            select,
            from,
            joins,
            filter,
            group_by,
            having,
            order_by,
            limit,
            offset,
            pagination,
        };
        check_select(&query, path, &visible)?;
        Ok(query)
    }

    /// Parses `with_clauses` in document order.
    fn ctes(
        &self,
        value: &Value,
        path: &str,
        outer: &[String],
    ) -> Result<OrderMap<String, SelectQuery>> {
        let map = as_mapping(value, path)?;
        let names = map
            .keys()
            .map(|k| key_str(k, path))
            .collect::<Result<Vec<_>>>()?;
        let mut defined = outer.to_vec();
        let mut ctes: OrderMap<String, SelectQuery> = OrderMap::new();
        for (name, body) in names.iter().zip(map.values()) {
            let here = child_path(path, name);
            trace!(cte = *name, "resolving CTE");
            let body = as_mapping(body, &here)?;
            let query = match field(body, "using") {
                Some(using) => {
                    let using = as_str(using, &child_path(&here, "using"))?;
                    let definition = self.defs.instantiate(using, field(body, "parameters"))?;
                    self.select(as_mapping(&definition, &here)?, &here, &[])?
                }
                None => self.select(body, &here, &defined)?,
            };
            for source in select_sources(&query) {
                if names.contains(&source) && !ctes.contains(source) {
                    return Err(ParseError::CircularOrForwardReference(source.to_string()));
                }
            }
            ctes.insert(name.to_string(), query);
            defined.push(name.to_string());
        }
        Ok(ctes)
    }

    fn joins(&self, value: &Value, path: &str) -> Result<Vec<Join>> {
        match value {
            Value::Sequence(items) => items
                .iter()
                .enumerate()
                .map(|(index, item)| self.join(item, path, index))
                .collect(),
            _ => Err(invalid(path, "expected a list of joins")),
        }
    }

    fn join(&self, item: &Value, path: &str, index: usize) -> Result<Join> {
        let err = |reason: &str| ParseError::InvalidJoin {
            path: path.to_string(),
            index,
            reason: reason.to_string(),
        };
        let here = index_path(path, index);
        let map = item.as_mapping().ok_or_else(|| err("expected a mapping"))?;
        let kind = match field(map, "type") {
            None => JoinKind::Inner,
            Some(v) => v
                .as_str()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| err("unknown join type"))?,
        };
        let alias = field(map, "alias")
            .and_then(Value::as_str)
            .ok_or_else(|| err("missing alias"))?;
        let table = field(map, "table")
            .and_then(Value::as_str)
            .ok_or_else(|| err("missing table"))?;
        let mut on = match field(map, "on") {
            Some(v) => conditions(v, &child_path(&here, "on"))?,
            None => Vec::new(),
        };
        if let Some(v) = field(map, "additional_conditions") {
            on.extend(conditions(v, &child_path(&here, "additional_conditions"))?);
        }
        match kind {
            JoinKind::Cross if !on.is_empty() => Err(err("CROSS JOIN takes no condition")),
            JoinKind::Cross => Ok(()),
            _ if on.is_empty() => Err(err("missing join condition")),
            _ => Ok(()),
        }?;
        Ok(Join {
            kind,
            target: TableRef {
                table: table.to_string(),
                alias: alias.to_string(),
            },
            on,
        })
    }

    fn insert(&self, root: &Mapping) -> Result<InsertStatement> {
        let table = as_str(required(root, "table", "")?, "table")?.to_string();
        let explicit = match field(root, "columns") {
            Some(v) => Some(column_list(v)?),
            None => None,
        };
        let returning = returning(root)?;
        if let Some(query) = field(root, "from_query") {
            if field(root, "values").is_some() {
                return Err(invalid("from_query", "cannot be combined with values"));
            }
            let columns = explicit.ok_or_else(|| ParseError::MissingField("columns".to_string()))?;
            let select = self.select(as_mapping(query, "from_query")?, "from_query", &[])?;
            return Ok(InsertStatement {
                table,
                columns,
                source: InsertSource::Select(Box::new(select)),
                returning,
            });
        }
        let (columns, rows) = values(root, explicit, &[table.as_str(), base_name(&table)])?;
        Ok(InsertStatement {
            table,
            columns,
            source: InsertSource::Values(rows),
            returning,
        })
    }

    fn update(&self, root: &Mapping) -> Result<UpdateStatement> {
        let (table, alias) = dml_target(root)?;
        let mut bound = vec![table.as_str(), base_name(&table)];
        bound.extend(alias.as_deref());
        let set = assignments(required(root, "set", "")?, "set", &bound)?;
        if set.is_empty() {
            return Err(ParseError::MissingField("set".to_string()));
        }
        let filter = dml_filter(root, &bound)?;
        Ok(UpdateStatement {
            set,
            filter,
            returning: returning(root)?,
            table,
            alias,
        })
    }

    fn delete(&self, root: &Mapping) -> Result<DeleteStatement> {
        let (table, alias) = dml_target(root)?;
        let mut bound = vec![table.as_str(), base_name(&table)];
        bound.extend(alias.as_deref());
        let filter = dml_filter(root, &bound)?;
        Ok(DeleteStatement {
            filter,
            returning: returning(root)?,
            table,
            alias,
        })
    }

    fn upsert(&self, root: &Mapping) -> Result<UpsertStatement> {
        let table = as_str(required(root, "table", "")?, "table")?.to_string();
        let explicit = match field(root, "columns") {
            Some(v) => Some(column_list(v)?),
            None => None,
        };
        let bound = [table.as_str(), base_name(&table)];
        let (columns, rows) = values(root, explicit, &bound)?;

        let on_conflict = as_mapping(required(root, "on_conflict", "")?, "on_conflict")?;
        let target = match field(on_conflict, "columns").or_else(|| field(on_conflict, "target")) {
            Some(v) => string_list(v, "on_conflict.columns")?,
            None => Vec::new(),
        };
        if target.is_empty() {
            return Err(ParseError::InvalidConflictTarget(
                "on_conflict.columns is missing or empty".to_string(),
            ));
        }
        let set_by_rows = |c: &String| rows.iter().any(|row| row.contains(c.as_str()));
        if let Some(unknown) = target.iter().find(|c| !set_by_rows(*c)) {
            return Err(ParseError::InvalidConflictTarget(format!(
                "column '{}' is not set by any row",
                unknown
            )));
        }

        let scope = [table.as_str(), base_name(&table), EXCLUDED];
        let update = match field(on_conflict, "update") {
            Some(v) => Some(assignments(v, "on_conflict.update", &scope)?),
            None => None,
        };
        let action = match field(on_conflict, "action") {
            None => match update {
                Some(set) if !set.is_empty() => ConflictAction::Update(set),
                _ => ConflictAction::Nothing,
            },
            Some(v) => match as_str(v, "on_conflict.action")?.trim().to_ascii_lowercase().as_str() {
                "update" => match update {
                    Some(set) if !set.is_empty() => ConflictAction::Update(set),
                    _ => return Err(ParseError::MissingField("on_conflict.update".to_string())),
                },
                "ignore" | "nothing" | "do nothing" => ConflictAction::Nothing,
                other => {
                    return Err(invalid(
                        "on_conflict.action",
                        format!("unknown action '{}'", other),
                    ))
                }
            },
        };
        let guard = match field(on_conflict, "where") {
            Some(v) => {
                if action == ConflictAction::Nothing {
                    return Err(invalid("on_conflict.where", "a guard needs an update action"));
                }
                let guard = condition(v, "on_conflict.where")?;
                check_expr(&guard, &scope, "on_conflict.where")?;
                Some(guard)
            }
            None => None,
        };

        Ok(UpsertStatement {
            table,
            columns,
            rows,
            on_conflict: OnConflict {
                columns: target,
                action,
                guard,
            },
            returning: returning(root)?,
        })
    }
}

/// Checks alias binding in every clause of a SELECT body.
fn check_select(q: &SelectQuery, path: &str, visible: &[String]) -> Result<()> {
    let mut bound: Vec<&str> = q.aliases().collect();
    bound.extend(visible.iter().map(String::as_str));

    let mut seen = HashSet::new();
    for alias in q.aliases() {
        if !seen.insert(alias) {
            return Err(ParseError::DuplicateAlias(alias.to_string()));
        }
    }

    let select_path = child_path(path, "select");
    for (i, p) in q.select.iter().enumerate() {
        let here = index_path(&select_path, i);
        match p {
            Projection::Named { expr, .. } => check_expr(expr, &bound, &here)?,
            Projection::Wildcard {
                qualifier: Some(qualifier),
            } if !bound.contains(&qualifier.as_str()) => {
                return Err(ParseError::UnboundAlias {
                    alias: qualifier.clone(),
                    path: here,
                });
            }
            Projection::Wildcard { .. } => (),
        }
    }
    let joins_path = child_path(path, "joins");
    for (i, join) in q.joins.iter().enumerate() {
        check_all(&join.on, &bound, &child_path(&index_path(&joins_path, i), "on"))?;
    }
    check_all(&q.filter, &bound, &child_path(path, "where"))?;
    check_all(&q.group_by, &bound, &child_path(path, "group_by"))?;
    check_all(&q.having, &bound, &child_path(path, "having"))?;
    let order_path = child_path(path, "order_by");
    for (i, spec) in q.order_by.iter().enumerate() {
        check_expr(&spec.expr, &bound, &index_path(&order_path, i))?;
    }
    Ok(())
}

/// Reads the target of an UPDATE or DELETE: a table name, or a single
/// `alias: table` entry.
fn dml_target(root: &Mapping) -> Result<(String, Option<String>)> {
    match required(root, "table", "")? {
        Value::String(table) => Ok((table.trim().to_string(), None)),
        other => {
            let target = table_ref(other, "table")?;
            let alias = if target.alias == target.table {
                None
            } else {
                Some(target.alias)
            };
            Ok((target.table, alias))
        }
    }
}

fn dml_filter(root: &Mapping, bound: &[&str]) -> Result<Vec<Expression>> {
    match field(root, "where") {
        Some(v) => {
            let filter = conditions(v, "where")?;
            check_all(&filter, bound, "where")?;
            Ok(filter)
        }
        None => Ok(Vec::new()),
    }
}

fn column_list(value: &Value) -> Result<Vec<String>> {
    let columns = string_list(value, "columns")?;
    if columns.is_empty() {
        return Err(invalid("columns", "expected at least one column"));
    }
    let mut seen = HashSet::new();
    if let Some(dup) = columns.iter().find(|c| !seen.insert(c.as_str())) {
        return Err(invalid("columns", format!("column '{}' is listed twice", dup)));
    }
    Ok(columns)
}

fn returning(root: &Mapping) -> Result<Vec<String>> {
    match field(root, "returning") {
        Some(v) => string_list(v, "returning"),
        None => Ok(Vec::new()),
    }
}

/// Reads a `column: expression` mapping.
fn assignments(value: &Value, path: &str, bound: &[&str]) -> Result<OrderMap<String, Expression>> {
    let map = as_mapping(value, path)?;
    let mut set = OrderMap::new();
    for (column, expr) in map {
        let column = key_str(column, path)?;
        let here = child_path(path, column);
        let expr = classify(expr, &here)?;
        check_expr(&expr, bound, &here)?;
        set.insert(column.to_string(), expr);
    }
    Ok(set)
}

/// Reads the `values` rows of an INSERT or UPSERT.
///
/// Returns the column list: `explicit` when given, otherwise the union of
/// the row keys in first-seen order.
fn values(
    root: &Mapping,
    explicit: Option<Vec<String>>,
    bound: &[&str],
) -> Result<(Vec<String>, Vec<Row>)> {
    let value = required(root, "values", "")?;
    let items: Vec<&Value> = match value {
        Value::Sequence(items) => items.iter().collect(),
        Value::Mapping(..) => vec![value],
        _ => return Err(invalid("values", "expected a list of rows")),
    };
    if items.is_empty() {
        return Err(ParseError::EmptyValues("values".to_string()));
    }

    let fixed = explicit.is_some();
    let mut columns = explicit.unwrap_or_default();
    let mut rows = Vec::with_capacity(items.len());
    for (i, item) in items.into_iter().enumerate() {
        let here = index_path("values", i);
        let map = as_mapping(item, &here)?;
        if map.is_empty() {
            return Err(invalid(&here, "row has no columns"));
        }
        let mut row = Row::new();
        for (column, cell) in map {
            let column = key_str(column, &here)?;
            let cell_path = child_path(&here, column);
            if !columns.iter().any(|c| c == column) {
                if fixed {
                    return Err(invalid(
                        &cell_path,
                        format!("column '{}' is not in the columns list", column),
                    ));
                }
                columns.push(column.to_string());
            }
            let expr = classify(cell, &cell_path)?;
            check_expr(&expr, bound, &cell_path)?;
            row.insert(column.to_string(), expr);
        }
        rows.push(row);
    }
    Ok((columns, rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn query(yaml: &str) -> Query {
        parse(yaml).unwrap().query
    }

    fn select(yaml: &str) -> SelectQuery {
        match query(yaml) {
            Query::Select(select) => select,
            other => panic!("expected a SELECT, got {:?}", other),
        }
    }

    fn error(yaml: &str) -> ParseError {
        parse(yaml).unwrap_err()
    }

    fn col(name: &str) -> Expression {
        Expression::Column(ColumnRef::parse(name))
    }

    #[test]
    fn minimal_select() {
        let q = select("query: {select: [{id: c.id}], from: {c: customers}, limit: 10}");
        assert_eq!(
            q.select,
            vec![Projection::Named {
                alias: "id".to_string(),
                expr: col("c.id"),
            }]
        );
        assert_eq!(
            q.from,
            TableRef {
                table: "customers".to_string(),
                alias: "c".to_string(),
            }
        );
        assert_eq!(q.limit, Some(RowCount::Count(10)));
        assert!(q.filter.is_empty() && q.joins.is_empty());
    }

    #[test]
    fn direct_query_format() {
        let q = select("select: [c.name, c.*]\nfrom: {c: customers}");
        assert_eq!(
            q.select,
            vec![
                Projection::Named {
                    alias: "name".to_string(),
                    expr: col("c.name"),
                },
                Projection::Wildcard {
                    qualifier: Some("c".to_string()),
                },
            ]
        );
    }

    #[test]
    fn projection_order_is_kept() {
        let q = select(
            "
query:
  select:
    - zeta: c.z
    - alpha: c.a
    - mid: c.m
  from: {c: t}
",
        );
        let aliases: Vec<&str> = q.output_aliases().collect();
        assert_eq!(aliases, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn root_errors() {
        assert_eq!(error("schema: {}"), ParseError::MissingRoot);
        assert_eq!(
            error("operation: merge\ntable: t"),
            ParseError::UnknownOperation("merge".to_string())
        );
        assert!(matches!(error("query: [unclosed"), ParseError::Yaml(..)));
    }

    #[test]
    fn missing_fields() {
        assert_eq!(
            error("query: {from: {c: customers}}"),
            ParseError::MissingField("query.select".to_string())
        );
        assert_eq!(
            error("query: {select: [{id: c.id}], from: null}"),
            ParseError::MissingField("query.from".to_string())
        );
        assert_eq!(
            error("operation: update\ntable: t"),
            ParseError::MissingField("set".to_string())
        );
    }

    #[test]
    fn operation_is_case_insensitive() {
        assert!(matches!(
            query("operation: DELETE\ntable: sessions"),
            Query::Delete(..)
        ));
    }

    #[test]
    fn joins() {
        let q = select(
            "
query:
  select: [{id: c.id}]
  from: {c: customers}
  joins:
    - alias: o
      table: orders
      on: [c.id = o.customer_id]
      additional_conditions: o.total > 0
    - {type: cross, alias: r, table: regions}
",
        );
        assert_eq!(q.joins.len(), 2);
        assert_eq!(q.joins[0].kind, JoinKind::Inner);
        assert_eq!(q.joins[0].on.len(), 2);
        assert_eq!(q.joins[1].kind, JoinKind::Cross);
        assert!(q.joins[1].on.is_empty());
    }

    #[test]
    fn invalid_joins() {
        let base = "query:\n  select: [{id: c.id}]\n  from: {c: customers}\n  joins:\n";
        let cases = [
            ("    - {alias: o, table: orders}\n", "missing join condition"),
            ("    - {table: orders, on: c.id = orders.id}\n", "missing alias"),
            ("    - {type: sideways, alias: o, table: orders, on: c.id = o.id}\n", "unknown join type"),
            ("    - {type: cross, alias: o, table: orders, on: c.id = o.id}\n", "CROSS JOIN takes no condition"),
        ];
        for &(join, reason) in cases.iter() {
            assert_eq!(
                error(&format!("{}{}", base, join)),
                ParseError::InvalidJoin {
                    path: "query.joins".to_string(),
                    index: 0,
                    reason: reason.to_string(),
                },
                "For {}",
                join
            );
        }
    }

    #[test]
    fn duplicate_aliases() {
        assert_eq!(
            error("query: {select: [{a: c.id}, {a: c.name}], from: {c: customers}}"),
            ParseError::DuplicateAlias("a".to_string())
        );
        assert_eq!(
            error(
                "query: {select: [{a: c.id}], from: {c: customers}, \
                 joins: [{alias: c, table: orders, on: c.id = c.id}]}"
            ),
            ParseError::DuplicateAlias("c".to_string())
        );
    }

    #[test]
    fn unbound_aliases() {
        assert_eq!(
            error("query: {select: [{id: c.id}], from: {c: customers}, where: [x.id = 1]}"),
            ParseError::UnboundAlias {
                alias: "x".to_string(),
                path: "query.where[0]".to_string(),
            }
        );
        assert_eq!(
            error("query: {select: [o.*], from: {c: customers}}"),
            ParseError::UnboundAlias {
                alias: "o".to_string(),
                path: "query.select[0]".to_string(),
            }
        );
    }

    #[test]
    fn fragment_local_aliases_are_bound() {
        let q = select(
            "
query:
  select: [{id: o.id}]
  from: {o: orders}
  where:
    - EXISTS (SELECT 1 FROM refunds r WHERE r.order_id = o.id)
    - NOT EXISTS (SELECT 1 FROM disputes WHERE disputes.order_id = o.id)
",
        );
        assert_eq!(q.filter.len(), 2);
    }

    #[test]
    fn ctes_in_order() {
        let q = select(
            "
query:
  with_clauses:
    a: {select: [{id: t.id}], from: {t: base}}
    b: {select: [{id: a.id}], from: {a: a}}
  select: [{id: b.id}]
  from: {b: b}
",
        );
        let names: Vec<&str> = q.ctes.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn forward_cte_reference() {
        assert_eq!(
            error(
                "
query:
  with_clauses:
    b: {select: [{id: x.id}], from: {x: a}}
    a: {select: [{id: t.id}], from: {t: base}}
  select: [{id: b.id}]
  from: {b: b}
"
            ),
            ParseError::CircularOrForwardReference("a".to_string())
        );
    }

    #[test]
    fn self_referencing_cte() {
        assert_eq!(
            error(
                "
query:
  with_clauses:
    a:
      select: [{id: t.id}]
      from: {t: base}
      where: [t.id IN (SELECT id FROM a)]
  select: [{id: a.id}]
  from: {a: a}
"
            ),
            ParseError::CircularOrForwardReference("a".to_string())
        );
    }

    #[test]
    fn order_by_forms() {
        let q = select(
            "
query:
  select: [{name: c.name}]
  from: {c: customers}
  order_by:
    - name: desc
    - {field: c.id}
    - c.created_at DESC
    - c.email
",
        );
        let directions: Vec<Direction> = q.order_by.iter().map(|o| o.direction).collect();
        assert_eq!(
            directions,
            vec![Direction::Desc, Direction::Asc, Direction::Desc, Direction::Asc]
        );
        assert_eq!(q.order_by[2].expr, col("c.created_at"));
    }

    #[test]
    fn invalid_order_spec() {
        assert_eq!(
            error("query: {select: [{id: c.id}], from: {c: t}, order_by: [c.id, {id: sideways}]}"),
            ParseError::InvalidOrderSpec {
                path: "query.order_by".to_string(),
                index: 1,
            }
        );
    }

    #[test]
    fn row_counts() {
        let q = select("query: {select: [{id: c.id}], from: {c: t}, limit: '5', offset: '#{skip}'}");
        assert_eq!(q.limit, Some(RowCount::Count(5)));
        assert!(matches!(q.offset, Some(RowCount::Param(ref p)) if p.name == "skip"));
        assert!(matches!(
            error("query: {select: [{id: c.id}], from: {c: t}, limit: -1}"),
            ParseError::Invalid { .. }
        ));
    }

    #[test]
    fn pagination_rules() {
        let q = select("query: {select: [{id: c.id}], from: {c: t}, pagination: {per_page: 50}}");
        assert_eq!(
            q.pagination,
            Some(Pagination {
                page: RowCount::Param(Placeholder {
                    name: "page".to_string(),
                    default: Some("1".to_string()),
                }),
                per_page: RowCount::Count(50),
            })
        );
        assert!(matches!(
            error("query: {select: [{id: c.id}], from: {c: t}, pagination: {page: 0}}"),
            ParseError::Invalid { .. }
        ));
        assert!(matches!(
            error("query: {select: [{id: c.id}], from: {c: t}, limit: 5, pagination: {page: 2}}"),
            ParseError::Invalid { .. }
        ));
    }

    #[test]
    fn structured_comparisons() {
        let q = select(
            "
query:
  select: [{id: o.id}]
  from: {o: orders}
  where:
    - {field: o.status, operator: not  in, value: [\"'void'\"]}
    - {field: o.note, operator: is, value: null}
",
        );
        match &q.filter[0] {
            Expression::Comparison { op, rhs, .. } => {
                assert_eq!(op, "NOT IN");
                assert!(matches!(**rhs, Expression::List(ref items) if items.len() == 1));
            }
            other => panic!("expected a comparison, got {:?}", other),
        }
        assert!(matches!(
            error("query: {select: [{id: o.id}], from: {o: t}, where: [{field: o.a, operator: '~', value: 1}]}"),
            ParseError::Invalid { .. }
        ));
    }

    #[test]
    fn insert_union_columns() {
        let q = query(
            "
operation: insert
table: customers
values:
  - {name: \"'Ann'\"}
  - {email: \"'b@example.com'\", name: \"'Bob'\"}
",
        );
        match q {
            Query::Insert(insert) => {
                assert_eq!(insert.columns, vec!["name", "email"]);
                match insert.source {
                    InsertSource::Values(rows) => assert_eq!(rows.len(), 2),
                    other => panic!("expected values, got {:?}", other),
                }
            }
            other => panic!("expected an INSERT, got {:?}", other),
        }
    }

    #[test]
    fn single_row_mapping() {
        match query("operation: insert\ntable: t\nvalues: {a: 1}") {
            Query::Insert(insert) => assert_eq!(insert.columns, vec!["a"]),
            other => panic!("expected an INSERT, got {:?}", other),
        }
    }

    #[test]
    fn insert_errors() {
        assert_eq!(
            error("operation: insert\ntable: t\nvalues: []"),
            ParseError::EmptyValues("values".to_string())
        );
        assert!(matches!(
            error("operation: insert\ntable: t\ncolumns: [a]\nvalues: [{b: 1}]"),
            ParseError::Invalid { .. }
        ));
        assert_eq!(
            error("operation: insert\ntable: t\nfrom_query: {select: [{a: x.a}], from: {x: s}}"),
            ParseError::MissingField("columns".to_string())
        );
    }

    #[test]
    fn update_binds_target() {
        match query("operation: update\ntable: {o: orders}\nset: {total: o.total + 1}\nwhere: orders.id = 3") {
            Query::Update(update) => {
                assert_eq!(update.alias.as_deref(), Some("o"));
                assert_eq!(update.filter.len(), 1);
            }
            other => panic!("expected an UPDATE, got {:?}", other),
        }
        assert!(matches!(
            error("operation: delete\ntable: orders\nwhere: [x.id = 1]"),
            ParseError::UnboundAlias { .. }
        ));
    }

    const UPSERT: &str = "
operation: upsert
table: products
values: [{sku: \"'A1'\", stock: 5}]
";

    #[test]
    fn upsert_actions() {
        let with = |conflict: &str| query(&format!("{}on_conflict: {}\n", UPSERT, conflict));
        match with("{columns: [sku], update: {stock: EXCLUDED.stock}}") {
            Query::Upsert(upsert) => {
                assert!(matches!(upsert.on_conflict.action, ConflictAction::Update(..)))
            }
            other => panic!("expected an UPSERT, got {:?}", other),
        }
        match with("{target: sku, action: nothing}") {
            Query::Upsert(upsert) => {
                assert_eq!(upsert.on_conflict.columns, vec!["sku"]);
                assert_eq!(upsert.on_conflict.action, ConflictAction::Nothing);
            }
            other => panic!("expected an UPSERT, got {:?}", other),
        }
    }

    #[test]
    fn upsert_errors() {
        let err = |conflict: &str| error(&format!("{}on_conflict: {}\n", UPSERT, conflict));
        assert!(matches!(err("{columns: []}"), ParseError::InvalidConflictTarget(..)));
        assert!(matches!(
            err("{columns: [id], update: {stock: 1}}"),
            ParseError::InvalidConflictTarget(..)
        ));
        assert_eq!(
            err("{columns: [sku], action: update}"),
            ParseError::MissingField("on_conflict.update".to_string())
        );
        assert!(matches!(
            err("{columns: [sku], update: {stock: other.stock}}"),
            ParseError::UnboundAlias { .. }
        ));
        assert_eq!(
            error(UPSERT),
            ParseError::MissingField("on_conflict".to_string())
        );
    }

    #[test]
    fn conflict_column_must_be_set_by_a_row() {
        let yaml = "
operation: upsert
table: products
columns: [id, name]
values: [{name: \"'x'\"}]
on_conflict: {columns: [id], action: nothing}
";
        assert_eq!(
            error(yaml),
            ParseError::InvalidConflictTarget("column 'id' is not set by any row".to_string())
        );
        let set = yaml.replace("{name: \"'x'\"}", "{id: 1, name: \"'x'\"}");
        assert!(matches!(query(&set), Query::Upsert(..)));
    }

    #[test]
    fn embedded_schema() {
        let doc = parse(
            "
schema:
  tables:
    customers:
      columns:
        id: {type: integer}
query: {select: [{id: c.id}], from: {c: customers}}
",
        )
        .unwrap();
        assert!(doc.schema.unwrap().table("customers").is_some());
    }

    #[test]
    fn imports_are_refused_by_default() {
        assert!(matches!(
            error("imports: [lib]\nquery: {select: [{id: c.id}], from: {c: t}}"),
            ParseError::Import { .. }
        ));
    }
}
