//! Schema validation.
//!
//! Checks a parsed query against the document's embedded schema. Problems
//! are collected rather than returned one at a time; whether they stop
//! compilation is up to the caller.

use std::collections::HashMap;
use std::iter;

use regex::Regex;
use tracing::debug;

use crate::error::ValidationError;
use crate::query::*;
use crate::schema::{ColumnDef, Schema, TableDef};

lazy_static! {
    /// `column = 'text'` tests inside raw fragments.
    static ref STRING_TEST: Regex = Regex::new(
        r"(?:^|[^.\w])([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)?)\s*(?:=|!=|<>)\s*'((?:[^']|'')*)'"
    )
    .unwrap();
}

/// Checks a query against a schema, returning every problem found.
pub fn validate(query: &Query, schema: &Schema) -> Vec<ValidationError> {
    let mut v = Validator {
        schema,
        errors: Vec::new(),
    };
    for table in query.tables() {
        if v.lookup(&table).is_none() {
            v.report(ValidationError::UnknownTable(table));
        }
    }
    match query {
        Query::Select(q) => v.select(q, &HashMap::new()),
        Query::Insert(stmt) => v.insert(stmt),
        Query::Update(stmt) => v.update(stmt),
        Query::Delete(stmt) => v.delete(stmt),
        Query::Upsert(stmt) => v.upsert(stmt),
    }
    debug!(errors = v.errors.len(), "validated query");
    v.errors
}

/// What an alias refers to.
#[derive(Debug, Clone)]
enum Source<'a> {
    Table { name: &'a str, def: &'a TableDef },
    /// A CTE with known output columns.
    Cte(Vec<&'a str>),
    /// A table or CTE whose columns are unknown.
    Opaque,
}

impl<'a> Source<'a> {
    fn has(&self, column: &str) -> bool {
        match self {
            Source::Table { def, .. } => def.column(column).is_some(),
            Source::Cte(columns) => columns.contains(&column),
            Source::Opaque => true,
        }
    }

    fn column(&self, column: &str) -> Option<(&'a str, &'a ColumnDef)> {
        match self {
            Source::Table { name, def } => def.column(column).map(|c| (*name, c)),
            _ => None,
        }
    }
}

/// Output columns of the CTEs in scope. `None` when a CTE selects `*`.
type CteColumns<'a> = HashMap<&'a str, Option<Vec<&'a str>>>;

type Scope<'a> = Vec<(&'a str, Source<'a>)>;

struct Validator<'a> {
    schema: &'a Schema,
    errors: Vec<ValidationError>,
}

impl<'a> Validator<'a> {
    fn report(&mut self, error: ValidationError) {
        if !self.errors.contains(&error) {
            self.errors.push(error);
        }
    }

    /// Looks up a table, falling back to the last segment of a dotted name.
    fn lookup(&self, table: &str) -> Option<&'a TableDef> {
        let schema: &'a Schema = self.schema;
        schema.table(table).or_else(|| {
            let base = table.rsplit('.').next().unwrap_or(table);
            schema.table(base)
        })
    }

    fn source(&self, table: &'a str, ctes: &CteColumns<'a>) -> Source<'a> {
        if let Some(columns) = ctes.get(table) {
            return match columns {
                Some(columns) => Source::Cte(columns.clone()),
                None => Source::Opaque,
            };
        }
        match self.lookup(table) {
            Some(def) => Source::Table { name: table, def },
            None => Source::Opaque,
        }
    }

    fn target_scope(&self, table: &'a str, alias: Option<&'a str>) -> Scope<'a> {
        let source = match self.lookup(table) {
            Some(def) => Source::Table { name: table, def },
            None => Source::Opaque,
        };
        let mut scope = vec![(table, source.clone())];
        if let Some(alias) = alias {
            scope.push((alias, source));
        }
        scope
    }

    fn select(&mut self, q: &'a SelectQuery, outer: &CteColumns<'a>) {
        let mut ctes = outer.clone();
        for (name, body) in q.ctes.iter() {
            self.select(body, &ctes);
            let columns = if body
                .select
                .iter()
                .any(|p| matches!(p, Projection::Wildcard { .. }))
            {
                None
            } else {
                Some(body.output_aliases().collect())
            };
            ctes.insert(name.as_str(), columns);
        }

        let scope: Scope<'a> = iter::once(&q.from)
            .chain(q.joins.iter().map(|j| &j.target))
            .map(|t| (t.alias.as_str(), self.source(&t.table, &ctes)))
            .collect();
        let outputs: Vec<&str> = q.output_aliases().collect();
        for (clause, expr) in q.expressions() {
            let extra: &[&str] = if clause == "order_by" { &outputs } else { &[] };
            self.expr(expr, &scope, extra);
        }
    }

    /// Checks column references and enum comparisons in an expression.
    /// Unqualified names in `extra` are accepted as they are.
    fn expr(&mut self, expr: &Expression, scope: &Scope<'a>, extra: &[&str]) {
        let locals = expr.local_aliases();
        for col in expr.column_refs() {
            match col.qualifier.as_deref() {
                Some(q) if col.is_excluded() || locals.contains(&q) => (),
                Some(q) => {
                    if let Some((_, source)) = scope.iter().find(|(alias, _)| *alias == q) {
                        if !source.has(&col.name) {
                            self.report(ValidationError::UnknownColumn(
                                q.to_string(),
                                col.name.clone(),
                            ));
                        }
                    }
                }
                None => {
                    if extra.contains(&col.name.as_str())
                        || scope.iter().any(|(_, source)| source.has(&col.name))
                    {
                        continue;
                    }
                    let aliases: Vec<&str> = scope.iter().map(|(alias, _)| *alias).collect();
                    self.report(ValidationError::UnknownColumn(
                        aliases.join(", "),
                        col.name.clone(),
                    ));
                }
            }
        }
        self.string_tests(expr, scope);
    }

    /// Checks string literals compared against enum columns.
    fn string_tests(&mut self, expr: &Expression, scope: &Scope<'a>) {
        match expr {
            Expression::Comparison { lhs, op, rhs } => {
                let col = match &**lhs {
                    Expression::Column(col) => col,
                    _ => return,
                };
                if !matches!(op.as_str(), "=" | "!=" | "<>" | "IN" | "NOT IN") {
                    return;
                }
                let values: Vec<&str> = match &**rhs {
                    Expression::Literal(Literal::String(s)) => vec![s.as_str()],
                    Expression::List(items) => items
                        .iter()
                        .filter_map(|item| match item {
                            Expression::Literal(Literal::String(s)) => Some(s.as_str()),
                            _ => None,
                        })
                        .collect(),
                    _ => Vec::new(),
                };
                for value in values {
                    self.enum_value(col, value, scope);
                }
            }
            Expression::Raw(frag) => {
                for caps in STRING_TEST.captures_iter(&frag.text) {
                    let col = ColumnRef::parse(&caps[1]);
                    self.enum_value(&col, &caps[2].replace("''", "'"), scope);
                }
            }
            _ => (),
        }
    }

    fn enum_value(&mut self, col: &ColumnRef, value: &str, scope: &Scope<'a>) {
        let resolved = match col.qualifier.as_deref() {
            Some(q) => scope
                .iter()
                .find(|(alias, _)| *alias == q)
                .and_then(|(_, source)| source.column(&col.name)),
            None => scope.iter().find_map(|(_, source)| source.column(&col.name)),
        };
        if let Some((table, def)) = resolved {
            if def.is_enum() && !def.values.iter().any(|v| v == value) {
                self.report(ValidationError::InvalidEnumLiteral(
                    format!("{}.{}", table, col.name),
                    value.to_string(),
                ));
            }
        }
    }

    /// Checks a value written to a column. `None` is a cell left NULL.
    fn assigned(&mut self, table: &str, def: &TableDef, column: &str, value: Option<&Expression>) {
        let column_def = match def.column(column) {
            Some(c) => c,
            None => {
                self.report(ValidationError::UnknownColumn(
                    table.to_string(),
                    column.to_string(),
                ));
                return;
            }
        };
        let qualified = format!("{}.{}", table, column);
        let not_null = column_def.constraints.not_null || column_def.constraints.primary_key;
        match value {
            None if not_null => self.report(ValidationError::NotNullViolation(qualified)),
            Some(e) if e.is_null() && not_null => {
                self.report(ValidationError::NotNullViolation(qualified))
            }
            Some(Expression::Literal(Literal::String(s))) => {
                if column_def.is_enum() && !column_def.values.iter().any(|v| v == s) {
                    self.report(ValidationError::InvalidEnumLiteral(qualified.clone(), s.clone()));
                }
                if let Some(max) = column_def.max_length {
                    if s.chars().count() as u64 > max {
                        self.report(ValidationError::ValueTooLong {
                            column: qualified,
                            max,
                        });
                    }
                }
            }
            _ => (),
        }
    }

    fn rows(&mut self, table: &str, columns: &[String], rows: &[Row]) {
        let def = match self.lookup(table) {
            Some(def) => def,
            None => return,
        };
        for row in rows {
            for column in columns {
                self.assigned(table, def, column, row.get(column.as_str()));
            }
        }
    }

    fn insert(&mut self, stmt: &'a InsertStatement) {
        match &stmt.source {
            InsertSource::Values(rows) => self.rows(&stmt.table, &stmt.columns, rows),
            InsertSource::Select(q) => {
                self.select(q, &HashMap::new());
                if let Some(def) = self.lookup(&stmt.table) {
                    for column in &stmt.columns {
                        if def.column(column).is_none() {
                            self.report(ValidationError::UnknownColumn(
                                stmt.table.clone(),
                                column.clone(),
                            ));
                        }
                    }
                }
            }
        }
    }

    fn update(&mut self, stmt: &'a UpdateStatement) {
        let scope = self.target_scope(&stmt.table, stmt.alias.as_deref());
        if let Some(def) = self.lookup(&stmt.table) {
            for (column, value) in stmt.set.iter() {
                self.assigned(&stmt.table, def, column, Some(value));
            }
        }
        for expr in stmt.set.values().chain(&stmt.filter) {
            self.expr(expr, &scope, &[]);
        }
    }

    fn delete(&mut self, stmt: &'a DeleteStatement) {
        let scope = self.target_scope(&stmt.table, stmt.alias.as_deref());
        for expr in &stmt.filter {
            self.expr(expr, &scope, &[]);
        }
    }

    fn upsert(&mut self, stmt: &'a UpsertStatement) {
        self.rows(&stmt.table, &stmt.columns, &stmt.rows);
        let scope = self.target_scope(&stmt.table, None);
        let conflict = &stmt.on_conflict;
        if let Some(def) = self.lookup(&stmt.table) {
            if let ConflictAction::Update(set) = &conflict.action {
                for (column, value) in set.iter() {
                    self.assigned(&stmt.table, def, column, Some(value));
                }
            }
        }
        if let ConflictAction::Update(set) = &conflict.action {
            for expr in set.values() {
                self.expr(expr, &scope, &[]);
            }
        }
        if let Some(guard) = &conflict.guard {
            self.expr(guard, &scope, &[]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use pretty_assertions::assert_eq;

    const SCHEMA: &str = "
schema:
  tables:
    customers:
      columns:
        id: {type: integer, constraints: {primary_key: true}}
        name: {type: string, max_length: 5, constraints: {not_null: true}}
        email: {type: string}
        status: {type: enum, values: [active, inactive]}
    orders:
      columns:
        id: {type: integer}
        customer_id: {type: integer}
        total: {type: decimal}
";

    fn errors(body: &str) -> Vec<ValidationError> {
        let doc = parse(&format!("{}{}", SCHEMA, body)).unwrap();
        validate(&doc.query, &doc.schema.unwrap())
    }

    #[test]
    fn valid_select() {
        let found = errors(
            "
query:
  with_clauses:
    big: {select: [{cid: o.customer_id}], from: {o: orders}, where: [o.total > 100]}
  select: [{name: c.name}, {n: COUNT(b.cid)}]
  from: {c: customers}
  joins: [{alias: b, table: big, on: b.cid = c.id}]
  where: [{field: c.status, operator: '=', value: \"'active'\"}]
  group_by: [c.name]
  order_by: [{n: desc}]
",
        );
        assert_eq!(found, vec![]);
    }

    #[test]
    fn unknown_columns() {
        let found = errors(
            "
query:
  select: [{x: c.nickname}, {y: b.missing}]
  from: {c: customers}
  joins: [{alias: b, table: orders, on: b.customer_id = c.id}]
  where: [{field: shoe_size, operator: '>', value: 3}]
",
        );
        assert_eq!(
            found,
            vec![
                ValidationError::UnknownColumn("c".to_string(), "nickname".to_string()),
                ValidationError::UnknownColumn("b".to_string(), "missing".to_string()),
                ValidationError::UnknownColumn("c, b".to_string(), "shoe_size".to_string()),
            ]
        );
    }

    #[test]
    fn unknown_tables() {
        let found = errors(
            "
query:
  select: [{id: w.id}]
  from: {w: widgets}
  where: [EXISTS (SELECT 1 FROM gadgets g WHERE g.widget_id = w.id)]
",
        );
        assert_eq!(
            found,
            vec![
                ValidationError::UnknownTable("widgets".to_string()),
                ValidationError::UnknownTable("gadgets".to_string()),
            ]
        );
    }

    #[test]
    fn enum_literals() {
        let found = errors(
            "
query:
  select: [{id: c.id}]
  from: {c: customers}
  where:
    - {field: c.status, operator: in, value: [\"'active'\", \"'banned'\"]}
    - c.status <> 'gone'
",
        );
        assert_eq!(
            found,
            vec![
                ValidationError::InvalidEnumLiteral(
                    "customers.status".to_string(),
                    "banned".to_string()
                ),
                ValidationError::InvalidEnumLiteral(
                    "customers.status".to_string(),
                    "gone".to_string()
                ),
            ]
        );
    }

    #[test]
    fn insert_checks() {
        let found = errors(
            "
operation: insert
table: customers
values:
  - {name: \"'Ann'\", status: \"'active'\"}
  - {email: \"'b@example.com'\", status: \"'lost'\"}
  - {name: \"'Maximilian'\"}
",
        );
        assert_eq!(
            found,
            vec![
                ValidationError::NotNullViolation("customers.name".to_string()),
                ValidationError::InvalidEnumLiteral(
                    "customers.status".to_string(),
                    "lost".to_string()
                ),
                ValidationError::ValueTooLong {
                    column: "customers.name".to_string(),
                    max: 5,
                },
            ]
        );
    }

    #[test]
    fn update_assigns_null() {
        let found = errors(
            "
operation: update
table: {c: customers}
set: {name: null, rank: 1}
where: [c.id = 7]
",
        );
        assert_eq!(
            found,
            vec![
                ValidationError::NotNullViolation("customers.name".to_string()),
                ValidationError::UnknownColumn("customers".to_string(), "rank".to_string()),
            ]
        );
    }

    #[test]
    fn upsert_excluded_refs_are_skipped() {
        let found = errors(
            "
operation: upsert
table: customers
values: [{id: 1, name: \"'Ann'\"}]
on_conflict:
  columns: [id]
  update: {name: EXCLUDED.name}
  where: customers.email IS NULL
",
        );
        assert_eq!(found, vec![]);
    }
}
