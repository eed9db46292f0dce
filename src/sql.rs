//! SQL generation.
//!
//! This module renders the IR (see the [`query`] module) as SQL text for a
//! target dialect. Rendering is a single walk over the tree that consults the
//! dialect's capability table wherever dialects differ. Text is produced
//! strictly left to right, so parameter markers are numbered in the order
//! they appear in the output.
//!
//! [`query`]: ../query/index.html

use serde::Serialize;
use tracing::debug;

use crate::dialect::{Capabilities, ConflictStyle, Dialect, LimitStyle, ReturningStyle};
use crate::error::GenError;
use crate::map::OrderMap;
use crate::ops::{self, Logic, Parenthesize, Rendered};
use crate::params::Parameters;
use crate::query::{
    ColumnRef, ConflictAction, DeleteStatement, Expression, Fragment, InsertSource,
    InsertStatement, JoinKind, Literal, OrderSpec, Piece, Projection, Query, Row, RowCount,
    SelectQuery, UpdateStatement, UpsertStatement, EXCLUDED,
};
use crate::util::{child_path, index_path, try_map_indexed, CommaSep};

/// Alias of the row source in MERGE statements.
const MERGE_SOURCE: &str = "source";

/// Column holding row numbers when a query is wrapped for row limiting.
const ROW_NUMBER: &str = "yql_rn";

/// Alias of the wrapped query when a query is wrapped for row limiting.
const PAGE: &str = "yql_page";

/// Style options for conversion to SQL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Style {
    /// Pretty-print the output instead of putting it on one line.
    pub pretty: bool,
}

/// A generated statement with its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Compiled {
    pub sql: String,
    pub params: Parameters,
}

/// Renders a query as SQL for the named dialect.
pub fn generate(query: &Query, dialect: &str) -> Result<String, GenError> {
    generate_with(query, dialect, &Style::default()).map(|compiled| compiled.sql)
}

/// Renders a query as SQL for the named dialect, returning its parameters.
pub fn generate_with(query: &Query, dialect: &str, style: &Style) -> Result<Compiled, GenError> {
    let dialect: Dialect = dialect.parse()?;
    generate_for(query, dialect, style)
}

/// Renders a query as SQL for a dialect.
pub fn generate_for(query: &Query, dialect: Dialect, style: &Style) -> Result<Compiled, GenError> {
    debug!(dialect = dialect.name(), kind = query.kind(), "generating SQL");
    let mut gen = Generator {
        dialect,
        caps: dialect.capabilities(),
        style,
        params: Parameters::new(),
    };
    let sql = match query {
        Query::Select(select) => gen.select(select, "query")?,
        Query::Insert(insert) => gen.insert(insert, "insert")?,
        Query::Update(update) => gen.update(update, "update")?,
        Query::Delete(delete) => gen.delete(delete, "delete")?,
        Query::Upsert(upsert) => gen.upsert(upsert, "upsert")?,
    };
    debug!(params = gen.params.occurrences.len(), "generated SQL");
    Ok(Compiled {
        sql,
        params: gen.params,
    })
}

/// A row bound for LIMIT or OFFSET.
#[derive(Clone, Copy)]
enum Bound<'q> {
    /// A count as written in the document.
    Rows(&'q RowCount),
    /// A count computed from literal pagination.
    Count(u64),
    /// The offset of a page, `(page - 1) * per_page`.
    Page {
        page: &'q RowCount,
        per_page: &'q RowCount,
    },
}

impl<'q> Bound<'q> {
    /// Returns the bound if it is a literal count.
    fn count(self) -> Option<u64> {
        match self {
            Bound::Rows(RowCount::Count(n)) => Some(*n),
            Bound::Count(n) => Some(n),
            _ => None,
        }
    }
}

/// State of a single generation.
struct Generator<'s> {
    dialect: Dialect,
    caps: &'static Capabilities,
    style: &'s Style,
    params: Parameters,
}

/// Names a statement on a single table can qualify columns with.
fn table_scope<'a>(table: &'a str, alias: Option<&'a str>) -> Vec<&'a str> {
    let mut scope = vec![table];
    if let Some((_, last)) = table.rsplit_once('.') {
        scope.push(last);
    }
    scope.extend(alias);
    scope
}

impl<'s> Generator<'s> {
    fn unsupported(&self, feature: &str, path: &str) -> GenError {
        GenError::UnsupportedFeature {
            feature: feature.to_string(),
            dialect: self.dialect.name().to_string(),
            path: path.to_string(),
        }
    }

    /// Separator between clauses.
    fn sep(&self) -> &'static str {
        if self.style.pretty {
            "\n"
        } else {
            " "
        }
    }

    fn ident(&self, name: &str) -> String {
        self.dialect.quote(name)
    }

    fn table(&self, name: &str) -> String {
        self.dialect.quote_path(name)
    }

    fn table_ref(&self, table: &str, alias: Option<&str>) -> String {
        let name = self.table(table);
        match alias {
            Some(alias) if alias != table => {
                let keyword = if self.caps.table_alias_as { " AS " } else { " " };
                format!("{}{}{}", name, keyword, self.ident(alias))
            }
            _ => name,
        }
    }

    /// Renders a column of the row proposed by an upsert.
    fn excluded(&self, column: &str) -> String {
        let column = self.ident(column);
        match self.caps.conflict {
            ConflictStyle::OnConflict => format!("{}.{}", EXCLUDED, column),
            ConflictStyle::OnDuplicateKey => format!("VALUES({})", column),
            ConflictStyle::Merge | ConflictStyle::MergeWhere => {
                format!("{}.{}", MERGE_SOURCE, column)
            }
        }
    }

    fn expr(&mut self, expr: &Expression, scope: &[&str], path: &str) -> Result<String, GenError> {
        match expr {
            Expression::Column(col) => self.column(col, scope, path),
            Expression::Raw(frag) => Ok(self.fragment(frag)),
            Expression::Literal(lit) => Ok(self.literal(lit)),
            Expression::Placeholder(p) => Ok(self.params.bind(p, self.caps.params)),
            Expression::Comparison { lhs, op, rhs } => {
                let prec = ops::precedence(op).unwrap_or(ops::HIGHEST_PRECEDENCE);
                let lhs = self.operand(lhs, prec, scope, path)?;
                let rhs = self.operand(rhs, prec, scope, path)?;
                Ok(format!("{} {} {}", lhs, op, rhs))
            }
            Expression::List(items) => {
                let mut rendered = Vec::with_capacity(items.len());
                for item in items {
                    rendered.push(self.expr(item, scope, path)?);
                }
                Ok(format!("({})", CommaSep(&rendered)))
            }
        }
    }

    /// Renders an operand of a comparison, wrapping it if it binds loosely.
    fn operand(
        &mut self,
        expr: &Expression,
        prec: ops::Precedence,
        scope: &[&str],
        path: &str,
    ) -> Result<String, GenError> {
        let text = self.expr(expr, scope, path)?;
        if expr.precedence() <= prec {
            Ok(format!("({})", text))
        } else {
            Ok(text)
        }
    }

    fn column(&self, col: &ColumnRef, scope: &[&str], path: &str) -> Result<String, GenError> {
        let name = self.ident(&col.name);
        match &col.qualifier {
            None => Ok(name),
            Some(..) if col.is_excluded() && scope.contains(&EXCLUDED) => {
                Ok(self.excluded(&col.name))
            }
            Some(q) if !col.is_excluded() && scope.contains(&q.as_str()) => {
                Ok(format!("{}.{}", self.ident(q), name))
            }
            Some(q) => Err(GenError::UnresolvedAlias {
                alias: q.clone(),
                path: path.to_string(),
            }),
        }
    }

    fn fragment(&mut self, frag: &Fragment) -> String {
        let mut out = String::new();
        for piece in &frag.pieces {
            match piece {
                Piece::Text(text) => out.push_str(text),
                Piece::Param(p) => out.push_str(&self.params.bind(p, self.caps.params)),
                Piece::Excluded(column) => out.push_str(&self.excluded(column)),
            }
        }
        out
    }

    fn literal(&self, lit: &Literal) -> String {
        match lit {
            Literal::Integer(i) => i.to_string(),
            Literal::Decimal(d) => d.clone(),
            Literal::String(s) => format!("'{}'", s.replace('\'', "''")),
            Literal::Boolean(b) => match (self.caps.boolean_keywords, b) {
                (true, true) => "TRUE".to_string(),
                (true, false) => "FALSE".to_string(),
                (false, true) => "1".to_string(),
                (false, false) => "0".to_string(),
            },
            Literal::Null => "NULL".to_string(),
        }
    }

    /// Renders conditions joined by AND.
    fn conditions(
        &mut self,
        conds: &[Expression],
        scope: &[&str],
        path: &str,
    ) -> Result<String, GenError> {
        let mut args = Vec::with_capacity(conds.len());
        for (i, cond) in conds.iter().enumerate() {
            let text = self.expr(cond, scope, &index_path(path, i))?;
            args.push(Rendered {
                text,
                precedence: cond.precedence(),
            });
        }
        Ok(ops::write_operation(Logic::And, " ", &args))
    }

    /// Renders `col = expr` assignments.
    fn assignments(
        &mut self,
        set: &OrderMap<String, Expression>,
        scope: &[&str],
        path: &str,
    ) -> Result<String, GenError> {
        let mut items = Vec::with_capacity(set.len());
        for (column, expr) in set.iter() {
            let value = self.expr(expr, scope, &child_path(path, column))?;
            items.push(format!("{} = {}", self.ident(column), value));
        }
        Ok(items.join(", "))
    }

    fn bound(&mut self, bound: Bound) -> String {
        match bound {
            Bound::Rows(RowCount::Count(n)) => n.to_string(),
            Bound::Rows(RowCount::Param(p)) => self.params.bind(p, self.caps.params),
            Bound::Count(n) => n.to_string(),
            Bound::Page { page, per_page } => {
                let page = self.bound(Bound::Rows(page));
                let per_page = self.bound(Bound::Rows(per_page));
                format!("(({} - 1) * {})", page, per_page)
            }
        }
    }

    /// Works out the LIMIT and OFFSET bounds of a query.
    fn bounds<'q>(
        &self,
        q: &'q SelectQuery,
        path: &str,
    ) -> Result<(Option<Bound<'q>>, Option<Bound<'q>>), GenError> {
        let p = match &q.pagination {
            Some(p) => p,
            None => return Ok((q.limit.as_ref().map(Bound::Rows), q.offset.as_ref().map(Bound::Rows))),
        };
        match (&p.page, &p.per_page) {
            (RowCount::Count(page), RowCount::Count(per_page)) => {
                let offset = page.saturating_sub(1).saturating_mul(*per_page);
                let offset = if offset == 0 { None } else { Some(Bound::Count(offset)) };
                Ok((Some(Bound::Count(*per_page)), offset))
            }
            (page, per_page) => {
                if !self.caps.limit_expressions {
                    return Err(self.unsupported(
                        "computed pagination offset",
                        &child_path(path, "pagination"),
                    ));
                }
                Ok((
                    Some(Bound::Rows(per_page)),
                    Some(Bound::Page { page, per_page }),
                ))
            }
        }
    }

    /// Renders a SELECT query with its CTEs.
    fn select(&mut self, q: &SelectQuery, path: &str) -> Result<String, GenError> {
        let mut out = String::new();
        if !q.ctes.is_empty() {
            let mut ctes = Vec::with_capacity(q.ctes.len());
            for (name, body) in q.ctes.iter() {
                let cte_path = child_path(&child_path(path, "with_clauses"), name);
                let sql = self.select(body, &cte_path)?;
                ctes.push(format!("{} AS ({})", self.ident(name), sql));
            }
            out.push_str("WITH ");
            out.push_str(&ctes.join(if self.style.pretty { ",\n" } else { ", " }));
            out.push_str(self.sep());
        }
        out.push_str(&self.select_body(q, path)?);
        Ok(out)
    }

    fn select_body(&mut self, q: &SelectQuery, path: &str) -> Result<String, GenError> {
        let scope: Vec<&str> = q.aliases().collect();
        let (limit, offset) = self.bounds(q, path)?;
        if self.caps.limit == LimitStyle::RowNumber && (limit.is_some() || offset.is_some()) {
            return self.row_number_select(q, &scope, limit, offset, path);
        }

        let top = self.caps.limit == LimitStyle::TopOrFetch && offset.is_none();
        let mut head = "SELECT ".to_string();
        if let (true, Some(limit)) = (top, limit) {
            head.push_str(&format!("TOP ({}) ", self.bound(limit)));
        }
        head.push_str(&self.projections(q, &scope, path)?);
        let mut clauses = vec![head];
        clauses.extend(self.source_clauses(q, &scope, path)?);
        let order = self.order_by(&q.order_by, &scope, path)?;

        match self.caps.limit {
            LimitStyle::Limit => {
                clauses.extend(order);
                match (limit, offset) {
                    (Some(limit), _) => clauses.push(format!("LIMIT {}", self.bound(limit))),
                    (None, Some(_)) => {
                        if let Some(filler) = self.caps.offset_filler {
                            clauses.push(format!("LIMIT {}", filler));
                        }
                    }
                    (None, None) => (),
                }
                if let Some(offset) = offset {
                    clauses.push(format!("OFFSET {}", self.bound(offset)));
                }
            }
            LimitStyle::TopOrFetch => match offset {
                Some(offset) => {
                    clauses.push(order.unwrap_or_else(|| "ORDER BY (SELECT NULL)".to_string()));
                    clauses.push(format!("OFFSET {} ROWS", self.bound(offset)));
                    if let Some(limit) = limit {
                        clauses.push(format!("FETCH NEXT {} ROWS ONLY", self.bound(limit)));
                    }
                }
                None => clauses.extend(order),
            },
            LimitStyle::RowNumber => clauses.extend(order),
        }
        Ok(clauses.join(self.sep()))
    }

    /// Renders a query with row limits as a filter on `ROW_NUMBER()` over a
    /// wrapped query.
    fn row_number_select(
        &mut self,
        q: &SelectQuery,
        scope: &[&str],
        limit: Option<Bound>,
        offset: Option<Bound>,
        path: &str,
    ) -> Result<String, GenError> {
        let mut outputs = Vec::with_capacity(q.select.len());
        for p in &q.select {
            match p {
                Projection::Named { alias, .. } => outputs.push(self.ident(alias)),
                Projection::Wildcard { .. } => {
                    return Err(self.unsupported(
                        "row limiting with a wildcard projection",
                        &child_path(path, "select"),
                    ))
                }
            }
        }

        let projections = self.projections(q, scope, path)?;
        let mut window = Vec::with_capacity(q.order_by.len());
        let order_path = child_path(path, "order_by");
        for (i, spec) in q.order_by.iter().enumerate() {
            let expr = output_expression(q, &spec.expr);
            let text = self.expr(expr, scope, &index_path(&order_path, i))?;
            window.push(format!("{} {}", text, spec.direction.keyword()));
        }
        let window = if window.is_empty() {
            "NULL".to_string()
        } else {
            window.join(", ")
        };

        let mut inner = vec![format!(
            "SELECT {}, ROW_NUMBER() OVER (ORDER BY {}) AS {}",
            projections,
            window,
            ROW_NUMBER
        )];
        inner.extend(self.source_clauses(q, scope, path)?);
        let inner = inner.join(self.sep());

        let mut filters = Vec::new();
        if let Some(offset) = offset {
            filters.push(format!("{} > {}", ROW_NUMBER, self.bound(offset)));
        }
        if let Some(limit) = limit {
            let upper = match offset {
                None => self.bound(limit),
                Some(offset) => match (offset.count(), limit.count()) {
                    (Some(o), Some(l)) => o.saturating_add(l).to_string(),
                    _ => {
                        let offset = self.bound(offset);
                        format!("{} + {}", offset, self.bound(limit))
                    }
                },
            };
            filters.push(format!("{} <= {}", ROW_NUMBER, upper));
        }

        let clauses = vec![
            format!("SELECT {}", outputs.join(", ")),
            format!("FROM ({}) {}", inner, PAGE),
            format!("WHERE {}", filters.join(" AND ")),
            format!("ORDER BY {}", ROW_NUMBER),
        ];
        Ok(clauses.join(self.sep()))
    }

    fn projections(
        &mut self,
        q: &SelectQuery,
        scope: &[&str],
        path: &str,
    ) -> Result<String, GenError> {
        let select_path = child_path(path, "select");
        let mut items = Vec::with_capacity(q.select.len());
        for (i, p) in q.select.iter().enumerate() {
            let item_path = index_path(&select_path, i);
            items.push(match p {
                Projection::Named { alias, expr } => {
                    let expr = self.expr(expr, scope, &item_path)?;
                    format!("{} AS {}", expr, self.ident(alias))
                }
                Projection::Wildcard { qualifier: None } => "*".to_string(),
                Projection::Wildcard {
                    qualifier: Some(q),
                } => {
                    if !scope.contains(&q.as_str()) {
                        return Err(GenError::UnresolvedAlias {
                            alias: q.clone(),
                            path: item_path,
                        });
                    }
                    format!("{}.*", self.ident(q))
                }
            });
        }
        Ok(items.join(", "))
    }

    /// Renders FROM, the joins, WHERE, GROUP BY and HAVING.
    fn source_clauses(
        &mut self,
        q: &SelectQuery,
        scope: &[&str],
        path: &str,
    ) -> Result<Vec<String>, GenError> {
        let mut clauses = vec![format!(
            "FROM {}",
            self.table_ref(&q.from.table, Some(&q.from.alias))
        )];
        let joins_path = child_path(path, "joins");
        for (i, join) in q.joins.iter().enumerate() {
            let join_path = index_path(&joins_path, i);
            if join.kind == JoinKind::Full && !self.caps.full_join {
                return Err(self.unsupported("FULL JOIN", &join_path));
            }
            let mut text = format!(
                "{} {}",
                join.kind.keyword(),
                self.table_ref(&join.target.table, Some(&join.target.alias))
            );
            if !join.on.is_empty() {
                let on = self.conditions(&join.on, scope, &child_path(&join_path, "on"))?;
                text.push_str(" ON ");
                text.push_str(&on);
            }
            clauses.push(text);
        }
        if !q.filter.is_empty() {
            let cond = self.conditions(&q.filter, scope, &child_path(path, "where"))?;
            clauses.push(format!("WHERE {}", cond));
        }
        if !q.group_by.is_empty() {
            let group_path = child_path(path, "group_by");
            let items = try_map_indexed(&q.group_by, &group_path, |expr, p| {
                self.expr(expr, scope, p)
            })?;
            clauses.push(format!("GROUP BY {}", items.join(", ")));
        }
        if !q.having.is_empty() {
            let cond = self.conditions(&q.having, scope, &child_path(path, "having"))?;
            clauses.push(format!("HAVING {}", cond));
        }
        Ok(clauses)
    }

    fn order_by(
        &mut self,
        specs: &[OrderSpec],
        scope: &[&str],
        path: &str,
    ) -> Result<Option<String>, GenError> {
        if specs.is_empty() {
            return Ok(None);
        }
        let order_path = child_path(path, "order_by");
        let mut items = Vec::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            let expr = self.expr(&spec.expr, scope, &index_path(&order_path, i))?;
            items.push(format!("{} {}", expr, spec.direction.keyword()));
        }
        Ok(Some(format!("ORDER BY {}", items.join(", "))))
    }

    fn check_returning(&self, returning: &[String], path: &str) -> Result<(), GenError> {
        if !returning.is_empty() && self.caps.returning == ReturningStyle::Unsupported {
            return Err(self.unsupported("RETURNING", &child_path(path, "returning")));
        }
        Ok(())
    }

    fn returning_column(&self, column: &str) -> String {
        if column == "*" {
            column.to_string()
        } else {
            self.ident(column)
        }
    }

    /// Renders a trailing RETURNING clause, if the dialect uses one.
    fn returning(&self, returning: &[String]) -> Option<String> {
        if returning.is_empty() || self.caps.returning != ReturningStyle::Returning {
            return None;
        }
        let cols: Vec<String> = returning.iter().map(|c| self.returning_column(c)).collect();
        Some(format!("RETURNING {}", cols.join(", ")))
    }

    /// Renders an OUTPUT clause reading from `pseudo` (INSERTED or DELETED),
    /// if the dialect uses one.
    fn output(&self, returning: &[String], pseudo: &str) -> Option<String> {
        if returning.is_empty() || self.caps.returning != ReturningStyle::Output {
            return None;
        }
        let cols: Vec<String> = returning
            .iter()
            .map(|c| format!("{}.{}", pseudo, self.returning_column(c)))
            .collect();
        Some(format!("OUTPUT {}", cols.join(", ")))
    }

    fn column_list(&self, columns: &[String]) -> String {
        let cols: Vec<String> = columns.iter().map(|c| self.ident(c)).collect();
        format!("({})", cols.join(", "))
    }

    /// Renders each row as a list of values in column order, filling
    /// missing cells with NULL.
    fn row_values(
        &mut self,
        columns: &[String],
        rows: &[Row],
        scope: &[&str],
        path: &str,
    ) -> Result<Vec<Vec<String>>, GenError> {
        let mut tuples = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            let row_path = index_path(path, i);
            let mut values = Vec::with_capacity(columns.len());
            for column in columns {
                values.push(match row.get(column) {
                    Some(expr) => self.expr(expr, scope, &child_path(&row_path, column))?,
                    None => "NULL".to_string(),
                });
            }
            tuples.push(values);
        }
        Ok(tuples)
    }

    /// Renders the row source of an INSERT: `VALUES (…), (…)`, or a UNION ALL
    /// of single-row selects where VALUES takes one row only.
    fn values(
        &mut self,
        columns: &[String],
        rows: &[Row],
        scope: &[&str],
        path: &str,
    ) -> Result<String, GenError> {
        let tuples = self.row_values(columns, rows, scope, &child_path(path, "values"))?;
        if tuples.len() > 1 && !self.caps.multi_row_values {
            let selects: Vec<String> = tuples
                .iter()
                .map(|t| format!("SELECT {} FROM DUAL", t.join(", ")))
                .collect();
            return Ok(selects.join(" UNION ALL "));
        }
        let tuples: Vec<String> = tuples
            .iter()
            .map(|t| format!("({})", t.join(", ")))
            .collect();
        Ok(format!("VALUES {}", tuples.join(", ")))
    }

    fn insert(&mut self, stmt: &InsertStatement, path: &str) -> Result<String, GenError> {
        self.check_returning(&stmt.returning, path)?;
        let scope = table_scope(&stmt.table, None);
        let mut clauses = vec![format!(
            "INSERT INTO {} {}",
            self.table(&stmt.table),
            self.column_list(&stmt.columns)
        )];
        clauses.extend(self.output(&stmt.returning, "INSERTED"));
        clauses.push(match &stmt.source {
            InsertSource::Values(rows) => self.values(&stmt.columns, rows, &scope, path)?,
            InsertSource::Select(select) => {
                self.select(select, &child_path(path, "from_query"))?
            }
        });
        clauses.extend(self.returning(&stmt.returning));
        Ok(clauses.join(self.sep()))
    }

    fn update(&mut self, stmt: &UpdateStatement, path: &str) -> Result<String, GenError> {
        self.check_returning(&stmt.returning, path)?;
        let alias = stmt.alias.as_deref().filter(|a| *a != stmt.table);
        let scope = table_scope(&stmt.table, alias);
        let mut clauses = Vec::new();
        match alias {
            Some(alias) if self.caps.alias_in_from => {
                clauses.push(format!("UPDATE {}", self.ident(alias)));
                let set = self.assignments(&stmt.set, &scope, &child_path(path, "set"))?;
                clauses.push(format!("SET {}", set));
                clauses.extend(self.output(&stmt.returning, "INSERTED"));
                clauses.push(format!("FROM {}", self.table_ref(&stmt.table, Some(alias))));
            }
            _ => {
                clauses.push(format!("UPDATE {}", self.table_ref(&stmt.table, alias)));
                let set = self.assignments(&stmt.set, &scope, &child_path(path, "set"))?;
                clauses.push(format!("SET {}", set));
                clauses.extend(self.output(&stmt.returning, "INSERTED"));
            }
        }
        if !stmt.filter.is_empty() {
            let cond = self.conditions(&stmt.filter, &scope, &child_path(path, "where"))?;
            clauses.push(format!("WHERE {}", cond));
        }
        clauses.extend(self.returning(&stmt.returning));
        Ok(clauses.join(self.sep()))
    }

    fn delete(&mut self, stmt: &DeleteStatement, path: &str) -> Result<String, GenError> {
        self.check_returning(&stmt.returning, path)?;
        let alias = stmt.alias.as_deref().filter(|a| *a != stmt.table);
        let scope = table_scope(&stmt.table, alias);
        let mut clauses = Vec::new();
        match alias {
            Some(alias) if self.caps.alias_in_from => {
                clauses.push(format!("DELETE {}", self.ident(alias)));
                clauses.extend(self.output(&stmt.returning, "DELETED"));
                clauses.push(format!("FROM {}", self.table_ref(&stmt.table, Some(alias))));
            }
            _ => {
                clauses.push(format!("DELETE FROM {}", self.table_ref(&stmt.table, alias)));
                clauses.extend(self.output(&stmt.returning, "DELETED"));
            }
        }
        if !stmt.filter.is_empty() {
            let cond = self.conditions(&stmt.filter, &scope, &child_path(path, "where"))?;
            clauses.push(format!("WHERE {}", cond));
        }
        clauses.extend(self.returning(&stmt.returning));
        Ok(clauses.join(self.sep()))
    }

    fn upsert(&mut self, stmt: &UpsertStatement, path: &str) -> Result<String, GenError> {
        self.check_returning(&stmt.returning, path)?;
        let conflict_path = child_path(path, "on_conflict");
        if stmt.on_conflict.guard.is_some() && !self.caps.conflict_guard {
            return Err(self.unsupported(
                "conditional upsert",
                &child_path(&conflict_path, "where"),
            ));
        }
        let mut scope = table_scope(&stmt.table, None);
        scope.push(EXCLUDED);
        match self.caps.conflict {
            ConflictStyle::Merge | ConflictStyle::MergeWhere => {
                return self.merge(stmt, &scope, path);
            }
            ConflictStyle::OnConflict | ConflictStyle::OnDuplicateKey => (),
        }

        let mut clauses = vec![format!(
            "INSERT INTO {} {}",
            self.table(&stmt.table),
            self.column_list(&stmt.columns)
        )];
        clauses.push(self.values(&stmt.columns, &stmt.rows, &scope, path)?);
        let update_path = child_path(&conflict_path, "update");
        let conflict = &stmt.on_conflict;
        if self.caps.conflict == ConflictStyle::OnConflict {
            let target = self.column_list(&conflict.columns);
            match &conflict.action {
                ConflictAction::Update(set) => {
                    let set = self.assignments(set, &scope, &update_path)?;
                    clauses.push(format!("ON CONFLICT {} DO UPDATE SET {}", target, set));
                    if let Some(guard) = &conflict.guard {
                        let guard = self.expr(guard, &scope, &child_path(&conflict_path, "where"))?;
                        clauses.push(format!("WHERE {}", guard));
                    }
                }
                ConflictAction::Nothing => {
                    clauses.push(format!("ON CONFLICT {} DO NOTHING", target));
                }
            }
        } else {
            let set = match &conflict.action {
                ConflictAction::Update(set) => self.assignments(set, &scope, &update_path)?,
                ConflictAction::Nothing => {
                    let column = conflict.columns.first().map(|c| self.ident(c));
                    let column = column.unwrap_or_default();
                    format!("{} = {}", column, column)
                }
            };
            clauses.push(format!("ON DUPLICATE KEY UPDATE {}", set));
        }
        clauses.extend(self.returning(&stmt.returning));
        Ok(clauses.join(self.sep()))
    }

    /// Renders an upsert as a MERGE statement.
    fn merge(
        &mut self,
        stmt: &UpsertStatement,
        scope: &[&str],
        path: &str,
    ) -> Result<String, GenError> {
        let target = self.table(&stmt.table);
        let conflict_path = child_path(path, "on_conflict");
        let tuples = self.row_values(&stmt.columns, &stmt.rows, scope, &child_path(path, "values"))?;
        let source_alias = if self.caps.table_alias_as {
            format!("AS {}", MERGE_SOURCE)
        } else {
            MERGE_SOURCE.to_string()
        };
        let using = if self.caps.multi_row_values {
            let tuples: Vec<String> = tuples
                .iter()
                .map(|t| format!("({})", t.join(", ")))
                .collect();
            format!(
                "USING (VALUES {}) {} {}",
                tuples.join(", "),
                source_alias,
                self.column_list(&stmt.columns)
            )
        } else {
            let selects: Vec<String> = tuples
                .iter()
                .map(|t| {
                    let cells: Vec<String> = t
                        .iter()
                        .zip(&stmt.columns)
                        .map(|(value, column)| format!("{} AS {}", value, self.ident(column)))
                        .collect();
                    format!("SELECT {} FROM DUAL", cells.join(", "))
                })
                .collect();
            format!("USING ({}) {}", selects.join(" UNION ALL "), source_alias)
        };

        let on: Vec<String> = stmt
            .on_conflict
            .columns
            .iter()
            .map(|c| {
                let c = self.ident(c);
                format!("{}.{} = {}.{}", target, c, MERGE_SOURCE, c)
            })
            .collect();
        let mut clauses = vec![
            format!("MERGE INTO {}", target),
            using,
            format!("ON ({})", on.join(" AND ")),
        ];

        let where_path = child_path(&conflict_path, "where");
        if let ConflictAction::Update(set) = &stmt.on_conflict.action {
            let update_path = child_path(&conflict_path, "update");
            if self.caps.conflict == ConflictStyle::Merge {
                let mut matched = "WHEN MATCHED".to_string();
                if let Some(guard) = &stmt.on_conflict.guard {
                    matched.push_str(" AND ");
                    matched.push_str(&self.expr(guard, scope, &where_path)?);
                }
                let set = self.assignments(set, scope, &update_path)?;
                clauses.push(format!("{} THEN UPDATE SET {}", matched, set));
            } else {
                let set = self.assignments(set, scope, &update_path)?;
                let mut matched = format!("WHEN MATCHED THEN UPDATE SET {}", set);
                if let Some(guard) = &stmt.on_conflict.guard {
                    matched.push_str(" WHERE ");
                    matched.push_str(&self.expr(guard, scope, &where_path)?);
                }
                clauses.push(matched);
            }
        }

        let inserted: Vec<String> = stmt
            .columns
            .iter()
            .map(|c| format!("{}.{}", MERGE_SOURCE, self.ident(c)))
            .collect();
        clauses.push(format!(
            "WHEN NOT MATCHED THEN INSERT {} VALUES ({})",
            self.column_list(&stmt.columns),
            inserted.join(", ")
        ));
        clauses.extend(self.output(&stmt.returning, "INSERTED"));
        let mut sql = clauses.join(self.sep());
        if self.caps.conflict == ConflictStyle::Merge {
            sql.push(';');
        }
        Ok(sql)
    }
}

/// Resolves an ORDER BY expression naming an output column to the
/// expression behind it.
fn output_expression<'q>(q: &'q SelectQuery, expr: &'q Expression) -> &'q Expression {
    if let Expression::Column(ColumnRef {
        qualifier: None,
        name,
    }) = expr
    {
        for p in &q.select {
            if let Projection::Named { alias, expr } = p {
                if alias == name {
                    return expr;
                }
            }
        }
    }
    expr
}
