//! YQL intermediate representation.
//!
//! The parser builds these structures from a document and the generator
//! renders them as SQL. Nothing mutates them in between: every node is
//! constructed once and read-only afterwards.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::map::OrderMap;
use crate::ops::{self, Logic, Parenthesize, Precedence};

/// A compiled YQL statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Select(SelectQuery),
    Insert(InsertStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
    Upsert(UpsertStatement),
}

/// A SELECT query, possibly preceded by common table expressions.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    /// Named CTEs, in definition order.
    pub ctes: OrderMap<String, SelectQuery>,
    /// The projections, in output column order.
    pub select: Vec<Projection>,
    /// The primary source table.
    pub from: TableRef,
    /// The join chain, in declaration order.
    pub joins: Vec<Join>,
    /// The "WHERE" clause, as a vector of conjuncts.
    pub filter: Vec<Expression>,
    /// The "GROUP BY" expressions.
    pub group_by: Vec<Expression>,
    /// The "HAVING" clause, as a vector of conjuncts.
    pub having: Vec<Expression>,
    /// The "ORDER BY" specifications.
    pub order_by: Vec<OrderSpec>,
    /// Maximum number of rows.
    pub limit: Option<RowCount>,
    /// Number of rows to skip.
    pub offset: Option<RowCount>,
    /// Page-based alternative to `limit` and `offset`.
    pub pagination: Option<Pagination>,
}

/// A table bound to an alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    /// The table (or CTE) name, possibly schema-qualified.
    pub table: String,
    /// The alias the rest of the query refers to it by.
    pub alias: String,
}

/// An entry of a SELECT list.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// An expression with an output name.
    Named { alias: String, expr: Expression },
    /// All columns, optionally of a single source (`c.*`).
    Wildcard { qualifier: Option<String> },
}

/// The kind of a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

/// A join of another table onto the FROM clause.
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    pub target: TableRef,
    /// The join condition, as a vector of conjuncts. Empty only for CROSS.
    pub on: Vec<Expression>,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// An "ORDER BY" entry.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderSpec {
    pub expr: Expression,
    pub direction: Direction,
}

/// A row count for LIMIT, OFFSET and pagination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowCount {
    /// A literal count.
    Count(u64),
    /// A count supplied as a bound parameter.
    Param(Placeholder),
}

/// Page-based row limiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pagination {
    /// One-based page number.
    pub page: RowCount,
    /// Rows per page.
    pub per_page: RowCount,
}

/// A row of values, keyed by column.
pub type Row = OrderMap<String, Expression>;

/// Where the rows of an INSERT come from.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertSource {
    /// Literal rows; cells missing from a row are NULL.
    Values(Vec<Row>),
    /// The result of a query.
    Select(Box<SelectQuery>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    pub table: String,
    /// The column list, in output order.
    pub columns: Vec<String>,
    pub source: InsertSource,
    pub returning: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStatement {
    pub table: String,
    pub alias: Option<String>,
    /// Assignments, in document order. Never empty.
    pub set: OrderMap<String, Expression>,
    /// The "WHERE" clause; empty means every row.
    pub filter: Vec<Expression>,
    pub returning: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStatement {
    pub table: String,
    pub alias: Option<String>,
    pub filter: Vec<Expression>,
    pub returning: Vec<String>,
}

/// An INSERT that resolves uniqueness conflicts instead of failing.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertStatement {
    pub table: String,
    /// Union of the row keys, in first-seen order.
    pub columns: Vec<String>,
    /// The rows to insert. Never empty.
    pub rows: Vec<Row>,
    pub on_conflict: OnConflict,
    pub returning: Vec<String>,
}

/// What an upsert does when a row collides with an existing one.
#[derive(Debug, Clone, PartialEq)]
pub struct OnConflict {
    /// The conflict target. Never empty.
    pub columns: Vec<String>,
    pub action: ConflictAction,
    /// Restricts which conflicting rows get updated.
    pub guard: Option<Expression>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConflictAction {
    /// Overwrite the existing row with these assignments.
    Update(OrderMap<String, Expression>),
    /// Keep the existing row.
    Nothing,
}

/// An expression in a YQL document.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// A column, optionally qualified by a table alias.
    Column(ColumnRef),
    /// Opaque SQL text passed through to the output.
    Raw(Fragment),
    /// A typed constant.
    Literal(Literal),
    /// A bound parameter.
    Placeholder(Placeholder),
    /// A structured comparison `lhs op rhs`.
    Comparison {
        lhs: Box<Expression>,
        op: String,
        rhs: Box<Expression>,
    },
    /// A parenthesized list, only valid as the right side of IN.
    List(Vec<Expression>),
}

/// A reference to a column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    pub qualifier: Option<String>,
    pub name: String,
}

/// A typed constant.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Integer(i64),
    /// A decimal number, kept in its textual form.
    Decimal(String),
    String(String),
    Boolean(bool),
    Null,
}

/// A named parameter marker, written `#{name}` or `#{name:default}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Placeholder {
    pub name: String,
    /// Default value documented in the marker; informational only.
    pub default: Option<String>,
}

/// Raw SQL text with its parameter markers split out.
///
/// Besides the pieces needed for rendering, the fragment records what the
/// sub-parser could see inside the text without parsing SQL grammar, so that
/// later passes can check aliases and table access.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    /// The text as written in the document.
    pub text: String,
    /// The text split into literal runs, parameters and excluded-row columns.
    pub pieces: Vec<Piece>,
    /// Qualified column references (`alias.column`) outside quotes.
    pub refs: Vec<ColumnRef>,
    /// Tables named after FROM or JOIN inside the fragment.
    pub sources: Vec<String>,
    /// Aliases the fragment defines for those tables.
    pub locals: Vec<String>,
    /// The loosest logical connective outside parentheses, if any.
    pub top_level: Option<Logic>,
}

/// A piece of a raw fragment.
#[derive(Debug, Clone, PartialEq)]
pub enum Piece {
    /// Literal SQL text.
    Text(String),
    /// A parameter marker.
    Param(Placeholder),
    /// A column of the row proposed by an upsert (`EXCLUDED.column`).
    Excluded(String),
}

/// Name of the pseudo-table holding the row proposed by an upsert.
pub const EXCLUDED: &str = "EXCLUDED";

impl Query {
    /// Returns a short name for the statement kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Query::Select(..) => "select",
            Query::Insert(..) => "insert",
            Query::Update(..) => "update",
            Query::Delete(..) => "delete",
            Query::Upsert(..) => "upsert",
        }
    }

    /// Returns the base tables the statement reads or writes.
    ///
    /// CTE names are not base tables and are left out, unless some other
    /// part of the statement names the same table outside the CTE's scope.
    pub fn tables(&self) -> Vec<String> {
        let mut tables = Vec::new();
        let none = HashSet::new();
        match self {
            Query::Select(select) => select.tables_helper(&none, &mut tables),
            Query::Insert(insert) => {
                tables.push(insert.table.clone());
                match &insert.source {
                    InsertSource::Values(rows) => rows_tables(rows, &mut tables),
                    InsertSource::Select(select) => select.tables_helper(&none, &mut tables),
                }
            }
            Query::Update(update) => {
                tables.push(update.table.clone());
                for expr in update.set.values().chain(&update.filter) {
                    expr.tables_helper(&none, &mut tables);
                }
            }
            Query::Delete(delete) => {
                tables.push(delete.table.clone());
                for expr in &delete.filter {
                    expr.tables_helper(&none, &mut tables);
                }
            }
            Query::Upsert(upsert) => {
                tables.push(upsert.table.clone());
                rows_tables(&upsert.rows, &mut tables);
                if let ConflictAction::Update(set) = &upsert.on_conflict.action {
                    for expr in set.values() {
                        expr.tables_helper(&none, &mut tables);
                    }
                }
                if let Some(guard) = &upsert.on_conflict.guard {
                    guard.tables_helper(&none, &mut tables);
                }
            }
        }
        let mut seen = HashSet::new();
        tables.retain(|t| seen.insert(t.clone()));
        tables
    }
}

/// Helper for `Query::tables` over value rows.
fn rows_tables(rows: &[Row], tables: &mut Vec<String>) {
    let none = HashSet::new();
    for row in rows {
        for expr in row.values() {
            expr.tables_helper(&none, tables);
        }
    }
}

impl SelectQuery {
    /// Returns the aliases bound by the FROM clause and the joins.
    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.from.alias.as_str())
            .chain(self.joins.iter().map(|j| j.target.alias.as_str()))
    }

    /// Returns the table an alias is bound to, if any.
    pub fn table_of(&self, alias: &str) -> Option<&str> {
        std::iter::once(&self.from)
            .chain(self.joins.iter().map(|j| &j.target))
            .find(|t| t.alias == alias)
            .map(|t| t.table.as_str())
    }

    /// Returns the output column names, in order. Wildcards have none.
    pub fn output_aliases(&self) -> impl Iterator<Item = &str> {
        self.select.iter().filter_map(|p| match p {
            Projection::Named { alias, .. } => Some(alias.as_str()),
            Projection::Wildcard { .. } => None,
        })
    }

    /// Returns every expression of the query body (not of its CTEs), paired
    /// with the clause it belongs to.
    pub fn expressions(&self) -> Vec<(&'static str, &Expression)> {
        let mut exprs = Vec::new();
        for p in &self.select {
            if let Projection::Named { expr, .. } = p {
                exprs.push(("select", expr));
            }
        }
        for join in &self.joins {
            exprs.extend(join.on.iter().map(|e| ("joins", e)));
        }
        exprs.extend(self.filter.iter().map(|e| ("where", e)));
        exprs.extend(self.group_by.iter().map(|e| ("group_by", e)));
        exprs.extend(self.having.iter().map(|e| ("having", e)));
        exprs.extend(self.order_by.iter().map(|o| ("order_by", &o.expr)));
        exprs
    }

    /// Helper function for `Query::tables`.
    fn tables_helper(&self, outer_ctes: &HashSet<String>, tables: &mut Vec<String>) {
        let mut ctes = outer_ctes.clone();
        for (name, body) in self.ctes.iter() {
            body.tables_helper(&ctes, tables);
            ctes.insert(name.clone());
        }
        for source in std::iter::once(&self.from).chain(self.joins.iter().map(|j| &j.target)) {
            if !ctes.contains(&source.table) {
                tables.push(source.table.clone());
            }
        }
        for (_, expr) in self.expressions() {
            expr.tables_helper(&ctes, tables);
        }
    }
}

impl Expression {
    /// Returns the column references in the expression, including qualified
    /// references found inside raw fragments.
    pub fn column_refs(&self) -> Vec<&ColumnRef> {
        let mut refs = Vec::new();
        self.column_refs_helper(&mut refs);
        refs
    }

    /// Helper function for `column_refs`.
    fn column_refs_helper<'a>(&'a self, refs: &mut Vec<&'a ColumnRef>) {
        match self {
            Expression::Column(col) => refs.push(col),
            Expression::Raw(frag) => refs.extend(frag.refs.iter()),
            Expression::Comparison { lhs, rhs, .. } => {
                lhs.column_refs_helper(refs);
                rhs.column_refs_helper(refs);
            }
            Expression::List(items) => {
                for item in items {
                    item.column_refs_helper(refs);
                }
            }
            Expression::Literal(..) | Expression::Placeholder(..) => (),
        }
    }

    /// Returns the aliases defined locally inside raw fragments.
    pub fn local_aliases(&self) -> Vec<&str> {
        match self {
            Expression::Raw(frag) => frag.locals.iter().map(String::as_str).collect(),
            Expression::Comparison { lhs, rhs, .. } => {
                let mut locals = lhs.local_aliases();
                locals.extend(rhs.local_aliases());
                locals
            }
            Expression::List(items) => items.iter().flat_map(|e| e.local_aliases()).collect(),
            _ => Vec::new(),
        }
    }

    /// Returns the tables named by FROM/JOIN clauses inside raw fragments.
    pub fn sources(&self) -> Vec<&str> {
        match self {
            Expression::Raw(frag) => frag.sources.iter().map(String::as_str).collect(),
            Expression::Comparison { lhs, rhs, .. } => {
                let mut sources = lhs.sources();
                sources.extend(rhs.sources());
                sources
            }
            Expression::List(items) => items.iter().flat_map(|e| e.sources()).collect(),
            _ => Vec::new(),
        }
    }

    /// Helper function for `Query::tables`.
    fn tables_helper(&self, ctes: &HashSet<String>, tables: &mut Vec<String>) {
        for source in self.sources() {
            if !ctes.contains(source) {
                tables.push(source.to_string());
            }
        }
    }

    /// Returns true if the expression is the NULL literal.
    pub fn is_null(&self) -> bool {
        match self {
            Expression::Literal(Literal::Null) => true,
            Expression::Raw(frag) => frag.text.trim().eq_ignore_ascii_case("NULL"),
            _ => false,
        }
    }
}

impl Parenthesize for Expression {
    fn precedence(&self) -> Precedence {
        match self {
            Expression::Raw(frag) => frag
                .top_level
                .map(Logic::precedence)
                .unwrap_or(ops::HIGHEST_PRECEDENCE),
            Expression::Comparison { op, .. } => {
                ops::precedence(op).unwrap_or(ops::HIGHEST_PRECEDENCE)
            }
            _ => ops::HIGHEST_PRECEDENCE,
        }
    }
}

impl ColumnRef {
    /// Creates a reference, splitting a dotted name into qualifier and column.
    pub fn parse(name: &str) -> ColumnRef {
        match name.split_once('.') {
            Some((qualifier, column)) => ColumnRef {
                qualifier: Some(qualifier.to_string()),
                name: column.to_string(),
            },
            None => ColumnRef {
                qualifier: None,
                name: name.to_string(),
            },
        }
    }

    /// Returns true if the reference names a column of the upsert's proposed
    /// row rather than a real table.
    pub fn is_excluded(&self) -> bool {
        self.qualifier
            .as_deref()
            .map_or(false, |q| q.eq_ignore_ascii_case(EXCLUDED))
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.qualifier {
            Some(q) => write!(f, "{}.{}", q, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl JoinKind {
    /// Returns the SQL keywords introducing the join.
    pub fn keyword(self) -> &'static str {
        match self {
            JoinKind::Inner => "INNER JOIN",
            JoinKind::Left => "LEFT JOIN",
            JoinKind::Right => "RIGHT JOIN",
            JoinKind::Full => "FULL JOIN",
            JoinKind::Cross => "CROSS JOIN",
        }
    }
}

impl FromStr for JoinKind {
    type Err = ();

    fn from_str(s: &str) -> Result<JoinKind, ()> {
        match ops::normalize(s).as_str() {
            "INNER" => Ok(JoinKind::Inner),
            "LEFT" | "LEFT OUTER" => Ok(JoinKind::Left),
            "RIGHT" | "RIGHT OUTER" => Ok(JoinKind::Right),
            "FULL" | "FULL OUTER" => Ok(JoinKind::Full),
            "CROSS" => Ok(JoinKind::Cross),
            _ => Err(()),
        }
    }
}

impl Direction {
    pub fn keyword(self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

impl FromStr for Direction {
    type Err = ();

    fn from_str(s: &str) -> Result<Direction, ()> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ASC" => Ok(Direction::Asc),
            "DESC" => Ok(Direction::Desc),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str) -> Expression {
        Expression::Column(ColumnRef::parse(name))
    }

    fn raw(text: &str, refs: &[&str], sources: &[&str]) -> Expression {
        Expression::Raw(Fragment {
            text: text.to_string(),
            pieces: vec![Piece::Text(text.to_string())],
            refs: refs.iter().map(|r| ColumnRef::parse(r)).collect(),
            sources: sources.iter().map(|s| s.to_string()).collect(),
            locals: vec![],
            top_level: None,
        })
    }

    fn select(from: &str, alias: &str) -> SelectQuery {
        SelectQuery {
            ctes: OrderMap::new(),
            select: vec![Projection::Named {
                alias: "id".to_string(),
                expr: col(&format!("{}.id", alias)),
            }],
            from: TableRef {
                table: from.to_string(),
                alias: alias.to_string(),
            },
            joins: vec![],
            filter: vec![],
            group_by: vec![],
            having: vec![],
            order_by: vec![],
            limit: None,
            offset: None,
            pagination: None,
        }
    }

    #[test]
    fn column_refs_of_comparison() {
        let expr = Expression::Comparison {
            lhs: Box::new(col("c.status")),
            op: "IN".to_string(),
            rhs: Box::new(Expression::List(vec![
                Expression::Literal(Literal::String("a".to_string())),
                col("d.kind"),
            ])),
        };
        let refs: Vec<String> = expr.column_refs().iter().map(|r| r.to_string()).collect();
        assert_eq!(refs, vec!["c.status", "d.kind"]);
    }

    #[test]
    fn column_refs_of_fragment() {
        let expr = raw("c.a + o.b", &["c.a", "o.b"], &[]);
        assert_eq!(expr.column_refs().len(), 2);
    }

    #[test]
    fn excluded_qualifier_is_case_insensitive() {
        assert!(ColumnRef::parse("excluded.price").is_excluded());
        assert!(ColumnRef::parse("EXCLUDED.price").is_excluded());
        assert!(!ColumnRef::parse("p.price").is_excluded());
        assert!(!ColumnRef::parse("price").is_excluded());
    }

    #[test]
    fn tables_skip_cte_names() {
        let mut main = select("recent", "r");
        main.ctes.insert("recent".to_string(), select("orders", "o"));
        main.filter
            .push(raw("EXISTS (SELECT 1 FROM refunds f)", &[], &["refunds"]));
        assert_eq!(Query::Select(main).tables(), vec!["orders", "refunds"]);
    }

    #[test]
    fn tables_of_update() {
        let mut set = OrderMap::new();
        set.insert("status".to_string(), col("done"));
        let update = UpdateStatement {
            table: "orders".to_string(),
            alias: None,
            set,
            filter: vec![raw("id IN (SELECT order_id FROM items)", &[], &["items"])],
            returning: vec![],
        };
        assert_eq!(Query::Update(update).tables(), vec!["orders", "items"]);
    }

    #[test]
    fn join_kind_spellings() {
        assert_eq!("left outer".parse(), Ok(JoinKind::Left));
        assert_eq!("FULL".parse(), Ok(JoinKind::Full));
        assert_eq!("sideways".parse::<JoinKind>(), Err(()));
    }

    #[test]
    fn raw_precedence_follows_top_level_connective() {
        let mut frag = match raw("a OR b", &[], &[]) {
            Expression::Raw(frag) => frag,
            _ => unreachable!(),
        };
        frag.top_level = Some(Logic::Or);
        assert_eq!(Expression::Raw(frag).precedence(), Logic::Or.precedence());
        assert_eq!(col("a").precedence(), ops::HIGHEST_PRECEDENCE);
    }
}
