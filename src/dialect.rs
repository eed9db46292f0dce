//! SQL dialects.
//!
//! Each dialect is described by a table of capabilities. The generator walks
//! the IR once and consults this table wherever dialects differ, so adding a
//! dialect means adding a row here rather than new control flow.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::GenError;
use crate::util::is_simple_ident;

/// A target SQL dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Postgres,
    MySql,
    Sqlite,
    SqlServer,
    Oracle,
}

/// Characters that delimit a quoted identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuoteStyle {
    pub start: char,
    pub end: char,
}

/// How a query limits the number of rows it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitStyle {
    /// `LIMIT n OFFSET m` after the other clauses.
    Limit,
    /// `SELECT TOP (n)`, or `OFFSET m ROWS FETCH NEXT n ROWS ONLY`.
    TopOrFetch,
    /// A wrapping query filtering on `ROW_NUMBER()`.
    RowNumber,
}

/// How an upsert is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictStyle {
    /// `ON CONFLICT (cols) DO UPDATE SET …`
    OnConflict,
    /// `ON DUPLICATE KEY UPDATE …`
    OnDuplicateKey,
    /// `MERGE INTO … USING … WHEN MATCHED AND guard THEN …`, terminated by a
    /// semicolon.
    Merge,
    /// `MERGE INTO … WHEN MATCHED THEN UPDATE SET … WHERE guard`.
    MergeWhere,
}

/// How parameter markers are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamStyle {
    /// `$1`, `$2`, …; a repeated name reuses its number.
    Numbered,
    /// `?` for every occurrence.
    Positional,
    /// The name behind a prefix character, like `:name` or `@name`.
    Named(char),
}

/// How statements report affected rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturningStyle {
    /// A trailing `RETURNING` clause.
    Returning,
    /// An `OUTPUT INSERTED.x` clause inside the statement.
    Output,
    Unsupported,
}

/// What a dialect can express and how.
#[derive(Debug)]
pub struct Capabilities {
    pub quote: QuoteStyle,
    /// Reserved words, in upper case.
    reserved: HashSet<&'static str>,
    /// Whether table aliases take the `AS` keyword.
    pub table_alias_as: bool,
    /// Whether UPDATE and DELETE name an aliased target by its alias and
    /// bind the alias in a trailing FROM clause.
    pub alias_in_from: bool,
    pub limit: LimitStyle,
    /// Whether LIMIT accepts computed expressions.
    pub limit_expressions: bool,
    /// Row count written as LIMIT when only an offset is given.
    pub offset_filler: Option<&'static str>,
    pub conflict: ConflictStyle,
    /// Whether a conflict update can be restricted by a condition.
    pub conflict_guard: bool,
    pub params: ParamStyle,
    /// Whether booleans are written as `TRUE`/`FALSE` rather than `1`/`0`.
    pub boolean_keywords: bool,
    pub returning: ReturningStyle,
    /// Whether `VALUES` takes more than one row.
    pub multi_row_values: bool,
    pub full_join: bool,
}

/// Reserved words shared by every dialect.
const COMMON_RESERVED: &[&str] = &[
    "ALL", "ALTER", "AND", "ANY", "AS", "ASC", "BETWEEN", "BY", "CASE", "CHECK", "COLUMN",
    "CONSTRAINT", "CREATE", "CROSS", "CURRENT_DATE", "CURRENT_TIME", "CURRENT_TIMESTAMP",
    "DEFAULT", "DELETE", "DESC", "DISTINCT", "DROP", "ELSE", "END", "EXCEPT", "EXISTS", "FALSE",
    "FOR", "FOREIGN", "FROM", "FULL", "GRANT", "GROUP", "HAVING", "IN", "INNER", "INSERT",
    "INTERSECT", "INTO", "IS", "JOIN", "LEFT", "LIKE", "NOT", "NULL", "ON", "OR", "ORDER",
    "OUTER", "PRIMARY", "REFERENCES", "RIGHT", "SELECT", "SET", "TABLE", "THEN", "TO", "TRUE",
    "UNION", "UNIQUE", "UPDATE", "USING", "VALUES", "WHEN", "WHERE", "WITH",
];

const POSTGRES_RESERVED: &[&str] = &[
    "ANALYSE", "ANALYZE", "ARRAY", "ASYMMETRIC", "BOTH", "CAST", "COLLATE", "CURRENT_USER", "DO",
    "FETCH", "LATERAL", "LEADING", "LIMIT", "LOCALTIME", "LOCALTIMESTAMP", "OFFSET", "ONLY",
    "PLACING", "RETURNING", "SESSION_USER", "SOME", "SYMMETRIC", "TRAILING", "USER", "VARIADIC",
    "WINDOW",
];

const MYSQL_RESERVED: &[&str] = &[
    "ACCESSIBLE", "ADD", "BEFORE", "BOTH", "CALL", "CHANGE", "DATABASE", "DATABASES", "DIV",
    "DUAL", "EXPLAIN", "FETCH", "FORCE", "INDEX", "INTERVAL", "KEY", "KEYS", "KILL", "LIMIT",
    "LOCK", "MATCH", "MOD", "OPTION", "RANK", "READ", "REGEXP", "RENAME", "REPLACE", "REQUIRE",
    "ROW", "ROWS", "SCHEMA", "SHOW", "SPATIAL", "SQL", "STARTING", "TRIGGER", "UNLOCK",
    "UNSIGNED", "USAGE", "USE", "WHILE", "WRITE", "XOR", "ZEROFILL",
];

const SQLITE_RESERVED: &[&str] = &[
    "ABORT", "ACTION", "ADD", "AFTER", "ANALYZE", "ATTACH", "AUTOINCREMENT", "BEFORE", "BEGIN",
    "CASCADE", "CAST", "COLLATE", "COMMIT", "CONFLICT", "DATABASE", "DEFERRABLE", "DETACH",
    "EACH", "ESCAPE", "EXCLUSIVE", "EXPLAIN", "FAIL", "GLOB", "IF", "IGNORE", "IMMEDIATE",
    "INDEX", "INDEXED", "INSTEAD", "ISNULL", "KEY", "LIMIT", "MATCH", "NATURAL", "NO", "NOTNULL",
    "OF", "OFFSET", "PLAN", "PRAGMA", "QUERY", "RAISE", "RECURSIVE", "REGEXP", "REINDEX",
    "RELEASE", "RENAME", "REPLACE", "RESTRICT", "ROLLBACK", "ROW", "SAVEPOINT", "TEMP",
    "TEMPORARY", "TRANSACTION", "TRIGGER", "VACUUM", "VIEW", "VIRTUAL",
];

const SQLSERVER_RESERVED: &[&str] = &[
    "ADD", "BACKUP", "BEGIN", "BREAK", "BROWSE", "BULK", "CASCADE", "CHECKPOINT", "CLOSE",
    "CLUSTERED", "COALESCE", "COMMIT", "COMPUTE", "CONTAINS", "CONTINUE", "CONVERT", "CURRENT",
    "CURRENT_USER", "CURSOR", "DATABASE", "DBCC", "DEALLOCATE", "DECLARE", "DENY", "DISK",
    "DISTRIBUTED", "DOUBLE", "DUMP", "ERRLVL", "ESCAPE", "EXEC", "EXECUTE", "EXIT", "FETCH",
    "FILE", "FILLFACTOR", "FUNCTION", "GOTO", "HOLDLOCK", "IDENTITY", "IF", "INDEX", "KEY",
    "KILL", "LINENO", "LOAD", "MERGE", "NATIONAL", "NOCHECK", "NONCLUSTERED", "OF", "OFF",
    "OFFSETS", "OPEN", "OPTION", "OVER", "PERCENT", "PIVOT", "PLAN", "PRECISION", "PRINT", "PROC",
    "PROCEDURE", "PUBLIC", "RAISERROR", "READ", "RESTORE", "RESTRICT", "RETURN", "REVERT",
    "REVOKE", "ROLLBACK", "ROWCOUNT", "RULE", "SAVE", "SCHEMA", "SESSION_USER", "SHUTDOWN",
    "SOME", "STATISTICS", "SYSTEM_USER", "TOP", "TRAN", "TRANSACTION", "TRIGGER", "TRUNCATE",
    "UNPIVOT", "USE", "USER", "VIEW", "WAITFOR", "WHILE",
];

const ORACLE_RESERVED: &[&str] = &[
    "ACCESS", "ADD", "AUDIT", "CLUSTER", "COMMENT", "COMPRESS", "CONNECT", "CURRENT", "DATE",
    "DECIMAL", "EXCLUSIVE", "FILE", "FLOAT", "IDENTIFIED", "IMMEDIATE", "INCREMENT", "INDEX",
    "INITIAL", "INTEGER", "LEVEL", "LOCK", "LONG", "MAXEXTENTS", "MINUS", "MODE", "MODIFY",
    "NOAUDIT", "NOCOMPRESS", "NOWAIT", "NUMBER", "OF", "OFFLINE", "ONLINE", "OPTION", "PCTFREE",
    "PRIOR", "PUBLIC", "RAW", "RENAME", "RESOURCE", "REVOKE", "ROW", "ROWID", "ROWNUM", "ROWS",
    "SESSION", "SHARE", "SIZE", "SMALLINT", "START", "SUCCESSFUL", "SYNONYM", "SYSDATE",
    "TRIGGER", "UID", "USER", "VALIDATE", "VARCHAR", "VARCHAR2", "VIEW", "WHENEVER",
];

fn reserved(extra: &[&'static str]) -> HashSet<&'static str> {
    COMMON_RESERVED.iter().chain(extra).cloned().collect()
}

lazy_static! {
    /// The capability table, one row per dialect.
    static ref CAPABILITIES: HashMap<Dialect, Capabilities> = {
        let mut map = HashMap::new();
        map.insert(Dialect::Postgres, Capabilities {
            quote: QuoteStyle { start: '"', end: '"' },
            reserved: reserved(POSTGRES_RESERVED),
            table_alias_as: true,
            alias_in_from: false,
            limit: LimitStyle::Limit,
            limit_expressions: true,
            offset_filler: None,
            conflict: ConflictStyle::OnConflict,
            conflict_guard: true,
            params: ParamStyle::Numbered,
            boolean_keywords: true,
            returning: ReturningStyle::Returning,
            multi_row_values: true,
            full_join: true,
        });
        map.insert(Dialect::MySql, Capabilities {
            quote: QuoteStyle { start: '`', end: '`' },
            reserved: reserved(MYSQL_RESERVED),
            table_alias_as: true,
            alias_in_from: false,
            limit: LimitStyle::Limit,
            limit_expressions: false,
            offset_filler: Some("18446744073709551615"),
            conflict: ConflictStyle::OnDuplicateKey,
            conflict_guard: false,
            params: ParamStyle::Positional,
            boolean_keywords: true,
            returning: ReturningStyle::Unsupported,
            multi_row_values: true,
            full_join: false,
        });
        map.insert(Dialect::Sqlite, Capabilities {
            quote: QuoteStyle { start: '"', end: '"' },
            reserved: reserved(SQLITE_RESERVED),
            table_alias_as: true,
            alias_in_from: false,
            limit: LimitStyle::Limit,
            limit_expressions: true,
            offset_filler: Some("-1"),
            conflict: ConflictStyle::OnConflict,
            conflict_guard: true,
            params: ParamStyle::Positional,
            boolean_keywords: true,
            returning: ReturningStyle::Returning,
            multi_row_values: true,
            full_join: true,
        });
        map.insert(Dialect::SqlServer, Capabilities {
            quote: QuoteStyle { start: '[', end: ']' },
            reserved: reserved(SQLSERVER_RESERVED),
            table_alias_as: true,
            alias_in_from: true,
            limit: LimitStyle::TopOrFetch,
            limit_expressions: true,
            offset_filler: None,
            conflict: ConflictStyle::Merge,
            conflict_guard: true,
            params: ParamStyle::Named('@'),
            boolean_keywords: false,
            returning: ReturningStyle::Output,
            multi_row_values: true,
            full_join: true,
        });
        map.insert(Dialect::Oracle, Capabilities {
            quote: QuoteStyle { start: '"', end: '"' },
            reserved: reserved(ORACLE_RESERVED),
            table_alias_as: false,
            alias_in_from: false,
            limit: LimitStyle::RowNumber,
            limit_expressions: true,
            offset_filler: None,
            conflict: ConflictStyle::MergeWhere,
            conflict_guard: true,
            params: ParamStyle::Named(':'),
            boolean_keywords: false,
            returning: ReturningStyle::Unsupported,
            multi_row_values: false,
            full_join: true,
        });
        map
    };
}

impl Dialect {
    /// All dialects, in a fixed order.
    pub const ALL: [Dialect; 5] = [
        Dialect::Postgres,
        Dialect::MySql,
        Dialect::Sqlite,
        Dialect::SqlServer,
        Dialect::Oracle,
    ];

    /// Returns the canonical lowercase name of the dialect.
    pub fn name(self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::MySql => "mysql",
            Dialect::Sqlite => "sqlite",
            Dialect::SqlServer => "sqlserver",
            Dialect::Oracle => "oracle",
        }
    }

    /// Returns the capability table row for the dialect.
    pub fn capabilities(self) -> &'static Capabilities {
        &CAPABILITIES[&self]
    }

    /// Returns true if `word` is reserved in this dialect.
    pub fn is_reserved(self, word: &str) -> bool {
        self.capabilities()
            .reserved
            .contains(word.to_ascii_uppercase().as_str())
    }

    /// Quotes an identifier if it is reserved or not a plain name.
    pub fn quote(self, ident: &str) -> String {
        if is_simple_ident(ident) && !self.is_reserved(ident) {
            return ident.to_string();
        }
        let QuoteStyle { start, end } = self.capabilities().quote;
        let escaped = ident.replace(end, &format!("{}{}", end, end));
        format!("{}{}{}", start, escaped, end)
    }

    /// Quotes a possibly schema-qualified name segment by segment.
    pub fn quote_path(self, name: &str) -> String {
        name.split('.')
            .map(|segment| self.quote(segment))
            .collect::<Vec<_>>()
            .join(".")
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Dialect {
    type Err = GenError;

    fn from_str(s: &str) -> Result<Dialect, GenError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Dialect::Postgres),
            "mysql" | "mariadb" => Ok(Dialect::MySql),
            "sqlite" | "sqlite3" => Ok(Dialect::Sqlite),
            "sqlserver" | "mssql" | "tsql" => Ok(Dialect::SqlServer),
            "oracle" => Ok(Dialect::Oracle),
            _ => Err(GenError::UnknownDialect(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_dialect_has_capabilities() {
        for dialect in Dialect::ALL.iter() {
            assert!(CAPABILITIES.contains_key(dialect), "For {}", dialect);
        }
    }

    #[test]
    fn names_round_trip() {
        for &dialect in Dialect::ALL.iter() {
            assert_eq!(dialect.name().parse::<Dialect>(), Ok(dialect));
        }
    }

    #[test]
    fn aliases_are_case_insensitive() {
        assert_eq!("PostgreSQL".parse(), Ok(Dialect::Postgres));
        assert_eq!("MSSQL".parse(), Ok(Dialect::SqlServer));
        assert_eq!(
            "db2".parse::<Dialect>(),
            Err(GenError::UnknownDialect("db2".to_string()))
        );
    }

    #[test]
    fn quotes_only_when_needed() {
        assert_eq!(Dialect::Postgres.quote("customers"), "customers");
        assert_eq!(Dialect::Postgres.quote("order"), "\"order\"");
        assert_eq!(Dialect::MySql.quote("order"), "`order`");
        assert_eq!(Dialect::SqlServer.quote("user"), "[user]");
        assert_eq!(Dialect::Postgres.quote("first name"), "\"first name\"");
    }

    #[test]
    fn reserved_words_differ_by_dialect() {
        assert_eq!(Dialect::Postgres.quote("date"), "date");
        assert_eq!(Dialect::Oracle.quote("date"), "\"date\"");
        assert_eq!(Dialect::Sqlite.quote("key"), "\"key\"");
        assert_eq!(Dialect::Postgres.quote("key"), "key");
    }

    #[test]
    fn quote_characters_are_escaped() {
        assert_eq!(Dialect::Postgres.quote("a\"b"), "\"a\"\"b\"");
        assert_eq!(Dialect::SqlServer.quote("a]b"), "[a]]b]");
    }

    #[test]
    fn dotted_names_quote_each_segment() {
        assert_eq!(Dialect::Postgres.quote_path("sales.order"), "sales.\"order\"");
        assert_eq!(Dialect::MySql.quote_path("app.users"), "app.users");
    }
}
