//! Compiler from YQL, a YAML query language, to SQL.
//!
//! A YQL document describes one SELECT, INSERT, UPDATE, DELETE or upsert.
//! Compilation runs in four steps:
//!
//! 1. `parser` builds the IR in `query` from the document;
//! 2. `validate` checks it against the document's embedded schema, if any;
//! 3. an optional `policy` restricts which tables may be touched;
//! 4. `sql` renders the IR for one of the dialects in `dialect`.
//!
//! `compile` runs all four and packages the result as an `Outcome`.

#[macro_use]
extern crate lazy_static;

pub mod dialect;
pub mod error;
pub mod expr;
pub mod import;
pub mod ops;
pub mod params;
pub mod parser;
pub mod policy;
pub mod query;
pub mod schema;
pub mod sql;
pub mod validate;

mod map;
mod util;

use serde::Serialize;
use tracing::debug;

pub use crate::dialect::Dialect;
pub use crate::error::{
    AccessError, CompileError, ErrorDetail, GenError, ParseError, ValidationError,
};
pub use crate::import::{FsResolver, ImportResolver, NoImports};
pub use crate::map::OrderMap;
pub use crate::params::Parameters;
pub use crate::parser::{parse, Document};
pub use crate::policy::AccessPolicy;
pub use crate::query::Query;
pub use crate::sql::{generate, generate_with, Compiled, Style};

/// Compilation options.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub style: Style,
    /// Fail on schema validation problems instead of reporting them as
    /// warnings.
    pub strict: bool,
    pub policy: Option<AccessPolicy>,
}

/// A successful compilation.
#[derive(Debug, Clone, PartialEq)]
pub struct Compilation {
    pub compiled: Compiled,
    /// Schema problems found outside strict mode.
    pub warnings: Vec<ValidationError>,
}

/// The result of `compile`, in a form that serializes for callers outside
/// Rust.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Outcome {
    Success {
        sql: String,
        params: Parameters,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        warnings: Vec<String>,
    },
    Error {
        message: String,
        detail: ErrorDetail,
    },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }
}

impl From<Result<Compilation, CompileError>> for Outcome {
    fn from(result: Result<Compilation, CompileError>) -> Outcome {
        match result {
            Ok(c) => Outcome::Success {
                sql: c.compiled.sql,
                params: c.compiled.params,
                warnings: c.warnings.iter().map(ToString::to_string).collect(),
            },
            Err(e) => Outcome::Error {
                message: e.to_string(),
                detail: e.detail(),
            },
        }
    }
}

/// Compiles a YQL document for the named dialect with default options.
pub fn compile(text: &str, dialect: &str) -> Outcome {
    compile_with(text, dialect, &Options::default())
}

/// Compiles a YQL document for the named dialect.
pub fn compile_with(text: &str, dialect: &str, options: &Options) -> Outcome {
    try_compile(text, dialect, options).into()
}

/// Compiles a YQL document, refusing imports.
pub fn try_compile(text: &str, dialect: &str, options: &Options) -> Result<Compilation, CompileError> {
    try_compile_with(text, dialect, options, &NoImports)
}

/// Compiles a YQL document, loading imports through `resolver`.
pub fn try_compile_with(
    text: &str,
    dialect: &str,
    options: &Options,
    resolver: &dyn ImportResolver,
) -> Result<Compilation, CompileError> {
    let dialect: Dialect = dialect.parse()?;
    let doc = parser::parse_with(text, resolver)?;
    let warnings = match &doc.schema {
        Some(schema) => validate::validate(&doc.query, schema),
        None => Vec::new(),
    };
    if options.strict && !warnings.is_empty() {
        return Err(CompileError::Validation(warnings));
    }
    if let Some(policy) = &options.policy {
        policy.check(&doc.query)?;
    }
    let compiled = sql::generate_for(&doc.query, dialect, &options.style)?;
    debug!(
        dialect = dialect.name(),
        params = compiled.params.occurrences.len(),
        warnings = warnings.len(),
        "compiled document"
    );
    Ok(Compilation { compiled, warnings })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_outcome_serializes_with_status() {
        let outcome = compile(
            "query: {select: [{id: c.id}], from: {c: customers}, where: ['c.id = #{id}']}",
            "postgres",
        );
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            serde_json::json!({
                "status": "success",
                "sql": "SELECT c.id AS id FROM customers AS c WHERE c.id = $1",
                "params": {"occurrences": ["id"], "bindings": ["id"]},
            })
        );
    }

    #[test]
    fn error_outcome_carries_detail() {
        let outcome = compile("query: {from: {c: customers}}", "postgres");
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            serde_json::json!({
                "status": "error",
                "message": "missing required field 'query.select'",
                "detail": {"kind": "missing_field", "path": "query.select"},
            })
        );
    }

    const WITH_SCHEMA: &str = "
schema:
  tables:
    customers:
      columns:
        id: {type: integer}
query: {select: [{x: c.nickname}], from: {c: customers}}
";

    #[test]
    fn validation_is_a_warning_unless_strict() {
        match compile(WITH_SCHEMA, "sqlite") {
            Outcome::Success { warnings, .. } => assert_eq!(warnings.len(), 1),
            other => panic!("expected success, got {:?}", other),
        }
        let strict = Options {
            strict: true,
            ..Options::default()
        };
        assert!(matches!(
            try_compile(WITH_SCHEMA, "sqlite", &strict),
            Err(CompileError::Validation(..))
        ));
    }

    #[test]
    fn policy_runs_before_generation() {
        let options = Options {
            policy: Some(AccessPolicy::from_yaml("denied_tables: [customers]").unwrap()),
            ..Options::default()
        };
        let outcome = compile_with(WITH_SCHEMA, "db2", &options);
        assert!(!outcome.is_success());
        match try_compile(WITH_SCHEMA, "postgres", &options) {
            Err(CompileError::Access(AccessError::Denied(tables))) => {
                assert_eq!(tables, vec!["customers"])
            }
            other => panic!("expected an access error, got {:?}", other),
        }
    }
}
