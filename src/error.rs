//! Error types.
//!
//! Each stage of the compiler has its own error type. Parse errors fail
//! fast, validation errors are collected, generation and access errors abort.
//! `CompileError` wraps all of them for the facade.

use serde::Serialize;
use thiserror::Error;

/// An error in the structure of a YQL document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("document has no operation, query or select")]
    MissingRoot,
    #[error("unknown operation '{0}'")]
    UnknownOperation(String),
    #[error("missing required field '{0}'")]
    MissingField(String),
    #[error("invalid join at {path}[{index}]: {reason}")]
    InvalidJoin {
        path: String,
        index: usize,
        reason: String,
    },
    #[error("no rows given in '{0}'")]
    EmptyValues(String),
    #[error("invalid conflict target: {0}")]
    InvalidConflictTarget(String),
    #[error("CTE '{0}' is referenced before it is defined")]
    CircularOrForwardReference(String),
    #[error("alias '{0}' is defined more than once")]
    DuplicateAlias(String),
    #[error("invalid order specification at {path}[{index}]")]
    InvalidOrderSpec { path: String, index: usize },
    #[error("malformed YAML: {0}")]
    Yaml(String),
    #[error("invalid value at '{path}': {reason}")]
    Invalid { path: String, reason: String },
    #[error("alias '{alias}' used at '{path}' is not bound")]
    UnboundAlias { alias: String, path: String },
    #[error("malformed expression at '{path}': {reason}")]
    Fragment { path: String, reason: String },
    #[error("cannot import '{name}': {reason}")]
    Import { name: String, reason: String },
}

/// A mismatch between a query and the document's schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("column '{1}' does not exist on '{0}'")]
    UnknownColumn(String, String),
    #[error("'{1}' is not an allowed value of enum column '{0}'")]
    InvalidEnumLiteral(String, String),
    #[error("column '{0}' cannot be NULL")]
    NotNullViolation(String),
    #[error("table '{0}' is not in the schema")]
    UnknownTable(String),
    #[error("value for column '{column}' exceeds maximum length {max}")]
    ValueTooLong { column: String, max: u64 },
}

/// An error while rendering IR as SQL.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenError {
    #[error("unknown dialect '{0}'")]
    UnknownDialect(String),
    #[error("{feature} is not supported by {dialect} (at '{path}')")]
    UnsupportedFeature {
        feature: String,
        dialect: String,
        path: String,
    },
    #[error("alias '{alias}' at '{path}' is not in scope")]
    UnresolvedAlias { alias: String, path: String },
}

/// A violation of the table access policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessError {
    #[error("access denied to tables: {}", .0.join(", "))]
    Denied(Vec<String>),
    #[error("tables not in the allowed list: {}", .0.join(", "))]
    Unauthorized(Vec<String>),
}

/// Any error the compiler facade can report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("{}", validation_message(.0))]
    Validation(Vec<ValidationError>),
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error(transparent)]
    Gen(#[from] GenError),
}

fn validation_message(errors: &[ValidationError]) -> String {
    let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
    format!("schema validation failed: {}", messages.join("; "))
}

/// Machine-readable description of a `CompileError`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorDetail {
    /// The error variant, in snake case.
    pub kind: &'static str,
    /// The document or IR path the error refers to, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl CompileError {
    /// Returns the error variant as a stable snake-case name.
    pub fn kind(&self) -> &'static str {
        match self {
            CompileError::Parse(e) => match e {
                ParseError::MissingRoot => "missing_root",
                ParseError::UnknownOperation(..) => "unknown_operation",
                ParseError::MissingField(..) => "missing_field",
                ParseError::InvalidJoin { .. } => "invalid_join",
                ParseError::EmptyValues(..) => "empty_values",
                ParseError::InvalidConflictTarget(..) => "invalid_conflict_target",
                ParseError::CircularOrForwardReference(..) => "circular_or_forward_reference",
                ParseError::DuplicateAlias(..) => "duplicate_alias",
                ParseError::InvalidOrderSpec { .. } => "invalid_order_spec",
                ParseError::Yaml(..) => "yaml",
                ParseError::Invalid { .. } => "invalid",
                ParseError::UnboundAlias { .. } => "unbound_alias",
                ParseError::Fragment { .. } => "fragment",
                ParseError::Import { .. } => "import",
            },
            CompileError::Validation(..) => "validation",
            CompileError::Access(e) => match e {
                AccessError::Denied(..) => "access_denied",
                AccessError::Unauthorized(..) => "unauthorized",
            },
            CompileError::Gen(e) => match e {
                GenError::UnknownDialect(..) => "unknown_dialect",
                GenError::UnsupportedFeature { .. } => "unsupported_feature",
                GenError::UnresolvedAlias { .. } => "unresolved_alias",
            },
        }
    }

    /// Returns the path the error refers to, if it has one.
    pub fn path(&self) -> Option<&str> {
        match self {
            CompileError::Parse(e) => match e {
                ParseError::MissingField(path)
                | ParseError::EmptyValues(path)
                | ParseError::InvalidJoin { path, .. }
                | ParseError::InvalidOrderSpec { path, .. }
                | ParseError::Invalid { path, .. }
                | ParseError::UnboundAlias { path, .. }
                | ParseError::Fragment { path, .. } => Some(path),
                ParseError::InvalidConflictTarget(..) => Some("on_conflict.columns"),
                ParseError::CircularOrForwardReference(..) => Some("with_clauses"),
                _ => None,
            },
            CompileError::Gen(e) => match e {
                GenError::UnsupportedFeature { path, .. }
                | GenError::UnresolvedAlias { path, .. } => Some(path),
                GenError::UnknownDialect(..) => None,
            },
            CompileError::Validation(..) => Some("schema"),
            CompileError::Access(..) => None,
        }
    }

    /// Returns the serializable detail for this error.
    pub fn detail(&self) -> ErrorDetail {
        ErrorDetail {
            kind: self.kind(),
            path: self.path().map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_feature_message_names_dialect_and_path() {
        let err = CompileError::from(GenError::UnsupportedFeature {
            feature: "conditional upsert".to_string(),
            dialect: "mysql".to_string(),
            path: "upsert.on_conflict.where".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "conditional upsert is not supported by mysql (at 'upsert.on_conflict.where')"
        );
        assert_eq!(err.kind(), "unsupported_feature");
        assert_eq!(err.path(), Some("upsert.on_conflict.where"));
    }

    #[test]
    fn access_error_lists_tables() {
        let err = AccessError::Denied(vec!["users".to_string(), "secrets".to_string()]);
        assert_eq!(err.to_string(), "access denied to tables: users, secrets");
    }

    #[test]
    fn validation_errors_are_joined() {
        let err = CompileError::Validation(vec![
            ValidationError::UnknownColumn("c".to_string(), "nme".to_string()),
            ValidationError::NotNullViolation("email".to_string()),
        ]);
        assert_eq!(
            err.to_string(),
            "schema validation failed: column 'nme' does not exist on 'c'; \
             column 'email' cannot be NULL"
        );
    }

    #[test]
    fn detail_serializes_without_missing_path() {
        let detail = CompileError::from(ParseError::MissingRoot).detail();
        assert_eq!(
            serde_json::to_string(&detail).unwrap(),
            r#"{"kind":"missing_root"}"#
        );
    }
}
