//! Table access policy.
//!
//! A policy is loaded from YAML:
//!
//! ```yaml
//! denied_tables: [user_passwords, admin_logs]
//! allowed_tables: [customers, orders]
//! ```
//!
//! An empty `allowed_tables` list allows every table that is not denied.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::error::{AccessError, ParseError};
use crate::query::Query;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AccessPolicy {
    #[serde(default)]
    pub denied_tables: Vec<String>,
    #[serde(default)]
    pub allowed_tables: Vec<String>,
}

/// Returns true if `table` is `listed`, ignoring case. A schema-qualified
/// table also matches its unqualified name.
fn matches(listed: &str, table: &str) -> bool {
    let base = table.rsplit('.').next().unwrap_or(table);
    listed.eq_ignore_ascii_case(table) || listed.eq_ignore_ascii_case(base)
}

impl AccessPolicy {
    /// Parses a policy document. An empty document is the open policy.
    pub fn from_yaml(text: &str) -> Result<AccessPolicy, ParseError> {
        if text.trim().is_empty() {
            return Ok(AccessPolicy::default());
        }
        serde_yaml::from_str(text).map_err(|e| ParseError::Invalid {
            path: "policy".to_string(),
            reason: e.to_string(),
        })
    }

    /// Reads a policy file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<AccessPolicy, ParseError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| ParseError::Invalid {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        AccessPolicy::from_yaml(&text)
    }

    /// Checks every base table the query reads or writes.
    pub fn check(&self, query: &Query) -> Result<(), AccessError> {
        let tables = query.tables();
        debug!(tables = tables.len(), "checking table access");

        let mut denied: Vec<String> = tables
            .iter()
            .filter(|t| self.denied_tables.iter().any(|d| matches(d, t)))
            .cloned()
            .collect();
        if !denied.is_empty() {
            denied.sort();
            return Err(AccessError::Denied(denied));
        }

        if self.allowed_tables.is_empty() {
            return Ok(());
        }
        let mut unauthorized: Vec<String> = tables
            .into_iter()
            .filter(|t| !self.allowed_tables.iter().any(|a| matches(a, t)))
            .collect();
        if !unauthorized.is_empty() {
            unauthorized.sort();
            return Err(AccessError::Unauthorized(unauthorized));
        }
        Ok(())
    }
}
