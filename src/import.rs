//! Import resolution.
//!
//! A document can pull SELECT definitions from other documents:
//!
//! ```yaml
//! imports: [customer_summary]
//! query:
//!   with_clauses:
//!     summary:
//!       using: customer_summary
//!       parameters: {min_orders: 5}
//!   ...
//! ```
//!
//! Loading goes through the `ImportResolver` trait so that the compiler
//! itself never touches the filesystem.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use regex::{Captures, Regex};
use serde_yaml::{Mapping, Value};
use tracing::{debug, trace};

use crate::error::ParseError;

/// Maximum number of imports a single document may declare.
pub const MAX_IMPORTS: usize = 10;

/// Maximum nesting of imports within imports.
pub const MAX_DEPTH: usize = 3;

lazy_static! {
    /// Placeholder markers, with an optional default.
    static ref MARKER: Regex =
        Regex::new(r"#\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*(?::[^}]*)?\}").unwrap();
}

/// A document loaded by a resolver.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportedDocument {
    /// Identifies the document for cycle detection, such as a canonical path.
    pub key: String,
    /// The parsed document.
    pub value: Value,
}

/// Loads documents named in `imports` lists.
pub trait ImportResolver {
    /// Loads the document `name`, imported by the document with key `from`
    /// (`None` for the document being compiled).
    fn resolve(&self, name: &str, from: Option<&str>) -> Result<ImportedDocument, String>;
}

/// A resolver that refuses every import.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoImports;

impl ImportResolver for NoImports {
    fn resolve(&self, _name: &str, _from: Option<&str>) -> Result<ImportedDocument, String> {
        Err("imports are not enabled".to_string())
    }
}

/// A resolver that reads `.yql` files.
///
/// Names are resolved relative to the importing file's directory, or to the
/// base directory for the document being compiled. A `.yql` extension is
/// appended when the name has none.
#[derive(Debug, Clone)]
pub struct FsResolver {
    base: PathBuf,
}

impl FsResolver {
    pub fn new<P: Into<PathBuf>>(base: P) -> FsResolver {
        FsResolver { base: base.into() }
    }
}

impl ImportResolver for FsResolver {
    fn resolve(&self, name: &str, from: Option<&str>) -> Result<ImportedDocument, String> {
        let dir = match from.map(Path::new).and_then(Path::parent) {
            Some(parent) => parent.to_path_buf(),
            None => self.base.clone(),
        };
        let mut path = dir.join(name);
        if path.extension().is_none() {
            path.set_extension("yql");
        }
        let text =
            fs::read_to_string(&path).map_err(|e| format!("{}: {}", path.display(), e))?;
        let value =
            serde_yaml::from_str(&text).map_err(|e| format!("{}: {}", path.display(), e))?;
        let key = fs::canonicalize(&path).unwrap_or(path);
        Ok(ImportedDocument {
            key: key.to_string_lossy().into_owned(),
            value,
        })
    }
}

/// Imported documents, by name.
#[derive(Debug, Clone, Default)]
pub struct Definitions {
    docs: HashMap<String, Mapping>,
}

fn import_error(name: &str, reason: impl Into<String>) -> ParseError {
    ParseError::Import {
        name: name.to_string(),
        reason: reason.into(),
    }
}

/// Loads every document named by the root document's `imports` list,
/// following nested imports.
pub fn load(root: &Mapping, resolver: &dyn ImportResolver) -> Result<Definitions, ParseError> {
    let mut defs = Definitions::default();
    let mut chain = Vec::new();
    load_helper(root, None, resolver, 0, &mut chain, &mut defs)?;
    if !defs.docs.is_empty() {
        debug!(count = defs.docs.len(), "loaded imports");
    }
    Ok(defs)
}

/// Helper function for `load`.
fn load_helper(
    doc: &Mapping,
    from: Option<&str>,
    resolver: &dyn ImportResolver,
    depth: usize,
    chain: &mut Vec<String>,
    defs: &mut Definitions,
) -> Result<(), ParseError> {
    let names = match doc.get("imports") {
        None | Some(Value::Null) => return Ok(()),
        Some(Value::Sequence(names)) => names,
        Some(_) => return Err(import_error("imports", "expected a list of names")),
    };
    if names.len() > MAX_IMPORTS {
        return Err(import_error(
            "imports",
            format!("{} imports given, at most {} allowed", names.len(), MAX_IMPORTS),
        ));
    }
    for name in names {
        let name = match name.as_str() {
            Some(name) => name,
            None => return Err(import_error("imports", "import names must be strings")),
        };
        if depth >= MAX_DEPTH {
            return Err(import_error(
                name,
                format!("imports nested deeper than {}", MAX_DEPTH),
            ));
        }
        let imported = resolver
            .resolve(name, from)
            .map_err(|reason| import_error(name, reason))?;
        if chain.contains(&imported.key) {
            return Err(import_error(
                name,
                format!("circular import: {} -> {}", chain.join(" -> "), imported.key),
            ));
        }
        let body = match imported.value {
            Value::Mapping(body) => body,
            _ => return Err(import_error(name, "imported document must be a mapping")),
        };
        trace!(name, depth, "resolved import");

        chain.push(imported.key.clone());
        load_helper(&body, Some(&imported.key), resolver, depth + 1, chain, defs)?;
        chain.pop();

        let def_name = match body.get("name").and_then(Value::as_str) {
            Some(declared) => declared.to_string(),
            None => stem(name).to_string(),
        };
        if defs.docs.contains_key(&def_name) {
            return Err(import_error(name, format!("duplicate import name '{}'", def_name)));
        }
        defs.docs.insert(def_name, body);
    }
    Ok(())
}

/// Returns the last path segment of an import name, without extension.
fn stem(name: &str) -> &str {
    let file = name.rsplit(['/', '\\']).next().unwrap_or(name);
    file.strip_suffix(".yql").unwrap_or(file)
}

impl Definitions {
    /// Returns true if no documents were imported.
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Instantiates an imported `select_definition`, substituting parameter
    /// markers with literal values.
    ///
    /// `parameters` are merged over the imported document's own
    /// `parameters` defaults.
    pub fn instantiate(&self, name: &str, parameters: Option<&Value>) -> Result<Value, ParseError> {
        let doc = match self.docs.get(name) {
            Some(doc) => doc,
            None => {
                let mut known: Vec<&str> = self.docs.keys().map(String::as_str).collect();
                known.sort_unstable();
                return Err(import_error(
                    name,
                    format!("not imported (available: {})", known.join(", ")),
                ));
            }
        };
        let definition = match doc.get("select_definition") {
            Some(definition) => definition,
            None => return Err(import_error(name, "no select_definition")),
        };

        let mut values: HashMap<String, String> = HashMap::new();
        for source in [doc.get("parameters"), parameters].iter().flatten() {
            match source {
                Value::Mapping(map) => {
                    for (key, value) in map {
                        let key = match key.as_str() {
                            Some(key) => key.to_string(),
                            None => return Err(import_error(name, "parameter names must be strings")),
                        };
                        values.insert(key, sql_literal(value).map_err(|r| import_error(name, r))?);
                    }
                }
                Value::Null => (),
                _ => return Err(import_error(name, "parameters must be a mapping")),
            }
        }
        Ok(substitute(definition, &values))
    }
}

/// Formats a parameter value as a SQL literal.
fn sql_literal(value: &Value) -> Result<String, String> {
    match value {
        Value::Null => Ok("NULL".to_string()),
        Value::Bool(b) => Ok(if *b { "TRUE" } else { "FALSE" }.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) => Ok(format!("'{}'", s.replace('\'', "''"))),
        _ => Err("parameter values must be scalars".to_string()),
    }
}

/// Replaces known markers in every string of a value.
fn substitute(value: &Value, values: &HashMap<String, String>) -> Value {
    match value {
        Value::String(s) => {
            let replaced = MARKER.replace_all(s, |caps: &Captures| match values.get(&caps[1]) {
                Some(literal) => literal.clone(),
                None => caps[0].to_string(),
            });
            Value::String(replaced.into_owned())
        }
        Value::Sequence(items) => {
            Value::Sequence(items.iter().map(|v| substitute(v, values)).collect())
        }
        Value::Mapping(map) => Value::Mapping(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, values)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Serves documents from memory, recording what was asked for.
    #[derive(Default)]
    struct MemoryResolver {
        docs: HashMap<String, String>,
        requests: RefCell<Vec<String>>,
    }

    impl MemoryResolver {
        fn with(mut self, name: &str, text: &str) -> MemoryResolver {
            self.docs.insert(name.to_string(), text.to_string());
            self
        }
    }

    impl ImportResolver for MemoryResolver {
        fn resolve(&self, name: &str, _from: Option<&str>) -> Result<ImportedDocument, String> {
            self.requests.borrow_mut().push(name.to_string());
            let text = self.docs.get(name).ok_or_else(|| "not found".to_string())?;
            Ok(ImportedDocument {
                key: name.to_string(),
                value: serde_yaml::from_str(text).map_err(|e| e.to_string())?,
            })
        }
    }

    fn mapping(text: &str) -> Mapping {
        serde_yaml::from_str(text).unwrap()
    }

    const SUMMARY: &str = "
parameters: {min_orders: 1}
select_definition:
  select: [{id: c.id}]
  from: {c: customers}
  where: ['c.order_count >= #{min_orders}', \"c.region = #{region}\"]
";

    #[test]
    fn instantiates_with_parameters_over_defaults() {
        let resolver = MemoryResolver::default().with("summary", SUMMARY);
        let defs = load(&mapping("imports: [summary]"), &resolver).unwrap();
        let params: Value = serde_yaml::from_str("{region: \"O'Hare\"}").unwrap();
        let body = defs.instantiate("summary", Some(&params)).unwrap();
        let expected: Value = serde_yaml::from_str(
            "
select: [{id: c.id}]
from: {c: customers}
where: ['c.order_count >= 1', \"c.region = 'O''Hare'\"]
",
        )
        .unwrap();
        assert_eq!(body, expected);
    }

    #[test]
    fn declared_name_overrides_file_name() {
        let resolver =
            MemoryResolver::default().with("lib/summary.yql", "name: totals\nselect_definition: {}");
        let defs = load(&mapping("imports: [lib/summary.yql]"), &resolver).unwrap();
        assert!(defs.instantiate("totals", None).is_ok());
        assert!(defs.instantiate("summary", None).is_err());
    }

    #[test]
    fn too_many_imports() {
        let names: Vec<String> = (0..=MAX_IMPORTS).map(|i| format!("d{}", i)).collect();
        let root = mapping(&format!("imports: [{}]", names.join(", ")));
        let resolver = MemoryResolver::default();
        assert!(matches!(load(&root, &resolver), Err(ParseError::Import { .. })));
        assert!(resolver.requests.borrow().is_empty());
    }

    #[test]
    fn circular_imports() {
        let resolver = MemoryResolver::default()
            .with("a", "imports: [b]\nselect_definition: {}")
            .with("b", "imports: [a]\nselect_definition: {}");
        match load(&mapping("imports: [a]"), &resolver) {
            Err(ParseError::Import { reason, .. }) => assert!(reason.contains("circular")),
            other => panic!("expected an import error, got {:?}", other),
        }
    }

    #[test]
    fn depth_limit() {
        let resolver = MemoryResolver::default()
            .with("a", "imports: [b]")
            .with("b", "imports: [c]")
            .with("c", "imports: [d]")
            .with("d", "select_definition: {}");
        match load(&mapping("imports: [a]"), &resolver) {
            Err(ParseError::Import { name, .. }) => assert_eq!(name, "d"),
            other => panic!("expected an import error, got {:?}", other),
        }
    }

    #[test]
    fn duplicate_names() {
        let resolver = MemoryResolver::default()
            .with("x/a", "select_definition: {}")
            .with("y/a", "select_definition: {}");
        assert!(load(&mapping("imports: [x/a, y/a]"), &resolver).is_err());
    }

    #[test]
    fn no_imports_resolver_refuses() {
        assert!(load(&mapping("imports: [a]"), &NoImports).is_err());
        assert!(load(&mapping("query: {}"), &NoImports).unwrap().is_empty());
    }
}
