use std::collections::HashMap;
use std::fs;

use pretty_assertions::assert_eq;
use regex::Regex;

use yql::import::ImportedDocument;
use yql::{
    compile, parse, try_compile, try_compile_with, CompileError, Dialect, FsResolver, GenError,
    ImportResolver, Options, Outcome, ParseError,
};

fn sql(text: &str, dialect: &str) -> String {
    match compile(text, dialect) {
        Outcome::Success { sql, .. } => sql,
        Outcome::Error { message, .. } => panic!("compilation failed: {}", message),
    }
}

#[test]
fn scenario_simple_select() {
    let text = r#"{query: {select: [{id: "c.id"}], from: {c: "customers"}, limit: 10}}"#;
    assert_eq!(
        sql(text, "POSTGRES"),
        "SELECT c.id AS id FROM customers AS c LIMIT 10"
    );
}

#[test]
fn scenario_insert_fills_null() {
    let text = r#"
operation: insert
table: customers
values:
  - {name: "'Ann'", email: "'ann@example.com'"}
  - {name: "'Bob'"}
"#;
    for dialect in ["postgres", "mysql", "sqlite", "sqlserver"].iter() {
        assert!(
            sql(text, dialect).ends_with("('Bob', NULL)"),
            "For {}",
            dialect
        );
    }
    assert!(sql(text, "oracle").ends_with("SELECT 'Bob', NULL FROM DUAL"));
}

#[test]
fn scenario_guarded_upsert_on_mysql() {
    let text = "
operation: upsert
table: products
values: [{sku: \"'A1'\", stock: 5}]
on_conflict:
  columns: [sku]
  update: {stock: EXCLUDED.stock}
  where: EXCLUDED.stock > products.stock
";
    match try_compile(text, "mysql", &Options::default()) {
        Err(CompileError::Gen(GenError::UnsupportedFeature { dialect, path, .. })) => {
            assert_eq!(dialect, "mysql");
            assert_eq!(path, "upsert.on_conflict.where");
        }
        other => panic!("expected an unsupported feature, got {:?}", other),
    }
    assert!(sql(text, "postgres").ends_with("WHERE EXCLUDED.stock > products.stock"));
}

#[test]
fn scenario_forward_cte_reference() {
    let text = "
query:
  with_clauses:
    b: {select: [{id: a.id}], from: {a: a}}
    a: {select: [{id: o.id}], from: {o: orders}}
  select: [{id: b.id}]
  from: {b: b}
";
    assert_eq!(
        parse(text).unwrap_err(),
        ParseError::CircularOrForwardReference("a".to_string())
    );
    match compile(text, "postgres") {
        Outcome::Error { detail, .. } => {
            assert_eq!(detail.kind, "circular_or_forward_reference")
        }
        other => panic!("expected an error, got {:?}", other),
    }
}

const REPORT: &str = "
query:
  select:
    - region: c.region
    - orders: COUNT(o.id)
    - revenue: SUM(o.total)
  from: {c: customers}
  joins:
    - type: left
      alias: o
      table: orders
      on: o.customer_id = c.id
  where:
    - 'c.active = #{active}'
    - 'o.created_at >= #{since} OR o.created_at IS NULL'
  group_by: [c.region]
  having: ['SUM(o.total) > #{floor}']
  order_by:
    - revenue: DESC
  limit: 20
";

#[test]
fn generation_is_deterministic() {
    let doc = parse(REPORT).unwrap();
    for dialect in Dialect::ALL.iter() {
        let first = yql::generate(&doc.query, dialect.name()).unwrap();
        let again = yql::generate(&parse(REPORT).unwrap().query, dialect.name()).unwrap();
        assert_eq!(first, again, "For {}", dialect.name());
    }
}

#[test]
fn column_order_is_preserved() {
    for dialect in Dialect::ALL.iter() {
        let out = sql(REPORT, dialect.name());
        let region = out.find("AS region").unwrap();
        let orders = out.find("AS orders").unwrap();
        let revenue = out.find("AS revenue").unwrap();
        assert!(region < orders && orders < revenue, "For {}: {}", dialect.name(), out);
    }
}

#[test]
fn markers_match_parameters() {
    let markers = [
        (Dialect::Postgres, r"\$(\d+)"),
        (Dialect::MySql, r"(\?)"),
        (Dialect::Sqlite, r"(\?)"),
        (Dialect::SqlServer, r"@(\w+)"),
        (Dialect::Oracle, r":(\w+)"),
    ];
    for &(dialect, pattern) in markers.iter() {
        let compiled = try_compile(REPORT, dialect.name(), &Options::default())
            .unwrap()
            .compiled;
        let params = &compiled.params;
        assert_eq!(params.occurrences, vec!["active", "since", "floor"]);

        let names: Vec<String> = Regex::new(pattern)
            .unwrap()
            .captures_iter(&compiled.sql)
            .enumerate()
            .map(|(i, caps)| match dialect {
                Dialect::Postgres => {
                    let n: usize = caps[1].parse().unwrap();
                    params.bindings[n - 1].clone()
                }
                Dialect::MySql | Dialect::Sqlite => params.bindings[i].clone(),
                _ => caps[1].to_string(),
            })
            .collect();
        assert_eq!(names, params.occurrences, "For {}: {}", dialect.name(), compiled.sql);
    }
}

#[test]
fn unbound_aliases_never_compile() {
    let text = "query: {select: [{id: c.id}], from: {c: customers}, order_by: [z.id]}";
    for dialect in Dialect::ALL.iter() {
        match compile(text, dialect.name()) {
            Outcome::Error { detail, .. } => {
                assert_eq!(detail.kind, "unbound_alias");
                assert_eq!(detail.path.as_deref(), Some("query.order_by[0]"));
            }
            other => panic!("expected an error, got {:?}", other),
        }
    }
}

#[test]
fn top_level_or_is_parenthesized() {
    let out = sql(REPORT, "postgres");
    assert!(out.contains(
        "WHERE c.active = $1 AND (o.created_at >= $2 OR o.created_at IS NULL)"
    ));
}

struct Library(HashMap<&'static str, &'static str>);

impl ImportResolver for Library {
    fn resolve(&self, name: &str, _from: Option<&str>) -> Result<ImportedDocument, String> {
        let text = self.0.get(name).ok_or_else(|| format!("no document '{}'", name))?;
        Ok(ImportedDocument {
            key: name.to_string(),
            value: serde_yaml::from_str(text).map_err(|e| e.to_string())?,
        })
    }
}

const SUMMARY: &str = "
parameters: {min_total: 10}
select_definition:
  select: [{customer_id: o.customer_id}]
  from: {o: orders}
  where: ['o.total >= #{min_total}']
";

const IMPORTING: &str = "
imports: [summary]
query:
  with_clauses:
    big:
      using: summary
      parameters: {min_total: 100}
  select: [{id: b.customer_id}]
  from: {b: big}
";

#[test]
fn imported_definitions() {
    let library = Library([("summary", SUMMARY)].into_iter().collect());
    let result = try_compile_with(IMPORTING, "postgres", &Options::default(), &library).unwrap();
    assert_eq!(
        result.compiled.sql,
        "WITH big AS (SELECT o.customer_id AS customer_id FROM orders AS o \
         WHERE o.total >= 100) SELECT b.customer_id AS id FROM big AS b"
    );
    assert!(result.compiled.params.is_empty());
}

#[test]
fn imports_from_files() {
    let dir = std::env::temp_dir().join(format!("yql-imports-{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("summary.yql"), SUMMARY).unwrap();
    let resolver = FsResolver::new(&dir);
    let result = try_compile_with(IMPORTING, "sqlite", &Options::default(), &resolver);
    fs::remove_dir_all(&dir).unwrap();
    assert!(result.unwrap().compiled.sql.contains("o.total >= 100"));
}

#[test]
fn imports_are_refused_by_default() {
    match compile(IMPORTING, "postgres") {
        Outcome::Error { detail, .. } => assert_eq!(detail.kind, "import"),
        other => panic!("expected an error, got {:?}", other),
    }
}
