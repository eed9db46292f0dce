//! Expression sub-parser.
//!
//! YQL expressions are strings written in SQL. This module decides what kind
//! of expression a value is without parsing SQL grammar: plain identifiers
//! become column references, whole placeholders and string literals are
//! recognized, and everything else is kept as an opaque fragment. Fragments
//! are scanned once to split out parameter markers and to record the
//! qualified references and FROM/JOIN sources they contain.

use regex::Regex;
use serde_yaml::Value;

use crate::error::ParseError;
use crate::ops::Logic;
use crate::query::{ColumnRef, Expression, Fragment, Literal, Piece, Placeholder};

lazy_static! {
    /// A bare or alias-qualified column name.
    static ref COLUMN: Regex =
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").unwrap();

    /// A string consisting of a single placeholder.
    static ref WHOLE_PLACEHOLDER: Regex =
        Regex::new(r"^#\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*(?::([^}]*))?\}$").unwrap();

    /// The inside of a placeholder marker.
    static ref MARKER: Regex =
        Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*(?::(.*))?$").unwrap();

    /// A string consisting of a single-quoted SQL string.
    static ref STRING_LITERAL: Regex = Regex::new(r"^'((?:[^']|'')*)'$").unwrap();

    /// Dotted identifier chains, possibly followed by a call.
    static ref DOTTED: Regex = Regex::new(
        r"\b([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)+)(\s*\()?"
    ).unwrap();

    /// References to the row proposed by an upsert.
    static ref EXCLUDED_REF: Regex =
        Regex::new(r"(?i)\bEXCLUDED\.([A-Za-z_][A-Za-z0-9_]*)\b").unwrap();

    /// Keywords that introduce a table source.
    static ref SOURCE: Regex =
        Regex::new(r"(?i)\b(FROM|JOIN)\s+([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)?)")
            .unwrap();

    /// An optional alias following a table source or a parenthesized subquery.
    static ref ALIAS: Regex =
        Regex::new(r"(?i)^\s*(?:AS\s+)?([A-Za-z_][A-Za-z0-9_]*)").unwrap();

    static ref SELECT_KEYWORD: Regex = Regex::new(r"(?i)\bSELECT\b").unwrap();
    static ref OR_KEYWORD: Regex = Regex::new(r"(?i)\bOR\b").unwrap();
    static ref AND_KEYWORD: Regex = Regex::new(r"(?i)\bAND\b").unwrap();
    static ref NOT_PREFIX: Regex = Regex::new(r"(?i)^\s*NOT\b").unwrap();
}

/// Bare words that are SQL values rather than column names.
const VALUE_KEYWORDS: &[&str] = &[
    "NULL",
    "TRUE",
    "FALSE",
    "UNKNOWN",
    "DEFAULT",
    "CURRENT_DATE",
    "CURRENT_TIME",
    "CURRENT_TIMESTAMP",
    "CURRENT_USER",
    "SESSION_USER",
    "LOCALTIME",
    "LOCALTIMESTAMP",
    "SYSDATE",
    "SYSTIMESTAMP",
];

/// Words that can follow a table name but are never its alias.
const CLAUSE_KEYWORDS: &[&str] = &[
    "AND", "AS", "CROSS", "EXCEPT", "FETCH", "FOR", "FULL", "GROUP", "HAVING", "INNER",
    "INTERSECT", "JOIN", "LEFT", "LIMIT", "NATURAL", "OFFSET", "ON", "OR", "ORDER", "OUTER",
    "RETURNING", "RIGHT", "SET", "THEN", "UNION", "USING", "WHERE", "WINDOW", "WHEN", "ELSE",
    "END", "IS", "IN", "NOT", "LIKE", "BETWEEN", "ASC", "DESC", "NULLS", "OVER", "FILTER",
    "COLLATE",
];

/// Returns true if `word` is a bare SQL value keyword such as NULL.
pub fn is_value_keyword(word: &str) -> bool {
    VALUE_KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(word))
}

fn is_clause_keyword(word: &str) -> bool {
    CLAUSE_KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(word))
}

/// Classifies a YAML value as an expression.
///
/// Scalars other than strings become literals. Sequences and mappings are
/// not expressions; callers handle structured forms before getting here.
pub fn classify(value: &Value, path: &str) -> Result<Expression, ParseError> {
    match value {
        Value::Null => Ok(Expression::Literal(Literal::Null)),
        Value::Bool(b) => Ok(Expression::Literal(Literal::Boolean(*b))),
        Value::Number(n) => number(n, path).map(Expression::Literal),
        Value::String(s) => classify_str(s, path),
        Value::Tagged(tagged) => classify(&tagged.value, path),
        Value::Sequence(..) | Value::Mapping(..) => Err(ParseError::Invalid {
            path: path.to_string(),
            reason: "expected a scalar expression".to_string(),
        }),
    }
}

fn number(n: &serde_yaml::Number, path: &str) -> Result<Literal, ParseError> {
    if let Some(i) = n.as_i64() {
        return Ok(Literal::Integer(i));
    }
    if let Some(u) = n.as_u64() {
        return Ok(Literal::Decimal(u.to_string()));
    }
    match n.as_f64() {
        Some(f) if f.is_finite() => {
            let text = if f.fract() == 0.0 {
                format!("{:.1}", f)
            } else {
                f.to_string()
            };
            Ok(Literal::Decimal(text))
        }
        _ => Err(ParseError::Invalid {
            path: path.to_string(),
            reason: format!("number {} has no SQL representation", n),
        }),
    }
}

/// Classifies an expression string.
pub fn classify_str(text: &str, path: &str) -> Result<Expression, ParseError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ParseError::Fragment {
            path: path.to_string(),
            reason: "empty expression".to_string(),
        });
    }
    if let Some(caps) = WHOLE_PLACEHOLDER.captures(trimmed) {
        return Ok(Expression::Placeholder(Placeholder {
            name: caps[1].to_string(),
            default: caps.get(2).map(|m| m.as_str().trim().to_string()),
        }));
    }
    if COLUMN.is_match(trimmed) && !is_value_keyword(trimmed) {
        return Ok(Expression::Column(ColumnRef::parse(trimmed)));
    }
    if let Some(caps) = STRING_LITERAL.captures(trimmed) {
        if trimmed.contains("#{") {
            return Err(placeholder_in_string(path));
        }
        return Ok(Expression::Literal(Literal::String(caps[1].replace("''", "'"))));
    }
    fragment(trimmed, path).map(Expression::Raw)
}

fn placeholder_in_string(path: &str) -> ParseError {
    ParseError::Fragment {
        path: path.to_string(),
        reason: "placeholder inside a quoted string cannot be bound".to_string(),
    }
}

/// The result of scanning fragment text.
struct Scan {
    /// The text with quoted contents and placeholder markers blanked out.
    /// Byte offsets match the original text.
    masked: String,
    /// Parenthesis depth of every byte.
    depth: Vec<u32>,
    /// Placeholder markers with their byte ranges.
    params: Vec<(usize, usize, Placeholder)>,
}

/// Walks the text once, checking that quotes and parentheses balance.
fn scan(text: &str, path: &str) -> Result<Scan, ParseError> {
    let err = |reason: &str| ParseError::Fragment {
        path: path.to_string(),
        reason: reason.to_string(),
    };
    let bytes = text.as_bytes();
    let mut masked = bytes.to_vec();
    let mut depths = vec![0; bytes.len()];
    let mut params = Vec::new();
    let mut depth = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"' | b'`') => {
                let start = i;
                i += 1;
                loop {
                    if i >= bytes.len() {
                        return Err(err("unterminated quoted string"));
                    }
                    if bytes[i] == quote {
                        if bytes.get(i + 1) == Some(&quote) {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    if quote == b'\'' && bytes[i..].starts_with(b"#{") {
                        return Err(placeholder_in_string(path));
                    }
                    i += 1;
                }
                for k in start..=i {
                    depths[k] = depth;
                    if k != start && k != i {
                        masked[k] = b' ';
                    }
                }
                i += 1;
            }
            b'#' if bytes.get(i + 1) == Some(&b'{') => {
                let close = match text[i..].find('}') {
                    Some(offset) => i + offset,
                    None => return Err(err("unterminated placeholder")),
                };
                let caps = match MARKER.captures(&text[i + 2..close]) {
                    Some(caps) => caps,
                    None => return Err(err("invalid placeholder name")),
                };
                params.push((
                    i,
                    close + 1,
                    Placeholder {
                        name: caps[1].to_string(),
                        default: caps.get(2).map(|m| m.as_str().trim().to_string()),
                    },
                ));
                for k in i..=close {
                    depths[k] = depth;
                    masked[k] = b' ';
                }
                i = close + 1;
            }
            b'(' => {
                depths[i] = depth;
                depth += 1;
                i += 1;
            }
            b')' => {
                if depth == 0 {
                    return Err(err("unbalanced parentheses"));
                }
                depth -= 1;
                depths[i] = depth;
                i += 1;
            }
            _ => {
                depths[i] = depth;
                i += 1;
            }
        }
    }
    if depth != 0 {
        return Err(err("unbalanced parentheses"));
    }
    Ok(Scan {
        masked: String::from_utf8_lossy(&masked).into_owned(),
        depth: depths,
        params,
    })
}

/// Builds a raw fragment from SQL text.
pub fn fragment(text: &str, path: &str) -> Result<Fragment, ParseError> {
    let scan = scan(text, path)?;
    let masked = scan.masked.as_str();

    let mut events: Vec<(usize, usize, Piece)> = scan
        .params
        .into_iter()
        .map(|(start, end, p)| (start, end, Piece::Param(p)))
        .collect();
    for caps in EXCLUDED_REF.captures_iter(masked) {
        let whole = caps.get(0).map_or(0..0, |m| m.range());
        if !preceded_by_dot(masked, whole.start) {
            events.push((whole.start, whole.end, Piece::Excluded(caps[1].to_string())));
        }
    }
    events.sort_by_key(|&(start, _, _)| start);

    let mut pieces = Vec::new();
    let mut pos = 0;
    for (start, end, piece) in events {
        if start > pos {
            pieces.push(Piece::Text(text[pos..start].to_string()));
        }
        pieces.push(piece);
        pos = end;
    }
    if pos < text.len() {
        pieces.push(Piece::Text(text[pos..].to_string()));
    }

    let (sources, locals) = sources(masked, &scan.depth);
    Ok(Fragment {
        text: text.to_string(),
        pieces,
        refs: qualified_refs(masked),
        sources,
        locals,
        top_level: top_level(masked, &scan.depth),
    })
}

fn preceded_by_dot(masked: &str, start: usize) -> bool {
    masked[..start].ends_with('.')
}

/// Extracts `alias.column` references, skipping qualified function calls and
/// longer chains such as `schema.table.column`.
fn qualified_refs(masked: &str) -> Vec<ColumnRef> {
    let mut refs = Vec::new();
    for caps in DOTTED.captures_iter(masked) {
        let chain = &caps[1];
        let start = caps.get(1).map_or(0, |m| m.start());
        if caps.get(2).is_some() || preceded_by_dot(masked, start) {
            continue;
        }
        if chain.matches('.').count() == 1 {
            refs.push(ColumnRef::parse(chain));
        }
    }
    refs
}

/// Extracts tables named after FROM or JOIN, and the aliases given to them or
/// to parenthesized subqueries.
///
/// FROM only counts when a SELECT precedes it within the same parentheses, so that `EXTRACT(YEAR FROM col)` is not mistaken for a source.
fn sources(masked: &str, depth: &[u32]) -> (Vec<String>, Vec<String>) {
    let selects: Vec<usize> = SELECT_KEYWORD.find_iter(masked).map(|m| m.start()).collect();
    let mut sources = Vec::new();
    let mut locals = Vec::new();
    for caps in SOURCE.captures_iter(masked) {
        let (keyword, table) = match (caps.get(1), caps.get(2)) {
            (Some(k), Some(t)) => (k, t),
            _ => continue,
        };
        let rest = &masked[table.end()..];
        if rest.trim_start().starts_with('(') || rest.starts_with('.') {
            continue;
        }
        let at = keyword.start();
        let is_from = keyword.as_str().eq_ignore_ascii_case("FROM");
        if is_from && !introduced_by_select(&selects, at, depth) {
            continue;
        }
        sources.push(table.as_str().to_string());
        if let Some(alias) = alias_at(rest) {
            locals.push(alias);
        }
    }
    for (i, _) in masked.match_indices(')') {
        if let Some(alias) = alias_at(&masked[i + 1..]) {
            locals.push(alias);
        }
    }
    (sources, locals)
}

fn introduced_by_select(selects: &[usize], at: usize, depth: &[u32]) -> bool {
    let level = depth[at];
    selects
        .iter()
        .filter(|&&s| s < at && depth[s] == level)
        .any(|&s| depth[s..at].iter().all(|&d| d >= level))
}

fn alias_at(rest: &str) -> Option<String> {
    let caps = ALIAS.captures(rest)?;
    let word = caps.get(1)?.as_str();
    if is_clause_keyword(word) {
        None
    } else {
        Some(word.to_string())
    }
}

/// Finds the loosest logical connective outside parentheses and quotes.
fn top_level(masked: &str, depth: &[u32]) -> Option<Logic> {
    let top: String = masked
        .char_indices()
        .map(|(i, c)| if depth[i] == 0 && c != '(' && c != ')' { c } else { ' ' })
        .collect();
    if OR_KEYWORD.is_match(&top) {
        Some(Logic::Or)
    } else if AND_KEYWORD.is_match(&top) {
        Some(Logic::And)
    } else if NOT_PREFIX.is_match(&top) {
        Some(Logic::Not)
    } else {
        None
    }
}
