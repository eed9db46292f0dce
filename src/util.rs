//! Miscellaneous utilities.

use std::fmt;

/// Displays a slice as a comma-separated list.
pub struct CommaSep<'a, T: 'a>(pub &'a [T]);

impl<'a, T> fmt::Display for CommaSep<'a, T>
where
    T: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, item) in self.0.iter().enumerate() {
            if i != 0 {
                write!(f, ", ")?;
            }
            item.fmt(f)?
        }
        Ok(())
    }
}

/// Returns true if `s` matches `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_simple_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

/// Appends a key to a document path.
pub fn child_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", parent, key)
    }
}

/// Appends an index to a document path.
pub fn index_path(parent: &str, index: usize) -> String {
    format!("{}[{}]", parent, index)
}

/// Converts each element of a slice with `f`, passing its indexed path.
///
/// Returns the `Err` for the first failed conversion.
pub fn try_map_indexed<'a, T, U, E, F>(items: &'a [T], path: &str, mut f: F) -> Result<Vec<U>, E>
where
    F: FnMut(&'a T, &str) -> Result<U, E>,
{
    items
        .iter()
        .enumerate()
        .map(|(i, item)| f(item, &index_path(path, i)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comma_separated() {
        assert_eq!(CommaSep(&["a", "b", "c"]).to_string(), "a, b, c");
        assert_eq!(CommaSep::<&str>(&[]).to_string(), "");
    }

    #[test]
    fn simple_identifiers() {
        assert!(is_simple_ident("_tmp1"));
        assert!(is_simple_ident("Customers"));
        assert!(!is_simple_ident("1st"));
        assert!(!is_simple_ident("first name"));
        assert!(!is_simple_ident(""));
    }

    #[test]
    fn paths() {
        assert_eq!(child_path("", "query"), "query");
        assert_eq!(child_path("query", "where"), "query.where");
        assert_eq!(index_path("query.joins", 2), "query.joins[2]");
    }

    #[test]
    fn map_stops_at_first_error() {
        let result: Result<Vec<i32>, String> =
            try_map_indexed(&[1, -2, -3], "xs", |&x, path| {
                if x < 0 {
                    Err(path.to_string())
                } else {
                    Ok(x)
                }
            });
        assert_eq!(result, Err("xs[1]".to_string()));
    }
}
