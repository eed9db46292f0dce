//! Bound parameters.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::dialect::ParamStyle;
use crate::query::Placeholder;

/// The parameters of a generated statement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Parameters {
    /// Placeholder names, one per marker, in the order the markers appear.
    pub occurrences: Vec<String>,
    /// Names of the values the caller binds, in binding order. With
    /// positional markers this equals `occurrences`; otherwise each name
    /// appears once.
    pub bindings: Vec<String>,
    /// Default values documented in the markers, by name.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub defaults: BTreeMap<String, String>,
}

impl Parameters {
    /// Creates an empty parameter list.
    pub fn new() -> Parameters {
        Parameters::default()
    }

    /// Returns true if the statement takes no parameters.
    pub fn is_empty(&self) -> bool {
        self.occurrences.is_empty()
    }

    /// Records an occurrence of a placeholder and returns its marker.
    pub fn bind(&mut self, placeholder: &Placeholder, style: ParamStyle) -> String {
        let name = &placeholder.name;
        self.occurrences.push(name.clone());
        if let Some(default) = &placeholder.default {
            self.defaults
                .entry(name.clone())
                .or_insert_with(|| default.clone());
        }
        match style {
            ParamStyle::Positional => {
                self.bindings.push(name.clone());
                "?".to_string()
            }
            ParamStyle::Numbered => {
                let position = match self.bindings.iter().position(|b| b == name) {
                    Some(i) => i,
                    None => {
                        self.bindings.push(name.clone());
                        self.bindings.len() - 1
                    }
                };
                format!("${}", position + 1)
            }
            ParamStyle::Named(prefix) => {
                if !self.bindings.contains(name) {
                    self.bindings.push(name.clone());
                }
                format!("{}{}", prefix, name)
            }
        }
    }
}
