//! Embedded schema model.
//!
//! A document may describe the tables it works on under a `schema` key. The
//! schema is passive data: nothing in it changes how SQL is generated, but
//! the validator checks queries against it.

use std::fmt;

use serde::{Deserialize, Deserializer};
use serde_yaml::Value;

use crate::error::ParseError;
use crate::map::OrderMap;

/// Tables described by a document.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub tables: OrderMap<String, TableDef>,
}

/// A table and its columns.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TableDef {
    #[serde(default)]
    pub columns: OrderMap<String, ColumnDef>,
    #[serde(default)]
    pub description: Option<String>,
}

/// A column description.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ColumnDef {
    #[serde(rename = "type", default)]
    pub kind: Option<ColumnType>,
    /// Human-readable name.
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Maximum length of string values.
    #[serde(default)]
    pub max_length: Option<u64>,
    #[serde(default)]
    pub precision: Option<u32>,
    #[serde(default)]
    pub scale: Option<u32>,
    /// Allowed values of an enum column.
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub constraints: Constraints,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Constraints {
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub not_null: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub foreign_key: Option<ForeignKey>,
}

/// The column a foreign key points to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ForeignKey {
    pub table: String,
    pub column: String,
}

/// Column type tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    String,
    Text,
    Decimal,
    Float,
    Date,
    Datetime,
    Timestamp,
    Boolean,
    Enum,
    Json,
    /// A tag the compiler does not know, kept as written.
    Other(String),
}

impl From<&str> for ColumnType {
    fn from(tag: &str) -> ColumnType {
        match tag.trim().to_ascii_lowercase().as_str() {
            "integer" | "int" | "bigint" => ColumnType::Integer,
            "string" | "varchar" => ColumnType::String,
            "text" => ColumnType::Text,
            "decimal" | "numeric" => ColumnType::Decimal,
            "float" | "double" | "real" => ColumnType::Float,
            "date" => ColumnType::Date,
            "datetime" => ColumnType::Datetime,
            "timestamp" => ColumnType::Timestamp,
            "boolean" | "bool" => ColumnType::Boolean,
            "enum" => ColumnType::Enum,
            "json" | "jsonb" => ColumnType::Json,
            _ => ColumnType::Other(tag.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for ColumnType {
    fn deserialize<D>(deserializer: D) -> Result<ColumnType, D::Error>
    where
        D: Deserializer<'de>,
    {
        let tag = String::deserialize(deserializer)?;
        Ok(ColumnType::from(tag.as_str()))
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let tag = match self {
            ColumnType::Integer => "integer",
            ColumnType::String => "string",
            ColumnType::Text => "text",
            ColumnType::Decimal => "decimal",
            ColumnType::Float => "float",
            ColumnType::Date => "date",
            ColumnType::Datetime => "datetime",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Boolean => "boolean",
            ColumnType::Enum => "enum",
            ColumnType::Json => "json",
            ColumnType::Other(tag) => tag,
        };
        f.write_str(tag)
    }
}

impl Schema {
    /// Reads a schema from the value of a document's `schema` key.
    pub fn from_value(value: &Value) -> Result<Schema, ParseError> {
        serde_yaml::from_value(value.clone()).map_err(|e| ParseError::Invalid {
            path: "schema".to_string(),
            reason: e.to_string(),
        })
    }

    /// Looks up a table by name.
    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.get(name)
    }
}

impl TableDef {
    /// Looks up a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.get(name)
    }
}

impl ColumnDef {
    /// Returns true if the column only takes values from a fixed list.
    pub fn is_enum(&self) -> bool {
        self.kind == Some(ColumnType::Enum) && !self.values.is_empty()
    }
}
