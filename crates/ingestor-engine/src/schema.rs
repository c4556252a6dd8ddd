//! Declarative row schema
//!
//! A [`Schema`] names the target table and lists, in order, the columns a run may
//! write together with the record field each column is read from. It is loaded once
//! before a run (usually from a TOML file) and never changes while the run is active.
//!
//! ```toml
//! table = "sflw_recs"
//! record_tag = "Record"
//!
//! [[columns]]
//! column = "user"
//!
//! [[columns]]
//! column = "dt_created"
//! field = "dateCreated"
//! sql_type = "bigint"
//!
//! [[columns]]
//! column = "scan_time"
//! field = "fnumbers.scanTime"
//! ```

use ingestor_common::{IngestorError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Default XML element name wrapping one record.
pub const DEFAULT_RECORD_TAG: &str = "Record";

/// Default JSON key holding the record array when the document is an object.
pub const DEFAULT_RECORDS_KEY: &str = "Records";

const IDENTIFIER_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_$]{0,62}$";

const SQL_TYPE_PATTERN: &str = r"^[A-Za-z][A-Za-z0-9_ ]*(\(\s*\d+\s*(,\s*\d+\s*)?\))?(\[\])?$";

fn pattern(source: &str) -> Result<Regex> {
    Regex::new(source).map_err(|e| IngestorError::schema(format!("Invalid pattern: {}", e)))
}

/// Bound parameter syntax used by the target store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlaceholderStyle {
    /// `$1, $2, ...` (PostgreSQL)
    #[default]
    Dollar,
    /// `?, ?, ...`
    Question,
}

impl std::str::FromStr for PlaceholderStyle {
    type Err = IngestorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "dollar" | "postgres" => Ok(PlaceholderStyle::Dollar),
            "question" | "qmark" => Ok(PlaceholderStyle::Question),
            _ => Err(IngestorError::schema(format!("Invalid placeholder style: {}", s))),
        }
    }
}

/// One allowed column and where its value comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    /// Target column name
    pub column: String,
    /// Source field: a bare name matches at any depth, a dotted path matches exactly.
    /// Defaults to the column name.
    #[serde(default)]
    pub field: Option<String>,
    /// Optional SQL type the bound value is cast to
    #[serde(default)]
    pub sql_type: Option<String>,
}

impl ColumnMapping {
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            field: None,
            sql_type: None,
        }
    }

    /// Field name or path this column reads
    pub fn field(&self) -> &str {
        self.field.as_deref().unwrap_or(&self.column)
    }

    /// Whether the field is a dotted path rather than a bare name
    pub fn is_path(&self) -> bool {
        self.field().contains('.')
    }
}

#[derive(Debug, Deserialize)]
struct SchemaFile {
    table: String,
    #[serde(default)]
    record_tag: Option<String>,
    #[serde(default)]
    records_key: Option<String>,
    #[serde(default)]
    placeholder: PlaceholderStyle,
    columns: Vec<ColumnMapping>,
}

/// Target table plus the ordered allow-list of columns for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    table: String,
    record_tag: String,
    records_key: String,
    placeholder: PlaceholderStyle,
    columns: Vec<ColumnMapping>,
}

impl Schema {
    pub fn builder(table: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            table: table.into(),
            record_tag: None,
            records_key: None,
            placeholder: PlaceholderStyle::default(),
            columns: Vec::new(),
        }
    }

    /// Load and validate a schema definition file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let schema = Self::from_toml_str(&content)?;

        tracing::debug!(
            path = %path.display(),
            table = %schema.table,
            columns = schema.columns.len(),
            "Loaded schema"
        );

        Ok(schema)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: SchemaFile = toml::from_str(content)?;
        Self::validated(Schema {
            table: file.table,
            record_tag: file.record_tag.unwrap_or_else(|| DEFAULT_RECORD_TAG.to_string()),
            records_key: file.records_key.unwrap_or_else(|| DEFAULT_RECORDS_KEY.to_string()),
            placeholder: file.placeholder,
            columns: file.columns,
        })
    }

    fn validated(schema: Schema) -> Result<Self> {
        let identifier = pattern(IDENTIFIER_PATTERN)?;
        let sql_type_pattern = pattern(SQL_TYPE_PATTERN)?;

        validate_table(&identifier, &schema.table)?;

        if schema.columns.is_empty() {
            return Err(IngestorError::schema("Schema must list at least one column"));
        }

        let mut seen = HashSet::new();
        for mapping in &schema.columns {
            validate_identifier(&identifier, &mapping.column)?;
            if !seen.insert(mapping.column.as_str()) {
                return Err(IngestorError::schema(format!(
                    "Duplicate column \"{}\"",
                    mapping.column
                )));
            }
            if mapping.field().split('.').any(str::is_empty) {
                return Err(IngestorError::schema(format!(
                    "Invalid field path \"{}\" for column \"{}\"",
                    mapping.field(),
                    mapping.column
                )));
            }
            if let Some(ref sql_type) = mapping.sql_type {
                if !sql_type_pattern.is_match(sql_type) {
                    return Err(IngestorError::schema(format!(
                        "Invalid SQL type \"{}\" for column \"{}\"",
                        sql_type, mapping.column
                    )));
                }
            }
        }

        if schema.record_tag.is_empty() || schema.records_key.is_empty() {
            return Err(IngestorError::schema("record_tag and records_key must not be empty"));
        }

        Ok(schema)
    }

    /// Same schema targeting another table
    pub fn with_table(mut self, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        validate_table(&pattern(IDENTIFIER_PATTERN)?, &table)?;
        self.table = table;
        Ok(self)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Table identifier quoted for use in SQL, e.g. `"public"."sflw_recs"`
    pub fn quoted_table(&self) -> String {
        self.table
            .split('.')
            .map(quote_identifier)
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn record_tag(&self) -> &str {
        &self.record_tag
    }

    pub fn records_key(&self) -> &str {
        &self.records_key
    }

    pub fn placeholder(&self) -> PlaceholderStyle {
        self.placeholder
    }

    pub fn columns(&self) -> &[ColumnMapping] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&ColumnMapping> {
        self.columns.iter().find(|mapping| mapping.column == name)
    }

    /// Whether `column` is on the allow-list
    pub fn allows(&self, column: &str) -> bool {
        self.column(column).is_some()
    }
}

/// Fluent construction of a [`Schema`], validated on [`SchemaBuilder::build`]
pub struct SchemaBuilder {
    table: String,
    record_tag: Option<String>,
    records_key: Option<String>,
    placeholder: PlaceholderStyle,
    columns: Vec<ColumnMapping>,
}

impl SchemaBuilder {
    /// Allow a column read from the field of the same name
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.columns.push(ColumnMapping::new(column));
        self
    }

    /// Allow a column read from a differently named field or a dotted path
    pub fn column_from(mut self, column: impl Into<String>, field: impl Into<String>) -> Self {
        let mut mapping = ColumnMapping::new(column);
        mapping.field = Some(field.into());
        self.columns.push(mapping);
        self
    }

    /// Cast the most recently added column's bound value to `sql_type`
    pub fn cast(mut self, sql_type: impl Into<String>) -> Self {
        if let Some(mapping) = self.columns.last_mut() {
            mapping.sql_type = Some(sql_type.into());
        }
        self
    }

    pub fn record_tag(mut self, tag: impl Into<String>) -> Self {
        self.record_tag = Some(tag.into());
        self
    }

    pub fn records_key(mut self, key: impl Into<String>) -> Self {
        self.records_key = Some(key.into());
        self
    }

    pub fn placeholder(mut self, style: PlaceholderStyle) -> Self {
        self.placeholder = style;
        self
    }

    pub fn build(self) -> Result<Schema> {
        Schema::validated(Schema {
            table: self.table,
            record_tag: self.record_tag.unwrap_or_else(|| DEFAULT_RECORD_TAG.to_string()),
            records_key: self.records_key.unwrap_or_else(|| DEFAULT_RECORDS_KEY.to_string()),
            placeholder: self.placeholder,
            columns: self.columns,
        })
    }
}

fn validate_identifier(identifier: &Regex, name: &str) -> Result<()> {
    if identifier.is_match(name) {
        Ok(())
    } else {
        Err(IngestorError::schema(format!("Invalid SQL identifier \"{}\"", name)))
    }
}

fn validate_table(identifier: &Regex, table: &str) -> Result<()> {
    let parts: Vec<&str> = table.split('.').collect();
    if parts.len() > 2 {
        return Err(IngestorError::schema(format!(
            "Table \"{}\" may have at most one schema qualifier",
            table
        )));
    }
    parts
        .into_iter()
        .try_for_each(|part| validate_identifier(identifier, part))
}

/// Double-quote an identifier that already passed validation
pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
