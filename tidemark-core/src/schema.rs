//! Dataset schema contract: column layout and id rule of one storage table.
//!
//! Every table carries the base columns (`id`, `entity_id`, `code`,
//! `timestamp`, `provider`, `level`) followed by the declared payload columns
//! in declaration order. A schema is immutable once registered; its BLAKE3
//! fingerprint is stored next to the table so a changed layout is caught on the
//! next registration, even across restarts.

use crate::domain::{EntityType, IdRule, Kdata, Level, PayloadFields};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Columns every dataset table has, in table order.
pub const BASE_COLUMNS: &[&str] = &["id", "entity_id", "code", "timestamp", "provider", "level"];

/// Payload column holding a fundamentals report period; indexed when present.
pub const REPORT_PERIOD_COLUMN: &str = "report_period";

/// Storage type of a payload column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Float,
    Integer,
    Text,
    Bool,
    /// Milliseconds since the Unix epoch (UTC).
    Timestamp,
}

impl ColumnType {
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Float => "REAL",
            ColumnType::Integer | ColumnType::Bool | ColumnType::Timestamp => "INTEGER",
            ColumnType::Text => "TEXT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Layout of one dataset table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub table: String,
    pub entity_type: EntityType,
    pub level: Level,
    #[serde(default)]
    pub id_rule: IdRule,
    #[serde(default)]
    pub columns: Vec<Column>,
}

impl Schema {
    pub fn new(table: impl Into<String>, entity_type: impl Into<EntityType>, level: Level) -> Self {
        Self {
            table: table.into(),
            entity_type: entity_type.into(),
            level,
            id_rule: IdRule::default(),
            columns: Vec::new(),
        }
    }

    pub fn with_column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.push(Column::new(name, column_type));
        self
    }

    pub fn with_columns(mut self, columns: impl IntoIterator<Item = Column>) -> Self {
        self.columns.extend(columns);
        self
    }

    pub fn with_id_rule(mut self, rule: IdRule) -> Self {
        self.id_rule = rule;
        self
    }

    /// Standard OHLCV table, named `{entity_type}_{level}_kdata`.
    pub fn kdata(entity_type: impl Into<EntityType>, level: Level) -> Self {
        let entity_type = entity_type.into();
        let table = format!("{entity_type}_{level}_kdata");
        Self::new(table, entity_type, level).with_columns(Kdata::columns())
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Base columns followed by payload columns, as laid out in the table.
    pub fn all_column_names(&self) -> Vec<&str> {
        BASE_COLUMNS
            .iter()
            .copied()
            .chain(self.columns.iter().map(|c| c.name.as_str()))
            .collect()
    }

    /// Structural identity of the layout.
    ///
    /// Canonical JSON of the full schema (field order is fixed by the struct),
    /// hashed with BLAKE3.
    pub fn fingerprint(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        blake3::hash(&json).to_hex().to_string()
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        if !is_identifier(&self.table) {
            return Err(SchemaError::InvalidIdentifier(self.table.clone()));
        }
        let mut seen = std::collections::HashSet::new();
        for col in &self.columns {
            if !is_identifier(&col.name) {
                return Err(SchemaError::InvalidIdentifier(col.name.clone()));
            }
            if BASE_COLUMNS.contains(&col.name.as_str()) {
                return Err(SchemaError::ReservedColumn(col.name.clone()));
            }
            if !seen.insert(col.name.as_str()) {
                return Err(SchemaError::DuplicateColumn(col.name.clone()));
            }
        }
        if let IdRule::Event { key_fields } = &self.id_rule {
            if key_fields.is_empty() {
                return Err(SchemaError::EmptyKeyFields(self.table.clone()));
            }
            for key in key_fields {
                if !self.has_column(key) {
                    return Err(SchemaError::UnknownKeyField(key.clone()));
                }
            }
        }
        Ok(())
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`. Table and column names are interpolated into SQL.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("invalid identifier '{0}' (use letters, digits and underscores)")]
    InvalidIdentifier(String),

    #[error("column '{0}' is reserved for the base layout")]
    ReservedColumn(String),

    #[error("duplicate column '{0}'")]
    DuplicateColumn(String),

    #[error("event id key field '{0}' is not a declared column")]
    UnknownKeyField(String),

    #[error("event id rule of table '{0}' has no key fields")]
    EmptyKeyFields(String),
}
