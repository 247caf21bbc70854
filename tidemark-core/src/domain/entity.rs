use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of tracked item: `stock`, `index`, `etf`, `future`, `crypto`, ...
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityType(pub String);

impl EntityType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Stable composite id: `{entity_type}_{exchange}_{code}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn compose(entity_type: &EntityType, exchange: &str, code: &str) -> Self {
        Self(format!("{}_{exchange}_{code}", entity_type.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A tradable or reference item. Read-only to recorders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub entity_type: EntityType,
    pub exchange: String,
    pub code: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Listing time; the first fetch window of a fresh entity starts here.
    #[serde(default)]
    pub list_timestamp: Option<DateTime<Utc>>,
}

impl Entity {
    pub fn new(entity_type: impl Into<EntityType>, exchange: &str, code: &str) -> Self {
        let entity_type = entity_type.into();
        Self {
            id: EntityId::compose(&entity_type, exchange, code),
            entity_type,
            exchange: exchange.to_string(),
            code: code.to_string(),
            name: None,
            list_timestamp: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn listed_at(mut self, ts: DateTime<Utc>) -> Self {
        self.list_timestamp = Some(ts);
        self
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef {
            entity_id: self.id.clone(),
            code: self.code.clone(),
        }
    }
}

/// The part of an entity every record carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_id: EntityId,
    pub code: String,
}
