//! Entity universe: exchange-organized code lists.
//!
//! A universe is a TOML file listing codes per exchange for one entity type,
//! plus optional listing dates. It is how entities get into a catalog when no
//! metadata recorder has run.
//!
//! ```toml
//! entity_type = "stock"
//!
//! [exchanges]
//! sh = ["600000", "600036"]
//! sz = ["000001"]
//!
//! [listed]
//! stock_sh_600036 = "2002-04-09"
//! ```

use crate::domain::{parse_timestamp, Entity, EntityType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityUniverse {
    pub entity_type: EntityType,
    pub exchanges: BTreeMap<String, Vec<String>>,
    /// Entity id → listing date (`YYYY-MM-DD` or RFC 3339).
    #[serde(default)]
    pub listed: BTreeMap<String, String>,
}

impl EntityUniverse {
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content =
            std::fs::read_to_string(path).map_err(|e| format!("read universe file: {e}"))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| format!("parse universe TOML: {e}"))
    }

    /// All entities, in exchange then code order.
    pub fn entities(&self) -> Result<Vec<Entity>, String> {
        let mut out = Vec::with_capacity(self.entity_count());
        for (exchange, codes) in &self.exchanges {
            for code in codes {
                let mut entity = Entity::new(self.entity_type.clone(), exchange, code);
                if let Some(raw) = self.listed.get(entity.id.as_str()) {
                    let ts = parse_timestamp(raw)
                        .ok_or_else(|| format!("bad listing date '{raw}' for {}", entity.id))?;
                    entity = entity.listed_at(ts);
                }
                out.push(entity);
            }
        }
        Ok(out)
    }

    pub fn exchange_names(&self) -> Vec<&str> {
        self.exchanges.keys().map(|s| s.as_str()).collect()
    }

    pub fn entity_count(&self) -> usize {
        self.exchanges.values().map(|v| v.len()).sum()
    }

    pub fn to_toml(&self) -> Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| format!("serialize universe: {e}"))
    }
}
