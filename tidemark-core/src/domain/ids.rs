use super::entity::EntityId;
use super::level::Level;
use super::record::Payload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Deterministic record id. Primary key of every dataset table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Id used for the `n`-th colliding record of a batch (`{id}_{n}`).
    pub fn with_suffix(&self, n: usize) -> Self {
        Self(format!("{}_{n}", self.0))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a dataset derives record ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IdRule {
    /// `{entity_id}_{ts}` or `{entity_id}_{level}_{ts}`.
    Periodic {
        #[serde(default)]
        include_level: bool,
    },
    /// `{entity_id}_{ts}_{hash of key_fields}` for event-like data
    /// (dividends, filings, block trades) where several rows share a timestamp.
    Event { key_fields: Vec<String> },
}

impl Default for IdRule {
    fn default() -> Self {
        IdRule::Periodic {
            include_level: false,
        }
    }
}

impl IdRule {
    pub fn generate(
        &self,
        entity_id: &EntityId,
        timestamp: DateTime<Utc>,
        level: Level,
        payload: &Payload,
    ) -> RecordId {
        match self {
            IdRule::Periodic { include_level } => {
                periodic_id(entity_id, timestamp, level, *include_level)
            }
            IdRule::Event { key_fields } => {
                let values: Vec<String> = key_fields
                    .iter()
                    .map(|k| payload.get(k).map(|v| v.key_string()).unwrap_or_default())
                    .collect();
                event_id(entity_id, timestamp, level, &values)
            }
        }
    }
}

/// Timestamp rendering used inside ids. Coarse levels drop the time of day.
pub fn format_timestamp(ts: DateTime<Utc>, level: Level) -> String {
    match level {
        Level::Tick => ts.format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
        l if l.is_intraday() => ts.format("%Y-%m-%dT%H:%M:%S").to_string(),
        _ => ts.format("%Y-%m-%d").to_string(),
    }
}

pub fn periodic_id(
    entity_id: &EntityId,
    ts: DateTime<Utc>,
    level: Level,
    include_level: bool,
) -> RecordId {
    let ts = format_timestamp(ts, level);
    if include_level {
        RecordId(format!("{entity_id}_{level}_{ts}"))
    } else {
        RecordId(format!("{entity_id}_{ts}"))
    }
}

pub fn event_id(entity_id: &EntityId, ts: DateTime<Utc>, level: Level, key_values: &[String]) -> RecordId {
    let mut hasher = blake3::Hasher::new();
    for v in key_values {
        hasher.update(v.as_bytes());
        // unit separator keeps ["ab","c"] and ["a","bc"] apart
        hasher.update(&[0x1f]);
    }
    let hex = hasher.finalize().to_hex();
    RecordId(format!(
        "{entity_id}_{}_{}",
        format_timestamp(ts, level),
        &hex.as_str()[..16]
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::record::FieldValue;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 9, 30, 0).unwrap()
    }

    #[test]
    fn daily_id_uses_date_only() {
        let id = periodic_id(&EntityId::from("stock_sh_600000"), ts(), Level::Day1, false);
        assert_eq!(id.as_str(), "stock_sh_600000_2024-03-05");
    }

    #[test]
    fn intraday_id_keeps_time_and_optional_level() {
        let id = periodic_id(&EntityId::from("stock_sh_600000"), ts(), Level::Minute5, true);
        assert_eq!(id.as_str(), "stock_sh_600000_5m_2024-03-05T09:30:00");
    }

    #[test]
    fn event_id_depends_on_key_fields() {
        let rule = IdRule::Event {
            key_fields: vec!["holder".into()],
        };
        let entity = EntityId::from("stock_sz_000001");
        let mut a = Payload::new();
        a.insert("holder".into(), FieldValue::Text("fund a".into()));
        let mut b = Payload::new();
        b.insert("holder".into(), FieldValue::Text("fund b".into()));

        let id_a = rule.generate(&entity, ts(), Level::Day1, &a);
        let id_a2 = rule.generate(&entity, ts(), Level::Day1, &a);
        let id_b = rule.generate(&entity, ts(), Level::Day1, &b);
        assert_eq!(id_a, id_a2);
        assert_ne!(id_a, id_b);
        assert!(id_a.as_str().starts_with("stock_sz_000001_2024-03-05_"));
    }

    #[test]
    fn suffix_appends_counter() {
        assert_eq!(RecordId::new("x").with_suffix(1).as_str(), "x_1");
    }
}
