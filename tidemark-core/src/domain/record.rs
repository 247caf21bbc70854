use super::entity::EntityRef;
use super::ids::RecordId;
use super::level::Level;
use crate::schema::{Column, ColumnType};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single payload cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Timestamp(DateTime<Utc>),
    Text(String),
}

/// Column name → value. `BTreeMap` keeps column order stable for hashing.
pub type Payload = BTreeMap<String, FieldValue>;

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(f) => Some(*f),
            FieldValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Stable textual form used when a value takes part in an id.
    pub fn key_string(&self) -> String {
        match self {
            FieldValue::Null => String::new(),
            FieldValue::Bool(b) => b.to_string(),
            FieldValue::Integer(i) => i.to_string(),
            FieldValue::Float(f) => f.to_string(),
            FieldValue::Timestamp(t) => t.timestamp_millis().to_string(),
            FieldValue::Text(s) => s.clone(),
        }
    }

    /// Convert a raw value into the declared column type.
    ///
    /// Text is parsed, numeric types widen/narrow where lossless enough for
    /// market data (integers to floats, whole floats to integers). Empty text
    /// becomes `Null`.
    pub fn coerce(&self, ty: ColumnType) -> Result<FieldValue, String> {
        use FieldValue as V;
        let out = match (self, ty) {
            (V::Null, _) => V::Null,
            (V::Text(s), _) if s.trim().is_empty() => V::Null,

            (V::Float(f), ColumnType::Float) => V::Float(*f),
            (V::Integer(i), ColumnType::Float) => V::Float(*i as f64),
            (V::Text(s), ColumnType::Float) => V::Float(
                s.trim()
                    .parse::<f64>()
                    .map_err(|e| format!("'{s}' is not a float: {e}"))?,
            ),

            (V::Integer(i), ColumnType::Integer) => V::Integer(*i),
            (V::Float(f), ColumnType::Integer) if f.fract() == 0.0 => V::Integer(*f as i64),
            (V::Text(s), ColumnType::Integer) => {
                let t = s.trim();
                match t.parse::<i64>() {
                    Ok(i) => V::Integer(i),
                    Err(_) => match t.parse::<f64>() {
                        Ok(f) if f.fract() == 0.0 => V::Integer(f as i64),
                        _ => return Err(format!("'{s}' is not an integer")),
                    },
                }
            }

            (V::Bool(b), ColumnType::Bool) => V::Bool(*b),
            (V::Integer(i), ColumnType::Bool) => V::Bool(*i != 0),
            (V::Text(s), ColumnType::Bool) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => V::Bool(true),
                "false" | "0" | "no" => V::Bool(false),
                _ => return Err(format!("'{s}' is not a bool")),
            },

            (V::Timestamp(t), ColumnType::Timestamp) => V::Timestamp(*t),
            (V::Integer(ms), ColumnType::Timestamp) => V::Timestamp(
                DateTime::<Utc>::from_timestamp_millis(*ms)
                    .ok_or_else(|| format!("{ms} is out of timestamp range"))?,
            ),
            (V::Text(s), ColumnType::Timestamp) => {
                V::Timestamp(parse_timestamp(s).ok_or_else(|| format!("'{s}' is not a timestamp"))?)
            }

            (V::Text(s), ColumnType::Text) => V::Text(s.clone()),
            (other, ColumnType::Text) => V::Text(other.key_string()),

            (other, ty) => return Err(format!("cannot store {other:?} in a {ty:?} column")),
        };
        Ok(out)
    }
}

/// Parse RFC 3339, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DDTHH:MM:SS` or `YYYY-MM-DD` as UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(ndt.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ndt| ndt.and_utc())
}

/// A persisted row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub entity: EntityRef,
    pub timestamp: DateTime<Utc>,
    pub provider: String,
    pub level: Level,
    pub payload: Payload,
}

impl Record {
    pub fn field(&self, column: &str) -> Option<&FieldValue> {
        self.payload.get(column)
    }

    /// Decode the payload into a typed view.
    pub fn payload_as<P: PayloadFields>(&self) -> Option<P> {
        P::from_payload(&self.payload)
    }
}

/// Typed payload that can be laid out as schema columns.
pub trait PayloadFields: Sized {
    fn columns() -> Vec<Column>;
    fn to_payload(&self) -> Payload;
    fn from_payload(payload: &Payload) -> Option<Self>;
}

/// OHLCV bar payload shared by every k-line dataset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Kdata {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub turnover: Option<f64>,
}

impl PayloadFields for Kdata {
    fn columns() -> Vec<Column> {
        vec![
            Column::new("open", ColumnType::Float),
            Column::new("high", ColumnType::Float),
            Column::new("low", ColumnType::Float),
            Column::new("close", ColumnType::Float),
            Column::new("volume", ColumnType::Float),
            Column::new("turnover", ColumnType::Float),
        ]
    }

    fn to_payload(&self) -> Payload {
        let mut p = Payload::new();
        p.insert("open".into(), FieldValue::Float(self.open));
        p.insert("high".into(), FieldValue::Float(self.high));
        p.insert("low".into(), FieldValue::Float(self.low));
        p.insert("close".into(), FieldValue::Float(self.close));
        p.insert("volume".into(), FieldValue::Float(self.volume));
        p.insert(
            "turnover".into(),
            self.turnover.map_or(FieldValue::Null, FieldValue::Float),
        );
        p
    }

    fn from_payload(payload: &Payload) -> Option<Self> {
        let get = |k: &str| payload.get(k).and_then(FieldValue::as_f64);
        Some(Self {
            open: get("open")?,
            high: get("high")?,
            low: get("low")?,
            close: get("close")?,
            volume: get("volume")?,
            turnover: get("turnover"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn text_coerces_to_declared_types() {
        let v = FieldValue::Text("12.5".into());
        assert_eq!(v.coerce(ColumnType::Float).unwrap(), FieldValue::Float(12.5));
        assert_eq!(
            FieldValue::Text("42".into()).coerce(ColumnType::Integer).unwrap(),
            FieldValue::Integer(42)
        );
        assert_eq!(
            FieldValue::Text("yes".into()).coerce(ColumnType::Bool).unwrap(),
            FieldValue::Bool(true)
        );
        assert_eq!(
            FieldValue::Text("".into()).coerce(ColumnType::Float).unwrap(),
            FieldValue::Null
        );
    }

    #[test]
    fn bad_text_is_a_coercion_error() {
        assert!(FieldValue::Text("abc".into()).coerce(ColumnType::Float).is_err());
        assert!(FieldValue::Float(1.5).coerce(ColumnType::Integer).is_err());
    }

    #[test]
    fn timestamps_parse_common_layouts() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2024-01-02"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-02 00:00:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-02T00:00:00Z"), Some(expected));
        assert_eq!(parse_timestamp("02/01/2024"), None);
    }

    #[test]
    fn kdata_payload_roundtrip() {
        let bar = Kdata {
            open: 10.0,
            high: 11.0,
            low: 9.5,
            close: 10.5,
            volume: 1_000.0,
            turnover: None,
        };
        let payload = bar.to_payload();
        assert_eq!(payload["turnover"], FieldValue::Null);
        assert_eq!(Kdata::from_payload(&payload), Some(bar));
    }
}
