//! Domain types: entities, levels, record ids and records.

pub mod entity;
pub mod ids;
pub mod level;
pub mod record;

pub use entity::{Entity, EntityId, EntityRef, EntityType};
pub use ids::{IdRule, RecordId};
pub use level::{Level, ParseLevelError};
pub use record::{parse_timestamp, FieldValue, Kdata, Payload, PayloadFields, Record};
