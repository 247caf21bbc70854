//! Entity catalog accessor.
//!
//! Entities live in the `entities` table of the `(provider, "meta")`
//! namespace. Recorders only read it; `upsert` is the seam metadata recorders
//! (and the CLI `seed` command) write through.

use crate::config::RecorderConfig;
use crate::domain::{Entity, EntityId, EntityType};
use crate::storage::{Store, StoreError};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::fmt;
use std::sync::Arc;

pub const META_DATASET: &str = "meta";
pub const ENTITY_TABLE: &str = "entities";

type Predicate = Arc<dyn Fn(&Entity) -> bool + Send + Sync>;

/// Which entities a recorder tracks. Empty lists mean "no restriction".
#[derive(Clone, Default)]
pub struct EntityFilter {
    pub entity_type: Option<EntityType>,
    pub exchanges: Vec<String>,
    pub codes: Vec<String>,
    pub ids: Vec<EntityId>,
    pub predicate: Option<Predicate>,
}

impl fmt::Debug for EntityFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityFilter")
            .field("entity_type", &self.entity_type)
            .field("exchanges", &self.exchanges)
            .field("codes", &self.codes)
            .field("ids", &self.ids)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

impl EntityFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn from_config(config: &RecorderConfig) -> Self {
        Self {
            entity_type: config.entity_type.clone(),
            exchanges: config.exchanges.clone(),
            codes: config.codes.clone(),
            ids: config.ids.iter().map(|id| EntityId::new(id.as_str())).collect(),
            predicate: None,
        }
    }

    pub fn entity_type(mut self, entity_type: impl Into<EntityType>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    pub fn exchanges<I, S>(mut self, exchanges: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exchanges = exchanges.into_iter().map(Into::into).collect();
        self
    }

    pub fn codes<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.codes = codes.into_iter().map(Into::into).collect();
        self
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<EntityId>,
    {
        self.ids = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Extra condition, e.g. "listing date not yet enriched".
    pub fn predicate(mut self, f: impl Fn(&Entity) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(f));
        self
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        if self
            .entity_type
            .as_ref()
            .is_some_and(|t| *t != entity.entity_type)
        {
            return false;
        }
        if !self.exchanges.is_empty() && !self.exchanges.contains(&entity.exchange) {
            return false;
        }
        if !self.codes.is_empty() && !self.codes.contains(&entity.code) {
            return false;
        }
        if !self.ids.is_empty() && !self.ids.contains(&entity.id) {
            return false;
        }
        self.predicate.as_ref().map_or(true, |p| p(entity))
    }
}

/// Read access to one provider's entity catalog.
#[derive(Debug, Clone)]
pub struct EntityCatalog {
    store: Arc<Store>,
}

impl EntityCatalog {
    /// Open the catalog over a `meta` namespace, creating the table if absent.
    pub fn open(store: Arc<Store>) -> Result<Self, StoreError> {
        store.with_conn(|conn| {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {ENTITY_TABLE} (
                    id TEXT PRIMARY KEY,
                    entity_type TEXT NOT NULL,
                    exchange TEXT NOT NULL,
                    code TEXT NOT NULL,
                    name TEXT,
                    list_timestamp INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_{ENTITY_TABLE}_code ON {ENTITY_TABLE} (code);
                CREATE INDEX IF NOT EXISTS idx_{ENTITY_TABLE}_exchange ON {ENTITY_TABLE} (exchange);"
            ))
        })?;
        Ok(Self { store })
    }

    /// Insert or replace entities. Returns how many rows were written.
    pub fn upsert(&self, entities: &[Entity]) -> Result<usize, StoreError> {
        self.store.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut written = 0;
            {
                let mut stmt = tx.prepare_cached(&format!(
                    "INSERT OR REPLACE INTO {ENTITY_TABLE}
                     (id, entity_type, exchange, code, name, list_timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
                ))?;
                for e in entities {
                    written += stmt.execute(params![
                        e.id.as_str(),
                        e.entity_type.as_str(),
                        e.exchange,
                        e.code,
                        e.name,
                        e.list_timestamp.map(|t| t.timestamp_millis()),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(written)
        })
    }

    /// Entities matching `filter`, ordered by id.
    ///
    /// Type, exchange, code and id restrictions are pushed into SQL; the
    /// predicate runs on the loaded rows.
    pub fn query(&self, filter: &EntityFilter) -> Result<Vec<Entity>, StoreError> {
        let mut sql = format!(
            "SELECT id, entity_type, exchange, code, name, list_timestamp FROM {ENTITY_TABLE} WHERE 1 = 1"
        );
        let mut args: Vec<String> = Vec::new();

        if let Some(t) = &filter.entity_type {
            args.push(t.as_str().to_string());
            sql.push_str(&format!(" AND entity_type = ?{}", args.len()));
        }
        push_in(&mut sql, &mut args, "exchange", filter.exchanges.iter().cloned());
        push_in(&mut sql, &mut args, "code", filter.codes.iter().cloned());
        push_in(&mut sql, &mut args, "id", filter.ids.iter().map(|id| id.0.clone()));
        sql.push_str(" ORDER BY id ASC");

        let entities: Vec<Entity> = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), entity_from_row)?;
            rows.collect()
        })?;

        Ok(match &filter.predicate {
            Some(p) => entities.into_iter().filter(|e| p(e)).collect(),
            None => entities,
        })
    }

    pub fn get(&self, id: &EntityId) -> Result<Option<Entity>, StoreError> {
        self.store.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT id, entity_type, exchange, code, name, list_timestamp FROM {ENTITY_TABLE} WHERE id = ?1"
                ),
                params![id.as_str()],
                entity_from_row,
            )
            .optional()
        })
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        self.store.count(ENTITY_TABLE)
    }
}

fn push_in(
    sql: &mut String,
    args: &mut Vec<String>,
    column: &str,
    values: impl Iterator<Item = String>,
) {
    let start = args.len();
    args.extend(values);
    if args.len() == start {
        return;
    }
    let placeholders: Vec<String> = (start + 1..=args.len()).map(|i| format!("?{i}")).collect();
    sql.push_str(&format!(" AND {column} IN ({})", placeholders.join(", ")));
}

fn entity_from_row(row: &Row<'_>) -> rusqlite::Result<Entity> {
    let listed: Option<i64> = row.get(5)?;
    Ok(Entity {
        id: EntityId(row.get(0)?),
        entity_type: EntityType(row.get(1)?),
        exchange: row.get(2)?,
        code: row.get(3)?,
        name: row.get(4)?,
        list_timestamp: listed.and_then(DateTime::<Utc>::from_timestamp_millis),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{NamespaceKey, StorageRoot};
    use chrono::TimeZone;

    fn catalog() -> EntityCatalog {
        let store = Store::open(&StorageRoot::Memory, NamespaceKey::new("csv", META_DATASET)).unwrap();
        let catalog = EntityCatalog::open(Arc::new(store)).unwrap();
        catalog
            .upsert(&[
                Entity::new("stock", "sz", "000001"),
                Entity::new("stock", "sh", "600000").with_name("PF Bank"),
                Entity::new("stock", "sh", "600036")
                    .listed_at(Utc.with_ymd_and_hms(2002, 4, 9, 0, 0, 0).unwrap()),
                Entity::new("index", "sh", "000001"),
            ])
            .unwrap();
        catalog
    }

    fn ids(entities: &[Entity]) -> Vec<&str> {
        entities.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn query_orders_by_id() {
        let all = catalog().query(&EntityFilter::all()).unwrap();
        assert_eq!(
            ids(&all),
            vec!["index_sh_000001", "stock_sh_600000", "stock_sh_600036", "stock_sz_000001"]
        );
    }

    #[test]
    fn filters_combine() {
        let c = catalog();
        let sh_stocks = c
            .query(&EntityFilter::all().entity_type("stock").exchanges(["sh"]))
            .unwrap();
        assert_eq!(ids(&sh_stocks), vec!["stock_sh_600000", "stock_sh_600036"]);

        let by_code = c.query(&EntityFilter::all().codes(["000001"])).unwrap();
        assert_eq!(ids(&by_code), vec!["index_sh_000001", "stock_sz_000001"]);

        let by_id = c.query(&EntityFilter::all().ids(["stock_sh_600036"])).unwrap();
        assert_eq!(ids(&by_id), vec!["stock_sh_600036"]);
    }

    #[test]
    fn predicate_selects_missing_enrichment() {
        let unlisted = catalog()
            .query(
                &EntityFilter::all()
                    .entity_type("stock")
                    .predicate(|e| e.list_timestamp.is_none()),
            )
            .unwrap();
        assert_eq!(ids(&unlisted), vec!["stock_sh_600000", "stock_sz_000001"]);
    }

    #[test]
    fn upsert_replaces_and_get_roundtrips() {
        let c = catalog();
        c.upsert(&[Entity::new("stock", "sh", "600000").with_name("renamed")]).unwrap();
        let e = c.get(&EntityId::from("stock_sh_600000")).unwrap().unwrap();
        assert_eq!(e.name.as_deref(), Some("renamed"));
        assert_eq!(c.count().unwrap(), 4);
        assert!(c.get(&EntityId::from("stock_sh_999999")).unwrap().is_none());
    }

    #[test]
    fn matches_mirrors_query() {
        let f = EntityFilter::all().entity_type("stock").exchanges(["sz"]);
        assert!(f.matches(&Entity::new("stock", "sz", "000001")));
        assert!(!f.matches(&Entity::new("stock", "sh", "600000")));
        assert!(!f.matches(&Entity::new("index", "sz", "399001")));
    }
}
