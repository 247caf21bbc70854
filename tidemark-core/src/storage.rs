//! SQLite storage namespaces, one database per (provider, dataset).
//!
//! Layout: `{root}/{provider}/{provider}_{dataset}.db`, one table per schema,
//! rows keyed by deterministic id. In-memory roots keep one private database
//! per namespace alive for as long as the owning `Store` lives.
//!
//! Features:
//! - Idempotent table and index creation
//! - Schema fingerprints in `_tidemark_schema` (incompatible layouts rejected)
//! - Cursor queries (`MAX(timestamp)` per entity), never cached
//! - One transaction per committed batch; existing ids skipped or overwritten

use crate::domain::{EntityId, EntityRef, FieldValue, Level, Record, RecordId};
use crate::schema::{ColumnType, Schema, REPORT_PERIOD_COLUMN};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, ToSql};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

const SCHEMA_TABLE: &str = "_tidemark_schema";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error in {namespace}: {source}")]
    Sqlite {
        namespace: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("table '{table}' in {namespace} was declared with a different layout (stored {stored}, declared {declared})")]
    IncompatibleSchema {
        namespace: String,
        table: String,
        stored: String,
        declared: String,
    },

    #[error("corrupt row in {table}: {reason}")]
    CorruptRow { table: String, reason: String },

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parquet export error: {0}")]
    Parquet(String),
}

/// Identity of a storage namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespaceKey {
    pub provider: String,
    pub dataset: String,
}

impl NamespaceKey {
    pub fn new(provider: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            dataset: dataset.into(),
        }
    }
}

impl fmt::Display for NamespaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.dataset)
    }
}

/// Where namespaces live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageRoot {
    Directory(PathBuf),
    Memory,
}

impl StorageRoot {
    /// Database file for a namespace: `{root}/{provider}/{provider}_{dataset}.db`.
    pub fn namespace_path(&self, key: &NamespaceKey) -> Option<PathBuf> {
        match self {
            StorageRoot::Directory(root) => Some(
                root.join(&key.provider)
                    .join(format!("{}_{}.db", key.provider, key.dataset)),
            ),
            StorageRoot::Memory => None,
        }
    }
}

/// Outcome of committing one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
}

impl CommitOutcome {
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Row filter for reading records back.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub entity_id: Option<EntityId>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl RecordQuery {
    pub fn for_entity(entity_id: impl Into<EntityId>) -> Self {
        Self {
            entity_id: Some(entity_id.into()),
            ..Default::default()
        }
    }
}

/// Row count, entity count and latest timestamp of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableStats {
    pub table: String,
    pub rows: u64,
    pub entities: u64,
    pub latest: Option<DateTime<Utc>>,
}

/// One open namespace.
///
/// The connection sits behind a mutex; the recorder never holds two entities'
/// transactions at once, so contention is limited to concurrent readers.
pub struct Store {
    key: NamespaceKey,
    conn: Mutex<Connection>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").field("key", &self.key).finish()
    }
}

impl Store {
    pub fn open(root: &StorageRoot, key: NamespaceKey) -> Result<Self, StoreError> {
        let conn = match root.namespace_path(&key) {
            Some(path) => {
                if let Some(dir) = path.parent() {
                    fs::create_dir_all(dir)?;
                }
                Connection::open(&path)
            }
            None => Connection::open_in_memory(),
        }
        .map_err(|e| sqlite_err(&key, e))?;

        let store = Self {
            key,
            conn: Mutex::new(conn),
        };
        store.with_conn(|conn| {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {SCHEMA_TABLE} (
                    table_name TEXT PRIMARY KEY,
                    fingerprint TEXT NOT NULL,
                    definition TEXT NOT NULL
                )"
            ))
        })?;
        Ok(store)
    }

    pub fn key(&self) -> &NamespaceKey {
        &self.key
    }

    /// Run `f` against the connection, tagging errors with this namespace.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock();
        f(&mut conn).map_err(|e| sqlite_err(&self.key, e))
    }

    /// Create the table and its indices if absent. Idempotent.
    ///
    /// Fails with `IncompatibleSchema` when the table was created earlier from a
    /// schema with a different fingerprint.
    pub fn ensure_table(&self, schema: &Schema) -> Result<(), StoreError> {
        self.check_compatible(schema)?;

        let declared = schema.fingerprint();
        let definition = serde_json::to_string(schema).unwrap_or_default();
        let ddl = table_ddl(schema);
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute_batch(&ddl)?;
            tx.execute(
                &format!(
                    "INSERT OR IGNORE INTO {SCHEMA_TABLE} (table_name, fingerprint, definition)
                     VALUES (?1, ?2, ?3)"
                ),
                params![schema.table, declared, definition],
            )?;
            tx.commit()
        })?;

        tracing::debug!(namespace = %self.key, table = %schema.table, "table ready");
        Ok(())
    }

    /// Fails with `IncompatibleSchema` when `schema.table` was declared here
    /// with a different layout. Writes nothing.
    pub fn check_compatible(&self, schema: &Schema) -> Result<(), StoreError> {
        let declared = schema.fingerprint();
        let stored: Option<String> = self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT fingerprint FROM {SCHEMA_TABLE} WHERE table_name = ?1"),
                params![schema.table],
                |row| row.get(0),
            )
            .optional()
        })?;

        match stored {
            Some(stored) if stored != declared => Err(StoreError::IncompatibleSchema {
                namespace: self.key.to_string(),
                table: schema.table.clone(),
                stored,
                declared,
            }),
            _ => Ok(()),
        }
    }

    /// Tables declared in this namespace, by name.
    pub fn tables(&self) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT table_name FROM {SCHEMA_TABLE} ORDER BY table_name"))?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect()
        })
    }

    /// Stored schema definition of a declared table.
    pub fn declared_schema(&self, table: &str) -> Result<Option<Schema>, StoreError> {
        let definition: Option<String> = self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT definition FROM {SCHEMA_TABLE} WHERE table_name = ?1"),
                params![table],
                |row| row.get(0),
            )
            .optional()
        })?;
        definition
            .map(|d| {
                serde_json::from_str(&d).map_err(|e| StoreError::CorruptRow {
                    table: SCHEMA_TABLE.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    /// Names of the indices on a table.
    pub fn indices(&self, table: &str) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = ?1 ORDER BY name",
            )?;
            let rows = stmt.query_map(params![table], |row| row.get(0))?;
            rows.collect()
        })
    }

    /// Latest persisted timestamp of an entity: the recorder's cursor.
    pub fn latest_timestamp(
        &self,
        table: &str,
        entity_id: &EntityId,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let ms: Option<i64> = self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT MAX(timestamp) FROM \"{table}\" WHERE entity_id = ?1"),
                params![entity_id.as_str()],
                |row| row.get(0),
            )
        })?;
        Ok(ms.and_then(DateTime::<Utc>::from_timestamp_millis))
    }

    /// The subset of `candidates` already stored for an entity.
    pub fn persisted_timestamps(
        &self,
        table: &str,
        entity_id: &EntityId,
        candidates: &[DateTime<Utc>],
    ) -> Result<BTreeSet<DateTime<Utc>>, StoreError> {
        if candidates.is_empty() {
            return Ok(BTreeSet::new());
        }
        let lo = candidates.iter().min().map(|t| t.timestamp_millis());
        let hi = candidates.iter().max().map(|t| t.timestamp_millis());
        let wanted: BTreeSet<i64> = candidates.iter().map(|t| t.timestamp_millis()).collect();

        let stored: Vec<i64> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT DISTINCT timestamp FROM \"{table}\"
                 WHERE entity_id = ?1 AND timestamp >= ?2 AND timestamp <= ?3"
            ))?;
            let rows = stmt.query_map(params![entity_id.as_str(), lo, hi], |row| row.get(0))?;
            rows.collect()
        })?;

        Ok(stored
            .into_iter()
            .filter(|ms| wanted.contains(ms))
            .filter_map(DateTime::<Utc>::from_timestamp_millis)
            .collect())
    }

    pub fn contains(&self, table: &str, id: &RecordId) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT 1 FROM \"{table}\" WHERE id = ?1"),
                params![id.as_str()],
                |_| Ok(()),
            )
            .optional()
            .map(|r| r.is_some())
        })
    }

    /// Commit a batch in one transaction.
    ///
    /// Existing ids are skipped, or overwritten when `force_update` is set.
    /// Records are written in the order given; callers sort them ascending.
    pub fn commit(
        &self,
        schema: &Schema,
        records: &[Record],
        force_update: bool,
    ) -> Result<CommitOutcome, StoreError> {
        let mut outcome = CommitOutcome::default();
        if records.is_empty() {
            return Ok(outcome);
        }

        let columns = schema.all_column_names();
        let quoted: Vec<String> = columns.iter().map(|c| format!("\"{c}\"")).collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        let insert = format!(
            "INSERT INTO \"{}\" ({}) VALUES ({})",
            schema.table,
            quoted.join(", "),
            placeholders.join(", ")
        );
        let replace = insert.replacen("INSERT INTO", "INSERT OR REPLACE INTO", 1);
        let exists = format!("SELECT 1 FROM \"{}\" WHERE id = ?1", schema.table);

        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut exists_stmt = tx.prepare_cached(&exists)?;
                let mut insert_stmt = tx.prepare_cached(&insert)?;
                let mut replace_stmt = tx.prepare_cached(&replace)?;

                for record in records {
                    let present = exists_stmt.exists(params![record.id.as_str()])?;
                    if present && !force_update {
                        outcome.skipped += 1;
                        continue;
                    }
                    let values = row_values(schema, record);
                    if present {
                        replace_stmt.execute(params_from_iter(values.iter()))?;
                        outcome.updated += 1;
                    } else {
                        insert_stmt.execute(params_from_iter(values.iter()))?;
                        outcome.inserted += 1;
                    }
                }
            }
            tx.commit()
        })?;

        Ok(outcome)
    }

    /// Read records back, ascending by timestamp then id.
    pub fn load(&self, schema: &Schema, query: &RecordQuery) -> Result<Vec<Record>, StoreError> {
        let columns = schema.all_column_names();
        let quoted: Vec<String> = columns.iter().map(|c| format!("\"{c}\"")).collect();

        let mut sql = format!("SELECT {} FROM \"{}\" WHERE 1 = 1", quoted.join(", "), schema.table);
        let mut args: Vec<FieldValue> = Vec::new();
        if let Some(entity_id) = &query.entity_id {
            args.push(FieldValue::Text(entity_id.0.clone()));
            sql.push_str(&format!(" AND entity_id = ?{}", args.len()));
        }
        if let Some(start) = query.start {
            args.push(FieldValue::Timestamp(start));
            sql.push_str(&format!(" AND timestamp >= ?{}", args.len()));
        }
        if let Some(end) = query.end {
            args.push(FieldValue::Timestamp(end));
            sql.push_str(&format!(" AND timestamp <= ?{}", args.len()));
        }
        sql.push_str(" ORDER BY timestamp ASC, id ASC");
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let raw_rows: Vec<Vec<Value>> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let n = columns.len();
            let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
                (0..n).map(|i| row.get::<_, Value>(i)).collect()
            })?;
            rows.collect()
        })?;

        raw_rows
            .into_iter()
            .map(|values| decode_row(schema, values))
            .collect()
    }

    pub fn count(&self, table: &str) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |row| {
                row.get::<_, i64>(0)
            })
        })
        .map(|n| n.max(0) as u64)
    }

    pub fn table_stats(&self, table: &str) -> Result<TableStats, StoreError> {
        let (rows, entities, latest): (i64, i64, Option<i64>) = self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT COUNT(*), COUNT(DISTINCT entity_id), MAX(timestamp) FROM \"{table}\""
                ),
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
        })?;
        Ok(TableStats {
            table: table.to_string(),
            rows: rows.max(0) as u64,
            entities: entities.max(0) as u64,
            latest: latest.and_then(DateTime::<Utc>::from_timestamp_millis),
        })
    }
}

fn sqlite_err(key: &NamespaceKey, source: rusqlite::Error) -> StoreError {
    StoreError::Sqlite {
        namespace: key.to_string(),
        source,
    }
}

/// CREATE TABLE plus supporting indices, all `IF NOT EXISTS`.
fn table_ddl(schema: &Schema) -> String {
    let t = &schema.table;
    let mut cols = vec![
        "\"id\" TEXT PRIMARY KEY".to_string(),
        "\"entity_id\" TEXT NOT NULL".to_string(),
        "\"code\" TEXT".to_string(),
        "\"timestamp\" INTEGER NOT NULL".to_string(),
        "\"provider\" TEXT NOT NULL".to_string(),
        "\"level\" TEXT NOT NULL".to_string(),
    ];
    cols.extend(
        schema
            .columns
            .iter()
            .map(|c| format!("\"{}\" {}", c.name, c.column_type.sql_type())),
    );

    let mut ddl = format!("CREATE TABLE IF NOT EXISTS \"{t}\" (\n    {}\n);\n", cols.join(",\n    "));
    for col in ["timestamp", "entity_id", "code"] {
        ddl.push_str(&format!(
            "CREATE INDEX IF NOT EXISTS \"idx_{t}_{col}\" ON \"{t}\" (\"{col}\");\n"
        ));
    }
    if schema.has_column(REPORT_PERIOD_COLUMN) {
        ddl.push_str(&format!(
            "CREATE INDEX IF NOT EXISTS \"idx_{t}_{REPORT_PERIOD_COLUMN}\" ON \"{t}\" (\"{REPORT_PERIOD_COLUMN}\");\n"
        ));
    }
    ddl.push_str(&format!(
        "CREATE INDEX IF NOT EXISTS \"idx_{t}_timestamp_entity_id\" ON \"{t}\" (\"timestamp\", \"entity_id\");\n"
    ));
    ddl
}

fn row_values(schema: &Schema, record: &Record) -> Vec<FieldValue> {
    let mut values = vec![
        FieldValue::Text(record.id.0.clone()),
        FieldValue::Text(record.entity.entity_id.0.clone()),
        FieldValue::Text(record.entity.code.clone()),
        FieldValue::Timestamp(record.timestamp),
        FieldValue::Text(record.provider.clone()),
        FieldValue::Text(record.level.as_str().to_string()),
    ];
    values.extend(schema.columns.iter().map(|c| {
        record
            .payload
            .get(&c.name)
            .cloned()
            .unwrap_or(FieldValue::Null)
    }));
    values
}

fn decode_row(schema: &Schema, values: Vec<Value>) -> Result<Record, StoreError> {
    let corrupt = |reason: String| StoreError::CorruptRow {
        table: schema.table.clone(),
        reason,
    };
    let mut it = values.into_iter();
    let mut text = |name: &str| match it.next() {
        Some(Value::Text(s)) => Ok(s),
        Some(Value::Null) if name == "code" => Ok(String::new()),
        other => Err(corrupt(format!("{name}: unexpected {other:?}"))),
    };
    let id = text("id")?;
    let entity_id = text("entity_id")?;
    let code = text("code")?;

    let timestamp = match it.next() {
        Some(Value::Integer(ms)) => DateTime::<Utc>::from_timestamp_millis(ms)
            .ok_or_else(|| corrupt(format!("timestamp {ms} out of range")))?,
        other => return Err(corrupt(format!("timestamp: unexpected {other:?}"))),
    };
    let provider = match it.next() {
        Some(Value::Text(s)) => s,
        other => return Err(corrupt(format!("provider: unexpected {other:?}"))),
    };
    let level: Level = match it.next() {
        Some(Value::Text(s)) => s.parse().map_err(|e| corrupt(format!("{e}")))?,
        other => return Err(corrupt(format!("level: unexpected {other:?}"))),
    };

    let mut payload = crate::domain::Payload::new();
    for (col, value) in schema.columns.iter().zip(it) {
        let v = decode_value(value, col.column_type)
            .ok_or_else(|| corrupt(format!("column {} has an unexpected storage type", col.name)))?;
        payload.insert(col.name.clone(), v);
    }

    Ok(Record {
        id: RecordId(id),
        entity: EntityRef {
            entity_id: EntityId(entity_id),
            code,
        },
        timestamp,
        provider,
        level,
        payload,
    })
}

fn decode_value(value: Value, ty: ColumnType) -> Option<FieldValue> {
    let v = match (value, ty) {
        (Value::Null, _) => FieldValue::Null,
        (Value::Real(f), ColumnType::Float) => FieldValue::Float(f),
        (Value::Integer(i), ColumnType::Float) => FieldValue::Float(i as f64),
        (Value::Integer(i), ColumnType::Integer) => FieldValue::Integer(i),
        (Value::Integer(i), ColumnType::Bool) => FieldValue::Bool(i != 0),
        (Value::Integer(ms), ColumnType::Timestamp) => {
            FieldValue::Timestamp(DateTime::<Utc>::from_timestamp_millis(ms)?)
        }
        (Value::Text(s), ColumnType::Text) => FieldValue::Text(s),
        _ => return None,
    };
    Some(v)
}

impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            FieldValue::Null => ToSqlOutput::Owned(Value::Null),
            FieldValue::Bool(b) => ToSqlOutput::Owned(Value::Integer(i64::from(*b))),
            FieldValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            FieldValue::Float(f) => ToSqlOutput::Owned(Value::Real(*f)),
            FieldValue::Timestamp(t) => ToSqlOutput::Owned(Value::Integer(t.timestamp_millis())),
            FieldValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}
