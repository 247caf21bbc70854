//! Table export to polars DataFrames and Parquet.
//!
//! Column order follows the table layout. Timestamps (base and payload) become
//! `Datetime[ms]` columns; payload columns are nullable.

use crate::domain::{FieldValue, Record};
use crate::schema::{ColumnType, Schema as TableSchema};
use crate::storage::{RecordQuery, Store, StoreError};
use polars::prelude::*;
use std::fs;
use std::path::Path;

fn parquet_err(context: &str) -> impl Fn(PolarsError) -> StoreError + '_ {
    move |e| StoreError::Parquet(format!("{context}: {e}"))
}

pub fn records_to_dataframe(schema: &TableSchema, records: &[Record]) -> Result<DataFrame, StoreError> {
    let datetime = DataType::Datetime(TimeUnit::Milliseconds, None);

    let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
    let entity_ids: Vec<&str> = records.iter().map(|r| r.entity.entity_id.as_str()).collect();
    let codes: Vec<&str> = records.iter().map(|r| r.entity.code.as_str()).collect();
    let timestamps: Vec<i64> = records.iter().map(|r| r.timestamp.timestamp_millis()).collect();
    let providers: Vec<&str> = records.iter().map(|r| r.provider.as_str()).collect();
    let levels: Vec<&str> = records.iter().map(|r| r.level.as_str()).collect();

    let mut columns = vec![
        Column::new("id".into(), ids),
        Column::new("entity_id".into(), entity_ids),
        Column::new("code".into(), codes),
        Column::new("timestamp".into(), timestamps)
            .cast(&datetime)
            .map_err(parquet_err("timestamp cast"))?,
        Column::new("provider".into(), providers),
        Column::new("level".into(), levels),
    ];

    for col in &schema.columns {
        let cells = records.iter().map(|r| r.payload.get(&col.name));
        let name: PlSmallStr = col.name.as_str().into();
        let column = match col.column_type {
            ColumnType::Float => {
                let v: Vec<Option<f64>> = cells.map(|c| c.and_then(FieldValue::as_f64)).collect();
                Column::new(name, v)
            }
            ColumnType::Integer => {
                let v: Vec<Option<i64>> = cells
                    .map(|c| match c {
                        Some(FieldValue::Integer(i)) => Some(*i),
                        _ => None,
                    })
                    .collect();
                Column::new(name, v)
            }
            ColumnType::Bool => {
                let v: Vec<Option<bool>> = cells
                    .map(|c| match c {
                        Some(FieldValue::Bool(b)) => Some(*b),
                        _ => None,
                    })
                    .collect();
                Column::new(name, v)
            }
            ColumnType::Timestamp => {
                let v: Vec<Option<i64>> = cells
                    .map(|c| match c {
                        Some(FieldValue::Timestamp(t)) => Some(t.timestamp_millis()),
                        _ => None,
                    })
                    .collect();
                Column::new(name, v)
                    .cast(&datetime)
                    .map_err(parquet_err("timestamp cast"))?
            }
            ColumnType::Text => {
                let v: Vec<Option<String>> = cells
                    .map(|c| match c {
                        Some(FieldValue::Null) | None => None,
                        Some(FieldValue::Text(s)) => Some(s.clone()),
                        Some(other) => Some(other.key_string()),
                    })
                    .collect();
                Column::new(name, v)
            }
        };
        columns.push(column);
    }

    DataFrame::new(columns).map_err(parquet_err("dataframe creation"))
}

/// Query a table and write the rows to `path` as Parquet.
///
/// Writes to `{path}.tmp` and renames into place. Returns the row count.
pub fn export_parquet(
    store: &Store,
    schema: &TableSchema,
    query: &RecordQuery,
    path: &Path,
) -> Result<usize, StoreError> {
    let records = store.load(schema, query)?;
    let mut df = records_to_dataframe(schema, &records)?;

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let tmp_path = path.with_extension("parquet.tmp");
    let file = fs::File::create(&tmp_path)?;
    ParquetWriter::new(file)
        .finish(&mut df)
        .map_err(parquet_err("write parquet"))?;

    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        StoreError::Io(e)
    })?;

    tracing::info!(table = %schema.table, rows = records.len(), path = %path.display(), "exported parquet");
    Ok(records.len())
}

pub fn read_parquet(path: &Path) -> Result<DataFrame, StoreError> {
    let file = fs::File::open(path)?;
    ParquetReader::new(file)
        .finish()
        .map_err(parquet_err("read parquet"))
}
