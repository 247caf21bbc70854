//! CSV drop-directory source.
//!
//! Reads `{dir}/{entity_id}.csv`. The first column must be `timestamp`; every
//! other column is passed through as text and coerced by the recorder against
//! the dataset schema. A missing file means the source has nothing for that
//! entity (yet).

use crate::domain::{parse_timestamp, Entity, FieldValue};
use crate::provider::{FetchAdapter, FetchError, FetchRequest, RawRecord};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct CsvSource {
    name: String,
    dir: PathBuf,
}

impl CsvSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            name: "csv".to_string(),
            dir: dir.into(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn path_for(&self, entity: &Entity) -> PathBuf {
        self.dir.join(format!("{}.csv", entity.id))
    }

    /// Every row of an entity's file, ascending by timestamp.
    fn read_all(&self, entity: &Entity) -> Result<Vec<RawRecord>, FetchError> {
        let path = self.path_for(entity);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut rows = read_file(&path)?;
        rows.sort_by_key(|r| r.timestamp);
        Ok(rows)
    }
}

fn read_file(path: &Path) -> Result<Vec<RawRecord>, FetchError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| csv_error(path, e))?;

    let headers = reader.headers().map_err(|e| csv_error(path, e))?.clone();
    if headers.get(0) != Some("timestamp") {
        return Err(FetchError::Malformed(format!(
            "{}: first column must be 'timestamp'",
            path.display()
        )));
    }

    let mut rows = Vec::new();
    for (line, result) in reader.records().enumerate() {
        let record = result.map_err(|e| csv_error(path, e))?;
        let raw_ts = record.get(0).unwrap_or_default();
        let timestamp = parse_timestamp(raw_ts).ok_or_else(|| {
            FetchError::Malformed(format!(
                "{} row {}: bad timestamp '{raw_ts}'",
                path.display(),
                line + 2
            ))
        })?;

        let mut raw = RawRecord::new(timestamp);
        for (name, value) in headers.iter().zip(record.iter()).skip(1) {
            let value = if value.is_empty() {
                FieldValue::Null
            } else {
                FieldValue::Text(value.to_string())
            };
            raw.fields.insert(name.to_string(), value);
        }
        rows.push(raw);
    }
    Ok(rows)
}

fn csv_error(path: &Path, e: csv::Error) -> FetchError {
    if e.is_io_error() {
        if let csv::ErrorKind::Io(io) = e.into_kind() {
            return FetchError::Io(io);
        }
        return FetchError::Malformed(format!("{}: unreadable", path.display()));
    }
    FetchError::Malformed(format!("{}: {e}", path.display()))
}

impl FetchAdapter for CsvSource {
    fn name(&self) -> &str {
        &self.name
    }

    /// Applies the request the way a paged HTTP source would: `timestamps`
    /// selects exact rows; otherwise rows are bounded by `start`/`end` and the
    /// page is the first `size` rows after `start`, or the last `size` rows
    /// when only an end or nothing is given.
    fn fetch(&self, entity: &Entity, request: &FetchRequest) -> Result<Vec<RawRecord>, FetchError> {
        let rows = self.read_all(entity)?;

        if let Some(wanted) = &request.timestamps {
            return Ok(rows
                .into_iter()
                .filter(|r| wanted.contains(&r.timestamp))
                .collect());
        }

        let mut rows: Vec<RawRecord> = rows
            .into_iter()
            .filter(|r| request.start.map_or(true, |s| r.timestamp >= s))
            .filter(|r| request.end.map_or(true, |e| r.timestamp <= e))
            .collect();

        if let Some(size) = request.size {
            if request.start.is_some() {
                rows.truncate(size);
            } else if rows.len() > size {
                rows.drain(..rows.len() - size);
            }
        }
        Ok(rows)
    }

    fn candidate_timestamps(&self, entity: &Entity) -> Result<Vec<DateTime<Utc>>, FetchError> {
        Ok(self.read_all(entity)?.into_iter().map(|r| r.timestamp).collect())
    }

    fn is_available(&self) -> bool {
        self.dir.is_dir()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
    }

    fn source_with(content: &str) -> (tempfile::TempDir, CsvSource, Entity) {
        let dir = tempfile::tempdir().unwrap();
        let entity = Entity::new("stock", "sh", "600000");
        fs::write(dir.path().join("stock_sh_600000.csv"), content).unwrap();
        let source = CsvSource::new(dir.path());
        (dir, source, entity)
    }

    const BARS: &str = "timestamp,open,close\n\
        2024-01-04,3,3.5\n\
        2024-01-02,1,1.5\n\
        2024-01-03,2,\n\
        2024-01-05,4,4.5\n";

    #[test]
    fn rows_come_back_sorted_with_text_fields() {
        let (_dir, source, entity) = source_with(BARS);
        let rows = source.fetch(&entity, &FetchRequest::default()).unwrap();
        let ts: Vec<_> = rows.iter().map(|r| r.timestamp).collect();
        assert_eq!(ts, vec![day(2), day(3), day(4), day(5)]);
        assert_eq!(rows[0].fields["close"], FieldValue::Text("1.5".into()));
        assert_eq!(rows[1].fields["close"], FieldValue::Null);
    }

    #[test]
    fn start_and_size_page_forward() {
        let (_dir, source, entity) = source_with(BARS);
        let req = FetchRequest {
            start: Some(day(3)),
            size: Some(2),
            ..Default::default()
        };
        let ts: Vec<_> = source.fetch(&entity, &req).unwrap().iter().map(|r| r.timestamp).collect();
        assert_eq!(ts, vec![day(3), day(4)]);
    }

    #[test]
    fn size_without_start_takes_latest() {
        let (_dir, source, entity) = source_with(BARS);
        let req = FetchRequest {
            size: Some(2),
            ..Default::default()
        };
        let ts: Vec<_> = source.fetch(&entity, &req).unwrap().iter().map(|r| r.timestamp).collect();
        assert_eq!(ts, vec![day(4), day(5)]);
    }

    #[test]
    fn explicit_timestamps_select_rows() {
        let (_dir, source, entity) = source_with(BARS);
        let req = FetchRequest {
            timestamps: Some(vec![day(5), day(2)]),
            ..Default::default()
        };
        assert_eq!(source.fetch(&entity, &req).unwrap().len(), 2);
        assert_eq!(source.candidate_timestamps(&entity).unwrap().len(), 4);
    }

    #[test]
    fn missing_file_is_empty_and_bad_header_is_malformed() {
        let (_dir, source, _) = source_with(BARS);
        let other = Entity::new("stock", "sz", "000001");
        assert!(source.fetch(&other, &FetchRequest::default()).unwrap().is_empty());

        let (_dir2, bad, entity) = source_with("date,close\n2024-01-02,1\n");
        assert!(matches!(
            bad.fetch(&entity, &FetchRequest::default()),
            Err(FetchError::Malformed(_))
        ));
    }
}
