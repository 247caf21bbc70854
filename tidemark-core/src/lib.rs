//! Tidemark Core: incremental, resumable recording of financial time series.
//!
//! This crate contains the recording engine:
//! - Domain types (entities, levels, deterministic record ids, records)
//! - Dataset registry binding datasets to providers and storage namespaces
//! - SQLite storage namespaces with at-most-one-per-id commits
//! - Entity catalog accessor and TOML entity universes
//! - Fetch window evaluator (cursor-derived, never cached)
//! - Recorder run loop with per-entity outcomes and bounded retries
//! - Pacing, boundary waits and backoff
//! - CSV fetch adapter and Parquet export

pub mod calendar;
pub mod catalog;
pub mod config;
pub mod csv_source;
pub mod domain;
pub mod frame;
pub mod pacer;
pub mod provider;
pub mod recorder;
pub mod registry;
pub mod schema;
pub mod storage;
pub mod universe;
pub mod window;

pub use calendar::{Clock, FixedClock, MarketCalendar, SystemClock};
pub use catalog::{EntityCatalog, EntityFilter};
pub use config::{
    ConfigError, FailurePolicy, FetchingStyle, RecorderConfig, RunFile, TimestampConvention,
};
pub use csv_source::CsvSource;
pub use pacer::{Pacer, RecordingSleeper, RetryPolicy, Sleeper, ThreadSleeper};
pub use provider::{FetchAdapter, FetchError, FetchRequest, FinishHook, RawRecord};
pub use recorder::{BatchStats, Recorder, RecorderError, RunSummary, StepOutcome};
pub use registry::{DatasetSpec, Registry, RegistryError};
pub use schema::{Column, ColumnType, Schema, SchemaError};
pub use storage::{CommitOutcome, NamespaceKey, RecordQuery, StorageRoot, Store, StoreError, TableStats};
pub use universe::EntityUniverse;
pub use window::{FetchWindow, WindowEvaluator, WindowState};
