//! Recorder run loop.
//!
//! A recorder tracks one dataset table for a fixed set of entities, resolved
//! once at construction. Each pass visits the still-unfinished entities in
//! catalog order:
//!
//! 1. evaluate the fetch window from storage
//! 2. nothing due: optionally wait once for a near boundary, else finish
//! 3. fetch through the adapter, then pace
//! 4. map raw rows to records (ids, coercion, unfinished-period filter)
//! 5. suffix in-batch id collisions
//! 6. commit the batch in one transaction, skipping or overwriting existing ids
//!
//! An entity finishes when the source returns nothing, when a batch adds no
//! new rows, or after one non-empty fetch in one-shot mode. Failures are
//! handled per `FailurePolicy`, always bounded by `max_retries`.

use crate::calendar::{Clock, MarketCalendar, SystemClock};
use crate::catalog::EntityFilter;
use crate::config::{FailurePolicy, FetchingStyle, RecorderConfig};
use crate::domain::{Entity, EntityId, FieldValue, Payload, Record, RecordId};
use crate::pacer::{Pacer, RetryPolicy, Sleeper, ThreadSleeper};
use crate::provider::{FetchAdapter, FetchError, FinishHook, RawRecord};
use crate::registry::{Registry, RegistryError};
use crate::schema::Schema;
use crate::storage::{Store, StoreError};
use crate::window::{FetchWindow, WindowEvaluator};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("recorder configuration: {0}")]
    Configuration(String),

    #[error("source error: {0}")]
    Source(#[from] FetchError),

    #[error("cannot map records of {entity_id}: {reason}")]
    Mapping { entity_id: EntityId, reason: String },

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl RecorderError {
    pub fn is_retryable(&self) -> bool {
        match self {
            RecorderError::Source(e) => e.is_retryable(),
            RecorderError::Storage(_) => true,
            RecorderError::Configuration(_) | RecorderError::Mapping { .. } => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            RecorderError::Source(e) => e.retry_after(),
            _ => None,
        }
    }
}

/// Counters of one fetched batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub collisions: usize,
    pub dropped_unfinished: usize,
}

/// Result of processing one entity once.
#[derive(Debug)]
pub enum StepOutcome {
    /// Data was written; visit again next pass.
    Progress(BatchStats),
    /// Caught up (or nothing to do) for this run.
    Finished(BatchStats),
    /// Failed, asking again later may succeed.
    Retryable(RecorderError),
    /// Failed, asking again will not help.
    Fatal(RecorderError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub entities: usize,
    pub passes: usize,
    pub finished: usize,
    pub failed: Vec<EntityId>,
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub collisions: usize,
    pub dropped_unfinished: usize,
}

impl RunSummary {
    fn absorb(&mut self, batch: &BatchStats) {
        self.fetched += batch.fetched;
        self.inserted += batch.inserted;
        self.updated += batch.updated;
        self.skipped += batch.skipped;
        self.collisions += batch.collisions;
        self.dropped_unfinished += batch.dropped_unfinished;
    }
}

type Predicate = Arc<dyn Fn(&Entity) -> bool + Send + Sync>;

pub struct RecorderBuilder<'r> {
    registry: &'r Registry,
    config: RecorderConfig,
    adapter: Arc<dyn FetchAdapter>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    calendar: MarketCalendar,
    hooks: Vec<Arc<dyn FinishHook>>,
    predicate: Option<Predicate>,
    jitter: bool,
}

impl<'r> RecorderBuilder<'r> {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn calendar(mut self, calendar: MarketCalendar) -> Self {
        self.calendar = calendar;
        self
    }

    pub fn finish_hook(mut self, hook: Arc<dyn FinishHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Extra entity condition on top of the configured filters.
    pub fn predicate(mut self, f: impl Fn(&Entity) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(f));
        self
    }

    /// Disable backoff jitter (deterministic delays).
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Resolve schema, store and working set.
    pub fn build(self) -> Result<Recorder, RecorderError> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| RecorderError::Configuration(e.to_string()))?;

        let store = self
            .registry
            .store(&config.provider, &config.dataset)
            .map_err(registry_error)?;
        let schema = resolve_schema(self.registry, &config)?.clone();

        let mut filter = EntityFilter::from_config(&config);
        if filter.entity_type.is_none() {
            filter.entity_type = Some(schema.entity_type.clone());
        }
        filter.predicate = self.predicate;
        let entities = self
            .registry
            .catalog(config.entity_provider())
            .map_err(registry_error)?
            .query(&filter)?;

        let retry = RetryPolicy {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            jitter: self.jitter,
        };
        let pacer = Pacer::new(
            self.sleeper,
            config.sleeping_duration(),
            config.max_boundary_wait(),
            retry,
        );
        let evaluator = WindowEvaluator::from_config(&config, self.calendar).with_level(schema.level);

        tracing::info!(
            provider = %config.provider,
            dataset = %config.dataset,
            table = %schema.table,
            entities = entities.len(),
            "recorder ready"
        );

        Ok(Recorder {
            config,
            schema,
            store,
            entities,
            adapter: self.adapter,
            clock: self.clock,
            pacer,
            evaluator,
            hooks: self.hooks,
        })
    }
}

fn registry_error(e: RegistryError) -> RecorderError {
    match e {
        RegistryError::Store(e) => RecorderError::Storage(e),
        other => RecorderError::Configuration(other.to_string()),
    }
}

/// Pick the table: explicit name, else `(entity_type, level)`, else the
/// dataset's only schema.
fn resolve_schema<'a>(registry: &'a Registry, config: &RecorderConfig) -> Result<&'a Schema, RecorderError> {
    let dataset = &config.dataset;
    if let Some(table) = &config.table {
        return registry.find_schema(dataset, table).ok_or_else(|| {
            RecorderError::Configuration(format!("table '{table}' is not part of dataset '{dataset}'"))
        });
    }

    let entity_type = config
        .entity_type
        .as_ref()
        .or_else(|| registry.entity_type_of(dataset));
    if let Some(entity_type) = entity_type {
        if let Some(schema) = registry.schema_for(dataset, entity_type, config.level) {
            return Ok(schema);
        }
    }

    match registry.schemas_of(dataset) {
        Some([only]) => Ok(only),
        Some(_) => Err(RecorderError::Configuration(format!(
            "dataset '{dataset}' has several tables; set `table` or `entity_type` + `level`"
        ))),
        None => Err(RecorderError::Configuration(format!(
            "dataset '{dataset}' is not registered"
        ))),
    }
}

pub struct Recorder {
    config: RecorderConfig,
    schema: Schema,
    store: Arc<Store>,
    entities: Vec<Entity>,
    adapter: Arc<dyn FetchAdapter>,
    clock: Arc<dyn Clock>,
    pacer: Pacer,
    evaluator: WindowEvaluator,
    hooks: Vec<Arc<dyn FinishHook>>,
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("source", &self.adapter.name())
            .field("namespace", self.store.key())
            .field("table", &self.schema.table)
            .field("entities", &self.entities.len())
            .finish()
    }
}

impl Recorder {
    pub fn builder<'r>(
        registry: &'r Registry,
        config: RecorderConfig,
        adapter: Arc<dyn FetchAdapter>,
    ) -> RecorderBuilder<'r> {
        RecorderBuilder {
            registry,
            config,
            adapter,
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(ThreadSleeper),
            calendar: MarketCalendar::always_open(),
            hooks: Vec::new(),
            predicate: None,
            jitter: true,
        }
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// The working set, in processing order.
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    /// Current fetch window of an entity.
    pub fn evaluate(&self, entity: &Entity) -> Result<FetchWindow, RecorderError> {
        self.evaluate_at(entity, self.clock.now())
    }

    fn evaluate_at(&self, entity: &Entity, now: DateTime<Utc>) -> Result<FetchWindow, RecorderError> {
        if self.config.fetching_style == FetchingStyle::ByTimestamps {
            let candidates = self.adapter.candidate_timestamps(entity)?;
            let persisted = self
                .store
                .persisted_timestamps(&self.schema.table, &entity.id, &candidates)?;
            return Ok(self.evaluator.evaluate_timestamps(&candidates, &persisted, now));
        }
        let cursor = self.store.latest_timestamp(&self.schema.table, &entity.id)?;
        Ok(self.evaluator.evaluate(entity, cursor, now))
    }

    /// Process one entity once.
    pub fn step(&self, entity: &Entity) -> StepOutcome {
        match self.try_step(entity) {
            Ok(outcome) => outcome,
            Err(e) if e.is_retryable() => StepOutcome::Retryable(e),
            Err(e) => StepOutcome::Fatal(e),
        }
    }

    fn try_step(&self, entity: &Entity) -> Result<StepOutcome, RecorderError> {
        let mut window = self.evaluate(entity)?;
        if window.is_empty() {
            let waited = window
                .wait
                .is_some_and(|wait| self.pacer.wait_for_boundary(wait));
            if waited {
                window = self.evaluate(entity)?;
            }
            if window.is_empty() {
                tracing::debug!(entity_id = %entity.id, state = ?window.state, "nothing due");
                return Ok(StepOutcome::Finished(BatchStats::default()));
            }
        }

        if !self.adapter.is_available() {
            return Err(FetchError::Unavailable(self.adapter.name().to_string()).into());
        }

        let request = window.request(self.config.fetching_style);
        let fetched = self.adapter.fetch(entity, &request);
        self.pacer.pace();
        let raw = fetched?;

        if raw.is_empty() {
            tracing::debug!(entity_id = %entity.id, "source returned nothing");
            return Ok(StepOutcome::Finished(BatchStats::default()));
        }

        let now = self.clock.now();
        let mut stats = BatchStats {
            fetched: raw.len(),
            ..BatchStats::default()
        };
        let records = self.map_batch(entity, raw, now, &mut stats)?;
        let outcome = self
            .store
            .commit(&self.schema, &records, self.config.force_update)?;
        stats.inserted = outcome.inserted;
        stats.updated = outcome.updated;
        stats.skipped = outcome.skipped;

        tracing::info!(
            entity_id = %entity.id,
            state = ?window.state,
            size = window.size,
            fetched = stats.fetched,
            inserted = stats.inserted,
            updated = stats.updated,
            skipped = stats.skipped,
            "batch recorded"
        );

        if self.config.one_shot || stats.inserted == 0 {
            Ok(StepOutcome::Finished(stats))
        } else {
            Ok(StepOutcome::Progress(stats))
        }
    }

    /// Raw rows → records, ascending by timestamp, ids unique within the batch.
    fn map_batch(
        &self,
        entity: &Entity,
        mut raw: Vec<RawRecord>,
        now: DateTime<Utc>,
        stats: &mut BatchStats,
    ) -> Result<Vec<Record>, RecorderError> {
        raw.sort_by_key(|r| r.timestamp);

        let mut seen: HashMap<RecordId, usize> = HashMap::new();
        let mut records = Vec::with_capacity(raw.len());
        for row in raw {
            if !self.config.contain_unfinished_period
                && self.evaluator.is_unfinished(entity, row.timestamp, now)
            {
                stats.dropped_unfinished += 1;
                continue;
            }

            let payload = self.map_payload(entity, &row)?;
            let base = self
                .schema
                .id_rule
                .generate(&entity.id, row.timestamp, self.schema.level, &payload);
            let id = match seen.get_mut(&base) {
                Some(n) => {
                    *n += 1;
                    let suffixed = base.with_suffix(*n);
                    tracing::warn!(
                        entity_id = %entity.id,
                        id = %base,
                        stored_as = %suffixed,
                        "record id collision within batch"
                    );
                    stats.collisions += 1;
                    suffixed
                }
                None => {
                    seen.insert(base.clone(), 0);
                    base
                }
            };

            records.push(Record {
                id,
                entity: entity.entity_ref(),
                timestamp: row.timestamp,
                provider: self.config.provider.clone(),
                level: self.schema.level,
                payload,
            });
        }
        Ok(records)
    }

    /// Declared columns only, coerced; absent columns are NULL.
    fn map_payload(&self, entity: &Entity, row: &RawRecord) -> Result<Payload, RecorderError> {
        let mut payload = Payload::new();
        for column in &self.schema.columns {
            let value = row
                .fields
                .get(&column.name)
                .unwrap_or(&FieldValue::Null)
                .coerce(column.column_type)
                .map_err(|reason| RecorderError::Mapping {
                    entity_id: entity.id.clone(),
                    reason: format!("{} column '{}': {reason}", row.timestamp, column.name),
                })?;
            payload.insert(column.name.clone(), value);
        }
        Ok(payload)
    }

    fn finish(&self, entity: &Entity) {
        for hook in &self.hooks {
            hook.on_finish(entity);
        }
    }

    /// Run passes until every entity is finished or given up on.
    pub fn run(&self) -> Result<RunSummary, RecorderError> {
        let mut summary = RunSummary {
            entities: self.entities.len(),
            ..RunSummary::default()
        };
        let mut pending: Vec<usize> = (0..self.entities.len()).collect();
        let mut attempts: HashMap<usize, u32> = HashMap::new();
        let mut aborted_passes = 0u32;

        while !pending.is_empty() {
            summary.passes += 1;
            tracing::debug!(pass = summary.passes, pending = pending.len(), "pass started");

            let mut next = Vec::with_capacity(pending.len());
            let mut abort: Option<RecorderError> = None;

            for (pos, &i) in pending.iter().enumerate() {
                let entity = &self.entities[i];
                match self.step(entity) {
                    StepOutcome::Progress(batch) => {
                        summary.absorb(&batch);
                        attempts.remove(&i);
                        next.push(i);
                    }
                    StepOutcome::Finished(batch) => {
                        summary.absorb(&batch);
                        summary.finished += 1;
                        self.finish(entity);
                    }
                    StepOutcome::Retryable(err) | StepOutcome::Fatal(err)
                        if self.config.failure_policy == FailurePolicy::AbortPass =>
                    {
                        tracing::warn!(entity_id = %entity.id, error = %err, "pass aborted");
                        next.extend_from_slice(&pending[pos..]);
                        abort = Some(err);
                        break;
                    }
                    StepOutcome::Retryable(err) => {
                        let attempt = attempts.entry(i).or_insert(0);
                        *attempt += 1;
                        if self.pacer.retry_policy().exhausted(*attempt) {
                            tracing::error!(entity_id = %entity.id, error = %err, attempts = *attempt, "giving up on entity");
                            summary.failed.push(entity.id.clone());
                        } else {
                            tracing::warn!(entity_id = %entity.id, error = %err, attempt = *attempt, "retrying entity");
                            self.pacer.backoff(*attempt, err.retry_after());
                            next.push(i);
                        }
                    }
                    StepOutcome::Fatal(err) => {
                        tracing::error!(entity_id = %entity.id, error = %err, "entity failed");
                        summary.failed.push(entity.id.clone());
                    }
                }
            }

            if let Some(err) = abort {
                aborted_passes += 1;
                if self.pacer.retry_policy().exhausted(aborted_passes) {
                    tracing::error!(passes = aborted_passes, error = %err, "too many aborted passes");
                    return Err(err);
                }
                self.pacer.backoff(aborted_passes, err.retry_after());
            } else {
                aborted_passes = 0;
            }
            pending = next;
        }

        tracing::info!(
            passes = summary.passes,
            finished = summary.finished,
            failed = summary.failed.len(),
            inserted = summary.inserted,
            "recorder run complete"
        );
        Ok(summary)
    }
}
