//! Fetch adapter boundary and structured error types.
//!
//! A `FetchAdapter` abstracts over one external source (HTTP API, scraper, CSV
//! drop directory) so recorders can swap implementations and mock for tests.
//! Adapters know nothing about storage; the recorder decides what to ask for.

use crate::domain::{Entity, FieldValue};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors an adapter may return.
///
/// `is_retryable` splits them into transient source errors (retry later) and
/// errors that will not go away by asking again.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transient source error: {0}")]
    Transient(String),

    #[error("rate limited by source (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("source is unavailable: {0}")]
    Unavailable(String),

    #[error("entity not found at source: {entity_id}")]
    EntityNotFound { entity_id: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("source I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Transient(_) | FetchError::RateLimited { .. } | FetchError::Unavailable(_)
        )
    }

    /// Minimum wait the source asked for, if any.
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            FetchError::RateLimited { retry_after_secs } => {
                Some(std::time::Duration::from_secs(*retry_after_secs))
            }
            _ => None,
        }
    }
}

/// What to ask the source for. Fields not used by the fetching style are `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchRequest {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub size: Option<usize>,
    pub timestamps: Option<Vec<DateTime<Utc>>>,
}

/// One record as the source returned it, before mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub timestamp: DateTime<Utc>,
    pub fields: BTreeMap<String, FieldValue>,
}

impl RawRecord {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            fields: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

/// A source the recorder can pull from.
pub trait FetchAdapter: Send + Sync {
    /// Human-readable name of this source.
    fn name(&self) -> &str;

    fn fetch(&self, entity: &Entity, request: &FetchRequest) -> Result<Vec<RawRecord>, FetchError>;

    /// Timestamps the source can supply for `entity`.
    ///
    /// Only consulted by the by-timestamps fetching style.
    fn candidate_timestamps(&self, _entity: &Entity) -> Result<Vec<DateTime<Utc>>, FetchError> {
        Ok(Vec::new())
    }

    /// Check if the source is currently usable (not rate limited, not blocked).
    fn is_available(&self) -> bool {
        true
    }
}

/// Called once per entity when the recorder marks it finished for the run.
pub trait FinishHook: Send + Sync {
    fn on_finish(&self, entity: &Entity);
}

impl<F> FinishHook for F
where
    F: Fn(&Entity) + Send + Sync,
{
    fn on_finish(&self, entity: &Entity) {
        self(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(FetchError::Transient("timeout".into()).is_retryable());
        assert!(FetchError::RateLimited { retry_after_secs: 5 }.is_retryable());
        assert!(!FetchError::Malformed("no header".into()).is_retryable());
        assert!(!FetchError::EntityNotFound {
            entity_id: "stock_sh_600000".into()
        }
        .is_retryable());
    }

    #[test]
    fn rate_limit_carries_wait() {
        let err = FetchError::RateLimited { retry_after_secs: 3 };
        assert_eq!(err.retry_after(), Some(std::time::Duration::from_secs(3)));
        assert_eq!(FetchError::Transient("x".into()).retry_after(), None);
    }

    #[test]
    fn closures_are_finish_hooks() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let calls = AtomicUsize::new(0);
        let hook = |_: &Entity| {
            calls.fetch_add(1, Ordering::SeqCst);
        };
        hook.on_finish(&Entity::new("stock", "sh", "600000"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
