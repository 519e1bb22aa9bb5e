use crate::results::ResultRecord;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Where count results end up.
///
/// The store is shared by all the workers of a consumer: implementations must support concurrent
/// calls to [`save`](ResultStore::save) without any external locking.
///
/// Messages are delivered at least once, so the same record can be saved more than once.
#[async_trait::async_trait]
pub trait ResultStore: Send + Sync + 'static {
    async fn save(&self, record: &ResultRecord) -> Result<(), PersistenceError>;
}

/// The store could not persist a record.
#[derive(thiserror::Error, Debug)]
#[error("Failed to persist count result `{record_id}`.")]
pub struct PersistenceError {
    pub record_id: String,
    #[source]
    pub source: anyhow::Error,
}

impl PersistenceError {
    pub fn new(record: &ResultRecord, source: impl Into<anyhow::Error>) -> Self {
        Self {
            record_id: record.id.clone(),
            source: source.into(),
        }
    }
}

/// A [`ResultStore`] keeping records in memory, keyed by id.
///
/// Saving a record whose id is already known keeps the one saved first, as
/// [`PostgresResultStore`](crate::results::PostgresResultStore) does.
#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    records: Mutex<HashMap<String, ResultRecord>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<ResultRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// All stored records, in no particular order.
    pub fn records(&self) -> Vec<ResultRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl ResultStore for InMemoryResultStore {
    async fn save(&self, record: &ResultRecord) -> Result<(), PersistenceError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(record.id.clone())
            .or_insert_with(|| record.clone());
        Ok(())
    }
}
