// Error taxonomy shared by the ingestion, storage and query paths
use crate::domain::sample::RawReading;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    /// Reading failed validation; never retried
    #[error("invalid reading from '{}': {reason}", .reading.sensor_id)]
    Validation {
        reason: String,
        reading: Box<RawReading>,
    },

    /// Buffer is saturated; the caller should retry later with backoff
    #[error("ingestion backpressure: {pending} samples pending (high-water mark {high_water_mark})")]
    Backpressure {
        pending: usize,
        high_water_mark: usize,
    },

    /// Buffer has been shut down
    #[error("ingestion buffer is closed")]
    Closed,
}

impl IngestError {
    pub fn validation(reason: impl Into<String>, reading: &RawReading) -> Self {
        IngestError::Validation {
            reason: reason.into(),
            reading: Box::new(reading.clone()),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    /// Retryable failure, e.g. a dropped connection or a 5xx from the store
    #[error("transient store failure: {0}")]
    Transient(String),

    /// The store cannot serve this call (unreachable, pool exhausted, closed)
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store answered with something we could not interpret
    #[error("malformed store response: {0}")]
    Malformed(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("no samples for {0}")]
    NotFound(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Deadline exceeded; no partial result is returned
    #[error("query timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error(transparent)]
    Store(#[from] StoreError),
}
