// Store trait for durable, ordered sample storage
use crate::application::errors::StoreError;
use crate::domain::sample::{Metric, Sample};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

/// Lazily produced samples of one stream, ascending by timestamp
pub type SampleStream = BoxStream<'static, Result<Sample, StoreError>>;

#[async_trait]
pub trait SampleStore: Send + Sync {
    /// Persist a batch atomically: either every sample becomes visible or none does.
    /// A sample whose (sensor, metric, timestamp) already exists replaces it.
    async fn append(&self, batch: &[Sample]) -> Result<(), StoreError>;

    /// Samples in `[start, end)` for one stream, ascending by timestamp.
    /// The stream is finite; calling again restarts from `start`.
    fn query_range(
        &self,
        sensor_id: &str,
        metric: Metric,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> SampleStream;

    /// Most recent stored sample of a stream
    async fn latest(&self, sensor_id: &str, metric: Metric) -> Result<Option<Sample>, StoreError>;

    /// Sensors that have at least one stored sample for `metric`
    async fn list_sensors(&self, metric: Metric) -> Result<Vec<String>, StoreError>;

    /// Delete every sample of `metric` older than `cutoff`; returns the number removed
    /// when the backend can report it
    async fn evict_before(&self, metric: Metric, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}
