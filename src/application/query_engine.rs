// Query engine - latest values and windowed, downsampled series for charts
use crate::application::errors::{QueryError, StoreError};
use crate::application::last_known_cache::LastKnownCache;
use crate::application::sample_store::SampleStore;
use crate::domain::query::{
    bucket_start, AggregatePoint, Resolution, SensorSelector, SeriesResult, WindowQuery,
};
use crate::domain::sample::{pick_latest, Metric, Sample, StreamKey};
use crate::infrastructure::config::QuerySettings;
use chrono::{DateTime, Duration, Utc};
use futures::TryStreamExt;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Debug, Clone, Serialize)]
pub struct LatestReading {
    pub sample: Sample,
    /// True when the store could not be reached and the value came from the cache
    pub stale: bool,
}

#[derive(Debug, Clone, Copy)]
struct Accumulator {
    sum: f64,
    min: f64,
    max: f64,
    count: u64,
}

impl Accumulator {
    fn new(value: f64) -> Self {
        Self {
            sum: value,
            min: value,
            max: value,
            count: 1,
        }
    }

    fn add(&mut self, value: f64) {
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.count += 1;
    }
}

#[derive(Clone)]
pub struct QueryEngine {
    store: Arc<dyn SampleStore>,
    cache: Arc<LastKnownCache>,
    settings: QuerySettings,
}

impl QueryEngine {
    pub fn new(store: Arc<dyn SampleStore>, cache: Arc<LastKnownCache>, settings: QuerySettings) -> Self {
        Self {
            store,
            cache,
            settings,
        }
    }

    pub fn default_deadline(&self) -> Instant {
        Instant::now() + self.settings.default_deadline()
    }

    /// Most recent sample of a stream. Ties on timestamp go to the better quality,
    /// then to the most recently ingested sample.
    pub async fn latest(&self, sensor_id: &str, metric: Metric) -> Result<LatestReading, QueryError> {
        let key = StreamKey::new(sensor_id, metric);
        let cached = self.cache.get(&key);
        let budget = self.settings.default_deadline();

        let stored = match tokio::time::timeout(budget, self.store.latest(sensor_id, metric)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Unavailable(format!("latest lookup exceeded {:?}", budget))),
        };

        match stored {
            Ok(stored) => pick_latest(stored.into_iter().chain(cached))
                .map(|sample| LatestReading { sample, stale: false })
                .ok_or_else(|| QueryError::NotFound(key.to_string())),
            Err(e) => match cached {
                Some(sample) => {
                    tracing::warn!("Serving cached latest for {}: {}", key, e);
                    Ok(LatestReading { sample, stale: true })
                }
                None => Err(e.into()),
            },
        }
    }

    /// Raw samples of one stream in `[start, end)`, abandoned at `deadline`
    pub async fn query_range(
        &self,
        sensor_id: &str,
        metric: Metric,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        deadline: Instant,
    ) -> Result<Vec<Sample>, QueryError> {
        let budget = deadline.saturating_duration_since(Instant::now());
        let fetch = self
            .store
            .query_range(sensor_id, metric, start, end)
            .try_collect::<Vec<Sample>>();

        tokio::time::timeout_at(deadline, fetch)
            .await
            .map_err(|_| QueryError::Timeout(budget))?
            .map_err(QueryError::from)
    }

    /// Answer a window query. Either the whole result is returned or an error;
    /// a deadline overrun drops the in-flight store work.
    pub async fn series(&self, query: &WindowQuery, deadline: Instant) -> Result<SeriesResult, QueryError> {
        if query.start >= query.end {
            return Err(QueryError::InvalidQuery(format!(
                "start {} must be before end {}",
                query.start.to_rfc3339(),
                query.end.to_rfc3339()
            )));
        }
        let resolution = self.resolve(query)?;
        let budget = deadline.saturating_duration_since(Instant::now());

        let started = std::time::Instant::now();
        let result = tokio::time::timeout_at(deadline, self.run_series(query, resolution, deadline))
            .await
            .map_err(|_| {
                tracing::warn!(
                    "Series query for {:?}/{} abandoned after {:?}",
                    query.sensor,
                    query.metric,
                    budget
                );
                QueryError::Timeout(budget)
            })??;

        if result.is_empty() {
            tracing::debug!("Series {:?}/{} has no samples in range", query.sensor, query.metric);
        }
        tracing::debug!(
            "Series {:?}/{} at {} returned {} points in {:?}",
            query.sensor,
            query.metric,
            resolution,
            result.len(),
            started.elapsed()
        );
        Ok(result)
    }

    /// Turn the requested resolution into `Raw` or a concrete, allowed bucket width
    pub fn resolve(&self, query: &WindowQuery) -> Result<Resolution, QueryError> {
        let allowed = self.settings.buckets_for(query.metric);
        match query.resolution {
            Resolution::Raw => Ok(Resolution::Raw),
            Resolution::Bucket(width) => {
                if width <= Duration::zero() {
                    return Err(QueryError::InvalidQuery("bucket width must be positive".to_string()));
                }
                if !allowed.is_empty() && !allowed.contains(&width) {
                    return Err(QueryError::InvalidQuery(format!(
                        "bucket of {}s is not configured for {}",
                        width.num_seconds(),
                        query.metric
                    )));
                }
                Ok(Resolution::Bucket(width))
            }
            Resolution::Auto { max_points } => Ok(Resolution::Bucket(auto_bucket(
                query.end - query.start,
                max_points,
                &allowed,
            ))),
        }
    }

    async fn run_series(
        &self,
        query: &WindowQuery,
        resolution: Resolution,
        deadline: Instant,
    ) -> Result<SeriesResult, QueryError> {
        let sensors = match &query.sensor {
            SensorSelector::One(id) => vec![id.clone()],
            SensorSelector::All => self.store.list_sensors(query.metric).await?,
        };

        match resolution {
            Resolution::Bucket(width) => {
                let mut buckets: BTreeMap<DateTime<Utc>, Accumulator> = BTreeMap::new();
                for sensor in &sensors {
                    let mut samples = self.store.query_range(sensor, query.metric, query.start, query.end);
                    while let Some(sample) = samples.try_next().await? {
                        buckets
                            .entry(bucket_start(sample.timestamp, width))
                            .and_modify(|acc| acc.add(sample.value))
                            .or_insert_with(|| Accumulator::new(sample.value));
                    }
                }

                let points = buckets
                    .into_iter()
                    .map(|(bucket_start, acc)| AggregatePoint {
                        metric: query.metric,
                        bucket_start,
                        avg: acc.sum / acc.count as f64,
                        min: acc.min,
                        max: acc.max,
                        count: acc.count,
                    })
                    .collect();
                Ok(SeriesResult::Aggregated(points))
            }
            _ => {
                let mut merged = Vec::new();
                for sensor in &sensors {
                    let samples = self
                        .query_range(sensor, query.metric, query.start, query.end, deadline)
                        .await?;
                    merged.extend(samples);
                }
                if sensors.len() > 1 {
                    // Stable sort keeps per-sensor order and sensor order on equal timestamps
                    merged.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
                }
                Ok(SeriesResult::Raw(merged))
            }
        }
    }
}

/// Smallest allowed bucket that keeps the range within `max_points` buckets
fn auto_bucket(range: Duration, max_points: usize, allowed: &[Duration]) -> Duration {
    let range_ms = range.num_milliseconds().max(1);
    let max_points = max_points.max(1) as i64;
    let fits = |width: &Duration| {
        let width_ms = width.num_milliseconds().max(1);
        (range_ms + width_ms - 1) / width_ms <= max_points
    };

    if let Some(width) = allowed.iter().find(|w| fits(w)) {
        return *width;
    }
    if let Some(widest) = allowed.last() {
        return *widest;
    }
    let secs = ((range_ms + max_points * 1_000 - 1) / (max_points * 1_000)).max(1);
    Duration::seconds(secs)
}
