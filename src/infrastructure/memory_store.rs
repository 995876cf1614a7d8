// In-process store implementation with fault injection for local runs and tests
use crate::application::errors::StoreError;
use crate::application::sample_store::{SampleStore, SampleStream};
use crate::domain::sample::{Metric, Sample, StreamKey};
use crate::infrastructure::connection_pool::ConnectionPool;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, Mutex, RwLock};

type Series = BTreeMap<DateTime<Utc>, Sample>;

#[derive(Debug, Default)]
struct FaultPlan {
    /// Number of upcoming appends that fail halfway through the batch
    failing_appends: u32,
    unavailable: bool,
}

#[derive(Debug, Clone)]
pub struct MemorySampleStore {
    streams: Arc<RwLock<HashMap<StreamKey, Series>>>,
    faults: Arc<Mutex<FaultPlan>>,
    pool: Arc<ConnectionPool<()>>,
    page_size: usize,
}

impl MemorySampleStore {
    pub fn new(pool: Arc<ConnectionPool<()>>, page_size: usize) -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
            faults: Arc::new(Mutex::new(FaultPlan::default())),
            pool,
            page_size: page_size.max(1),
        }
    }

    /// Make the next `count` appends fail with a transient error after half the batch
    /// has been written
    pub fn fail_next_appends(&self, count: u32) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.failing_appends = count;
        }
    }

    /// Simulate losing connectivity to the store
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.unavailable = unavailable;
        }
    }

    pub fn sample_count(&self) -> usize {
        self.streams
            .read()
            .map(|streams| streams.values().map(|s| s.len()).sum())
            .unwrap_or(0)
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        let faults = self
            .faults
            .lock()
            .map_err(|_| StoreError::Unavailable("fault plan poisoned".to_string()))?;
        if faults.unavailable {
            return Err(StoreError::Unavailable("memory store marked unreachable".to_string()));
        }
        Ok(())
    }

    /// Consumes one armed append fault, returning where in the batch to fail
    fn take_append_fault(&self, batch_len: usize) -> Option<usize> {
        let mut faults = self.faults.lock().ok()?;
        if faults.failing_appends == 0 {
            return None;
        }
        faults.failing_appends -= 1;
        Some(batch_len / 2)
    }

    fn read_page(
        streams: &RwLock<HashMap<StreamKey, Series>>,
        key: &StreamKey,
        lower: Bound<DateTime<Utc>>,
        end: DateTime<Utc>,
        page_size: usize,
    ) -> Result<Vec<Sample>, StoreError> {
        let streams = streams
            .read()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))?;
        let Some(series) = streams.get(key) else {
            return Ok(Vec::new());
        };
        if let Bound::Included(start) | Bound::Excluded(start) = lower {
            if start >= end {
                return Ok(Vec::new());
            }
        }
        Ok(series
            .range((lower, Bound::Excluded(end)))
            .take(page_size)
            .map(|(_, sample)| sample.clone())
            .collect())
    }
}

#[async_trait]
impl SampleStore for MemorySampleStore {
    async fn append(&self, batch: &[Sample]) -> Result<(), StoreError> {
        self.check_reachable()?;
        let _lease = self.pool.acquire().await?;
        let fail_at = self.take_append_fault(batch.len());

        let mut streams = self
            .streams
            .write()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))?;

        // Undo log so a failure part-way through leaves no trace of the batch
        let mut undo: Vec<(StreamKey, DateTime<Utc>, Option<Sample>)> = Vec::with_capacity(batch.len());
        for (idx, sample) in batch.iter().enumerate() {
            if fail_at == Some(idx) {
                for (key, ts, previous) in undo.into_iter().rev() {
                    let series = streams.entry(key.clone()).or_default();
                    match previous {
                        Some(prev) => {
                            series.insert(ts, prev);
                        }
                        None => {
                            series.remove(&ts);
                        }
                    }
                    if series.is_empty() {
                        streams.remove(&key);
                    }
                }
                return Err(StoreError::Transient(format!(
                    "injected failure after {} of {} samples",
                    idx,
                    batch.len()
                )));
            }
            let key = sample.key();
            let previous = streams
                .entry(key.clone())
                .or_default()
                .insert(sample.timestamp, sample.clone());
            undo.push((key, sample.timestamp, previous));
        }

        Ok(())
    }

    fn query_range(
        &self,
        sensor_id: &str,
        metric: Metric,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> SampleStream {
        let store = self.clone();
        let key = StreamKey::new(sensor_id, metric);

        Box::pin(async_stream::try_stream! {
            let mut lower = Bound::Included(start);
            loop {
                store.check_reachable()?;
                let page = {
                    let _lease = store.pool.acquire().await?;
                    Self::read_page(&store.streams, &key, lower, end, store.page_size)?
                };
                let exhausted = page.len() < store.page_size;
                if let Some(last) = page.last() {
                    lower = Bound::Excluded(last.timestamp);
                }
                for sample in page {
                    yield sample;
                }
                if exhausted {
                    break;
                }
            }
        })
    }

    async fn latest(&self, sensor_id: &str, metric: Metric) -> Result<Option<Sample>, StoreError> {
        self.check_reachable()?;
        let _lease = self.pool.acquire().await?;
        let streams = self
            .streams
            .read()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))?;
        Ok(streams
            .get(&StreamKey::new(sensor_id, metric))
            .and_then(|series| series.last_key_value())
            .map(|(_, sample)| sample.clone()))
    }

    async fn list_sensors(&self, metric: Metric) -> Result<Vec<String>, StoreError> {
        self.check_reachable()?;
        let _lease = self.pool.acquire().await?;
        let streams = self
            .streams
            .read()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))?;
        let mut sensors: Vec<String> = streams
            .iter()
            .filter(|(key, series)| key.metric == metric && !series.is_empty())
            .map(|(key, _)| key.sensor_id.clone())
            .collect();
        sensors.sort();
        Ok(sensors)
    }

    async fn evict_before(&self, metric: Metric, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.check_reachable()?;
        let _lease = self.pool.acquire().await?;
        let mut streams = self
            .streams
            .write()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))?;

        let mut removed = 0u64;
        for (key, series) in streams.iter_mut() {
            if key.metric != metric {
                continue;
            }
            let kept = series.split_off(&cutoff);
            removed += series.len() as u64;
            *series = kept;
        }
        streams.retain(|_, series| !series.is_empty());
        Ok(removed)
    }
}
