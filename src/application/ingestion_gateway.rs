// Ingestion gateway - validates raw readings and routes them into the buffer
use crate::application::errors::IngestError;
use crate::application::last_known_cache::LastKnownCache;
use crate::application::sample_buffer::SampleBuffer;
use crate::domain::sample::{Metric, Quality, RawReading, Sample};
use crate::infrastructure::config::IngestSettings;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

const MAX_SENSOR_ID_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Accepted {
    pub sequence: u64,
    pub quality: Quality,
}

#[derive(Clone)]
pub struct IngestionGateway {
    buffer: SampleBuffer,
    cache: Arc<LastKnownCache>,
    settings: IngestSettings,
    sequence: Arc<AtomicU64>,
}

impl IngestionGateway {
    pub fn new(buffer: SampleBuffer, cache: Arc<LastKnownCache>, settings: IngestSettings) -> Self {
        Self {
            buffer,
            cache,
            settings,
            sequence: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Validate and queue one reading. Returns as soon as the sample is buffered.
    pub fn submit(&self, raw: RawReading) -> Result<Accepted, IngestError> {
        self.submit_at(raw, Utc::now())
    }

    fn submit_at(&self, raw: RawReading, now: DateTime<Utc>) -> Result<Accepted, IngestError> {
        let (metric, reported_quality) = match self.validate(&raw, now) {
            Ok(parsed) => parsed,
            Err(reason) => {
                tracing::warn!("Rejected reading: {} ({:?})", reason, raw);
                return Err(IngestError::validation(reason, &raw));
            }
        };

        let bounds = self.settings.bounds_for(metric);
        let quality = if !bounds.contains(raw.value) {
            tracing::debug!(
                "{} reading {} from {} outside plausible range [{}, {}]",
                metric,
                raw.value,
                raw.sensor_id,
                bounds.min,
                bounds.max
            );
            Quality::OutOfRange
        } else {
            reported_quality
        };

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let sample = Sample::new(raw.sensor_id, metric, raw.value, raw.timestamp, quality, sequence);

        if let Err(e) = self.buffer.enqueue(sample.clone()) {
            if matches!(e, IngestError::Backpressure { .. }) {
                tracing::debug!("Backpressure on {}: {}", sample.key(), e);
            }
            return Err(e);
        }
        self.cache.observe(&sample);

        Ok(Accepted { sequence, quality })
    }

    fn validate(&self, raw: &RawReading, now: DateTime<Utc>) -> Result<(Metric, Quality), String> {
        let sensor_id = raw.sensor_id.trim();
        if sensor_id.is_empty() {
            return Err("sensor id is empty".to_string());
        }
        if sensor_id.len() > MAX_SENSOR_ID_LEN || sensor_id.len() != raw.sensor_id.len() {
            return Err(format!(
                "sensor id must be at most {} characters without surrounding whitespace",
                MAX_SENSOR_ID_LEN
            ));
        }

        let metric: Metric = raw.metric.parse()?;

        if !raw.value.is_finite() {
            return Err(format!("value {} is not finite", raw.value));
        }

        // Stores keep nanosecond timestamps; anything outside that range cannot be written
        if raw.timestamp.timestamp_nanos_opt().is_none() {
            return Err(format!(
                "timestamp {} is outside the storable range",
                raw.timestamp.to_rfc3339()
            ));
        }

        let skew = chrono::Duration::milliseconds(self.settings.ingest_future_skew_ms as i64);
        if raw.timestamp > now + skew {
            return Err(format!(
                "timestamp {} is more than {}ms in the future",
                raw.timestamp.to_rfc3339(),
                self.settings.ingest_future_skew_ms
            ));
        }

        let quality = match raw.quality.as_deref() {
            None => Quality::Ok,
            Some(q) => q.parse::<Quality>()?,
        };

        Ok((metric, quality))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::sample_store::SampleStore;
    use crate::infrastructure::config::BufferSettings;
    use crate::infrastructure::connection_pool::ConnectionPool;
    use crate::infrastructure::memory_store::MemorySampleStore;
    use crate::infrastructure::overflow_log::OverflowLog;
    use crate::domain::sample::StreamKey;
    use chrono::TimeZone;
    use futures::TryStreamExt;
    use std::time::Duration;

    struct Harness {
        gateway: IngestionGateway,
        store: MemorySampleStore,
        cache: Arc<LastKnownCache>,
        handle: crate::application::sample_buffer::FlushHandle,
        _dir: tempfile::TempDir,
    }

    fn harness(high_water_mark: usize) -> Harness {
        let pool = Arc::new(ConnectionPool::new((), 4, Duration::from_secs(1)));
        let store = MemorySampleStore::new(pool, 1_000);
        let dir = tempfile::tempdir().unwrap();
        let overflow = Arc::new(OverflowLog::new(dir.path().join("overflow.jsonl")));
        let settings = BufferSettings {
            flush_batch_size: 500,
            backpressure_high_water_mark: high_water_mark,
            retry_max_attempts: 1,
            ..BufferSettings::default()
        };
        let (buffer, handle) = SampleBuffer::start(Arc::new(store.clone()), overflow, &settings);
        let cache = Arc::new(LastKnownCache::new());
        let gateway = IngestionGateway::new(buffer, cache.clone(), IngestSettings::default());
        Harness {
            gateway,
            store,
            cache,
            handle,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_nan_is_rejected_and_never_stored() {
        let h = harness(100);
        let err = h
            .gateway
            .submit(RawReading::new("sensor-1", "ph", f64::NAN, Utc::now()))
            .unwrap_err();
        assert!(matches!(err, IngestError::Validation { .. }));

        h.handle.shutdown().await;
        assert_eq!(h.store.sample_count(), 0);
        assert_eq!(h.cache.len(), 0);
    }

    #[tokio::test]
    async fn test_out_of_range_ph_is_stored_and_tagged() {
        let h = harness(100);
        let ts = Utc::now();
        let accepted = h
            .gateway
            .submit(RawReading::new("sensor-1", "pH", 15.0, ts))
            .unwrap();
        assert_eq!(accepted.quality, Quality::OutOfRange);

        h.handle.shutdown().await;
        let stored: Vec<Sample> = h
            .store
            .query_range("sensor-1", Metric::Ph, ts, ts + chrono::Duration::seconds(1))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].value, 15.0);
        assert_eq!(stored[0].quality, Quality::OutOfRange);
    }

    #[tokio::test]
    async fn test_rejects_unknown_metric_and_future_timestamp() {
        let h = harness(100);
        let now = Utc::now();

        let unknown = RawReading::new("sensor-1", "turbidity", 1.0, now);
        assert!(matches!(
            h.gateway.submit_at(unknown, now),
            Err(IngestError::Validation { .. })
        ));

        let future = RawReading::new("sensor-1", "ec", 2.0, now + chrono::Duration::minutes(6));
        assert!(matches!(
            h.gateway.submit_at(future, now),
            Err(IngestError::Validation { .. })
        ));

        // Inside the skew allowance is fine
        let slightly_ahead = RawReading::new("sensor-1", "ec", 2.0, now + chrono::Duration::minutes(4));
        assert!(h.gateway.submit_at(slightly_ahead, now).is_ok());

        h.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejects_timestamp_outside_storable_range() {
        let h = harness(100);
        let now = Utc::now();
        let ancient = Utc.with_ymd_and_hms(1500, 1, 1, 0, 0, 0).unwrap();

        let err = h
            .gateway
            .submit_at(RawReading::new("sensor-1", "ph", 6.0, ancient), now)
            .unwrap_err();
        assert!(matches!(err, IngestError::Validation { .. }));

        // A good reading in the same flush still lands
        h.gateway
            .submit_at(RawReading::new("sensor-1", "ph", 6.0, now), now)
            .unwrap();
        h.handle.shutdown().await;
        assert_eq!(h.store.sample_count(), 1);
        assert_eq!(h.cache.len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_blank_sensor_and_unknown_quality() {
        let h = harness(100);
        let now = Utc::now();
        assert!(h.gateway.submit(RawReading::new("  ", "ph", 6.0, now)).is_err());

        let mut reading = RawReading::new("sensor-1", "ph", 6.0, now);
        reading.quality = Some("great".to_string());
        assert!(h.gateway.submit(reading).is_err());

        let mut suspect = RawReading::new("sensor-1", "ph", 6.0, now);
        suspect.quality = Some("suspect".to_string());
        assert_eq!(h.gateway.submit(suspect).unwrap().quality, Quality::Suspect);

        h.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_backpressure_fails_fast() {
        let h = harness(2);
        let now = Utc::now();

        // Batch threshold is far above the high-water mark, so nothing drains
        assert!(h.gateway.submit(RawReading::new("s", "do", 8.0, now)).is_ok());
        assert!(h.gateway.submit(RawReading::new("s", "do", 8.1, now)).is_ok());
        let err = h.gateway.submit(RawReading::new("s", "do", 8.2, now)).unwrap_err();
        assert!(matches!(err, IngestError::Backpressure { .. }));

        // The refused reading is not cached either
        let cached = h.cache.get(&StreamKey::new("s", Metric::Do)).unwrap();
        assert_eq!(cached.value, 8.1);

        h.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_sequences_increase() {
        let h = harness(100);
        let now = Utc::now();
        let a = h.gateway.submit(RawReading::new("s", "orp", 320.0, now)).unwrap();
        let b = h.gateway.submit(RawReading::new("s", "orp", 321.0, now)).unwrap();
        assert!(b.sequence > a.sequence);
        h.handle.shutdown().await;
    }
}
