// Last-known value per stream, used when the store cannot answer `latest`
use crate::domain::sample::{Metric, Sample, StreamKey};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Default)]
pub struct LastKnownCache {
    entries: RwLock<HashMap<StreamKey, Sample>>,
}

impl LastKnownCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep `sample` if it is more recent than what the stream already holds
    pub fn observe(&self, sample: &Sample) {
        let Ok(mut entries) = self.entries.write() else {
            return;
        };
        match entries.get(&sample.key()) {
            Some(current) if current.recency_cmp(sample) != Ordering::Less => {}
            _ => {
                entries.insert(sample.key(), sample.clone());
            }
        }
    }

    pub fn get(&self, key: &StreamKey) -> Option<Sample> {
        self.entries.read().ok()?.get(key).cloned()
    }

    /// Forget streams of `metric` whose last sample is older than `cutoff`;
    /// returns how many streams were dropped
    pub fn evict_before(&self, metric: Metric, cutoff: DateTime<Utc>) -> usize {
        let Ok(mut entries) = self.entries.write() else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|key, sample| key.metric != metric || sample.timestamp >= cutoff);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::sample::{Metric, Quality};
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_keeps_most_recent_by_timestamp() {
        let cache = LastKnownCache::new();
        let newer = Sample::new("t1", Metric::Ec, 2.2, Utc.timestamp_opt(20, 0).unwrap(), Quality::Ok, 1);
        let older = Sample::new("t1", Metric::Ec, 2.0, Utc.timestamp_opt(10, 0).unwrap(), Quality::Ok, 2);

        cache.observe(&newer);
        cache.observe(&older);

        let key = StreamKey::new("t1", Metric::Ec);
        assert_eq!(cache.get(&key).unwrap().value, 2.2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_evict_before_drops_expired_streams_of_metric() {
        let cache = LastKnownCache::new();
        let old = Utc.timestamp_opt(10, 0).unwrap();
        let fresh = Utc.timestamp_opt(100, 0).unwrap();
        cache.observe(&Sample::new("t1", Metric::Ph, 6.0, old, Quality::Ok, 1));
        cache.observe(&Sample::new("t2", Metric::Ph, 6.1, fresh, Quality::Ok, 2));
        cache.observe(&Sample::new("t1", Metric::Orp, 300.0, old, Quality::Ok, 3));

        let dropped = cache.evict_before(Metric::Ph, Utc.timestamp_opt(50, 0).unwrap());

        assert_eq!(dropped, 1);
        assert!(cache.get(&StreamKey::new("t1", Metric::Ph)).is_none());
        assert!(cache.get(&StreamKey::new("t2", Metric::Ph)).is_some());
        assert!(cache.get(&StreamKey::new("t1", Metric::Orp)).is_some());
    }

    #[test]
    fn test_streams_are_independent() {
        let cache = LastKnownCache::new();
        let ts = Utc.timestamp_opt(10, 0).unwrap();
        cache.observe(&Sample::new("t1", Metric::Ec, 2.0, ts, Quality::Ok, 1));
        cache.observe(&Sample::new("t1", Metric::Ph, 6.0, ts, Quality::Ok, 2));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&StreamKey::new("t2", Metric::Ec)).is_none());
    }
}
