// Retention sweeper - age-based eviction per metric
use crate::application::errors::StoreError;
use crate::application::last_known_cache::LastKnownCache;
use crate::application::sample_store::SampleStore;
use crate::domain::sample::Metric;
use crate::infrastructure::config::RetentionSettings;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const MIN_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

#[derive(Clone)]
pub struct RetentionService {
    store: Arc<dyn SampleStore>,
    cache: Arc<LastKnownCache>,
    settings: RetentionSettings,
}

impl RetentionService {
    pub fn new(store: Arc<dyn SampleStore>, cache: Arc<LastKnownCache>, settings: RetentionSettings) -> Self {
        Self {
            store,
            cache,
            settings,
        }
    }

    /// One pass over every metric with a retention window. A failing metric is
    /// logged and does not stop the others.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Vec<(Metric, Result<u64, StoreError>)> {
        let mut outcomes = Vec::new();
        for metric in Metric::ALL {
            let Some(window) = self.settings.retention_for(metric) else {
                continue;
            };
            let cutoff = now - window;
            let result = self.store.evict_before(metric, cutoff).await;
            if result.is_ok() {
                // Expired values must not resurface through `latest`
                let dropped = self.cache.evict_before(metric, cutoff);
                if dropped > 0 {
                    tracing::debug!("Retention dropped {} cached {} streams", dropped, metric);
                }
            }
            match &result {
                Ok(0) => {}
                Ok(removed) => tracing::info!(
                    "Retention removed {} {} samples older than {}",
                    removed,
                    metric,
                    cutoff.to_rfc3339()
                ),
                Err(e) => tracing::warn!("Retention sweep for {} failed: {}", metric, e),
            }
            outcomes.push((metric, result));
        }
        outcomes
    }

    /// Run `sweep` on the configured interval until `stop` flips to true
    pub fn spawn(self, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.sweep_interval().max(MIN_SWEEP_INTERVAL));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep(Utc::now()).await;
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("Retention sweeper stopped");
        })
    }
}
