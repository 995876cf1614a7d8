use crate::domain::sample::Metric;
use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct HydroConfig {
    pub server: ServerSettings,
    pub store: StoreSettings,
    pub buffer: BufferSettings,
    pub ingest: IngestSettings,
    pub query: QuerySettings,
    pub retention: RetentionSettings,
    pub overflow: OverflowSettings,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Influx,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub influx: InfluxSettings,
    pub pool_size: usize,
    pub acquire_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub page_size: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            influx: InfluxSettings::default(),
            pool_size: 5,
            acquire_timeout_ms: 1_000,
            request_timeout_ms: 10_000,
            page_size: 5_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct InfluxSettings {
    pub host: String,
    pub token: String,
    pub database: String,
    pub retention_policy: String,
}

impl Default for InfluxSettings {
    fn default() -> Self {
        Self {
            host: "http://localhost:8086".to_string(),
            token: String::new(),
            database: "hydro".to_string(),
            retention_policy: "autogen".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BufferSettings {
    pub flush_batch_size: usize,
    pub flush_interval_ms: u64,
    pub backpressure_high_water_mark: usize,
    pub retry_max_attempts: u32,
    pub retry_backoff_base_ms: u64,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            flush_batch_size: 500,
            flush_interval_ms: 2_000,
            backpressure_high_water_mark: 10_000,
            retry_max_attempts: 5,
            retry_backoff_base_ms: 200,
        }
    }
}

impl BufferSettings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn retry_backoff_base(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_base_ms)
    }
}

/// Inclusive plausibility range for one metric
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IngestSettings {
    pub ingest_future_skew_ms: u64,
    pub plausibility: HashMap<Metric, Bounds>,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            ingest_future_skew_ms: 5 * 60 * 1_000,
            plausibility: default_plausibility(),
        }
    }
}

impl IngestSettings {
    /// Configured bounds for a metric, falling back to the physical defaults
    pub fn bounds_for(&self, metric: Metric) -> Bounds {
        self.plausibility
            .get(&metric)
            .copied()
            .unwrap_or_else(|| default_bounds(metric))
    }
}

fn default_bounds(metric: Metric) -> Bounds {
    match metric {
        Metric::Ph => Bounds::new(0.0, 14.0),
        Metric::Ec => Bounds::new(0.0, 20.0),
        Metric::Do => Bounds::new(0.0, 20.0),
        Metric::Temperature => Bounds::new(-5.0, 50.0),
        Metric::Orp => Bounds::new(-2000.0, 2000.0),
    }
}

fn default_plausibility() -> HashMap<Metric, Bounds> {
    Metric::ALL
        .iter()
        .map(|m| (*m, default_bounds(*m)))
        .collect()
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QuerySettings {
    /// Allowed bucket widths in seconds per metric; empty or missing allows any width
    pub bucket_durations: HashMap<Metric, Vec<u64>>,
    pub default_deadline_ms: u64,
}

impl Default for QuerySettings {
    fn default() -> Self {
        let chart_buckets = vec![60, 300, 600, 3_600, 21_600, 86_400];
        Self {
            bucket_durations: Metric::ALL
                .iter()
                .map(|m| (*m, chart_buckets.clone()))
                .collect(),
            default_deadline_ms: 5_000,
        }
    }
}

impl QuerySettings {
    pub fn buckets_for(&self, metric: Metric) -> Vec<chrono::Duration> {
        let mut secs = self
            .bucket_durations
            .get(&metric)
            .cloned()
            .unwrap_or_default();
        secs.sort_unstable();
        secs.dedup();
        secs.into_iter()
            .map(|s| chrono::Duration::seconds(s as i64))
            .collect()
    }

    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.default_deadline_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetentionSettings {
    /// Retention window in hours per metric; metrics without an entry are kept forever
    pub retention_by_metric: HashMap<Metric, u64>,
    pub sweep_interval_ms: u64,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            retention_by_metric: Metric::ALL.iter().map(|m| (*m, 24 * 90)).collect(),
            sweep_interval_ms: 10 * 60 * 1_000,
        }
    }
}

impl RetentionSettings {
    pub fn retention_for(&self, metric: Metric) -> Option<chrono::Duration> {
        self.retention_by_metric
            .get(&metric)
            .map(|hours| chrono::Duration::hours(*hours as i64))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OverflowSettings {
    pub path: String,
}

impl Default for OverflowSettings {
    fn default() -> Self {
        Self {
            path: "data/overflow.jsonl".to_string(),
        }
    }
}

/// Load `config/hydro.toml` (optional) overlaid with `HYDRO__*` environment variables
pub fn load_hydro_config() -> anyhow::Result<HydroConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name("config/hydro").required(false))
        .add_source(
            config::Environment::with_prefix("HYDRO")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Failed to read configuration sources")?;

    let config: HydroConfig = settings
        .try_deserialize()
        .context("Failed to parse configuration")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &HydroConfig) -> anyhow::Result<()> {
    if config.buffer.flush_batch_size == 0 {
        anyhow::bail!("buffer.flush_batch_size must be positive");
    }
    if config.buffer.backpressure_high_water_mark < config.buffer.flush_batch_size {
        anyhow::bail!("buffer.backpressure_high_water_mark must be at least flush_batch_size");
    }
    if config.buffer.flush_interval_ms == 0 {
        anyhow::bail!("buffer.flush_interval_ms must be positive");
    }
    if config.retention.sweep_interval_ms == 0 {
        anyhow::bail!("retention.sweep_interval_ms must be positive");
    }
    if config.store.pool_size == 0 {
        anyhow::bail!("store.pool_size must be positive");
    }
    for (metric, bounds) in &config.ingest.plausibility {
        if bounds.min > bounds.max {
            anyhow::bail!("ingest.plausibility.{} has min above max", metric);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_surface() {
        let config = HydroConfig::default();
        assert_eq!(config.buffer.flush_batch_size, 500);
        assert_eq!(config.buffer.flush_interval_ms, 2_000);
        assert_eq!(config.ingest.ingest_future_skew_ms, 300_000);
        assert_eq!(config.ingest.bounds_for(Metric::Ph), Bounds::new(0.0, 14.0));
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_toml_overrides() {
        let toml = r#"
            [buffer]
            flush_batch_size = 100
            backpressure_high_water_mark = 1000

            [ingest.plausibility]
            ph = { min = 4.0, max = 9.0 }

            [query.bucket_durations]
            ph = [600, 60]

            [retention.retention_by_metric]
            orp = 48
        "#;
        let config: HydroConfig = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.buffer.flush_batch_size, 100);
        assert_eq!(config.buffer.flush_interval_ms, 2_000);
        assert_eq!(config.ingest.bounds_for(Metric::Ph), Bounds::new(4.0, 9.0));
        assert_eq!(config.ingest.bounds_for(Metric::Ec), Bounds::new(0.0, 20.0));
        assert_eq!(
            config.query.buckets_for(Metric::Ph),
            vec![chrono::Duration::seconds(60), chrono::Duration::seconds(600)]
        );
        assert_eq!(
            config.retention.retention_for(Metric::Orp),
            Some(chrono::Duration::hours(48))
        );
        assert_eq!(config.retention.retention_for(Metric::Ph), None);
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let mut config = HydroConfig::default();
        config
            .ingest
            .plausibility
            .insert(Metric::Ph, Bounds::new(14.0, 0.0));
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let mut config = HydroConfig::default();
        config.buffer.flush_interval_ms = 0;
        assert!(validate(&config).is_err());

        let mut config = HydroConfig::default();
        config.retention.sweep_interval_ms = 0;
        assert!(validate(&config).is_err());
    }
}
