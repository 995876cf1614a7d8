// Query domain models - window queries, buckets and aggregate points
use super::sample::{Metric, Sample};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorSelector {
    One(String),
    All,
}

impl SensorSelector {
    pub fn parse(s: &str) -> Self {
        match s {
            "all" | "*" => SensorSelector::All,
            id => SensorSelector::One(id.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Raw,
    Bucket(Duration),
    /// Let the engine choose a configured bucket so at most `max_points` come back
    Auto { max_points: usize },
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Raw => f.write_str("raw"),
            Resolution::Bucket(d) => write!(f, "{}s", d.num_seconds()),
            Resolution::Auto { max_points } => write!(f, "auto:{}", max_points),
        }
    }
}

impl FromStr for Resolution {
    type Err = String;

    /// Accepts "raw", "auto:<max_points>" or a bucket width in seconds ("600" or "600s")
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("raw") {
            return Ok(Resolution::Raw);
        }
        if let Some(points) = s.strip_prefix("auto:") {
            let max_points: usize = points
                .parse()
                .map_err(|_| format!("invalid max points '{}'", points))?;
            if max_points == 0 {
                return Err("max points must be positive".to_string());
            }
            return Ok(Resolution::Auto { max_points });
        }
        let secs: i64 = s
            .strip_suffix('s')
            .unwrap_or(s)
            .parse()
            .map_err(|_| format!("invalid resolution '{}'", s))?;
        if secs <= 0 {
            return Err("bucket duration must be positive".to_string());
        }
        let width = Duration::try_seconds(secs)
            .ok_or_else(|| format!("bucket duration {}s is too large", secs))?;
        Ok(Resolution::Bucket(width))
    }
}

#[derive(Debug, Clone)]
pub struct WindowQuery {
    pub sensor: SensorSelector,
    pub metric: Metric,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub resolution: Resolution,
}

impl WindowQuery {
    pub fn new(
        sensor: SensorSelector,
        metric: Metric,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        resolution: Resolution,
    ) -> Self {
        Self {
            sensor,
            metric,
            start,
            end,
            resolution,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatePoint {
    pub metric: Metric,
    pub bucket_start: DateTime<Utc>,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SeriesResult {
    Raw(Vec<Sample>),
    Aggregated(Vec<AggregatePoint>),
}

impl SeriesResult {
    pub fn is_empty(&self) -> bool {
        match self {
            SeriesResult::Raw(samples) => samples.is_empty(),
            SeriesResult::Aggregated(points) => points.is_empty(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SeriesResult::Raw(samples) => samples.len(),
            SeriesResult::Aggregated(points) => points.len(),
        }
    }
}

/// Start of the epoch-aligned bucket containing `ts`
pub fn bucket_start(ts: DateTime<Utc>, width: Duration) -> DateTime<Utc> {
    let width_ms = width.num_milliseconds().max(1);
    let aligned = ts.timestamp_millis().div_euclid(width_ms) * width_ms;
    DateTime::from_timestamp_millis(aligned).unwrap_or(ts)
}
