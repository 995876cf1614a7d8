// Sample domain model - one timestamped water-quality reading
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Ph,
    Ec,
    Do,
    Temperature,
    Orp,
}

impl Metric {
    pub const ALL: [Metric; 5] = [
        Metric::Ph,
        Metric::Ec,
        Metric::Do,
        Metric::Temperature,
        Metric::Orp,
    ];

    /// Stable lowercase key used in config maps, store tags and URLs
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Ph => "ph",
            Metric::Ec => "ec",
            Metric::Do => "do",
            Metric::Temperature => "temperature",
            Metric::Orp => "orp",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Metric::Ph => "pH",
            Metric::Ec => "mS/cm",
            Metric::Do => "mg/L",
            Metric::Temperature => "°C",
            Metric::Orp => "mV",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ph" => Ok(Metric::Ph),
            "ec" | "ec_mscm" => Ok(Metric::Ec),
            "do" | "do_mgl" => Ok(Metric::Do),
            "temperature" | "temp" | "temp_c" => Ok(Metric::Temperature),
            "orp" | "orp_mv" => Ok(Metric::Orp),
            other => Err(format!("unrecognized metric '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Quality {
    Ok,
    Suspect,
    OutOfRange,
}

impl Quality {
    /// Higher rank wins ties in `latest`
    pub fn rank(&self) -> u8 {
        match self {
            Quality::Ok => 2,
            Quality::Suspect => 1,
            Quality::OutOfRange => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Ok => "ok",
            Quality::Suspect => "suspect",
            Quality::OutOfRange => "out-of-range",
        }
    }
}

impl FromStr for Quality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ok" => Ok(Quality::Ok),
            "suspect" => Ok(Quality::Suspect),
            "out-of-range" | "out_of_range" => Ok(Quality::OutOfRange),
            other => Err(format!("unrecognized quality '{}'", other)),
        }
    }
}

/// Identifies one (sensor, metric) series
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    pub sensor_id: String,
    pub metric: Metric,
}

impl StreamKey {
    pub fn new(sensor_id: impl Into<String>, metric: Metric) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            metric,
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.sensor_id, self.metric)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub sensor_id: String,
    pub metric: Metric,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub quality: Quality,
    /// Ingestion order assigned by the gateway
    pub sequence: u64,
}

impl Sample {
    pub fn new(
        sensor_id: impl Into<String>,
        metric: Metric,
        value: f64,
        timestamp: DateTime<Utc>,
        quality: Quality,
        sequence: u64,
    ) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            metric,
            value,
            timestamp,
            quality,
            sequence,
        }
    }

    pub fn key(&self) -> StreamKey {
        StreamKey::new(self.sensor_id.clone(), self.metric)
    }

    /// Ordering used to pick the latest sample of a stream:
    /// timestamp, then quality rank, then most recently inserted.
    pub fn recency_cmp(&self, other: &Sample) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.quality.rank().cmp(&other.quality.rank()))
            .then_with(|| self.sequence.cmp(&other.sequence))
    }
}

/// Pick the most recent sample among candidates using `Sample::recency_cmp`
pub fn pick_latest<I>(candidates: I) -> Option<Sample>
where
    I: IntoIterator<Item = Sample>,
{
    candidates.into_iter().max_by(|a, b| a.recency_cmp(b))
}

/// Reading as submitted by a device connector, before validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawReading {
    pub sensor_id: String,
    pub metric: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub quality: Option<String>,
}

impl RawReading {
    pub fn new(
        sensor_id: impl Into<String>,
        metric: impl Into<String>,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            metric: metric.into(),
            value,
            timestamp,
            quality: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_metric_parsing() {
        assert_eq!("pH".parse::<Metric>().unwrap(), Metric::Ph);
        assert_eq!("EC_mScm".parse::<Metric>().unwrap(), Metric::Ec);
        assert_eq!("temp".parse::<Metric>().unwrap(), Metric::Temperature);
        assert_eq!(" ORP ".parse::<Metric>().unwrap(), Metric::Orp);
        assert!("turbidity".parse::<Metric>().is_err());
    }

    #[test]
    fn test_pick_latest_prefers_timestamp() {
        let older = Sample::new("s1", Metric::Ph, 6.0, at(10), Quality::Ok, 5);
        let newer = Sample::new("s1", Metric::Ph, 6.1, at(20), Quality::OutOfRange, 1);
        let latest = pick_latest(vec![older, newer.clone()]).unwrap();
        assert_eq!(latest, newer);
    }

    #[test]
    fn test_pick_latest_tie_breaks_on_quality_then_sequence() {
        let suspect = Sample::new("s1", Metric::Ph, 6.0, at(10), Quality::Suspect, 9);
        let ok_old = Sample::new("s1", Metric::Ph, 6.1, at(10), Quality::Ok, 1);
        let ok_new = Sample::new("s1", Metric::Ph, 6.2, at(10), Quality::Ok, 2);

        let latest = pick_latest(vec![ok_new.clone(), suspect, ok_old]).unwrap();
        assert_eq!(latest, ok_new);
    }

    #[test]
    fn test_pick_latest_empty() {
        assert!(pick_latest(Vec::new()).is_none());
    }
}
