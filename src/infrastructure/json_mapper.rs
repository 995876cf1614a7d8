// Mapper to convert domain results to JSON wire types
use crate::application::ingestion_gateway::Accepted;
use crate::application::query_engine::LatestReading;
use crate::domain::query::{AggregatePoint, SensorSelector, SeriesResult, WindowQuery};
use crate::domain::sample::{Quality, Sample};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct LatestResponse {
    pub sensor_id: String,
    pub metric: &'static str,
    pub unit: &'static str,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub quality: Quality,
    pub stale: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SeriesBody {
    Raw { samples: Vec<SamplePoint> },
    Aggregated { points: Vec<AggregatePoint> },
}

#[derive(Debug, Serialize)]
pub struct SamplePoint {
    pub sensor_id: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub quality: Quality,
}

#[derive(Debug, Serialize)]
pub struct SeriesResponse {
    pub sensor: String,
    pub metric: &'static str,
    pub unit: &'static str,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub resolution: String,
    #[serde(flatten)]
    pub body: SeriesBody,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum IngestOutcome {
    Accepted { sequence: u64, quality: Quality },
    Rejected { reason: String },
    Backpressure { reason: String },
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub accepted: usize,
    pub rejected: usize,
    pub results: Vec<IngestOutcome>,
}

pub fn latest_to_json(reading: LatestReading) -> LatestResponse {
    let sample = reading.sample;
    LatestResponse {
        metric: sample.metric.as_str(),
        unit: sample.metric.unit(),
        sensor_id: sample.sensor_id,
        value: sample.value,
        timestamp: sample.timestamp,
        quality: sample.quality,
        stale: reading.stale,
    }
}

pub fn series_to_json(query: &WindowQuery, result: SeriesResult) -> SeriesResponse {
    let sensor = match &query.sensor {
        SensorSelector::One(id) => id.clone(),
        SensorSelector::All => "all".to_string(),
    };
    let body = match result {
        SeriesResult::Raw(samples) => SeriesBody::Raw {
            samples: samples.into_iter().map(sample_to_point).collect(),
        },
        SeriesResult::Aggregated(points) => SeriesBody::Aggregated { points },
    };

    SeriesResponse {
        sensor,
        metric: query.metric.as_str(),
        unit: query.metric.unit(),
        start: query.start,
        end: query.end,
        resolution: query.resolution.to_string(),
        body,
    }
}

pub fn outcome_accepted(accepted: Accepted) -> IngestOutcome {
    IngestOutcome::Accepted {
        sequence: accepted.sequence,
        quality: accepted.quality,
    }
}

fn sample_to_point(sample: Sample) -> SamplePoint {
    SamplePoint {
        sensor_id: sample.sensor_id,
        timestamp: sample.timestamp,
        value: sample.value,
        quality: sample.quality,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::query::Resolution;
    use crate::domain::sample::Metric;
    use chrono::TimeZone;

    #[test]
    fn test_series_json_shape() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let query = WindowQuery::new(
            SensorSelector::One("tank1".to_string()),
            Metric::Ec,
            start,
            start + chrono::Duration::hours(1),
            Resolution::Bucket(chrono::Duration::minutes(10)),
        );
        let points = vec![AggregatePoint {
            metric: Metric::Ec,
            bucket_start: start,
            avg: 2.2,
            min: 2.1,
            max: 2.3,
            count: 3,
        }];

        let json = serde_json::to_value(series_to_json(&query, SeriesResult::Aggregated(points))).unwrap();
        assert_eq!(json["kind"], "aggregated");
        assert_eq!(json["resolution"], "600s");
        assert_eq!(json["unit"], "mS/cm");
        assert_eq!(json["points"][0]["count"], 3);
    }

    #[test]
    fn test_ingest_outcome_tags() {
        let json = serde_json::to_value(IngestOutcome::Accepted {
            sequence: 4,
            quality: Quality::OutOfRange,
        })
        .unwrap();
        assert_eq!(json["status"], "accepted");
        assert_eq!(json["quality"], "out-of-range");
    }
}
