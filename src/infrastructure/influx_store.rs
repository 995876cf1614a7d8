// InfluxDB store implementation (1.x-compatible HTTP API)
use crate::application::errors::StoreError;
use crate::application::sample_store::{SampleStore, SampleStream};
use crate::domain::sample::{Metric, Quality, Sample};
use crate::infrastructure::connection_pool::ConnectionPool;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use influxdb2::models::{DataPoint, WriteDataPoint};
use serde::Deserialize;
use std::sync::Arc;

/// One measurement; `sensor_id` and `metric` tags make one series per stream
const MEASUREMENT: &str = "hydro_sample";

#[derive(Debug, Clone)]
pub struct InfluxSampleStore {
    host: String,
    token: String,
    database: String,
    retention_policy: String,
    pool: Arc<ConnectionPool<reqwest::Client>>,
    page_size: usize,
}

#[derive(Debug, Deserialize)]
struct InfluxQLResponse {
    #[serde(default)]
    results: Vec<InfluxQLResult>,
}

#[derive(Debug, Deserialize)]
struct InfluxQLResult {
    #[serde(default)]
    series: Option<Vec<InfluxQLSeries>>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InfluxQLSeries {
    columns: Vec<String>,
    values: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, Copy)]
enum QueryMethod {
    Get,
    Post,
}

impl InfluxSampleStore {
    pub fn new(
        host: String,
        token: String,
        database: String,
        retention_policy: String,
        pool: Arc<ConnectionPool<reqwest::Client>>,
        page_size: usize,
    ) -> Self {
        Self {
            host: host.trim_end_matches('/').to_string(),
            token,
            database,
            retention_policy,
            pool,
            page_size: page_size.max(1),
        }
    }

    fn build_query_url(&self, query: &str) -> String {
        let encoded_query = urlencoding::encode(query);
        format!(
            "{}/query?db={}&rp={}&epoch=ns&q={}",
            self.host,
            urlencoding::encode(&self.database),
            urlencoding::encode(&self.retention_policy),
            encoded_query
        )
    }

    fn build_write_url(&self) -> String {
        format!(
            "{}/write?db={}&rp={}&precision=ns",
            self.host,
            urlencoding::encode(&self.database),
            urlencoding::encode(&self.retention_policy)
        )
    }

    async fn execute_query(&self, method: QueryMethod, query: &str) -> Result<InfluxQLResponse, StoreError> {
        let url = self.build_query_url(query);
        let client = self.pool.acquire().await?;

        let request = match method {
            QueryMethod::Get => client.get(&url),
            QueryMethod::Post => client.post(&url),
        };
        let response = request
            .header("Authorization", format!("Token {}", self.token))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let data = response
            .json::<InfluxQLResponse>()
            .await
            .map_err(|e| StoreError::Malformed(format!("failed to parse InfluxDB response: {}", e)))?;

        if let Some(result) = data.results.first() {
            if let Some(error) = &result.error {
                return Err(StoreError::Malformed(format!("InfluxDB query error: {}", error)));
            }
        }

        Ok(data)
    }

    fn stream_filter(sensor_id: &str, metric: Metric) -> String {
        format!(
            "sensor_id = '{}' AND metric = '{}'",
            escape_literal(sensor_id),
            metric.as_str()
        )
    }

    async fn fetch_page(
        &self,
        sensor_id: &str,
        metric: Metric,
        after: Option<DateTime<Utc>>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Sample>, StoreError> {
        let lower = match after {
            Some(ts) => format!("time > {}", to_nanos(ts)?),
            None => format!("time >= {}", to_nanos(start)?),
        };
        let query = format!(
            "SELECT value, quality, seq FROM {} WHERE {} AND {} AND time < {} ORDER BY time ASC LIMIT {}",
            MEASUREMENT,
            Self::stream_filter(sensor_id, metric),
            lower,
            to_nanos(end)?,
            self.page_size
        );
        let response = self.execute_query(QueryMethod::Get, &query).await?;
        parse_samples(&response, sensor_id, metric)
    }

    async fn count_before(&self, metric: Metric, cutoff_ns: i64) -> Result<u64, StoreError> {
        let query = format!(
            "SELECT COUNT(value) FROM {} WHERE metric = '{}' AND time < {}",
            MEASUREMENT,
            metric.as_str(),
            cutoff_ns
        );
        let response = self.execute_query(QueryMethod::Get, &query).await?;

        let count = response
            .results
            .first()
            .and_then(|r| r.series.as_ref())
            .and_then(|series| series.first())
            .and_then(|s| {
                let idx = s.columns.iter().position(|c| c == "count")?;
                s.values.first()?.get(idx)?.as_u64()
            })
            .unwrap_or(0);
        Ok(count)
    }
}

#[async_trait]
impl SampleStore for InfluxSampleStore {
    async fn append(&self, batch: &[Sample]) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        // The whole batch goes out as one line-protocol request
        let mut body: Vec<u8> = Vec::with_capacity(batch.len() * 96);
        for sample in batch {
            let point = DataPoint::builder(MEASUREMENT)
                .tag("sensor_id", sample.sensor_id.clone())
                .tag("metric", sample.metric.as_str().to_string())
                .field("value", sample.value)
                .field("quality", sample.quality.as_str().to_string())
                .field("seq", sample.sequence as i64)
                .timestamp(to_nanos(sample.timestamp)?)
                .build()
                .map_err(|e| StoreError::Malformed(format!("invalid data point: {}", e)))?;
            point
                .write_data_point_to(&mut body)
                .map_err(|e| StoreError::Malformed(format!("line protocol encoding failed: {}", e)))?;
            if body.last() != Some(&b'\n') {
                body.push(b'\n');
            }
        }

        let client = self.pool.acquire().await?;
        let response = client
            .post(self.build_write_url())
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        tracing::debug!("Wrote {} samples to InfluxDB", batch.len());
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
        let sensor_id = sensor_id.to_string();

        Box::pin(async_stream::try_stream! {
            let mut after: Option<DateTime<Utc>> = None;
            loop {
                let page = store.fetch_page(&sensor_id, metric, after, start, end).await?;
                let exhausted = page.len() < store.page_size;
                if let Some(last) = page.last() {
                    after = Some(last.timestamp);
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
        let query = format!(
            "SELECT value, quality, seq FROM {} WHERE {} ORDER BY time DESC LIMIT 1",
            MEASUREMENT,
            Self::stream_filter(sensor_id, metric)
        );
        let response = self.execute_query(QueryMethod::Get, &query).await?;
        Ok(parse_samples(&response, sensor_id, metric)?.into_iter().next())
    }

    async fn list_sensors(&self, metric: Metric) -> Result<Vec<String>, StoreError> {
        let query = format!(
            "SHOW TAG VALUES FROM {} WITH KEY = sensor_id WHERE metric = '{}'",
            MEASUREMENT,
            metric.as_str()
        );
        let response = self.execute_query(QueryMethod::Get, &query).await?;

        let mut sensors = Vec::new();
        if let Some(result) = response.results.first() {
            if let Some(series) = &result.series {
                for s in series {
                    for value_row in &s.values {
                        if let Some(sensor) = value_row.get(1).and_then(|v| v.as_str()) {
                            sensors.push(sensor.to_string());
                        }
                    }
                }
            }
        }
        sensors.sort();
        sensors.dedup();
        Ok(sensors)
    }

    async fn evict_before(&self, metric: Metric, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let cutoff_ns = to_nanos(cutoff)?;
        let doomed = self.count_before(metric, cutoff_ns).await?;
        if doomed == 0 {
            return Ok(0);
        }

        // Write-type statements must be POSTed
        let query = format!(
            "DELETE FROM {} WHERE metric = '{}' AND time < {}",
            MEASUREMENT,
            metric.as_str(),
            cutoff_ns
        );
        self.execute_query(QueryMethod::Post, &query).await?;
        Ok(doomed)
    }
}

fn to_nanos(ts: DateTime<Utc>) -> Result<i64, StoreError> {
    ts.timestamp_nanos_opt()
        .ok_or_else(|| StoreError::Malformed(format!("timestamp {} outside nanosecond range", ts)))
}

fn escape_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn classify_request_error(err: reqwest::Error) -> StoreError {
    if err.is_connect() {
        StoreError::Unavailable(format!("cannot reach InfluxDB: {}", err))
    } else {
        StoreError::Transient(format!("InfluxDB request failed: {}", err))
    }
}

fn classify_status(status: reqwest::StatusCode, body: &str) -> StoreError {
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        StoreError::Transient(format!("InfluxDB returned {}: {}", status, body))
    } else {
        StoreError::Malformed(format!("InfluxDB rejected request with {}: {}", status, body))
    }
}

fn parse_samples(
    response: &InfluxQLResponse,
    sensor_id: &str,
    metric: Metric,
) -> Result<Vec<Sample>, StoreError> {
    let mut samples = Vec::new();
    let Some(series_list) = response.results.first().and_then(|r| r.series.as_ref()) else {
        return Ok(samples);
    };

    for s in series_list {
        let column = |name: &str| s.columns.iter().position(|c| c == name);
        let time_idx = column("time").unwrap_or(0);
        let value_idx = column("value")
            .ok_or_else(|| StoreError::Malformed("response has no value column".to_string()))?;
        let quality_idx = column("quality");
        let seq_idx = column("seq");

        for row in &s.values {
            let (Some(time_ns), Some(value)) = (
                row.get(time_idx).and_then(|v| v.as_i64()),
                row.get(value_idx).and_then(|v| v.as_f64()),
            ) else {
                continue;
            };
            let quality = quality_idx
                .and_then(|idx| row.get(idx))
                .and_then(|v| v.as_str())
                .and_then(|q| q.parse::<Quality>().ok())
                .unwrap_or(Quality::Ok);
            let sequence = seq_idx
                .and_then(|idx| row.get(idx))
                .and_then(|v| v.as_u64())
                .unwrap_or(0);

            samples.push(Sample::new(
                sensor_id,
                metric,
                value,
                DateTime::from_timestamp_nanos(time_ns),
                quality,
                sequence,
            ));
        }
    }

    Ok(samples)
}
