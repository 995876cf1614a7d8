// HTTP request handlers
use crate::application::errors::{IngestError, QueryError, StoreError};
use crate::domain::query::{Resolution, SensorSelector, WindowQuery};
use crate::domain::sample::{Metric, RawReading};
use crate::infrastructure::json_mapper::{
    latest_to_json, outcome_accepted, series_to_json, IngestOutcome, IngestResponse,
};
use crate::presentation::app_state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Default chart window, in hours, when the caller gives no start
const DEFAULT_HOURS: i64 = 6;
/// Default point budget per chart series
const MAX_POINTS_PER_SERIES: usize = 150;

#[derive(Deserialize)]
pub struct SeriesParams {
    pub sensor: Option<String>,
    pub metric: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub hours: Option<i64>,
    pub resolution: Option<String>,
    pub timeout_ms: Option<u64>,
}

/// Error body shared by every read path; status codes let the UI tell
/// "no data" (200 + empty list) apart from "data unavailable"
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        let status = match &err {
            QueryError::NotFound(_) => StatusCode::NOT_FOUND,
            QueryError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            QueryError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            QueryError::Store(StoreError::Malformed(_)) => StatusCode::BAD_GATEWAY,
            QueryError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!("Request failed with {}: {}", self.status, self.message);
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Health check endpoint, reporting buffer state and the overflow alert
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let buffer = state.buffer.snapshot();
    let status = if buffer.alert { "degraded" } else { "ok" };
    Json(json!({
        "status": status,
        "high_water_mark": state.buffer.high_water_mark(),
        "cached_streams": state.cache.len(),
        "buffer": buffer,
    }))
}

/// Accept a batch of device readings; each reading gets its own outcome
pub async fn ingest(
    State(state): State<Arc<AppState>>,
    Json(readings): Json<Vec<RawReading>>,
) -> Response {
    let mut results = Vec::with_capacity(readings.len());
    let mut accepted = 0;
    let mut saturated = false;

    for reading in readings {
        match state.gateway.submit(reading) {
            Ok(ok) => {
                accepted += 1;
                results.push(outcome_accepted(ok));
            }
            Err(e @ IngestError::Backpressure { .. }) | Err(e @ IngestError::Closed) => {
                saturated = true;
                results.push(IngestOutcome::Backpressure { reason: e.to_string() });
            }
            Err(e) => results.push(IngestOutcome::Rejected { reason: e.to_string() }),
        }
    }

    let body = IngestResponse {
        accepted,
        rejected: results.len() - accepted,
        results,
    };
    if saturated {
        // Device connectors back off and resend the refused readings
        (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::RETRY_AFTER, "1")],
            Json(body),
        )
            .into_response()
    } else {
        (StatusCode::OK, Json(body)).into_response()
    }
}

/// Latest reading of one sensor stream (dashboard cards)
pub async fn latest(
    Path((sensor, metric)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let metric: Metric = metric.parse().map_err(ApiError::bad_request)?;
    let reading = state.query_engine.latest(&sensor, metric).await?;
    Ok(Json(latest_to_json(reading)))
}

/// Windowed series for charts
pub async fn series(
    Query(params): Query<SeriesParams>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let deadline = match params.timeout_ms {
        Some(ms) => tokio::time::Instant::now()
            .checked_add(Duration::from_millis(ms))
            .ok_or_else(|| ApiError::bad_request(format!("timeout_ms {} is out of range", ms)))?,
        None => state.query_engine.default_deadline(),
    };
    let mut query = parse_window_query(params, Utc::now())?;
    query.resolution = state.query_engine.resolve(&query)?;

    let result = state.query_engine.series(&query, deadline).await?;
    Ok(Json(series_to_json(&query, result)))
}

fn parse_window_query(params: SeriesParams, now: DateTime<Utc>) -> Result<WindowQuery, ApiError> {
    let metric: Metric = params.metric.parse().map_err(ApiError::bad_request)?;
    let sensor = SensorSelector::parse(params.sensor.as_deref().unwrap_or("all"));
    let end = params.end.unwrap_or(now);
    let start = match params.start {
        Some(start) => start,
        None => {
            let hours = params.hours.unwrap_or(DEFAULT_HOURS);
            if hours <= 0 {
                return Err(ApiError::bad_request("hours must be positive"));
            }
            chrono::Duration::try_hours(hours)
                .and_then(|window| end.checked_sub_signed(window))
                .ok_or_else(|| ApiError::bad_request(format!("hours {} is out of range", hours)))?
        }
    };
    let resolution = match params.resolution.as_deref() {
        Some(r) => r.parse::<Resolution>().map_err(ApiError::bad_request)?,
        None => Resolution::Auto {
            max_points: MAX_POINTS_PER_SERIES,
        },
    };

    Ok(WindowQuery::new(sensor, metric, start, end, resolution))
}
