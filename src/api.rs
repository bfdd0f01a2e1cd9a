//! Read only http view over what the workers stored.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::{
    rollup::Bucket,
    storage::{
        SqliteGateway, StorageError,
        sqlite::{StoredReading, StoredRollup},
    },
};

pub struct ApiState {
    pub db: SqliteGateway,
    /// max readings returned per sensor
    pub recent_limit: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct DataQuery {
    /// comma separated, every sensor when missing
    pub sensors: Option<String>,
}

#[derive(Debug)]
pub enum ApiError {
    UnknownBucket(String),
    Storage(StorageError),
}

impl From<StorageError> for ApiError {
    fn from(value: StorageError) -> Self {
        Self::Storage(value)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            Self::UnknownBucket(b) => (
                StatusCode::BAD_REQUEST,
                format!("unknown bucket `{b}`, expected daily, weekly or monthly"),
            ),
            Self::Storage(e) => {
                error!("api query: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        (status, Json(ErrorResponse { error })).into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/data", get(get_data))
        .route("/api/rollups/{bucket}/{sensor}", get(get_rollups))
        .with_state(Arc::new(state))
}

/// Readings newest first across the requested sensors.
pub async fn get_data(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<DataQuery>,
) -> Result<Json<Vec<StoredReading>>, ApiError> {
    let sensors: Vec<String> = query
        .sensors
        .as_deref()
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    if sensors.is_empty() {
        return Ok(Json(
            state.db.recent_readings(None, state.recent_limit).await?,
        ));
    }

    let mut readings = Vec::new();
    for sensor in sensors {
        readings.extend(
            state
                .db
                .recent_readings(Some(sensor), state.recent_limit)
                .await?,
        );
    }
    readings.sort_by(|a, b| b.processed_at.cmp(&a.processed_at));

    Ok(Json(readings))
}

pub async fn get_rollups(
    State(state): State<Arc<ApiState>>,
    Path((bucket, sensor)): Path<(String, String)>,
) -> Result<Json<Vec<StoredRollup>>, ApiError> {
    let bucket = Bucket::from_name(&bucket).ok_or(ApiError::UnknownBucket(bucket))?;
    Ok(Json(state.db.rollups(bucket, sensor).await?))
}
