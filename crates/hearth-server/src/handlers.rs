use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use hearth_core::{DeviceEvent, DeviceId, DeviceState, EventKind};
use hearth_engine::HistoryQuery;
use hearth_store::DeviceRecord;

use crate::error::ApiError;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterDeviceBody {
    pub name: String,
    pub brand: String,
    pub location: String,
}

#[derive(Debug, Deserialize)]
pub struct RecordEventBody {
    #[serde(flatten)]
    pub kind: EventKind,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    pub since: Option<i64>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl HistoryParams {
    fn into_query(self) -> Result<HistoryQuery, ApiError> {
        match (self.from, self.to) {
            (Some(from), Some(to)) => {
                if self.since.is_some() {
                    return Err(ApiError::BadRequest(
                        "since cannot be combined with from/to".into(),
                    ));
                }
                Ok(HistoryQuery::Range { from, to })
            }
            (None, None) => Ok(HistoryQuery::Since(self.since.unwrap_or(0))),
            _ => Err(ApiError::BadRequest(
                "from and to must be supplied together".into(),
            )),
        }
    }
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn register_device(
    State(state): State<AppState>,
    Json(body): Json<RegisterDeviceBody>,
) -> Result<(StatusCode, Json<DeviceRecord>), ApiError> {
    let record = state
        .service
        .register_device(&body.name, &body.brand, &body.location)?;
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn list_devices(
    State(state): State<AppState>,
) -> Result<Json<Vec<DeviceRecord>>, ApiError> {
    Ok(Json(state.service.list_devices()?))
}

pub async fn get_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeviceRecord>, ApiError> {
    let device_id = DeviceId::from_raw(id);
    Ok(Json(state.service.get_device(&device_id)?))
}

pub async fn delete_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let device_id = DeviceId::from_raw(id);
    state.service.delete_device(&device_id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn record_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RecordEventBody>,
) -> Result<(StatusCode, Json<DeviceEvent>), ApiError> {
    let device_id = DeviceId::from_raw(id);
    let event = state
        .service
        .record_event(&device_id, body.kind, body.occurred_at)?;
    Ok((StatusCode::CREATED, Json(event)))
}

pub async fn get_state(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeviceState>, ApiError> {
    let device_id = DeviceId::from_raw(id);
    Ok(Json(state.service.current_state(&device_id)?))
}

pub async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<DeviceEvent>>, ApiError> {
    let device_id = DeviceId::from_raw(id);
    let query = params.into_query()?;
    Ok(Json(state.service.history(&device_id, query)?))
}
