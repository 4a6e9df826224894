use axum::{
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use energy_client::domain::Sample;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::{error::ApiError, ApiJson, ApiQuery, AppState};
use crate::{
    ota::{OtaCheck, OtaStatusReport},
    reset::PollOutcome,
};

#[derive(Deserialize)]
pub struct IncomingSample {
    device_id: String,
    channel_number: i32,
    #[serde(default)]
    current: f64,
    #[serde(default)]
    power: f64,
    #[serde(default, alias = "energy")]
    energy_wh: f64,
}

impl From<IncomingSample> for Sample {
    fn from(i: IncomingSample) -> Self {
        Sample {
            device_id: i.device_id,
            channel_number: i.channel_number,
            current: i.current,
            power: i.power,
            energy_wh: i.energy_wh,
        }
    }
}

#[derive(Serialize)]
pub struct IngestResponse {
    success: bool,
    message: &'static str,
    calculated_cost: f64,
}

pub async fn ingest_energy(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<IncomingSample>,
) -> Result<Json<IngestResponse>, ApiError> {
    metrics::counter!("http_ingest_requests_total").increment(1);

    let reading = state.relay.ingest(payload.into(), OffsetDateTime::now_utc()).await?;
    Ok(Json(IngestResponse {
        success: true,
        message: "Data received and broadcasted",
        calculated_cost: reading.cost,
    }))
}

#[derive(Deserialize)]
pub struct DeviceQuery {
    #[serde(default)]
    device_id: Option<String>,
}

impl DeviceQuery {
    pub fn require(self) -> Result<String, ApiError> {
        self.device_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ApiError::Validation("device_id is required".to_string()))
    }
}

#[derive(Serialize)]
pub struct RegistrationResponse {
    registered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel_count: Option<i32>,
    message: &'static str,
}

pub async fn registration(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<DeviceQuery>,
) -> Result<Json<RegistrationResponse>, ApiError> {
    let device_id = query.require()?;

    let response = match state.registry.registration(&device_id).await? {
        Some(device) => RegistrationResponse {
            registered: true,
            device_id: Some(device.device_id),
            device_name: Some(device.device_name),
            channel_count: Some(device.channel_count),
            message: "Device is registered",
        },
        None => RegistrationResponse {
            registered: false,
            device_id: None,
            device_name: None,
            channel_count: None,
            message: "Device not registered",
        },
    };
    Ok(Json(response))
}

pub async fn check_reset(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<DeviceQuery>,
) -> Result<Json<PollOutcome>, ApiError> {
    let device_id = query.require()?;
    Ok(Json(state.resets.poll(&device_id).await?))
}

#[derive(Deserialize)]
pub struct OtaCheckRequest {
    device_id: String,
    #[serde(default)]
    current_firmware_version: Option<String>,
}

pub async fn ota_check(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<OtaCheckRequest>,
) -> Result<Json<OtaCheck>, ApiError> {
    let check = state
        .ota
        .check(req.device_id.trim(), req.current_firmware_version.as_deref())
        .await?;
    Ok(Json(check))
}

#[derive(Serialize)]
pub struct Ack {
    success: bool,
    message: &'static str,
}

pub async fn ota_status(
    State(state): State<AppState>,
    ApiJson(report): ApiJson<OtaStatusReport>,
) -> Result<Json<Ack>, ApiError> {
    state.ota.report_status(report, OffsetDateTime::now_utc()).await?;
    Ok(Json(Ack {
        success: true,
        message: "Status updated",
    }))
}

pub async fn download_firmware(
    State(state): State<AppState>,
    Path((device_id, filename)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let bytes = state.ota.firmware().read(&device_id, &filename).await?;
    metrics::counter!("firmware_downloads_total").increment(1);

    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{filename}\"")),
        ],
        bytes,
    )
        .into_response())
}
