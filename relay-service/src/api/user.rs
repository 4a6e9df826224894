use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use energy_client::domain::{BillSetting, BillingPeriod, Channel, Device, FirmwareObject, NewDevice, Profile};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::{auth::Caller, device::DeviceQuery, error::ApiError, ApiJson, ApiQuery, AppState};
use crate::{
    overview::{device_listing, device_overview, DeviceListing, DeviceOverview},
    reset::ResetStatus,
};

#[derive(Deserialize)]
pub struct VoteRequest {
    device_id: String,
}

#[derive(Serialize)]
pub struct VoteResponse {
    success: bool,
    votes_received: i32,
    required_votes: i32,
    reset_triggered: bool,
}

pub async fn vote(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    ApiJson(req): ApiJson<VoteRequest>,
) -> Result<Json<VoteResponse>, ApiError> {
    let device_id = req.device_id.trim();
    if device_id.is_empty() {
        return Err(ApiError::Validation("device_id is required".to_string()));
    }

    let outcome = state.resets.vote(device_id, &user_id, OffsetDateTime::now_utc()).await?;
    Ok(Json(VoteResponse {
        success: true,
        votes_received: outcome.votes_received,
        required_votes: outcome.required_votes,
        reset_triggered: outcome.reset_triggered,
    }))
}

pub async fn reset_status(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    ApiQuery(query): ApiQuery<DeviceQuery>,
) -> Result<Json<ResetStatus>, ApiError> {
    let device_id = query.require()?;
    Ok(Json(
        state
            .resets
            .status(&device_id, &user_id, OffsetDateTime::now_utc())
            .await?,
    ))
}

pub async fn list_devices(
    State(state): State<AppState>,
    Caller(user_id): Caller,
) -> Result<Json<DeviceListing>, ApiError> {
    let devices = state.registry.devices(&user_id).await?;
    let snapshot = state.monitor.snapshot().await;
    Ok(Json(device_listing(devices, &snapshot)))
}

#[derive(Deserialize)]
pub struct RegisterRequest {
    device_id: String,
    device_name: String,
    channel_count: i32,
}

pub async fn register_device(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    ApiJson(req): ApiJson<RegisterRequest>,
) -> Result<(StatusCode, Json<Device>), ApiError> {
    let new_device = NewDevice {
        device_id: req.device_id.trim().to_string(),
        device_name: req.device_name.trim().to_string(),
        channel_count: req.channel_count,
        owner_id: user_id,
    };
    let device = state.registry.register(new_device, OffsetDateTime::now_utc()).await?;
    Ok((StatusCode::CREATED, Json(device)))
}

#[derive(Deserialize)]
pub struct RenameDevice {
    device_name: String,
}

pub async fn rename_device(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(device_id): Path<String>,
    ApiJson(req): ApiJson<RenameDevice>,
) -> Result<StatusCode, ApiError> {
    state.registry.rename(&device_id, &user_id, &req.device_name).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn remove_device(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(device_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.registry.remove(&device_id, &user_id).await? {
        state.relay.forget_device(&device_id).await;
        state.monitor.forget_device(&device_id).await;
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_channels(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(device_id): Path<String>,
) -> Result<Json<Vec<Channel>>, ApiError> {
    Ok(Json(state.registry.channels(&device_id, &user_id).await?))
}

#[derive(Deserialize)]
pub struct RenameChannel {
    custom_name: String,
}

pub async fn rename_channel(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path((device_id, channel_number)): Path<(String, i32)>,
    ApiJson(req): ApiJson<RenameChannel>,
) -> Result<StatusCode, ApiError> {
    state
        .registry
        .rename_channel(&device_id, channel_number, &user_id, &req.custom_name)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_bill(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(device_id): Path<String>,
) -> Result<Json<BillSetting>, ApiError> {
    Ok(Json(state.registry.bill(&device_id, &user_id).await?))
}

#[derive(Deserialize)]
pub struct BillUpdate {
    total_bill_amount: f64,
    #[serde(default)]
    billing_period: BillingPeriod,
}

pub async fn put_bill(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(device_id): Path<String>,
    ApiJson(req): ApiJson<BillUpdate>,
) -> Result<Json<BillSetting>, ApiError> {
    let setting = state
        .registry
        .set_bill(
            &device_id,
            &user_id,
            req.total_bill_amount,
            req.billing_period,
            OffsetDateTime::now_utc(),
        )
        .await?;
    Ok(Json(setting))
}

pub async fn overview(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(device_id): Path<String>,
) -> Result<Json<DeviceOverview>, ApiError> {
    let device = state.registry.assigned_device(&device_id, &user_id).await?;
    let channels = state.registry.channels(&device_id, &user_id).await?;
    let bill = state.registry.bill(&device_id, &user_id).await?;
    let readings = state.monitor.device_readings(&device_id).await;
    let snapshot = state.monitor.snapshot().await;

    Ok(Json(device_overview(device, &channels, bill, &readings, &snapshot)))
}

#[derive(Deserialize)]
pub struct ProfileUpdate {
    #[serde(default)]
    full_name: Option<String>,
}

pub async fn put_profile(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    ApiJson(req): ApiJson<ProfileUpdate>,
) -> Result<Json<Profile>, ApiError> {
    Ok(Json(state.registry.set_profile(&user_id, req.full_name).await?))
}

#[derive(Deserialize)]
pub struct UploadQuery {
    #[serde(default)]
    filename: Option<String>,
}

pub async fn upload_firmware(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(device_id): Path<String>,
    ApiQuery(query): ApiQuery<UploadQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<FirmwareObject>), ApiError> {
    let filename = query
        .filename
        .filter(|f| !f.trim().is_empty())
        .ok_or_else(|| ApiError::Validation("filename is required".to_string()))?;

    state.registry.assigned_device(&device_id, &user_id).await?;
    let object = state
        .ota
        .upload(&device_id, &filename, &body, OffsetDateTime::now_utc())
        .await?;
    Ok((StatusCode::CREATED, Json(object)))
}
