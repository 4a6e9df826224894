use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, FromRequest, FromRequestParts},
    middleware,
    routing::{get, patch, post},
    Router,
};

use crate::{monitor::Monitor, ota::OtaService, pubsub::PubSub, registry::Registry, relay::Relay, reset::ResetTracker};

pub mod auth;
pub mod device;
pub mod error;
pub mod realtime;
pub mod user;

pub use error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    pub resets: Arc<ResetTracker>,
    pub registry: Arc<Registry>,
    pub ota: Arc<OtaService>,
    pub monitor: Arc<Monitor>,
    pub bus: Arc<dyn PubSub>,
    pub device_token: Option<Arc<str>>,
}

/// JSON body whose rejections use the API error envelope.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiError))]
pub struct ApiQuery<T>(pub T);

pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    let device_routes = Router::new()
        .route("/ingest/energy", post(device::ingest_energy))
        .route("/devices/registration", get(device::registration))
        .route("/reset/check-reset", get(device::check_reset))
        .route("/ota/check", post(device::ota_check))
        .route("/ota/status", post(device::ota_status))
        .route("/firmware/:device_id/:filename", get(device::download_firmware))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::device_auth));

    let user_routes = Router::new()
        .route("/reset/vote", post(user::vote))
        .route("/reset/status", get(user::reset_status))
        .route("/devices", get(user::list_devices).post(user::register_device))
        .route("/devices/:device_id", patch(user::rename_device).delete(user::remove_device))
        .route("/devices/:device_id/channels", get(user::list_channels))
        .route("/devices/:device_id/channels/:channel_number", patch(user::rename_channel))
        .route("/devices/:device_id/bill", get(user::get_bill).put(user::put_bill))
        .route("/devices/:device_id/overview", get(user::overview))
        .route("/profile", axum::routing::put(user::put_profile))
        .route("/ota/:device_id/firmware", post(user::upload_firmware))
        .route("/realtime/:device_id", get(realtime::device_events));

    Router::new()
        .merge(device_routes)
        .merge(user_routes)
        .route("/health", get(|| async { "ok" }))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}
