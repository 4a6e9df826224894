use std::{convert::Infallible, time::Duration};

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt};

use super::{auth::Caller, error::ApiError, AppState};
use crate::{
    error::ServiceError,
    pubsub::{device_topic, ENERGY_UPDATE_EVENT},
};

/// Server-sent `energy_update` events for one device.
pub async fn device_events(
    State(state): State<AppState>,
    _caller: Caller,
    Path(device_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if state.registry.registration(&device_id).await?.is_none() {
        return Err(ServiceError::DeviceNotFound(device_id).into());
    }

    let subscription = state.bus.subscribe(&device_topic(&device_id)).await;
    metrics::counter!("realtime_subscriptions_total").increment(1);
    tracing::debug!(device_id = %device_id, "realtime subscriber attached");

    let stream = async_stream::stream! {
        let mut subscription = subscription;
        while let Some(msg) = subscription.next().await {
            if msg.event != ENERGY_UPDATE_EVENT {
                continue;
            }
            yield Ok::<_, Infallible>(Event::default().event(msg.event).data(msg.payload.to_string()));
        }
        tracing::debug!(device_id = %device_id, "realtime subscription closed");
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}
