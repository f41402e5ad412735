//! SSE live-stream handlers bridging bus subscriptions to clients.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Extension, Path};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures_util::stream::{self, Stream};
use sonde_bus::{SubscribeOptions, Subscription};
use sonde_types::topics;

use crate::resource::{blocking, decode_id, ApiError};
use crate::AppState;

/// Demand window kept open for each SSE client. The stream re-requests
/// one unit per delivered event, so a stalled client stops receiving
/// (and starts dropping) rather than buffering without bound.
const SSE_DEMAND: u64 = 256;

fn sse_stream(sub: Subscription) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(sub, |mut sub| async move {
        let event = sub.recv().await?;
        sub.request(1);
        let item = match serde_json::to_string(&event) {
            Ok(data) => Event::default().data(data),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize bus event");
                Event::default().comment("serialization error")
            }
        };
        Some((Ok(item), sub))
    })
}

fn subscribe_sse(state: &AppState, topic: &str) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let sub = state
        .bus
        .subscribe(topic, SubscribeOptions::default().with_demand(SSE_DEMAND));
    Sse::new(sse_stream(sub)).keep_alive(KeepAlive::default())
}

/// Handler for `GET /systems/events`: global system lifecycle stream.
pub async fn registry_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> impl IntoResponse {
    subscribe_sse(&state, topics::REGISTRY)
}

/// Handler for `GET /systems/{id}/events`: one system's status topic.
pub async fn system_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let internal = decode_id(&state.ids.systems, &id)?;
    let lookup = state.clone();
    let uid = blocking(move || {
        Ok(lookup
            .db
            .systems()
            .current_version(internal)?
            .map(|(_, desc)| desc.uid().to_string()))
    })
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("system {id}")))?;

    Ok(subscribe_sse(&state, &topics::system_status(&uid)))
}

/// Handler for `GET /datastreams/{id}/events`: one stream's data topic.
pub async fn datastream_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let internal = decode_id(&state.ids.datastreams, &id)?;
    let lookup = state.clone();
    let topic = blocking(move || {
        let info = lookup
            .db
            .data_streams()
            .get(internal)?
            .ok_or_else(|| ApiError::NotFound(format!("data stream {id}")))?;
        let system = lookup
            .db
            .systems()
            .current_version(info.system_id)?
            .ok_or_else(|| ApiError::NotFound("owning system is gone".to_string()))?;
        Ok(topics::data_stream(system.1.uid(), &info.output_name))
    })
    .await?;

    Ok(subscribe_sse(&state, &topic))
}
