//! Data-stream collection handlers.

use std::sync::Arc;

use axum::extract::{Extension, Path, RawQuery};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use sonde_datastore::StreamUpdate;
use sonde_types::{DataComponent, DataStreamInfo, InternalId, RecordEncoding};

use crate::params;
use crate::resource::{
    apply_select, blocking, decode_id, paginate, require_json, ApiError, Collection, Paging,
    QueryParams,
};
use crate::{AppState, IdCodecs};

/// Serialized data-stream entry.
pub(crate) fn stream_json(
    codecs: &IdCodecs,
    id: InternalId,
    info: &DataStreamInfo,
) -> serde_json::Value {
    serde_json::json!({
        "id": codecs.datastreams.encode(id),
        "system": codecs.systems.encode(info.system_id),
        "outputName": info.output_name,
        "recordSchema": info.record_schema,
        "recordEncoding": info.record_encoding,
        "validTime": info.valid_time.to_iso(),
        "phenomenonTimeRange": info.observed_time_range.map(|r| {
            serde_json::json!({ "begin": r.begin.to_iso(), "end": r.end.to_iso() })
        }),
        "resultTimeRange": info.result_time_range.map(|r| {
            serde_json::json!({ "begin": r.begin.to_iso(), "end": r.end.to_iso() })
        }),
    })
}

/// Handler for `GET /datastreams`.
pub async fn list_handler(
    Extension(state): Extension<Arc<AppState>>,
    RawQuery(raw): RawQuery,
) -> Result<Json<Collection<serde_json::Value>>, ApiError> {
    let q = QueryParams::parse(raw.as_deref())?;
    q.check_format()?;
    let paging = Paging::from_query(&q)?;
    let filter = params::datastream_filter(&q, &state.ids.datastreams, &state.ids.systems)?;
    let select = q.select_fields();
    let codecs = state.ids;

    let items = blocking(move || {
        let streams = state.db.data_streams().select_entries(&filter)?;
        Ok(streams
            .iter()
            .skip(paging.offset)
            .take(paging.fetch_count())
            .map(|(id, info)| stream_json(&codecs, *id, info))
            .collect::<Vec<_>>())
    })
    .await?;

    let mut page = paginate(items, paging, "/datastreams");
    if let Some(fields) = &select {
        for item in &mut page.items {
            apply_select(item, fields);
        }
    }
    Ok(Json(page))
}

/// Handler for `GET /datastreams/count`.
pub async fn count_handler(
    Extension(state): Extension<Arc<AppState>>,
    RawQuery(raw): RawQuery,
) -> Result<Json<serde_json::Value>, ApiError> {
    let q = QueryParams::parse(raw.as_deref())?;
    let filter = params::datastream_filter(&q, &state.ids.datastreams, &state.ids.systems)?;
    let count = blocking(move || Ok(state.db.data_streams().count_matching(&filter)?)).await?;
    Ok(Json(serde_json::json!({ "count": count })))
}

/// Handler for `GET /datastreams/{id}`.
pub async fn get_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let internal = decode_id(&state.ids.datastreams, &id)?;
    let codecs = state.ids;
    let info = blocking(move || {
        state
            .db
            .data_streams()
            .get(internal)?
            .ok_or_else(|| ApiError::NotFound(format!("data stream {id}")))
    })
    .await?;
    Ok(Json(stream_json(&codecs, internal, &info)))
}

/// Incoming stream update body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamBody {
    pub output_name: String,
    pub record_schema: DataComponent,
    #[serde(default)]
    pub record_encoding: RecordEncoding,
}

/// Handler for `PUT /datastreams/{id}`.
///
/// Metadata and compatible structure changes update in place; an
/// incompatible structure starts a new stream version, reported in the
/// response so the caller learns the new ID.
pub async fn put_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<StreamBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_json(&headers)?;
    let internal = decode_id(&state.ids.datastreams, &id)?;
    let codecs = state.ids;

    let (outcome, new_id) = blocking(move || {
        let streams = state.db.data_streams();
        let existing = streams
            .get(internal)?
            .ok_or_else(|| ApiError::NotFound(format!("data stream {id}")))?;
        let mut info = existing.clone();
        info.output_name = body.output_name;
        info.record_schema = body.record_schema;
        info.record_encoding = body.record_encoding;
        match streams.update(internal, info)? {
            StreamUpdate::Unchanged => Ok(("unchanged", internal)),
            StreamUpdate::Updated => Ok(("updated", internal)),
            StreamUpdate::NewVersion(new_id) => Ok(("newVersion", new_id)),
        }
    })
    .await?;

    Ok(Json(serde_json::json!({
        "outcome": outcome,
        "id": codecs.datastreams.encode(new_id),
    })))
}

/// Handler for `DELETE /datastreams/{id}`.
pub async fn delete_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let internal = decode_id(&state.ids.datastreams, &id)?;
    let removed = blocking(move || Ok(state.db.data_streams().remove(internal)?)).await?;
    if !removed {
        return Err(ApiError::NotFound(format!("data stream {id}")));
    }
    Ok(StatusCode::NO_CONTENT)
}
