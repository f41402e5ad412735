//! Observation collection handlers.

use std::sync::Arc;

use axum::extract::{Extension, Path, RawQuery};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use sonde_datastore::filter::{DataStreamFilter, ObsFilter};
use sonde_datastore::ObsKey;
use sonde_types::{topics, DataBlock, DataEvent, HubEvent, ObsData, Timestamp};

use crate::params;
use crate::resource::{
    apply_select, blocking, decode_id, one_or_many, paginate, require_json, ApiError, Collection,
    Paging, QueryParams,
};
use crate::{AppState, IdCodecs};

fn obs_json(codecs: &IdCodecs, key: &ObsKey, data: &ObsData) -> serde_json::Value {
    serde_json::json!({
        "id": codecs.obs.encode_pair(key.series_id, key.phenomenon_time),
        "datastream": codecs.datastreams.encode(data.data_stream_id),
        "foi": (data.foi_id > 0).then(|| codecs.fois.encode(data.foi_id)),
        "phenomenonTime": data.phenomenon_time.to_iso(),
        "resultTime": data.result_time.to_iso(),
        "result": data.result,
        "parameters": data.parameters,
    })
}

/// Shared list plumbing for every observation route.
pub(crate) async fn list_page(
    state: Arc<AppState>,
    q: QueryParams,
    filter: ObsFilter,
    base_path: String,
) -> Result<Json<Collection<serde_json::Value>>, ApiError> {
    q.check_format()?;
    let paging = Paging::from_query(&q)?;
    let time_ordered = matches!(q.get("order"), Some("phenomenonTime") | Some("time"));
    let select = q.select_fields();
    let codecs = state.ids;

    let items = blocking(move || {
        let store = state.db.observations();
        let entries = if time_ordered {
            store.select_entries_time_ordered(&filter)?
        } else {
            store.select_entries(&filter)?
        };
        let mut out = Vec::new();
        let mut skipped = 0;
        for entry in entries {
            let (key, data) = entry?;
            if skipped < paging.offset {
                skipped += 1;
                continue;
            }
            out.push(obs_json(&codecs, &key, &data));
            if out.len() >= paging.fetch_count() {
                break;
            }
        }
        Ok(out)
    })
    .await?;

    let mut page = paginate(items, paging, &base_path);
    if let Some(fields) = &select {
        for item in &mut page.items {
            apply_select(item, fields);
        }
    }
    Ok(Json(page))
}

/// Handler for `GET /observations`.
pub async fn list_handler(
    Extension(state): Extension<Arc<AppState>>,
    RawQuery(raw): RawQuery,
) -> Result<Json<Collection<serde_json::Value>>, ApiError> {
    let q = QueryParams::parse(raw.as_deref())?;
    let filter = params::obs_filter(&q, &state.ids.datastreams, &state.ids.fois)?;
    list_page(state, q, filter, "/observations".to_string()).await
}

/// Handler for `GET /observations/count`.
pub async fn count_handler(
    Extension(state): Extension<Arc<AppState>>,
    RawQuery(raw): RawQuery,
) -> Result<Json<serde_json::Value>, ApiError> {
    let q = QueryParams::parse(raw.as_deref())?;
    let filter = params::obs_filter(&q, &state.ids.datastreams, &state.ids.fois)?;
    let count = blocking(move || Ok(state.db.observations().count_matching(&filter)?)).await?;
    Ok(Json(serde_json::json!({ "count": count })))
}

/// Handler for `GET /observations/{id}`.
pub async fn get_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (series_id, phenomenon_time) = state
        .ids
        .obs
        .decode_pair(&id)
        .ok_or_else(|| ApiError::NotFound(format!("no such observation: {id}")))?;
    let key = ObsKey {
        series_id,
        phenomenon_time,
    };
    let codecs = state.ids;
    let data = blocking(move || {
        state
            .db
            .observations()
            .get(key)?
            .ok_or_else(|| ApiError::NotFound(format!("observation {id}")))
    })
    .await?;
    Ok(Json(obs_json(&codecs, &key, &data)))
}

/// Handler for `DELETE /observations/{id}`.
pub async fn delete_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let (series_id, phenomenon_time) = state
        .ids
        .obs
        .decode_pair(&id)
        .ok_or_else(|| ApiError::NotFound(format!("no such observation: {id}")))?;
    let key = ObsKey {
        series_id,
        phenomenon_time,
    };
    let removed = blocking(move || Ok(state.db.observations().remove(key)?)).await?;
    if !removed {
        return Err(ApiError::NotFound(format!("observation {id}")));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Incoming observation body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObsBody {
    /// External stream ID; optional on the nested stream route.
    #[serde(default)]
    pub datastream: Option<String>,
    #[serde(default)]
    pub foi: Option<String>,
    /// RFC 3339 instant or `now`.
    pub phenomenon_time: String,
    #[serde(default)]
    pub result_time: Option<String>,
    pub result: DataBlock,
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
}

impl ObsBody {
    fn into_obs(self, state: &AppState, implied_stream: Option<i64>) -> Result<ObsData, ApiError> {
        let stream_id = match (&self.datastream, implied_stream) {
            (Some(raw), _) => {
                let id = state.ids.datastreams.decode(raw);
                if id <= 0 {
                    return Err(ApiError::BadRequest(format!("invalid datastream: {raw:?}")));
                }
                id
            }
            (None, Some(id)) => id,
            (None, None) => {
                return Err(ApiError::BadRequest(
                    "observation is missing a datastream".to_string(),
                ))
            }
        };
        let phenomenon_time = Timestamp::parse_iso(&self.phenomenon_time).ok_or_else(|| {
            ApiError::BadRequest(format!("invalid phenomenonTime: {:?}", self.phenomenon_time))
        })?;
        let mut obs = ObsData::new(stream_id, phenomenon_time, self.result);
        if let Some(raw) = &self.result_time {
            let t = Timestamp::parse_iso(raw)
                .ok_or_else(|| ApiError::BadRequest(format!("invalid resultTime: {raw:?}")))?;
            obs = obs.with_result_time(t);
        }
        if let Some(raw) = &self.foi {
            let id = state.ids.fois.decode(raw);
            if id <= 0 {
                return Err(ApiError::BadRequest(format!("invalid foi: {raw:?}")));
            }
            obs = obs.with_foi(id);
        }
        obs.parameters = self.parameters;
        Ok(obs)
    }
}

async fn post_observations(
    state: Arc<AppState>,
    headers: HeaderMap,
    body: serde_json::Value,
    implied_stream: Option<i64>,
    base_path: String,
) -> Result<impl IntoResponse, ApiError> {
    require_json(&headers)?;
    let records = one_or_many::<ObsBody>(body)?;
    let observations = records
        .into_iter()
        .map(|r| r.into_obs(&state, implied_stream))
        .collect::<Result<Vec<_>, _>>()?;
    let codecs = state.ids;

    let created = blocking(move || {
        let mut ids = Vec::with_capacity(observations.len());
        for obs in observations {
            // Arity is validated against the stream's schema up front so a
            // malformed record is a 400, not a stored inconsistency.
            let info = state
                .db
                .data_streams()
                .get(obs.data_stream_id)?
                .ok_or_else(|| ApiError::BadRequest("unknown datastream".to_string()))?;
            let expected = info.record_schema.flat_len();
            if obs.result.len() != expected {
                return Err(ApiError::BadRequest(format!(
                    "result has {} values, schema expects {expected}",
                    obs.result.len()
                )));
            }

            let key = state.db.observations().add(obs.clone())?;
            ids.push(codecs.obs.encode_pair(key.series_id, key.phenomenon_time));

            // Fan the new observation out to live subscribers.
            if let Some((_, system)) = state.db.systems().current_version(info.system_id)? {
                state.bus.publish(
                    &topics::data_stream(system.uid(), &info.output_name),
                    HubEvent::Data(DataEvent {
                        timestamp: obs.result_time,
                        system_uid: system.uid().to_string(),
                        output_name: info.output_name.clone(),
                        schema: None,
                        foi_uid: None,
                        records: vec![obs.result.clone()],
                    }),
                );
            }
        }
        Ok(ids)
    })
    .await?;

    let mut response_headers = HeaderMap::new();
    if let Some(first) = created.first() {
        let location = HeaderValue::from_str(&format!("{base_path}/{first}"))
            .map_err(|e| ApiError::Internal(format!("location header: {e}")))?;
        response_headers.insert(header::LOCATION, location);
    }
    Ok((
        StatusCode::CREATED,
        response_headers,
        Json(serde_json::json!({ "created": created })),
    ))
}

/// Handler for `POST /observations`.
pub async fn post_handler(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse, ApiError> {
    post_observations(state, headers, body, None, "/observations".to_string()).await
}

/// Handler for `GET /datastreams/{id}/observations`.
pub async fn list_for_stream_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    RawQuery(raw): RawQuery,
) -> Result<Json<Collection<serde_json::Value>>, ApiError> {
    let q = QueryParams::parse(raw.as_deref())?;
    let internal = decode_id(&state.ids.datastreams, &id)?;
    let filter = params::obs_filter(&q, &state.ids.datastreams, &state.ids.fois)?
        .with_data_streams(DataStreamFilter::default().with_internal_ids([internal]));
    let base = format!("/datastreams/{id}/observations");
    list_page(state, q, filter, base).await
}

/// Handler for `POST /datastreams/{id}/observations`.
pub async fn post_for_stream_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse, ApiError> {
    let internal = decode_id(&state.ids.datastreams, &id)?;
    let base = "/observations".to_string();
    post_observations(state, headers, body, Some(internal), base).await
}
