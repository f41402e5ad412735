//! System collection handlers.

use std::sync::Arc;

use axum::extract::{Extension, Path, RawQuery};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use sonde_datastore::filter::{DataStreamFilter, FoiFilter, ObsFilter, SystemFilter};
use sonde_types::{topics, HubEvent};

use crate::dto::{system_json, FeatureBody};
use crate::params;
use crate::resource::{
    apply_select, blocking, decode_id, one_or_many, paginate, require_json, ApiError, Collection,
    Paging, QueryParams,
};
use crate::AppState;

/// Shared list plumbing: runs a system filter and serializes one page.
async fn list_page(
    state: Arc<AppState>,
    q: QueryParams,
    filter: SystemFilter,
    base_path: String,
) -> Result<Json<Collection<serde_json::Value>>, ApiError> {
    q.check_format()?;
    let paging = Paging::from_query(&q)?;
    let select = q.select_fields();
    let enc = state.ids.systems;

    let items = blocking(move || {
        let store = state.db.systems();
        let mut out = Vec::new();
        let mut skipped = 0;
        for entry in store.select_entries(&filter)? {
            let (key, desc) = entry?;
            if skipped < paging.offset {
                skipped += 1;
                continue;
            }
            out.push(system_json(&enc, &key, &desc));
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

/// Handler for `GET /systems`.
pub async fn list_handler(
    Extension(state): Extension<Arc<AppState>>,
    RawQuery(raw): RawQuery,
) -> Result<Json<Collection<serde_json::Value>>, ApiError> {
    let q = QueryParams::parse(raw.as_deref())?;
    let filter = params::system_filter(&q, &state.ids.systems)?;
    list_page(state, q, filter, "/systems".to_string()).await
}

/// Handler for `GET /systems/count`.
pub async fn count_handler(
    Extension(state): Extension<Arc<AppState>>,
    RawQuery(raw): RawQuery,
) -> Result<Json<serde_json::Value>, ApiError> {
    let q = QueryParams::parse(raw.as_deref())?;
    let filter = params::system_filter(&q, &state.ids.systems)?;
    let count = blocking(move || Ok(state.db.systems().count_matching(&filter)?)).await?;
    Ok(Json(serde_json::json!({ "count": count })))
}

/// Handler for `GET /systems/{id}`: the version current for the wall
/// clock.
pub async fn get_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let internal = decode_id(&state.ids.systems, &id)?;
    let enc = state.ids.systems;
    let entry = blocking(move || {
        state
            .db
            .systems()
            .current_version(internal)?
            .ok_or_else(|| ApiError::NotFound(format!("system {id}")))
    })
    .await?;
    Ok(Json(system_json(&enc, &entry.0, &entry.1)))
}

/// Handler for `POST /systems`: accepts one system or an array.
pub async fn post_handler(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse, ApiError> {
    require_json(&headers)?;
    let enc = state.ids.systems;
    let descs = one_or_many::<FeatureBody>(body)?
        .into_iter()
        .map(|b| b.into_system(&enc))
        .collect::<Result<Vec<_>, _>>()?;

    let created = blocking(move || {
        let mut ids = Vec::with_capacity(descs.len());
        for desc in descs {
            let uid = desc.uid().to_string();
            let name = desc.feature.name.clone();
            let key = state.db.systems().add(desc)?;
            state.bus.publish(
                topics::REGISTRY,
                HubEvent::SystemAdded {
                    system_uid: uid,
                    name,
                },
            );
            ids.push(enc.encode(key.internal_id));
        }
        Ok(ids)
    })
    .await?;

    let mut response_headers = HeaderMap::new();
    if let Some(first) = created.first() {
        let location = HeaderValue::from_str(&format!("/systems/{first}"))
            .map_err(|e| ApiError::Internal(format!("location header: {e}")))?;
        response_headers.insert(header::LOCATION, location);
    }
    Ok((
        StatusCode::CREATED,
        response_headers,
        Json(serde_json::json!({ "created": created })),
    ))
}

/// Handler for `PUT /systems/{id}`: overwrites the current version.
pub async fn put_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<StatusCode, ApiError> {
    require_json(&headers)?;
    let internal = decode_id(&state.ids.systems, &id)?;
    let mut bodies = one_or_many::<FeatureBody>(body)?;
    if bodies.len() != 1 {
        return Err(ApiError::BadRequest("PUT expects exactly one record".to_string()));
    }
    let desc = bodies.remove(0).into_system(&state.ids.systems)?;

    blocking(move || {
        let store = state.db.systems();
        let (key, _) = store
            .current_version(internal)?
            .ok_or_else(|| ApiError::NotFound(format!("system {id}")))?;
        let uid = desc.uid().to_string();
        store.put(key, desc)?;
        state.bus.publish(
            topics::REGISTRY,
            HubEvent::SystemChanged { system_uid: uid },
        );
        Ok(())
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for `DELETE /systems/{id}`: removes every version.
pub async fn delete_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let internal = decode_id(&state.ids.systems, &id)?;
    blocking(move || {
        let store = state.db.systems();
        let uid = store
            .current_version(internal)?
            .map(|(_, desc)| desc.uid().to_string())
            .ok_or_else(|| ApiError::NotFound(format!("system {id}")))?;
        store.remove_entries(&SystemFilter::default().with_internal_ids([internal]))?;
        state.bus.publish(
            topics::REGISTRY,
            HubEvent::SystemRemoved { system_uid: uid },
        );
        Ok(())
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for `GET /systems/{id}/history`: all versions by valid time.
pub async fn history_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    RawQuery(raw): RawQuery,
) -> Result<Json<Collection<serde_json::Value>>, ApiError> {
    let q = QueryParams::parse(raw.as_deref())?;
    q.check_format()?;
    let paging = Paging::from_query(&q)?;
    let internal = decode_id(&state.ids.systems, &id)?;
    let enc = state.ids.systems;

    let id_for_error = id.clone();
    let items = blocking(move || {
        let history = state.db.systems().history(internal)?;
        if history.is_empty() {
            return Err(ApiError::NotFound(format!("system {id_for_error}")));
        }
        Ok(history
            .iter()
            .skip(paging.offset)
            .take(paging.fetch_count())
            .map(|(key, desc)| system_json(&enc, key, desc))
            .collect::<Vec<_>>())
    })
    .await?;
    Ok(Json(paginate(items, paging, &format!("/systems/{id}/history"))))
}

/// Handler for `GET /systems/{id}/members`: direct subsystems.
pub async fn members_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    RawQuery(raw): RawQuery,
) -> Result<Json<Collection<serde_json::Value>>, ApiError> {
    let q = QueryParams::parse(raw.as_deref())?;
    let internal = decode_id(&state.ids.systems, &id)?;
    let filter = params::system_filter(&q, &state.ids.systems)?
        .with_parents(SystemFilter::default().with_internal_ids([internal]));
    let base = format!("/systems/{id}/members");
    list_page(state, q, filter, base).await
}

/// Handler for `GET /systems/{id}/datastreams`.
pub async fn datastreams_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    RawQuery(raw): RawQuery,
) -> Result<Json<Collection<serde_json::Value>>, ApiError> {
    let q = QueryParams::parse(raw.as_deref())?;
    q.check_format()?;
    let paging = Paging::from_query(&q)?;
    let internal = decode_id(&state.ids.systems, &id)?;
    let filter = params::datastream_filter(&q, &state.ids.datastreams, &state.ids.systems)?
        .with_systems(SystemFilter::default().with_internal_ids([internal]));
    let codecs = state.ids;

    let items = blocking(move || {
        let streams = state.db.data_streams().select_entries(&filter)?;
        Ok(streams
            .iter()
            .skip(paging.offset)
            .take(paging.fetch_count())
            .map(|(ds_id, info)| crate::api_datastreams::stream_json(&codecs, *ds_id, info))
            .collect::<Vec<_>>())
    })
    .await?;
    Ok(Json(paginate(
        items,
        paging,
        &format!("/systems/{id}/datastreams"),
    )))
}

/// Handler for `GET /systems/{id}/fois`: features observed by this
/// system, linked through its observation series.
pub async fn fois_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    RawQuery(raw): RawQuery,
) -> Result<Json<Collection<serde_json::Value>>, ApiError> {
    let q = QueryParams::parse(raw.as_deref())?;
    q.check_format()?;
    let paging = Paging::from_query(&q)?;
    let internal = decode_id(&state.ids.systems, &id)?;
    let foi_filter = params::foi_filter(&q, &state.ids.fois)?;
    let enc = state.ids.fois;

    let items = blocking(move || {
        let series_filter = ObsFilter::default().with_data_streams(
            DataStreamFilter::default()
                .with_systems(SystemFilter::default().with_internal_ids([internal])),
        );
        let foi_ids: Vec<i64> = state
            .db
            .observations()
            .select_series(&series_filter)?
            .into_iter()
            .map(|(_, series)| series.foi_id)
            .filter(|id| *id > 0)
            .collect();
        if foi_ids.is_empty() {
            return Ok(Vec::new());
        }
        let filter = match foi_filter.intersect(&FoiFilter::default().with_internal_ids(foi_ids)) {
            Ok(f) => f,
            Err(_) => return Ok(Vec::new()),
        };
        let mut out = Vec::new();
        let mut skipped = 0;
        for entry in state.db.fois().select_entries(&filter)? {
            let (key, desc) = entry?;
            if skipped < paging.offset {
                skipped += 1;
                continue;
            }
            out.push(crate::dto::feature_json(&enc, &key, &desc));
            if out.len() >= paging.fetch_count() {
                break;
            }
        }
        Ok(out)
    })
    .await?;
    Ok(Json(paginate(items, paging, &format!("/systems/{id}/fois"))))
}

/// Handler for `GET /systems/{id}/observations`.
pub async fn observations_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    RawQuery(raw): RawQuery,
) -> Result<Json<Collection<serde_json::Value>>, ApiError> {
    let q = QueryParams::parse(raw.as_deref())?;
    let internal = decode_id(&state.ids.systems, &id)?;
    let filter = params::obs_filter(&q, &state.ids.datastreams, &state.ids.fois)?
        .with_data_streams(
            DataStreamFilter::default()
                .with_systems(SystemFilter::default().with_internal_ids([internal])),
        );
    let base = format!("/systems/{id}/observations");
    crate::api_observations::list_page(state, q, filter, base).await
}
