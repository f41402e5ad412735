//! Feature-of-interest collection handlers.

use std::sync::Arc;

use axum::extract::{Extension, Path, RawQuery};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use sonde_datastore::filter::FoiFilter;

use crate::dto::{feature_json, FeatureBody};
use crate::params;
use crate::resource::{
    apply_select, blocking, decode_id, one_or_many, paginate, require_json, ApiError, Collection,
    Paging, QueryParams,
};
use crate::AppState;

/// Handler for `GET /fois`.
pub async fn list_handler(
    Extension(state): Extension<Arc<AppState>>,
    RawQuery(raw): RawQuery,
) -> Result<Json<Collection<serde_json::Value>>, ApiError> {
    let q = QueryParams::parse(raw.as_deref())?;
    q.check_format()?;
    let paging = Paging::from_query(&q)?;
    let filter = params::foi_filter(&q, &state.ids.fois)?;
    let select = q.select_fields();
    let enc = state.ids.fois;

    let items = blocking(move || {
        let mut out = Vec::new();
        let mut skipped = 0;
        for entry in state.db.fois().select_entries(&filter)? {
            let (key, desc) = entry?;
            if skipped < paging.offset {
                skipped += 1;
                continue;
            }
            out.push(feature_json(&enc, &key, &desc));
            if out.len() >= paging.fetch_count() {
                break;
            }
        }
        Ok(out)
    })
    .await?;

    let mut page = paginate(items, paging, "/fois");
    if let Some(fields) = &select {
        for item in &mut page.items {
            apply_select(item, fields);
        }
    }
    Ok(Json(page))
}

/// Handler for `GET /fois/count`.
pub async fn count_handler(
    Extension(state): Extension<Arc<AppState>>,
    RawQuery(raw): RawQuery,
) -> Result<Json<serde_json::Value>, ApiError> {
    let q = QueryParams::parse(raw.as_deref())?;
    let filter = params::foi_filter(&q, &state.ids.fois)?;
    let count = blocking(move || Ok(state.db.fois().count_matching(&filter)?)).await?;
    Ok(Json(serde_json::json!({ "count": count })))
}

/// Handler for `GET /fois/{id}`.
pub async fn get_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let internal = decode_id(&state.ids.fois, &id)?;
    let enc = state.ids.fois;
    let entry = blocking(move || {
        state
            .db
            .fois()
            .current_version(internal)?
            .ok_or_else(|| ApiError::NotFound(format!("FOI {id}")))
    })
    .await?;
    Ok(Json(feature_json(&enc, &entry.0, &entry.1)))
}

/// Handler for `POST /fois`.
pub async fn post_handler(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse, ApiError> {
    require_json(&headers)?;
    let enc = state.ids.fois;
    let descs = one_or_many::<FeatureBody>(body)?
        .into_iter()
        .map(FeatureBody::into_desc)
        .collect::<Result<Vec<_>, _>>()?;

    let created = blocking(move || {
        let mut ids = Vec::with_capacity(descs.len());
        for desc in descs {
            let key = state.db.fois().add(desc)?;
            ids.push(enc.encode(key.internal_id));
        }
        Ok(ids)
    })
    .await?;

    let mut response_headers = HeaderMap::new();
    if let Some(first) = created.first() {
        let location = HeaderValue::from_str(&format!("/fois/{first}"))
            .map_err(|e| ApiError::Internal(format!("location header: {e}")))?;
        response_headers.insert(header::LOCATION, location);
    }
    Ok((
        StatusCode::CREATED,
        response_headers,
        Json(serde_json::json!({ "created": created })),
    ))
}

/// Handler for `PUT /fois/{id}`.
pub async fn put_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<StatusCode, ApiError> {
    require_json(&headers)?;
    let internal = decode_id(&state.ids.fois, &id)?;
    let mut bodies = one_or_many::<FeatureBody>(body)?;
    if bodies.len() != 1 {
        return Err(ApiError::BadRequest("PUT expects exactly one record".to_string()));
    }
    let desc = bodies.remove(0).into_desc()?;

    blocking(move || {
        let store = state.db.fois();
        let (key, _) = store
            .current_version(internal)?
            .ok_or_else(|| ApiError::NotFound(format!("FOI {id}")))?;
        store.put(key, desc)?;
        Ok(())
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for `DELETE /fois/{id}`.
pub async fn delete_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let internal = decode_id(&state.ids.fois, &id)?;
    let removed = blocking(move || {
        Ok(state
            .db
            .fois()
            .remove_entries(&FoiFilter::default().with_internal_ids([internal]))?)
    })
    .await?;
    if removed == 0 {
        return Err(ApiError::NotFound(format!("FOI {id}")));
    }
    Ok(StatusCode::NO_CONTENT)
}
