//! Generic resource-handler machinery shared by every collection:
//! error-to-status mapping, query-parameter access, paging with next-page
//! links, external ID decoding, and field selection.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use sonde_datastore::DatastoreError;
use sonde_types::{IdEncoder, InternalId};

/// Hard cap on page size.
pub const MAX_LIMIT: usize = 10_000;
/// Page size when the request names none.
pub const DEFAULT_LIMIT: usize = 100;

/// Request-level errors mapped onto HTTP statuses.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    ReadOnly,
    UnsupportedMediaType(String),
    Internal(String),
}

impl From<DatastoreError> for ApiError {
    fn from(e: DatastoreError) -> Self {
        match e {
            DatastoreError::InvalidRequest(msg) => ApiError::BadRequest(msg),
            DatastoreError::NotFound(msg) => ApiError::NotFound(msg),
            DatastoreError::AlreadyExists(msg) => ApiError::Conflict(msg),
            DatastoreError::ReadOnly => ApiError::ReadOnly,
            DatastoreError::StructureIncompatible => {
                ApiError::BadRequest("incompatible record structure".to_string())
            }
            e @ (DatastoreError::Db(_) | DatastoreError::Init(_)) => {
                ApiError::Internal(e.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::ReadOnly => (
                StatusCode::METHOD_NOT_ALLOWED,
                "data store is read-only".to_string(),
            ),
            ApiError::UnsupportedMediaType(msg) => (StatusCode::UNSUPPORTED_MEDIA_TYPE, msg),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Runs blocking store work off the async runtime.
pub async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(format!("task join error: {e}")))?
}

/// Decoded query string preserving repeated parameters.
#[derive(Debug, Default, Clone)]
pub struct QueryParams(Vec<(String, String)>);

impl QueryParams {
    pub fn parse(raw: Option<&str>) -> Result<Self, ApiError> {
        match raw {
            None | Some("") => Ok(QueryParams(Vec::new())),
            Some(q) => serde_urlencoded::from_str::<Vec<(String, String)>>(q)
                .map(QueryParams)
                .map_err(|e| ApiError::BadRequest(format!("malformed query string: {e}"))),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// All values of a parameter, splitting comma-separated lists.
    pub fn get_multi(&self, name: &str) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(k, _)| k == name)
            .flat_map(|(_, v)| v.split(','))
            .filter(|v| !v.is_empty())
            .collect()
    }

    /// Parameters of the form `p:<name>=<pattern>`.
    pub fn property_params(&self) -> Vec<(&str, &str)> {
        self.0
            .iter()
            .filter_map(|(k, v)| k.strip_prefix("p:").map(|name| (name, v.as_str())))
            .collect()
    }

    pub fn parse_usize(&self, name: &str) -> Result<Option<usize>, ApiError> {
        match self.get(name) {
            None => Ok(None),
            Some(v) => v
                .parse()
                .map(Some)
                .map_err(|_| ApiError::BadRequest(format!("invalid {name}: {v:?}"))),
        }
    }

    /// Rejects any `format` other than JSON.
    pub fn check_format(&self) -> Result<(), ApiError> {
        match self.get("format") {
            None | Some("application/json") | Some("json") => Ok(()),
            Some(other) => Err(ApiError::UnsupportedMediaType(format!(
                "unsupported format: {other}"
            ))),
        }
    }

    /// The `select` projection, if any.
    pub fn select_fields(&self) -> Option<Vec<String>> {
        self.get("select").map(|s| {
            s.split(',')
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .collect()
        })
    }
}

/// Offset/limit paging resolved from the query string.
#[derive(Debug, Clone, Copy)]
pub struct Paging {
    pub offset: usize,
    pub limit: usize,
}

impl Paging {
    pub fn from_query(q: &QueryParams) -> Result<Self, ApiError> {
        let offset = q.parse_usize("offset")?.unwrap_or(0);
        let limit = q
            .parse_usize("limit")?
            .unwrap_or(DEFAULT_LIMIT)
            .min(MAX_LIMIT);
        Ok(Paging { offset, limit })
    }

    /// How many entries to pull from the store: one extra so a next-page
    /// link can be emitted exactly when a surplus exists.
    pub fn fetch_count(&self) -> usize {
        self.limit + 1
    }
}

/// A page of a collection with an optional next-page link.
#[derive(Debug, Serialize)]
pub struct Collection<T> {
    pub items: Vec<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

/// Builds the page from `limit + 1` fetched items.
pub fn paginate<T>(mut items: Vec<T>, paging: Paging, base_path: &str) -> Collection<T> {
    let next = if items.len() > paging.limit {
        items.truncate(paging.limit);
        Some(format!(
            "{base_path}?offset={}&limit={}",
            paging.offset + paging.limit,
            paging.limit
        ))
    } else {
        None
    };
    Collection { items, next }
}

/// Decodes one external resource ID; a tampered or foreign ID is a 404,
/// exactly like a well-formed ID that matches nothing.
pub fn decode_id(encoder: &IdEncoder, raw: &str) -> Result<InternalId, ApiError> {
    let id = encoder.decode(raw);
    if id <= 0 {
        return Err(ApiError::NotFound(format!("no such resource: {raw}")));
    }
    Ok(id)
}

/// Keeps only the selected top-level fields of each serialized item.
pub fn apply_select(value: &mut serde_json::Value, fields: &[String]) {
    if let serde_json::Value::Object(map) = value {
        map.retain(|k, _| fields.iter().any(|f| f == k));
    }
}

/// Rejects write bodies that are not JSON.
pub fn require_json(headers: &axum::http::HeaderMap) -> Result<(), ApiError> {
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if content_type.starts_with("application/json") {
        Ok(())
    } else {
        Err(ApiError::UnsupportedMediaType(format!(
            "expected application/json, got {content_type:?}"
        )))
    }
}

/// Accepts either one record or an array of records in a write body.
pub fn one_or_many<T: serde::de::DeserializeOwned>(
    body: serde_json::Value,
) -> Result<Vec<T>, ApiError> {
    let parse = |v: serde_json::Value| {
        serde_json::from_value(v).map_err(|e| ApiError::BadRequest(format!("invalid record: {e}")))
    };
    match body {
        serde_json::Value::Array(items) => {
            if items.is_empty() {
                return Err(ApiError::BadRequest("empty record array".to_string()));
            }
            items.into_iter().map(parse).collect()
        }
        v => Ok(vec![parse(v)?]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_params_merge_repeats_and_commas() {
        let q = QueryParams::parse(Some("uid=a&uid=b,c&p:vendor=acme*&limit=5")).unwrap();
        assert_eq!(q.get_multi("uid"), vec!["a", "b", "c"]);
        assert_eq!(q.property_params(), vec![("vendor", "acme*")]);
        assert_eq!(q.parse_usize("limit").unwrap(), Some(5));
        assert!(q.parse_usize("offset").unwrap().is_none());
    }

    #[test]
    fn paging_clamps_and_defaults() {
        let q = QueryParams::parse(Some("limit=999999")).unwrap();
        let p = Paging::from_query(&q).unwrap();
        assert_eq!(p.limit, MAX_LIMIT);

        let q = QueryParams::parse(None).unwrap();
        let p = Paging::from_query(&q).unwrap();
        assert_eq!(p.limit, DEFAULT_LIMIT);
        assert_eq!(p.offset, 0);
    }

    #[test]
    fn pagination_emits_next_only_on_surplus() {
        let paging = Paging { offset: 0, limit: 2 };
        let page = paginate(vec![1, 2, 3], paging, "/systems");
        assert_eq!(page.items, vec![1, 2]);
        assert_eq!(page.next.as_deref(), Some("/systems?offset=2&limit=2"));

        let page = paginate(vec![1, 2], paging, "/systems");
        assert!(page.next.is_none());
    }

    #[test]
    fn select_projection_drops_other_fields() {
        let mut v = serde_json::json!({"id": "x", "name": "n", "description": "d"});
        apply_select(&mut v, &["id".to_string(), "name".to_string()]);
        assert_eq!(v, serde_json::json!({"id": "x", "name": "n"}));
    }
}
