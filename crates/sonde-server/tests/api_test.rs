//! REST surface integration tests driven through the router.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use sonde_bus::EventBus;
use sonde_datastore::{DatabaseConfig, ObsDatabase};
use sonde_server::{app, AppState};
use tower::ServiceExt; // for oneshot

fn make_app(dir: &tempfile::TempDir) -> (Router, Arc<ObsDatabase>) {
    let config = DatabaseConfig {
        storage_path: dir.path().join("obs.db").to_str().unwrap().to_string(),
        ..DatabaseConfig::default()
    };
    let db = Arc::new(ObsDatabase::open(&config).expect("open database"));
    let state = AppState::new(Arc::clone(&db), EventBus::new());
    (app(state), db)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = match body {
        Some(v) => Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&v).unwrap()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn weather_schema() -> Value {
    json!({
        "kind": "record",
        "name": "weather",
        "fields": [
            { "kind": "scalar", "name": "temp", "scalar_type": "Quantity" }
        ]
    })
}

/// Creates a system; returns its external ID.
async fn seed_system(app: &Router, uid: &str) -> String {
    let (status, body) = send(
        app,
        "POST",
        "/systems",
        Some(json!({ "uid": uid, "name": "weather station" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    body["created"][0].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_check_returns_ok() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _db) = make_app(&dir);
    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn post_then_get_system() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _db) = make_app(&dir);

    let (status, body) = send(
        &app,
        "POST",
        "/systems",
        Some(json!({
            "uid": "urn:sonde:sys:42",
            "name": "station 42",
            "description": "rooftop unit"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    let id = body["created"][0].as_str().unwrap().to_string();

    let (status, body) = send(&app, "GET", &format!("/systems/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["uid"], "urn:sonde:sys:42");
    assert_eq!(body["name"], "station 42");
    assert_eq!(body["description"], "rooftop unit");

    let (status, body) = send(&app, "GET", "/systems", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn invalid_external_id_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _db) = make_app(&dir);

    let (status, _) = send(&app, "GET", "/systems/deadbeef", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, "GET", "/systems/not-hex-at-all", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn post_without_json_content_type_is_415() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _db) = make_app(&dir);

    let request = Request::builder()
        .method("POST")
        .uri("/systems")
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from("not json"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    // axum's Json extractor rejects the content type before the handler
    // runs; either way the client sees 415.
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn unknown_format_param_is_415() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _db) = make_app(&dir);
    let (status, _) = send(&app, "GET", "/systems?format=application/xml", None).await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn invalid_query_parameter_is_400() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _db) = make_app(&dir);
    let (status, _) = send(&app, "GET", "/systems?validTime=whenever", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, "GET", "/fois?bbox=1,2,3", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn duplicate_uid_is_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _db) = make_app(&dir);

    let body = json!({ "uid": "urn:sonde:sys:dup", "name": "one" });
    let (status, _) = send(&app, "POST", "/systems", Some(body.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = send(&app, "POST", "/systems", Some(body)).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn uid_filter_narrows_listing() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _db) = make_app(&dir);

    for n in 0..3 {
        let (status, _) = send(
            &app,
            "POST",
            "/systems",
            Some(json!({ "uid": format!("urn:sonde:sys:f{n}"), "name": format!("s{n}") })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, body) = send(&app, "GET", "/systems?uid=urn:sonde:sys:f1", None).await;
    assert_eq!(status, StatusCode::OK);
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["uid"], "urn:sonde:sys:f1");

    let (status, body) = send(&app, "GET", "/systems/count?uid=urn:sonde:sys:f1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
}

#[tokio::test]
async fn paging_emits_next_link_and_is_consistent() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _db) = make_app(&dir);

    for n in 0..5 {
        send(
            &app,
            "POST",
            "/systems",
            Some(json!({ "uid": format!("urn:sonde:sys:p{n}"), "name": format!("s{n}") })),
        )
        .await;
    }

    let (_, page1) = send(&app, "GET", "/systems?offset=0&limit=2", None).await;
    assert_eq!(page1["items"].as_array().unwrap().len(), 2);
    assert_eq!(page1["next"], "/systems?offset=2&limit=2");

    let (_, page2) = send(&app, "GET", "/systems?offset=2&limit=2", None).await;
    let (_, both) = send(&app, "GET", "/systems?offset=0&limit=4", None).await;

    let mut stitched: Vec<Value> = page1["items"].as_array().unwrap().clone();
    stitched.extend(page2["items"].as_array().unwrap().clone());
    assert_eq!(&stitched, both["items"].as_array().unwrap());

    // The final page carries no next link.
    let (_, tail) = send(&app, "GET", "/systems?offset=4&limit=2", None).await;
    assert_eq!(tail["items"].as_array().unwrap().len(), 1);
    assert!(tail["next"].is_null());
}

#[tokio::test]
async fn select_projects_fields() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _db) = make_app(&dir);
    seed_system(&app, "urn:sonde:sys:sel").await;

    let (_, body) = send(&app, "GET", "/systems?select=id,name", None).await;
    let item = &body["items"][0];
    assert!(item.get("id").is_some());
    assert!(item.get("name").is_some());
    assert!(item.get("uid").is_none());
}

#[tokio::test]
async fn observation_flow_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let (app, db) = make_app(&dir);
    let system_ext = seed_system(&app, "urn:sonde:sys:obs").await;

    // Register the output through the store facade, as a producer would.
    let sys_internal = db
        .systems()
        .uid_to_id("urn:sonde:sys:obs")
        .unwrap()
        .unwrap();
    let schema: sonde_types::DataComponent = serde_json::from_value(weather_schema()).unwrap();
    let reg = db
        .data_streams()
        .register_output(sys_internal, "weather", schema, sonde_types::RecordEncoding::Json)
        .unwrap();

    // The stream shows up under the system.
    let (status, body) = send(
        &app,
        "GET",
        &format!("/systems/{system_ext}/datastreams"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    let ds_ext = items[0]["id"].as_str().unwrap().to_string();
    assert_eq!(items[0]["outputName"], "weather");

    // POST one observation against the stream.
    let (status, body) = send(
        &app,
        "POST",
        &format!("/datastreams/{ds_ext}/observations"),
        Some(json!({
            "phenomenonTime": "2024-06-01T00:00:00Z",
            "result": [3.14]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    let obs_ext = body["created"][0].as_str().unwrap().to_string();

    // Visible through the system-scoped listing.
    let (status, body) = send(
        &app,
        "GET",
        &format!("/systems/{system_ext}/observations?limit=10"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["result"][0], 3.14);

    // And addressable one by one.
    let (status, body) = send(&app, "GET", &format!("/observations/{obs_ext}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"][0], 3.14);
    assert_eq!(body["datastream"], ds_ext);

    // Wrong arity is a 400.
    let (status, _) = send(
        &app,
        "POST",
        &format!("/datastreams/{ds_ext}/observations"),
        Some(json!({
            "phenomenonTime": "2024-06-01T00:01:00Z",
            "result": [1.0, 2.0]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let _ = reg;
}

#[tokio::test]
async fn observation_range_scan_is_time_ordered() {
    let dir = tempfile::tempdir().unwrap();
    let (app, db) = make_app(&dir);
    seed_system(&app, "urn:sonde:sys:range").await;
    let sys = db
        .systems()
        .uid_to_id("urn:sonde:sys:range")
        .unwrap()
        .unwrap();
    let schema: sonde_types::DataComponent = serde_json::from_value(weather_schema()).unwrap();
    let ds = db
        .data_streams()
        .register_output(sys, "weather", schema, sonde_types::RecordEncoding::Json)
        .unwrap()
        .stream_id;

    for (t, v) in [("2024-06-01T00:02:00Z", 2.0), ("2024-06-01T00:01:00Z", 1.0)] {
        db.observations()
            .add(sonde_types::ObsData::new(
                ds,
                sonde_types::Timestamp::parse_iso(t).unwrap(),
                sonde_types::DataBlock(vec![sonde_types::FieldValue::Float(v)]),
            ))
            .unwrap();
    }

    let uri = "/observations?phenomenonTime=2024-06-01T00:01:00Z/2024-06-01T00:02:00Z";
    let (status, body) = send(&app, "GET", uri, None).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["result"][0], 1.0);
    assert_eq!(items[1]["result"][0], 2.0);
}

#[tokio::test]
async fn delete_system_then_get_is_404() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _db) = make_app(&dir);
    let id = seed_system(&app, "urn:sonde:sys:del").await;

    let (status, _) = send(&app, "DELETE", &format!("/systems/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&app, "GET", &format!("/systems/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn read_only_database_maps_to_405() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("obs.db").to_str().unwrap().to_string();
    {
        let db = Arc::new(
            ObsDatabase::open(&DatabaseConfig {
                storage_path: path.clone(),
                ..DatabaseConfig::default()
            })
            .unwrap(),
        );
        let state = AppState::new(Arc::clone(&db), EventBus::new());
        let app = app(state);
        seed_system(&app, "urn:sonde:sys:rolock").await;
        db.commit().unwrap();
    }

    let db = Arc::new(
        ObsDatabase::open(&DatabaseConfig {
            storage_path: path,
            read_only: true,
            ..DatabaseConfig::default()
        })
        .unwrap(),
    );
    let app = app(AppState::new(db, EventBus::new()));

    let (status, _) = send(
        &app,
        "POST",
        "/systems",
        Some(json!({ "uid": "urn:sonde:sys:rdonly", "name": "x" })),
    )
    .await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

    let (status, body) = send(&app, "GET", "/systems", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn put_updates_current_version_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _db) = make_app(&dir);
    let id = seed_system(&app, "urn:sonde:sys:put").await;

    let (status, _) = send(
        &app,
        "PUT",
        &format!("/systems/{id}"),
        Some(json!({ "uid": "urn:sonde:sys:put", "name": "renamed" })),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, body) = send(&app, "GET", &format!("/systems/{id}"), None).await;
    assert_eq!(body["name"], "renamed");

    // Changing the UID through PUT is rejected.
    let (status, _) = send(
        &app,
        "PUT",
        &format!("/systems/{id}"),
        Some(json!({ "uid": "urn:sonde:sys:other", "name": "nope" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
