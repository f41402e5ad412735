//! Sonde server library logic.

pub mod api_datastreams;
pub mod api_events;
pub mod api_fois;
pub mod api_observations;
pub mod api_systems;
pub mod background;
pub mod config;
pub mod dto;
pub mod params;
pub mod resource;

use std::sync::Arc;

use axum::{
    routing::get,
    Extension, Json, Router,
};
use serde_json::{json, Value};
use sonde_bus::EventBus;
use sonde_datastore::ObsDatabase;
use sonde_ingest::IngestBridge;
use sonde_types::IdEncoder;

/// One external-ID codec per collection, so IDs never decode across
/// resource kinds.
#[derive(Debug, Clone, Copy)]
pub struct IdCodecs {
    pub systems: IdEncoder,
    pub fois: IdEncoder,
    pub datastreams: IdEncoder,
    pub obs: IdEncoder,
}

impl IdCodecs {
    pub fn new(database_num: u32) -> Self {
        IdCodecs {
            systems: IdEncoder::new(database_num, 1),
            fois: IdEncoder::new(database_num, 2),
            datastreams: IdEncoder::new(database_num, 3),
            obs: IdEncoder::new(database_num, 4),
        }
    }
}

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The observation database facade.
    pub db: Arc<ObsDatabase>,
    /// The event bus fanning producer events to live subscribers.
    pub bus: EventBus,
    /// The bridge persisting producer events; kept here so embedders can
    /// register producers against the running server.
    pub bridge: IngestBridge,
    /// External ID codecs.
    pub ids: IdCodecs,
}

impl AppState {
    pub fn new(db: Arc<ObsDatabase>, bus: EventBus) -> Self {
        let bridge = IngestBridge::new(Arc::clone(&db), bus.clone());
        let ids = IdCodecs::new(db.database_num());
        AppState {
            db,
            bus,
            bridge,
            ids,
        }
    }
}

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/systems",
            get(api_systems::list_handler).post(api_systems::post_handler),
        )
        .route("/systems/count", get(api_systems::count_handler))
        .route("/systems/events", get(api_events::registry_handler))
        .route(
            "/systems/{id}",
            get(api_systems::get_handler)
                .put(api_systems::put_handler)
                .delete(api_systems::delete_handler),
        )
        .route("/systems/{id}/events", get(api_events::system_handler))
        .route("/systems/{id}/history", get(api_systems::history_handler))
        .route("/systems/{id}/members", get(api_systems::members_handler))
        .route(
            "/systems/{id}/datastreams",
            get(api_systems::datastreams_handler),
        )
        .route("/systems/{id}/fois", get(api_systems::fois_handler))
        .route(
            "/systems/{id}/observations",
            get(api_systems::observations_handler),
        )
        .route(
            "/fois",
            get(api_fois::list_handler).post(api_fois::post_handler),
        )
        .route("/fois/count", get(api_fois::count_handler))
        .route(
            "/fois/{id}",
            get(api_fois::get_handler)
                .put(api_fois::put_handler)
                .delete(api_fois::delete_handler),
        )
        .route("/datastreams", get(api_datastreams::list_handler))
        .route("/datastreams/count", get(api_datastreams::count_handler))
        .route(
            "/datastreams/{id}",
            get(api_datastreams::get_handler)
                .put(api_datastreams::put_handler)
                .delete(api_datastreams::delete_handler),
        )
        .route(
            "/datastreams/{id}/observations",
            get(api_observations::list_for_stream_handler)
                .post(api_observations::post_for_stream_handler),
        )
        .route(
            "/datastreams/{id}/events",
            get(api_events::datastream_handler),
        )
        .route(
            "/observations",
            get(api_observations::list_handler).post(api_observations::post_handler),
        )
        .route("/observations/count", get(api_observations::count_handler))
        .route(
            "/observations/{id}",
            get(api_observations::get_handler).delete(api_observations::delete_handler),
        )
        .layer(Extension(Arc::new(state)))
}
