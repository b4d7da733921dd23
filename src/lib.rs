pub mod config;
pub mod error;
pub mod models;
pub mod auth;
pub mod services;
pub mod db;
pub mod ws;
pub mod client;
pub mod handlers;
pub mod routes;
pub mod docs;

use std::sync::Arc;
use axum::http::{HeaderValue, Method};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::auth::{AuthGate, RoomAccess};
use crate::config::Config;
use crate::docs::ApiDoc;
use crate::routes::create_api_routes;
use crate::ws::RoomRegistry;

/// Shared state of the HTTP and websocket handlers.
pub struct AppState {
    pub config: Config,
    pub rooms: Arc<RoomRegistry>,
}

impl AppState {
    pub fn new(config: Config, rooms: RoomRegistry) -> Self {
        Self {
            config,
            rooms: Arc::new(rooms),
        }
    }

    pub fn gate(&self) -> &AuthGate {
        &self.rooms.services().gate
    }

    pub fn access(&self) -> &dyn RoomAccess {
        self.rooms.services().access.as_ref()
    }
}

/// The complete router: API under `/api`, Swagger UI, tracing and CORS.
pub fn build_app(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config);
    Router::new()
        // Mount API routes
        .nest("/api", create_api_routes(state))
        // Mount Swagger UI
        .merge(SwaggerUi::new("/swagger").url("/api-docs/openapi.json", ApiDoc::openapi()))
        // Add tracing layer
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_origin_list()
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {}", origin);
                None
            }
        })
        .collect();

    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);
    if !origins.is_empty() {
        layer.allow_origin(origins)
    } else if config.is_development() {
        layer.allow_origin(Any)
    } else {
        warn!("No CORS origins configured, cross-origin requests are refused");
        layer
    }
}
