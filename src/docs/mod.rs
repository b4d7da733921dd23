use utoipa::OpenApi;
use crate::models::*;

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
#[allow(dead_code)]
pub async fn health_check_doc() {}

/// Readiness check endpoint
#[utoipa::path(
    get,
    path = "/api/ready",
    responses(
        (status = 200, description = "Service is ready, with the number of loaded rooms", body = HealthResponse)
    )
)]
#[allow(dead_code)]
pub async fn ready_check_doc() {}

/// Room websocket upgrade
#[utoipa::path(
    get,
    path = "/api/v1/rooms/{room_id}/ws",
    params(
        ("room_id" = String, Path, description = "Room to join"),
        ("token" = String, Query, description = "Signed identity token")
    ),
    responses(
        (status = 101, description = "Switching to the room protocol"),
        (status = 401, description = "Missing, expired or invalid token", body = ErrorResponse),
        (status = 403, description = "Identity may not open this room", body = ErrorResponse),
        (status = 426, description = "Not a websocket upgrade", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn room_socket_doc() {}

/// Service diagnostics, cloud admins only
#[utoipa::path(
    get,
    path = "/api/v1/diagnostics",
    responses(
        (status = 200, description = "Counters and host load", body = DiagnosticsResponse),
        (status = 403, description = "Caller is not a cloud admin", body = ErrorResponse)
    ),
    security(("bearer" = []))
)]
#[allow(dead_code)]
pub async fn diagnostics_doc() {}

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check_doc,
        ready_check_doc,
        room_socket_doc,
        diagnostics_doc,
    ),
    components(
        schemas(HealthResponse, DiagnosticsResponse, ErrorResponse, Record, ChangeSet)
    ),
    tags(
        (name = "api", description = "Board sync endpoints")
    )
)]
pub struct ApiDoc;
