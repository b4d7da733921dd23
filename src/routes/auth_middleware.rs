use std::sync::Arc;
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use tracing::{error, info};

use crate::services::auth_service::get_auth_token;
use crate::AppState;

/// Verify the bearer token of an API request and expose the `Identity`
/// to downstream handlers through request extensions.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {

    // 1. Get the auth token from the request
    let token = match get_auth_token(req.headers(), None) {
        Ok(token) => token,
        Err(_) => return Err(StatusCode::UNAUTHORIZED),
    };

    // 2. Validate token
    let identity = match state.gate().verify(&token) {
        Ok(identity) => identity,
        Err(e) => {
            error!("JWT validation failed: {}", e);
            return Err(StatusCode::UNAUTHORIZED);
        }
    };
    info!("Token validated successfully for {}", identity.subject);

    // 3. Hand the identity to the handlers
    req.extensions_mut().insert(identity);

    Ok(next.run(req).await)
}
