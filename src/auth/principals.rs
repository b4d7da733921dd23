use axum::{http::StatusCode, Json};

use super::Identity;
use crate::models::ErrorResponse;

const CLOUD_ADMIN_ROLE: &str = "Colabri-CloudAdmin";

pub fn is_cloud_admin(identity: &Identity) -> bool {
    identity.roles.iter().any(|r| r == CLOUD_ADMIN_ROLE)
}

pub fn ensure_cloud_admin(identity: &Identity) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    if is_cloud_admin(identity) {
        return Ok(());
    }
    Err(ErrorResponse::reply(StatusCode::FORBIDDEN, "Cloud Admin access required"))
}
