use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// API response for health and readiness checks
#[derive(Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub message: String,
    /// Active room coordinators, reported by the readiness check
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rooms: Option<u32>,
}
