use axum::{http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Response for an error
#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct ErrorResponse {
    pub code: u16,
    pub status: String,
    pub error: String,
    /// Set on refused tokens: whether a fresh token is worth an immediate retry
    #[serde(rename = "shouldRetry", default, skip_serializing_if = "Option::is_none")]
    pub should_retry: Option<bool>,
}

impl ErrorResponse {
    pub fn reply(status: StatusCode, error: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
        (status, Json(ErrorResponse {
            code: status.as_u16(),
            status: status.to_string(),
            error: error.into(),
            should_retry: None,
        }))
    }

    /// A refused token, with its error code and whether a fresh token is
    /// worth an immediate retry.
    pub fn refused_token(code: &str, should_retry: bool) -> (StatusCode, Json<ErrorResponse>) {
        let (status, mut body) = Self::reply(StatusCode::UNAUTHORIZED, code);
        body.should_retry = Some(should_retry);
        (status, body)
    }
}
