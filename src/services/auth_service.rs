use axum::http::{header, HeaderMap};

/// Find the auth token of an incoming request.
///
/// Browsers cannot set headers on a websocket upgrade, so the `token` query
/// parameter is checked first, then the `Authorization` header, then the
/// `auth_token` cookie.
pub fn get_auth_token(headers: &HeaderMap, query_token: Option<&str>) -> Result<String, String> {
    // 1. Query parameter
    if let Some(token) = query_token.filter(|t| !t.is_empty()) {
        return Ok(token.to_string());
    }

    // 2. Authorization header
    if let Some(auth_header) = headers.get(header::AUTHORIZATION) {
        let auth_str = auth_header
            .to_str()
            .map_err(|_| "Invalid Authorization header".to_string())?;
        return Ok(auth_str.strip_prefix("Bearer ").unwrap_or(auth_str).to_string());
    }

    // 3. Cookie
    let cookie_header = headers
        .get(header::COOKIE)
        .ok_or_else(|| "Missing token, Authorization header or Cookie".to_string())?
        .to_str()
        .map_err(|_| "Invalid Cookie header".to_string())?;

    cookie::Cookie::split_parse(cookie_header)
        .flatten()
        .find(|c| c.name() == "auth_token")
        .map(|c| c.value().to_string())
        .ok_or_else(|| "auth_token cookie not found".to_string())
}
