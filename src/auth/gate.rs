use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// The verified owner of a token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub subject: String,
    pub organization: Option<String>,
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthFailure {
    #[error("token expired")]
    Expired,

    #[error("invalid token: {0}")]
    Invalid(String),

    #[error("malformed token: {0}")]
    Malformed(String),
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default, alias = "org_id")]
    org: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
}

/// Verifies HS256 signed tokens.
///
/// Used twice per connection: once at the upgrade edge and once more by the
/// room coordinator on `connect`.
#[derive(Clone)]
pub struct AuthGate {
    key: Option<DecodingKey>,
    validation: Validation,
}

impl AuthGate {
    pub fn new(secret: &str, leeway_secs: u64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = leeway_secs;
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            key: Some(DecodingKey::from_secret(secret.as_bytes())),
            validation,
        }
    }

    /// A gate without a secret. Every token is rejected.
    pub fn disabled() -> Self {
        warn!("No JWT secret configured, every connection will be rejected");
        Self {
            key: None,
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn from_config(config: &crate::config::Config) -> Self {
        match &config.cloud_auth_jwt_secret {
            Some(secret) if !secret.is_empty() => Self::new(secret, config.jwt_leeway_secs),
            _ => Self::disabled(),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Identity, AuthFailure> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthFailure::Malformed("empty token".to_string()));
        }
        let key = self
            .key
            .as_ref()
            .ok_or_else(|| AuthFailure::Invalid("no JWT secret configured".to_string()))?;

        let data = decode::<Claims>(token, key, &self.validation).map_err(|e| {
            let failure = classify(&e);
            debug!("Token rejected: {}", failure);
            failure
        })?;

        let claims = data.claims;
        if claims.sub.is_empty() {
            return Err(AuthFailure::Invalid("empty subject".to_string()));
        }
        Ok(Identity {
            subject: claims.sub,
            organization: claims.org.filter(|o| !o.is_empty()),
            email: claims.email,
            roles: claims.roles,
        })
    }
}

fn classify(e: &jsonwebtoken::errors::Error) -> AuthFailure {
    match e.kind() {
        ErrorKind::ExpiredSignature => AuthFailure::Expired,
        ErrorKind::InvalidToken
        | ErrorKind::Base64(_)
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_)
        | ErrorKind::MissingRequiredClaim(_) => AuthFailure::Malformed(e.to_string()),
        _ => AuthFailure::Invalid(e.to_string()),
    }
}
