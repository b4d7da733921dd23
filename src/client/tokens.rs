use std::future::Future;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::client::ClientError;

/// Where a client gets its token. Asked again before every connection
/// attempt, a token is never reused across attempts.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self) -> Result<String, ClientError>;
}

/// Always the same token. Mostly useful in tests.
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

#[async_trait]
impl TokenSource for StaticToken {
    async fn fetch(&self) -> Result<String, ClientError> {
        Ok(self.0.clone())
    }
}

/// A token source backed by an async closure.
pub struct TokenFn<F>(pub F);

#[async_trait]
impl<F, Fut> TokenSource for TokenFn<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, ClientError>> + Send,
{
    async fn fetch(&self) -> Result<String, ClientError> {
        (self.0)().await
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

/// Fetches a token from an HTTP endpoint answering `{"token": "..."}`.
#[derive(Debug, Clone)]
pub struct HttpTokenSource {
    client: Client,
    url: String,
    bearer: Option<String>,
}

impl HttpTokenSource {
    pub fn new(url: impl Into<String>) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            bearer: None,
        })
    }

    /// Credential sent along with the token request.
    pub fn with_bearer(mut self, bearer: impl Into<String>) -> Self {
        self.bearer = Some(bearer.into());
        self
    }
}

#[async_trait]
impl TokenSource for HttpTokenSource {
    async fn fetch(&self) -> Result<String, ClientError> {
        let mut request = self.client.get(&self.url);
        if let Some(bearer) = &self.bearer {
            request = request.header("Authorization", format!("Bearer {}", bearer));
        }
        let response: TokenResponse = request.send().await?.error_for_status()?.json().await?;
        debug!("Fetched a fresh token from {}", self.url);
        Ok(response.token)
    }
}
