//! HTTP client for the authentication endpoints.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use retriever_shared::{ApiError, IdTokenLogin, RefreshRequest, TokenResponse, UserProfile};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Token exchange, refresh and profile lookup.
///
/// The session manager only talks to the backend through this trait so tests
/// can script every response.
#[async_trait]
pub trait AuthApi: Send + Sync {
    /// Trade an identity-provider id token for an access/refresh pair.
    async fn exchange_id_token(&self, id_token: &str) -> Result<TokenResponse, ApiError>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, ApiError>;

    /// The server's current view of the signed-in user.
    async fn fetch_profile(&self, access_token: &str) -> Result<UserProfile, ApiError>;
}

/// [`AuthApi`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpAuthApi {
    client: Client,
    base_url: String,
}

impl HttpAuthApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
    }

    async fn get_json<TRes: DeserializeOwned>(
        &self,
        path: &str,
        bearer: Option<&str>,
    ) -> Result<TRes, ApiError> {
        let mut rb = self.client.get(self.url(path));
        if let Some(token) = bearer {
            rb = rb.bearer_auth(token);
        }
        send(rb).await
    }

    async fn post_json<TReq: Serialize, TRes: DeserializeOwned>(
        &self,
        path: &str,
        body: &TReq,
    ) -> Result<TRes, ApiError> {
        let body_bytes =
            serde_json::to_vec(body).map_err(|e| ApiError::Deserialize(e.to_string()))?;
        let rb = self
            .client
            .post(self.url(path))
            .body(body_bytes)
            .header("Content-Type", "application/json");
        send(rb).await
    }
}

async fn send<TRes: DeserializeOwned>(rb: RequestBuilder) -> Result<TRes, ApiError> {
    let resp = rb.send().await.map_err(|e| ApiError::Network(e.to_string()))?;

    let status = resp.status().as_u16();
    let is_success = resp.status().is_success();
    let text = resp
        .text()
        .await
        .map_err(|e| ApiError::Network(format!("failed to read body: {e}")))?;

    if !is_success {
        return Err(ApiError::Http { status, body: text });
    }

    serde_json::from_str(&text).map_err(|e| ApiError::Deserialize(e.to_string()))
}

#[async_trait]
impl AuthApi for HttpAuthApi {
    async fn exchange_id_token(&self, id_token: &str) -> Result<TokenResponse, ApiError> {
        let body = IdTokenLogin {
            id_token: id_token.to_string(),
        };
        self.post_json("/auth/google_login", &body).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, ApiError> {
        let body = RefreshRequest {
            refresh_token: refresh_token.to_string(),
        };
        self.post_json("/auth/refresh", &body).await
    }

    async fn fetch_profile(&self, access_token: &str) -> Result<UserProfile, ApiError> {
        self.get_json("/auth/me", Some(access_token)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_paths() {
        let api = HttpAuthApi::new("http://localhost:8000/");
        assert_eq!(api.url("/auth/me"), "http://localhost:8000/auth/me");
        assert_eq!(api.url("auth/refresh"), "http://localhost:8000/auth/refresh");
        assert_eq!(api.url("https://other/x"), "https://other/x");
    }
}
