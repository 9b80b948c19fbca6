//! HTTP client for services that consume the auth API
//!
//! Unwraps the response envelope and maps status codes back to typed errors.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::core::auth::api::{Envelope, REQUEST_ID_HEADER, RevokeAllResponse};
use crate::core::auth::claims::{Claims, FlowType, Tokens};
use crate::core::auth::jwt::Jwks;

/// Auth client errors
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("bad request")]
    BadRequest,

    #[error("auth service returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("auth service response carried no payload")]
    EmptyResponse,

    #[error("auth service request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Client for the auth API
#[derive(Debug, Clone)]
pub struct AuthClient {
    http: reqwest::Client,
    base_url: String,
}

impl AuthClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();

        Ok(Self { http, base_url })
    }

    pub async fn generate_anonymous_tokens(&self) -> Result<Tokens, ClientError> {
        self.post("/anonymous", &json!({}), None).await
    }

    pub async fn login(
        &self,
        username: &str,
        md5_password: &str,
        flow: FlowType,
    ) -> Result<Tokens, ClientError> {
        let body = json!({
            "username": username,
            "md5Password": md5_password,
            "flow": flow,
        });
        self.post("/login", &body, None).await
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<Tokens, ClientError> {
        self.post("/refresh", &json!({ "refreshToken": refresh_token }), None)
            .await
    }

    pub async fn validate_access_token(&self, access_token: &str) -> Result<Claims, ClientError> {
        self.post("/validate", &json!({ "accessToken": access_token }), None)
            .await
    }

    pub async fn revoke(&self, access_token: &str) -> Result<(), ClientError> {
        let _: String = self.post("/logout", &json!({}), Some(access_token)).await?;
        Ok(())
    }

    /// Revoke every session of the token's subject, returning how many ended
    pub async fn revoke_all(&self, access_token: &str) -> Result<usize, ClientError> {
        let response: RevokeAllResponse = self
            .post("/logout/all", &json!({}), Some(access_token))
            .await?;
        Ok(response.revoked)
    }

    pub async fn jwks(&self) -> Result<Jwks, ClientError> {
        let response = self
            .http
            .get(format!("{}/.well-known/jwks.json", self.base_url))
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            status => Err(ClientError::Status {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or_default().to_string(),
            }),
        }
    }

    async fn post<B, T>(
        &self,
        path: &str,
        body: &B,
        bearer: Option<&str>,
    ) -> Result<T, ClientError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut request = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header(REQUEST_ID_HEADER, uuid::Uuid::new_v4().to_string())
            .json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        let envelope: Envelope<T> = response.json().await?;

        match status {
            StatusCode::OK => envelope.response.ok_or(ClientError::EmptyResponse),
            StatusCode::UNAUTHORIZED => Err(ClientError::Unauthorized),
            StatusCode::BAD_REQUEST => Err(ClientError::BadRequest),
            status => Err(ClientError::Status {
                status: status.as_u16(),
                message: envelope.error.unwrap_or_default(),
            }),
        }
    }
}
