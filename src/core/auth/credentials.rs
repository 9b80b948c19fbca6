//! Credential checking against the user service
//!
//! The token authority never sees password storage; it hands validated
//! [`Credentials`] to a [`CredentialChecker`] and gets back the principal's
//! identity and level.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::core::auth::claims::Level;
use crate::core::context::Interrupted;

/// Maximum accepted username length
pub const MAX_USERNAME_LENGTH: usize = 64;

/// Reasons a username/secret pair is rejected before any remote call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialsError {
    #[error("Username is required")]
    MissingUsername,

    #[error("Username must not start or end with whitespace")]
    UsernameWhitespace,

    #[error("Username too long (maximum {MAX_USERNAME_LENGTH} characters)")]
    UsernameTooLong,

    #[error("Password is required")]
    MissingSecret,
}

/// Username and secret that passed validation.
///
/// Only [`Credentials::new`] can build one, so every value reaching a
/// [`CredentialChecker`] has been validated.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    secret: String,
}

impl Credentials {
    pub fn new(
        username: impl Into<String>,
        secret: impl Into<String>,
    ) -> Result<Self, CredentialsError> {
        let username = username.into();
        let secret = secret.into();

        if username.trim().is_empty() {
            return Err(CredentialsError::MissingUsername);
        }
        if username.trim() != username {
            return Err(CredentialsError::UsernameWhitespace);
        }
        if username.chars().count() > MAX_USERNAME_LENGTH {
            return Err(CredentialsError::UsernameTooLong);
        }
        if secret.is_empty() {
            return Err(CredentialsError::MissingSecret);
        }

        Ok(Self { username, secret })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Identity returned by a successful credential check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub username: String,
    #[serde(default)]
    pub name: Option<String>,
    pub level: Level,
}

/// Credential check errors
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("user not found in user service")]
    NotFound,

    #[error("bad request to user service")]
    BadRequest,

    #[error("unexpected status from user service: {0}")]
    UnexpectedStatus(u16),

    #[error("user service request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}

impl CredentialError {
    /// Whether the failure means "these credentials are not valid"
    pub fn is_rejection(&self) -> bool {
        matches!(self, CredentialError::NotFound | CredentialError::BadRequest)
    }
}

/// External verifier of username/secret pairs
#[async_trait]
pub trait CredentialChecker: Send + Sync {
    async fn check_credentials(
        &self,
        credentials: &Credentials,
    ) -> Result<Principal, CredentialError>;
}

#[derive(Serialize)]
struct CredentialsPayload<'a> {
    username: &'a str,
    #[serde(rename = "md5Password")]
    md5_password: &'a str,
}

#[derive(Deserialize)]
struct PrincipalResponse {
    response: Principal,
}

/// HTTP client for the user service's `POST /credentials` endpoint
#[derive(Debug, Clone)]
pub struct UserServiceClient {
    http: reqwest::Client,
    endpoint: String,
}

impl UserServiceClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, CredentialError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let endpoint = endpoint.into().trim_end_matches('/').to_string();

        Ok(Self { http, endpoint })
    }
}

#[async_trait]
impl CredentialChecker for UserServiceClient {
    async fn check_credentials(
        &self,
        credentials: &Credentials,
    ) -> Result<Principal, CredentialError> {
        let response = self
            .http
            .post(format!("{}/credentials", self.endpoint))
            .json(&CredentialsPayload {
                username: credentials.username(),
                md5_password: credentials.secret(),
            })
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let body: PrincipalResponse = response.json().await?;
                Ok(body.response)
            }
            StatusCode::BAD_REQUEST => Err(CredentialError::BadRequest),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                Err(CredentialError::NotFound)
            }
            status => Err(CredentialError::UnexpectedStatus(status.as_u16())),
        }
    }
}
