//! Authentication module
//!
//! This module provides:
//! - RS256 access token signing and JWKS publication
//! - Session issuance, rotation, revocation and validation
//! - Credential checking against the user service
//! - REST API endpoints and a client for them
//! - Middleware authenticating requests in services that consume the API

pub mod api;
pub mod authority;
pub mod claims;
pub mod client;
pub mod credentials;
pub mod jwt;
pub mod middleware;

pub use api::{AuthApiState, auth_api_router};
pub use authority::{AuthError, ExpirationPolicy, SessionStores, TokenAuthority};
pub use claims::{Claims, FlowType, Level, Tokens};
pub use client::{AuthClient, ClientError};
pub use credentials::{CredentialChecker, Credentials, Principal, UserServiceClient};
pub use jwt::{Jwk, Jwks, JwtError, JwtService};
pub use middleware::{ACCESS_TOKEN_COOKIE, REFRESH_TOKEN_COOKIE, authenticate};
