//! mrs-auth - Authentication service
//!
//! Issues RS256 access tokens backed by server-side sessions with rotating
//! refresh tokens, and exposes them over a small JSON HTTP API.

pub mod core;
