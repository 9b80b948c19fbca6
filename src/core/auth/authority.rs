//! Token authority
//!
//! Issues, rotates, revokes and validates session tokens. A session is three
//! keyed records sharing one TTL:
//!
//! - access store: `refresh token -> access token`
//! - refresh store: `session key -> refresh token`
//! - flow store: `session key -> flow`
//!
//! where the session key is `<sub>-<iat>` taken from the access token's claims.
//! A session is live while its records exist, independently of the `exp` claim
//! inside the signed token. Anonymous principals get a stateless token and no
//! records at all.

use std::sync::Arc;
use std::time::Duration;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use derive_more::Display;
use rand::RngCore;
use uuid::Uuid;

use crate::core::auth::claims::{Claims, FlowType, Level, Tokens};
use crate::core::auth::credentials::{CredentialChecker, Credentials};
use crate::core::auth::jwt::{Jwks, JwtService};
use crate::core::context::CallContext;
use crate::core::store::{Repository, StoreError, escape_pattern};

/// Size of a refresh token before encoding
const REFRESH_TOKEN_BYTES: usize = 32;

/// Budget for compensating deletes, independent of the caller's deadline
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors visible to callers of the authority
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Internal Server Error")]
    InternalError,
}

/// Lifetimes applied when minting tokens and writing session records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirationPolicy {
    pub access_token: Duration,
    pub anonymous: Duration,
    pub short_refresh_token: Duration,
    pub long_refresh_token: Duration,
}

impl Default for ExpirationPolicy {
    fn default() -> Self {
        Self {
            access_token: Duration::from_secs(15 * 60),
            anonymous: Duration::from_secs(60 * 60),
            short_refresh_token: Duration::from_secs(24 * 60 * 60),
            long_refresh_token: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

impl ExpirationPolicy {
    /// Lifetime of the signed access token
    pub fn access_ttl(&self, level: Level) -> Duration {
        match level {
            Level::Anonymous => self.anonymous,
            Level::Admin | Level::User => self.access_token,
        }
    }

    /// Lifetime shared by the three session records
    pub fn record_ttl(&self, flow: FlowType) -> Duration {
        match flow {
            FlowType::RememberMe => self.long_refresh_token,
            FlowType::WebsiteSession => self.short_refresh_token,
        }
    }
}

/// The three logical stores backing sessions
#[derive(Clone)]
pub struct SessionStores {
    pub access_tokens: Arc<dyn Repository>,
    pub refresh_tokens: Arc<dyn Repository>,
    pub flows: Arc<dyn Repository>,
}

impl SessionStores {
    /// Build each of the three stores with `make`
    pub fn build_with<R, F>(mut make: F) -> Self
    where
        R: Repository + 'static,
        F: FnMut() -> R,
    {
        Self {
            access_tokens: Arc::new(make()),
            refresh_tokens: Arc::new(make()),
            flows: Arc::new(make()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
enum Store {
    #[display("access token")]
    AccessToken,
    #[display("refresh token")]
    RefreshToken,
    #[display("flow")]
    Flow,
}

/// Issues and tracks access/refresh token pairs
pub struct TokenAuthority {
    jwt: JwtService,
    credentials: Arc<dyn CredentialChecker>,
    stores: SessionStores,
    expiration: ExpirationPolicy,
}

impl TokenAuthority {
    pub fn new(
        jwt: JwtService,
        credentials: Arc<dyn CredentialChecker>,
        stores: SessionStores,
        expiration: ExpirationPolicy,
    ) -> Self {
        Self {
            jwt,
            credentials,
            stores,
            expiration,
        }
    }

    pub fn jwt(&self) -> &JwtService {
        &self.jwt
    }

    pub fn expiration(&self) -> &ExpirationPolicy {
        &self.expiration
    }

    /// Public key material for verifying access token signatures
    pub fn public_keys(&self) -> Jwks {
        self.jwt.jwks()
    }

    /// Issue a stateless token for a transient principal.
    ///
    /// No record is written, so the token cannot be refreshed or revoked and
    /// lives exactly as long as its `exp` claim.
    pub async fn issue_anonymous(
        &self,
        ctx: &CallContext,
        principal_id: &str,
        flow: FlowType,
    ) -> Result<Tokens, AuthError> {
        let claims = Claims::new(principal_id, Level::Anonymous, None);
        self.mint(ctx, claims, flow).await
    }

    /// Check `username`/`password` with the user service and open a session
    pub async fn issue_for_credentials(
        &self,
        ctx: &CallContext,
        username: &str,
        password: &str,
        flow: FlowType,
    ) -> Result<Tokens, AuthError> {
        let credentials = Credentials::new(username, password).map_err(|err| {
            tracing::info!(request_id = ctx.id(), error = %err, "Rejected login input");
            AuthError::Unauthorized
        })?;

        let principal = ctx
            .run(self.credentials.check_credentials(&credentials))
            .await
            .map_err(|err| {
                if err.is_rejection() {
                    tracing::info!(
                        request_id = ctx.id(),
                        subject = credentials.username(),
                        error = %err,
                        "Credentials rejected"
                    );
                    AuthError::Unauthorized
                } else {
                    tracing::error!(
                        request_id = ctx.id(),
                        subject = credentials.username(),
                        error = %err,
                        "Credential check failed"
                    );
                    AuthError::InternalError
                }
            })?;

        let name = principal.name.filter(|name| !name.is_empty());
        let claims = Claims::new(credentials.username(), principal.level, name);
        let tokens = self.mint(ctx, claims, flow).await?;

        tracing::info!(
            request_id = ctx.id(),
            subject = credentials.username(),
            %flow,
            "Session issued"
        );
        Ok(tokens)
    }

    /// Exchange a refresh token for a new pair, invalidating the old one.
    ///
    /// Works for an expired access token: the stored token only has to prove
    /// which session it belongs to. There is no compare-and-delete across the
    /// lookups and writes, so two concurrent calls with the same refresh token
    /// can both succeed and leave two live sessions.
    pub async fn refresh(
        &self,
        ctx: &CallContext,
        refresh_token: &str,
    ) -> Result<Tokens, AuthError> {
        let access_token = self.lookup(ctx, Store::AccessToken, refresh_token).await?;
        let mut claims = self.parse(ctx, &access_token)?;

        let old_key = claims.session_key();
        let stored_refresh = self.lookup(ctx, Store::RefreshToken, &old_key).await?;
        if stored_refresh != refresh_token {
            tracing::debug!(
                request_id = ctx.id(),
                key = %old_key,
                "Refresh token does not match session"
            );
            return Err(AuthError::Unauthorized);
        }

        let flow = self.lookup(ctx, Store::Flow, &old_key).await?;
        let flow = flow.parse::<FlowType>().unwrap_or_else(|err| {
            tracing::warn!(
                request_id = ctx.id(),
                key = %old_key,
                error = %err,
                "Unreadable flow record, falling back to website session"
            );
            FlowType::WebsiteSession
        });

        let access_ttl = self.stamp(&mut claims);
        let new_access_token = self.sign(ctx, &claims)?;
        let new_refresh_token = generate_refresh_token();
        let record_ttl = self.expiration.record_ttl(flow);

        self.save(
            ctx,
            Store::AccessToken,
            &new_refresh_token,
            &new_access_token,
            record_ttl,
        )
        .await?;

        self.remove(ctx, Store::RefreshToken, &old_key).await;
        self.remove(ctx, Store::Flow, &old_key).await;

        let new_key = claims.session_key();
        if let Err(err) = self
            .save(
                ctx,
                Store::RefreshToken,
                &new_key,
                &new_refresh_token,
                record_ttl,
            )
            .await
        {
            self.compensate(ctx, &[(Store::AccessToken, new_refresh_token.as_str())])
                .await;
            return Err(err);
        }

        self.remove(ctx, Store::AccessToken, refresh_token).await;

        if let Err(err) = self
            .save(ctx, Store::Flow, &new_key, &flow.to_string(), record_ttl)
            .await
        {
            self.compensate(
                ctx,
                &[
                    (Store::AccessToken, new_refresh_token.as_str()),
                    (Store::RefreshToken, new_key.as_str()),
                ],
            )
            .await;
            return Err(err);
        }

        tracing::info!(
            request_id = ctx.id(),
            subject = %claims.sub,
            key = %new_key,
            "Session rotated"
        );

        Ok(Tokens {
            access_token: new_access_token,
            refresh_token: Some(new_refresh_token),
            access_token_expires_in: access_ttl.as_secs(),
            refresh_token_expires_in: Some(record_ttl.as_secs()),
        })
    }

    /// End the session `access_token` belongs to.
    ///
    /// Succeeds once the session is found; failed deletes are only logged.
    pub async fn revoke(&self, ctx: &CallContext, access_token: &str) -> Result<(), AuthError> {
        let claims = self.parse(ctx, access_token)?;
        let key = claims.session_key();
        let refresh_token = self.lookup(ctx, Store::RefreshToken, &key).await?;

        self.remove(ctx, Store::AccessToken, &refresh_token).await;
        self.remove(ctx, Store::RefreshToken, &key).await;
        self.remove(ctx, Store::Flow, &key).await;

        tracing::info!(request_id = ctx.id(), subject = %claims.sub, key = %key, "Session revoked");
        Ok(())
    }

    /// End every session of `subject`, returning how many were found
    pub async fn revoke_all(&self, ctx: &CallContext, subject: &str) -> Result<usize, AuthError> {
        let pattern = format!("{}-*", escape_pattern(subject));
        let keys = ctx
            .run(self.stores.refresh_tokens.keys(&pattern))
            .await
            .map_err(|err| {
                tracing::error!(
                    request_id = ctx.id(),
                    subject,
                    error = %err,
                    "Failed to list sessions"
                );
                AuthError::InternalError
            })?;

        let mut revoked = 0;
        for key in keys {
            // `alice-*` also matches sessions of a subject named `alice-x`
            if !belongs_to(&key, subject) {
                continue;
            }

            let refresh_token = match self.lookup(ctx, Store::RefreshToken, &key).await {
                Ok(token) => token,
                Err(AuthError::Unauthorized) => continue,
                Err(err) => return Err(err),
            };

            self.remove(ctx, Store::AccessToken, &refresh_token).await;
            self.remove(ctx, Store::RefreshToken, &key).await;
            self.remove(ctx, Store::Flow, &key).await;
            revoked += 1;
        }

        tracing::info!(request_id = ctx.id(), subject, revoked, "All sessions revoked");
        Ok(revoked)
    }

    /// Return the claims of `access_token` if its session is live.
    ///
    /// Anonymous tokens have no session, so a good signature and an unexpired
    /// `exp` are enough. Any other token must be the one currently stored for
    /// its session.
    pub async fn validate(
        &self,
        ctx: &CallContext,
        access_token: &str,
    ) -> Result<Claims, AuthError> {
        let claims = self.parse(ctx, access_token)?;

        if claims.is_anonymous() {
            if claims.exp < Utc::now().timestamp() {
                tracing::debug!(
                    request_id = ctx.id(),
                    subject = %claims.sub,
                    "Anonymous token expired"
                );
                return Err(AuthError::Unauthorized);
            }
            return Ok(claims);
        }

        let key = claims.session_key();
        let refresh_token = self.lookup(ctx, Store::RefreshToken, &key).await?;
        let stored = self.lookup(ctx, Store::AccessToken, &refresh_token).await?;
        if stored != access_token {
            tracing::debug!(request_id = ctx.id(), key = %key, "Access token superseded");
            return Err(AuthError::Unauthorized);
        }

        Ok(claims)
    }

    // ========================================================================
    // Minting
    // ========================================================================

    async fn mint(
        &self,
        ctx: &CallContext,
        mut claims: Claims,
        flow: FlowType,
    ) -> Result<Tokens, AuthError> {
        let access_ttl = self.stamp(&mut claims);
        let access_token = self.sign(ctx, &claims)?;

        if claims.is_anonymous() {
            return Ok(Tokens {
                access_token,
                refresh_token: None,
                access_token_expires_in: access_ttl.as_secs(),
                refresh_token_expires_in: None,
            });
        }

        let refresh_token = generate_refresh_token();
        let record_ttl = self.expiration.record_ttl(flow);
        let key = claims.session_key();

        self.save(
            ctx,
            Store::AccessToken,
            &refresh_token,
            &access_token,
            record_ttl,
        )
        .await?;

        if let Err(err) = self
            .save(ctx, Store::RefreshToken, &key, &refresh_token, record_ttl)
            .await
        {
            self.compensate(ctx, &[(Store::AccessToken, refresh_token.as_str())])
                .await;
            return Err(err);
        }

        if let Err(err) = self
            .save(ctx, Store::Flow, &key, &flow.to_string(), record_ttl)
            .await
        {
            self.compensate(
                ctx,
                &[
                    (Store::RefreshToken, key.as_str()),
                    (Store::AccessToken, refresh_token.as_str()),
                ],
            )
            .await;
            return Err(err);
        }

        Ok(Tokens {
            access_token,
            refresh_token: Some(refresh_token),
            access_token_expires_in: access_ttl.as_secs(),
            refresh_token_expires_in: Some(record_ttl.as_secs()),
        })
    }

    /// Set issuer, timestamps and token id; returns the access token lifetime
    fn stamp(&self, claims: &mut Claims) -> Duration {
        let ttl = self.expiration.access_ttl(claims.level);
        let now = Utc::now().timestamp();

        claims.iss = self.jwt.issuer().to_string();
        claims.iat = now;
        claims.exp = now.saturating_add(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX));
        claims.jti = Uuid::new_v4().to_string();
        ttl
    }

    fn sign(&self, ctx: &CallContext, claims: &Claims) -> Result<String, AuthError> {
        self.jwt.sign(claims).map_err(|err| {
            tracing::error!(
                request_id = ctx.id(),
                subject = %claims.sub,
                error = %err,
                "Failed to sign access token"
            );
            AuthError::InternalError
        })
    }

    fn parse(&self, ctx: &CallContext, access_token: &str) -> Result<Claims, AuthError> {
        self.jwt.decode_ignoring_expiry(access_token).map_err(|err| {
            tracing::debug!(request_id = ctx.id(), error = %err, "Failed to parse access token");
            AuthError::Unauthorized
        })
    }

    // ========================================================================
    // Store access
    // ========================================================================

    fn store(&self, store: Store) -> &dyn Repository {
        match store {
            Store::AccessToken => self.stores.access_tokens.as_ref(),
            Store::RefreshToken => self.stores.refresh_tokens.as_ref(),
            Store::Flow => self.stores.flows.as_ref(),
        }
    }

    async fn lookup(
        &self,
        ctx: &CallContext,
        store: Store,
        key: &str,
    ) -> Result<String, AuthError> {
        match ctx.run(self.store(store).get(key)).await {
            Ok(value) => Ok(value),
            Err(StoreError::NotFound(_)) => {
                tracing::debug!(request_id = ctx.id(), key, "No {store} record");
                Err(AuthError::Unauthorized)
            }
            Err(err) => {
                tracing::error!(
                    request_id = ctx.id(),
                    key,
                    error = %err,
                    "Failed to read {store} record"
                );
                Err(AuthError::InternalError)
            }
        }
    }

    async fn save(
        &self,
        ctx: &CallContext,
        store: Store,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), AuthError> {
        ctx.run(self.store(store).set(key, value, ttl))
            .await
            .map_err(|err| {
                tracing::error!(
                    request_id = ctx.id(),
                    key,
                    error = %err,
                    "Failed to save {store} record"
                );
                AuthError::InternalError
            })
    }

    /// Best-effort delete
    async fn remove(&self, ctx: &CallContext, store: Store, key: &str) {
        if let Err(err) = ctx.run(self.store(store).del(key)).await {
            tracing::warn!(
                request_id = ctx.id(),
                key,
                error = %err,
                "Failed to delete {store} record"
            );
        }
    }

    /// Undo partial writes after a failed save, in the given order
    async fn compensate(&self, ctx: &CallContext, written: &[(Store, &str)]) {
        if ctx.is_cancelled() {
            tracing::info!(
                request_id = ctx.id(),
                records = written.len(),
                "Call cancelled, undoing partial writes"
            );
        }
        let cleanup = ctx.detached(CLEANUP_TIMEOUT);
        for (store, key) in written {
            self.remove(&cleanup, *store, key).await;
        }
    }
}

/// Whether `key` is a session key `<subject>-<iat>`
fn belongs_to(key: &str, subject: &str) -> bool {
    key.strip_prefix(subject)
        .and_then(|rest| rest.strip_prefix('-'))
        .map(|iat| {
            let digits = iat.strip_prefix('-').unwrap_or(iat);
            !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
        })
        .unwrap_or(false)
}

/// Opaque refresh token: 32 random bytes, base64url without padding
pub fn generate_refresh_token() -> String {
    let mut bytes = [0u8; REFRESH_TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
