//! Auth API endpoints
//!
//! Provides REST API endpoints over the token authority:
//! - GET / - Health check
//! - POST /anonymous - Tokens for a new anonymous principal
//! - POST /login - Tokens for a username / password pair
//! - POST /refresh - Rotate a refresh token
//! - POST /logout - Revoke the session of the bearer token
//! - POST /logout/all - Revoke every session of the bearer token's subject
//! - POST /validate - Claims of a live access token
//! - GET /.well-known/jwks.json - Public signing keys
//!
//! Every response except the key set is wrapped in an [`Envelope`].

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{FromRequestParts, Request, State, rejection::JsonRejection},
    http::{HeaderName, HeaderValue, Method, StatusCode, header, request::Parts},
    middleware::{Next, from_fn},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
    typed_header::TypedHeaderRejection,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::core::auth::authority::{AuthError, TokenAuthority};
use crate::core::auth::claims::FlowType;
use crate::core::context::CallContext;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Auth API state
#[derive(Clone)]
pub struct AuthApiState {
    pub authority: Arc<TokenAuthority>,
    /// Deadline applied to the outbound calls of each request
    pub request_timeout: Duration,
}

/// Response envelope shared by every endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(response: T) -> Self {
        Self {
            status_code: StatusCode::OK.as_u16(),
            response: Some(response),
            error: None,
        }
    }
}

impl Envelope<()> {
    /// Error envelope carrying only the status text
    pub fn error(status: StatusCode) -> Self {
        Self {
            status_code: status.as_u16(),
            response: None,
            error: Some(status_text(status)),
        }
    }
}

fn status_text(status: StatusCode) -> String {
    status.canonical_reason().unwrap_or("Unknown").to_string()
}

fn respond<T: Serialize>(body: T) -> Response {
    (StatusCode::OK, Json(Envelope::ok(body))).into_response()
}

fn fail(status: StatusCode) -> Response {
    (status, Json(Envelope::error(status))).into_response()
}

/// Convert AuthError to API response
impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match self {
            AuthError::Unauthorized => StatusCode::UNAUTHORIZED,
            AuthError::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        };
        fail(status)
    }
}

/// Request for POST /login
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    #[serde(rename = "md5Password")]
    pub md5_password: String,
    #[serde(default)]
    pub flow: FlowType,
}

/// Request for POST /refresh
#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    #[serde(rename = "refreshToken")]
    pub refresh_token: String,
}

/// Request for POST /validate
#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    #[serde(rename = "accessToken")]
    pub access_token: String,
}

/// Response for POST /logout/all
#[derive(Debug, Serialize, Deserialize)]
pub struct RevokeAllResponse {
    pub revoked: usize,
}

/// Request id assigned by [`request_id`]
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Keep the caller's `X-Request-ID` or generate one, and echo it back
pub async fn request_id(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    req.extensions_mut().insert(RequestId(id.clone()));
    let mut resp = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        resp.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    resp
}

/// Per-request [`CallContext`] carrying the request id and the configured deadline
pub struct RequestContext(pub CallContext);

impl FromRequestParts<Arc<AuthApiState>> for RequestContext {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AuthApiState>,
    ) -> Result<Self, Self::Rejection> {
        let mut ctx = CallContext::with_timeout(state.request_timeout);
        if let Some(RequestId(id)) = parts.extensions.get::<RequestId>() {
            ctx = ctx.request_id(id.clone());
        }
        Ok(RequestContext(ctx))
    }
}

/// Run an authority call on its own task.
///
/// The server drops the handler future when the client goes away. The call
/// keeps running on the spawned task: dropping the handler only cancels `ctx`,
/// so pending store calls return early and compensation still completes.
async fn run_guarded<F, Fut, T>(ctx: CallContext, call: F) -> Result<T, AuthError>
where
    F: FnOnce(CallContext) -> Fut,
    Fut: Future<Output = Result<T, AuthError>> + Send + 'static,
    T: Send + 'static,
{
    let token = CancellationToken::new();
    let _cancel_on_drop = token.clone().drop_guard();
    let request_id = ctx.id().to_string();

    match tokio::spawn(call(ctx.cancellation(token))).await {
        Ok(result) => result,
        Err(err) => {
            tracing::error!(request_id = %request_id, error = %err, "Authority call aborted");
            Err(AuthError::InternalError)
        }
    }
}

/// Create the auth API router
pub fn auth_api_router(state: AuthApiState) -> Router {
    let state = Arc::new(state);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static(REQUEST_ID_HEADER),
            HeaderName::from_static("x-forwarded-proto"),
        ])
        .max_age(Duration::from_secs(300));

    Router::new()
        .route("/", get(health_handler))
        .route("/anonymous", post(anonymous_handler))
        .route("/login", post(login_handler))
        .route("/refresh", post(refresh_handler))
        .route("/logout", post(logout_handler))
        .route("/logout/all", post(logout_all_handler))
        .route("/validate", post(validate_handler))
        .route("/.well-known/jwks.json", get(jwks_handler))
        .fallback(|| async { fail(StatusCode::NOT_FOUND) })
        .layer(TraceLayer::new_for_http())
        .layer(from_fn(request_id))
        .layer(cors)
        .with_state(state)
}

/// GET /
async fn health_handler() -> Response {
    respond(status_text(StatusCode::OK))
}

/// POST /anonymous
/// Tokens for a freshly generated anonymous principal
async fn anonymous_handler(
    State(state): State<Arc<AuthApiState>>,
    RequestContext(ctx): RequestContext,
) -> Result<Response, AuthError> {
    let principal_id = Uuid::new_v4().to_string();
    tracing::debug!(request_id = ctx.id(), principal_id = %principal_id, "Anonymous login");

    let authority = state.authority.clone();
    let tokens = run_guarded(ctx, move |ctx| async move {
        authority
            .issue_anonymous(&ctx, &principal_id, FlowType::WebsiteSession)
            .await
    })
    .await?;

    Ok(respond(tokens))
}

/// POST /login
async fn login_handler(
    State(state): State<Arc<AuthApiState>>,
    RequestContext(ctx): RequestContext,
    request: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Response, AuthError> {
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => return Ok(bad_request(&ctx, rejection)),
    };

    tracing::info!(request_id = ctx.id(), username = %request.username, "Login attempt");

    let authority = state.authority.clone();
    let tokens = run_guarded(ctx, move |ctx| async move {
        let LoginRequest {
            username,
            md5_password,
            flow,
        } = request;
        authority
            .issue_for_credentials(&ctx, &username, &md5_password, flow)
            .await
    })
    .await?;

    Ok(respond(tokens))
}

/// POST /refresh
async fn refresh_handler(
    State(state): State<Arc<AuthApiState>>,
    RequestContext(ctx): RequestContext,
    request: Result<Json<RefreshRequest>, JsonRejection>,
) -> Result<Response, AuthError> {
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => return Ok(bad_request(&ctx, rejection)),
    };

    tracing::debug!(request_id = ctx.id(), "Token refresh request");

    let authority = state.authority.clone();
    let tokens = run_guarded(ctx, move |ctx| async move {
        authority.refresh(&ctx, &request.refresh_token).await
    })
    .await?;

    Ok(respond(tokens))
}

/// POST /logout
async fn logout_handler(
    State(state): State<Arc<AuthApiState>>,
    RequestContext(ctx): RequestContext,
    bearer: Result<TypedHeader<Authorization<Bearer>>, TypedHeaderRejection>,
) -> Result<Response, AuthError> {
    let token = match bearer {
        Ok(TypedHeader(Authorization(bearer))) => bearer,
        Err(rejection) => return Ok(bad_request(&ctx, rejection)),
    };

    let authority = state.authority.clone();
    run_guarded(ctx, move |ctx| async move {
        authority.revoke(&ctx, token.token()).await
    })
    .await?;

    Ok(respond(status_text(StatusCode::OK)))
}

/// POST /logout/all
/// Revoke every session of the bearer token's subject
async fn logout_all_handler(
    State(state): State<Arc<AuthApiState>>,
    RequestContext(ctx): RequestContext,
    bearer: Result<TypedHeader<Authorization<Bearer>>, TypedHeaderRejection>,
) -> Result<Response, AuthError> {
    let token = match bearer {
        Ok(TypedHeader(Authorization(bearer))) => bearer,
        Err(rejection) => return Ok(bad_request(&ctx, rejection)),
    };

    let authority = state.authority.clone();
    let revoked = run_guarded(ctx, move |ctx| async move {
        let claims = authority.validate(&ctx, token.token()).await?;
        authority.revoke_all(&ctx, &claims.sub).await
    })
    .await?;

    Ok(respond(RevokeAllResponse { revoked }))
}

/// POST /validate
async fn validate_handler(
    State(state): State<Arc<AuthApiState>>,
    RequestContext(ctx): RequestContext,
    request: Result<Json<ValidateRequest>, JsonRejection>,
) -> Result<Response, AuthError> {
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => return Ok(bad_request(&ctx, rejection)),
    };

    let authority = state.authority.clone();
    let claims = run_guarded(ctx, move |ctx| async move {
        authority.validate(&ctx, &request.access_token).await
    })
    .await?;

    Ok(respond(claims))
}

/// GET /.well-known/jwks.json
/// Served bare, as JWKS consumers expect
async fn jwks_handler(State(state): State<Arc<AuthApiState>>) -> Response {
    Json(state.authority.public_keys()).into_response()
}

fn bad_request(ctx: &CallContext, rejection: impl std::fmt::Display) -> Response {
    tracing::info!(request_id = ctx.id(), error = %rejection, "Malformed request");
    fail(StatusCode::BAD_REQUEST)
}
