//! Authentication middleware for services that consume the auth API
//!
//! Resolves the caller's access token, validates it through [`AuthClient`] and
//! inserts the resulting [`Claims`] into the request extensions. The token is
//! taken from, in order:
//!
//! 1. the `Authorization: Bearer` header
//! 2. the `MRSAccessToken` cookie
//! 3. the `MRSRefreshToken` cookie, rotated through the auth service
//! 4. fresh anonymous tokens
//!
//! Cases 3 and 4 set the new tokens as cookies on the response.
//!
//! ```ignore
//! let app = Router::new()
//!     .route("/movies", get(list_movies))
//!     .layer(from_fn_with_state(auth_client, authenticate));
//! ```

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::{
    TypedHeader,
    extract::cookie::{Cookie, CookieJar, SameSite},
    headers::{Authorization, authorization::Bearer},
    typed_header::TypedHeaderRejection,
};

use crate::core::auth::claims::{Claims, Tokens};
use crate::core::auth::client::{AuthClient, ClientError};

pub const ACCESS_TOKEN_COOKIE: &str = "MRSAccessToken";
pub const REFRESH_TOKEN_COOKIE: &str = "MRSRefreshToken";

/// Where the access token of a request came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Header,
    AccessCookie,
    Refreshed,
    Anonymous,
}

/// Authenticate the request or answer 401.
///
/// Use with `axum::middleware::from_fn_with_state`. Downstream handlers read the
/// caller with `Extension<Claims>`.
pub async fn authenticate(
    State(client): State<AuthClient>,
    jar: CookieJar,
    bearer: Result<TypedHeader<Authorization<Bearer>>, TypedHeaderRejection>,
    mut req: Request,
    next: Next,
) -> Response {
    let secure = forwarded_https(req.headers());

    let (access_token, source, jar) = match bearer {
        Ok(TypedHeader(Authorization(bearer))) => {
            (bearer.token().to_string(), Source::Header, jar)
        }
        Err(rejection) if !rejection.is_missing() => {
            tracing::debug!(error = %rejection, "Unusable Authorization header");
            return StatusCode::UNAUTHORIZED.into_response();
        }
        Err(_) => match token_from_cookies(&client, jar, secure).await {
            Ok(resolved) => resolved,
            Err(response) => return response,
        },
    };

    let claims = match client.validate_access_token(&access_token).await {
        Ok(claims) => claims,
        Err(err) => {
            let status = rejection_status(&err);
            tracing::info!(source = ?source, error = %err, "Access token rejected");
            if source == Source::AccessCookie && status == StatusCode::UNAUTHORIZED {
                return (clear_session_cookies(jar), status).into_response();
            }
            return status.into_response();
        }
    };

    tracing::debug!(
        subject = %claims.sub,
        level = %claims.level,
        source = ?source,
        "Authenticated"
    );
    req.extensions_mut().insert(claims);

    (jar, next.run(req).await).into_response()
}

async fn token_from_cookies(
    client: &AuthClient,
    jar: CookieJar,
    secure: bool,
) -> Result<(String, Source, CookieJar), Response> {
    if let Some(token) = cookie_value(&jar, ACCESS_TOKEN_COOKIE) {
        return Ok((token, Source::AccessCookie, jar));
    }

    if let Some(refresh_token) = cookie_value(&jar, REFRESH_TOKEN_COOKIE) {
        return match client.refresh(&refresh_token).await {
            Ok(tokens) => {
                let jar = set_session_cookies(jar, &tokens, secure);
                Ok((tokens.access_token, Source::Refreshed, jar))
            }
            Err(err) => {
                let status = rejection_status(&err);
                tracing::info!(error = %err, "Failed to refresh session from cookie");
                if status == StatusCode::UNAUTHORIZED {
                    return Err((clear_session_cookies(jar), status).into_response());
                }
                Err(status.into_response())
            }
        };
    }

    match client.generate_anonymous_tokens().await {
        Ok(tokens) => {
            let jar = set_session_cookies(jar, &tokens, secure)
                .remove(Cookie::build(REFRESH_TOKEN_COOKIE).path("/"));
            Ok((tokens.access_token, Source::Anonymous, jar))
        }
        Err(err) => {
            tracing::error!(error = %err, "Failed to generate anonymous tokens");
            Err(rejection_status(&err).into_response())
        }
    }
}

fn cookie_value(jar: &CookieJar, name: &str) -> Option<String> {
    jar.get(name)
        .map(|cookie| cookie.value().to_string())
        .filter(|value| !value.is_empty())
}

/// Set the access cookie, and the refresh cookie when `tokens` carries one
fn set_session_cookies(jar: CookieJar, tokens: &Tokens, secure: bool) -> CookieJar {
    let jar = jar.add(session_cookie(
        ACCESS_TOKEN_COOKIE,
        tokens.access_token.clone(),
        tokens.access_token_expires_in,
        secure,
    ));

    match (&tokens.refresh_token, tokens.refresh_token_expires_in) {
        (Some(refresh_token), Some(max_age)) => jar.add(session_cookie(
            REFRESH_TOKEN_COOKIE,
            refresh_token.clone(),
            max_age,
            secure,
        )),
        _ => jar,
    }
}

fn clear_session_cookies(jar: CookieJar) -> CookieJar {
    jar.remove(Cookie::build(ACCESS_TOKEN_COOKIE).path("/"))
        .remove(Cookie::build(REFRESH_TOKEN_COOKIE).path("/"))
}

fn session_cookie(
    name: &'static str,
    value: String,
    max_age_secs: u64,
    secure: bool,
) -> Cookie<'static> {
    let max_age = i64::try_from(max_age_secs).unwrap_or(i64::MAX);

    Cookie::build((name, value))
        .http_only(true)
        .secure(secure)
        .path("/")
        .max_age(time::Duration::seconds(max_age))
        .same_site(SameSite::Lax)
        .build()
}

/// The request reached the proxy in front of this service over HTTPS
fn forwarded_https(headers: &HeaderMap) -> bool {
    headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|proto| proto.eq_ignore_ascii_case("https"))
}

/// Rejections by the auth service are 401; an unreachable or failing one is 502
fn rejection_status(err: &ClientError) -> StatusCode {
    match err {
        ClientError::Unauthorized | ClientError::BadRequest => StatusCode::UNAUTHORIZED,
        ClientError::Status { .. } | ClientError::EmptyResponse | ClientError::Http(_) => {
            StatusCode::BAD_GATEWAY
        }
    }
}
