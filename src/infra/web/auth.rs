//! Login/logout handlers and the middleware stack: authentication with
//! failed-attempt rate limiting, hand-rolled CORS, and access logging.

use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, ORIGIN};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::{engine::general_purpose, Engine as _};
use chrono::SecondsFormat;
use log::warn;
use serde::{Deserialize, Serialize};

use super::{client_key, AppState};
use crate::auth::{bearer_token, constant_time_eq};
use crate::error::GatewayError;
use crate::metrics;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: String,
}

/// POST /auth/login
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, GatewayError> {
    if state.config.auth_user.is_empty() || state.config.auth_password.is_empty() {
        return Err(GatewayError::Unavailable(
            "auth is not configured".to_string(),
        ));
    }

    let username = request.username.trim();
    let user_match = constant_time_eq(username, &state.config.auth_user);
    let pass_match = constant_time_eq(&request.password, &state.config.auth_password);
    if !user_match || !pass_match {
        return Err(GatewayError::Unauthorized);
    }

    let (token, expires_at) = state.tokens.issue(username)?;
    Ok(Json(LoginResponse {
        token,
        expires_at: expires_at.to_rfc3339_opts(SecondsFormat::Secs, true),
    }))
}

/// POST /auth/logout
pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token);
    let Some(token) = token else {
        return (StatusCode::UNAUTHORIZED, "missing token").into_response();
    };
    state.tokens.revoke(token);
    StatusCode::NO_CONTENT.into_response()
}

/// Authentication middleware. Bearer tokens are checked first; basic
/// credentials are compared in constant time. Failed attempts consume the
/// per-client rate-limit bucket.
pub async fn require_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if !state.config.auth_enabled {
        return next.run(request).await;
    }

    let path = request.uri().path();
    if path == "/healthz" || path == "/auth/login" {
        return next.run(request).await;
    }
    if !state.config.require_auth_for_functions && path.starts_with("/function/") {
        return next.run(request).await;
    }

    let key = client_key(&request);
    let authorization = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();

    if let Some(token) = bearer_token(&authorization) {
        if state.tokens.validate(token).is_some() {
            state.limiter.reset(&key);
            return next.run(request).await;
        }
        return reject(&state, &key);
    }

    if let Some((username, password)) = basic_credentials(&authorization) {
        let user_match = constant_time_eq(&username, &state.config.auth_user);
        let pass_match = constant_time_eq(&password, &state.config.auth_password);
        if user_match && pass_match {
            state.limiter.reset(&key);
            return next.run(request).await;
        }
        warn!("Authentication failed for user: {username} from {key}");
        return reject(&state, &key);
    }

    reject(&state, &key)
}

fn reject(state: &AppState, key: &str) -> Response {
    match state.limiter.allow(key) {
        Ok(()) => unauthorized(),
        Err(retry_after) => too_many_requests(retry_after),
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [("WWW-Authenticate", "Basic realm=\"docker-faas\"")],
        "Unauthorized",
    )
        .into_response()
}

fn too_many_requests(retry_after: Duration) -> Response {
    let seconds = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    (
        StatusCode::TOO_MANY_REQUESTS,
        [("Retry-After", seconds.max(1).to_string())],
        "Too Many Requests",
    )
        .into_response()
}

fn basic_credentials(header: &str) -> Option<(String, String)> {
    let (scheme, payload) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = general_purpose::STANDARD.decode(payload.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Access-log middleware; also feeds the gateway request counter.
pub async fn access_log(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    let status = response.status().as_u16();
    metrics::record_gateway_request(method.as_str(), &path, status);
    log::info!("{method} {path} {status} {:?}", start.elapsed());
    response
}

/// CORS middleware. With no configured origins every origin is allowed,
/// matching the behaviour expected by the bundled UI.
pub async fn cors(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let mut allowed = state.config.cors_origins();
    if allowed.is_empty() {
        allowed = vec!["*".to_string()];
    }

    let origin = request
        .headers()
        .get(ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let allow_origin = match origin {
        Some(ref origin) if allowed.iter().any(|a| a == "*" || a == origin) => {
            Some(origin.clone())
        }
        _ if allowed.len() == 1 && allowed[0] == "*" => Some("*".to_string()),
        _ => None,
    };

    let preflight = request.method() == Method::OPTIONS;
    let mut response = if preflight {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(request).await
    };

    let headers = response.headers_mut();
    if let Some(allow_origin) = allow_origin {
        if let Ok(value) = allow_origin.parse() {
            headers.insert("Access-Control-Allow-Origin", value);
        }
    }
    headers.insert(
        "Access-Control-Allow-Methods",
        "GET, POST, PUT, DELETE, OPTIONS, PATCH".parse().unwrap(),
    );
    headers.insert(
        "Access-Control-Allow-Headers",
        "Content-Type, Authorization, X-Requested-With".parse().unwrap(),
    );
    headers.insert("Access-Control-Allow-Credentials", "true".parse().unwrap());
    headers.insert("Access-Control-Max-Age", "3600".parse().unwrap());

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_credentials_parse() {
        let encoded = general_purpose::STANDARD.encode("admin:secret");
        let (user, pass) = basic_credentials(&format!("Basic {encoded}")).unwrap();
        assert_eq!(user, "admin");
        assert_eq!(pass, "secret");

        assert!(basic_credentials("Bearer abc").is_none());
        assert!(basic_credentials("Basic not-base64!").is_none());
        assert!(basic_credentials("").is_none());
    }

    #[test]
    fn retry_after_rounds_up() {
        let response = too_many_requests(Duration::from_millis(1500));
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get("Retry-After").unwrap().to_str().unwrap(),
            "2"
        );
    }
}
