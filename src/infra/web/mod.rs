//! HTTP surface: routing, shared state, and the middleware stack
//! (CORS -> access log -> auth).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, DefaultBodyLimit, Request};
use axum::middleware;
use axum::routing::{any, get, post};
use axum::Router;

use crate::auth::{AuthRateLimiter, TokenManager};
use crate::build::tracker::BuildTracker;
use crate::build::BuildService;
use crate::config::AppConfig;
use crate::domain::port::SecretStore;
use crate::domain::router::InvocationRouter;
use crate::domain::FaasService;

pub mod auth;
pub mod builds;
pub mod invoke;
pub mod secrets;
pub mod system;

/// Multipart build uploads may carry whole source archives.
const MAX_BODY_BYTES: usize = 250 << 20;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<FaasService>,
    pub router: Arc<InvocationRouter>,
    pub builds: Arc<BuildService>,
    pub tracker: Arc<BuildTracker>,
    pub secrets: Arc<dyn SecretStore>,
    pub tokens: Arc<TokenManager>,
    pub limiter: Arc<AuthRateLimiter>,
    pub config: Arc<AppConfig>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/system/info", get(system::info))
        .route(
            "/system/functions",
            get(system::list_functions)
                .post(system::deploy_function)
                .put(system::update_function)
                .delete(system::delete_function),
        )
        .route(
            "/system/function/:name/containers",
            get(system::function_containers),
        )
        .route("/system/scale-function/:name", post(system::scale_function))
        .route("/system/logs", get(system::function_logs))
        .route(
            "/system/builds",
            post(builds::submit_build)
                .get(builds::list_builds)
                .delete(builds::clear_builds),
        )
        .route("/system/builds/inspect", post(builds::inspect_build))
        .route("/system/builds/stream", get(builds::stream_builds))
        .route("/system/builds/:id", get(builds::get_build))
        .route("/system/config", get(system::config_view))
        .route("/system/metrics", get(system::metrics_text))
        .route(
            "/system/secrets",
            post(secrets::create_secret)
                .put(secrets::update_secret)
                .delete(secrets::delete_secret)
                .get(secrets::list_secrets),
        )
        .route("/system/secrets/:name", get(secrets::get_secret))
        .route("/auth/login", post(auth::login))
        .route("/auth/logout", post(auth::logout))
        .route("/function/:name", any(invoke::invoke_function))
        .route("/async-function/:name", any(invoke::invoke_function_async))
        .route(
            "/system/function-async/:name",
            any(invoke::invoke_function_async),
        )
        .route("/healthz", get(system::healthz))
        .with_state(state.clone())
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(middleware::from_fn_with_state(state.clone(), auth::require_auth))
        .layer(middleware::from_fn(auth::access_log))
        .layer(middleware::from_fn_with_state(state, auth::cors))
}

/// Client address for forwarded headers; `ip:port` like the socket reports.
pub fn client_addr(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Rate-limit key for a client: first `X-Forwarded-For` entry when present,
/// else the remote host.
pub fn client_key(request: &Request) -> String {
    if let Some(forwarded) = request
        .headers()
        .get("X-Forwarded-For")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
