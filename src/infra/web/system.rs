//! System endpoints: function CRUD, scaling, logs, health, config view and
//! metrics text.

use std::collections::BTreeMap;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::header::{ACCEPT, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::AppState;
use crate::domain::model::{ContainerInfo, FunctionDeployment, FunctionStatus, SystemInfo};
use crate::error::{GatewayError, Result};
use crate::metrics;
use crate::validation::{normalize_function_name, validate_function_name};

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_LOG_TAIL: i64 = 100;

/// GET /system/info
pub async fn info() -> Json<SystemInfo> {
    Json(SystemInfo::current())
}

/// GET /system/functions
pub async fn list_functions(
    State(state): State<AppState>,
) -> Result<Json<Vec<FunctionStatus>>> {
    Ok(Json(state.service.list_statuses().await?))
}

/// POST /system/functions
pub async fn deploy_function(
    State(state): State<AppState>,
    Json(mut deployment): Json<FunctionDeployment>,
) -> Result<impl IntoResponse> {
    deployment.service = normalize_function_name(&deployment.service);
    state.service.deploy(deployment).await?;
    Ok((StatusCode::ACCEPTED, "Function deployed successfully"))
}

/// PUT /system/functions
pub async fn update_function(
    State(state): State<AppState>,
    Json(mut deployment): Json<FunctionDeployment>,
) -> Result<impl IntoResponse> {
    deployment.service = normalize_function_name(&deployment.service);
    state.service.update(deployment).await?;
    Ok((StatusCode::ACCEPTED, "Function updated successfully"))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct DeletePayload {
    function_name: String,
    service: String,
}

/// DELETE /system/functions?functionName=... (name also accepted in a JSON
/// body as `functionName` or `service`)
pub async fn delete_function(
    State(state): State<AppState>,
    Query(params): Query<std::collections::HashMap<String, String>>,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let mut name = params.get("functionName").cloned().unwrap_or_default();
    if name.is_empty() && !body.is_empty() {
        if let Ok(payload) = serde_json::from_slice::<DeletePayload>(&body) {
            name = if !payload.function_name.is_empty() {
                payload.function_name
            } else {
                payload.service
            };
        }
    }

    let name = normalize_function_name(&name);
    state.service.delete(&name).await?;
    Ok((StatusCode::ACCEPTED, "Function deleted successfully"))
}

/// GET /system/function/:name/containers
pub async fn function_containers(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Vec<ContainerInfo>>> {
    let name = normalize_function_name(&name);
    Ok(Json(state.service.function_containers(&name).await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ScalePayload {
    service_name: String,
    service: String,
    function_name: String,
    replicas: i64,
}

/// POST /system/scale-function/:name
pub async fn scale_function(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let mut payload = ScalePayload::default();
    if !body.is_empty() {
        payload = serde_json::from_slice(&body)
            .map_err(|_| GatewayError::bad_request("invalid request body"))?;
    }

    let service = [payload.service_name, payload.service, payload.function_name]
        .into_iter()
        .find(|candidate| !candidate.is_empty())
        .unwrap_or(name);
    let service = normalize_function_name(&service);

    state.service.scale(&service, payload.replicas).await?;
    Ok((StatusCode::ACCEPTED, "Function scaled successfully"))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    name: String,
    tail: Option<i64>,
}

/// GET /system/logs?name=...&tail=N
pub async fn function_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Result<Response> {
    let name = normalize_function_name(&query.name);
    validate_function_name(&name)?;

    let logs = state
        .service
        .logs(&name, query.tail.unwrap_or(DEFAULT_LOG_TAIL))
        .await?;
    Ok(([(CONTENT_TYPE, "text/plain")], logs).into_response())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigView {
    auth_enabled: bool,
    require_auth_for_functions: bool,
    cors_allowed_origins: Vec<String>,
    functions_network: String,
    default_replicas: i64,
    max_replicas: i64,
    metrics_enabled: bool,
    metrics_port: u16,
    debug_bind_address: String,
    auth_rate_limit: u32,
    auth_rate_window_seconds: u64,
    auth_token_ttl_seconds: u64,
    build_history_limit: usize,
    build_history_retention_seconds: u64,
    build_output_limit: usize,
}

/// GET /system/config: sanitized view, no credentials.
pub async fn config_view(State(state): State<AppState>) -> Json<ConfigView> {
    let config = &state.config;
    Json(ConfigView {
        auth_enabled: config.auth_enabled,
        require_auth_for_functions: config.require_auth_for_functions,
        cors_allowed_origins: config.cors_origins(),
        functions_network: config.functions_network.clone(),
        default_replicas: config.default_replicas,
        max_replicas: config.max_replicas,
        metrics_enabled: config.metrics_enabled,
        metrics_port: config.metrics_port,
        debug_bind_address: config.debug_bind_address.clone(),
        auth_rate_limit: config.auth_rate_limit,
        auth_rate_window_seconds: config.auth_rate_window,
        auth_token_ttl_seconds: config.auth_token_ttl,
        build_history_limit: config.build_history_limit,
        build_history_retention_seconds: config.build_history_retention,
        build_output_limit: config.build_output_limit,
    })
}

/// GET /system/metrics (also served by the dedicated metrics listener).
pub async fn metrics_text() -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        metrics::render(),
    )
}

/// GET /healthz: store, engine and base-network checks under a shared
/// deadline; JSON or plain text depending on the Accept header.
pub async fn healthz(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let mut checks = BTreeMap::new();
    let mut healthy = true;

    let engine = state.service.engine();
    let result = tokio::time::timeout(HEALTH_CHECK_TIMEOUT, async {
        let database = state.service.store_ping().await;
        let docker = engine.ping().await;
        let network = engine.check_network().await;
        (database, docker, network)
    })
    .await;

    match result {
        Ok((database, docker, network)) => {
            for (check, outcome) in [("database", database), ("docker", docker), ("network", network)]
            {
                match outcome {
                    Ok(()) => {
                        checks.insert(check, "ok".to_string());
                    }
                    Err(error) => {
                        checks.insert(check, error.to_string());
                        healthy = false;
                    }
                }
            }
        }
        Err(_) => {
            checks.insert("timeout", "health check timed out".to_string());
            healthy = false;
        }
    }

    let wants_json = headers
        .get(ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map(|accept| accept.contains("application/json"))
        .unwrap_or(false);

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    if wants_json {
        let body = json!({
            "status": if healthy { "ok" } else { "unhealthy" },
            "checks": checks,
        });
        (status, Json(body)).into_response()
    } else {
        (status, if healthy { "OK" } else { "Unhealthy" }).into_response()
    }
}
