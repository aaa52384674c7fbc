//! Secret CRUD. Values are write-only: reads confirm existence but never
//! return secret material.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::error::{GatewayError, Result};

#[derive(Debug, Deserialize)]
pub struct SecretRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Serialize)]
pub struct SecretResponse {
    pub name: String,
}

/// POST /system/secrets
pub async fn create_secret(
    State(state): State<AppState>,
    Json(request): Json<SecretRequest>,
) -> Result<impl IntoResponse> {
    if request.name.is_empty() || request.value.is_empty() {
        return Err(GatewayError::bad_request("name and value are required"));
    }
    state.secrets.create_secret(&request.name, &request.value)?;
    Ok((
        StatusCode::CREATED,
        Json(SecretResponse { name: request.name }),
    ))
}

/// PUT /system/secrets
pub async fn update_secret(
    State(state): State<AppState>,
    Json(request): Json<SecretRequest>,
) -> Result<impl IntoResponse> {
    if request.name.is_empty() || request.value.is_empty() {
        return Err(GatewayError::bad_request("name and value are required"));
    }
    state.secrets.update_secret(&request.name, &request.value)?;
    Ok(Json(SecretResponse { name: request.name }))
}

/// DELETE /system/secrets?name=...
pub async fn delete_secret(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse> {
    let name = params
        .get("name")
        .filter(|name| !name.is_empty())
        .ok_or_else(|| GatewayError::bad_request("name parameter is required"))?;
    state.secrets.delete_secret(name)?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /system/secrets
pub async fn list_secrets(State(state): State<AppState>) -> Result<Json<Vec<SecretResponse>>> {
    let names = state.secrets.list_secrets()?;
    Ok(Json(
        names
            .into_iter()
            .map(|name| SecretResponse { name })
            .collect(),
    ))
}

/// GET /system/secrets/:name
pub async fn get_secret(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<SecretResponse>> {
    if !state.secrets.secret_exists(&name) {
        return Err(GatewayError::NotFound(format!("secret {name}")));
    }
    Ok(Json(SecretResponse { name }))
}
