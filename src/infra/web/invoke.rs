//! Synchronous and asynchronous function invocation.

use std::time::Instant;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::header::HOST;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use log::error;
use serde_json::json;

use super::{client_addr, AppState};
use crate::error::GatewayError;
use crate::ids::generate_call_id;
use crate::metrics;
use crate::validation::{normalize_function_name, validate_function_name};

/// Any-method /function/:name: proxy one request to a replica and stream
/// the response back unchanged.
pub async fn invoke_function(
    State(state): State<AppState>,
    Path(name): Path<String>,
    request: Request,
) -> Response {
    let function_name = normalize_function_name(&name);
    if let Err(err) = validate_function_name(&function_name) {
        return err.into_response();
    }

    let start = Instant::now();
    let client = client_addr(&request);
    let host = request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(_) => {
            return GatewayError::bad_request("failed to read request body").into_response();
        }
    };

    match state
        .router
        .route(&function_name, parts.method, &parts.headers, body, &client, &host)
        .await
    {
        Ok(upstream) => {
            let status = upstream.status();
            metrics::record_function_invocation(
                &function_name,
                status.as_u16(),
                start.elapsed().as_secs_f64(),
            );

            let mut builder = Response::builder().status(status);
            if let Some(headers) = builder.headers_mut() {
                for (key, value) in upstream.headers() {
                    headers.append(key, value.clone());
                }
            }
            builder
                .body(Body::from_stream(upstream.bytes_stream()))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(err) => {
            error!("Failed to invoke function {function_name}: {err}");
            metrics::record_function_invocation(
                &function_name,
                500,
                start.elapsed().as_secs_f64(),
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to invoke function: {err}"),
            )
                .into_response()
        }
    }
}

/// Any-method /async-function/:name: answer 202 with a call id, then
/// dispatch the invocation on a detached task. Starting from zero replicas
/// blocks until the first one is ready.
pub async fn invoke_function_async(
    State(state): State<AppState>,
    Path(name): Path<String>,
    request: Request,
) -> Response {
    let function_name = normalize_function_name(&name);
    if let Err(err) = validate_function_name(&function_name) {
        return err.into_response();
    }

    if let Err(err) = state.service.get_record(&function_name).await {
        return err.into_response();
    }

    let available = match state.service.available_replicas(&function_name).await {
        Ok(available) => available,
        Err(err) => {
            error!("Failed to get containers for function {function_name}: {err}");
            return err.into_response();
        }
    };

    if available == 0 {
        if let Err(err) = state.service.scale_from_zero(&function_name).await {
            error!("Failed to scale function {function_name} from zero: {err}");
            return err.into_response();
        }
    }

    let client = client_addr(&request);
    let host = request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(_) => {
            return GatewayError::bad_request("failed to read request body").into_response();
        }
    };

    let call_id = generate_call_id();
    let mut headers = parts.headers.clone();
    if let Ok(value) = call_id.parse() {
        headers.insert("X-Call-Id", value);
    }

    // detached dispatch: the caller has already been answered, so the
    // background call must not inherit the request's lifetime
    let router = state.router.clone();
    let method = parts.method.clone();
    let dispatch_name = function_name.clone();
    tokio::spawn(async move {
        match router
            .route(&dispatch_name, method, &headers, body, &client, &host)
            .await
        {
            Ok(response) => {
                // drain so the replica connection can be reused
                let _ = response.bytes().await;
            }
            Err(err) => error!("Async invoke failed for {dispatch_name}: {err}"),
        }
    });

    (
        StatusCode::ACCEPTED,
        [("X-Call-Id", call_id.clone())],
        Json(json!({ "status": "accepted", "callId": call_id })),
    )
        .into_response()
}
