//! Build endpoints: submit, history listing with filters, single-entry
//! lookup, clearing, the SSE stream, and the inspect dry-run.

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;

use axum::extract::{FromRequest, Multipart, Path, Query, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use futures::Stream;
use tempfile::TempDir;

use super::AppState;
use crate::build::source::{safe_join, InlineFile};
use crate::build::tracker::BuildEntry;
use crate::build::{BuildRequest, BuildSourceSpec, ZipSourceSpec};
use crate::error::{GatewayError, Result};

/// POST /system/builds: source-to-image, JSON or multipart.
pub async fn submit_build(
    State(state): State<AppState>,
    request: Request,
) -> Result<impl IntoResponse> {
    let (build_request, workspace) = parse_build_request(request).await?;
    let response = state.builds.run_build(build_request, workspace.path()).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// POST /system/builds/inspect: preview manifest and file tree.
pub async fn inspect_build(
    State(state): State<AppState>,
    request: Request,
) -> Result<impl IntoResponse> {
    let (build_request, workspace) = parse_build_request(request).await?;
    let report = state.builds.inspect(build_request, workspace.path()).await?;
    Ok(Json(report))
}

/// GET /system/builds
pub async fn list_builds(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<BuildEntry>>> {
    let filter = BuildFilter::parse(&params)?;
    Ok(Json(filter.apply(state.tracker.list())))
}

/// GET /system/builds/:id
pub async fn get_build(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<BuildEntry>> {
    let include_output = parse_optional_bool(params.get("includeOutput"), true)
        .ok_or_else(|| GatewayError::bad_request("invalid includeOutput value"))?;

    let mut entry = state
        .tracker
        .get(&id)
        .ok_or_else(|| GatewayError::NotFound(format!("build {id}")))?;
    if !include_output {
        entry.output = String::new();
        entry.truncated = false;
    }
    Ok(Json(entry))
}

/// DELETE /system/builds
pub async fn clear_builds(State(state): State<AppState>) -> impl IntoResponse {
    state.tracker.clear();
    StatusCode::NO_CONTENT
}

/// GET /system/builds/stream: server-sent events with every post-mutation
/// snapshot. Slow consumers lose events rather than blocking builds.
pub async fn stream_builds(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let subscription = state.tracker.subscribe();
    let stream = futures::stream::unfold(subscription, |mut subscription| async move {
        let entry = subscription.recv().await?;
        let event = Event::default().json_data(&entry).ok()?;
        Some((Ok(event), subscription))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Parse a build submission. Multipart forms carry the zip upload plus
/// form fields; JSON bodies describe git/inline sources directly. Either
/// way the returned workspace owns the request's temp directory.
async fn parse_build_request(request: Request) -> Result<(BuildRequest, TempDir)> {
    let workspace = tempfile::Builder::new()
        .prefix("docker-faas-build-")
        .tempdir()
        .map_err(|e| GatewayError::internal(anyhow::anyhow!("failed to create temp dir: {e}")))?;

    let content_type = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();

    if content_type.starts_with("multipart/") {
        let multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| GatewayError::bad_request(format!("invalid multipart form: {e}")))?;
        let build_request = parse_multipart_build(multipart, workspace.path()).await?;
        return Ok((build_request, workspace));
    }

    let body = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .map_err(|e| GatewayError::bad_request(format!("failed to read body: {e}")))?;
    let build_request: BuildRequest = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::bad_request(format!("invalid JSON body: {e}")))?;
    Ok((build_request, workspace))
}

async fn parse_multipart_build(
    mut multipart: Multipart,
    workspace: &std::path::Path,
) -> Result<BuildRequest> {
    let mut name = String::new();
    let mut runtime = String::new();
    let mut manifest = String::new();
    let mut deploy = None;
    let mut source_type = String::new();
    let mut files: Vec<InlineFile> = Vec::new();
    let mut zip_filename: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| GatewayError::bad_request(format!("invalid multipart form: {e}")))?
    {
        let field_name = field.name().unwrap_or("").to_string();
        match field_name.as_str() {
            "name" => name = field_text(field).await?.trim().to_string(),
            "runtime" => runtime = field_text(field).await?.trim().to_string(),
            "manifest" => manifest = field_text(field).await?,
            "deploy" => deploy = field_text(field).await?.trim().parse().ok(),
            "sourceType" => source_type = field_text(field).await?.trim().to_string(),
            "files" => {
                let raw = field_text(field).await?;
                if !raw.is_empty() {
                    files = serde_json::from_str(&raw).map_err(|e| {
                        GatewayError::bad_request(format!("invalid files payload: {e}"))
                    })?;
                }
            }
            "file" => {
                let filename = field
                    .file_name()
                    .map(str::to_string)
                    .filter(|f| !f.is_empty())
                    .unwrap_or_else(|| "source.zip".to_string());
                let data = field.bytes().await.map_err(|e| {
                    GatewayError::bad_request(format!("failed to read zip upload: {e}"))
                })?;
                let path = safe_join(workspace, &filename)?;
                tokio::fs::write(&path, &data).await.map_err(|e| {
                    GatewayError::internal(anyhow::anyhow!("failed to save zip: {e}"))
                })?;
                zip_filename = Some(filename);
            }
            _ => {}
        }
    }

    let Some(filename) = zip_filename else {
        return Err(GatewayError::bad_request("zip file is required"));
    };
    if source_type.is_empty() {
        source_type = "zip".to_string();
    }

    Ok(BuildRequest {
        name,
        deploy,
        source: BuildSourceSpec {
            kind: source_type,
            runtime,
            git: None,
            zip: Some(ZipSourceSpec { filename }),
            files,
            manifest,
        },
    })
}

async fn field_text(field: axum::extract::multipart::Field<'_>) -> Result<String> {
    field
        .text()
        .await
        .map_err(|e| GatewayError::bad_request(format!("invalid multipart field: {e}")))
}

#[derive(Debug, Default)]
struct BuildFilter {
    name_contains: Option<String>,
    statuses: Option<HashSet<String>>,
    source_types: Option<HashSet<String>>,
    since: Option<DateTime<Utc>>,
    before: Option<DateTime<Utc>>,
    limit: Option<usize>,
    include_output: bool,
}

impl BuildFilter {
    fn parse(params: &HashMap<String, String>) -> Result<Self> {
        let mut filter = BuildFilter {
            include_output: true,
            ..Default::default()
        };

        if let Some(raw) = non_empty(params.get("name")) {
            filter.name_contains = Some(raw.to_lowercase());
        }
        filter.statuses = parse_csv_set(params.get("status"));
        filter.source_types = parse_csv_set(params.get("sourceType"));
        if let Some(raw) = non_empty(params.get("since")) {
            filter.since = Some(parse_rfc3339(&raw)?);
        }
        if let Some(raw) = non_empty(params.get("before")) {
            filter.before = Some(parse_rfc3339(&raw)?);
        }
        if let Some(raw) = non_empty(params.get("limit")) {
            let limit: i64 = raw
                .parse()
                .map_err(|_| GatewayError::bad_request("invalid limit value"))?;
            if limit < 0 {
                return Err(GatewayError::bad_request("limit must be >= 0"));
            }
            filter.limit = Some(limit as usize);
        }
        if let Some(raw) = non_empty(params.get("includeOutput")) {
            filter.include_output = parse_optional_bool(Some(&raw), true)
                .ok_or_else(|| GatewayError::bad_request("invalid includeOutput value"))?;
        }

        Ok(filter)
    }

    fn apply(&self, entries: Vec<BuildEntry>) -> Vec<BuildEntry> {
        let mut filtered: Vec<BuildEntry> = entries
            .into_iter()
            .filter(|entry| {
                if let Some(ref fragment) = self.name_contains {
                    if !entry.name.to_lowercase().contains(fragment) {
                        return false;
                    }
                }
                if let Some(ref statuses) = self.statuses {
                    if !statuses.contains(entry.status.as_str()) {
                        return false;
                    }
                }
                if let Some(ref source_types) = self.source_types {
                    if !source_types.contains(&entry.source_type.to_lowercase()) {
                        return false;
                    }
                }
                if let Some(since) = self.since {
                    if entry.started_at < since {
                        return false;
                    }
                }
                if let Some(before) = self.before {
                    if entry.started_at > before {
                        return false;
                    }
                }
                true
            })
            .collect();

        if let Some(limit) = self.limit {
            if limit > 0 {
                filtered.truncate(limit);
            }
        }

        if !self.include_output {
            for entry in &mut filtered {
                entry.output = String::new();
                entry.truncated = false;
            }
        }

        filtered
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_csv_set(value: Option<&String>) -> Option<HashSet<String>> {
    let set: HashSet<String> = value?
        .split(',')
        .map(|part| part.trim().to_lowercase())
        .filter(|part| !part.is_empty())
        .collect();
    if set.is_empty() {
        None
    } else {
        Some(set)
    }
}

fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|_| GatewayError::bad_request(format!("invalid timestamp: {raw}")))
}

fn parse_optional_bool(value: Option<&String>, default: bool) -> Option<bool> {
    match value {
        None => Some(default),
        Some(raw) if raw.is_empty() => Some(default),
        Some(raw) => raw.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::tracker::BuildStatus;

    fn entry(name: &str, source_type: &str, status: BuildStatus) -> BuildEntry {
        let mut entry = BuildEntry::started(name, source_type, "");
        entry.id = name.to_string();
        entry.status = status;
        entry.output = "some output".to_string();
        entry
    }

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn filters_by_name_substring_case_insensitive() {
        let filter = BuildFilter::parse(&params(&[("name", "ECH")])).unwrap();
        let out = filter.apply(vec![
            entry("echo", "zip", BuildStatus::Success),
            entry("word", "zip", BuildStatus::Success),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "echo");
    }

    #[test]
    fn filters_by_status_and_source_type() {
        let filter =
            BuildFilter::parse(&params(&[("status", "failed"), ("sourceType", "git,zip")]))
                .unwrap();
        let out = filter.apply(vec![
            entry("a", "zip", BuildStatus::Failed),
            entry("b", "zip", BuildStatus::Success),
            entry("c", "inline", BuildStatus::Failed),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "a");
    }

    #[test]
    fn limit_truncates() {
        let filter = BuildFilter::parse(&params(&[("limit", "1")])).unwrap();
        let out = filter.apply(vec![
            entry("a", "zip", BuildStatus::Success),
            entry("b", "zip", BuildStatus::Success),
        ]);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn include_output_false_strips_output() {
        let filter = BuildFilter::parse(&params(&[("includeOutput", "false")])).unwrap();
        let out = filter.apply(vec![entry("a", "zip", BuildStatus::Success)]);
        assert!(out[0].output.is_empty());
        assert!(!out[0].truncated);
    }

    #[test]
    fn bad_filter_values_are_rejected() {
        assert!(BuildFilter::parse(&params(&[("since", "yesterday")])).is_err());
        assert!(BuildFilter::parse(&params(&[("limit", "-2")])).is_err());
        assert!(BuildFilter::parse(&params(&[("limit", "abc")])).is_err());
    }

    #[test]
    fn since_before_window() {
        let mut old = entry("old", "zip", BuildStatus::Success);
        old.started_at = Utc::now() - chrono::Duration::hours(2);
        let fresh = entry("fresh", "zip", BuildStatus::Success);

        let cutoff = (Utc::now() - chrono::Duration::hours(1)).to_rfc3339();
        let filter = BuildFilter::parse(&params(&[("since", &cutoff)])).unwrap();
        let out = filter.apply(vec![old.clone(), fresh.clone()]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "fresh");

        let filter = BuildFilter::parse(&params(&[("before", &cutoff)])).unwrap();
        let out = filter.apply(vec![old, fresh]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "old");
    }
}
