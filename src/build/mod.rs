//! Source-to-image build pipeline: materialise a git/zip/inline source,
//! resolve the build context and manifest, synthesise a Dockerfile when the
//! source ships none, drive the engine build with bounded output capture,
//! and hand the result to the lifecycle controller.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use log::{error, info};
use serde::{Deserialize, Serialize};

use crate::domain::model::FunctionDeployment;
use crate::domain::port::ContainerEngine;
use crate::domain::FaasService;
use crate::error::{GatewayError, Result};
use crate::validation::{validate_function_name, validate_git_url};
use manifest::{load_manifest, Manifest, MANIFEST_FILE};
use source::{GitSource, InlineFile, InspectFile};
use tracker::{BuildEntry, BuildStatus, BuildTracker, BuildUpdate};

pub mod dockerfile;
pub mod manifest;
pub mod source;
pub mod tracker;

const DOCKERFILE: &str = "Dockerfile";
const DEFAULT_OUTPUT_LIMIT: usize = 1024;

/// Build output sink with a hard byte cap. Once the cap is hit, further
/// writes are discarded and the buffer is marked truncated.
pub struct BoundedBuffer {
    buf: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl BoundedBuffer {
    pub fn new(limit: usize) -> Self {
        let limit = if limit == 0 { DEFAULT_OUTPUT_LIMIT } else { limit };
        Self {
            buf: Vec::new(),
            limit,
            truncated: false,
        }
    }

    pub fn write(&mut self, chunk: &[u8]) {
        if self.truncated {
            return;
        }
        let remaining = self.limit - self.buf.len();
        if remaining == 0 {
            self.truncated = true;
            return;
        }
        if chunk.len() > remaining {
            self.buf.extend_from_slice(&chunk[..remaining]);
            self.truncated = true;
        } else {
            self.buf.extend_from_slice(chunk);
        }
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub deploy: Option<bool>,
    #[serde(default)]
    pub source: BuildSourceSpec,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildSourceSpec {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub runtime: String,
    #[serde(default)]
    pub git: Option<GitSource>,
    #[serde(default)]
    pub zip: Option<ZipSourceSpec>,
    #[serde(default)]
    pub files: Vec<InlineFile>,
    #[serde(default)]
    pub manifest: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZipSourceSpec {
    #[serde(default)]
    pub filename: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildResponse {
    pub name: String,
    pub image: String,
    pub deployed: bool,
    pub updated: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectResponse {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub runtime: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub command: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub manifest: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<InspectFile>,
}

pub struct BuildService {
    lifecycle: Arc<FaasService>,
    engine: Arc<dyn ContainerEngine>,
    tracker: Arc<BuildTracker>,
    output_limit: usize,
}

impl BuildService {
    pub fn new(
        lifecycle: Arc<FaasService>,
        engine: Arc<dyn ContainerEngine>,
        tracker: Arc<BuildTracker>,
        output_limit: usize,
    ) -> Self {
        Self {
            lifecycle,
            engine,
            tracker,
            output_limit,
        }
    }

    /// Run one build end to end. `workspace` is the private temp directory
    /// the request was materialised into (a multipart zip upload is already
    /// saved there under its original file name).
    pub async fn run_build(&self, request: BuildRequest, workspace: &Path) -> Result<BuildResponse> {
        let start = Instant::now();

        let mut entry = BuildEntry::started(
            &request.name,
            effective_source_kind(&request.source),
            &request.source.runtime,
        );
        if let Some(ref git) = request.source.git {
            entry.git_url = git.url.clone();
            entry.git_ref = git.reference.clone();
            entry.source_path = git.path.clone();
        }
        if let Some(ref zip) = request.source.zip {
            entry.zip_name = zip.filename.clone();
        }
        let entry = self.tracker.add(entry);

        let (manifest, context_dir) = match self
            .prepare_build_context(workspace, &request, true)
            .await
        {
            Ok(prepared) => prepared,
            Err(err) => {
                error!("Build preparation failed: {err}");
                self.fail_entry(&entry.id, start, &err, None, None);
                return Err(err);
            }
        };

        let name = if !request.name.is_empty() {
            request.name.clone()
        } else {
            manifest.as_ref().map(|m| m.name.clone()).unwrap_or_default()
        };
        if name.is_empty() {
            let err =
                GatewayError::bad_request(format!("name is required (request or {MANIFEST_FILE})"));
            self.fail_entry(&entry.id, start, &err, None, None);
            return Err(err);
        }
        if let Err(err) = validate_function_name(&name) {
            self.fail_entry(&entry.id, start, &err, None, None);
            return Err(err);
        }

        self.tracker.update(
            &entry.id,
            BuildUpdate {
                name: Some(name.clone()),
                runtime: manifest
                    .as_ref()
                    .filter(|m| !m.runtime.is_empty())
                    .map(|m| m.runtime.clone()),
                ..Default::default()
            },
        );

        let image = image_tag(&name);
        let mut output = BoundedBuffer::new(self.output_limit);
        if let Err(err) = self
            .engine
            .build_image(&context_dir, DOCKERFILE, &image, &mut output)
            .await
        {
            error!("Build failed for {name}: {err}");
            self.fail_entry(&entry.id, start, &err, Some(&output), Some(image));
            return Err(err);
        }

        let deploy = request.deploy.unwrap_or(true);
        let mut updated = false;
        if deploy {
            match self
                .deploy_built_image(&name, &image, manifest.as_ref())
                .await
            {
                Ok(did_update) => updated = did_update,
                Err(err) => {
                    error!("Deploy after build failed for {name}: {err}");
                    self.fail_entry(&entry.id, start, &err, Some(&output), Some(image));
                    return Err(err);
                }
            }
        }

        info!(
            "Build completed for {name} in {:.2}s (image: {image})",
            start.elapsed().as_secs_f64()
        );
        self.tracker.update(
            &entry.id,
            BuildUpdate {
                status: Some(BuildStatus::Success),
                finished_at: Some(Utc::now()),
                duration_ms: Some(start.elapsed().as_millis() as i64),
                image: Some(image.clone()),
                deployed: Some(deploy),
                updated: Some(updated),
                output: Some(output.contents()),
                truncated: Some(output.truncated()),
                ..Default::default()
            },
        );

        Ok(BuildResponse {
            name,
            image,
            deployed: deploy,
            updated,
        })
    }

    /// Dry-run of the pipeline: materialise and resolve, but neither
    /// generate a Dockerfile nor call the engine.
    pub async fn inspect(&self, request: BuildRequest, workspace: &Path) -> Result<InspectResponse> {
        let (manifest, context_dir) = self
            .prepare_build_context(workspace, &request, false)
            .await?;

        let mut name = request.name.clone();
        let mut runtime = request.source.runtime.clone();
        let mut command = String::new();
        let mut manifest_raw = String::new();

        if let Some(ref manifest) = manifest {
            if !manifest.name.is_empty() {
                name = manifest.name.clone();
            }
            if !manifest.runtime.is_empty() {
                runtime = manifest.runtime.clone();
            }
            command = manifest.command.clone();
            if let Ok(raw) = std::fs::read_to_string(context_dir.join(MANIFEST_FILE)) {
                manifest_raw = raw;
            }
        }

        let files = {
            let context_dir = context_dir.clone();
            tokio::task::spawn_blocking(move || source::collect_source_files(&context_dir))
                .await
                .map_err(GatewayError::internal)?
        };

        Ok(InspectResponse {
            name,
            runtime,
            command,
            manifest: manifest_raw,
            files,
        })
    }

    /// Materialise the source into `workspace` and resolve the effective
    /// context directory and manifest.
    async fn prepare_build_context(
        &self,
        workspace: &Path,
        request: &BuildRequest,
        generate_dockerfile: bool,
    ) -> Result<(Option<Manifest>, PathBuf)> {
        let spec = &request.source;
        match effective_source_kind(spec) {
            "zip" => {
                let filename = spec
                    .zip
                    .as_ref()
                    .map(|z| z.filename.clone())
                    .filter(|f| !f.is_empty())
                    .ok_or_else(|| GatewayError::bad_request("zip source requires filename"))?;
                let zip_path = source::safe_join(workspace, &filename)?;
                let dest = workspace.to_path_buf();
                tokio::task::spawn_blocking(move || source::extract_zip(&zip_path, &dest))
                    .await
                    .map_err(GatewayError::internal)??;
                let _ = std::fs::remove_file(workspace.join(&filename));
            }
            "git" => {
                let git = spec
                    .git
                    .clone()
                    .filter(|g| !g.url.is_empty())
                    .ok_or_else(|| GatewayError::bad_request("git source requires url"))?;
                validate_git_url(&git.url).await?;
                let dest = workspace.to_path_buf();
                tokio::task::spawn_blocking(move || source::clone_repo(&git, &dest))
                    .await
                    .map_err(GatewayError::internal)??;
            }
            "inline" => {}
            other => {
                return Err(GatewayError::bad_request(format!(
                    "unsupported source type: {other}"
                )))
            }
        }

        let mut context_dir = workspace.to_path_buf();
        if let Some(git) = &spec.git {
            if !git.path.is_empty() {
                context_dir = source::safe_join(workspace, &git.path)?;
            }
        }
        if !context_dir.is_dir() {
            return Err(GatewayError::bad_request(format!(
                "invalid source path: {} is not a directory",
                context_dir.display()
            )));
        }

        // Uploaded archives usually wrap everything in one top-level folder;
        // descend before applying an inline manifest or inline files.
        if effective_source_kind(spec) == "zip"
            && !spec.manifest.trim().is_empty()
            && !source::has_file(&context_dir, DOCKERFILE)
            && !source::has_file(&context_dir, MANIFEST_FILE)
        {
            context_dir = source::resolve_single_subdir(&context_dir);
        }

        if !spec.files.is_empty() {
            source::write_inline_files(&context_dir, &spec.files)?;
        }

        let mut manifest = self.load_context_manifest(&context_dir, spec)?;

        if manifest.is_none() && spec.manifest.trim().is_empty() {
            let descended = source::resolve_single_subdir(&context_dir);
            if descended != context_dir {
                context_dir = descended;
                manifest = self.load_context_manifest(&context_dir, spec)?;
            }
        }

        if manifest.is_none() && spec.manifest.trim().is_empty() {
            if let Some(manifest_dir) = source::find_manifest_dir(&context_dir) {
                if manifest_dir != context_dir {
                    context_dir = manifest_dir;
                    manifest = self.load_context_manifest(&context_dir, spec)?;
                }
            }
        }

        if let Some(ref mut manifest) = manifest {
            if manifest.name.is_empty() && !request.name.is_empty() {
                manifest.name = request.name.clone();
            }
            if manifest.runtime.is_empty() && !spec.runtime.is_empty() {
                manifest.runtime = spec.runtime.clone();
            }
            if manifest.command.is_empty() {
                return Err(GatewayError::bad_request(format!(
                    "{MANIFEST_FILE} must define command"
                )));
            }
        }

        let dockerfile_path = context_dir.join(DOCKERFILE);
        if generate_dockerfile && !dockerfile_path.exists() {
            if manifest.is_none() {
                let descended = source::resolve_single_subdir(&context_dir);
                if descended != context_dir {
                    context_dir = descended;
                    manifest = self.load_context_manifest(&context_dir, spec)?;
                }
            }
            let Some(ref manifest) = manifest else {
                return Err(GatewayError::bad_request(format!(
                    "{DOCKERFILE} or {MANIFEST_FILE} is required"
                )));
            };
            let body = dockerfile::generate_dockerfile(manifest, &context_dir)?;
            std::fs::write(context_dir.join(DOCKERFILE), body).map_err(|e| {
                GatewayError::internal(anyhow::anyhow!("failed to write Dockerfile: {e}"))
            })?;
        }

        Ok((manifest, context_dir))
    }

    /// Write an inline manifest into the context when supplied, then load
    /// whatever manifest the context now holds.
    fn load_context_manifest(
        &self,
        context_dir: &Path,
        spec: &BuildSourceSpec,
    ) -> Result<Option<Manifest>> {
        let manifest_path = context_dir.join(MANIFEST_FILE);

        if !spec.manifest.trim().is_empty() {
            std::fs::write(&manifest_path, &spec.manifest).map_err(|e| {
                GatewayError::internal(anyhow::anyhow!("failed to write manifest: {e}"))
            })?;
        }

        if manifest_path.exists() {
            return load_manifest(&manifest_path).map(Some);
        }
        Ok(None)
    }

    /// Deploy or update the function from the freshly built image. Returns
    /// true when an existing function was updated.
    async fn deploy_built_image(
        &self,
        name: &str,
        image: &str,
        manifest: Option<&Manifest>,
    ) -> Result<bool> {
        let mut deployment = FunctionDeployment {
            service: name.to_string(),
            image: image.to_string(),
            ..Default::default()
        };

        if let Some(manifest) = manifest {
            deployment.network = manifest.network.clone();
            deployment.env_process = manifest.command.clone();
            deployment.env_vars = manifest.env.clone();
            deployment.labels = manifest.labels.clone();
            deployment.secrets = manifest.secrets.clone();
            deployment.limits = manifest.limits.clone();
            deployment.requests = manifest.requests.clone();
            deployment.read_only_root_filesystem = manifest.read_only_root_filesystem;
            deployment.debug = manifest.debug;
        }

        if self.lifecycle.get_record(name).await.is_ok() {
            self.lifecycle.update(deployment).await?;
            return Ok(true);
        }
        self.lifecycle.deploy(deployment).await?;
        Ok(false)
    }

    fn fail_entry(
        &self,
        id: &str,
        start: Instant,
        err: &GatewayError,
        output: Option<&BoundedBuffer>,
        image: Option<String>,
    ) {
        self.tracker.update(
            id,
            BuildUpdate {
                status: Some(BuildStatus::Failed),
                finished_at: Some(Utc::now()),
                duration_ms: Some(start.elapsed().as_millis() as i64),
                error: Some(err.to_string()),
                output: output.map(|o| o.contents()),
                truncated: output.map(|o| o.truncated()),
                image,
                ..Default::default()
            },
        );
    }
}

fn effective_source_kind(spec: &BuildSourceSpec) -> &str {
    if spec.kind.is_empty() {
        "git"
    } else {
        &spec.kind
    }
}

/// Image tag for a built function: sanitised name plus a unix-timestamp tag.
pub fn image_tag(name: &str) -> String {
    let safe = name.to_lowercase().replace(['_', ' '], "-");
    format!("docker-faas/{safe}:{}", Utc::now().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::mock::MockEngine;
    use crate::infra::store::SqliteFunctionStore;

    const ECHO_MANIFEST: &str = "name: zbuild\nruntime: python\ncommand: \"python handler.py\"\n";

    async fn build_service() -> (BuildService, Arc<MockEngine>, Arc<BuildTracker>) {
        let store = Arc::new(SqliteFunctionStore::in_memory().await.unwrap());
        let engine = Arc::new(MockEngine::new());
        let lifecycle = Arc::new(FaasService::new(
            store,
            engine.clone(),
            "docker-faas-net".to_string(),
            1,
            10,
        ));
        let tracker = Arc::new(BuildTracker::new(10, None));
        let service = BuildService::new(lifecycle, engine.clone(), tracker.clone(), 200 * 1024);
        (service, engine, tracker)
    }

    fn inline_request(manifest: &str) -> BuildRequest {
        BuildRequest {
            name: String::new(),
            deploy: Some(true),
            source: BuildSourceSpec {
                kind: "inline".to_string(),
                manifest: manifest.to_string(),
                files: vec![InlineFile {
                    path: "handler.py".to_string(),
                    content: "import sys; print(sys.stdin.read())".to_string(),
                    remove: false,
                }],
                ..Default::default()
            },
        }
    }

    #[test]
    fn bounded_buffer_boundary() {
        let mut buffer = BoundedBuffer::new(4);
        buffer.write(b"abcd");
        assert!(!buffer.truncated());
        assert_eq!(buffer.contents(), "abcd");

        buffer.write(b"e");
        assert!(buffer.truncated());
        assert_eq!(buffer.contents(), "abcd");
    }

    #[test]
    fn bounded_buffer_cuts_oversized_chunk() {
        let mut buffer = BoundedBuffer::new(4);
        buffer.write(b"abcdef");
        assert!(buffer.truncated());
        assert_eq!(buffer.contents(), "abcd");
    }

    #[test]
    fn image_tags_are_sanitised() {
        let tag = image_tag("My_Func Name");
        assert!(tag.starts_with("docker-faas/my-func-name:"));
    }

    #[tokio::test]
    async fn inline_build_deploys_and_tracks_success() {
        let (service, engine, tracker) = build_service().await;
        engine.set_build_output("Step 1/4 : FROM python:3.11-slim\n");
        let workspace = tempfile::tempdir().unwrap();

        let response = service
            .run_build(inline_request(ECHO_MANIFEST), workspace.path())
            .await
            .unwrap();

        assert_eq!(response.name, "zbuild");
        assert!(response.image.starts_with("docker-faas/zbuild:"));
        assert!(response.deployed);
        assert!(!response.updated);
        assert_eq!(engine.built_tags().len(), 1);
        assert_eq!(engine.container_count("zbuild"), 1);

        let entries = tracker.list();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, BuildStatus::Success);
        assert_eq!(entries[0].name, "zbuild");
        assert!(entries[0].output.contains("Step 1/4"));
        assert!(entries[0].finished_at.is_some());

        // a second build of the same function is an update
        let workspace = tempfile::tempdir().unwrap();
        let response = service
            .run_build(inline_request(ECHO_MANIFEST), workspace.path())
            .await
            .unwrap();
        assert!(response.updated);
    }

    #[tokio::test]
    async fn failed_engine_build_marks_entry_failed() {
        let (service, engine, tracker) = build_service().await;
        engine.set_build_failure("compile error on line 3");
        let workspace = tempfile::tempdir().unwrap();

        let err = service
            .run_build(inline_request(ECHO_MANIFEST), workspace.path())
            .await
            .unwrap_err();
        assert_eq!(err.status_code().as_u16(), 500);

        let entries = tracker.list();
        assert_eq!(entries[0].status, BuildStatus::Failed);
        assert!(entries[0].error.contains("compile error"));
    }

    #[tokio::test]
    async fn missing_name_fails_before_building() {
        let (service, engine, tracker) = build_service().await;
        let workspace = tempfile::tempdir().unwrap();

        let request = inline_request("runtime: python\ncommand: \"python handler.py\"\n");
        let err = service.run_build(request, workspace.path()).await.unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));
        assert!(engine.built_tags().is_empty());
        assert_eq!(tracker.list()[0].status, BuildStatus::Failed);
    }

    #[tokio::test]
    async fn manifest_without_command_is_rejected() {
        let (service, _engine, _tracker) = build_service().await;
        let workspace = tempfile::tempdir().unwrap();

        let err = service
            .run_build(
                inline_request("name: zbuild\nruntime: python\n"),
                workspace.path(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("command"));
    }

    #[tokio::test]
    async fn inspect_reports_manifest_and_files_without_building() {
        let (service, engine, _tracker) = build_service().await;
        let workspace = tempfile::tempdir().unwrap();

        let report = service
            .inspect(inline_request(ECHO_MANIFEST), workspace.path())
            .await
            .unwrap();
        assert_eq!(report.name, "zbuild");
        assert_eq!(report.runtime, "python");
        assert_eq!(report.command, "python handler.py");
        assert!(report.manifest.contains("runtime: python"));
        assert!(report.files.iter().any(|f| f.path == "handler.py"));
        // inspect never builds or writes a Dockerfile
        assert!(engine.built_tags().is_empty());
        assert!(!workspace.path().join("Dockerfile").exists());
    }

    #[tokio::test]
    async fn deploy_false_skips_lifecycle() {
        let (service, engine, _tracker) = build_service().await;
        let workspace = tempfile::tempdir().unwrap();

        let mut request = inline_request(ECHO_MANIFEST);
        request.deploy = Some(false);
        let response = service.run_build(request, workspace.path()).await.unwrap();
        assert!(!response.deployed);
        assert_eq!(engine.container_count("zbuild"), 0);
        assert_eq!(engine.built_tags().len(), 1);
    }

    #[tokio::test]
    async fn unsupported_source_kind_is_rejected() {
        let (service, _engine, _tracker) = build_service().await;
        let workspace = tempfile::tempdir().unwrap();

        let request = BuildRequest {
            source: BuildSourceSpec {
                kind: "svn".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = service.run_build(request, workspace.path()).await.unwrap_err();
        assert!(err.to_string().contains("unsupported source type"));
    }
}
