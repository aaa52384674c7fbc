//! The `docker-faas.yaml` manifest describing a source build.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::domain::model::FunctionResources;
use crate::error::{GatewayError, Result};

pub const MANIFEST_FILE: &str = "docker-faas.yaml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Manifest {
    pub name: String,
    pub runtime: String,
    pub command: String,
    pub dependencies: Vec<String>,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub secrets: Vec<String>,
    pub limits: Option<FunctionResources>,
    pub requests: Option<FunctionResources>,
    pub read_only_root_filesystem: bool,
    pub debug: bool,
    pub network: String,
    /// Extra build steps for the `go` runtime's builder stage.
    pub build: Vec<String>,
}

pub fn load_manifest(path: &Path) -> Result<Manifest> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| GatewayError::bad_request(format!("failed to read {MANIFEST_FILE}: {e}")))?;
    parse_manifest(&data)
}

pub fn parse_manifest(data: &str) -> Result<Manifest> {
    serde_yaml::from_str(data)
        .map_err(|e| GatewayError::bad_request(format!("failed to parse {MANIFEST_FILE}: {e}")))
}
