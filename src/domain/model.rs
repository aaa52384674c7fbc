use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A function deployment request as submitted over the API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FunctionDeployment {
    pub service: String,
    pub image: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub network: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub env_process: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub env_vars: HashMap<String, String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<FunctionResources>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests: Option<FunctionResources>,
    pub read_only_root_filesystem: bool,
    pub debug: bool,
}

/// Memory/CPU caps. Accepts Docker-style (`128m`, `1g`) and Kubernetes-style
/// (`128Mi`, `1Gi`) memory strings; CPU accepts `0.5` and `500m`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionResources {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub memory: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cpu: String,
}

/// A function record as persisted in the metadata store. Map- and
/// list-valued fields are serialized to JSON text columns.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FunctionRecord {
    pub id: i64,
    pub name: String,
    pub image: String,
    pub env_process: String,
    pub env_vars: String,
    pub labels: String,
    pub secrets: String,
    pub network: String,
    pub replicas: i64,
    pub limits: String,
    pub requests: String,
    pub read_only: bool,
    pub debug: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FunctionRecord {
    /// Build a record from a deployment spec. Timestamps are filled by the
    /// store on insert/update.
    pub fn from_deployment(deployment: &FunctionDeployment, replicas: i64) -> Self {
        FunctionRecord {
            id: 0,
            name: deployment.service.clone(),
            image: deployment.image.clone(),
            env_process: deployment.env_process.clone(),
            env_vars: encode_map(&deployment.env_vars),
            labels: encode_map(&deployment.labels),
            secrets: encode_list(&deployment.secrets),
            network: deployment.network.clone(),
            replicas,
            limits: encode_resources(&deployment.limits),
            requests: encode_resources(&deployment.requests),
            read_only: deployment.read_only_root_filesystem,
            debug: deployment.debug,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    /// Reconstruct the deployment spec this record was stored from, used to
    /// scale or re-create containers from persisted state.
    pub fn to_deployment(&self) -> FunctionDeployment {
        FunctionDeployment {
            service: self.name.clone(),
            image: self.image.clone(),
            network: self.network.clone(),
            env_process: self.env_process.clone(),
            env_vars: decode_map(&self.env_vars),
            labels: decode_map(&self.labels),
            secrets: decode_list(&self.secrets),
            limits: decode_resources(&self.limits),
            requests: decode_resources(&self.requests),
            read_only_root_filesystem: self.read_only,
            debug: self.debug,
        }
    }

    pub fn to_status(&self, available_replicas: i64) -> FunctionStatus {
        FunctionStatus {
            name: self.name.clone(),
            image: self.image.clone(),
            replicas: self.replicas,
            available_replicas,
            env_process: self.env_process.clone(),
            env_vars: decode_map(&self.env_vars),
            labels: decode_map(&self.labels),
            secrets: decode_list(&self.secrets),
            network: self.network.clone(),
            limits: decode_resources(&self.limits),
            requests: decode_resources(&self.requests),
            read_only_root_filesystem: self.read_only,
            debug: self.debug,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Runtime view of a function combining stored metadata with engine state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionStatus {
    pub name: String,
    pub image: String,
    pub replicas: i64,
    pub available_replicas: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub env_process: String,
    pub env_vars: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub secrets: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub network: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<FunctionResources>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests: Option<FunctionResources>,
    pub read_only_root_filesystem: bool,
    pub debug: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One replica container as reported by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ip_address: String,
    pub status: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub ports: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl ContainerInfo {
    /// The engine reports free-form status text; anything mentioning
    /// `running` or `Up` counts as available.
    pub fn is_running(&self) -> bool {
        self.status.contains("running") || self.status.contains("Up")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    pub provider: ProviderInfo,
    pub version: VersionInfo,
    pub arch: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub name: String,
    pub version: String,
    pub orchestration: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    pub release: String,
    pub sha: String,
}

impl SystemInfo {
    pub fn current() -> Self {
        SystemInfo {
            provider: ProviderInfo {
                name: "docker-faas".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                orchestration: "docker".to_string(),
            },
            version: VersionInfo {
                release: env!("CARGO_PKG_VERSION").to_string(),
                sha: "dev".to_string(),
            },
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

pub fn encode_map(map: &HashMap<String, String>) -> String {
    if map.is_empty() {
        return String::new();
    }
    serde_json::to_string(map).unwrap_or_default()
}

pub fn decode_map(raw: &str) -> HashMap<String, String> {
    if raw.is_empty() {
        return HashMap::new();
    }
    serde_json::from_str(raw).unwrap_or_default()
}

pub fn encode_list(list: &[String]) -> String {
    if list.is_empty() {
        return String::new();
    }
    serde_json::to_string(list).unwrap_or_default()
}

pub fn decode_list(raw: &str) -> Vec<String> {
    if raw.is_empty() {
        return Vec::new();
    }
    serde_json::from_str(raw).unwrap_or_default()
}

pub fn encode_resources(resources: &Option<FunctionResources>) -> String {
    match resources {
        Some(r) => serde_json::to_string(r).unwrap_or_default(),
        None => String::new(),
    }
}

pub fn decode_resources(raw: &str) -> Option<FunctionResources> {
    if raw.is_empty() {
        return None;
    }
    serde_json::from_str(raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_map_round_trip() {
        let mut map = HashMap::new();
        map.insert("fprocess".to_string(), "cat".to_string());
        map.insert("X".to_string(), "y z".to_string());

        let encoded = encode_map(&map);
        assert_eq!(decode_map(&encoded), map);
        assert_eq!(encode_map(&decode_map(&encoded)), encoded);
    }

    #[test]
    fn empty_values_encode_to_empty_strings() {
        assert_eq!(encode_map(&HashMap::new()), "");
        assert_eq!(encode_list(&[]), "");
        assert_eq!(encode_resources(&None), "");
        assert!(decode_map("").is_empty());
        assert!(decode_list("").is_empty());
        assert!(decode_resources("").is_none());
    }

    #[test]
    fn record_round_trips_deployment_fields() {
        let deployment = FunctionDeployment {
            service: "echo".to_string(),
            image: "alpine:latest".to_string(),
            network: "docker-faas-net-echo".to_string(),
            env_process: "cat".to_string(),
            env_vars: HashMap::from([("A".to_string(), "1".to_string())]),
            labels: HashMap::from([("team".to_string(), "x".to_string())]),
            secrets: vec!["api-key".to_string()],
            limits: Some(FunctionResources {
                memory: "128m".to_string(),
                cpu: "0.5".to_string(),
            }),
            requests: None,
            read_only_root_filesystem: true,
            debug: false,
        };

        let record = FunctionRecord::from_deployment(&deployment, 2);
        assert_eq!(record.replicas, 2);

        let restored = record.to_deployment();
        assert_eq!(restored.service, deployment.service);
        assert_eq!(restored.image, deployment.image);
        assert_eq!(restored.env_vars, deployment.env_vars);
        assert_eq!(restored.secrets, deployment.secrets);
        assert_eq!(restored.limits, deployment.limits);
        assert!(restored.requests.is_none());
        assert!(restored.read_only_root_filesystem);
    }

    #[test]
    fn running_status_detection() {
        let mut container = ContainerInfo {
            id: "abc".to_string(),
            name: "echo-0".to_string(),
            ip_address: "172.18.0.2".to_string(),
            status: "Up 2 minutes".to_string(),
            ports: HashMap::new(),
            created_at: Utc::now(),
        };
        assert!(container.is_running());
        container.status = "running".to_string();
        assert!(container.is_running());
        container.status = "Exited (0) 5 seconds ago".to_string();
        assert!(!container.is_running());
    }

    #[test]
    fn deployment_json_uses_camel_case() {
        let deployment: FunctionDeployment = serde_json::from_str(
            r#"{"service":"echo","image":"alpine","envProcess":"cat","envVars":{"a":"b"},"readOnlyRootFilesystem":true}"#,
        )
        .unwrap();
        assert_eq!(deployment.env_process, "cat");
        assert!(deployment.read_only_root_filesystem);
        assert_eq!(deployment.env_vars["a"], "b");
    }
}
