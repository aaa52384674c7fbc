//! In-memory stand-in for the Docker engine, used by unit and integration
//! tests. Tracks containers, managed networks, gateway attachments and
//! built image tags without touching a real daemon.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::build::BoundedBuffer;
use crate::domain::model::{ContainerInfo, FunctionDeployment};
use crate::domain::port::ContainerEngine;
use crate::error::{GatewayError, Result};

struct MockState {
    containers: HashMap<String, Vec<ContainerInfo>>,
    function_networks: BTreeSet<String>,
    gateway_networks: BTreeSet<String>,
    built_tags: Vec<String>,
    logs: HashMap<String, String>,
    build_output: String,
    build_failure: Option<String>,
    default_status: String,
    replica_ip: String,
}

pub struct MockEngine {
    state: Mutex<MockState>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                containers: HashMap::new(),
                function_networks: BTreeSet::new(),
                gateway_networks: BTreeSet::new(),
                built_tags: Vec::new(),
                logs: HashMap::new(),
                build_output: String::new(),
                build_failure: None,
                default_status: "Up 1 second".to_string(),
                replica_ip: "172.18.0.2".to_string(),
            }),
        }
    }

    pub fn container_count(&self, function_name: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(function_name)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    pub fn set_default_status(&self, status: &str) {
        self.state.lock().unwrap().default_status = status.to_string();
    }

    pub fn set_replica_ip(&self, ip: &str) {
        self.state.lock().unwrap().replica_ip = ip.to_string();
    }

    pub fn set_logs(&self, function_name: &str, logs: &str) {
        self.state
            .lock()
            .unwrap()
            .logs
            .insert(function_name.to_string(), logs.to_string());
    }

    pub fn set_build_output(&self, output: &str) {
        self.state.lock().unwrap().build_output = output.to_string();
    }

    pub fn set_build_failure(&self, message: &str) {
        self.state.lock().unwrap().build_failure = Some(message.to_string());
    }

    pub fn built_tags(&self) -> Vec<String> {
        self.state.lock().unwrap().built_tags.clone()
    }

    pub fn insert_function_network(&self, network: &str) {
        self.state
            .lock()
            .unwrap()
            .function_networks
            .insert(network.to_string());
    }

    pub fn gateway_network_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .gateway_networks
            .iter()
            .cloned()
            .collect()
    }

    /// Test helper: register a function with one running replica.
    pub async fn deploy(&self, deployment: &FunctionDeployment) {
        self.deploy_function(deployment, 1).await.unwrap();
    }

    fn make_container(state: &MockState, function_name: &str, index: i64) -> ContainerInfo {
        ContainerInfo {
            id: format!("{function_name}-{index}-id"),
            name: format!("{function_name}-{index}"),
            ip_address: state.replica_ip.clone(),
            status: state.default_status.clone(),
            ports: HashMap::new(),
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn deploy_function(&self, deployment: &FunctionDeployment, replicas: i64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let mut containers = Vec::new();
        for index in 0..replicas {
            let container = Self::make_container(&state, &deployment.service, index);
            containers.push(container);
        }
        state
            .containers
            .insert(deployment.service.clone(), containers);
        if !deployment.network.is_empty() {
            state.function_networks.insert(deployment.network.clone());
            state.gateway_networks.insert(deployment.network.clone());
        }
        Ok(())
    }

    async fn update_function(&self, deployment: &FunctionDeployment, replicas: i64) -> Result<()> {
        self.remove_function(&deployment.service).await?;
        self.deploy_function(deployment, replicas).await
    }

    async fn remove_function(&self, function_name: &str) -> Result<()> {
        self.state.lock().unwrap().containers.remove(function_name);
        Ok(())
    }

    async fn scale_function(&self, deployment: &FunctionDeployment, target: i64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let current: Vec<ContainerInfo> = state
            .containers
            .get(&deployment.service)
            .cloned()
            .unwrap_or_default();
        let mut containers = current;
        let current_len = containers.len() as i64;
        if target > current_len {
            for index in current_len..target {
                let container = Self::make_container(&state, &deployment.service, index);
                containers.push(container);
            }
        } else {
            containers.truncate(target as usize);
        }
        state
            .containers
            .insert(deployment.service.clone(), containers);
        Ok(())
    }

    async fn function_containers(&self, function_name: &str) -> Result<Vec<ContainerInfo>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .containers
            .get(function_name)
            .cloned()
            .unwrap_or_default())
    }

    async fn container_logs(&self, function_name: &str, _tail: i64) -> Result<String> {
        let state = self.state.lock().unwrap();
        match state.containers.get(function_name) {
            Some(containers) if !containers.is_empty() => Ok(state
                .logs
                .get(function_name)
                .cloned()
                .unwrap_or_default()),
            _ => Err(GatewayError::NotFound(format!(
                "containers for function {function_name}"
            ))),
        }
    }

    async fn cleanup_function_network(&self, _function_name: &str, network: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.function_networks.remove(network);
        state.gateway_networks.remove(network);
        Ok(())
    }

    async fn build_image(
        &self,
        _context_dir: &Path,
        _dockerfile: &str,
        tag: &str,
        output: &mut BoundedBuffer,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = state.build_failure.clone() {
            return Err(GatewayError::engine(anyhow::anyhow!("{message}")));
        }
        let build_output = state.build_output.clone();
        output.write(build_output.as_bytes());
        state.built_tags.push(tag.to_string());
        Ok(())
    }

    async fn list_function_networks(&self) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .function_networks
            .iter()
            .cloned()
            .collect())
    }

    async fn gateway_networks(&self) -> Result<Vec<String>> {
        Ok(self.gateway_network_names())
    }

    async fn connect_gateway(&self, network: &str) -> Result<()> {
        if network.ends_with("-missing") {
            return Err(GatewayError::engine(anyhow::anyhow!(
                "network {network} not found"
            )));
        }
        self.state
            .lock()
            .unwrap()
            .gateway_networks
            .insert(network.to_string());
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn check_network(&self) -> Result<()> {
        Ok(())
    }
}
