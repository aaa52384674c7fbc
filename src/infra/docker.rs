//! Docker engine adapter: containers, images, networks and image builds via
//! the daemon API.
//!
//! Every container and managed network is labelled so that gateway restarts
//! can re-discover them by label alone.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    NetworkingConfig, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::{BuildImageOptions, CreateImageOptions};
use bollard::network::{
    ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions, InspectNetworkOptions,
    ListNetworksOptions,
};
use bollard::secret::{
    ContainerSummary, CreateImageInfo, EndpointSettings, HostConfig, Mount, MountTypeEnum,
    PortBinding, RestartPolicy, RestartPolicyNameEnum,
};
use bollard::Docker;
use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Utc};
use flate2::{write::GzEncoder, Compression};
use futures::{StreamExt, TryStreamExt};
use itertools::Itertools;
use log::{debug, info, warn};
use map_macro::hash_map;

use crate::build::BoundedBuffer;
use crate::domain::model::{ContainerInfo, FunctionDeployment};
use crate::domain::port::{ContainerEngine, SecretStore};
use crate::error::{GatewayError, Result};
use crate::infra::secrets::CONTAINER_SECRETS_PATH;

pub const LABEL_FUNCTION: &str = "com.docker-faas.function";
pub const LABEL_TYPE: &str = "com.docker-faas.type";
pub const LABEL_REPLICA: &str = "com.docker-faas.replica";
pub const LABEL_NETWORK: &str = "com.docker-faas.network.name";
pub const LABEL_NETWORK_MARKER: &str = "com.docker-faas.network";
pub const LABEL_NETWORK_TYPE: &str = "com.docker-faas.network.type";
pub const LABEL_NETWORK_FUNCTION: &str = "com.docker-faas.network.function";

const STOP_GRACE_SECONDS: i64 = 10;
const DEBUG_PORTS: [&str; 2] = ["40000/tcp", "5678/tcp"];

pub struct DockerEngine {
    docker: Docker,
    base_network: String,
    secrets: Arc<dyn SecretStore>,
    gateway_id: Option<String>,
    debug_bind_address: String,
}

impl DockerEngine {
    pub async fn new(
        docker: Docker,
        base_network: &str,
        debug_bind_address: &str,
        secrets: Arc<dyn SecretStore>,
    ) -> Result<Self> {
        let gateway_id = resolve_gateway_container();
        if let Some(ref id) = gateway_id {
            info!("Gateway running in container {id}, function networks will be attached");
        }

        let debug_bind_address = if debug_bind_address.is_empty() {
            "127.0.0.1".to_string()
        } else {
            debug_bind_address.to_string()
        };

        let engine = Self {
            docker,
            base_network: base_network.to_string(),
            secrets,
            gateway_id,
            debug_bind_address,
        };

        if !engine.base_network.is_empty() {
            let base_network = engine.base_network.clone();
            engine
                .ensure_network(&base_network, hash_map! { LABEL_NETWORK_TYPE.to_string() => "base".to_string() })
                .await?;
        }

        Ok(engine)
    }

    /// The gateway's own container id, when the process runs containerised.
    pub fn gateway_container_id(&self) -> Option<&str> {
        self.gateway_id.as_deref()
    }

    async fn ensure_network(&self, network_name: &str, labels: HashMap<String, String>) -> Result<()> {
        let networks = self
            .docker
            .list_networks(Some(ListNetworksOptions {
                filters: hash_map! { "name" => vec![network_name] },
            }))
            .await
            .map_err(GatewayError::engine)?;

        let exists = networks
            .iter()
            .any(|network| network.name.as_deref() == Some(network_name));
        if exists {
            return Ok(());
        }

        let mut network_labels =
            hash_map! { LABEL_NETWORK_MARKER.to_string() => "true".to_string() };
        network_labels.extend(labels);

        info!("Creating network: {network_name}");
        self.docker
            .create_network(CreateNetworkOptions {
                name: network_name.to_string(),
                driver: "bridge".to_string(),
                labels: network_labels,
                ..Default::default()
            })
            .await
            .map_err(GatewayError::engine)?;
        Ok(())
    }

    async fn ensure_gateway_connected(&self, network_name: &str) -> Result<()> {
        let Some(ref gateway_id) = self.gateway_id else {
            return Ok(());
        };

        match self
            .docker
            .connect_network(
                network_name,
                ConnectNetworkOptions {
                    container: gateway_id.as_str(),
                    endpoint_config: EndpointSettings::default(),
                },
            )
            .await
        {
            Ok(()) => {
                info!("Connected gateway container {gateway_id} to network {network_name}");
                Ok(())
            }
            Err(error) if is_already_connected_err(&error) => Ok(()),
            Err(error) => Err(GatewayError::engine(error)),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        if self.image_exists(image).await {
            info!("Using local image: {image}");
            return Ok(());
        }

        info!("Pulling image: {image}");
        self.docker
            .create_image(
                Some(CreateImageOptions {
                    from_image: image,
                    ..Default::default()
                }),
                None,
                None,
            )
            .try_collect::<Vec<CreateImageInfo>>()
            .await
            .map_err(|e| GatewayError::engine(anyhow::anyhow!("failed to pull image: {e}")))?;
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> bool {
        match self.docker.inspect_image(image).await {
            Ok(_) => true,
            Err(error) if is_not_found_status(&error) => false,
            Err(error) => {
                debug!("Image inspect failed for {image}: {error}");
                false
            }
        }
    }

    /// Host-side directory holding the secrets. When the gateway itself is
    /// containerised, the secrets directory it sees is a mount; replica
    /// bind-mounts must use the mount's host source instead.
    async fn resolve_secrets_host_path(&self) -> String {
        let base_path = self.secrets.base_path().to_string_lossy().into_owned();
        let Some(ref gateway_id) = self.gateway_id else {
            return base_path;
        };

        let inspect = match self
            .docker
            .inspect_container(gateway_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect,
            Err(error) => {
                debug!("Failed to inspect gateway container for secrets mount: {error}");
                return base_path;
            }
        };

        for mount in inspect.mounts.unwrap_or_default() {
            let destination = mount.destination.clone().unwrap_or_default();
            if destination != CONTAINER_SECRETS_PATH && destination != base_path {
                continue;
            }
            let mount_type = mount
                .typ
                .map(|t| format!("{t:?}").to_lowercase())
                .unwrap_or_default();
            let source = mount.source.clone().unwrap_or_default();
            if mount_type == "bind" && !source.is_empty() {
                return source;
            }
            if mount_type == "volume" {
                if let Some(name) = mount.name {
                    match self.docker.inspect_volume(&name).await {
                        Ok(volume) if !volume.mountpoint.is_empty() => return volume.mountpoint,
                        Ok(_) => {}
                        Err(error) => debug!("Volume inspect failed for {name}: {error}"),
                    }
                }
            }
            if !source.is_empty() {
                return source;
            }
        }

        base_path
    }

    async fn create_container(
        &self,
        deployment: &FunctionDeployment,
        name: &str,
        replica_index: i64,
    ) -> Result<()> {
        let network_name = if deployment.network.is_empty() {
            self.base_network.clone()
        } else {
            deployment.network.clone()
        };
        if network_name.is_empty() {
            return Err(GatewayError::bad_request(format!(
                "network is required for function {}",
                deployment.service
            )));
        }

        self.ensure_network(
            &network_name,
            hash_map! {
                LABEL_NETWORK_TYPE.to_string() => "function".to_string(),
                LABEL_NETWORK_FUNCTION.to_string() => deployment.service.clone()
            },
        )
        .await?;
        self.ensure_gateway_connected(&network_name).await?;

        let mut labels = hash_map! {
            LABEL_FUNCTION.to_string() => deployment.service.clone(),
            LABEL_TYPE.to_string() => "function".to_string(),
            LABEL_REPLICA.to_string() => replica_index.to_string(),
            LABEL_NETWORK.to_string() => network_name.clone()
        };
        for (key, value) in &deployment.labels {
            labels.insert(key.clone(), value.clone());
        }

        let mut env: Vec<String> = deployment
            .env_vars
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        if !deployment.env_process.is_empty() {
            env.push(format!("fprocess={}", deployment.env_process));
        }

        let mut host_config = HostConfig {
            network_mode: Some(network_name.clone()),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            cap_drop: Some(vec!["ALL".to_string()]),
            ..Default::default()
        };

        if let Some(ref limits) = deployment.limits {
            if !limits.memory.is_empty() {
                host_config.memory = Some(parse_memory(&limits.memory));
            }
            if !limits.cpu.is_empty() {
                host_config.nano_cpus = Some(parse_cpu(&limits.cpu));
            }
        }

        if deployment.read_only_root_filesystem {
            host_config.readonly_rootfs = Some(true);
        }

        if deployment.debug {
            host_config.port_bindings = Some(
                DEBUG_PORTS
                    .iter()
                    .map(|port| {
                        (
                            port.to_string(),
                            Some(vec![PortBinding {
                                host_ip: Some(self.debug_bind_address.clone()),
                                host_port: Some("0".to_string()),
                            }]),
                        )
                    })
                    .collect(),
            );

            if self.debug_bind_address == "0.0.0.0" {
                warn!(
                    "DEBUG MODE: Function {} has debug ports exposed on ALL interfaces (0.0.0.0)",
                    deployment.service
                );
                warn!("Set DEBUG_BIND_ADDRESS=127.0.0.1 to restrict access");
            } else {
                info!(
                    "Debug mode enabled for {} - ports bound to {}",
                    deployment.service, self.debug_bind_address
                );
            }
        }

        if !deployment.secrets.is_empty() {
            let created = self.secrets.ensure_secrets(&deployment.secrets)?;
            if !created.is_empty() {
                warn!(
                    "Auto-created missing secrets for {}: {}",
                    deployment.service,
                    created.join(", ")
                );
            }
            self.secrets.validate_secrets(&deployment.secrets)?;

            let host_secrets_path = self.resolve_secrets_host_path().await;
            let mounts = deployment
                .secrets
                .iter()
                .map(|secret_name| Mount {
                    typ: Some(MountTypeEnum::BIND),
                    source: Some(format!("{host_secrets_path}/{secret_name}")),
                    target: Some(format!("{CONTAINER_SECRETS_PATH}/{secret_name}")),
                    read_only: Some(true),
                    ..Default::default()
                })
                .collect();
            host_config.mounts = Some(mounts);

            info!(
                "Mounting {} secrets for function {}",
                deployment.secrets.len(),
                deployment.service
            );
        }

        let config = Config {
            image: Some(deployment.image.clone()),
            labels: Some(labels),
            env: Some(env),
            exposed_ports: deployment.debug.then(|| {
                DEBUG_PORTS
                    .iter()
                    .map(|port| (port.to_string(), HashMap::new()))
                    .collect()
            }),
            host_config: Some(host_config),
            networking_config: Some(NetworkingConfig {
                endpoints_config: hash_map! {
                    network_name.clone() => EndpointSettings::default()
                },
            }),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name,
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| GatewayError::engine(anyhow::anyhow!("failed to create container: {e}")))?;

        self.docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| GatewayError::engine(anyhow::anyhow!("failed to start container: {e}")))?;

        info!("Container created and started: {name} (ID: {})", response.id);
        Ok(())
    }

    async fn list_function_summaries(&self, function_name: &str) -> Result<Vec<ContainerSummary>> {
        let label = format!("{LABEL_FUNCTION}={function_name}");
        self.docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: hash_map! { "label" => vec![label.as_str()] },
                ..Default::default()
            }))
            .await
            .map_err(GatewayError::engine)
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        self.docker
            .stop_container(name, Some(StopContainerOptions { t: STOP_GRACE_SECONDS }))
            .await
            .map_err(|e| GatewayError::engine(anyhow::anyhow!("failed to stop container: {e}")))?;
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| GatewayError::engine(anyhow::anyhow!("failed to remove container: {e}")))?;
        Ok(())
    }

    async fn summary_to_info(&self, summary: ContainerSummary) -> Option<ContainerInfo> {
        let id = summary.id.clone()?;
        let inspect = match self
            .docker
            .inspect_container(&id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect,
            Err(error) => {
                warn!("Failed to inspect container {id}: {error}");
                return None;
            }
        };

        let labelled_network = inspect
            .config
            .as_ref()
            .and_then(|config| config.labels.as_ref())
            .and_then(|labels| labels.get(LABEL_NETWORK))
            .filter(|network| !network.is_empty())
            .cloned()
            .unwrap_or_else(|| self.base_network.clone());

        let mut ip_address = String::new();
        let mut ports = HashMap::new();
        if let Some(settings) = inspect.network_settings {
            if let Some(networks) = settings.networks {
                if let Some(endpoint) = networks.get(&labelled_network) {
                    ip_address = endpoint.ip_address.clone().unwrap_or_default();
                } else if let Some(endpoint) = networks.values().next() {
                    ip_address = endpoint.ip_address.clone().unwrap_or_default();
                }
            }
            for (port, bindings) in settings.ports.unwrap_or_default() {
                if let Some(binding) = bindings.and_then(|b| b.into_iter().next()) {
                    if let Some(host_port) = binding.host_port {
                        ports.insert(port, host_port);
                    }
                }
            }
        }

        let name = summary
            .names
            .as_ref()
            .and_then(|names| names.first())
            .map(|name| name.trim_start_matches('/').to_string())
            .unwrap_or_else(|| id.clone());

        Some(ContainerInfo {
            id,
            name,
            ip_address,
            status: summary.status.unwrap_or_default(),
            ports,
            created_at: summary
                .created
                .and_then(|created| DateTime::from_timestamp(created, 0))
                .unwrap_or_else(Utc::now),
        })
    }

    fn is_managed_function_network(
        &self,
        network_name: &str,
        function_name: &str,
        labels: &HashMap<String, String>,
    ) -> bool {
        if !function_name.is_empty()
            && network_name
                == crate::domain::function_network_name(&self.base_network, function_name)
        {
            return true;
        }

        if labels.get(LABEL_NETWORK_TYPE).map(String::as_str) != Some("function") {
            return false;
        }
        match labels.get(LABEL_NETWORK_FUNCTION) {
            Some(owner) if !owner.is_empty() => owner == function_name,
            _ => true,
        }
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn deploy_function(&self, deployment: &FunctionDeployment, replicas: i64) -> Result<()> {
        info!(
            "Deploying function: {} with {replicas} replicas",
            deployment.service
        );

        self.pull_image(&deployment.image).await?;

        for index in 0..replicas {
            let container_name = format!("{}-{index}", deployment.service);
            self.create_container(deployment, &container_name, index)
                .await
                .map_err(|e| {
                    GatewayError::engine(anyhow::anyhow!(
                        "failed to create container {container_name}: {e}"
                    ))
                })?;
        }

        Ok(())
    }

    async fn update_function(&self, deployment: &FunctionDeployment, replicas: i64) -> Result<()> {
        if let Err(error) = self.remove_function(&deployment.service).await {
            warn!("Failed to remove old containers: {error}");
        }
        self.deploy_function(deployment, replicas).await
    }

    async fn remove_function(&self, function_name: &str) -> Result<()> {
        info!("Removing function: {function_name}");

        let containers = self.list_function_summaries(function_name).await?;
        for container in containers {
            let Some(id) = container.id else { continue };
            if let Err(error) = self
                .docker
                .stop_container(&id, Some(StopContainerOptions { t: STOP_GRACE_SECONDS }))
                .await
            {
                warn!("Failed to stop container {id}: {error}");
            }
            match self
                .docker
                .remove_container(
                    &id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                Ok(()) => info!("Removed container: {}", &id[..id.len().min(12)]),
                Err(error) => warn!("Failed to remove container {id}: {error}"),
            }
        }

        Ok(())
    }

    async fn scale_function(&self, deployment: &FunctionDeployment, target: i64) -> Result<()> {
        info!("Scaling function {} to {target} replicas", deployment.service);

        let containers = self.list_function_summaries(&deployment.service).await?;
        let current = containers.len() as i64;

        if target > current {
            for index in current..target {
                let container_name = format!("{}-{index}", deployment.service);
                self.create_container(deployment, &container_name, index)
                    .await?;
            }
        } else {
            for index in target..current {
                let container_name = format!("{}-{index}", deployment.service);
                if let Err(error) = self.remove_container(&container_name).await {
                    warn!("Failed to remove container {container_name}: {error}");
                }
            }
        }

        Ok(())
    }

    async fn function_containers(&self, function_name: &str) -> Result<Vec<ContainerInfo>> {
        let summaries = self.list_function_summaries(function_name).await?;
        let mut containers = Vec::with_capacity(summaries.len());
        for summary in summaries {
            if let Some(info) = self.summary_to_info(summary).await {
                containers.push(info);
            }
        }
        Ok(containers)
    }

    async fn container_logs(&self, function_name: &str, tail: i64) -> Result<String> {
        let containers = self.list_function_summaries(function_name).await?;
        let Some(id) = containers.first().and_then(|c| c.id.clone()) else {
            return Err(GatewayError::NotFound(format!(
                "containers for function {function_name}"
            )));
        };

        let mut stream = self.docker.logs(
            &id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: tail.to_string(),
                ..Default::default()
            }),
        );

        let mut output = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| GatewayError::engine(anyhow::anyhow!("failed to read logs: {e}")))?;
            output.extend_from_slice(&chunk.into_bytes());
        }
        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    async fn cleanup_function_network(&self, function_name: &str, network: &str) -> Result<()> {
        if network.is_empty() {
            return Ok(());
        }

        let inspect = match self
            .docker
            .inspect_network(network, Some(InspectNetworkOptions::<&str>::default()))
            .await
        {
            Ok(inspect) => inspect,
            Err(error) if is_network_not_found_err(&error) => return Ok(()),
            Err(error) => return Err(GatewayError::engine(error)),
        };

        let labels = inspect.labels.unwrap_or_default();
        if !self.is_managed_function_network(network, function_name, &labels) {
            return Ok(());
        }

        if let Some(ref gateway_id) = self.gateway_id {
            if let Err(error) = self
                .docker
                .disconnect_network(
                    network,
                    DisconnectNetworkOptions {
                        container: gateway_id.as_str(),
                        force: true,
                    },
                )
                .await
            {
                if !is_not_connected_err(&error) {
                    warn!("Failed to disconnect gateway from network {network}: {error}");
                }
            }
        }

        let inspect = match self
            .docker
            .inspect_network(network, Some(InspectNetworkOptions::<&str>::default()))
            .await
        {
            Ok(inspect) => inspect,
            Err(error) if is_network_not_found_err(&error) => return Ok(()),
            Err(error) => return Err(GatewayError::engine(error)),
        };
        let attached = inspect.containers.map(|c| c.len()).unwrap_or(0);
        if attached > 0 {
            info!("Network {network} still has {attached} containers attached; skipping removal");
            return Ok(());
        }

        match self.docker.remove_network(network).await {
            Ok(()) => {
                info!("Removed function network: {network}");
                Ok(())
            }
            Err(error) if is_network_in_use_err(&error) => {
                info!("Network {network} still in use; skipping removal");
                Ok(())
            }
            Err(error) => Err(GatewayError::engine(error)),
        }
    }

    async fn build_image(
        &self,
        context_dir: &Path,
        dockerfile: &str,
        tag: &str,
        output: &mut BoundedBuffer,
    ) -> Result<()> {
        info!("Building image {tag}");

        let context_dir = context_dir.to_path_buf();
        let body = tokio::task::spawn_blocking(move || -> std::io::Result<bytes::Bytes> {
            let tar_gz = BytesMut::new().writer();
            let enc = GzEncoder::new(tar_gz, Compression::default());
            let mut tar = tar::Builder::new(enc);
            tar.append_dir_all(".", &context_dir)?;
            let tar_gz = tar.into_inner()?.finish()?;
            Ok(tar_gz.into_inner().freeze())
        })
        .await
        .map_err(GatewayError::internal)?
        .map_err(|e| {
            GatewayError::internal(anyhow::anyhow!("failed to create build context: {e}"))
        })?;

        let mut stream = self.docker.build_image(
            BuildImageOptions {
                dockerfile: dockerfile.to_string(),
                t: tag.to_string(),
                rm: true,
                ..Default::default()
            },
            None,
            Some(body),
        );

        while let Some(message) = stream.next().await {
            let message = message
                .map_err(|e| GatewayError::engine(anyhow::anyhow!("docker build failed: {e}")))?;
            if let Some(error) = message.error {
                return Err(GatewayError::engine(anyhow::anyhow!(
                    "docker build error: {error}"
                )));
            }
            if let Some(chunk) = message.stream {
                output.write(chunk.as_bytes());
            }
        }

        Ok(())
    }

    async fn list_function_networks(&self) -> Result<Vec<String>> {
        let label = format!("{LABEL_NETWORK_TYPE}=function");
        let networks = self
            .docker
            .list_networks(Some(ListNetworksOptions {
                filters: hash_map! { "label" => vec![label.as_str()] },
            }))
            .await
            .map_err(GatewayError::engine)?;

        Ok(networks
            .into_iter()
            .filter_map(|network| network.name)
            .filter(|name| !name.is_empty())
            .unique()
            .collect())
    }

    async fn gateway_networks(&self) -> Result<Vec<String>> {
        let Some(ref gateway_id) = self.gateway_id else {
            return Ok(Vec::new());
        };

        let inspect = self
            .docker
            .inspect_container(gateway_id, None::<InspectContainerOptions>)
            .await
            .map_err(GatewayError::engine)?;

        Ok(inspect
            .network_settings
            .and_then(|settings| settings.networks)
            .map(|networks| networks.into_keys().collect())
            .unwrap_or_default())
    }

    async fn connect_gateway(&self, network: &str) -> Result<()> {
        self.ensure_gateway_connected(network).await
    }

    async fn ping(&self) -> Result<()> {
        self.docker.ping().await.map_err(GatewayError::engine)?;
        Ok(())
    }

    async fn check_network(&self) -> Result<()> {
        if self.base_network.is_empty() {
            return Ok(());
        }
        self.docker
            .inspect_network(
                &self.base_network,
                Some(InspectNetworkOptions::<&str>::default()),
            )
            .await
            .map_err(GatewayError::engine)?;
        Ok(())
    }
}

/// Identify the gateway's own container: explicit env override first, then
/// the container hostname when the canonical Docker marker file exists.
fn resolve_gateway_container() -> Option<String> {
    if let Ok(name) = std::env::var("GATEWAY_CONTAINER_NAME") {
        if !name.is_empty() {
            return Some(name);
        }
    }

    if Path::new("/.dockerenv").exists() {
        if let Ok(hostname) = std::env::var("HOSTNAME") {
            if !hostname.is_empty() {
                return Some(hostname);
            }
        }
        if let Ok(hostname) = std::fs::read_to_string("/etc/hostname") {
            let hostname = hostname.trim();
            if !hostname.is_empty() {
                return Some(hostname.to_string());
            }
        }
    }

    None
}

fn is_not_found_status(error: &bollard::errors::Error) -> bool {
    matches!(
        error,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// The daemon reports topology conflicts as plain message strings; fall
/// back to substring classification when no typed status is available.
pub fn is_already_connected_err(error: &bollard::errors::Error) -> bool {
    let message = error.to_string().to_lowercase();
    message.contains("already exists") || message.contains("already connected")
}

pub fn is_not_connected_err(error: &bollard::errors::Error) -> bool {
    error.to_string().to_lowercase().contains("not connected")
}

pub fn is_network_not_found_err(error: &bollard::errors::Error) -> bool {
    if is_not_found_status(error) {
        return true;
    }
    let message = error.to_string().to_lowercase();
    message.contains("network") && message.contains("not found")
}

pub fn is_network_in_use_err(error: &bollard::errors::Error) -> bool {
    let message = error.to_string().to_lowercase();
    message.contains("has active endpoints") || message.contains("network is in use")
}

/// Parse memory strings in Docker (`128m`, `1g`) or Kubernetes (`128Mi`,
/// `1Gi`) style into bytes. Unparseable input yields 0 (no limit).
pub fn parse_memory(memory: &str) -> i64 {
    let memory = memory.trim().to_lowercase();
    if memory.is_empty() {
        return 0;
    }

    let (number, multiplier) = if let Some(number) = memory.strip_suffix("ki") {
        (number, 1024)
    } else if let Some(number) = memory.strip_suffix("mi") {
        (number, 1024 * 1024)
    } else if let Some(number) = memory.strip_suffix("gi") {
        (number, 1024 * 1024 * 1024)
    } else if let Some(number) = memory.strip_suffix('k') {
        (number, 1024)
    } else if let Some(number) = memory.strip_suffix('m') {
        (number, 1024 * 1024)
    } else if let Some(number) = memory.strip_suffix('g') {
        (number, 1024 * 1024 * 1024)
    } else {
        (memory.as_str(), 1)
    };

    number.trim().parse::<i64>().unwrap_or(0) * multiplier
}

/// Parse CPU strings (`0.5`, `2`, `500m`) into Docker nano-CPUs.
pub fn parse_cpu(cpu: &str) -> i64 {
    let cpu = cpu.trim().to_lowercase();
    if cpu.is_empty() {
        return 0;
    }

    if let Some(millis) = cpu.strip_suffix('m') {
        return millis.trim().parse::<f64>().map(|m| (m * 1e6) as i64).unwrap_or(0);
    }
    cpu.parse::<f64>().map(|c| (c * 1e9) as i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_error(message: &str) -> bollard::errors::Error {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: message.to_string(),
        }
    }

    #[test]
    fn memory_parsing_accepts_both_styles() {
        assert_eq!(parse_memory("128m"), 128 * 1024 * 1024);
        assert_eq!(parse_memory("128Mi"), 128 * 1024 * 1024);
        assert_eq!(parse_memory("1g"), 1024 * 1024 * 1024);
        assert_eq!(parse_memory("1Gi"), 1024 * 1024 * 1024);
        assert_eq!(parse_memory("512k"), 512 * 1024);
        assert_eq!(parse_memory("512Ki"), 512 * 1024);
        assert_eq!(parse_memory("1048576"), 1048576);
        assert_eq!(parse_memory(""), 0);
        assert_eq!(parse_memory("lots"), 0);
    }

    #[test]
    fn cpu_parsing_accepts_fractions_and_millicores() {
        assert_eq!(parse_cpu("0.5"), 500_000_000);
        assert_eq!(parse_cpu("2"), 2_000_000_000);
        assert_eq!(parse_cpu("500m"), 500_000_000);
        assert_eq!(parse_cpu("250m"), 250_000_000);
        assert_eq!(parse_cpu(""), 0);
        assert_eq!(parse_cpu("fast"), 0);
    }

    #[test]
    fn error_classification_by_substring() {
        assert!(is_already_connected_err(&server_error(
            "endpoint with name gw already exists in network fn-net"
        )));
        assert!(is_not_connected_err(&server_error(
            "container gw is not connected to network fn-net"
        )));
        assert!(is_network_not_found_err(&server_error(
            "network fn-net not found"
        )));
        assert!(is_network_in_use_err(&server_error(
            "error while removing network: network fn-net has active endpoints"
        )));

        assert!(!is_already_connected_err(&server_error("boom")));
        assert!(!is_network_in_use_err(&server_error("boom")));
    }

    #[test]
    fn not_found_status_is_typed() {
        let error = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "no such network".to_string(),
        };
        assert!(is_network_not_found_err(&error));
    }
}
