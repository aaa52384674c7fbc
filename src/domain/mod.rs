//! Function lifecycle controller: keeps the metadata store, the container
//! engine, and the network topology in agreement through deploy, update,
//! delete and scale.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::time::Instant;

use crate::error::{GatewayError, Result};
use crate::metrics;
use crate::validation::validate_function_name;
use model::{ContainerInfo, FunctionDeployment, FunctionRecord, FunctionStatus};
use port::{ContainerEngine, FunctionStore};

pub mod model;
pub mod port;
pub mod router;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);
const SCALE_FROM_ZERO_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-function network name derived from the configured base network.
pub fn function_network_name(base_network: &str, service: &str) -> String {
    if base_network.is_empty() {
        return service.to_string();
    }
    format!("{base_network}-{service}")
}

pub struct FaasService {
    store: Arc<dyn FunctionStore>,
    engine: Arc<dyn ContainerEngine>,
    base_network: String,
    default_replicas: i64,
    max_replicas: i64,
}

impl FaasService {
    pub fn new(
        store: Arc<dyn FunctionStore>,
        engine: Arc<dyn ContainerEngine>,
        base_network: String,
        default_replicas: i64,
        max_replicas: i64,
    ) -> Self {
        Self {
            store,
            engine,
            base_network,
            default_replicas: default_replicas.max(1),
            max_replicas,
        }
    }

    pub fn engine(&self) -> Arc<dyn ContainerEngine> {
        self.engine.clone()
    }

    /// Deploy a new function. Fails with `Conflict` when the name is taken.
    /// If the engine deploy succeeds but the store write fails, the freshly
    /// created containers are removed again before the error is returned.
    pub async fn deploy(&self, mut deployment: FunctionDeployment) -> Result<()> {
        self.validate_deployment(&deployment)?;
        if deployment.network.is_empty() {
            deployment.network = function_network_name(&self.base_network, &deployment.service);
        }

        if self
            .store
            .get_function(&deployment.service)
            .await?
            .is_some()
        {
            return Err(GatewayError::Conflict(format!(
                "function {} already exists, use PUT to update",
                deployment.service
            )));
        }

        let replicas = self.default_replicas;
        info!(
            "Deploying function: {} (image: {}, replicas: {})",
            deployment.service, deployment.image, replicas
        );

        self.engine.deploy_function(&deployment, replicas).await?;

        let record = FunctionRecord::from_deployment(&deployment, replicas);
        if let Err(store_err) = self.store.create_function(&record).await {
            warn!(
                "Failed to store metadata for {}, removing deployed containers",
                deployment.service
            );
            if let Err(cleanup_err) = self.engine.remove_function(&deployment.service).await {
                warn!(
                    "Cleanup after failed deploy of {} also failed: {cleanup_err}",
                    deployment.service
                );
            }
            return Err(store_err);
        }

        metrics::set_function_replicas(&deployment.service, replicas);
        self.refresh_deployed_gauge().await;
        Ok(())
    }

    /// Update an existing function by removing its containers and
    /// re-creating them with the new spec, preserving the stored replica
    /// count. The metadata record is overwritten afterwards.
    pub async fn update(&self, mut deployment: FunctionDeployment) -> Result<()> {
        self.validate_deployment(&deployment)?;

        let existing = self
            .store
            .get_function(&deployment.service)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("function {}", deployment.service)))?;

        if deployment.network.is_empty() {
            deployment.network = if existing.network.is_empty() {
                function_network_name(&self.base_network, &deployment.service)
            } else {
                existing.network.clone()
            };
        }

        info!(
            "Updating function: {} (image: {})",
            deployment.service, deployment.image
        );

        self.engine
            .update_function(&deployment, existing.replicas)
            .await?;

        let mut record = FunctionRecord::from_deployment(&deployment, existing.replicas);
        record.created_at = existing.created_at;
        self.store.update_function(&record).await?;

        metrics::set_function_replicas(&deployment.service, existing.replicas);
        Ok(())
    }

    /// Remove a function's containers, its metadata record, and (best
    /// effort) its managed per-function network.
    pub async fn delete(&self, name: &str) -> Result<()> {
        validate_function_name(name)?;

        let record = self
            .store
            .get_function(name)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("function {name}")))?;

        info!("Deleting function: {name}");
        self.engine.remove_function(name).await?;
        self.store.delete_function(name).await?;

        if let Err(error) = self
            .engine
            .cleanup_function_network(name, &record.network)
            .await
        {
            warn!("Failed to cleanup network for {name}: {error}");
        }

        metrics::drop_function_metrics(name);
        self.refresh_deployed_gauge().await;
        Ok(())
    }

    /// Scale a function to `target` replicas and persist the new count.
    pub async fn scale(&self, name: &str, target: i64) -> Result<()> {
        validate_function_name(name)?;
        if target < 0 {
            return Err(GatewayError::bad_request("replicas must be >= 0"));
        }
        if self.max_replicas > 0 && target > self.max_replicas {
            return Err(GatewayError::bad_request(format!(
                "replicas must be <= {}",
                self.max_replicas
            )));
        }

        let record = self
            .store
            .get_function(name)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("function {name}")))?;

        info!("Scaling function {name} to {target} replicas");
        let deployment = record.to_deployment();
        self.engine.scale_function(&deployment, target).await?;
        self.store.update_replicas(name, target).await?;

        metrics::set_function_replicas(name, target);
        Ok(())
    }

    /// Start the first replica of an idle function and wait until the
    /// engine reports it running, for async invocations hitting a
    /// scaled-to-zero function.
    pub async fn scale_from_zero(&self, name: &str) -> Result<()> {
        info!("Scaling function {name} from zero");
        self.scale(name, 1).await?;
        self.wait_for_ready(name, SCALE_FROM_ZERO_TIMEOUT).await
    }

    /// Poll until at least one replica reports running, or time out.
    pub async fn wait_for_ready(&self, name: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.available_replicas(name).await? > 0 {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(GatewayError::Timeout(format!(
                    "function {name} failed to become ready"
                )));
            }
            tokio::time::sleep(READY_POLL_INTERVAL.min(remaining)).await;
        }
    }

    pub async fn get_record(&self, name: &str) -> Result<FunctionRecord> {
        self.store
            .get_function(name)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("function {name}")))
    }

    /// Status view for every stored function. A function whose containers
    /// cannot be listed is skipped with a warning rather than failing the
    /// whole listing.
    pub async fn list_statuses(&self) -> Result<Vec<FunctionStatus>> {
        let records = self.store.list_functions().await?;
        let mut statuses = Vec::with_capacity(records.len());
        for record in records {
            let containers = match self.engine.function_containers(&record.name).await {
                Ok(containers) => containers,
                Err(error) => {
                    warn!(
                        "Failed to get containers for function {}: {error}",
                        record.name
                    );
                    continue;
                }
            };
            let available = containers.iter().filter(|c| c.is_running()).count() as i64;
            statuses.push(record.to_status(available));
        }
        Ok(statuses)
    }

    pub async fn function_containers(&self, name: &str) -> Result<Vec<ContainerInfo>> {
        validate_function_name(name)?;
        self.engine.function_containers(name).await
    }

    pub async fn available_replicas(&self, name: &str) -> Result<i64> {
        let containers = self.engine.function_containers(name).await?;
        Ok(containers.iter().filter(|c| c.is_running()).count() as i64)
    }

    pub async fn logs(&self, name: &str, tail: i64) -> Result<String> {
        validate_function_name(name)?;
        self.engine.container_logs(name, tail).await
    }

    pub async fn store_ping(&self) -> Result<()> {
        self.store.ping().await
    }

    fn validate_deployment(&self, deployment: &FunctionDeployment) -> Result<()> {
        if deployment.service.is_empty() || deployment.image.is_empty() {
            return Err(GatewayError::bad_request(
                "service name and image are required",
            ));
        }
        validate_function_name(&deployment.service)
    }

    async fn refresh_deployed_gauge(&self) {
        match self.store.list_functions().await {
            Ok(functions) => metrics::set_functions_deployed(functions.len() as i64),
            Err(error) => warn!("Failed to refresh deployed-functions gauge: {error}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::mock::MockEngine;
    use crate::infra::store::SqliteFunctionStore;
    use async_trait::async_trait;
    use std::collections::HashMap;

    async fn service_with_engine() -> (FaasService, Arc<MockEngine>) {
        let store = Arc::new(SqliteFunctionStore::in_memory().await.unwrap());
        let engine = Arc::new(MockEngine::new());
        let service = FaasService::new(store, engine.clone(), "docker-faas-net".to_string(), 1, 10);
        (service, engine)
    }

    fn echo_deployment() -> FunctionDeployment {
        FunctionDeployment {
            service: "echo".to_string(),
            image: "alpine:latest".to_string(),
            env_process: "cat".to_string(),
            env_vars: HashMap::from([("fprocess".to_string(), "cat".to_string())]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn deploy_persists_record_with_derived_network() {
        let (service, engine) = service_with_engine().await;
        service.deploy(echo_deployment()).await.unwrap();

        let record = service.get_record("echo").await.unwrap();
        assert_eq!(record.image, "alpine:latest");
        assert_eq!(record.replicas, 1);
        assert_eq!(record.network, "docker-faas-net-echo");
        assert_eq!(engine.container_count("echo"), 1);
    }

    #[tokio::test]
    async fn second_deploy_conflicts() {
        let (service, _engine) = service_with_engine().await;
        service.deploy(echo_deployment()).await.unwrap();
        let err = service.deploy(echo_deployment()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));
    }

    #[tokio::test]
    async fn delete_removes_containers_and_record() {
        let (service, engine) = service_with_engine().await;
        service.deploy(echo_deployment()).await.unwrap();
        service.delete("echo").await.unwrap();

        assert_eq!(engine.container_count("echo"), 0);
        assert!(matches!(
            service.get_record("echo").await.unwrap_err(),
            GatewayError::NotFound(_)
        ));
        assert!(matches!(
            service.delete("echo").await.unwrap_err(),
            GatewayError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn scale_converges_engine_and_store() {
        let (service, engine) = service_with_engine().await;
        service.deploy(echo_deployment()).await.unwrap();

        service.scale("echo", 3).await.unwrap();
        assert_eq!(engine.container_count("echo"), 3);
        assert_eq!(service.get_record("echo").await.unwrap().replicas, 3);

        // second identical scale is a no-op
        service.scale("echo", 3).await.unwrap();
        assert_eq!(engine.container_count("echo"), 3);

        service.scale("echo", 0).await.unwrap();
        assert_eq!(engine.container_count("echo"), 0);
        assert_eq!(service.get_record("echo").await.unwrap().replicas, 0);
    }

    #[tokio::test]
    async fn scale_rejects_bad_targets() {
        let (service, _engine) = service_with_engine().await;
        service.deploy(echo_deployment()).await.unwrap();
        assert!(service.scale("echo", -1).await.is_err());
        assert!(service.scale("echo", 11).await.is_err());
        assert!(matches!(
            service.scale("ghost", 1).await.unwrap_err(),
            GatewayError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn update_replaces_spec_and_preserves_replicas() {
        let (service, engine) = service_with_engine().await;
        service.deploy(echo_deployment()).await.unwrap();
        service.scale("echo", 2).await.unwrap();

        let mut updated = echo_deployment();
        updated.image = "alpine:3.20".to_string();
        updated.env_process = "wc -l".to_string();
        service.update(updated).await.unwrap();

        let record = service.get_record("echo").await.unwrap();
        assert_eq!(record.image, "alpine:3.20");
        assert_eq!(record.env_process, "wc -l");
        assert_eq!(record.replicas, 2);
        assert_eq!(engine.container_count("echo"), 2);
    }

    #[tokio::test]
    async fn update_of_missing_function_is_not_found() {
        let (service, _engine) = service_with_engine().await;
        let err = service.update(echo_deployment()).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn scale_from_zero_waits_until_running() {
        let (service, engine) = service_with_engine().await;
        service.deploy(echo_deployment()).await.unwrap();
        service.scale("echo", 0).await.unwrap();

        service.scale_from_zero("echo").await.unwrap();
        assert_eq!(engine.container_count("echo"), 1);
        assert_eq!(service.get_record("echo").await.unwrap().replicas, 1);
    }

    #[tokio::test]
    async fn wait_for_ready_times_out_when_nothing_runs() {
        let (service, engine) = service_with_engine().await;
        engine.set_default_status("Created");
        service.deploy(echo_deployment()).await.unwrap();

        let err = service
            .wait_for_ready("echo", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Timeout(_)));
    }

    struct FailingStore;

    #[async_trait]
    impl FunctionStore for FailingStore {
        async fn create_function(&self, _record: &FunctionRecord) -> Result<()> {
            Err(GatewayError::store(anyhow::anyhow!("disk full")))
        }
        async fn get_function(&self, _name: &str) -> Result<Option<FunctionRecord>> {
            Ok(None)
        }
        async fn list_functions(&self) -> Result<Vec<FunctionRecord>> {
            Ok(Vec::new())
        }
        async fn update_function(&self, _record: &FunctionRecord) -> Result<()> {
            Ok(())
        }
        async fn delete_function(&self, _name: &str) -> Result<()> {
            Ok(())
        }
        async fn update_replicas(&self, _name: &str, _replicas: i64) -> Result<()> {
            Ok(())
        }
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_store_write_rolls_back_engine_deploy() {
        let engine = Arc::new(MockEngine::new());
        let service = FaasService::new(
            Arc::new(FailingStore),
            engine.clone(),
            "docker-faas-net".to_string(),
            1,
            10,
        );

        let err = service.deploy(echo_deployment()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Store(_)));
        assert_eq!(engine.container_count("echo"), 0);
    }

    #[test]
    fn network_name_derivation() {
        assert_eq!(
            function_network_name("docker-faas-net", "echo"),
            "docker-faas-net-echo"
        );
        assert_eq!(function_network_name("", "echo"), "echo");
    }
}
