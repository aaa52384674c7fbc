use std::path::Path;

use async_trait::async_trait;

use super::model::{ContainerInfo, FunctionDeployment, FunctionRecord};
use crate::build::BoundedBuffer;
use crate::error::Result;

/// Container engine operations the gateway depends on. The Docker adapter is
/// the production implementation; tests use an in-memory mock.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Create and start `replicas` containers for a fresh deployment,
    /// pulling the image if it is not present locally.
    async fn deploy_function(&self, deployment: &FunctionDeployment, replicas: i64) -> Result<()>;

    /// Replace all existing containers with freshly created ones.
    async fn update_function(&self, deployment: &FunctionDeployment, replicas: i64) -> Result<()>;

    /// Stop and remove every container labelled for the function.
    async fn remove_function(&self, function_name: &str) -> Result<()>;

    /// Converge the container count for the function towards `target`.
    async fn scale_function(&self, deployment: &FunctionDeployment, target: i64) -> Result<()>;

    async fn function_containers(&self, function_name: &str) -> Result<Vec<ContainerInfo>>;

    /// Plain-text logs from the first replica.
    async fn container_logs(&self, function_name: &str, tail: i64) -> Result<String>;

    /// Best-effort removal of a managed per-function network once the last
    /// container is gone.
    async fn cleanup_function_network(&self, function_name: &str, network: &str) -> Result<()>;

    /// Build an image from a context directory, streaming build output into
    /// `output` (bounded; overflow is discarded).
    async fn build_image(
        &self,
        context_dir: &Path,
        dockerfile: &str,
        tag: &str,
        output: &mut BoundedBuffer,
    ) -> Result<()>;

    /// Names of managed per-function networks.
    async fn list_function_networks(&self) -> Result<Vec<String>>;

    /// Networks the gateway's own container is currently attached to.
    /// Empty when the gateway does not run inside a container.
    async fn gateway_networks(&self) -> Result<Vec<String>>;

    /// Attach the gateway container to a function network. "Already
    /// connected" is success.
    async fn connect_gateway(&self, network: &str) -> Result<()>;

    async fn ping(&self) -> Result<()>;

    /// Verify the base network exists.
    async fn check_network(&self) -> Result<()>;
}

/// Persistent function metadata, keyed by unique name.
#[async_trait]
pub trait FunctionStore: Send + Sync {
    async fn create_function(&self, record: &FunctionRecord) -> Result<()>;
    async fn get_function(&self, name: &str) -> Result<Option<FunctionRecord>>;
    async fn list_functions(&self) -> Result<Vec<FunctionRecord>>;
    async fn update_function(&self, record: &FunctionRecord) -> Result<()>;
    async fn delete_function(&self, name: &str) -> Result<()>;
    async fn update_replicas(&self, name: &str, replicas: i64) -> Result<()>;
    async fn ping(&self) -> Result<()>;
}

/// Named opaque blobs mounted read-only into function containers.
pub trait SecretStore: Send + Sync {
    fn create_secret(&self, name: &str, value: &str) -> Result<()>;
    fn update_secret(&self, name: &str, value: &str) -> Result<()>;
    fn delete_secret(&self, name: &str) -> Result<()>;
    fn list_secrets(&self) -> Result<Vec<String>>;
    fn secret_exists(&self, name: &str) -> bool;

    /// Host-side path of one secret, suitable as a bind-mount source.
    fn secret_path(&self, name: &str) -> std::path::PathBuf;

    /// Base directory holding all secrets.
    fn base_path(&self) -> &Path;

    /// Create any missing secrets with empty values; returns the names that
    /// had to be created so callers can warn about them.
    fn ensure_secrets(&self, names: &[String]) -> Result<Vec<String>>;

    /// Fail when any of `names` is missing.
    fn validate_secrets(&self, names: &[String]) -> Result<()>;
}
