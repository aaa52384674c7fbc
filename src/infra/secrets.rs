//! File-backed secret store. Secrets live as single files under a base
//! directory (0700) with owner-read-only permissions, and are bind-mounted
//! read-only into function containers.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose, Engine as _};
use log::info;

use crate::domain::port::SecretStore;
use crate::error::{GatewayError, Result};

/// Mount point of the secrets directory inside function containers.
pub const CONTAINER_SECRETS_PATH: &str = "/var/openfaas/secrets";

const DIR_MODE: u32 = 0o700;
const FILE_MODE: u32 = 0o400;

pub struct FileSecretStore {
    base_path: PathBuf,
}

impl FileSecretStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).map_err(|e| {
            GatewayError::internal(anyhow::anyhow!("failed to create secrets directory: {e}"))
        })?;
        fs::set_permissions(&base_path, fs::Permissions::from_mode(DIR_MODE))
            .map_err(GatewayError::internal)?;
        Ok(Self { base_path })
    }

    /// Secret names must be plain file names; anything path-like is refused.
    fn checked_path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty()
            || name.contains('/')
            || name.contains('\\')
            || name == "."
            || name == ".."
        {
            return Err(GatewayError::bad_request(format!(
                "invalid secret name: {name}"
            )));
        }
        Ok(self.base_path.join(name))
    }

    fn write_secret(&self, path: &Path, value: &str) -> Result<()> {
        // accept base64 payloads, fall back to the raw string
        let data = general_purpose::STANDARD
            .decode(value)
            .unwrap_or_else(|_| value.as_bytes().to_vec());
        fs::write(path, data)
            .map_err(|e| GatewayError::internal(anyhow::anyhow!("failed to write secret: {e}")))?;
        fs::set_permissions(path, fs::Permissions::from_mode(FILE_MODE))
            .map_err(GatewayError::internal)?;
        Ok(())
    }
}

impl SecretStore for FileSecretStore {
    fn create_secret(&self, name: &str, value: &str) -> Result<()> {
        let path = self.checked_path(name)?;
        if path.exists() {
            return Err(GatewayError::Conflict(format!(
                "secret already exists: {name}"
            )));
        }
        self.write_secret(&path, value)?;
        info!("Created secret: {name}");
        Ok(())
    }

    fn update_secret(&self, name: &str, value: &str) -> Result<()> {
        let path = self.checked_path(name)?;
        if !path.exists() {
            return Err(GatewayError::NotFound(format!("secret {name}")));
        }
        fs::remove_file(&path).map_err(GatewayError::internal)?;
        self.write_secret(&path, value)?;
        info!("Updated secret: {name}");
        Ok(())
    }

    fn delete_secret(&self, name: &str) -> Result<()> {
        let path = self.checked_path(name)?;
        if !path.exists() {
            return Err(GatewayError::NotFound(format!("secret {name}")));
        }
        fs::remove_file(&path)
            .map_err(|e| GatewayError::internal(anyhow::anyhow!("failed to delete secret: {e}")))?;
        info!("Deleted secret: {name}");
        Ok(())
    }

    fn list_secrets(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.base_path)
            .map_err(|e| GatewayError::internal(anyhow::anyhow!("failed to list secrets: {e}")))?;
        let mut names: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.path().is_file())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        Ok(names)
    }

    fn secret_exists(&self, name: &str) -> bool {
        match self.checked_path(name) {
            Ok(path) => path.exists(),
            Err(_) => false,
        }
    }

    fn secret_path(&self, name: &str) -> PathBuf {
        self.base_path.join(name)
    }

    fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn ensure_secrets(&self, names: &[String]) -> Result<Vec<String>> {
        let mut created = Vec::new();
        for name in names {
            if name.trim().is_empty() || self.secret_exists(name) {
                continue;
            }
            match self.create_secret(name, "") {
                Ok(()) => created.push(name.clone()),
                Err(_) if self.secret_exists(name) => {}
                Err(error) => return Err(error),
            }
        }
        Ok(created)
    }

    fn validate_secrets(&self, names: &[String]) -> Result<()> {
        let missing: Vec<&str> = names
            .iter()
            .filter(|name| !self.secret_exists(name))
            .map(|name| name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(GatewayError::bad_request(format!(
                "missing secrets: {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FileSecretStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSecretStore::new(dir.path().join("secrets")).unwrap();
        (dir, store)
    }

    #[test]
    fn create_and_read_back() {
        let (_dir, store) = store();
        store.create_secret("api-key", "s3cret").unwrap();

        assert!(store.secret_exists("api-key"));
        assert_eq!(
            fs::read_to_string(store.secret_path("api-key")).unwrap(),
            "s3cret"
        );

        let mode = fs::metadata(store.secret_path("api-key"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, FILE_MODE);
    }

    #[test]
    fn base64_values_are_decoded() {
        let (_dir, store) = store();
        store.create_secret("token", "aGVsbG8=").unwrap();
        assert_eq!(
            fs::read_to_string(store.secret_path("token")).unwrap(),
            "hello"
        );
    }

    #[test]
    fn create_twice_conflicts() {
        let (_dir, store) = store();
        store.create_secret("api-key", "a").unwrap();
        assert!(matches!(
            store.create_secret("api-key", "b").unwrap_err(),
            GatewayError::Conflict(_)
        ));
    }

    #[test]
    fn update_requires_existing() {
        let (_dir, store) = store();
        assert!(matches!(
            store.update_secret("ghost", "x").unwrap_err(),
            GatewayError::NotFound(_)
        ));

        store.create_secret("api-key", "old").unwrap();
        store.update_secret("api-key", "new").unwrap();
        assert_eq!(
            fs::read_to_string(store.secret_path("api-key")).unwrap(),
            "new"
        );
    }

    #[test]
    fn delete_removes_file() {
        let (_dir, store) = store();
        store.create_secret("api-key", "x").unwrap();
        store.delete_secret("api-key").unwrap();
        assert!(!store.secret_exists("api-key"));
        assert!(matches!(
            store.delete_secret("api-key").unwrap_err(),
            GatewayError::NotFound(_)
        ));
    }

    #[test]
    fn list_is_sorted() {
        let (_dir, store) = store();
        store.create_secret("b", "2").unwrap();
        store.create_secret("a", "1").unwrap();
        assert_eq!(store.list_secrets().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn path_like_names_are_rejected() {
        let (_dir, store) = store();
        for bad in ["../escape", "a/b", "", ".", ".."] {
            assert!(store.create_secret(bad, "x").is_err(), "{bad:?}");
        }
    }

    #[test]
    fn ensure_creates_missing_and_reports_them() {
        let (_dir, store) = store();
        store.create_secret("existing", "x").unwrap();

        let created = store
            .ensure_secrets(&[
                "existing".to_string(),
                "fresh".to_string(),
                "  ".to_string(),
            ])
            .unwrap();
        assert_eq!(created, vec!["fresh"]);
        assert!(store.secret_exists("fresh"));

        store
            .validate_secrets(&["existing".to_string(), "fresh".to_string()])
            .unwrap();
        assert!(store
            .validate_secrets(&["missing".to_string()])
            .is_err());
    }
}
