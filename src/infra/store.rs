//! SQLite-backed function metadata store.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use log::info;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::domain::model::FunctionRecord;
use crate::domain::port::FunctionStore;
use crate::error::{GatewayError, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS functions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    image TEXT NOT NULL,
    env_process TEXT NOT NULL DEFAULT '',
    env_vars TEXT NOT NULL DEFAULT '',
    labels TEXT NOT NULL DEFAULT '',
    secrets TEXT NOT NULL DEFAULT '',
    network TEXT NOT NULL DEFAULT '',
    replicas INTEGER NOT NULL DEFAULT 1,
    limits TEXT NOT NULL DEFAULT '',
    requests TEXT NOT NULL DEFAULT '',
    read_only INTEGER NOT NULL DEFAULT 0,
    debug INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

const COLUMNS: &str = "id, name, image, env_process, env_vars, labels, secrets, network, \
                       replicas, limits, requests, read_only, debug, created_at, updated_at";

pub struct SqliteFunctionStore {
    pool: SqlitePool,
}

impl SqliteFunctionStore {
    /// Open (creating if needed) the metadata database at `path`.
    pub async fn connect(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| GatewayError::store(anyhow::anyhow!("failed to open database: {e}")))?;

        let store = Self { pool };
        store.migrate().await?;
        info!("Function store ready at {path}");
        Ok(store)
    }

    /// Private in-memory database, for tests.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| GatewayError::store(anyhow::anyhow!("{e}")))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| GatewayError::store(anyhow::anyhow!("failed to open database: {e}")))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| GatewayError::store(anyhow::anyhow!("failed to apply schema: {e}")))?;
        Ok(())
    }
}

fn store_error(error: sqlx::Error) -> GatewayError {
    GatewayError::store(anyhow::anyhow!("{error}"))
}

#[async_trait]
impl FunctionStore for SqliteFunctionStore {
    async fn create_function(&self, record: &FunctionRecord) -> Result<()> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO functions (name, image, env_process, env_vars, labels, secrets, network, \
             replicas, limits, requests, read_only, debug, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.name)
        .bind(&record.image)
        .bind(&record.env_process)
        .bind(&record.env_vars)
        .bind(&record.labels)
        .bind(&record.secrets)
        .bind(&record.network)
        .bind(record.replicas)
        .bind(&record.limits)
        .bind(&record.requests)
        .bind(record.read_only)
        .bind(record.debug)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(GatewayError::Conflict(format!(
                    "function {} already exists, use PUT to update",
                    record.name
                )))
            }
            Err(error) => Err(store_error(error)),
        }
    }

    async fn get_function(&self, name: &str) -> Result<Option<FunctionRecord>> {
        sqlx::query_as::<_, FunctionRecord>(&format!(
            "SELECT {COLUMNS} FROM functions WHERE name = ?"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)
    }

    async fn list_functions(&self) -> Result<Vec<FunctionRecord>> {
        sqlx::query_as::<_, FunctionRecord>(&format!(
            "SELECT {COLUMNS} FROM functions ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)
    }

    async fn update_function(&self, record: &FunctionRecord) -> Result<()> {
        let result = sqlx::query(
            "UPDATE functions SET image = ?, env_process = ?, env_vars = ?, labels = ?, \
             secrets = ?, network = ?, replicas = ?, limits = ?, requests = ?, read_only = ?, \
             debug = ?, updated_at = ? WHERE name = ?",
        )
        .bind(&record.image)
        .bind(&record.env_process)
        .bind(&record.env_vars)
        .bind(&record.labels)
        .bind(&record.secrets)
        .bind(&record.network)
        .bind(record.replicas)
        .bind(&record.limits)
        .bind(&record.requests)
        .bind(record.read_only)
        .bind(record.debug)
        .bind(Utc::now())
        .bind(&record.name)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        if result.rows_affected() == 0 {
            return Err(GatewayError::NotFound(format!("function {}", record.name)));
        }
        Ok(())
    }

    async fn delete_function(&self, name: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM functions WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;

        if result.rows_affected() == 0 {
            return Err(GatewayError::NotFound(format!("function {name}")));
        }
        Ok(())
    }

    async fn update_replicas(&self, name: &str, replicas: i64) -> Result<()> {
        let result = sqlx::query("UPDATE functions SET replicas = ?, updated_at = ? WHERE name = ?")
            .bind(replicas)
            .bind(Utc::now())
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;

        if result.rows_affected() == 0 {
            return Err(GatewayError::NotFound(format!("function {name}")));
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{encode_map, FunctionDeployment};
    use std::collections::HashMap;

    fn record(name: &str) -> FunctionRecord {
        let deployment = FunctionDeployment {
            service: name.to_string(),
            image: "alpine:latest".to_string(),
            env_process: "cat".to_string(),
            env_vars: HashMap::from([("A".to_string(), "1".to_string())]),
            network: format!("docker-faas-net-{name}"),
            ..Default::default()
        };
        FunctionRecord::from_deployment(&deployment, 1)
    }

    #[tokio::test]
    async fn create_get_round_trip() {
        let store = SqliteFunctionStore::in_memory().await.unwrap();
        store.create_function(&record("echo")).await.unwrap();

        let fetched = store.get_function("echo").await.unwrap().unwrap();
        assert_eq!(fetched.image, "alpine:latest");
        assert_eq!(fetched.env_process, "cat");
        assert_eq!(fetched.env_vars, encode_map(&HashMap::from([("A".to_string(), "1".to_string())])));
        assert_eq!(fetched.replicas, 1);
        assert!(fetched.id > 0);

        assert!(store.get_function("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_name_is_a_conflict() {
        let store = SqliteFunctionStore::in_memory().await.unwrap();
        store.create_function(&record("echo")).await.unwrap();
        let err = store.create_function(&record("echo")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));
    }

    #[tokio::test]
    async fn update_overwrites_fields() {
        let store = SqliteFunctionStore::in_memory().await.unwrap();
        store.create_function(&record("echo")).await.unwrap();

        let mut updated = record("echo");
        updated.image = "alpine:3.20".to_string();
        updated.replicas = 4;
        store.update_function(&updated).await.unwrap();

        let fetched = store.get_function("echo").await.unwrap().unwrap();
        assert_eq!(fetched.image, "alpine:3.20");
        assert_eq!(fetched.replicas, 4);
    }

    #[tokio::test]
    async fn update_missing_function_is_not_found() {
        let store = SqliteFunctionStore::in_memory().await.unwrap();
        assert!(matches!(
            store.update_function(&record("ghost")).await.unwrap_err(),
            GatewayError::NotFound(_)
        ));
        assert!(matches!(
            store.update_replicas("ghost", 2).await.unwrap_err(),
            GatewayError::NotFound(_)
        ));
        assert!(matches!(
            store.delete_function("ghost").await.unwrap_err(),
            GatewayError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn delete_removes_record() {
        let store = SqliteFunctionStore::in_memory().await.unwrap();
        store.create_function(&record("echo")).await.unwrap();
        store.delete_function("echo").await.unwrap();
        assert!(store.get_function("echo").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_replicas_only_touches_count() {
        let store = SqliteFunctionStore::in_memory().await.unwrap();
        store.create_function(&record("echo")).await.unwrap();
        store.update_replicas("echo", 7).await.unwrap();

        let fetched = store.get_function("echo").await.unwrap().unwrap();
        assert_eq!(fetched.replicas, 7);
        assert_eq!(fetched.image, "alpine:latest");
    }

    #[tokio::test]
    async fn list_returns_all_functions() {
        let store = SqliteFunctionStore::in_memory().await.unwrap();
        store.create_function(&record("a")).await.unwrap();
        store.create_function(&record("b")).await.unwrap();

        let names: Vec<String> = store
            .list_functions()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"a".to_string()));
        assert!(names.contains(&"b".to_string()));
    }

    #[tokio::test]
    async fn ping_succeeds_on_open_store() {
        let store = SqliteFunctionStore::in_memory().await.unwrap();
        store.ping().await.unwrap();
    }
}
