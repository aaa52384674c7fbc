//! Invocation routing: pick a replica via atomic round-robin and proxy the
//! HTTP request to the in-container watchdog.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::{HeaderMap, Method};
use bytes::Bytes;

use super::model::ContainerInfo;
use super::port::ContainerEngine;
use crate::error::{GatewayError, Result};

/// Port the OpenFaaS-style watchdog listens on inside every replica.
pub const WATCHDOG_PORT: u16 = 8080;

const IDLE_POOL_TIMEOUT: Duration = Duration::from_secs(90);

/// Hop-by-hop headers that must not be forwarded to the replica.
const SKIPPED_HEADERS: &[&str] = &["host", "content-length", "connection", "transfer-encoding"];

pub struct InvocationRouter {
    engine: Arc<dyn ContainerEngine>,
    client: reqwest::Client,
    counters: Mutex<HashMap<String, Arc<AtomicU64>>>,
    target_port: u16,
}

impl InvocationRouter {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        read_timeout: Duration,
        exec_timeout: Duration,
    ) -> Result<Self> {
        Self::with_target_port(engine, read_timeout, exec_timeout, WATCHDOG_PORT)
    }

    pub fn with_target_port(
        engine: Arc<dyn ContainerEngine>,
        read_timeout: Duration,
        exec_timeout: Duration,
        target_port: u16,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(IDLE_POOL_TIMEOUT)
            .timeout(exec_timeout)
            .read_timeout(read_timeout)
            .build()
            .map_err(|e| GatewayError::internal(anyhow::anyhow!("proxy client: {e}")))?;
        Ok(Self {
            engine,
            client,
            counters: Mutex::new(HashMap::new()),
            target_port,
        })
    }

    /// Route one request to a replica of `function_name` and return the
    /// upstream response for streaming back to the caller.
    pub async fn route(
        &self,
        function_name: &str,
        method: Method,
        headers: &HeaderMap,
        body: Bytes,
        client_addr: &str,
        host: &str,
    ) -> Result<reqwest::Response> {
        let containers = self.engine.function_containers(function_name).await?;
        if containers.is_empty() {
            return Err(GatewayError::internal(anyhow::anyhow!(
                "no containers available for function: {function_name}"
            )));
        }

        let replica = self.select_replica(function_name, &containers);
        if replica.ip_address.is_empty() {
            return Err(GatewayError::internal(anyhow::anyhow!(
                "replica {} has no network address",
                replica.name
            )));
        }

        let url = format!("http://{}:{}", replica.ip_address, self.target_port);
        let mut forwarded = reqwest::header::HeaderMap::new();
        for (key, value) in headers {
            if SKIPPED_HEADERS.contains(&key.as_str()) {
                continue;
            }
            forwarded.append(key.clone(), value.clone());
        }

        let request = self
            .client
            .request(method, url)
            .headers(forwarded)
            .header("X-Forwarded-For", client_addr)
            .header("X-Forwarded-Host", host)
            .header("X-Forwarded-Proto", "http")
            .body(body);

        request.send().await.map_err(|e| {
            GatewayError::internal(anyhow::anyhow!(
                "failed to forward request to container: {e}"
            ))
        })
    }

    /// Round-robin selection preferring running replicas. The counter is
    /// per-function and monotonic; the replica set may change between
    /// invocations, so the index is always re-reduced modulo the current
    /// list length.
    fn select_replica<'a>(
        &self,
        function_name: &str,
        containers: &'a [ContainerInfo],
    ) -> &'a ContainerInfo {
        let index = self.next_index(function_name);

        let running: Vec<&ContainerInfo> = containers.iter().filter(|c| c.is_running()).collect();
        if running.is_empty() {
            return &containers[(index % containers.len() as u64) as usize];
        }
        running[(index % running.len() as u64) as usize]
    }

    fn next_index(&self, function_name: &str) -> u64 {
        let counter = {
            let mut counters = self.counters.lock().unwrap();
            counters
                .entry(function_name.to_string())
                .or_insert_with(|| Arc::new(AtomicU64::new(0)))
                .clone()
        };
        counter.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::mock::MockEngine;
    use chrono::Utc;

    fn replica(name: &str, ip: &str, status: &str) -> ContainerInfo {
        ContainerInfo {
            id: name.to_string(),
            name: name.to_string(),
            ip_address: ip.to_string(),
            status: status.to_string(),
            ports: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    fn test_router(port: u16) -> InvocationRouter {
        InvocationRouter::with_target_port(
            Arc::new(MockEngine::new()),
            Duration::from_secs(5),
            Duration::from_secs(5),
            port,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn round_robin_is_fair_over_running_replicas() {
        let router = test_router(WATCHDOG_PORT);
        let containers = vec![
            replica("echo-0", "10.0.0.1", "Up 5 minutes"),
            replica("echo-1", "10.0.0.2", "running"),
            replica("echo-2", "10.0.0.3", "Up 1 minute"),
        ];

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..9 {
            let selected = router.select_replica("echo", &containers);
            *counts.entry(selected.name.clone()).or_default() += 1;
        }
        let max = counts.values().max().unwrap();
        let min = counts.values().min().unwrap();
        assert!(max - min <= 1, "uneven distribution: {counts:?}");
    }

    #[tokio::test]
    async fn concurrent_selection_yields_distinct_indices() {
        let router = Arc::new(test_router(WATCHDOG_PORT));
        let mut handles = Vec::new();
        for _ in 0..32 {
            let router = router.clone();
            handles.push(tokio::spawn(async move { router.next_index("echo") }));
        }
        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            assert!(seen.insert(handle.await.unwrap()));
        }
    }

    #[tokio::test]
    async fn stopped_replicas_are_skipped_while_any_runs() {
        let router = test_router(WATCHDOG_PORT);
        let containers = vec![
            replica("echo-0", "10.0.0.1", "Exited (1) 2 minutes ago"),
            replica("echo-1", "10.0.0.2", "Up 2 minutes"),
        ];
        for _ in 0..6 {
            assert_eq!(router.select_replica("echo", &containers).name, "echo-1");
        }
    }

    #[tokio::test]
    async fn falls_back_to_raw_list_when_nothing_runs() {
        let router = test_router(WATCHDOG_PORT);
        let containers = vec![replica("echo-0", "10.0.0.1", "Created")];
        assert_eq!(router.select_replica("echo", &containers).name, "echo-0");
    }

    #[tokio::test]
    async fn proxies_to_replica_and_adds_forwarded_headers() {
        use axum::routing::post;
        use axum::Router;

        async fn echo(headers: HeaderMap, body: String) -> String {
            format!(
                "{}|{}|{}",
                headers
                    .get("X-Forwarded-For")
                    .map(|v| v.to_str().unwrap().to_string())
                    .unwrap_or_default(),
                headers
                    .get("X-Forwarded-Host")
                    .map(|v| v.to_str().unwrap().to_string())
                    .unwrap_or_default(),
                body
            )
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, Router::new().route("/", post(echo)))
                .await
                .unwrap();
        });

        let engine = Arc::new(MockEngine::new());
        engine.set_replica_ip("127.0.0.1");
        engine
            .deploy(&crate::domain::model::FunctionDeployment {
                service: "echo".to_string(),
                image: "alpine:latest".to_string(),
                ..Default::default()
            })
            .await;

        let router = InvocationRouter::with_target_port(
            engine,
            Duration::from_secs(5),
            Duration::from_secs(5),
            port,
        )
        .unwrap();

        let response = router
            .route(
                "echo",
                Method::POST,
                &HeaderMap::new(),
                Bytes::from_static(b"hello"),
                "203.0.113.9",
                "gateway.example",
            )
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        let body = response.text().await.unwrap();
        assert_eq!(body, "203.0.113.9|gateway.example|hello");
    }

    #[tokio::test]
    async fn no_replicas_is_an_error() {
        let engine = Arc::new(MockEngine::new());
        let router = InvocationRouter::new(
            engine,
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .unwrap();
        let err = router
            .route(
                "ghost",
                Method::POST,
                &HeaderMap::new(),
                Bytes::new(),
                "203.0.113.9",
                "gateway",
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code().as_u16(), 500);
    }
}
