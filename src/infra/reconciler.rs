//! Network reconciliation: a periodic safety net that re-attaches the
//! gateway container to function networks it is missing, covering gateway
//! restarts while functions already exist.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::watch;

use crate::domain::port::ContainerEngine;
use crate::error::Result;

pub struct NetworkReconciler {
    engine: Arc<dyn ContainerEngine>,
    interval_secs: u64,
}

impl NetworkReconciler {
    pub fn new(engine: Arc<dyn ContainerEngine>, interval_secs: u64) -> Self {
        Self {
            engine,
            interval_secs,
        }
    }

    /// Compare the gateway's attachment set with the labelled function
    /// networks and connect to any that are missing. Returns how many
    /// networks were attached.
    pub async fn reconcile_once(&self) -> Result<usize> {
        let attached: HashSet<String> = self.engine.gateway_networks().await?.into_iter().collect();
        let function_networks = self.engine.list_function_networks().await?;

        let mut attached_count = 0;
        for network in function_networks {
            if network.is_empty() || attached.contains(&network) {
                continue;
            }

            match self.engine.connect_gateway(&network).await {
                Ok(()) => {
                    info!("Reconciliation: connected gateway to network {network}");
                    attached_count += 1;
                }
                Err(err) if err.to_string().to_lowercase().contains("not found") => {
                    warn!("Network {network} not found during reconciliation");
                }
                Err(err) => {
                    error!("Failed to connect gateway to network {network}: {err}");
                }
            }
        }

        Ok(attached_count)
    }

    /// Periodic loop; runs until the shutdown signal flips. An interval of
    /// zero disables the loop entirely.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if self.interval_secs == 0 {
            return;
        }

        let mut ticker = tokio::time::interval(Duration::from_secs(self.interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick fires immediately; skip it so the loop is periodic
        ticker.tick().await;

        info!(
            "Network reconciliation started (interval: {}s)",
            self.interval_secs
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Network reconciliation stopped");
                    return;
                }
                _ = ticker.tick() => {
                    match self.reconcile_once().await {
                        Ok(attached) if attached > 0 => {
                            info!("Periodic reconciliation: connected to {attached} networks");
                        }
                        Ok(_) => {}
                        Err(err) => error!("Periodic network reconciliation failed: {err}"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::mock::MockEngine;

    #[tokio::test]
    async fn attaches_missing_function_networks() {
        let engine = Arc::new(MockEngine::new());
        engine.insert_function_network("docker-faas-net-echo");
        engine.insert_function_network("docker-faas-net-word");

        let reconciler = NetworkReconciler::new(engine.clone(), 30);
        let attached = reconciler.reconcile_once().await.unwrap();
        assert_eq!(attached, 2);
        assert_eq!(
            engine.gateway_network_names(),
            vec![
                "docker-faas-net-echo".to_string(),
                "docker-faas-net-word".to_string()
            ]
        );

        // second pass is a no-op
        assert_eq!(reconciler.reconcile_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_network_is_skipped_with_warning() {
        let engine = Arc::new(MockEngine::new());
        engine.insert_function_network("docker-faas-net-missing");
        engine.insert_function_network("docker-faas-net-echo");

        let reconciler = NetworkReconciler::new(engine.clone(), 30);
        let attached = reconciler.reconcile_once().await.unwrap();
        assert_eq!(attached, 1);
    }

    #[tokio::test]
    async fn shutdown_signal_stops_loop() {
        let engine = Arc::new(MockEngine::new());
        let reconciler = NetworkReconciler::new(engine, 3600);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(reconciler.run(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
    }
}
