use std::{error::Error, net::SocketAddr, str::FromStr, sync::Arc};

use anyhow::Context;
use axum::routing::get;
use axum::Router;
use bollard::{Docker, API_DEFAULT_VERSION};
use log::{error, info, warn, LevelFilter};
use tokio::net::TcpListener;
use tokio::sync::watch;

use docker_faas::auth::{AuthRateLimiter, TokenManager};
use docker_faas::build::tracker::BuildTracker;
use docker_faas::build::BuildService;
use docker_faas::config::load_config;
use docker_faas::domain::port::{ContainerEngine, SecretStore};
use docker_faas::domain::router::InvocationRouter;
use docker_faas::domain::FaasService;
use docker_faas::infra::docker::DockerEngine;
use docker_faas::infra::reconciler::NetworkReconciler;
use docker_faas::infra::secrets::FileSecretStore;
use docker_faas::infra::store::SqliteFunctionStore;
use docker_faas::infra::web::{self, AppState};
use docker_faas::metrics;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = load_config()?;

    env_logger::builder()
        .filter_level(
            FromStr::from_str(config.log_level.as_str())
                .inspect_err(|_e| {
                    warn!(
                        "Invalid configuration for log level {}. Fallback to default INFO",
                        config.log_level.as_str()
                    )
                })
                .unwrap_or(LevelFilter::Info),
        )
        .init();

    info!("Starting docker-faas gateway");
    info!(
        "Configuration: port={}, network={}, auth={}",
        config.gateway_port, config.functions_network, config.auth_enabled
    );
    metrics::record_gateway_restart();

    let store = Arc::new(SqliteFunctionStore::connect(&config.state_db_path).await?);
    let secrets = Arc::new(FileSecretStore::new(&config.secrets_path)?);

    let docker = if config.docker_host.is_empty() {
        Docker::connect_with_local_defaults()
    } else {
        Docker::connect_with_socket(&config.docker_host, 120, API_DEFAULT_VERSION)
    }
    .context("Can't connect to docker daemon")?;

    let engine = Arc::new(
        DockerEngine::new(
            docker,
            &config.functions_network,
            &config.debug_bind_address,
            secrets.clone() as Arc<dyn SecretStore>,
        )
        .await?,
    );

    let service = Arc::new(FaasService::new(
        store,
        engine.clone() as Arc<dyn ContainerEngine>,
        config.functions_network.clone(),
        config.default_replicas,
        config.max_replicas,
    ));
    let invocation_router = Arc::new(InvocationRouter::new(
        engine.clone() as Arc<dyn ContainerEngine>,
        config.read_timeout(),
        config.exec_timeout(),
    )?);
    let tracker = Arc::new(BuildTracker::new(
        config.build_history_limit,
        config.build_history_retention(),
    ));
    let builds = Arc::new(BuildService::new(
        service.clone(),
        engine.clone() as Arc<dyn ContainerEngine>,
        tracker.clone(),
        config.build_output_limit,
    ));
    let tokens = Arc::new(TokenManager::new(config.auth_token_ttl()));
    let limiter = Arc::new(AuthRateLimiter::new(
        config.auth_rate_limit,
        config.auth_rate_window(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // the reconciler only matters when the gateway itself is containerised
    if engine.gateway_container_id().is_some() && config.reconcile_interval > 0 {
        let reconciler = NetworkReconciler::new(
            engine.clone() as Arc<dyn ContainerEngine>,
            config.reconcile_interval,
        );
        tokio::spawn(reconciler.run(shutdown_rx.clone()));
    }

    if config.metrics_enabled {
        let metrics_addr = format!("0.0.0.0:{}", config.metrics_port);
        tokio::spawn(async move {
            let app = Router::new().route("/metrics", get(web::system::metrics_text));
            match TcpListener::bind(&metrics_addr).await {
                Ok(listener) => {
                    info!("Metrics server listening on {metrics_addr}");
                    if let Err(err) = axum::serve(listener, app).await {
                        error!("Metrics server error: {err}");
                    }
                }
                Err(err) => error!("Failed to bind metrics listener on {metrics_addr}: {err}"),
            }
        });
    }

    let state = AppState {
        service,
        router: invocation_router,
        builds,
        tracker,
        secrets: secrets as Arc<dyn SecretStore>,
        tokens,
        limiter,
        config: Arc::new(config.clone()),
    };
    let app = web::router(state);

    let addr = format!("0.0.0.0:{}", config.gateway_port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Gateway server listening on {addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    let _ = shutdown_tx.send(true);
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutting down server...");
}
