mod aggregator;
mod batches;
mod connections;
mod error;
mod failover;
mod fold;
mod handlers;
mod policy;
mod registry;
mod scheduler;
mod service;
mod state;

use std::sync::Arc;

use anyhow::Context;
use common::{CoordinatorConfig, FsStorage};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::service::CoordinatorService;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("coordinator=debug,axum=info")),
        )
        .init();

    let config = CoordinatorConfig::from_env().context("configuración del coordinador")?;

    let storage = Arc::new(FsStorage::new(&config.data_dir).context("directorio de datos")?);
    let state = AppState::new(config, storage)?;
    info!(
        "coordinador: política {}, fold {}, datos en {}",
        state.scheduler.policy_name(),
        state.aggregator.fold_name(),
        state.config.data_dir.display()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // canal seguro de nodos
    let service = CoordinatorService::bind(state.clone())
        .await
        .with_context(|| format!("no se pudo escuchar en {}", state.config.node_addr))?;
    let service_task = tokio::spawn(service.run(shutdown_rx.clone()));

    // failover en segundo plano
    let failover_task = tokio::spawn(failover::run_failover_loop(
        state.clone(),
        shutdown_rx.clone(),
    ));

    // router HTTP
    let app = handlers::build_router(state.clone());
    let listener = TcpListener::bind(&state.config.http_addr)
        .await
        .with_context(|| format!("no se pudo escuchar en {}", state.config.http_addr))?;
    info!("API HTTP escuchando en {}", listener.local_addr()?);

    let mut http_shutdown = shutdown_rx.clone();
    let http_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.changed().await;
            })
            .await
    });

    tokio::signal::ctrl_c().await.context("esperando Ctrl-C")?;
    info!("Ctrl-C recibido, cerrando");
    let _ = shutdown_tx.send(true);

    if let Err(e) = service_task.await {
        warn!("listener de nodos terminó con error: {}", e);
    }
    if let Err(e) = failover_task.await {
        warn!("failover terminó con error: {}", e);
    }
    http_task.await??;

    Ok(())
}
