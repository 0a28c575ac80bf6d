mod agent;
mod error;
mod inference;
mod metrics;
mod outbox;

use std::sync::Arc;

use anyhow::Context;
use common::{FsStorage, NodeConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::agent::{default_node_id, NodeAgent};
use crate::inference::{InferenceEngine, NormalizeEngine};
use crate::metrics::SysinfoSampler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("node=debug")),
        )
        .init();

    let config = NodeConfig::from_env().context("configuración del nodo")?;

    // el hostname es sólo informativo salvo que falte FLEET_NODE_ID
    let hostname = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    let node_id = config
        .node_id
        .clone()
        .unwrap_or_else(|| default_node_id(&hostname));

    let storage = Arc::new(FsStorage::new(&config.data_dir).context("directorio de datos")?);
    let engine: Arc<dyn InferenceEngine> = Arc::new(NormalizeEngine::default());
    info!(
        "nodo {} ({}) con motor {}, hasta {} tareas en paralelo, coordinador en {}",
        node_id,
        hostname,
        engine.name(),
        config.concurrency,
        config.coordinator_addr
    );

    let agent = NodeAgent::new(
        config,
        node_id,
        hostname,
        storage,
        engine,
        Box::new(SysinfoSampler::new()),
    );

    tokio::select! {
        res = agent.run() => res.context("el agente terminó")?,
        res = tokio::signal::ctrl_c() => {
            res.context("esperando Ctrl-C")?;
            info!("Ctrl-C recibido, cerrando");
        }
    }

    Ok(())
}
