// coordinator/src/state.rs

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use common::{BatchId, BatchInfo, ConfigError, CoordinatorConfig, FrameCipher, Storage};
use tracing::debug;

use crate::aggregator::ResultAggregator;
use crate::connections::ConnectionTable;
use crate::fold::fold_from_name;
use crate::policy::policy_from_name;
use crate::registry::NodeRegistry;
use crate::scheduler::Scheduler;

/// Todo lo compartido del coordinador. Se arma una vez en `main` y se clona
/// (son `Arc`) hacia el listener de nodos, el failover y la API HTTP.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<CoordinatorConfig>,
    pub cipher: Arc<FrameCipher>,
    pub registry: Arc<NodeRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub aggregator: Arc<ResultAggregator>,
    pub connections: Arc<ConnectionTable>,
    pub batches: Arc<Mutex<HashMap<BatchId, BatchInfo>>>,
    /// Batches terminados, del más viejo al más nuevo
    finished: Arc<Mutex<VecDeque<BatchId>>>,
}

impl AppState {
    pub fn new(config: CoordinatorConfig, storage: Arc<dyn Storage>) -> Result<Self, ConfigError> {
        let policy = policy_from_name(&config.scheduling_policy)?;
        let fold = fold_from_name(&config.fold)?;

        let cipher = Arc::new(FrameCipher::from_key_material(
            config.encryption_key.expose().as_bytes(),
        ));
        let registry = Arc::new(NodeRegistry::new());
        let connections = Arc::new(ConnectionTable::new());
        let scheduler = Arc::new(Scheduler::new(
            registry.clone(),
            policy,
            connections.clone(),
            config.max_task_attempts,
            config.retry_backoff,
        ));
        let aggregator = Arc::new(ResultAggregator::new(cipher.clone(), fold, storage));

        Ok(Self {
            config: Arc::new(config),
            cipher,
            registry,
            scheduler,
            aggregator,
            connections,
            batches: Arc::new(Mutex::new(HashMap::new())),
            finished: Arc::new(Mutex::new(VecDeque::new())),
        })
    }

    /// Pasa al agregador las tareas que el scheduler dio por perdidas, para
    /// que ningún batch espere por ellas.
    pub fn forward_failures(&self) -> usize {
        let failures = self.scheduler.take_failures();
        for f in &failures {
            self.aggregator
                .record_failure(&f.task_id, f.node_id.as_deref(), &f.reason);
        }
        failures.len()
    }

    pub fn batches(&self) -> MutexGuard<'_, HashMap<BatchId, BatchInfo>> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Anota un batch terminado. Pasado el límite de retención, el más viejo
    /// sale del mapa de batches, del scheduler y del agregador, y sus ids de
    /// tarea se pueden volver a usar. Devuelve cuántos batches se olvidaron.
    pub fn retire_batch(&self, batch_id: &str) -> usize {
        let evicted: Vec<BatchId> = {
            let mut finished = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
            finished.push_back(batch_id.to_string());
            let excess = finished
                .len()
                .saturating_sub(self.config.finished_batch_retention);
            finished.drain(..excess).collect()
        };

        for id in &evicted {
            let Some(info) = self.batches().remove(id) else {
                continue;
            };
            let forgotten = self.scheduler.forget(&info.task_ids);
            self.aggregator.forget_batch(id, &info.task_ids);
            debug!("batch {} olvidado ({} tareas)", id, forgotten);
        }
        evicted.len()
    }
}


#[cfg(test)]
mod tests {
    use super::testing;
    use super::*;

    #[test]
    fn politica_y_fold_salen_de_la_config() {
        let st = testing::state(&[("FLEET_SCHEDULING_POLICY", "round-robin"), ("FLEET_FOLD", "sum")]);
        assert_eq!(st.scheduler.policy_name(), "round-robin");
        assert_eq!(st.aggregator.fold_name(), "sum");
    }

    #[test]
    fn politica_desconocida_es_error_de_config() {
        let cfg = testing::config(&[("FLEET_SCHEDULING_POLICY", "fifo")]);
        let err = AppState::new(cfg, Arc::new(common::MemoryStorage::new())).err();
        assert_eq!(
            err,
            Some(ConfigError::Invalid {
                var: "FLEET_SCHEDULING_POLICY",
                value: "fifo".into()
            })
        );
    }
}
