// coordinator/src/aggregator.rs

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use common::{BatchId, FinalOutput, FrameCipher, ResultOutcome, Storage, TaskId, TaskResult};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::{AggregationError, AggregationTimeout};
use crate::fold::ResultFold;

pub fn output_key(batch_id: &str) -> String {
    format!("results/{}.json", batch_id)
}

#[derive(Debug, Default)]
struct AggregateState {
    results: HashMap<TaskId, TaskResult>,
    /// Tareas de batches ya cerrados; sus reenvíos se ignoran
    closed: HashSet<TaskId>,
    persisted: HashSet<BatchId>,
}

/// Dueño de los resultados. Los espera por batch, los combina con el fold
/// configurado y persiste la salida final.
pub struct ResultAggregator {
    cipher: Arc<FrameCipher>,
    fold: Box<dyn ResultFold>,
    storage: Arc<dyn Storage>,
    state: Mutex<AggregateState>,
    arrived: Notify,
}

impl ResultAggregator {
    pub fn new(cipher: Arc<FrameCipher>, fold: Box<dyn ResultFold>, storage: Arc<dyn Storage>) -> Self {
        Self {
            cipher,
            fold,
            storage,
            state: Mutex::new(AggregateState::default()),
            arrived: Notify::new(),
        }
    }

    pub fn fold_name(&self) -> &'static str {
        self.fold.name()
    }

    fn state(&self) -> MutexGuard<'_, AggregateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Abre el resultado sellado y lo guarda. `Ok(false)` si ya había uno
    /// para esa tarea o su batch ya cerró.
    pub fn submit(
        &self,
        task_id: &str,
        node_id: Option<&str>,
        sealed: &[u8],
    ) -> Result<bool, AggregationError> {
        let payload = self
            .cipher
            .open(sealed)
            .map_err(|_| AggregationError::Integrity {
                task_id: task_id.to_string(),
            })?;

        Ok(self.store(TaskResult {
            task_id: task_id.to_string(),
            node_id: node_id.map(str::to_string),
            outcome: ResultOutcome::Succeeded,
            payload,
            received_at: Utc::now(),
        }))
    }

    /// Resultado FAILED para una tarea que no va a producir salida.
    pub fn record_failure(&self, task_id: &str, node_id: Option<&str>, reason: &str) -> bool {
        self.store(TaskResult {
            task_id: task_id.to_string(),
            node_id: node_id.map(str::to_string),
            outcome: ResultOutcome::Failed {
                reason: reason.to_string(),
            },
            payload: Vec::new(),
            received_at: Utc::now(),
        })
    }

    fn store(&self, result: TaskResult) -> bool {
        let mut state = self.state();
        if state.closed.contains(&result.task_id) || state.results.contains_key(&result.task_id) {
            debug!("resultado duplicado de {}, se ignora", result.task_id);
            return false;
        }
        debug!("resultado de {} guardado ({:?})", result.task_id, result.outcome);
        state.results.insert(result.task_id.clone(), result);
        drop(state);
        self.arrived.notify_waiters();
        true
    }

    pub fn result(&self, task_id: &str) -> Option<TaskResult> {
        self.state().results.get(task_id).cloned()
    }

    fn collect(&self, expected: &BTreeSet<TaskId>) -> (BTreeMap<TaskId, TaskResult>, BTreeSet<TaskId>) {
        let state = self.state();
        let mut found = BTreeMap::new();
        let mut missing = BTreeSet::new();
        for id in expected {
            match state.results.get(id) {
                Some(r) => {
                    found.insert(id.clone(), r.clone());
                }
                None => {
                    missing.insert(id.clone());
                }
            }
        }
        (found, missing)
    }

    /// Espera hasta tener un resultado por cada id o hasta que venza `timeout`.
    pub async fn await_batch(
        &self,
        expected: &BTreeSet<TaskId>,
        timeout: Duration,
    ) -> Result<BTreeMap<TaskId, TaskResult>, AggregationTimeout> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // registrarse antes de mirar el estado para no perder un aviso
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (found, missing) = self.collect(expected);
            if missing.is_empty() {
                return Ok(found);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let (partial, missing) = self.collect(expected);
                if missing.is_empty() {
                    return Ok(partial);
                }
                warn!(
                    "batch vencido tras {:?}: {} resultados, faltan {}",
                    timeout,
                    partial.len(),
                    missing.len()
                );
                return Err(AggregationTimeout { partial, missing });
            }
        }
    }

    /// Fold determinístico: sólo mira los ids esperados, en orden.
    pub fn compute_final_output(
        &self,
        batch_id: &str,
        expected: &BTreeSet<TaskId>,
        results: &BTreeMap<TaskId, TaskResult>,
    ) -> FinalOutput {
        let mut succeeded: Vec<(&TaskId, &[u8])> = Vec::new();
        let mut failed = BTreeMap::new();
        let mut missing = Vec::new();

        for id in expected {
            match results.get(id).map(|r| &r.outcome) {
                Some(ResultOutcome::Succeeded) => {
                    succeeded.push((id, results[id].payload.as_slice()));
                }
                Some(ResultOutcome::Failed { reason }) => {
                    failed.insert(id.clone(), reason.clone());
                }
                None => missing.push(id.clone()),
            }
        }

        FinalOutput {
            batch_id: batch_id.to_string(),
            complete: missing.is_empty(),
            fold: self.fold.name().to_string(),
            value: self.fold.fold(&succeeded),
            succeeded: succeeded.iter().map(|(id, _)| (*id).clone()).collect(),
            failed,
            missing,
        }
    }

    /// Escribe `results/<batch_id>.json` una sola vez; `Ok(false)` si ya estaba.
    pub fn persist(&self, output: &FinalOutput) -> Result<bool, AggregationError> {
        let key = output_key(&output.batch_id);

        if self.state().persisted.contains(&output.batch_id) || self.storage.read(&key)?.is_some() {
            debug!("salida de {} ya persistida", output.batch_id);
            return Ok(false);
        }

        let bytes = serde_json::to_vec_pretty(output)?;
        self.storage.write(&key, &bytes)?;
        self.state().persisted.insert(output.batch_id.clone());

        info!(
            "salida del batch {} persistida en {} (completa={})",
            output.batch_id, key, output.complete
        );
        Ok(true)
    }

    pub fn load_output(&self, batch_id: &str) -> Result<Option<FinalOutput>, AggregationError> {
        match self.storage.read(&output_key(batch_id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Suelta los resultados del batch. Los ids quedan recordados para que un
    /// reenvío tardío no vuelva a crear estado.
    pub fn close_batch(&self, task_ids: &[TaskId]) {
        let mut state = self.state();
        for id in task_ids {
            state.results.remove(id);
            state.closed.insert(id.clone());
        }
    }

    /// Borra el rastro de un batch ya cerrado. Una salida persistida sigue
    /// protegida por el storage.
    pub fn forget_batch(&self, batch_id: &str, task_ids: &[TaskId]) {
        let mut state = self.state();
        state.persisted.remove(batch_id);
        for id in task_ids {
            state.closed.remove(id);
            state.results.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::MemoryStorage;

    use crate::fold::{ConcatFold, SumFold};

    fn cipher() -> Arc<FrameCipher> {
        Arc::new(FrameCipher::from_key_material(b"clave de prueba"))
    }

    fn aggregator(fold: Box<dyn ResultFold>) -> (Arc<FrameCipher>, Arc<MemoryStorage>, ResultAggregator) {
        let cipher = cipher();
        let storage = Arc::new(MemoryStorage::new());
        let agg = ResultAggregator::new(cipher.clone(), fold, storage.clone());
        (cipher, storage, agg)
    }

    fn set(ids: &[&str]) -> BTreeSet<TaskId> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn submit_duplicado_no_cambia_el_resultado() {
        let (cipher, _, agg) = aggregator(Box::new(SumFold));
        let sealed = cipher.seal(b"[1,2]").unwrap();

        assert!(agg.submit("t1", Some("n1"), &sealed).unwrap());
        let first = agg.result("t1").unwrap();
        assert!(!agg.submit("t1", Some("n2"), &sealed).unwrap());
        assert_eq!(agg.result("t1").unwrap(), first);

        let expected = set(&["t1"]);
        let results: BTreeMap<_, _> = [("t1".to_string(), first)].into_iter().collect();
        let out = agg.compute_final_output("b1", &expected, &results);
        assert_eq!(out.value, serde_json::json!(3.0));
    }

    #[test]
    fn submit_con_sello_alterado_es_integrity() {
        let (cipher, _, agg) = aggregator(Box::new(ConcatFold));
        let mut sealed = cipher.seal(b"42").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        assert!(matches!(
            agg.submit("t1", None, &sealed),
            Err(AggregationError::Integrity { .. })
        ));
        assert!(agg.result("t1").is_none());
    }

    #[test]
    fn salida_final_no_depende_del_orden_de_llegada() {
        let ids = ["t3", "t1", "t4", "t2"];
        let payloads = ["[1]", "[2]", "\"x\"", "{\"output\": 5}"];

        let mut outputs = Vec::new();
        for rotation in 0..ids.len() {
            let (cipher, _, agg) = aggregator(Box::new(ConcatFold));
            for i in 0..ids.len() {
                let k = (i + rotation) % ids.len();
                let sealed = cipher.seal(payloads[k].as_bytes()).unwrap();
                agg.submit(ids[k], Some("n1"), &sealed).unwrap();
            }
            agg.record_failure("t5", None, "sin nodos");

            let expected = set(&["t1", "t2", "t3", "t4", "t5"]);
            let mut results = BTreeMap::new();
            for id in &expected {
                results.insert(id.clone(), agg.result(id).unwrap());
            }
            outputs.push(agg.compute_final_output("b1", &expected, &results));
        }

        assert!(outputs.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(outputs[0].succeeded, vec!["t1", "t2", "t3", "t4"]);
        assert_eq!(outputs[0].failed.get("t5").map(String::as_str), Some("sin nodos"));
        assert!(outputs[0].complete);
    }

    #[tokio::test]
    async fn await_batch_vence_con_parcial() {
        let (cipher, _, agg) = aggregator(Box::new(ConcatFold));
        agg.submit("t1", Some("n1"), &cipher.seal(b"1").unwrap()).unwrap();

        let err = agg
            .await_batch(&set(&["t1", "t2"]), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.partial.keys().collect::<Vec<_>>(), vec!["t1"]);
        assert_eq!(err.partial["t1"].payload, b"1".to_vec());
        assert_eq!(err.missing, set(&["t2"]));
    }

    #[tokio::test]
    async fn await_batch_despierta_con_resultado_tardio() {
        let (cipher, _, agg) = aggregator(Box::new(ConcatFold));
        let agg = Arc::new(agg);

        let waiter = {
            let agg = agg.clone();
            tokio::spawn(async move { agg.await_batch(&set(&["t1", "t2"]), Duration::from_secs(5)).await })
        };

        agg.submit("t1", None, &cipher.seal(b"1").unwrap()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        agg.record_failure("t2", Some("n1"), "entrada inválida");

        let results = waiter.await.unwrap().unwrap();
        assert_eq!(results.len(), 2);
        assert!(!results["t2"].outcome.is_success());
    }

    #[test]
    fn persistir_es_una_sola_vez() {
        let (_, storage, agg) = aggregator(Box::new(ConcatFold));
        let expected = set(&["t1"]);
        let out = agg.compute_final_output("b1", &expected, &BTreeMap::new());
        assert!(!out.complete);
        assert_eq!(out.missing, vec!["t1"]);

        assert!(agg.persist(&out).unwrap());
        assert!(!agg.persist(&out).unwrap());
        assert_eq!(storage.keys("results/").unwrap(), vec!["results/b1.json"]);
        assert_eq!(agg.load_output("b1").unwrap(), Some(out));
    }

    #[test]
    fn batch_cerrado_ignora_reenvios() {
        let (cipher, _, agg) = aggregator(Box::new(ConcatFold));
        agg.submit("t1", None, &cipher.seal(b"1").unwrap()).unwrap();
        agg.close_batch(&["t1".to_string()]);
        assert!(agg.result("t1").is_none());
        assert!(!agg.submit("t1", None, &cipher.seal(b"1").unwrap()).unwrap());
        assert!(!agg.record_failure("t1", None, "tarde"));
    }
}
