use std::sync::Arc;

use common::{Frame, ResultOutcome, Storage, TaskEnvelope, TaskId};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::AgentError;

const TASKS_PREFIX: &str = "tasks/";
const OUTBOX_PREFIX: &str = "outbox/";

fn task_key(task_id: &str) -> String {
    format!("{}{}.json", TASKS_PREFIX, task_id)
}

fn result_key(task_id: &str) -> String {
    format!("{}{}.json", OUTBOX_PREFIX, task_id)
}

fn id_from_key(key: &str, prefix: &str) -> Option<TaskId> {
    key.strip_prefix(prefix)?
        .strip_suffix(".json")
        .map(str::to_string)
}

/// Resultado producido y todavía no confirmado por el coordinador.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingResult {
    pub task_id: TaskId,
    pub outcome: ResultOutcome,
    pub sealed: Vec<u8>,
}

impl PendingResult {
    pub fn to_frame(&self, node_id: &str) -> Frame {
        Frame::result(
            node_id,
            self.task_id.clone(),
            self.outcome.clone(),
            self.sealed.clone(),
        )
    }
}

/// Cola durable del nodo: tareas recibidas (`tasks/`) y resultados sin ACK
/// (`outbox/`). Ambas entradas se borran con el ACK.
pub struct Outbox {
    storage: Arc<dyn Storage>,
}

impl Outbox {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub fn cache_task(&self, task_id: &str, envelope: &TaskEnvelope) -> Result<(), AgentError> {
        let bytes = serde_json::to_vec(envelope)?;
        self.storage.write(&task_key(task_id), &bytes)?;
        Ok(())
    }

    /// Tareas cacheadas, en orden de id. Las entradas ilegibles se saltean.
    pub fn cached_tasks(&self) -> Result<Vec<(TaskId, TaskEnvelope)>, AgentError> {
        let mut out = Vec::new();
        for key in self.storage.keys(TASKS_PREFIX)? {
            let Some(task_id) = id_from_key(&key, TASKS_PREFIX) else {
                continue;
            };
            let Some(bytes) = self.storage.read(&key)? else {
                continue;
            };
            match serde_json::from_slice(&bytes) {
                Ok(envelope) => out.push((task_id, envelope)),
                Err(e) => warn!("tarea cacheada {} ilegible: {}", key, e),
            }
        }
        Ok(out)
    }

    pub fn put_result(&self, result: &PendingResult) -> Result<(), AgentError> {
        let bytes = serde_json::to_vec(result)?;
        self.storage.write(&result_key(&result.task_id), &bytes)?;
        Ok(())
    }

    pub fn result(&self, task_id: &str) -> Result<Option<PendingResult>, AgentError> {
        match self.storage.read(&result_key(task_id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn pending_results(&self) -> Result<Vec<PendingResult>, AgentError> {
        let mut out = Vec::new();
        for key in self.storage.keys(OUTBOX_PREFIX)? {
            let Some(bytes) = self.storage.read(&key)? else {
                continue;
            };
            match serde_json::from_slice(&bytes) {
                Ok(result) => out.push(result),
                Err(e) => warn!("resultado en outbox {} ilegible: {}", key, e),
            }
        }
        Ok(out)
    }

    /// ACK del coordinador: la tarea ya no hace falta.
    pub fn acknowledge(&self, task_id: &str) -> Result<(), AgentError> {
        self.storage.delete(&result_key(task_id))?;
        self.storage.delete(&task_key(task_id))?;
        Ok(())
    }
}
