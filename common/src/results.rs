use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::batch::BatchId;
use crate::node::NodeId;
use crate::task::TaskId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultOutcome {
    Succeeded,
    Failed { reason: String },
}

impl ResultOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ResultOutcome::Succeeded)
    }
}

/// Resultado de una tarea ya descifrado. Inmutable una vez creado.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub node_id: Option<NodeId>,
    pub outcome: ResultOutcome,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

/// Salida final de un batch, tal como se persiste en `results/<batch_id>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalOutput {
    pub batch_id: BatchId,
    /// false si el batch venció con resultados faltantes
    pub complete: bool,
    /// Nombre del fold usado para combinar los resultados
    pub fold: String,
    pub value: serde_json::Value,
    pub succeeded: Vec<TaskId>,
    pub failed: BTreeMap<TaskId, String>,
    pub missing: Vec<TaskId>,
}
