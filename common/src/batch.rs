use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::TaskId;

pub type BatchId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub name: String,

    /// Una entrada por tarea de inferencia
    pub tasks: Vec<TaskSpec>,

    /// Timeout de agregación; si falta se usa el configurado en el coordinador
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Id propuesto por el cliente (reintentos idempotentes). Si falta, se genera.
    #[serde(default)]
    pub id: Option<TaskId>,

    /// Entrada de la tarea, se manda al nodo serializada como JSON
    pub payload: serde_json::Value,

    #[serde(default)]
    pub weight: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Accepted,
    Running,
    Succeeded,
    /// Timeout: salida parcial persistida
    Partial,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchInfo {
    pub id: BatchId,
    pub name: String,
    pub status: BatchStatus,
    pub task_ids: Vec<TaskId>,

    /// -------- Métricas del batch --------
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_tasks: u32,
    pub completed_tasks: u32,
    pub failed_tasks: u32,
    pub missing_tasks: u32,
}
