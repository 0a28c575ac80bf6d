use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::batch::BatchId;
use crate::node::NodeId;
use crate::results::ResultOutcome;

pub type TaskId = String;

pub const DEFAULT_TASK_WEIGHT: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Completed,
    Failed,
    Expired,
}

impl TaskStatus {
    /// Estados de los que una tarea ya no sale.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Expired
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub batch_id: Option<BatchId>,

    /// Entrada opaca para el motor de inferencia del nodo
    pub payload: Vec<u8>,
    /// Costo estimado; se suma a la carga del nodo mientras la tarea esté asignada
    pub weight: f64,

    pub created_at: DateTime<Utc>,
    pub status: TaskStatus,
    /// Intentos fallidos acumulados (entrega, nodo caído o fallo de inferencia)
    pub attempt: u32,
}

impl Task {
    pub fn new(payload: Vec<u8>, weight: f64) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), payload, weight)
    }

    pub fn with_id(id: impl Into<TaskId>, payload: Vec<u8>, weight: f64) -> Self {
        Self {
            id: id.into(),
            batch_id: None,
            payload,
            weight: weight.max(0.0),
            created_at: Utc::now(),
            status: TaskStatus::Pending,
            attempt: 0,
        }
    }

    pub fn in_batch(mut self, batch_id: impl Into<BatchId>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }
}

/// Lo que viaja al nodo dentro de un frame TASK.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub payload: Vec<u8>,
    pub weight: f64,
    pub attempt: u32,
}

impl From<&Task> for TaskEnvelope {
    fn from(task: &Task) -> Self {
        Self {
            payload: task.payload.clone(),
            weight: task.weight,
            attempt: task.attempt,
        }
    }
}

/// Estado de una tarea tal como lo expone la API HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskView {
    pub task_id: TaskId,
    pub batch_id: Option<BatchId>,
    pub status: TaskStatus,
    pub attempt: u32,
    pub weight: f64,
    pub owner: Option<NodeId>,
    /// Presente mientras el batch no se cerró
    pub outcome: Option<ResultOutcome>,
}
