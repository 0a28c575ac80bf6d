use std::collections::{BTreeMap, BTreeSet};

use common::{NodeId, TaskId, TaskResult, TaskStatus};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulingError {
    /// No hay nodos ONLINE; la tarea queda PENDING para reintentar.
    #[error("no hay nodos disponibles para la tarea {task_id}")]
    NoAvailableNode { task_id: TaskId },
    #[error("nodo desconocido: {node_id}")]
    UnknownNode { node_id: NodeId },
    /// La entrega falló y la asignación se deshizo.
    #[error("no se pudo entregar la tarea {task_id} al nodo {node_id}: {reason}")]
    DeliveryFailed {
        task_id: TaskId,
        node_id: NodeId,
        reason: String,
    },
    #[error("la tarea {task_id} ya terminó ({status:?})")]
    TaskClosed { task_id: TaskId, status: TaskStatus },
}

impl SchedulingError {
    /// Errores con los que la tarea sigue viva en la cola de reintentos.
    pub fn is_requeued(&self) -> bool {
        matches!(
            self,
            SchedulingError::NoAvailableNode { .. } | SchedulingError::DeliveryFailed { .. }
        )
    }
}

/// Falla del transporte al entregar una tarea a un nodo.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeliveryError {
    #[error("nodo {0} sin conexión")]
    NotConnected(NodeId),
    #[error("cola de salida del nodo {0} llena")]
    QueueFull(NodeId),
}

#[derive(Error, Debug)]
pub enum AggregationError {
    #[error("resultado sellado de la tarea {task_id} no verifica")]
    Integrity { task_id: TaskId },
    #[error(transparent)]
    Storage(#[from] common::StorageError),
    #[error("no se pudo serializar la salida: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Vencimiento de un batch: no es fatal, lleva lo que llegó y lo que falta.
#[derive(Error, Debug, Clone)]
#[error("batch vencido: {} resultados, faltan {}", .partial.len(), .missing.len())]
pub struct AggregationTimeout {
    pub partial: BTreeMap<TaskId, TaskResult>,
    pub missing: BTreeSet<TaskId>,
}

/// Batch rechazado al recibirlo por HTTP.
#[derive(Error, Debug)]
pub enum BatchError {
    #[error("id de tarea inválido: {0:?}")]
    InvalidTaskId(String),
    #[error("id de tarea repetido o ya usado: {0}")]
    DuplicateTaskId(TaskId),
    #[error("peso inválido para la tarea {task_id}: {weight}")]
    InvalidWeight { task_id: TaskId, weight: f64 },
    #[error("payload de la tarea no serializable: {0}")]
    Encode(#[from] serde_json::Error),
}
