use serde::{Deserialize, Serialize};

use crate::node::{Heartbeat, NodeId};
use crate::results::ResultOutcome;
use crate::task::{Task, TaskEnvelope, TaskId};

/// Mensaje de aplicación que viaja cifrado dentro de un frame del canal.
///
/// `node_id` y `task_id` van dentro del payload cifrado, así un frame no puede
/// atribuirse a otro nodo/tarea aunque haya varios canales en paralelo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub node_id: NodeId,
    pub task_id: Option<TaskId>,
    pub body: FrameBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameBody {
    Heartbeat(Heartbeat),
    Task(TaskEnvelope),
    Result {
        outcome: ResultOutcome,
        /// Salida del motor sellada con el cifrador compartido
        sealed: Vec<u8>,
    },
    Ack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Heartbeat,
    Task,
    Result,
    Ack,
}

impl Frame {
    pub fn heartbeat(node_id: impl Into<NodeId>, hb: Heartbeat) -> Self {
        Self {
            node_id: node_id.into(),
            task_id: None,
            body: FrameBody::Heartbeat(hb),
        }
    }

    pub fn task(node_id: impl Into<NodeId>, task: &Task) -> Self {
        Self {
            node_id: node_id.into(),
            task_id: Some(task.id.clone()),
            body: FrameBody::Task(TaskEnvelope::from(task)),
        }
    }

    pub fn result(
        node_id: impl Into<NodeId>,
        task_id: impl Into<TaskId>,
        outcome: ResultOutcome,
        sealed: Vec<u8>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            task_id: Some(task_id.into()),
            body: FrameBody::Result { outcome, sealed },
        }
    }

    pub fn ack(node_id: impl Into<NodeId>, task_id: impl Into<TaskId>) -> Self {
        Self {
            node_id: node_id.into(),
            task_id: Some(task_id.into()),
            body: FrameBody::Ack,
        }
    }

    /// ACK sin tarea: respuesta del coordinador a un heartbeat.
    pub fn heartbeat_ack(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            task_id: None,
            body: FrameBody::Ack,
        }
    }

    pub fn kind(&self) -> FrameKind {
        match self.body {
            FrameBody::Heartbeat(_) => FrameKind::Heartbeat,
            FrameBody::Task(_) => FrameKind::Task,
            FrameBody::Result { .. } => FrameKind::Result,
            FrameBody::Ack => FrameKind::Ack,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
