use serde::{Deserialize, Serialize};

pub type NodeId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Online,
    Degraded,
    Offline,
}

/// Cuerpo de un heartbeat que manda el nodo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub status: NodeStatus,
    /// Carga externa que el nodo se auto-reporta (no incluye las tareas asignadas)
    pub load: f64,
    pub hostname: String,
    pub cpu_percent: Option<f32>,
    pub mem_bytes: Option<u64>,
}

/// Vista de un nodo para `GET /api/v1/nodes`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NodeMetrics {
    pub node_id: NodeId,
    pub hostname: String,
    pub status: NodeStatus,
    pub load: f64,
    pub last_heartbeat_secs_ago: u64,
    pub assigned_tasks: Vec<String>,
    pub tasks_assigned: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub last_cpu_percent: Option<f32>,
    pub last_mem_bytes: Option<u64>,
}
