// coordinator/src/registry.rs

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use common::{Heartbeat, NodeId, NodeMetrics, NodeStatus, TaskId};
use tracing::{debug, info, warn};

use crate::error::SchedulingError;

#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub hostname: String,
    pub status: NodeStatus,
    /// Carga externa auto-reportada en el último heartbeat
    pub base_load: f64,
    pub last_heartbeat: Instant,
    /// Tareas asignadas y no completadas, en orden de asignación
    pub assigned: Vec<(TaskId, f64)>,

    // Métricas
    pub tasks_assigned: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub last_cpu_percent: Option<f32>,
    pub last_mem_bytes: Option<u64>,
}

impl NodeRecord {
    fn new(node_id: &str, status: NodeStatus, load: f64, now: Instant) -> Self {
        Self {
            node_id: node_id.to_string(),
            hostname: String::new(),
            status,
            base_load: load.max(0.0),
            last_heartbeat: now,
            assigned: Vec::new(),
            tasks_assigned: 0,
            tasks_completed: 0,
            tasks_failed: 0,
            last_cpu_percent: None,
            last_mem_bytes: None,
        }
    }

    /// `base_load + suma de pesos asignados`.
    pub fn load(&self) -> f64 {
        self.base_load + self.assigned.iter().map(|(_, w)| w).sum::<f64>()
    }

    fn take_assignments(&mut self) -> Vec<TaskId> {
        self.assigned.drain(..).map(|(id, _)| id).collect()
    }
}

/// Resultado de una pasada de staleness.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StaleSweep {
    pub nodes: BTreeSet<NodeId>,
    /// Tareas que tenían esos nodos, para que el scheduler las reasigne
    pub orphaned: Vec<TaskId>,
}

/// Dueño exclusivo de los `NodeRecord`. Cada operación toma el lock sólo
/// durante la mutación en memoria.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: Mutex<BTreeMap<NodeId, NodeRecord>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn nodes(&self) -> MutexGuard<'_, BTreeMap<NodeId, NodeRecord>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Alta o actualización; resetea el reloj de heartbeat. Nunca falla.
    pub fn register_or_update(&self, node_id: &str, status: NodeStatus, load: f64) {
        self.upsert_at(node_id, status, load, Instant::now());
    }

    fn upsert_at(&self, node_id: &str, status: NodeStatus, load: f64, now: Instant) {
        let mut nodes = self.nodes();
        match nodes.get_mut(node_id) {
            Some(rec) => {
                if rec.status != status {
                    info!("nodo {}: {:?} -> {:?}", node_id, rec.status, status);
                }
                rec.status = status;
                rec.base_load = load.max(0.0);
                rec.last_heartbeat = now;
            }
            None => {
                info!("nodo registrado: {} ({:?}, carga={})", node_id, status, load);
                nodes.insert(node_id.to_string(), NodeRecord::new(node_id, status, load, now));
            }
        }
    }

    /// Heartbeat completo: además de estado y carga guarda métricas del host.
    pub fn apply_heartbeat(&self, node_id: &str, hb: &Heartbeat) {
        self.register_or_update(node_id, hb.status, hb.load);
        let mut nodes = self.nodes();
        if let Some(rec) = nodes.get_mut(node_id) {
            rec.hostname = hb.hostname.clone();
            rec.last_cpu_percent = hb.cpu_percent;
            rec.last_mem_bytes = hb.mem_bytes;
        }
    }

    pub fn get_candidate_nodes(&self) -> BTreeSet<NodeId> {
        self.nodes()
            .values()
            .filter(|r| r.status == NodeStatus::Online)
            .map(|r| r.node_id.clone())
            .collect()
    }

    /// Nodo ONLINE con menor carga; empate por id más chico.
    pub fn least_loaded(&self) -> Option<NodeId> {
        self.nodes()
            .values()
            .filter(|r| r.status == NodeStatus::Online)
            .min_by(|a, b| {
                a.load()
                    .total_cmp(&b.load())
                    .then_with(|| a.node_id.cmp(&b.node_id))
            })
            .map(|r| r.node_id.clone())
    }

    /// Pasa a OFFLINE todo nodo sin heartbeat hace más de `timeout` y devuelve
    /// sus tareas. Cada tarea huérfana sale una sola vez: la asignación se limpia.
    pub fn mark_offline_if_stale(&self, now: Instant, timeout: Duration) -> StaleSweep {
        let mut sweep = StaleSweep::default();
        let mut nodes = self.nodes();

        for (node_id, rec) in nodes.iter_mut() {
            if rec.status == NodeStatus::Offline {
                continue;
            }
            let elapsed = now.saturating_duration_since(rec.last_heartbeat);
            if elapsed > timeout {
                warn!(
                    "marcando nodo {} como OFFLINE (sin heartbeat hace {:?})",
                    node_id, elapsed
                );
                rec.status = NodeStatus::Offline;
                sweep.nodes.insert(node_id.clone());
                sweep.orphaned.extend(rec.take_assignments());
            }
        }
        sweep
    }

    /// Lo mismo para un nodo puntual (su conexión se cayó).
    pub fn mark_offline(&self, node_id: &str) -> Vec<TaskId> {
        let mut nodes = self.nodes();
        match nodes.get_mut(node_id) {
            Some(rec) => {
                if rec.status != NodeStatus::Offline {
                    info!("nodo {} pasa a OFFLINE", node_id);
                }
                rec.status = NodeStatus::Offline;
                rec.take_assignments()
            }
            None => Vec::new(),
        }
    }

    pub fn record_assignment(
        &self,
        node_id: &str,
        task_id: &str,
        weight: f64,
    ) -> Result<(), SchedulingError> {
        let mut nodes = self.nodes();
        let rec = nodes
            .get_mut(node_id)
            .ok_or_else(|| SchedulingError::UnknownNode {
                node_id: node_id.to_string(),
            })?;

        if rec.assigned.iter().any(|(id, _)| id == task_id) {
            debug!("tarea {} ya estaba asignada a {}", task_id, node_id);
            return Ok(());
        }
        rec.assigned.push((task_id.to_string(), weight.max(0.0)));
        rec.tasks_assigned += 1;
        Ok(())
    }

    /// Libera la asignación y descuenta su peso. Devuelve `false` si la tarea
    /// ya no estaba asignada a ese nodo (completar dos veces no descuenta dos veces).
    pub fn record_completion(&self, node_id: &str, task_id: &str) -> Result<bool, SchedulingError> {
        let mut nodes = self.nodes();
        let rec = nodes
            .get_mut(node_id)
            .ok_or_else(|| SchedulingError::UnknownNode {
                node_id: node_id.to_string(),
            })?;

        match rec.assigned.iter().position(|(id, _)| id == task_id) {
            Some(idx) => {
                rec.assigned.remove(idx);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Contadores informativos; no tocan la carga.
    pub fn note_outcome(&self, node_id: &str, success: bool) {
        if let Some(rec) = self.nodes().get_mut(node_id) {
            if success {
                rec.tasks_completed += 1;
            } else {
                rec.tasks_failed += 1;
            }
        }
    }

    #[cfg(test)]
    pub fn status(&self, node_id: &str) -> Option<NodeStatus> {
        self.nodes().get(node_id).map(|r| r.status)
    }

    pub fn load(&self, node_id: &str) -> Option<f64> {
        self.nodes().get(node_id).map(NodeRecord::load)
    }

    pub fn is_assigned(&self, node_id: &str, task_id: &str) -> bool {
        self.nodes()
            .get(node_id)
            .is_some_and(|r| r.assigned.iter().any(|(id, _)| id == task_id))
    }

    #[cfg(test)]
    pub fn assigned_tasks(&self, node_id: &str) -> Vec<TaskId> {
        self.nodes()
            .get(node_id)
            .map(|r| r.assigned.iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> Vec<NodeMetrics> {
        let now = Instant::now();
        self.nodes()
            .values()
            .map(|r| NodeMetrics {
                node_id: r.node_id.clone(),
                hostname: r.hostname.clone(),
                status: r.status,
                load: r.load(),
                last_heartbeat_secs_ago: now.saturating_duration_since(r.last_heartbeat).as_secs(),
                assigned_tasks: r.assigned.iter().map(|(id, _)| id.clone()).collect(),
                tasks_assigned: r.tasks_assigned,
                tasks_completed: r.tasks_completed,
                tasks_failed: r.tasks_failed,
                last_cpu_percent: r.last_cpu_percent,
                last_mem_bytes: r.last_mem_bytes,
            })
            .collect()
    }
}
