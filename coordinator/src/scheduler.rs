// coordinator/src/scheduler.rs

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use common::{Backoff, BatchId, NodeId, ResultOutcome, Task, TaskId, TaskStatus};
use tracing::{debug, info, warn};

use crate::error::{DeliveryError, SchedulingError};
use crate::policy::SchedulingPolicy;
use crate::registry::NodeRegistry;

/// Entrega de una tarea a su nodo. No puede bloquear: se llama con la tabla
/// de tareas tomada.
pub trait TaskTransport: Send + Sync {
    fn deliver(&self, node_id: &str, task: &Task) -> Result<(), DeliveryError>;
}

/// Tarea que se dio por perdida; hay que avisarle al agregador.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub task_id: TaskId,
    pub batch_id: Option<BatchId>,
    pub node_id: Option<NodeId>,
    pub reason: String,
}

/// Qué hizo `complete` con un resultado.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Accepted,
    /// La tarea ya estaba cerrada
    Duplicate,
    /// Falla reportada por un nodo que ya no es dueño de la tarea
    Stale,
    Retrying,
    Failed,
    Unknown,
}

#[derive(Debug)]
struct TaskEntry {
    task: Task,
    owner: Option<NodeId>,
    deliveries: u32,
    next_retry_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct TaskTable {
    entries: HashMap<TaskId, TaskEntry>,
    failures: Vec<TaskFailure>,
}

pub struct Scheduler {
    registry: Arc<NodeRegistry>,
    policy: Box<dyn SchedulingPolicy>,
    transport: Arc<dyn TaskTransport>,
    max_attempts: u32,
    backoff: Backoff,
    table: Mutex<TaskTable>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<NodeRegistry>,
        policy: Box<dyn SchedulingPolicy>,
        transport: Arc<dyn TaskTransport>,
        max_attempts: u32,
        backoff: Backoff,
    ) -> Self {
        Self {
            registry,
            policy,
            transport,
            max_attempts: max_attempts.max(1),
            backoff,
            table: Mutex::new(TaskTable::default()),
        }
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    // Orden de locks: tabla de tareas y después registry.
    fn table(&self) -> MutexGuard<'_, TaskTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Asigna la tarea a un nodo y se la entrega.
    ///
    /// Una tarea ya asignada devuelve su dueño actual; una ya terminada
    /// devuelve `TaskClosed`. Con `NoAvailableNode` o `DeliveryFailed` la
    /// tarea queda PENDING en la cola de reintentos.
    pub fn schedule(&self, task: Task) -> Result<NodeId, SchedulingError> {
        let now = Instant::now();
        let mut table = self.table();
        let TaskTable { entries, failures } = &mut *table;

        let entry = entries.entry(task.id.clone()).or_insert_with(|| TaskEntry {
            task,
            owner: None,
            deliveries: 0,
            next_retry_at: None,
        });

        match entry.task.status {
            TaskStatus::Assigned => {
                if let Some(owner) = &entry.owner {
                    return Ok(owner.clone());
                }
            }
            status if status.is_terminal() => {
                return Err(SchedulingError::TaskClosed {
                    task_id: entry.task.id.clone(),
                    status,
                });
            }
            _ => {}
        }

        self.try_assign(entry, failures, now)
    }

    fn try_assign(
        &self,
        entry: &mut TaskEntry,
        failures: &mut Vec<TaskFailure>,
        now: Instant,
    ) -> Result<NodeId, SchedulingError> {
        let task_id = entry.task.id.clone();

        let Some(node_id) = self.policy.select(&self.registry) else {
            self.attempt_failed(entry, failures, now, None, "sin nodos ONLINE".to_string());
            return Err(SchedulingError::NoAvailableNode { task_id });
        };

        if let Err(e) = self
            .registry
            .record_assignment(&node_id, &task_id, entry.task.weight)
        {
            self.attempt_failed(entry, failures, now, None, e.to_string());
            return Err(e);
        }

        // el intento de entrega queda registrado antes de pasar a ASSIGNED
        entry.deliveries += 1;
        entry.task.status = TaskStatus::Assigned;
        entry.owner = Some(node_id.clone());
        entry.next_retry_at = None;

        match self.transport.deliver(&node_id, &entry.task) {
            Ok(()) => {
                info!(
                    "tarea {} asignada a {} (attempt={}, política {})",
                    task_id,
                    node_id,
                    entry.task.attempt,
                    self.policy.name()
                );
                Ok(node_id)
            }
            Err(e) => {
                warn!("entrega de {} a {} falló: {}", task_id, node_id, e);
                if let Err(err) = self.registry.record_completion(&node_id, &task_id) {
                    warn!("no se pudo deshacer la asignación de {}: {}", task_id, err);
                }
                entry.owner = None;
                entry.task.status = TaskStatus::Pending;
                let reason = e.to_string();
                self.attempt_failed(entry, failures, now, Some(node_id.clone()), reason.clone());
                Err(SchedulingError::DeliveryFailed {
                    task_id,
                    node_id,
                    reason,
                })
            }
        }
    }

    /// Cuenta un intento fallido: la tarea vuelve a la cola con backoff o,
    /// si agotó los intentos, pasa a FAILED.
    fn attempt_failed(
        &self,
        entry: &mut TaskEntry,
        failures: &mut Vec<TaskFailure>,
        now: Instant,
        node_id: Option<NodeId>,
        reason: String,
    ) {
        entry.owner = None;
        entry.task.attempt += 1;

        if entry.task.attempt >= self.max_attempts {
            warn!(
                "tarea {} superó el máximo de intentos ({}), marcando FAILED: {}",
                entry.task.id, self.max_attempts, reason
            );
            entry.task.status = TaskStatus::Failed;
            entry.next_retry_at = None;
            failures.push(TaskFailure {
                task_id: entry.task.id.clone(),
                batch_id: entry.task.batch_id.clone(),
                node_id,
                reason: format!(
                    "agotó {} intentos; último error: {}",
                    self.max_attempts, reason
                ),
            });
        } else {
            let delay = self.backoff.delay(entry.task.attempt - 1);
            debug!(
                "tarea {} vuelve a PENDING (attempt={}), reintento en {:?}",
                entry.task.id, entry.task.attempt, delay
            );
            entry.task.status = TaskStatus::Pending;
            entry.next_retry_at = Some(now + delay);
        }
    }

    /// Reintenta las tareas PENDING cuyo backoff ya venció. Devuelve cuántas
    /// quedaron asignadas.
    pub fn retry_pending(&self, now: Instant) -> usize {
        let mut table = self.table();
        let TaskTable { entries, failures } = &mut *table;

        let mut due: Vec<TaskId> = entries
            .values()
            .filter(|e| e.task.status == TaskStatus::Pending)
            .filter(|e| e.next_retry_at.is_some_and(|at| at <= now))
            .map(|e| e.task.id.clone())
            .collect();
        due.sort();

        let mut assigned = 0;
        for id in due {
            if let Some(entry) = entries.get_mut(&id) {
                if self.try_assign(entry, failures, now).is_ok() {
                    assigned += 1;
                }
            }
        }
        assigned
    }

    /// Tareas huérfanas de un nodo caído: cuenta el intento perdido y las
    /// vuelve a planificar con el mismo id.
    pub fn reschedule(&self, orphans: &[TaskId]) -> usize {
        let now = Instant::now();
        let mut table = self.table();
        let TaskTable { entries, failures } = &mut *table;

        let mut assigned = 0;
        for id in orphans {
            let Some(entry) = entries.get_mut(id) else {
                debug!("tarea huérfana {} desconocida, se ignora", id);
                continue;
            };
            if entry.task.status != TaskStatus::Assigned {
                continue;
            }
            // el dueño actual todavía la tiene: ya se reasignó antes
            if let Some(owner) = &entry.owner {
                if self.registry.is_assigned(owner, id) {
                    continue;
                }
            }

            let lost_on = entry.owner.clone();
            info!(
                "reencolando tarea {} por caída del nodo {:?} (attempt={})",
                id,
                lost_on,
                entry.task.attempt + 1
            );
            self.attempt_failed(
                entry,
                failures,
                now,
                lost_on.clone(),
                format!("nodo {} caído", lost_on.unwrap_or_default()),
            );

            if entry.task.status == TaskStatus::Pending
                && self.try_assign(entry, failures, now).is_ok()
            {
                assigned += 1;
            }
        }
        assigned
    }

    /// Resultado de una tarea reportado por `node_id`.
    pub fn complete(&self, node_id: &str, task_id: &str, outcome: &ResultOutcome) -> Completion {
        let now = Instant::now();
        let mut table = self.table();
        let TaskTable { entries, failures } = &mut *table;

        let Some(entry) = entries.get_mut(task_id) else {
            return Completion::Unknown;
        };

        if entry.task.status.is_terminal() {
            // un reenvío tardío puede dejar una asignación colgada
            if let Err(e) = self.registry.record_completion(node_id, task_id) {
                debug!("completion duplicada de {}: {}", task_id, e);
            }
            return Completion::Duplicate;
        }

        let is_owner = entry.owner.as_deref() == Some(node_id);

        match outcome {
            ResultOutcome::Succeeded => {
                if let Some(owner) = entry.owner.take() {
                    if let Err(e) = self.registry.record_completion(&owner, task_id) {
                        warn!("no se pudo liberar {} en {}: {}", task_id, owner, e);
                    }
                }
                self.registry.note_outcome(node_id, true);
                entry.task.status = TaskStatus::Completed;
                entry.next_retry_at = None;
                info!("tarea {} completada por {}", task_id, node_id);
                Completion::Accepted
            }
            ResultOutcome::Failed { reason } => {
                if !is_owner {
                    debug!(
                        "falla de {} reportada por {} que ya no es dueño, se ignora",
                        task_id, node_id
                    );
                    return Completion::Stale;
                }
                if let Err(e) = self.registry.record_completion(node_id, task_id) {
                    warn!("no se pudo liberar {} en {}: {}", task_id, node_id, e);
                }
                self.registry.note_outcome(node_id, false);
                warn!("tarea {} falló en {}: {}", task_id, node_id, reason);

                self.attempt_failed(
                    entry,
                    failures,
                    now,
                    Some(node_id.to_string()),
                    reason.clone(),
                );
                if entry.task.status == TaskStatus::Failed {
                    return Completion::Failed;
                }
                // reintento inmediato; si no hay nodo queda en backoff
                let _ = self.try_assign(entry, failures, now);
                if entry.task.status == TaskStatus::Failed {
                    Completion::Failed
                } else {
                    Completion::Retrying
                }
            }
        }
    }

    /// Vuelve a entregar al nodo todo lo que tiene asignado. Se usa cuando
    /// reconecta: lo que quedó en la cola de la conexión vieja se perdió.
    pub fn redeliver(&self, node_id: &str) -> usize {
        let mut table = self.table();
        let mut sent = 0;

        for entry in table.entries.values_mut() {
            if entry.task.status != TaskStatus::Assigned || entry.owner.as_deref() != Some(node_id) {
                continue;
            }
            entry.deliveries += 1;
            match self.transport.deliver(node_id, &entry.task) {
                Ok(()) => sent += 1,
                Err(e) => warn!("reenvío de {} a {} falló: {}", entry.task.id, node_id, e),
            }
        }
        sent
    }

    /// Las tareas no terminadas pasan a EXPIRED y liberan su asignación.
    pub fn expire(&self, task_ids: &[TaskId]) -> usize {
        let mut table = self.table();
        let mut expired = 0;

        for id in task_ids {
            let Some(entry) = table.entries.get_mut(id) else {
                continue;
            };
            if entry.task.status.is_terminal() {
                continue;
            }
            if let Some(owner) = entry.owner.take() {
                if let Err(e) = self.registry.record_completion(&owner, id) {
                    debug!("expirando {}: {}", id, e);
                }
            }
            entry.task.status = TaskStatus::Expired;
            entry.next_retry_at = None;
            expired += 1;
        }
        if expired > 0 {
            info!("{} tareas vencidas", expired);
        }
        expired
    }

    /// Fallas terminales acumuladas desde la última llamada.
    pub fn take_failures(&self) -> Vec<TaskFailure> {
        std::mem::take(&mut self.table().failures)
    }

    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.table().entries.get(task_id).map(|e| e.task.clone())
    }

    pub fn owner(&self, task_id: &str) -> Option<NodeId> {
        self.table().entries.get(task_id).and_then(|e| e.owner.clone())
    }

    /// Olvida las tareas terminadas de la lista; las activas se conservan.
    /// Devuelve cuántas se borraron.
    pub fn forget(&self, task_ids: &[TaskId]) -> usize {
        let mut table = self.table();
        let before = table.entries.len();
        for id in task_ids {
            if table
                .entries
                .get(id)
                .is_some_and(|e| e.task.status.is_terminal())
            {
                table.entries.remove(id);
            }
        }
        before - table.entries.len()
    }

    #[cfg(test)]
    pub fn delivery_attempts(&self, task_id: &str) -> Option<u32> {
        self.table().entries.get(task_id).map(|e| e.deliveries)
    }
}
