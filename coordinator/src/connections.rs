// coordinator/src/connections.rs

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use common::{Frame, NodeId, Task};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use crate::error::DeliveryError;
use crate::scheduler::TaskTransport;

/// Frames pendientes por conexión antes de considerar la cola llena.
pub const OUTBOUND_QUEUE_LEN: usize = 256;

#[derive(Debug)]
struct Connection {
    generation: u64,
    tx: mpsc::Sender<Frame>,
}

/// Cola de salida de cada nodo conectado. Es el transporte del scheduler:
/// entregar una tarea es un `try_send` que nunca bloquea.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    conns: Mutex<HashMap<NodeId, Connection>>,
    next_generation: AtomicU64,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn conns(&self) -> MutexGuard<'_, HashMap<NodeId, Connection>> {
        self.conns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Instala la cola de una conexión nueva. Si el nodo ya tenía otra, la
    /// reemplaza: al soltar su `Sender` el escritor viejo termina solo.
    pub fn register(&self, node_id: &str, tx: mpsc::Sender<Frame>) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        if self
            .conns()
            .insert(node_id.to_string(), Connection { generation, tx })
            .is_some()
        {
            debug!("nodo {} reconectado, se reemplaza la conexión anterior", node_id);
        }
        generation
    }

    /// Quita la conexión sólo si sigue siendo la misma generación; una
    /// reconexión ya instalada no se toca. Devuelve si se quitó.
    pub fn remove(&self, node_id: &str, generation: u64) -> bool {
        let mut conns = self.conns();
        match conns.get(node_id) {
            Some(c) if c.generation == generation => {
                conns.remove(node_id);
                true
            }
            _ => false,
        }
    }

    pub fn send(&self, node_id: &str, frame: Frame) -> Result<(), DeliveryError> {
        let conns = self.conns();
        let conn = conns
            .get(node_id)
            .ok_or_else(|| DeliveryError::NotConnected(node_id.to_string()))?;

        conn.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::QueueFull(node_id.to_string()),
            TrySendError::Closed(_) => DeliveryError::NotConnected(node_id.to_string()),
        })
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        self.conns().contains_key(node_id)
    }
}

impl TaskTransport for ConnectionTable {
    fn deliver(&self, node_id: &str, task: &Task) -> Result<(), DeliveryError> {
        self.send(node_id, Frame::task(node_id, task))
    }
}
