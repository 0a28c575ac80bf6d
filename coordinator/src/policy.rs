// coordinator/src/policy.rs

use std::sync::atomic::{AtomicUsize, Ordering};

use common::{ConfigError, NodeId};
use rand::seq::IndexedRandom;

use crate::registry::NodeRegistry;

/// Estrategia de selección de nodo. Sólo elige; la asignación la registra
/// el scheduler.
pub trait SchedulingPolicy: Send + Sync {
    fn name(&self) -> &'static str;
    fn select(&self, registry: &NodeRegistry) -> Option<NodeId>;
}

/// Política dinámica: el nodo ONLINE menos cargado.
#[derive(Debug, Default)]
pub struct LeastLoaded;

impl SchedulingPolicy for LeastLoaded {
    fn name(&self) -> &'static str {
        "dynamic"
    }

    fn select(&self, registry: &NodeRegistry) -> Option<NodeId> {
        registry.least_loaded()
    }
}

/// Política estática: cualquier nodo ONLINE, sin mirar la carga.
#[derive(Debug, Default)]
pub struct RandomChoice;

impl SchedulingPolicy for RandomChoice {
    fn name(&self) -> &'static str {
        "static"
    }

    fn select(&self, registry: &NodeRegistry) -> Option<NodeId> {
        let candidates: Vec<NodeId> = registry.get_candidate_nodes().into_iter().collect();
        candidates.choose(&mut rand::rng()).cloned()
    }
}

/// Round-robin sobre los candidatos ordenados por id.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl SchedulingPolicy for RoundRobin {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn select(&self, registry: &NodeRegistry) -> Option<NodeId> {
        let candidates: Vec<NodeId> = registry.get_candidate_nodes().into_iter().collect();
        if candidates.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates[idx].clone())
    }
}

pub fn policy_from_name(name: &str) -> Result<Box<dyn SchedulingPolicy>, ConfigError> {
    match name.trim().to_ascii_lowercase().as_str() {
        "dynamic" | "least-loaded" => Ok(Box::new(LeastLoaded)),
        "static" | "random" => Ok(Box::new(RandomChoice)),
        "round-robin" | "rr" => Ok(Box::new(RoundRobin::default())),
        _ => Err(ConfigError::Invalid {
            var: "FLEET_SCHEDULING_POLICY",
            value: name.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::NodeStatus;

    fn registry() -> NodeRegistry {
        let reg = NodeRegistry::new();
        reg.register_or_update("b", NodeStatus::Online, 1.0);
        reg.register_or_update("a", NodeStatus::Online, 3.0);
        reg.register_or_update("c", NodeStatus::Degraded, 0.0);
        reg
    }

    #[test]
    fn dinamica_elige_el_menos_cargado() {
        assert_eq!(LeastLoaded.select(&registry()).as_deref(), Some("b"));
    }

    #[test]
    fn estatica_nunca_elige_nodos_no_online() {
        let reg = registry();
        for _ in 0..50 {
            let got = RandomChoice.select(&reg).unwrap();
            assert!(got == "a" || got == "b");
        }
        assert!(RandomChoice.select(&NodeRegistry::new()).is_none());
    }

    #[test]
    fn round_robin_rota_en_orden_de_id() {
        let reg = registry();
        let rr = RoundRobin::default();
        let picks: Vec<_> = (0..4).map(|_| rr.select(&reg).unwrap()).collect();
        assert_eq!(picks, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn nombres_de_politica() {
        assert_eq!(policy_from_name("dynamic").unwrap().name(), "dynamic");
        assert_eq!(policy_from_name("Random").unwrap().name(), "static");
        assert_eq!(policy_from_name("round-robin").unwrap().name(), "round-robin");
        assert!(policy_from_name("fifo").is_err());
    }
}
