// coordinator/src/failover.rs

use std::time::Instant;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::state::AppState;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SweepReport {
    pub stale_nodes: usize,
    pub rescheduled: usize,
    pub retried: usize,
    pub failed: usize,
}

/// Loop principal de tolerancia a fallos:
/// - detecta nodos sin heartbeat y reasigna sus tareas
/// - reintenta las tareas PENDING cuyo backoff venció
pub async fn run_failover_loop(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(state.config.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = sweep_once(&state, Instant::now());
                if report != SweepReport::default() {
                    debug!("failover sweep: {:?}", report);
                }
            }
            _ = shutdown.changed() => {
                info!("failover loop detenido");
                break;
            }
        }
    }
}

/// Una pasada de chequeo:
/// 1. marca OFFLINE los nodos sin heartbeat y reasigna sus tareas
/// 2. reintenta pendientes
/// 3. avisa al agregador de las tareas que agotaron sus intentos
pub fn sweep_once(state: &AppState, now: Instant) -> SweepReport {
    let sweep = state
        .registry
        .mark_offline_if_stale(now, state.config.heartbeat_timeout);

    let rescheduled = if sweep.orphaned.is_empty() {
        0
    } else {
        info!(
            "{} nodos caídos, reencolando {} tareas",
            sweep.nodes.len(),
            sweep.orphaned.len()
        );
        state.scheduler.reschedule(&sweep.orphaned)
    };

    let retried = state.scheduler.retry_pending(now);
    let failed = state.forward_failures();

    SweepReport {
        stale_nodes: sweep.nodes.len(),
        rescheduled,
        retried,
        failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use common::{NodeStatus, Task, TaskStatus};
    use tokio::sync::mpsc;

    use crate::state::testing;

    #[test]
    fn nodo_vencido_pasa_offline_y_su_tarea_vuelve_a_la_cola() {
        let state = testing::state(&[
            ("FLEET_HEARTBEAT_TIMEOUT_SECS", "1"),
            ("FLEET_MAX_TASK_ATTEMPTS", "5"),
        ]);
        state.registry.register_or_update("n1", NodeStatus::Online, 0.0);
        let (tx, _rx) = mpsc::channel(8);
        state.connections.register("n1", tx);
        state
            .scheduler
            .schedule(Task::with_id("t1", vec![], 1.0))
            .unwrap();

        let report = sweep_once(&state, Instant::now() + Duration::from_secs(2));
        assert_eq!(report.stale_nodes, 1);
        assert_eq!(report.rescheduled, 0);
        assert_eq!(state.registry.status("n1"), Some(NodeStatus::Offline));

        // nodo perdido, sin candidatos al reasignar y sin candidatos al reintentar
        let task = state.scheduler.task("t1").unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempt, 3);
        assert_eq!(report.failed, 0);

        // una segunda pasada no la vuelve a contar
        let again = sweep_once(&state, Instant::now() + Duration::from_secs(2));
        assert_eq!(again.stale_nodes, 0);
    }

    #[test]
    fn tareas_que_agotan_intentos_llegan_al_agregador() {
        let state = testing::state(&[("FLEET_MAX_TASK_ATTEMPTS", "1")]);
        assert!(state
            .scheduler
            .schedule(Task::with_id("t1", vec![], 1.0))
            .is_err());

        let report = sweep_once(&state, Instant::now());
        assert_eq!(report.failed, 1);
        let result = state.aggregator.result("t1").unwrap();
        assert!(!result.outcome.is_success());
    }
}
