// coordinator/src/batches.rs

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;

use chrono::Utc;
use common::{
    is_valid_task_id, BatchInfo, BatchRequest, BatchStatus, FinalOutput, Task, TaskId,
    TaskResult, TaskStatus, DEFAULT_TASK_WEIGHT,
};
use tracing::{debug, error, info, warn};

use crate::error::BatchError;
use crate::state::AppState;

/// Valida el pedido, registra el batch como ACCEPTED y lanza su driver.
pub fn submit_batch(state: &AppState, req: BatchRequest) -> Result<BatchInfo, BatchError> {
    let timeout = req
        .timeout_secs
        .filter(|s| *s > 0)
        .map(Duration::from_secs)
        .unwrap_or(state.config.batch_timeout);

    let (info, tasks) = accept_batch(state, req)?;
    info!(
        "batch {} ({}) aceptado con {} tareas, timeout {:?}",
        info.id, info.name, info.total_tasks, timeout
    );

    tokio::spawn(run_batch(state.clone(), info.id.clone(), tasks, timeout));
    Ok(info)
}

fn accept_batch(state: &AppState, req: BatchRequest) -> Result<(BatchInfo, Vec<Task>), BatchError> {
    let batch_id = uuid::Uuid::new_v4().to_string();

    let mut tasks = Vec::with_capacity(req.tasks.len());
    let mut seen = HashSet::new();
    for spec in req.tasks {
        let id = spec.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if !is_valid_task_id(&id) {
            return Err(BatchError::InvalidTaskId(id));
        }
        if !seen.insert(id.clone()) || state.scheduler.task(&id).is_some() {
            return Err(BatchError::DuplicateTaskId(id));
        }

        let weight = spec.weight.unwrap_or(DEFAULT_TASK_WEIGHT);
        if !weight.is_finite() || weight < 0.0 {
            return Err(BatchError::InvalidWeight { task_id: id, weight });
        }

        let payload = serde_json::to_vec(&spec.payload)?;
        tasks.push(Task::with_id(id, payload, weight).in_batch(batch_id.clone()));
    }

    let info = BatchInfo {
        id: batch_id.clone(),
        name: req.name,
        status: BatchStatus::Accepted,
        task_ids: tasks.iter().map(|t| t.id.clone()).collect(),
        submitted_at: Utc::now(),
        finished_at: None,
        total_tasks: tasks.len() as u32,
        completed_tasks: 0,
        failed_tasks: 0,
        missing_tasks: 0,
    };

    // chequeo e inserción bajo el mismo lock: dos batches no comparten ids
    let mut batches = state.batches();
    for other in batches.values() {
        if let Some(id) = other.task_ids.iter().find(|id| seen.contains(*id)) {
            return Err(BatchError::DuplicateTaskId(id.clone()));
        }
    }
    batches.insert(batch_id, info.clone());
    Ok((info, tasks))
}

fn set_status(state: &AppState, batch_id: &str, status: BatchStatus) {
    if let Some(b) = state.batches().get_mut(batch_id) {
        b.status = status;
    }
}

/// Vida de un batch: planifica, espera los resultados, combina y persiste.
pub async fn run_batch(state: AppState, batch_id: String, tasks: Vec<Task>, timeout: Duration) {
    set_status(&state, &batch_id, BatchStatus::Running);

    let ids: Vec<TaskId> = tasks.iter().map(|t| t.id.clone()).collect();
    let expected: BTreeSet<TaskId> = ids.iter().cloned().collect();

    for task in tasks {
        let task_id = task.id.clone();
        match state.scheduler.schedule(task) {
            Ok(node_id) => debug!("batch {}: tarea {} -> {}", batch_id, task_id, node_id),
            Err(e) if e.is_requeued() => info!("batch {}: {} (queda en cola)", batch_id, e),
            Err(e) => warn!("batch {}: {}", batch_id, e),
        }
    }
    state.forward_failures();

    let results = match state.aggregator.await_batch(&expected, timeout).await {
        Ok(results) => results,
        Err(timeout_err) => {
            let missing: Vec<TaskId> = timeout_err.missing.iter().cloned().collect();
            collect_after_expiry(&state, &missing, timeout_err.partial)
        }
    };

    let output = state
        .aggregator
        .compute_final_output(&batch_id, &expected, &results);
    if let Err(e) = state.aggregator.persist(&output) {
        error!("no se pudo persistir la salida del batch {}: {}", batch_id, e);
    }
    state.aggregator.close_batch(&ids);

    finish(&state, &output);
    state.retire_batch(&batch_id);
}

/// Vence lo que falta y junta lo que llegó entre el timeout y el vencimiento.
/// El scheduler decide: una tarea EXPIRED queda faltante aunque el agregador
/// tenga su resultado; una terminada antes del vencimiento ya lo tiene
/// guardado, porque el resultado se entrega al agregador antes de completarla.
fn collect_after_expiry(
    state: &AppState,
    missing: &[TaskId],
    mut results: BTreeMap<TaskId, TaskResult>,
) -> BTreeMap<TaskId, TaskResult> {
    state.scheduler.expire(missing);
    state.forward_failures();

    for id in missing {
        let expired = state
            .scheduler
            .task(id)
            .map_or(true, |t| t.status == TaskStatus::Expired);
        if expired {
            continue;
        }
        if let Some(result) = state.aggregator.result(id) {
            debug!("resultado de {} llegó después del timeout, se incluye", id);
            results.insert(id.clone(), result);
        }
    }
    results
}

fn finish(state: &AppState, output: &FinalOutput) {
    let status = if output.missing.is_empty() && output.failed.is_empty() {
        BatchStatus::Succeeded
    } else if output.succeeded.is_empty() {
        BatchStatus::Failed
    } else {
        BatchStatus::Partial
    };

    let mut batches = state.batches();
    if let Some(b) = batches.get_mut(&output.batch_id) {
        b.status = status;
        b.finished_at = Some(Utc::now());
        b.completed_tasks = output.succeeded.len() as u32;
        b.failed_tasks = output.failed.len() as u32;
        b.missing_tasks = output.missing.len() as u32;
    }
    info!(
        "batch {} terminado: {:?} ({} ok, {} fallidas, {} faltantes)",
        output.batch_id,
        status,
        output.succeeded.len(),
        output.failed.len(),
        output.missing.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{NodeStatus, TaskSpec};
    use serde_json::json;

    use crate::state::testing;

    fn request(ids: &[Option<&str>]) -> BatchRequest {
        BatchRequest {
            name: "prueba".into(),
            tasks: ids
                .iter()
                .map(|id| TaskSpec {
                    id: id.map(str::to_string),
                    payload: json!([255, 0]),
                    weight: None,
                })
                .collect(),
            timeout_secs: Some(1),
        }
    }

    #[test]
    fn ids_generados_y_propuestos() {
        let state = testing::state(&[]);
        let (info, tasks) = accept_batch(&state, request(&[Some("t1"), None])).unwrap();
        assert_eq!(info.status, BatchStatus::Accepted);
        assert_eq!(info.total_tasks, 2);
        assert_eq!(tasks[0].id, "t1");
        assert!(uuid::Uuid::parse_str(&tasks[1].id).is_ok());
        assert_eq!(tasks[0].batch_id.as_deref(), Some(info.id.as_str()));
        assert_eq!(tasks[0].payload, b"[255,0]".to_vec());
    }

    #[test]
    fn rechaza_ids_invalidos_repetidos_y_pesos_negativos() {
        let state = testing::state(&[]);
        assert!(matches!(
            accept_batch(&state, request(&[Some("../x")])),
            Err(BatchError::InvalidTaskId(_))
        ));
        assert!(matches!(
            accept_batch(&state, request(&[Some("t1"), Some("t1")])),
            Err(BatchError::DuplicateTaskId(_))
        ));

        let mut req = request(&[Some("t2")]);
        req.tasks[0].weight = Some(-1.0);
        assert!(matches!(
            accept_batch(&state, req),
            Err(BatchError::InvalidWeight { .. })
        ));

        accept_batch(&state, request(&[Some("t3")])).unwrap();
        assert!(matches!(
            accept_batch(&state, request(&[Some("t3")])),
            Err(BatchError::DuplicateTaskId(_))
        ));
    }

    #[tokio::test]
    async fn batch_vencido_persiste_salida_incompleta() {
        let state = testing::state(&[]);
        let (info, tasks) = accept_batch(&state, request(&[Some("t1")])).unwrap();

        // sin nodos: la tarea nunca se asigna
        run_batch(state.clone(), info.id.clone(), tasks, Duration::from_millis(200)).await;

        let batch = state.batches().get(&info.id).cloned().unwrap();
        assert_eq!(batch.status, BatchStatus::Failed);
        assert_eq!(batch.missing_tasks, 1);
        assert!(batch.finished_at.is_some());

        let out = state.aggregator.load_output(&info.id).unwrap().unwrap();
        assert!(!out.complete);
        assert_eq!(out.missing, vec!["t1"]);
        assert_eq!(
            state.scheduler.task("t1").unwrap().status,
            common::TaskStatus::Expired
        );
    }

    #[tokio::test]
    async fn batch_con_resultados_termina_succeeded() {
        let state = testing::state(&[]);
        state.registry.register_or_update("n1", NodeStatus::Online, 0.0);
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        state.connections.register("n1", tx);

        let (info, tasks) = accept_batch(&state, request(&[Some("t1"), Some("t2")])).unwrap();
        let driver = tokio::spawn(run_batch(state.clone(), info.id.clone(), tasks, Duration::from_secs(5)));

        // nodo simulado: contesta cada TASK directo al scheduler y al agregador
        for _ in 0..2 {
            let frame = rx.recv().await.unwrap();
            let task_id = frame.task_id.unwrap();
            let sealed = state.cipher.seal(b"[1.0, 0.0]").unwrap();
            state.aggregator.submit(&task_id, Some("n1"), &sealed).unwrap();
            state
                .scheduler
                .complete("n1", &task_id, &common::ResultOutcome::Succeeded);
        }
        driver.await.unwrap();

        let batch = state.batches().get(&info.id).cloned().unwrap();
        assert_eq!(batch.status, BatchStatus::Succeeded);
        assert_eq!(batch.completed_tasks, 2);

        let out = state.aggregator.load_output(&info.id).unwrap().unwrap();
        assert!(out.complete);
        assert_eq!(out.value, json!({"t1": [1.0, 0.0], "t2": [1.0, 0.0]}));
        assert_eq!(state.registry.load("n1"), Some(0.0));
    }

    #[tokio::test]
    async fn resultado_entre_timeout_y_vencimiento_cuenta() {
        let state = testing::state(&[]);
        state.registry.register_or_update("n1", NodeStatus::Online, 0.0);
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        state.connections.register("n1", tx);

        let (_, tasks) = accept_batch(&state, request(&[Some("t1"), Some("t2")])).unwrap();
        for task in tasks {
            state.scheduler.schedule(task).unwrap();
        }

        // t1 llega justo después del timeout, antes del vencimiento
        let sealed = state.cipher.seal(b"[1.0]").unwrap();
        state.aggregator.submit("t1", Some("n1"), &sealed).unwrap();
        state
            .scheduler
            .complete("n1", "t1", &common::ResultOutcome::Succeeded);

        let missing = vec!["t1".to_string(), "t2".to_string()];
        let results = collect_after_expiry(&state, &missing, BTreeMap::new());
        assert!(results.contains_key("t1"));
        assert!(!results.contains_key("t2"));
        assert_eq!(state.scheduler.task("t1").unwrap().status, TaskStatus::Completed);
        assert_eq!(state.scheduler.task("t2").unwrap().status, TaskStatus::Expired);

        // t2 llega ya vencida: el agregador la guarda pero no cuenta
        state.aggregator.submit("t2", Some("n1"), &sealed).unwrap();
        state
            .scheduler
            .complete("n1", "t2", &common::ResultOutcome::Succeeded);
        let again = collect_after_expiry(&state, &["t2".to_string()], BTreeMap::new());
        assert!(again.is_empty());
        assert_eq!(state.scheduler.task("t2").unwrap().status, TaskStatus::Expired);
        assert_eq!(state.registry.load("n1"), Some(0.0));
    }

    #[tokio::test]
    async fn batches_viejos_se_olvidan_y_liberan_sus_ids() {
        let state = testing::state(&[("FLEET_FINISHED_BATCH_RETENTION", "1")]);

        let (first, tasks) = accept_batch(&state, request(&[Some("t1")])).unwrap();
        run_batch(state.clone(), first.id.clone(), tasks, Duration::from_millis(50)).await;
        assert!(state.batches().contains_key(&first.id));
        assert!(state.scheduler.task("t1").is_some());

        let (second, tasks) = accept_batch(&state, request(&[Some("t2")])).unwrap();
        run_batch(state.clone(), second.id.clone(), tasks, Duration::from_millis(50)).await;

        assert!(!state.batches().contains_key(&first.id));
        assert!(state.batches().contains_key(&second.id));
        assert!(state.scheduler.task("t1").is_none());
        assert!(state.scheduler.task("t2").is_some());
        // la salida persistida sobrevive al olvido
        assert!(state.aggregator.load_output(&first.id).unwrap().is_some());

        // el id vuelve a estar libre
        accept_batch(&state, request(&[Some("t1")])).unwrap();
    }
}
