use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use common::{
    is_valid_task_id, ChannelError, ChannelWriter, Frame, FrameBody, FrameCipher, NodeConfig,
    NodeId, ResultOutcome, SecureChannel, Storage, TaskEnvelope, TaskId,
};
use tokio::io::WriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{interval, sleep, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::AgentError;
use crate::inference::InferenceEngine;
use crate::metrics::{heartbeat_from, HostSampler};
use crate::outbox::{Outbox, PendingResult};

const RESULT_QUEUE_LEN: usize = 64;

/// Lo que necesita cada ejecución, compartido entre tareas.
struct TaskContext {
    cipher: Arc<FrameCipher>,
    outbox: Outbox,
    engine: Arc<dyn InferenceEngine>,
    slots: Arc<Semaphore>,
    running: Mutex<HashSet<TaskId>>,
    results_tx: mpsc::Sender<PendingResult>,
}

impl TaskContext {
    /// Marca la tarea como en ejecución; `false` si ya lo estaba.
    fn start(&self, task_id: &str) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_id.to_string())
    }

    fn finish(&self, task_id: &str) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_id);
    }
}

/// Agente del nodo: `DISCONNECTED -> CONNECTED -> (recibir, ejecutar, enviar)`.
pub struct NodeAgent {
    config: NodeConfig,
    node_id: NodeId,
    hostname: String,
    sampler: Box<dyn HostSampler>,
    ctx: Arc<TaskContext>,
    results_rx: mpsc::Receiver<PendingResult>,
}

impl NodeAgent {
    pub fn new(
        config: NodeConfig,
        node_id: NodeId,
        hostname: String,
        storage: Arc<dyn Storage>,
        engine: Arc<dyn InferenceEngine>,
        sampler: Box<dyn HostSampler>,
    ) -> Self {
        let cipher = Arc::new(FrameCipher::from_key_material(
            config.encryption_key.expose().as_bytes(),
        ));
        let (results_tx, results_rx) = mpsc::channel(RESULT_QUEUE_LEN);
        let ctx = Arc::new(TaskContext {
            cipher,
            outbox: Outbox::new(storage),
            engine,
            slots: Arc::new(Semaphore::new(config.concurrency as usize)),
            running: Mutex::new(HashSet::new()),
            results_tx,
        });

        Self {
            config,
            node_id,
            hostname,
            sampler,
            ctx,
            results_rx,
        }
    }

    /// Loop principal. Sólo vuelve si el storage local falla al arrancar.
    pub async fn run(mut self) -> Result<(), AgentError> {
        self.recover()?;

        let mut failures: u32 = 0;
        loop {
            let opened = SecureChannel::open(
                &self.config.coordinator_addr,
                &self.node_id,
                self.config.auth_token.expose(),
                self.ctx.cipher.clone(),
            )
            .await;

            match opened {
                Ok(chan) => {
                    info!(
                        "nodo {} conectado a {}",
                        self.node_id, self.config.coordinator_addr
                    );
                    failures = 0;
                    match self.session(chan).await {
                        Ok(()) => info!("sesión terminada"),
                        Err(e) => warn!("sesión con el coordinador terminó: {}", e),
                    }
                }
                Err(ChannelError::Authentication(reason)) => {
                    warn!("el coordinador rechazó al nodo {}: {}", self.node_id, reason);
                }
                Err(e) => warn!("no se pudo conectar a {}: {}", self.config.coordinator_addr, e),
            }

            let delay = self.config.reconnect_backoff.delay(failures);
            failures = failures.saturating_add(1);
            debug!("reintentando conexión en {:?}", delay);
            sleep(delay).await;
        }
    }

    /// Tareas cacheadas sin resultado (el proceso murió a mitad): se ejecutan de nuevo.
    fn recover(&self) -> Result<(), AgentError> {
        for (task_id, envelope) in self.ctx.outbox.cached_tasks()? {
            if self.ctx.outbox.result(&task_id)?.is_some() {
                continue;
            }
            info!("retomando tarea cacheada {}", task_id);
            self.ctx.start(&task_id);
            spawn_execution(self.ctx.clone(), task_id, envelope);
        }
        Ok(())
    }

    async fn session(&mut self, chan: SecureChannel<TcpStream>) -> Result<(), AgentError> {
        let (_, mut reader, mut writer) = chan.into_split();

        // la cola en memoria no se vacía: si el outbox no pudo guardar un
        // resultado, ésta es su única copia. Los duplicados se ignoran en el
        // coordinador.
        let pending = self.ctx.outbox.pending_results()?;
        if !pending.is_empty() {
            info!("reenviando {} resultados sin confirmar", pending.len());
        }
        for result in &pending {
            writer.send_frame(&result.to_frame(&self.node_id)).await?;
        }

        // un solo lector dedicado: cancelar una lectura a mitad de frame
        // desalinearía el stream
        let (frames_tx, mut frames_rx) = mpsc::channel::<Result<Frame, ChannelError>>(16);
        let reader_task = tokio::spawn(async move {
            loop {
                match reader.receive_frame().await {
                    Ok(frame) => {
                        if frames_tx.send(Ok(frame)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) if e.is_recoverable() => warn!("frame descartado: {}", e),
                    Err(e) => {
                        let _ = frames_tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });

        let result = self.serve(&mut writer, &mut frames_rx).await;
        reader_task.abort();
        writer.close().await;
        result
    }

    async fn serve(
        &mut self,
        writer: &mut ChannelWriter<WriteHalf<TcpStream>>,
        frames_rx: &mut mpsc::Receiver<Result<Frame, ChannelError>>,
    ) -> Result<(), AgentError> {
        let receive_timeout = self.config.receive_timeout;
        let mut heartbeat = interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut deadline = Instant::now() + receive_timeout;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let sample = self.sampler.sample();
                    let hb = heartbeat_from(sample, &self.hostname, self.config.max_utilization_percent);
                    writer.send_frame(&Frame::heartbeat(self.node_id.clone(), hb)).await?;
                }
                Some(result) = self.results_rx.recv() => {
                    debug!("enviando resultado de {} ({:?})", result.task_id, result.outcome);
                    writer.send_frame(&result.to_frame(&self.node_id)).await?;
                }
                received = frames_rx.recv() => match received {
                    Some(Ok(frame)) => {
                        deadline = Instant::now() + receive_timeout;
                        handle_frame(&self.ctx, &self.node_id, frame, writer).await?;
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                },
                _ = sleep_until(deadline) => {
                    return Err(AgentError::Silent(receive_timeout));
                }
            }
        }
    }
}

async fn handle_frame(
    ctx: &Arc<TaskContext>,
    node_id: &str,
    frame: Frame,
    writer: &mut ChannelWriter<WriteHalf<TcpStream>>,
) -> Result<(), AgentError> {
    if frame.node_id != node_id {
        warn!("frame para {:?} recibido por {}, descartado", frame.node_id, node_id);
        return Ok(());
    }

    match (frame.body, frame.task_id) {
        (FrameBody::Task(envelope), Some(task_id)) => {
            if !is_valid_task_id(&task_id) {
                warn!("id de tarea inválido {:?}, descartado", task_id);
                return Ok(());
            }
            // redelivery de algo ya resuelto con éxito: se reenvía sin ejecutar.
            // Un FAILED guardado no cuenta: el coordinador está reintentando.
            if let Some(done) = ctx.outbox.result(&task_id)? {
                if done.outcome.is_success() {
                    debug!("tarea {} ya resuelta, reenviando resultado", task_id);
                    writer.send_frame(&done.to_frame(node_id)).await?;
                    return Ok(());
                }
                debug!("reintento de {} con resultado FAILED previo, se ejecuta otra vez", task_id);
            }
            if !ctx.start(&task_id) {
                debug!("tarea {} ya en ejecución", task_id);
                return Ok(());
            }
            ctx.outbox.cache_task(&task_id, &envelope)?;
            info!("tarea {} recibida (attempt={})", task_id, envelope.attempt);
            spawn_execution(ctx.clone(), task_id, envelope);
        }
        (FrameBody::Ack, Some(task_id)) => {
            debug!("ACK de {}", task_id);
            ctx.outbox.acknowledge(&task_id)?;
        }
        (FrameBody::Ack, None) => {}
        (body, task_id) => {
            debug!("frame inesperado {:?} (tarea {:?})", body, task_id);
        }
    }
    Ok(())
}

/// El llamador ya marcó la tarea con `TaskContext::start`.
fn spawn_execution(ctx: Arc<TaskContext>, task_id: TaskId, envelope: TaskEnvelope) {
    tokio::spawn(async move {
        execute(&ctx, &task_id, envelope).await;
        ctx.finish(&task_id);
    });
}

async fn execute(ctx: &TaskContext, task_id: &str, envelope: TaskEnvelope) {
    let Ok(_permit) = ctx.slots.clone().acquire_owned().await else {
        return;
    };

    let engine = ctx.engine.clone();
    let payload = envelope.payload;
    let outcome = tokio::task::spawn_blocking(move || engine.execute(&payload)).await;

    let result = match outcome {
        Ok(Ok(output)) => match ctx.cipher.seal(&output) {
            Ok(sealed) => PendingResult {
                task_id: task_id.to_string(),
                outcome: ResultOutcome::Succeeded,
                sealed,
            },
            Err(e) => failed(task_id, e.to_string()),
        },
        Ok(Err(e)) => {
            warn!("inferencia de {} falló: {}", task_id, e);
            failed(task_id, e.to_string())
        }
        Err(e) => {
            warn!("panic o join error en tarea {}: {}", task_id, e);
            failed(task_id, format!("ejecución abortada: {}", e))
        }
    };

    // primero al outbox: si se corta la conexión el resultado no se pierde
    if let Err(e) = ctx.outbox.put_result(&result) {
        warn!("no se pudo guardar el resultado de {}: {}", task_id, e);
    }
    info!("tarea {} terminada ({:?})", task_id, result.outcome);
    if ctx.results_tx.send(result).await.is_err() {
        debug!("agente detenido, resultado de {} queda en el outbox", task_id);
    }
}

fn failed(task_id: &str, reason: String) -> PendingResult {
    PendingResult {
        task_id: task_id.to_string(),
        outcome: ResultOutcome::Failed { reason },
        sealed: Vec::new(),
    }
}

/// Id por defecto del nodo: su hostname.
pub fn default_node_id(hostname: &str) -> NodeId {
    if hostname.trim().is_empty() {
        "node".to_string()
    } else {
        hostname.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use common::{FrameKind, MemoryStorage};
    use tokio::net::TcpListener;

    use crate::error::InferenceError;
    use crate::inference::NormalizeEngine;
    use crate::metrics::HostSample;

    const TOKEN: &str = "token-nodo";
    const KEY: &str = "clave-nodo";

    struct FixedSampler;

    impl HostSampler for FixedSampler {
        fn sample(&mut self) -> HostSample {
            HostSample {
                cpu_percent: 10.0,
                mem_bytes: 1024,
            }
        }
    }

    /// Motor que cuenta ejecuciones y falla con la entrada `"falla"`.
    #[derive(Default)]
    struct CountingEngine {
        runs: AtomicUsize,
    }

    impl InferenceEngine for CountingEngine {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn execute(&self, input: &[u8]) -> Result<Vec<u8>, InferenceError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if input == b"\"falla\"" {
                return Err(InferenceError::InvalidInput("pedido de falla".into()));
            }
            Ok(input.to_vec())
        }
    }

    /// Falla la primera ejecución y acierta las siguientes.
    #[derive(Default)]
    struct FlakyEngine {
        runs: AtomicUsize,
    }

    impl InferenceEngine for FlakyEngine {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn execute(&self, input: &[u8]) -> Result<Vec<u8>, InferenceError> {
            if self.runs.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(InferenceError::ResourceExhausted { len: 2, max: 1 });
            }
            Ok(input.to_vec())
        }
    }

    /// Storage que no puede escribir el outbox.
    #[derive(Default)]
    struct NoOutboxStorage {
        inner: MemoryStorage,
    }

    impl Storage for NoOutboxStorage {
        fn write(&self, key: &str, bytes: &[u8]) -> Result<(), common::StorageError> {
            if key.starts_with("outbox/") {
                return Err(common::StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disco lleno",
                )));
            }
            self.inner.write(key, bytes)
        }

        fn read(&self, key: &str) -> Result<Option<Vec<u8>>, common::StorageError> {
            self.inner.read(key)
        }

        fn delete(&self, key: &str) -> Result<(), common::StorageError> {
            self.inner.delete(key)
        }

        fn delete_all(&self, prefix: &str) -> Result<usize, common::StorageError> {
            self.inner.delete_all(prefix)
        }

        fn keys(&self, prefix: &str) -> Result<Vec<String>, common::StorageError> {
            self.inner.keys(prefix)
        }
    }

    fn outcome_of(frame: Frame) -> ResultOutcome {
        match frame.body {
            FrameBody::Result { outcome, .. } => outcome,
            other => panic!("esperaba RESULT, llegó {:?}", other),
        }
    }

    fn config(addr: &str) -> NodeConfig {
        let vars: HashMap<&str, String> = [
            ("FLEET_COORDINATOR_ADDR", addr.to_string()),
            ("FLEET_AUTH_TOKEN", TOKEN.to_string()),
            ("FLEET_ENCRYPTION_KEY", KEY.to_string()),
            ("FLEET_RECONNECT_BASE_MS", "20".to_string()),
            ("FLEET_RECONNECT_MAX_MS", "100".to_string()),
        ]
        .into_iter()
        .collect();
        NodeConfig::from_lookup(move |k: &str| vars.get(k).cloned()).unwrap()
    }

    fn cipher() -> Arc<FrameCipher> {
        Arc::new(FrameCipher::from_key_material(KEY.as_bytes()))
    }

    fn agent(
        addr: &str,
        storage: Arc<dyn Storage>,
        engine: Arc<dyn InferenceEngine>,
    ) -> NodeAgent {
        NodeAgent::new(
            config(addr),
            "auto-1".into(),
            "auto-host".into(),
            storage,
            engine,
            Box::new(FixedSampler),
        )
    }

    async fn accept(listener: &TcpListener) -> SecureChannel<TcpStream> {
        let (stream, _) = listener.accept().await.unwrap();
        let chan = SecureChannel::accept(stream, TOKEN, cipher()).await.unwrap();
        assert_eq!(chan.peer(), "auto-1");
        chan
    }

    /// Lee frames salteando heartbeats.
    async fn next_non_heartbeat(chan: &mut SecureChannel<TcpStream>) -> Frame {
        loop {
            let frame = chan.receive_frame().await.unwrap();
            if frame.kind() != FrameKind::Heartbeat {
                return frame;
            }
        }
    }

    fn task_frame(task_id: &str, payload: &[u8]) -> Frame {
        Frame {
            node_id: "auto-1".into(),
            task_id: Some(task_id.into()),
            body: FrameBody::Task(TaskEnvelope {
                payload: payload.to_vec(),
                weight: 1.0,
                attempt: 0,
            }),
        }
    }

    #[tokio::test]
    async fn ejecuta_tarea_y_ack_limpia_el_outbox() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let storage = Arc::new(MemoryStorage::new());
        let handle = tokio::spawn(
            agent(&addr, storage.clone(), Arc::new(NormalizeEngine::default())).run(),
        );

        let mut chan = accept(&listener).await;
        let hb = chan.receive_frame().await.unwrap();
        assert_eq!(hb.kind(), FrameKind::Heartbeat);

        chan.send_frame(&task_frame("t1", b"[255, 0]")).await.unwrap();
        let result = next_non_heartbeat(&mut chan).await;
        assert_eq!(result.task_id.as_deref(), Some("t1"));
        match result.body {
            FrameBody::Result { outcome, sealed } => {
                assert_eq!(outcome, ResultOutcome::Succeeded);
                let plain = cipher().open(&sealed).unwrap();
                let values: Vec<f64> = serde_json::from_slice(&plain).unwrap();
                assert_eq!(values, vec![1.0, 0.0]);
            }
            other => panic!("esperaba RESULT, llegó {:?}", other),
        }
        assert_eq!(storage.keys("outbox/").unwrap(), vec!["outbox/t1.json"]);

        chan.send_frame(&Frame::ack("auto-1", "t1")).await.unwrap();
        for _ in 0..100 {
            if storage.keys("").unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(storage.keys("").unwrap().is_empty());
        handle.abort();
    }

    #[tokio::test]
    async fn falla_de_inferencia_se_reporta_como_failed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(
            agent(&addr, Arc::new(MemoryStorage::new()), Arc::new(CountingEngine::default())).run(),
        );

        let mut chan = accept(&listener).await;
        chan.send_frame(&task_frame("t1", b"\"falla\"")).await.unwrap();

        let result = next_non_heartbeat(&mut chan).await;
        match result.body {
            FrameBody::Result { outcome, sealed } => {
                assert!(matches!(outcome, ResultOutcome::Failed { ref reason } if reason.contains("pedido de falla")));
                assert!(sealed.is_empty());
            }
            other => panic!("esperaba RESULT, llegó {:?}", other),
        }
        handle.abort();
    }

    #[tokio::test]
    async fn reconecta_y_reenvia_resultados_sin_ack() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let storage = Arc::new(MemoryStorage::new());
        let engine = Arc::new(CountingEngine::default());
        let handle = tokio::spawn(agent(&addr, storage.clone(), engine.clone()).run());

        // primera conexión: llega el resultado pero se corta antes del ACK
        let mut first = accept(&listener).await;
        first.send_frame(&task_frame("t1", b"[1]")).await.unwrap();
        let result = next_non_heartbeat(&mut first).await;
        assert_eq!(result.kind(), FrameKind::Result);
        drop(first);

        // segunda conexión: lo primero que llega es el resultado pendiente
        let mut second = accept(&listener).await;
        let resent = second.receive_frame().await.unwrap();
        assert_eq!(resent.kind(), FrameKind::Result);
        assert_eq!(resent.task_id.as_deref(), Some("t1"));

        // redelivery de la misma tarea: se reenvía sin volver a ejecutar
        second.send_frame(&task_frame("t1", b"[1]")).await.unwrap();
        let again = next_non_heartbeat(&mut second).await;
        assert_eq!(again.task_id.as_deref(), Some("t1"));
        assert_eq!(engine.runs.load(Ordering::SeqCst), 1);

        handle.abort();
    }

    #[tokio::test]
    async fn al_arrancar_retoma_tareas_cacheadas() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let storage = Arc::new(MemoryStorage::new());
        Outbox::new(storage.clone())
            .cache_task(
                "t9",
                &TaskEnvelope {
                    payload: b"[51]".to_vec(),
                    weight: 1.0,
                    attempt: 0,
                },
            )
            .unwrap();

        let handle = tokio::spawn(
            agent(&addr, storage.clone(), Arc::new(NormalizeEngine::default())).run(),
        );
        let mut chan = accept(&listener).await;
        let result = next_non_heartbeat(&mut chan).await;
        assert_eq!(result.task_id.as_deref(), Some("t9"));
        assert_eq!(result.kind(), FrameKind::Result);
        handle.abort();
    }

    #[tokio::test]
    async fn reintento_de_tarea_fallida_se_ejecuta_de_nuevo() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let engine = Arc::new(FlakyEngine::default());
        let handle = tokio::spawn(
            agent(&addr, Arc::new(MemoryStorage::new()), engine.clone()).run(),
        );

        let mut chan = accept(&listener).await;
        chan.send_frame(&task_frame("t1", b"[1]")).await.unwrap();
        let first = outcome_of(next_non_heartbeat(&mut chan).await);
        assert!(matches!(first, ResultOutcome::Failed { .. }));

        // el reintento puede llegar antes que el ACK del resultado fallido
        chan.send_frame(&task_frame("t1", b"[1]")).await.unwrap();
        chan.send_frame(&Frame::ack("auto-1", "t1")).await.unwrap();
        let retry = outcome_of(next_non_heartbeat(&mut chan).await);
        assert_eq!(retry, ResultOutcome::Succeeded);
        assert_eq!(engine.runs.load(Ordering::SeqCst), 2);

        handle.abort();
    }

    #[tokio::test]
    async fn resultado_sin_outbox_no_se_pierde_al_conectar() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let storage = Arc::new(NoOutboxStorage::default());
        Outbox::new(storage.clone())
            .cache_task(
                "t9",
                &TaskEnvelope {
                    payload: b"[51]".to_vec(),
                    weight: 1.0,
                    attempt: 0,
                },
            )
            .unwrap();

        let handle = tokio::spawn(
            agent(&addr, storage.clone(), Arc::new(NormalizeEngine::default())).run(),
        );
        // la tarea termina antes de que el coordinador acepte la conexión
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(storage.keys("outbox/").unwrap().is_empty());

        let mut chan = accept(&listener).await;
        let result = next_non_heartbeat(&mut chan).await;
        assert_eq!(result.task_id.as_deref(), Some("t9"));
        assert_eq!(outcome_of(result), ResultOutcome::Succeeded);
        handle.abort();
    }

    #[test]
    fn id_por_defecto_es_el_hostname() {
        assert_eq!(default_node_id(" auto-7 "), "auto-7");
        assert_eq!(default_node_id(""), "node");
    }
}
