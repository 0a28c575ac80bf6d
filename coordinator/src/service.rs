// coordinator/src/service.rs

use std::io;
use std::net::SocketAddr;

use common::{
    ChannelError, ChannelReader, Frame, FrameBody, NodeStatus, ResultOutcome, SecureChannel,
};
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::connections::OUTBOUND_QUEUE_LEN;
use crate::scheduler::Completion;
use crate::state::AppState;

/// Listener de nodos: acepta conexiones y atiende cada una en su propia tarea.
pub struct CoordinatorService {
    state: AppState,
    listener: TcpListener,
}

impl CoordinatorService {
    pub async fn bind(state: AppState) -> io::Result<Self> {
        let listener = TcpListener::bind(&state.config.node_addr).await?;
        Ok(Self { state, listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// LISTENING hasta que `shutdown` cambie; ahí pasa a SHUTDOWN.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("escuchando nodos en {:?}", self.listener.local_addr().ok());

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let state = self.state.clone();
                        tokio::spawn(async move {
                            serve_connection(state, stream, addr).await;
                        });
                    }
                    Err(e) => warn!("accept falló: {}", e),
                },
                _ = shutdown.changed() => {
                    info!("listener de nodos: SHUTDOWN");
                    break;
                }
            }
        }
    }
}

async fn serve_connection(state: AppState, stream: TcpStream, addr: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay en {}: {}", addr, e);
    }

    let handshake = SecureChannel::accept(
        stream,
        state.config.auth_token.expose(),
        state.cipher.clone(),
    );
    let chan = match timeout(state.config.handshake_timeout, handshake).await {
        Ok(Ok(chan)) => chan,
        Ok(Err(e)) => {
            warn!("handshake rechazado desde {}: {}", addr, e);
            return;
        }
        Err(_) => {
            warn!(
                "handshake desde {} no terminó en {:?}",
                addr, state.config.handshake_timeout
            );
            return;
        }
    };

    let (node_id, reader, mut writer) = chan.into_split();
    info!("nodo {} conectado desde {}", node_id, addr);

    state
        .registry
        .register_or_update(&node_id, NodeStatus::Online, 0.0);

    let (tx, mut rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE_LEN);
    let generation = state.connections.register(&node_id, tx);

    let writer_task = {
        let node_id = node_id.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = writer.send_frame(&frame).await {
                    warn!("escritura hacia {} falló: {}", node_id, e);
                    break;
                }
            }
            writer.close().await;
        })
    };

    // lo que el nodo tenía asignado pudo quedar en la cola de una conexión anterior
    let resent = state.scheduler.redeliver(&node_id);
    if resent > 0 {
        info!("reenviadas {} tareas asignadas a {}", resent, node_id);
    }

    let reason = read_loop(&state, &node_id, reader).await;
    info!("conexión de {} terminada: {}", node_id, reason);

    if state.connections.remove(&node_id, generation) {
        let orphans = state.registry.mark_offline(&node_id);
        if !orphans.is_empty() {
            let n = state.scheduler.reschedule(&orphans);
            info!(
                "{} tareas huérfanas de {}, {} reasignadas",
                orphans.len(),
                node_id,
                n
            );
        }
        state.forward_failures();
    }

    if let Err(e) = writer_task.await {
        debug!("tarea escritora de {}: {}", node_id, e);
    }
}

/// HANDLING(node): procesa frames hasta que la conexión falla o queda muda.
async fn read_loop<R>(state: &AppState, node_id: &str, mut reader: ChannelReader<R>) -> String
where
    R: AsyncRead + Unpin,
{
    loop {
        match timeout(state.config.receive_timeout, reader.receive_frame()).await {
            Err(_) => {
                return format!("sin frames en {:?}", state.config.receive_timeout);
            }
            Ok(Err(e)) if e.is_recoverable() => {
                warn!("frame de {} descartado: {}", node_id, e);
            }
            Ok(Err(ChannelError::Transport(e))) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return "el nodo cerró la conexión".to_string();
            }
            Ok(Err(e)) => return e.to_string(),
            Ok(Ok(frame)) => {
                if frame.node_id != node_id {
                    warn!(
                        "frame con node_id {:?} en la conexión de {}, descartado",
                        frame.node_id, node_id
                    );
                    continue;
                }
                handle_frame(state, node_id, frame);
            }
        }
    }
}

fn handle_frame(state: &AppState, node_id: &str, frame: Frame) {
    let kind = frame.kind();
    let task_id = frame.task_id;

    match frame.body {
        FrameBody::Heartbeat(hb) => {
            state.registry.apply_heartbeat(node_id, &hb);
            reply(state, node_id, Frame::heartbeat_ack(node_id));
        }
        FrameBody::Result { outcome, sealed } => {
            let Some(task_id) = task_id else {
                warn!("RESULT sin task_id de {}, descartado", node_id);
                return;
            };
            handle_result(state, node_id, &task_id, outcome, &sealed);
        }
        FrameBody::Task(_) | FrameBody::Ack => {
            debug!("frame {:?} inesperado de {}, se ignora", kind, node_id);
        }
    }
}

fn handle_result(
    state: &AppState,
    node_id: &str,
    task_id: &str,
    outcome: ResultOutcome,
    sealed: &[u8],
) {
    if state.scheduler.task(task_id).is_none() {
        // de una corrida anterior del coordinador: se confirma para que el
        // nodo lo saque de su outbox
        warn!("resultado de tarea desconocida {} desde {}", task_id, node_id);
        reply(state, node_id, Frame::ack(node_id, task_id));
        return;
    }

    if outcome.is_success() {
        // verificar antes de cerrar la tarea: un sello roto no la completa
        match state.aggregator.submit(task_id, Some(node_id), sealed) {
            Ok(stored) => debug!("resultado de {} (nuevo={})", task_id, stored),
            Err(e) => {
                warn!("resultado de {} desde {} descartado: {}", task_id, node_id, e);
                return;
            }
        }
    }

    // el ACK va antes que un posible reintento sobre la misma cola
    reply(state, node_id, Frame::ack(node_id, task_id));

    match state.scheduler.complete(node_id, task_id, &outcome) {
        Completion::Failed => {
            state.forward_failures();
        }
        other => debug!("completion de {}: {:?}", task_id, other),
    }
}

fn reply(state: &AppState, node_id: &str, frame: Frame) {
    if let Err(e) = state.connections.send(node_id, frame) {
        debug!("no se pudo responder a {}: {}", node_id, e);
    }
}
