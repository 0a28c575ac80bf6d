use std::time::Duration;

use common::{ChannelError, StorageError};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
    #[error("entrada inválida: {0}")]
    InvalidInput(String),
    #[error("entrada demasiado grande: {len} valores (máximo {max})")]
    ResourceExhausted { len: usize, max: usize },
}

/// Por qué terminó una sesión con el coordinador.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("outbox corrupto: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("el coordinador no respondió en {0:?}")]
    Silent(Duration),
}
