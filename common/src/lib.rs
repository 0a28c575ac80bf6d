pub mod backoff;
pub mod batch;
pub mod channel;
pub mod config;
pub mod error;
pub mod frame;
pub mod node;
pub mod results;
pub mod storage;
pub mod task;

pub use backoff::Backoff;
pub use batch::{BatchId, BatchInfo, BatchRequest, BatchStatus, TaskSpec};
pub use channel::{ChannelReader, ChannelWriter, FrameCipher, SecureChannel};
pub use config::{CoordinatorConfig, NodeConfig, Secret};
pub use error::{ChannelError, ConfigError, StorageError};
pub use frame::{Frame, FrameBody, FrameKind};
pub use node::{Heartbeat, NodeId, NodeMetrics, NodeStatus};
pub use results::{FinalOutput, ResultOutcome, TaskResult};
pub use storage::{FsStorage, MemoryStorage, Storage};
pub use task::{Task, TaskEnvelope, TaskId, TaskStatus, TaskView, DEFAULT_TASK_WEIGHT};

/// Ids de tarea válidos: también se usan como claves de storage en el nodo.
pub fn is_valid_task_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && id != "."
        && id != ".."
}
