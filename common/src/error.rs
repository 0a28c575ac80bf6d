use thiserror::Error;

/// Errores del canal seguro entre coordinador y nodos.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("no se pudo conectar a {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("autenticación rechazada: {0}")]
    Authentication(String),
    #[error("error de transporte: {0}")]
    Transport(#[from] std::io::Error),
    /// El tag AEAD no verificó; el frame se descarta pero la conexión sigue usable.
    #[error("frame corrupto o con clave incorrecta")]
    Integrity,
    #[error("frame de {len} bytes supera el máximo de {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("frame ilegible: {0}")]
    Codec(#[from] serde_json::Error),
}

impl ChannelError {
    /// Integridad y formato: el frame ya se consumió entero, así que se
    /// descarta y la conexión sigue alineada. El resto la deja inservible.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ChannelError::Integrity | ChannelError::Codec(_))
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("error de I/O en storage: {0}")]
    Io(#[from] std::io::Error),
    #[error("clave de storage inválida: {0:?}")]
    InvalidKey(String),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("falta la variable de entorno {0}")]
    Missing(&'static str),
    #[error("valor inválido para {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}
