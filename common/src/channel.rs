//! Canal seguro punto a punto entre coordinador y nodos.
//!
//! Cada frame en el cable es `[u32 big-endian len][nonce ‖ ciphertext+tag]`.
//! El cifrado es AES-256-GCM con una clave derivada por HKDF-SHA256 del material
//! configurado; la clave nunca viaja. Antes de cualquier frame de aplicación, el
//! que abre la conexión manda un HELLO cifrado con su `node_id` y el token
//! compartido, y el que acepta lo compara en tiempo constante.

use std::fmt;
use std::sync::Arc;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio::io::{
    self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::frame::Frame;
use crate::node::NodeId;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Tamaño máximo de un frame cifrado (sin contar el prefijo de longitud).
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;
/// Máximo de bytes en claro que entran en un frame.
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - NONCE_LEN - TAG_LEN;

const KEY_INFO: &[u8] = b"fleet-channel/aes-256-gcm/v1";

/// Cifrador AEAD compartido por el canal y por el agregador de resultados.
pub struct FrameCipher {
    aead: Aes256Gcm,
}

impl FrameCipher {
    pub fn from_key_material(material: &[u8]) -> Self {
        let hk = Hkdf::<Sha256>::new(None, material);
        let mut okm = [0u8; 32];
        // 32 bytes está muy por debajo del límite de HKDF-SHA256 (255 * 32)
        hk.expand(KEY_INFO, &mut okm)
            .expect("longitud de clave válida para HKDF");
        let key = Key::<Aes256Gcm>::from_slice(&okm);
        Self {
            aead: Aes256Gcm::new(key),
        }
    }

    /// Cifra con un nonce aleatorio nuevo; devuelve `nonce ‖ ciphertext+tag`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, ChannelError> {
        if plaintext.len() > MAX_PAYLOAD_LEN {
            return Err(ChannelError::FrameTooLarge {
                len: plaintext.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .aead
            .encrypt(&nonce, plaintext)
            .map_err(|_| ChannelError::FrameTooLarge {
                len: plaintext.len(),
                max: MAX_PAYLOAD_LEN,
            })?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Descifra y verifica. Cualquier byte alterado da `Integrity`.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, ChannelError> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(ChannelError::Integrity);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.aead
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| ChannelError::Integrity)
    }
}

impl fmt::Debug for FrameCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FrameCipher(..)")
    }
}

#[derive(Serialize, Deserialize)]
struct Hello {
    node_id: NodeId,
    token: String,
}

#[derive(Serialize, Deserialize)]
struct HelloVerdict {
    accepted: bool,
}

/// Mitad de lectura: un solo lector por conexión preserva el orden de frames.
pub struct ChannelReader<R> {
    inner: R,
    cipher: Arc<FrameCipher>,
}

impl<R: AsyncRead + Unpin> ChannelReader<R> {
    pub fn new(inner: R, cipher: Arc<FrameCipher>) -> Self {
        Self { inner, cipher }
    }

    /// Bloquea hasta leer un frame completo, lo descifra y lo verifica.
    pub async fn receive(&mut self) -> Result<Vec<u8>, ChannelError> {
        let len = self.inner.read_u32().await? as usize;
        if len > MAX_FRAME_LEN {
            return Err(ChannelError::FrameTooLarge {
                len,
                max: MAX_FRAME_LEN,
            });
        }

        let mut sealed = vec![0u8; len];
        self.inner.read_exact(&mut sealed).await?;

        // el frame ya se consumió entero: si no verifica, se descarta y el
        // stream queda alineado para el siguiente
        self.cipher.open(&sealed).map_err(|e| {
            warn!("descartando frame de {} bytes: {}", len, e);
            e
        })
    }

    pub async fn receive_frame(&mut self) -> Result<Frame, ChannelError> {
        let plain = self.receive().await?;
        Ok(Frame::decode(&plain)?)
    }
}

/// Mitad de escritura.
pub struct ChannelWriter<W> {
    inner: W,
    cipher: Arc<FrameCipher>,
    closed: bool,
}

impl<W: AsyncWrite + Unpin> ChannelWriter<W> {
    pub fn new(inner: W, cipher: Arc<FrameCipher>) -> Self {
        Self {
            inner,
            cipher,
            closed: false,
        }
    }

    pub async fn send(&mut self, plaintext: &[u8]) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Transport(io::Error::new(
                io::ErrorKind::NotConnected,
                "canal cerrado",
            )));
        }

        let sealed = self.cipher.seal(plaintext)?;
        let mut buf = Vec::with_capacity(4 + sealed.len());
        buf.extend_from_slice(&(sealed.len() as u32).to_be_bytes());
        buf.extend_from_slice(&sealed);

        self.inner.write_all(&buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), ChannelError> {
        let bytes = frame.encode()?;
        self.send(&bytes).await
    }

    /// Cierra la escritura. Se puede llamar varias veces.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.inner.shutdown().await {
            debug!("shutdown del canal: {}", e);
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Canal autenticado y cifrado sobre cualquier stream bidireccional.
pub struct SecureChannel<S> {
    peer: NodeId,
    reader: ChannelReader<ReadHalf<S>>,
    writer: ChannelWriter<WriteHalf<S>>,
}

impl SecureChannel<TcpStream> {
    /// Conecta a `addr` y se autentica como `node_id`.
    pub async fn open(
        addr: &str,
        node_id: &str,
        token: &str,
        cipher: Arc<FrameCipher>,
    ) -> Result<Self, ChannelError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ChannelError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        let _ = stream.set_nodelay(true);
        Self::handshake_as_client(stream, node_id, token, cipher).await
    }
}

impl<S: AsyncRead + AsyncWrite> SecureChannel<S> {
    fn wrap(stream: S, peer: NodeId, cipher: Arc<FrameCipher>) -> Self {
        let (r, w) = io::split(stream);
        Self {
            peer,
            reader: ChannelReader::new(r, cipher.clone()),
            writer: ChannelWriter::new(w, cipher),
        }
    }

    /// Lado que abre: manda HELLO y espera el veredicto.
    pub async fn handshake_as_client(
        stream: S,
        node_id: &str,
        token: &str,
        cipher: Arc<FrameCipher>,
    ) -> Result<Self, ChannelError> {
        let mut chan = Self::wrap(stream, "coordinator".to_string(), cipher);

        let hello = serde_json::to_vec(&Hello {
            node_id: node_id.to_string(),
            token: token.to_string(),
        })?;
        chan.writer.send(&hello).await?;

        let verdict = match chan.reader.receive().await {
            Ok(bytes) => serde_json::from_slice::<HelloVerdict>(&bytes)?,
            Err(ChannelError::Integrity) => {
                return Err(ChannelError::Authentication(
                    "respuesta del coordinador no verifica (¿clave distinta?)".into(),
                ))
            }
            // el coordinador corta la conexión si no pudo leer nuestro HELLO
            Err(ChannelError::Transport(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(ChannelError::Authentication(
                    "el coordinador cerró la conexión durante el handshake".into(),
                ))
            }
            Err(e) => return Err(e),
        };

        if !verdict.accepted {
            chan.close().await;
            return Err(ChannelError::Authentication("token rechazado".into()));
        }
        Ok(chan)
    }

    /// Lado que acepta: valida el HELLO comparando el token en tiempo constante.
    pub async fn accept(
        stream: S,
        expected_token: &str,
        cipher: Arc<FrameCipher>,
    ) -> Result<Self, ChannelError> {
        let mut chan = Self::wrap(stream, String::new(), cipher);

        let hello: Hello = match chan.reader.receive().await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|_| {
                ChannelError::Authentication("HELLO con formato inválido".into())
            })?,
            Err(ChannelError::Integrity) => {
                chan.close().await;
                return Err(ChannelError::Authentication(
                    "HELLO no verifica (¿clave distinta?)".into(),
                ));
            }
            Err(e) => return Err(e),
        };

        let token_ok: bool = hello
            .token
            .as_bytes()
            .ct_eq(expected_token.as_bytes())
            .into();
        let accepted = token_ok && !hello.node_id.is_empty();

        let verdict = serde_json::to_vec(&HelloVerdict { accepted })?;
        chan.writer.send(&verdict).await?;

        if !accepted {
            chan.close().await;
            return Err(ChannelError::Authentication(format!(
                "token inválido para el nodo {:?}",
                hello.node_id
            )));
        }

        chan.peer = hello.node_id;
        Ok(chan)
    }

    /// Identidad autenticada del otro extremo.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn send(&mut self, plaintext: &[u8]) -> Result<(), ChannelError> {
        self.writer.send(plaintext).await
    }

    pub async fn receive(&mut self) -> Result<Vec<u8>, ChannelError> {
        self.reader.receive().await
    }

    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), ChannelError> {
        self.writer.send_frame(frame).await
    }

    pub async fn receive_frame(&mut self) -> Result<Frame, ChannelError> {
        self.reader.receive_frame().await
    }

    pub async fn close(&mut self) {
        self.writer.close().await;
    }

    /// Separa lector y escritor para usarlos desde tareas distintas.
    pub fn into_split(self) -> (NodeId, ChannelReader<ReadHalf<S>>, ChannelWriter<WriteHalf<S>>) {
        (self.peer, self.reader, self.writer)
    }
}
