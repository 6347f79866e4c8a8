//! Message channel between two nodes.
//!
//! An [`RpcChannel`] owns one connection and speaks the marshal format on it:
//! every `send` writes one message plus its files, every `recv` reads one and
//! materializes the files under the channel's root.
//!
//! ```text
//!   parent                          child
//!     │── Hello::Register(vital) ──▶ │
//!     │◀─ RegisterAck ────────────── │
//!     │      (held open; EOF = gone) │
//!
//!   client                          root
//!     │── Hello::Submit ───────────▶ │
//!     │── CommandRequest ──────────▶ │
//!     │◀─ SubmitReply ────────────── │
//!
//!   parent                          child (server address)
//!     │── Hello::Exec ─────────────▶ │
//!     │── CommandRequest + files ──▶ │
//!     │◀─ ExecAck ────────────────── │
//! ```
//!
//! Reads and writes are guarded separately, so one task can block in
//! [`RpcChannel::wait_closed`] while another sends.

use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use arbor_types::FileRefs;

use crate::marshal::{Decoder, Encoder, MarshalError, TransferStats};
use crate::transport::{Conn, Endpoint, TransportError};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{0}")]
    Marshal(#[from] MarshalError),

    #[error("connection to {peer} closed while waiting for {label}")]
    Closed { peer: String, label: &'static str },

    #[error("unexpected {got} from {peer}, wanted {wanted}")]
    Unexpected {
        peer: String,
        wanted: &'static str,
        got: &'static str,
    },
}

pub struct RpcChannel {
    reader: Mutex<Decoder<ReadHalf<Conn>>>,
    writer: Mutex<Encoder<WriteHalf<Conn>>>,
    peer: String,
    root: Option<PathBuf>,
}

impl RpcChannel {
    /// Wrap an established connection. `peer` is only used for logging and errors.
    pub fn new(conn: Conn, peer: impl Into<String>) -> Self {
        let (r, w) = tokio::io::split(conn);
        Self {
            reader: Mutex::new(Decoder::new(r)),
            writer: Mutex::new(Encoder::new(w)),
            peer: peer.into(),
            root: None,
        }
    }

    /// Dial `endpoint` and wrap the result.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, RpcError> {
        let conn = endpoint.connect().await?;
        Ok(Self::new(conn, endpoint.to_string()))
    }

    /// Materialize received files under `root`.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn with_chunk_size(self, chunk_size: usize) -> Self {
        let writer = self.writer.into_inner().with_chunk_size(chunk_size);
        Self {
            writer: Mutex::new(writer),
            ..self
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Send one message and the files it references.
    pub async fn send<M>(&self, label: &'static str, msg: &M) -> Result<TransferStats, RpcError>
    where
        M: Serialize + FileRefs,
    {
        let mut writer = self.writer.lock().await;
        let stats = writer.marshal(msg).await?;
        tracing::debug!(
            "sent {} to {} ({} files, {} bytes)",
            label,
            self.peer,
            stats.files,
            stats.bytes
        );
        Ok(stats)
    }

    /// Receive one message, materializing its files under the channel root.
    pub async fn recv<M>(&self, label: &'static str) -> Result<M, RpcError>
    where
        M: DeserializeOwned + FileRefs,
    {
        let mut reader = self.reader.lock().await;
        match reader.unmarshal::<M>(self.root.as_deref()).await {
            Ok((msg, stats)) => {
                tracing::debug!(
                    "received {} from {} ({} files, {} bytes)",
                    label,
                    self.peer,
                    stats.files,
                    stats.bytes
                );
                Ok(msg)
            }
            Err(MarshalError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(RpcError::Closed {
                    peer: self.peer.clone(),
                    label,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Close the write side. The peer sees EOF.
    pub async fn shutdown(&self) -> Result<(), RpcError> {
        let mut writer = self.writer.lock().await;
        writer
            .get_mut()
            .shutdown()
            .await
            .map_err(MarshalError::from)?;
        Ok(())
    }

    /// Block until the peer closes its side, discarding anything it sends.
    pub async fn wait_closed(&self) -> io::Result<()> {
        let mut reader = self.reader.lock().await;
        let mut sink = [0u8; 256];
        loop {
            match reader.get_mut().read(&mut sink).await {
                Ok(0) => return Ok(()),
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("peer", &self.peer)
            .field("root", &self.root)
            .finish()
    }
}
