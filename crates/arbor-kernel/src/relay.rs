//! I/O relay: collects output streams from children into one sink.
//!
//! A relay is bound before anything is dispatched, so its address can go into
//! the request. Once the dispatch count is known it is started and accepts
//! exactly that many connections, copying each into the shared sink as bytes
//! arrive. Every accepted (or failed) connection produces one [`Completion`];
//! the owner waits for as many completions as it dispatched.
//!
//! ```text
//!   child 1 ──┐
//!   child 2 ──┼──▶ IoRelay ──▶ sink (stdout, or the upstream relay)
//!   child 3 ──┘        └──────▶ completions (one per child)
//! ```

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::transport::{Conn, Endpoint, Listener, TransportError};

/// Size of each copy from a child into the sink.
const COPY_BUF: usize = 8 * 1024;

/// Output destination shared by every copy loop.
///
/// Writers lock it per buffer, so output from different children interleaves
/// at buffer granularity but never mid-buffer.
pub type SharedSink = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Wrap a writer for sharing between copy loops.
pub fn shared_sink<W>(writer: W) -> SharedSink
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    Arc::new(Mutex::new(Box::new(writer)))
}

/// Outcome of one child's output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub peer: String,
    pub bytes: u64,
    pub error: Option<String>,
}

/// Totals once every expected completion is in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelaySummary {
    pub completed: usize,
    pub failed: usize,
    pub bytes: u64,
}

pub struct IoRelay {
    listener: Listener,
    endpoint: Endpoint,
}

impl IoRelay {
    /// Bind the relay. The reported endpoint has any `:0` port resolved.
    pub async fn bind(endpoint: &Endpoint) -> Result<Self, TransportError> {
        let listener = endpoint.bind().await?;
        let endpoint = listener.local_endpoint().map_err(|source| TransportError::Bind {
            addr: endpoint.to_string(),
            source,
        })?;
        Ok(Self { listener, endpoint })
    }

    /// Where children should send their output.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Accept exactly `expected` connections and copy each into `sink`.
    pub fn start(self, expected: usize, sink: SharedSink) -> Completions {
        let (tx, rx) = mpsc::channel(expected.max(1));
        let listener = self.listener;
        let endpoint = self.endpoint.clone();

        let acceptor = tokio::spawn(async move {
            for _ in 0..expected {
                match listener.accept().await {
                    Ok((conn, peer)) => {
                        tracing::debug!("relay {} accepted {}", endpoint, peer);
                        tokio::spawn(copy_into(conn, peer, sink.clone(), tx.clone()));
                    }
                    Err(e) => {
                        tracing::warn!("relay {} accept failed: {}", endpoint, e);
                        let _ = tx
                            .send(Completion {
                                peer: endpoint.to_string(),
                                bytes: 0,
                                error: Some(e.to_string()),
                            })
                            .await;
                    }
                }
            }
        });

        Completions {
            rx,
            expected,
            received: 0,
            acceptor,
        }
    }
}

/// Copy one child's stream into the sink, then report exactly once.
async fn copy_into(mut conn: Conn, peer: String, sink: SharedSink, tx: mpsc::Sender<Completion>) {
    let mut buf = vec![0u8; COPY_BUF];
    let mut bytes = 0u64;
    let mut error = None;

    loop {
        let n = match conn.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                error = Some(format!("read from {peer}: {e}"));
                break;
            }
        };
        let mut out = sink.lock().await;
        let written = async {
            out.write_all(&buf[..n]).await?;
            out.flush().await
        };
        if let Err(e) = written.await {
            error = Some(format!("write to sink: {e}"));
            break;
        }
        bytes += n as u64;
    }

    if let Some(e) = &error {
        tracing::warn!("relay stream from {} ended early: {}", peer, e);
    }
    let _ = tx.send(Completion { peer, bytes, error }).await;
}

/// Receiver side of a started relay.
pub struct Completions {
    rx: mpsc::Receiver<Completion>,
    expected: usize,
    received: usize,
    acceptor: JoinHandle<()>,
}

impl Completions {
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Next completion, or `None` once all expected ones are in.
    pub async fn next(&mut self) -> Option<Completion> {
        if self.received >= self.expected {
            return None;
        }
        let completion = self.rx.recv().await?;
        self.received += 1;
        Some(completion)
    }

    /// Wait for every expected completion.
    pub async fn wait(mut self) -> RelaySummary {
        let mut summary = RelaySummary::default();
        while let Some(c) = self.next().await {
            summary.bytes += c.bytes;
            if c.error.is_some() {
                summary.failed += 1;
            } else {
                summary.completed += 1;
            }
        }
        summary
    }
}

impl Drop for Completions {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}
