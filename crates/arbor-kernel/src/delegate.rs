//! Fan-out of one command to the selected children.

use std::path::PathBuf;
use std::sync::Arc;

use arbor_types::{CommandRequest, ExecAck, FileKind, Hello};
use futures::future::join_all;
use tokio::io::AsyncWriteExt;

use crate::marshal::CHUNK_SIZE;
use crate::nodespec::{self, NodeSpecError};
use crate::registry::{SlaveInfo, SlaveRegistry};
use crate::rpc::{RpcChannel, RpcError};
use crate::transport::Endpoint;

/// Sends narrowed copies of a request to the children its node spec selects.
pub struct Delegator {
    registry: Arc<SlaveRegistry>,
    root: PathBuf,
    chunk_size: usize,
}

impl Delegator {
    /// `root` is where this node's copy of the canonical file tree lives:
    /// `/` on the root node, the private directory on a worker.
    pub fn new(registry: Arc<SlaveRegistry>, root: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            root: root.into(),
            chunk_size: CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn registry(&self) -> &Arc<SlaveRegistry> {
        &self.registry
    }

    /// Dispatch `req` and return how many children it went to.
    ///
    /// The caller has already pointed `req.peer` at a relay bound for this
    /// dispatch; each counted child connects to it exactly once. A child that
    /// cannot be reached is evicted and not counted. Sends run in the
    /// background, so a slow child does not hold up the others. A counted
    /// child that never acknowledges is evicted too, and its relay
    /// connection is made here instead, carrying the error.
    ///
    /// Alternatives are dispatched independently: a child selected twice
    /// receives the command twice.
    pub async fn delegate(&self, req: &CommandRequest) -> Result<usize, NodeSpecError> {
        let selections = nodespec::parse(&req.nodes)?;
        let base = self.repoint_files(req);

        let targets: Vec<(&str, SlaveInfo)> = selections
            .iter()
            .flat_map(|selection| {
                self.registry
                    .intersect(&selection.nodes)
                    .into_iter()
                    .map(move |child| (selection.sub_spec.as_str(), child))
            })
            .collect();

        // Dial every target at once; a wide fan-out should not pay for its
        // children's connect latency one after another.
        let channels = join_all(targets.iter().map(|(_, child)| self.dial(child))).await;

        let mut dispatched = 0;
        for ((sub_spec, child), channel) in targets.into_iter().zip(channels) {
            let Some(channel) = channel else { continue };

            let narrowed = narrow(&base, sub_spec, &child.id);
            tracing::info!(
                "delegating {:?} to child {} as '{}'",
                req.program().unwrap_or_default(),
                child.id,
                narrowed.nodes
            );
            self.spawn_send(child.id, channel, narrowed);
            dispatched += 1;
        }

        Ok(dispatched)
    }

    async fn dial(&self, child: &SlaveInfo) -> Option<RpcChannel> {
        match RpcChannel::connect(&Endpoint::parse(&child.server)).await {
            Ok(channel) => Some(channel.with_chunk_size(self.chunk_size)),
            Err(e) => {
                tracing::warn!("child {} unreachable, evicting: {}", child.id, e);
                self.registry.remove(&child.id);
                None
            }
        }
    }

    fn spawn_send(&self, id: String, channel: RpcChannel, req: CommandRequest) {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let delivered = async {
                channel.send("hello", &Hello::Exec).await?;
                channel.send("exec", &req).await?;
                channel.shutdown().await?;
                channel.recv::<ExecAck>("ack").await
            };
            if let Err(e) = delivered.await {
                tracing::warn!("child {} did not take the command, evicting: {}", id, e);
                registry.remove(&id);
                report_undelivered(&req.peer, &id, &e).await;
            }
        });
    }

    /// Point every record at this node's copy so it is re-sent from here.
    fn repoint_files(&self, req: &CommandRequest) -> CommandRequest {
        let mut req = req.clone();
        for rec in &mut req.files {
            rec.source = match rec.kind {
                FileKind::Other => PathBuf::new(),
                _ => rec.destination(&self.root),
            };
        }
        req
    }
}

/// Complete a lost child's relay slot with an error line.
async fn report_undelivered(relay: &str, id: &str, err: &RpcError) {
    let msg = format!("arbor: node {id}: command not delivered: {err}\n");
    match Endpoint::parse(relay).connect().await {
        Ok(mut conn) => {
            if let Err(e) = conn.write_all(msg.as_bytes()).await {
                tracing::debug!("reporting child {} to {}: {}", id, relay, e);
            }
            let _ = conn.shutdown().await;
        }
        Err(e) => tracing::warn!("relay {} unreachable while reporting child {}: {}", relay, id, e),
    }
}

/// The request as one child should see it.
///
/// With no sub-spec the child is the final target and gets its own id, which
/// tells it to run locally without delegating further.
pub fn narrow(req: &CommandRequest, sub_spec: &str, child_id: &str) -> CommandRequest {
    let mut req = req.clone();
    req.nodes = if sub_spec.is_empty() {
        child_id.to_string()
    } else {
        sub_spec.to_string()
    };
    req
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_types::FileRecord;

    #[test]
    fn test_narrow_to_sub_spec() {
        let req = CommandRequest::new(vec!["/bin/date".into()]).with_nodes("1-3/1-40");
        assert_eq!(narrow(&req, "1-40", "2").nodes, "1-40");
    }

    #[test]
    fn test_narrow_without_sub_spec_uses_child_id() {
        let req = CommandRequest::new(vec!["/bin/date".into()]).with_nodes("7");
        assert_eq!(narrow(&req, "", "7").nodes, "7");
    }

    #[test]
    fn test_repoint_files_under_root() {
        let delegator = Delegator::new(Arc::new(SlaveRegistry::new()), "/tmp/arbor-priv");
        let req = CommandRequest::new(vec!["/bin/echo".into()]).with_files(vec![
            FileRecord::new("/bin/echo", FileKind::Regular),
            FileRecord::new("/dev/null", FileKind::Other).with_source("/dev/null"),
        ]);

        let out = delegator.repoint_files(&req);
        assert_eq!(out.files[0].source, PathBuf::from("/tmp/arbor-priv/bin/echo"));
        assert!(out.files[1].source.as_os_str().is_empty());
    }

    #[tokio::test]
    async fn test_bad_spec_sends_nothing() {
        let delegator = Delegator::new(Arc::new(SlaveRegistry::new()), "/");
        let req = CommandRequest::new(vec!["/bin/true".into()]).with_nodes("3-1");
        assert_eq!(
            delegator.delegate(&req).await.unwrap_err(),
            NodeSpecError::BadRange { begin: 3, end: 1 }
        );
    }

    #[tokio::test]
    async fn test_empty_registry_dispatches_zero() {
        let delegator = Delegator::new(Arc::new(SlaveRegistry::new()), "/");
        let req = CommandRequest::new(vec!["/bin/true".into()]).with_nodes(".");
        assert_eq!(delegator.delegate(&req).await.unwrap(), 0);
    }
}
