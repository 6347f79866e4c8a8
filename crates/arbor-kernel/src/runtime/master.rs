//! The root node.

use std::path::PathBuf;
use std::sync::Arc;

use arbor_types::{CommandRequest, Hello, InfoReply, SubmitReply};

use super::{NodeError, accept_loop, serve_registration};
use crate::config::NodeConfig;
use crate::delegate::Delegator;
use crate::nodespec;
use crate::registry::SlaveRegistry;
use crate::rpc::{RpcChannel, RpcError};
use crate::transport::{Endpoint, Listener};

/// Reason given when a command reaches no child.
pub const NO_HOSTS: &str = "no hosts ready";

/// Root of the tree: takes commands from clients, registrations from children.
pub struct Master {
    registry: Arc<SlaveRegistry>,
    delegator: Arc<Delegator>,
    control: Listener,
    listen: Listener,
}

impl Master {
    /// Bind the control and registration endpoints.
    pub async fn bind(config: &NodeConfig) -> Result<Self, NodeError> {
        let registry = Arc::new(SlaveRegistry::new());
        let root = config.root.clone().unwrap_or_else(|| PathBuf::from("/"));
        let delegator = Delegator::new(registry.clone(), root).with_chunk_size(config.chunk_size);

        let control = config.control_endpoint().bind().await?;
        let listen = config.listen_endpoint().bind().await?;

        Ok(Self {
            registry,
            delegator: Arc::new(delegator),
            control,
            listen,
        })
    }

    pub fn registry(&self) -> &Arc<SlaveRegistry> {
        &self.registry
    }

    /// Where clients connect, with any `:0` port resolved.
    pub fn control_endpoint(&self) -> std::io::Result<Endpoint> {
        self.control.local_endpoint()
    }

    /// Where children register, with any `:0` port resolved.
    pub fn listen_endpoint(&self) -> std::io::Result<Endpoint> {
        self.listen.local_endpoint()
    }

    /// Serve clients and children until the process ends.
    pub async fn serve(self) -> Result<(), NodeError> {
        let Self {
            registry,
            delegator,
            control,
            listen,
        } = self;

        let clients = {
            let registry = registry.clone();
            let delegator = delegator.clone();
            accept_loop(control, "control", move |conn, peer| {
                let channel = Arc::new(RpcChannel::new(conn, peer));
                handle(channel, registry.clone(), delegator.clone())
            })
        };
        let children = accept_loop(listen, "registration", move |conn, peer| {
            let channel = Arc::new(RpcChannel::new(conn, peer));
            handle(channel, registry.clone(), delegator.clone())
        });

        tokio::join!(clients, children);
        Ok(())
    }
}

async fn handle(channel: Arc<RpcChannel>, registry: Arc<SlaveRegistry>, delegator: Arc<Delegator>) {
    let result = async {
        let hello: Hello = channel.recv("hello").await?;
        match hello {
            Hello::Register(vital) => serve_registration(channel.clone(), vital, registry).await,
            Hello::Submit => {
                let req: CommandRequest = channel.recv("submit").await?;
                let reply = submit(&delegator, &req).await;
                channel.send("reply", &reply).await.map(|_| ())
            }
            Hello::Info => {
                let reply = InfoReply {
                    nodes: registry.snapshot(),
                };
                channel.send("info", &reply).await.map(|_| ())
            }
            Hello::Exec => Err(RpcError::Unexpected {
                peer: channel.peer().to_string(),
                wanted: "register, submit or info",
                got: "exec",
            }),
        }
    };

    if let Err(e) = result.await {
        tracing::warn!("connection from {}: {}", channel.peer(), e);
    }
}

/// Validate and dispatch one client command.
///
/// The request's relay stays the client's own: the master's children write
/// straight to it.
pub async fn submit(delegator: &Delegator, req: &CommandRequest) -> SubmitReply {
    if let Err(e) = nodespec::validate(&req.nodes) {
        tracing::info!("rejected '{}': {}", req.nodes, e);
        return SubmitReply::Rejected(e.to_string());
    }
    if delegator.registry().is_empty() {
        return SubmitReply::Rejected(NO_HOSTS.to_string());
    }

    match delegator.delegate(req).await {
        Ok(0) => SubmitReply::Rejected(NO_HOSTS.to_string()),
        Ok(n) => {
            tracing::info!("dispatched {:?} to {} node(s)", req.argv, n);
            SubmitReply::Dispatched(n)
        }
        Err(e) => SubmitReply::Rejected(e.to_string()),
    }
}
