//! Interior and leaf nodes.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, mpsc};

use arbor_types::{CommandRequest, ExecAck, Hello, RegisterAck, VitalData};

use super::{NodeError, accept_loop, serve_registration};
use crate::config::NodeConfig;
use crate::delegate::Delegator;
use crate::launch::{self, LaunchError, LaunchPlan};
use crate::locale::{Locale, StaticLocale};
use crate::registry::SlaveRegistry;
use crate::relay::{IoRelay, SharedSink, shared_sink};
use crate::rpc::{RpcChannel, RpcError};
use crate::transport::{Endpoint, Listener, TransportError, reachable_addr};

/// A registered node serving its parent's commands and its own children.
pub struct Worker {
    node: Arc<Node>,
    listener: Listener,
    parent: Arc<RpcChannel>,
}

/// State shared by every connection a worker serves.
struct Node {
    id: String,
    parent_addr: String,
    private_dir: PathBuf,
    lib_path: Vec<String>,
    private_namespace: bool,
    launcher: Option<PathBuf>,
    relay_bind: Endpoint,
    registry: Arc<SlaveRegistry>,
    delegator: Delegator,
    /// One command owns the private directory at a time.
    exec_lock: Mutex<()>,
}

impl Worker {
    /// Bind the listener, register with the parent and learn our id.
    ///
    /// Addresses come straight from `config`.
    pub async fn start(config: &NodeConfig) -> Result<Self, NodeError> {
        Self::start_in(config, &StaticLocale::from_config(config)).await
    }

    /// Like [`Worker::start`], with the parent and listen addresses looked
    /// up in `locale`.
    pub async fn start_in(config: &NodeConfig, locale: &dyn Locale) -> Result<Self, NodeError> {
        let parent_addr = locale.parent_address().ok_or(NodeError::NoParent)?;
        let listen = Endpoint::parse(&locale.self_address());
        let listener = listen.bind().await?;
        let server_addr = listener.local_endpoint().map_err(|source| TransportError::Bind {
            addr: listen.to_string(),
            source,
        })?;

        let parent = RpcChannel::connect(&Endpoint::parse(&parent_addr))
            .await
            .map_err(|source| NodeError::Register {
                parent: parent_addr.clone(),
                source,
            })?;

        let vital = VitalData::new(&config.id, server_addr.to_string());
        let registered = async {
            parent.send("hello", &Hello::Register(vital)).await?;
            parent.recv::<RegisterAck>("ack").await
        };
        let ack = registered.await.map_err(|source| NodeError::Register {
            parent: parent_addr.clone(),
            source,
        })?;
        tracing::info!("registered with {} as {}", parent_addr, ack.id);

        let private_dir = match &config.private_dir {
            Some(dir) => dir.clone(),
            None => crate::paths::private_dir(&ack.id),
        };
        if private_dir.as_os_str().is_empty() || private_dir == Path::new("/") {
            return Err(NodeError::UnsafePrivateDir(private_dir));
        }

        let registry = Arc::new(SlaveRegistry::new());
        let delegator = Delegator::new(registry.clone(), &private_dir).with_chunk_size(config.chunk_size);

        let node = Node {
            id: ack.id,
            parent_addr,
            private_dir,
            lib_path: config.lib_path.clone(),
            private_namespace: config.private_namespace,
            launcher: config.launcher.clone(),
            relay_bind: config.relay_endpoint(),
            registry,
            delegator,
            exec_lock: Mutex::new(()),
        };

        Ok(Self {
            node: Arc::new(node),
            listener,
            parent: Arc::new(parent),
        })
    }

    pub fn id(&self) -> &str {
        &self.node.id
    }

    pub fn private_dir(&self) -> &Path {
        &self.node.private_dir
    }

    pub fn registry(&self) -> &Arc<SlaveRegistry> {
        &self.node.registry
    }

    pub fn listen_endpoint(&self) -> io::Result<Endpoint> {
        self.listener.local_endpoint()
    }

    /// Serve until the parent goes away or isolation breaks.
    ///
    /// Both end the node with an error; a supervisor is expected to restart it.
    pub async fn serve(self) -> Result<(), NodeError> {
        let Self { node, listener, parent } = self;
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<NodeError>(1);

        let connections = {
            let node = node.clone();
            accept_loop(listener, "worker", move |conn, peer| {
                let channel = Arc::new(RpcChannel::new(conn, peer).with_root(&node.private_dir));
                handle(channel, node.clone(), fatal_tx.clone())
            })
        };

        tokio::select! {
            _ = connections => Ok(()),
            closed = parent.wait_closed() => {
                if let Err(e) = closed {
                    tracing::debug!("parent connection error: {}", e);
                }
                tracing::error!("node {} lost its parent {}", node.id, node.parent_addr);
                Err(NodeError::ParentLost(node.parent_addr.clone()))
            }
            Some(e) = fatal_rx.recv() => {
                tracing::error!("node {} cannot continue: {}", node.id, e);
                Err(e)
            }
        }
    }
}

async fn handle(channel: Arc<RpcChannel>, node: Arc<Node>, fatal: mpsc::Sender<NodeError>) {
    let hello = match channel.recv::<Hello>("hello").await {
        Ok(hello) => hello,
        Err(e) => {
            tracing::warn!("connection from {}: {}", channel.peer(), e);
            return;
        }
    };

    let result = match hello {
        Hello::Register(vital) => serve_registration(channel.clone(), vital, node.registry.clone())
            .await
            .map_err(NodeError::from),
        Hello::Exec => node.exec(&channel).await,
        other => Err(NodeError::Rpc(RpcError::Unexpected {
            peer: channel.peer().to_string(),
            wanted: "register or exec",
            got: other.label(),
        })),
    };

    match result {
        Ok(()) => {}
        Err(e @ NodeError::Launch(LaunchError::Namespace { .. })) => {
            let _ = fatal.send(e).await;
        }
        Err(e) => tracing::warn!("connection from {}: {}", channel.peer(), e),
    }
}

impl Node {
    /// Run one delegated command: stage, fan out, launch, collect.
    async fn exec(&self, channel: &RpcChannel) -> Result<(), NodeError> {
        let _owner = self.exec_lock.lock().await;
        reset_dir(&self.private_dir).await?;

        let mut req: CommandRequest = channel.recv("exec").await?;
        // Every relay we are told about lives on our parent's host.
        req.peer = reachable_addr(&req.peer, &self.parent_addr);
        // Without this the parent answers for us on the relay.
        channel.send("ack", &ExecAck { id: self.id.clone() }).await?;
        tracing::info!("node {} running {:?} for '{}'", self.id, req.argv, req.nodes);

        let upstream = Endpoint::parse(&req.peer).connect().await?;
        let sink = shared_sink(upstream);

        let children = if req.nodes != self.id {
            self.fan_out(&req, &sink).await
        } else {
            None
        };

        let plan = LaunchPlan::for_request(&req, &self.private_dir, &self.lib_path, self.private_namespace)
            .with_launcher(self.launcher.clone());
        let launched = launch::run(&plan, sink.clone(), &self.id).await;

        if let Some(children) = children {
            let summary = children.wait().await;
            tracing::debug!(
                "node {}: {} child stream(s) done, {} failed",
                self.id,
                summary.completed,
                summary.failed
            );
        }

        if let Err(e) = sink.lock().await.shutdown().await {
            tracing::debug!("closing upstream {}: {}", req.peer, e);
        }
        launched?;
        Ok(())
    }

    /// Delegate to our own children with output routed through a local relay.
    async fn fan_out(&self, req: &CommandRequest, sink: &SharedSink) -> Option<crate::relay::Completions> {
        let relay = match IoRelay::bind(&self.relay_bind).await {
            Ok(relay) => relay,
            Err(e) => {
                tracing::warn!("node {}: cannot open relay: {}", self.id, e);
                return None;
            }
        };

        let forwarded = req.clone().with_peer(relay.endpoint().to_string());
        match self.delegator.delegate(&forwarded).await {
            Ok(n) => Some(relay.start(n, sink.clone())),
            Err(e) => {
                let msg = format!("arbor: node {}: {}\n", self.id, e);
                let _ = sink.lock().await.write_all(msg.as_bytes()).await;
                None
            }
        }
    }
}

/// Empty `dir`, creating it if needed.
async fn reset_dir(dir: &Path) -> Result<(), NodeError> {
    let ctx = |source| NodeError::PrivateDir {
        path: dir.to_path_buf(),
        source,
    };
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(ctx(e)),
    }
    tokio::fs::create_dir_all(dir).await.map_err(ctx)
}
