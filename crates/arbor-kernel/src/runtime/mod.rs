//! Node roles: the root (master) and interior or leaf nodes (workers).
//!
//! Both roles accept child registrations on their listen endpoint and keep
//! each registration connection open; a child is forgotten when that
//! connection closes or when delegating to it fails.
//!
//! ```text
//!   commands:  client ──▶ master ──▶ worker 1 ──▶ worker 1.1
//!   output:    client ◀──────────── worker 1 ◀── worker 1.1
//!              (relay)              (relay)
//! ```
//!
//! The master never touches output: its children write straight to the
//! client's relay, and every worker that delegates further opens its own.

mod master;
mod worker;

pub use master::Master;
pub use worker::Worker;

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use arbor_types::{RegisterAck, VitalData};

use crate::launch::LaunchError;
use crate::registry::SlaveRegistry;
use crate::rpc::{RpcChannel, RpcError};
use crate::transport::{Conn, Listener, TransportError, reachable_addr};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("lost connection to parent {0}")]
    ParentLost(String),

    #[error("no parent address for this node")]
    NoParent,

    #[error("registering with {parent}: {source}")]
    Register {
        parent: String,
        #[source]
        source: RpcError,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("private directory {path}: {source}")]
    PrivateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("refusing to use {0} as private directory")]
    UnsafePrivateDir(PathBuf),
}

/// Accept connections forever, handing each to `handler` on its own task.
async fn accept_loop<F, Fut>(listener: Listener, what: &'static str, handler: F)
where
    F: Fn(Conn, String) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    match listener.local_endpoint() {
        Ok(ep) => tracing::info!("{} listening on {}", what, ep),
        Err(e) => tracing::warn!("{} listening on unknown address: {}", what, e),
    }

    loop {
        match listener.accept().await {
            Ok((conn, peer)) => {
                tracing::trace!("{} accepted connection from {}", what, peer);
                tokio::spawn(handler(conn, peer));
            }
            Err(e) => {
                tracing::error!("{} failed to accept connection: {}", what, e);
            }
        }
    }
}

/// Run the parent side of a registration until the child goes away.
///
/// The child's server address is fixed up with the address it connected
/// from when it listens on an unspecified host.
async fn serve_registration(
    channel: Arc<RpcChannel>,
    mut vital: VitalData,
    registry: Arc<SlaveRegistry>,
) -> Result<(), RpcError> {
    let peer = channel.peer().to_string();
    if !vital.ready {
        tracing::warn!(
            "child at {} not ready: {}",
            peer,
            vital.error.as_deref().unwrap_or("no reason given")
        );
        return Ok(());
    }

    vital.server_addr = reachable_addr(&vital.server_addr, &peer);
    vital.host_addr = peer.clone();

    let info = registry.add(&vital, &peer, channel.clone());
    tracing::info!("child {} registered from {} (server {})", info.id, peer, info.server);

    channel.send("ack", &RegisterAck { id: info.id.clone() }).await?;

    if let Err(e) = channel.wait_closed().await {
        tracing::debug!("child {} connection error: {}", info.id, e);
    }
    if registry.remove_if_channel(&info.id, &channel).is_some() {
        tracing::info!("child {} disconnected", info.id);
    }
    Ok(())
}
