//! Common trait for talking to the root of a tree.

use async_trait::async_trait;
use thiserror::Error;

use arbor_kernel::{NodeSpecError, RpcError, TransportError};
use arbor_types::{CommandRequest, InfoReply, SubmitReply};

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur when using a client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Could not reach the master or bind the output relay.
    #[error("connection error: {0}")]
    Connection(#[from] TransportError),

    /// The exchange with the master failed.
    #[error("protocol error: {0}")]
    Rpc(#[from] RpcError),

    /// The node spec was refused before anything was sent.
    #[error("{0}")]
    NodeSpec(#[from] NodeSpecError),

    /// The master refused the command.
    #[error("{0}")]
    Rejected(String),

    /// The program to run could not be found.
    #[error("{0}: command not found")]
    NotFound(String),

    /// A file that must travel with the command cannot be read here.
    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors.
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Operations a client can ask of the master.
#[async_trait]
pub trait TreeClient {
    /// Hand a command to the master. The request's `peer` must already name
    /// a bound relay.
    async fn submit(&self, req: &CommandRequest) -> ClientResult<SubmitReply>;

    /// List the master's registered children.
    async fn info(&self) -> ClientResult<InfoReply>;
}
