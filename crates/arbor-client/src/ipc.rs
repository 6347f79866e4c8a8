//! Client that reaches the master over its control endpoint.
//!
//! Every call opens a fresh connection: one `Hello`, one request, one reply.
//! Output does not come back on that connection; it arrives on a relay the
//! client binds before submitting, one stream per node the master reached.

use async_trait::async_trait;

use arbor_kernel::nodespec;
use arbor_kernel::relay::{IoRelay, RelaySummary, SharedSink};
use arbor_kernel::{Endpoint, RpcChannel};
use arbor_types::{CommandRequest, Hello, InfoReply, SubmitReply};

use crate::traits::{ClientError, ClientResult, TreeClient};

/// What came of an `exec`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    /// Nodes the master dispatched to.
    pub dispatched: usize,
    /// Output streams collected.
    pub summary: RelaySummary,
}

/// A client connected to a master through its control endpoint.
#[derive(Debug, Clone)]
pub struct IpcClient {
    control: Endpoint,
    relay_bind: Endpoint,
}

impl IpcClient {
    /// `relay_bind` is where output relays listen; port 0 picks a free port.
    pub fn new(control: Endpoint, relay_bind: Endpoint) -> Self {
        Self { control, relay_bind }
    }

    pub fn control(&self) -> &Endpoint {
        &self.control
    }

    async fn open(&self, hello: Hello) -> ClientResult<RpcChannel> {
        let channel = RpcChannel::connect(&self.control).await?;
        channel.send("hello", &hello).await?;
        Ok(channel)
    }

    /// Run `req` on the nodes it names, copying all output into `sink`.
    ///
    /// Returns once every dispatched node has closed its output stream.
    pub async fn exec(&self, mut req: CommandRequest, sink: SharedSink) -> ClientResult<ExecOutcome> {
        nodespec::validate(&req.nodes)?;

        let relay = IoRelay::bind(&self.relay_bind).await?;
        req = req.with_peer(relay.endpoint().to_string());

        let dispatched = match self.submit(&req).await? {
            SubmitReply::Dispatched(n) => n,
            SubmitReply::Rejected(reason) => return Err(ClientError::Rejected(reason)),
        };
        tracing::debug!("master dispatched to {} node(s)", dispatched);

        let summary = relay.start(dispatched, sink).wait().await;
        Ok(ExecOutcome { dispatched, summary })
    }
}

#[async_trait]
impl TreeClient for IpcClient {
    async fn submit(&self, req: &CommandRequest) -> ClientResult<SubmitReply> {
        let channel = self.open(Hello::Submit).await?;
        channel.send("submit", req).await?;
        Ok(channel.recv("reply").await?)
    }

    async fn info(&self) -> ClientResult<InfoReply> {
        let channel = self.open(Hello::Info).await?;
        Ok(channel.recv("info").await?)
    }
}
