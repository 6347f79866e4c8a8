//! Connection openers, handshake records and replies.

use serde::{Deserialize, Serialize};

use crate::file::FileRefs;

/// First message on every connection to a node.
///
/// `Submit` and `Exec` are followed on the same connection by a marshaled
/// [`CommandRequest`](crate::CommandRequest).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Hello {
    /// A child registering with its parent. Answered with [`RegisterAck`].
    Register(VitalData),
    /// A client submitting a command to the root. Answered with [`SubmitReply`].
    Submit,
    /// A client asking the root for its children. Answered with [`InfoReply`].
    Info,
    /// A parent delegating a command. Answered with [`ExecAck`] once the
    /// request is in.
    Exec,
}

impl Hello {
    /// Short label used when logging channel traffic.
    pub fn label(&self) -> &'static str {
        match self {
            Hello::Register(_) => "register",
            Hello::Submit => "submit",
            Hello::Info => "info",
            Hello::Exec => "exec",
        }
    }
}

/// Handshake record a child sends when it registers with its parent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VitalData {
    /// Self-reported id. Empty asks the parent to assign one.
    pub id: String,
    /// Where the child accepts its own children and delegated commands.
    pub server_addr: String,
    /// The child's address as seen by the parent. Filled in by the parent.
    #[serde(default)]
    pub host_addr: String,
    /// Whether the child's host is ready to run commands.
    pub ready: bool,
    /// Host setup error, if any.
    #[serde(default)]
    pub error: Option<String>,
}

impl VitalData {
    pub fn new(id: impl Into<String>, server_addr: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            server_addr: server_addr.into(),
            host_addr: String::new(),
            ready: true,
            error: None,
        }
    }
}

/// Acknowledgment of a registration, carrying the confirmed id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterAck {
    pub id: String,
}

/// A child's confirmation that it holds a delegated command.
///
/// From here on the child owns its relay connection; before it, the parent
/// reports on the child's behalf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecAck {
    pub id: String,
}

/// Root's answer to a submitted command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmitReply {
    /// The command went out to this many children; expect as many relay connections.
    Dispatched(usize),
    /// Nothing was sent.
    Rejected(String),
}

/// One registered child, as reported by `info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub id: String,
    pub host_addr: String,
    pub server_addr: String,
}

/// Root's answer to `info`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InfoReply {
    pub nodes: Vec<NodeEntry>,
}

impl FileRefs for Hello {}
impl FileRefs for VitalData {}
impl FileRefs for RegisterAck {}
impl FileRefs for ExecAck {}
impl FileRefs for SubmitReply {}
impl FileRefs for InfoReply {}
