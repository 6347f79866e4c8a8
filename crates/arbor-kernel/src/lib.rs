//! arbor-kernel: the machinery behind hierarchical command fan-out.
//!
//! This crate provides:
//!
//! - **NodeSpec**: the node selection language (`1-3/1-40,7,.`)
//! - **Transport**: TCP and Unix endpoints behind one stream type
//! - **Marshal**: typed messages plus referenced files on one byte stream
//! - **RPC**: a message channel between two nodes
//! - **Registry**: children indexed by id and server address
//! - **Delegate**: fan-out of a command to the selected children
//! - **Relay**: collection of many output streams into one
//! - **Launch**: running a staged command, optionally in a private namespace
//! - **Runtime**: the master and worker roles
//! - **Config / Paths**: node configuration and XDG locations
//!
//! External collaborators sit behind small traits: [`Locale`] for topology,
//! [`Evaluator`] for `=program` values and [`LibraryResolver`] for shared
//! library discovery.

pub mod config;
pub mod delegate;
pub mod eval;
pub mod files;
pub mod launch;
pub mod libs;
pub mod locale;
pub mod marshal;
pub mod namespace;
pub mod nodespec;
pub mod paths;
pub mod registry;
pub mod relay;
pub mod rpc;
pub mod runtime;
pub mod transport;

pub use config::NodeConfig;
pub use delegate::Delegator;
pub use eval::{Evaluator, NoEvaluator, ShellEvaluator};
pub use launch::{LaunchError, LaunchPlan};
pub use libs::{LddResolver, LibraryResolver, NoLibraries};
pub use locale::{Locale, Role, StaticLocale};
pub use marshal::{Decoder, Encoder, MarshalError};
pub use nodespec::{NodeSpecError, Selection};
pub use registry::{SlaveInfo, SlaveRegistry};
pub use relay::{Completions, IoRelay, RelaySummary, SharedSink, shared_sink};
pub use rpc::{RpcChannel, RpcError};
pub use runtime::{Master, NodeError, Worker};
pub use transport::{Conn, Endpoint, Listener, TransportError};
