//! Topology lookup: where a node's parent is and where the node itself listens.

use anyhow::Result;

use crate::config::NodeConfig;

/// Which part a process plays in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Worker,
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Worker => write!(f, "worker"),
            Role::Client => write!(f, "client"),
        }
    }
}

/// Source of topology information.
///
/// Sites with a cluster database plug their own lookup in here.
pub trait Locale: Send + Sync {
    /// Prepare for `role`. Called once before any address is asked for.
    fn init(&self, role: Role) -> Result<()>;

    /// Registration endpoint of the parent, if this node has one.
    fn parent_address(&self) -> Option<String>;

    /// Where this node listens for its own children and delegated commands.
    fn self_address(&self) -> String;
}

/// Addresses taken straight from configuration.
#[derive(Debug, Clone)]
pub struct StaticLocale {
    parent: String,
    listen: String,
}

impl StaticLocale {
    pub fn new(parent: impl Into<String>, listen: impl Into<String>) -> Self {
        Self {
            parent: parent.into(),
            listen: listen.into(),
        }
    }

    pub fn from_config(config: &NodeConfig) -> Self {
        Self::new(&config.parent, &config.listen)
    }
}

impl Locale for StaticLocale {
    fn init(&self, role: Role) -> Result<()> {
        if role == Role::Worker && self.parent.is_empty() {
            anyhow::bail!("a worker needs a parent address (--parent=host:port)");
        }
        tracing::debug!("static locale for {}: parent={:?} listen={}", role, self.parent, self.listen);
        Ok(())
    }

    fn parent_address(&self) -> Option<String> {
        (!self.parent.is_empty()).then(|| self.parent.clone())
    }

    fn self_address(&self) -> String {
        self.listen.clone()
    }
}
