//! Node configuration.
//!
//! Loaded from `~/.config/arbor/node.toml` when present, then overridden by
//! command-line flags. Any string value beginning with `=` is a program for the
//! expression evaluator, resolved once at startup by [`NodeConfig::resolve`].

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::eval::{Evaluator, resolve_value};
use crate::marshal::{CHUNK_SIZE, MAX_CHUNK_SIZE};
use crate::paths;
use crate::transport::Endpoint;

/// Configuration shared by every node role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node id reported at registration. Empty lets the parent assign one.
    pub id: String,

    /// Parent registration endpoint (workers only).
    pub parent: String,

    /// Where this node accepts registrations and delegated commands.
    pub listen: String,

    /// Root's client control endpoint; also where clients connect.
    pub control: String,

    /// Bind address for relays this node opens. Port 0 picks a free port.
    pub relay_bind: String,

    /// Staging area for received files. Wiped before every command.
    pub private_dir: Option<PathBuf>,

    /// Where the canonical file tree lives on this node. `/` on the root.
    pub root: Option<PathBuf>,

    /// Library directories, relative to the staging root.
    pub lib_path: Vec<String>,

    /// Always isolate launched commands in a private mount namespace.
    pub private_namespace: bool,

    /// Binary re-executed in the `launch` role for isolated commands.
    /// Defaults to the running executable.
    pub launcher: Option<PathBuf>,

    /// File content chunk size on the wire.
    pub chunk_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            parent: String::new(),
            listen: "0.0.0.0:6666".to_string(),
            control: format!("unix:{}", paths::control_socket().display()),
            relay_bind: "0.0.0.0:0".to_string(),
            private_dir: None,
            root: None,
            lib_path: vec!["lib".into(), "usr/lib".into(), "lib64".into(), "usr/lib64".into()],
            private_namespace: false,
            launcher: None,
            chunk_size: CHUNK_SIZE,
        }
    }
}

impl NodeConfig {
    /// Load configuration from the default path.
    ///
    /// If the config file doesn't exist, returns default configuration.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();

        if !path.exists() {
            tracing::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Get the default config file path.
    pub fn config_path() -> PathBuf {
        paths::config_file()
    }

    /// Apply one `--key=value` override. Returns false for unknown keys.
    pub fn set(&mut self, key: &str, value: &str) -> Result<bool> {
        match key {
            "id" => self.id = value.to_string(),
            "parent" => self.parent = value.to_string(),
            "listen" => self.listen = value.to_string(),
            "control" => self.control = value.to_string(),
            "relay-bind" | "relay_bind" => self.relay_bind = value.to_string(),
            "private-dir" | "private_dir" => self.private_dir = Some(PathBuf::from(value)),
            "root" => self.root = Some(PathBuf::from(value)),
            "lib-path" | "lib_path" => {
                self.lib_path = value.split(':').filter(|s| !s.is_empty()).map(String::from).collect()
            }
            "private-namespace" | "private_namespace" => {
                self.private_namespace = value
                    .parse()
                    .with_context(|| format!("private namespace '{value}' is not true or false"))?
            }
            "launcher" => self.launcher = Some(PathBuf::from(value)),
            "chunk-size" | "chunk_size" => {
                self.chunk_size = value
                    .parse()
                    .with_context(|| format!("chunk size '{value}' is not a number"))?
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Evaluate `=program` values in place.
    pub async fn resolve(&mut self, evaluator: &dyn Evaluator) -> Result<()> {
        self.id = resolve_value(&self.id, evaluator).await.context("evaluating id")?;
        self.parent = resolve_value(&self.parent, evaluator)
            .await
            .context("evaluating parent")?;
        self.listen = resolve_value(&self.listen, evaluator)
            .await
            .context("evaluating listen")?;
        Ok(())
    }

    /// Reject settings no node can run with.
    pub fn validate(&self) -> Result<()> {
        if let Some(dir) = &self.private_dir
            && (dir.as_os_str().is_empty() || dir == Path::new("/"))
        {
            bail!("private directory must not be '/' or empty");
        }
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            bail!("chunk size must be between 1 and {MAX_CHUNK_SIZE}");
        }
        Ok(())
    }

    /// The private directory, defaulting to one derived from the id.
    pub fn private_dir(&self) -> PathBuf {
        self.private_dir
            .clone()
            .unwrap_or_else(|| paths::private_dir(&self.id))
    }

    pub fn control_endpoint(&self) -> Endpoint {
        Endpoint::parse(&self.control)
    }

    pub fn listen_endpoint(&self) -> Endpoint {
        Endpoint::parse(&self.listen)
    }

    pub fn relay_endpoint(&self) -> Endpoint {
        Endpoint::parse(&self.relay_bind)
    }
}
