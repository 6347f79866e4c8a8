//! Building a [`CommandRequest`] from a command line.
//!
//! The builder finds the program, works out which files must travel with it
//! and captures the environment and working directory of the caller.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arbor_kernel::files;
use arbor_kernel::{LddResolver, LibraryResolver};
use arbor_types::{CommandRequest, FileKind};

use crate::traits::{ClientError, ClientResult};

/// Assembles a request for `arbor exec`.
pub struct RequestBuilder {
    argv: Vec<String>,
    nodes: String,
    extra_files: Vec<PathBuf>,
    env: Option<Vec<String>>,
    env_overrides: Vec<String>,
    private: bool,
    local: bool,
    lib_path: Vec<String>,
    search_path: Option<String>,
    cwd: Option<PathBuf>,
    resolver: Arc<dyn LibraryResolver>,
}

impl RequestBuilder {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            nodes: ".".into(),
            extra_files: Vec::new(),
            env: None,
            env_overrides: Vec::new(),
            private: false,
            local: false,
            lib_path: Vec::new(),
            search_path: None,
            cwd: None,
            resolver: Arc::new(LddResolver),
        }
    }

    pub fn nodes(mut self, spec: impl Into<String>) -> Self {
        self.nodes = spec.into();
        self
    }

    /// Send `path` along with the command. Directories go with their contents.
    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.extra_files.push(path.into());
        self
    }

    /// Replace the inherited environment entirely.
    pub fn env(mut self, env: Vec<String>) -> Self {
        self.env = Some(env);
        self
    }

    /// Set one `KEY=VALUE` on top of the environment.
    pub fn set_env(mut self, entry: impl Into<String>) -> Self {
        self.env_overrides.push(entry.into());
        self
    }

    pub fn private(mut self, private: bool) -> Self {
        self.private = private;
        self
    }

    /// Run the program already present on each node instead of shipping it.
    pub fn local(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    pub fn lib_path(mut self, lib_path: Vec<String>) -> Self {
        self.lib_path = lib_path;
        self
    }

    /// `PATH`-style list used to find the program. Defaults to `$PATH`.
    pub fn search_path(mut self, search: impl Into<String>) -> Self {
        self.search_path = Some(search.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn LibraryResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Resolve the program and collect every file the command needs.
    pub async fn build(self) -> ClientResult<CommandRequest> {
        let Some(program) = self.argv.first().cloned() else {
            return Err(ClientError::Other(anyhow::anyhow!("no command given")));
        };

        let mut argv = self.argv;
        let mut wanted = Vec::new();
        if !self.local {
            let search = self
                .search_path
                .unwrap_or_else(|| std::env::var("PATH").unwrap_or_default());
            let path = files::resolve_in_path(&program, &search)
                .ok_or_else(|| ClientError::NotFound(program.clone()))?;
            let path = std::path::absolute(&path)?;
            if !path.is_file() {
                return Err(ClientError::NotFound(program));
            }

            let libs = self
                .resolver
                .resolve_libraries(&path, Path::new("/"), &self.lib_path)
                .await?;
            tracing::debug!("{} needs {} librar(ies)", path.display(), libs.len());

            argv[0] = path.display().to_string();
            wanted.push(path);
            wanted.extend(libs.into_iter().map(PathBuf::from));
        }
        wanted.extend(self.extra_files);

        let records = files::collect(&wanted).await?;
        // Nodes would receive an unreadable file as an empty one.
        for rec in records.iter().filter(|rec| rec.kind == FileKind::Regular) {
            if let Err(source) = tokio::fs::File::open(&rec.name).await {
                return Err(ClientError::Unreadable {
                    path: rec.name.clone(),
                    source,
                });
            }
        }

        let mut env = self
            .env
            .unwrap_or_else(|| std::env::vars().map(|(k, v)| format!("{k}={v}")).collect());
        for entry in self.env_overrides {
            apply_override(&mut env, entry);
        }

        let cwd = match self.cwd {
            Some(cwd) => cwd,
            None => std::env::current_dir()?,
        };

        let mut req = CommandRequest::new(argv)
            .with_nodes(self.nodes)
            .with_files(records)
            .with_env(env);
        req.local_bin = self.local;
        req.private = self.private;
        req.lib_path = self.lib_path;
        req.cwd = cwd;
        Ok(req)
    }
}

/// Replace the entry for `entry`'s key, or append it.
fn apply_override(env: &mut Vec<String>, entry: String) {
    let key = entry.split('=').next().unwrap_or_default();
    let prefix = format!("{key}=");
    match env.iter_mut().find(|e| e.starts_with(&prefix)) {
        Some(slot) => *slot = entry,
        None => env.push(entry),
    }
}
