//! Filesystem locations used by arbor nodes.
//!
//! | Purpose | Location | Fallback |
//! |---------|----------|----------|
//! | Control socket | `$XDG_RUNTIME_DIR/arbor/master.sock` | `$TMPDIR/arbor/master.sock` |
//! | Config file | `$XDG_CONFIG_HOME/arbor/node.toml` | `~/.config/arbor/node.toml` |
//! | Private dir | `$TMPDIR/arbor-<id>` | |
//!
//! Nothing here is persistent: the private directory is wiped before every
//! command it hosts.

use std::path::PathBuf;

use directories::BaseDirs;

/// Get the user's home directory.
///
/// Returns `$HOME` or falls back to `/tmp` if not set.
pub fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

/// Get XDG config home directory.
pub fn xdg_config_home() -> PathBuf {
    BaseDirs::new()
        .map(|d| d.config_dir().to_path_buf())
        .unwrap_or_else(|| home_dir().join(".config"))
}

/// Get XDG runtime directory, falling back to the system temp directory.
pub fn xdg_runtime_dir() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir())
}

/// Directory holding arbor's sockets.
pub fn runtime_dir() -> PathBuf {
    xdg_runtime_dir().join("arbor")
}

/// Default client control endpoint of the root node.
pub fn control_socket() -> PathBuf {
    runtime_dir().join("master.sock")
}

/// Default config file location.
pub fn config_file() -> PathBuf {
    xdg_config_home().join("arbor").join("node.toml")
}

/// Default private directory for a node.
///
/// Ids may be user-chosen text, so anything outside `[A-Za-z0-9._-]` is
/// replaced to keep the result a single path component.
pub fn private_dir(id: &str) -> PathBuf {
    let safe: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let name = if safe.is_empty() || safe.chars().all(|c| c == '.') {
        "arbor-node".to_string()
    } else {
        format!("arbor-{safe}")
    };
    std::env::temp_dir().join(name)
}
