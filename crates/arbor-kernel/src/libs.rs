//! Shared library discovery for executables sent along with a command.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;

/// Finds the shared libraries a binary needs.
#[async_trait]
pub trait LibraryResolver: Send + Sync {
    /// Absolute paths of the libraries `binary` loads.
    ///
    /// `lib_path` entries are searched relative to `root` before the system
    /// defaults.
    async fn resolve_libraries(&self, binary: &Path, root: &Path, lib_path: &[String]) -> Result<Vec<String>>;
}

/// Sends no libraries. For static binaries or nodes with a shared system image.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLibraries;

#[async_trait]
impl LibraryResolver for NoLibraries {
    async fn resolve_libraries(&self, _binary: &Path, _root: &Path, _lib_path: &[String]) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Asks the system `ldd` which libraries the dynamic loader would pick.
#[derive(Debug, Clone, Copy, Default)]
pub struct LddResolver;

#[async_trait]
impl LibraryResolver for LddResolver {
    async fn resolve_libraries(&self, binary: &Path, root: &Path, lib_path: &[String]) -> Result<Vec<String>> {
        let search = library_search_path(root, lib_path);
        let mut cmd = tokio::process::Command::new("ldd");
        cmd.arg(binary).stdin(std::process::Stdio::null());
        if !search.is_empty() {
            cmd.env("LD_LIBRARY_PATH", &search);
        }

        let output = cmd
            .output()
            .await
            .with_context(|| format!("running ldd on {}", binary.display()))?;

        // ldd exits non-zero for static binaries and scripts; nothing to send.
        if !output.status.success() {
            tracing::debug!(
                "ldd {}: {}",
                binary.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Ok(Vec::new());
        }

        Ok(parse_ldd(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// `LD_LIBRARY_PATH` value for `lib_path` entries under `root`.
pub fn library_search_path(root: &Path, lib_path: &[String]) -> String {
    lib_path
        .iter()
        .map(|dir| arbor_types::rooted(root, Path::new(dir)))
        .map(|p: PathBuf| p.display().to_string())
        .collect::<Vec<_>>()
        .join(":")
}

/// Extract library paths from `ldd` output.
///
/// ```text
///     linux-vdso.so.1 (0x00007ffd...)                 skipped: no file
///     libc.so.6 => /lib/x86_64-linux-gnu/libc.so.6 (0x...)
///     /lib64/ld-linux-x86-64.so.2 (0x...)
///     libfoo.so => not found                           skipped
/// ```
pub fn parse_ldd(output: &str) -> Vec<String> {
    let mut libs = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        let candidate = match line.split_once("=>") {
            Some((_, rhs)) => rhs.trim(),
            None => line,
        };
        let Some(path) = candidate.split_whitespace().next() else {
            continue;
        };
        if path.starts_with('/') && !libs.iter().any(|l| l == path) {
            libs.push(path.to_string());
        }
    }
    libs
}
