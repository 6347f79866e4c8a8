//! Building [`FileRecord`]s from the local filesystem.

use std::collections::HashSet;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tokio::fs;

use arbor_types::{FileKind, FileRecord};

/// Describe the object at `path` without following a final symlink.
///
/// The record's `name` is the absolute path; its `source` is left empty, so
/// it is metadata only until a forwarding node re-points it.
pub async fn stat_record(path: &Path) -> io::Result<FileRecord> {
    let name = std::path::absolute(path)?;
    let meta = fs::symlink_metadata(&name).await?;
    let ft = meta.file_type();

    let kind = if ft.is_symlink() {
        FileKind::Symlink
    } else if ft.is_dir() {
        FileKind::Directory
    } else if ft.is_file() {
        FileKind::Regular
    } else {
        FileKind::Other
    };

    let mut rec = FileRecord::new(name, kind)
        .with_mode(meta.permissions().mode() & 0o7777)
        .with_owner(meta.uid(), meta.gid());
    if kind == FileKind::Symlink {
        rec = rec.with_link(fs::read_link(path).await?);
    }
    Ok(rec)
}

/// Records for `paths`, their symlink targets, and everything under directories.
///
/// Each object appears once, in discovery order. Directories come before
/// their contents so a receiver creates them with the right mode first.
pub async fn collect(paths: &[PathBuf]) -> io::Result<Vec<FileRecord>> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut pending: Vec<PathBuf> = paths.iter().rev().cloned().collect();

    while let Some(path) = pending.pop() {
        let rec = stat_record(&path).await?;
        if !seen.insert(rec.name.clone()) {
            continue;
        }

        match rec.kind {
            FileKind::Directory => {
                let mut children = Vec::new();
                let mut entries = fs::read_dir(&rec.name).await?;
                while let Some(entry) = entries.next_entry().await? {
                    children.push(entry.path());
                }
                children.sort();
                pending.extend(children.into_iter().rev());
            }
            FileKind::Symlink => {
                // The link alone is useless on a node without its target.
                if let Ok(target) = fs::canonicalize(&rec.name).await {
                    pending.push(target);
                }
            }
            _ => {}
        }
        out.push(rec);
    }

    Ok(out)
}

/// Find `program` the way a shell would.
///
/// Anything containing a `/` is taken as a path. Otherwise each directory of
/// `search` (a `PATH`-style list) is tried for an executable regular file.
pub fn resolve_in_path(program: &str, search: &str) -> Option<PathBuf> {
    if program.contains('/') {
        return Some(PathBuf::from(program));
    }
    search
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
