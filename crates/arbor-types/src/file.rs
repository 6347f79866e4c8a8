//! File records and the capability to enumerate them inside a message.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Kind of filesystem object described by a [`FileRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    /// Sockets, devices, fifos. Described but never transferred.
    Other,
}

impl FileKind {
    /// Whether objects of this kind carry a chunk stream on the wire.
    pub fn has_content(self) -> bool {
        matches!(self, FileKind::Regular)
    }
}

impl std::fmt::Display for FileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileKind::Regular => write!(f, "file"),
            FileKind::Directory => write!(f, "dir"),
            FileKind::Symlink => write!(f, "symlink"),
            FileKind::Other => write!(f, "other"),
        }
    }
}

/// One filesystem object to transfer along with a command.
///
/// `name` is where the object lives in the canonical tree (e.g. `/bin/echo`);
/// every receiver materializes it under its own root at `<root>/<name>`.
/// `source` is where the *current* sender reads it from. An empty `source`
/// means the record is metadata only on this hop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub name: PathBuf,
    #[serde(default)]
    pub source: PathBuf,
    pub kind: FileKind,
    pub uid: u32,
    pub gid: u32,
    /// Permission bits (`st_mode & 0o7777`).
    pub mode: u32,
    /// Symlink target, only meaningful for [`FileKind::Symlink`].
    #[serde(default)]
    pub link: Option<PathBuf>,
}

impl FileRecord {
    /// Create a record with default ownership and permissions for `kind`.
    pub fn new(name: impl Into<PathBuf>, kind: FileKind) -> Self {
        let mode = match kind {
            FileKind::Directory => 0o755,
            _ => 0o644,
        };
        Self {
            name: name.into(),
            source: PathBuf::new(),
            kind,
            uid: 0,
            gid: 0,
            mode,
            link: None,
        }
    }

    /// Set the path the sender reads the object from.
    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    pub fn with_link(mut self, target: impl Into<PathBuf>) -> Self {
        self.link = Some(target.into());
        self
    }

    /// True when this record will be put on the wire by the current sender.
    pub fn is_transferable(&self) -> bool {
        !self.source.as_os_str().is_empty() && self.kind != FileKind::Other
    }

    /// Where this record lands under `root`.
    pub fn destination(&self, root: &Path) -> PathBuf {
        rooted(root, &self.name)
    }
}

/// Join `path` under `root`, treating an absolute `path` as relative to `root`.
///
/// `..` components are dropped so a record can never escape its root.
pub fn rooted(root: &Path, path: &Path) -> PathBuf {
    let mut out = root.to_path_buf();
    for component in path.components() {
        if let Component::Normal(part) = component {
            out.push(part);
        }
    }
    out
}

/// Explicit enumeration of the file records embedded in a message.
///
/// Messages that carry no files keep the default (empty) implementation.
/// The marshaling layer walks these lists instead of inspecting the message
/// structure at runtime.
pub trait FileRefs {
    fn file_refs(&self) -> Vec<&FileRecord> {
        Vec::new()
    }

    fn file_refs_mut(&mut self) -> Vec<&mut FileRecord> {
        Vec::new()
    }
}

impl FileRefs for FileRecord {
    fn file_refs(&self) -> Vec<&FileRecord> {
        vec![self]
    }

    fn file_refs_mut(&mut self) -> Vec<&mut FileRecord> {
        vec![self]
    }
}

impl FileRefs for Vec<FileRecord> {
    fn file_refs(&self) -> Vec<&FileRecord> {
        self.iter().collect()
    }

    fn file_refs_mut(&mut self) -> Vec<&mut FileRecord> {
        self.iter_mut().collect()
    }
}

impl FileRefs for () {}
impl FileRefs for String {}
