//! The unit of dispatch: a command plus everything a node needs to run it.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::file::{FileRecord, FileRefs};

/// Address family of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Family {
    #[default]
    Tcp,
    Unix,
}

impl Family {
    /// Prefix marking a Unix domain socket path in endpoint text.
    pub const UNIX_PREFIX: &'static str = "unix:";

    /// Infer the family from endpoint text (`unix:/path` or `host:port`).
    pub fn of(addr: &str) -> Self {
        if addr.starts_with(Self::UNIX_PREFIX) {
            Family::Unix
        } else {
            Family::Tcp
        }
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Family::Tcp => write!(f, "tcp"),
            Family::Unix => write!(f, "unix"),
        }
    }
}

/// A command to run on every node selected by `nodes`.
///
/// Created once by the submitting client and adjusted at every hop: `nodes`
/// is narrowed to the sub-selection meant for the receiving child, `peer`
/// is rewritten to the forwarding node's own I/O relay, and file sources are
/// re-pointed at the forwarding node's copies.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Program and arguments. `argv[0]` is the executable path.
    pub argv: Vec<String>,
    /// Environment as `KEY=VALUE` strings.
    #[serde(default)]
    pub env: Vec<String>,
    /// Run `argv[0]` as an already-present local path instead of the staged copy.
    #[serde(default)]
    pub local_bin: bool,
    /// Node selection this request is addressed to.
    pub nodes: String,
    /// I/O relay endpoint the executing node sends its output to.
    pub peer: String,
    #[serde(default)]
    pub peer_family: Family,
    /// Working directory for the process. Empty means the private directory.
    #[serde(default)]
    pub cwd: PathBuf,
    /// Library search list, relative to the staging root.
    #[serde(default)]
    pub lib_path: Vec<String>,
    /// Files the command needs.
    ///
    /// A regular file the sending node cannot read travels as an empty file,
    /// so the stream stays in step; the sender logs a warning naming it.
    #[serde(default)]
    pub files: Vec<FileRecord>,
    /// Run inside a private mount namespace.
    #[serde(default)]
    pub private: bool,
}

impl CommandRequest {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            ..Default::default()
        }
    }

    pub fn with_nodes(mut self, nodes: impl Into<String>) -> Self {
        self.nodes = nodes.into();
        self
    }

    /// Point output at the relay listening on `peer`.
    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        let peer = peer.into();
        self.peer_family = Family::of(&peer);
        self.peer = peer;
        self
    }

    pub fn with_files(mut self, files: Vec<FileRecord>) -> Self {
        self.files = files;
        self
    }

    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    /// The executable, if any.
    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }
}

impl FileRefs for CommandRequest {
    fn file_refs(&self) -> Vec<&FileRecord> {
        self.files.iter().collect()
    }

    fn file_refs_mut(&mut self) -> Vec<&mut FileRecord> {
        self.files.iter_mut().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileKind;

    #[test]
    fn test_family_of() {
        assert_eq!(Family::of("unix:/run/arbor/master.sock"), Family::Unix);
        assert_eq!(Family::of("10.0.0.1:6666"), Family::Tcp);
    }

    #[test]
    fn test_with_peer_sets_family() {
        let req = CommandRequest::new(vec!["/bin/date".into()]).with_peer("unix:/tmp/relay");
        assert_eq!(req.peer_family, Family::Unix);
        assert_eq!(req.program(), Some("/bin/date"));
    }

    #[test]
    fn test_request_round_trips_through_msgpack() {
        let req = CommandRequest::new(vec!["/bin/echo".into(), "hi".into()])
            .with_nodes("1-3/2")
            .with_peer("127.0.0.1:4000")
            .with_files(vec![FileRecord::new("/bin/echo", FileKind::Regular)]);

        let bytes = rmp_serde::to_vec(&req).unwrap();
        let back: CommandRequest = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, req);
    }
}
