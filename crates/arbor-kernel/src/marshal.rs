//! Marshaling: one typed message plus the files it references, on one stream.
//!
//! # Wire format
//!
//! ```text
//! [value: message] [value: Vec<source path>] [chunks for file 1] [chunks for file 2] ...
//!
//! value  = [u32 BE len][MessagePack body]
//! chunks = [u32 BE len][bytes] ... [u32 BE 0]      (regular files only)
//! ```
//!
//! The identifier list holds every transferable record's `source`, each once,
//! in first-seen order. Directories and symlinks appear in the list but carry
//! no chunk stream; their record metadata is all the receiver needs.
//!
//! There is no version byte. Both ends must agree on the message schema.
//!
//! The decoder reuses one chunk buffer, so a file of any size costs one chunk
//! of memory. The encoder opens each source once no matter how many records
//! point at it.

use std::collections::HashMap;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use arbor_types::{FileKind, FileRecord, FileRefs, rooted};

/// Chunk size used when streaming file content.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Largest chunk a decoder accepts. Senders may pick any size up to this.
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Largest encoded value a decoder accepts.
pub const MAX_VALUE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum MarshalError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("manifest mismatch: no record in the message has source {0}")]
    ManifestMismatch(PathBuf),

    #[error("{path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("message carries {0} file(s) but no destination root is set")]
    NoRoot(usize),
}

pub type MarshalResult<T> = Result<T, MarshalError>;

/// Counters from one marshal or unmarshal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Distinct objects on the identifier list.
    pub files: usize,
    /// File content bytes streamed.
    pub bytes: u64,
}

/// Collect the transferable sources of a message, deduplicated, first-seen order.
pub fn manifest<M: FileRefs + ?Sized>(msg: &M) -> Vec<(PathBuf, FileKind)> {
    let mut seen = HashMap::new();
    let mut out = Vec::new();
    for rec in msg.file_refs() {
        if !rec.is_transferable() {
            continue;
        }
        if seen.insert(rec.source.clone(), ()).is_none() {
            out.push((rec.source.clone(), rec.kind));
        }
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════════
// Encoding
// ═══════════════════════════════════════════════════════════════════════════

/// Writes values, identifier lists and chunk streams to a byte stream.
pub struct Encoder<W> {
    writer: W,
    chunk_size: usize,
}

impl<W: AsyncWrite + Unpin> Encoder<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            chunk_size: CHUNK_SIZE,
        }
    }

    /// Use a different chunk size, clamped to what decoders accept.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.clamp(1, MAX_CHUNK_SIZE);
        self
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Encode one value as a length-prefixed MessagePack body.
    pub async fn encode_value<T: Serialize + ?Sized>(&mut self, value: &T) -> MarshalResult<()> {
        let body = rmp_serde::to_vec_named(value)?;
        if body.len() > MAX_VALUE_SIZE {
            return Err(MarshalError::FrameTooLarge {
                size: body.len(),
                limit: MAX_VALUE_SIZE,
            });
        }
        self.write_frame(&body).await
    }

    async fn write_frame(&mut self, bytes: &[u8]) -> MarshalResult<()> {
        self.writer.write_u32(bytes.len() as u32).await?;
        if !bytes.is_empty() {
            self.writer.write_all(bytes).await?;
        }
        Ok(())
    }

    /// Send `msg` followed by every file it references.
    pub async fn marshal<M>(&mut self, msg: &M) -> MarshalResult<TransferStats>
    where
        M: Serialize + FileRefs,
    {
        self.encode_value(msg).await?;

        let files = manifest(msg);
        let ids: Vec<&PathBuf> = files.iter().map(|(id, _)| id).collect();
        self.encode_value(&ids).await?;

        let mut stats = TransferStats {
            files: files.len(),
            bytes: 0,
        };
        for (source, kind) in &files {
            if kind.has_content() {
                stats.bytes += self.stream_file(source).await?;
            }
        }

        self.writer.flush().await?;
        Ok(stats)
    }

    /// Stream one file as chunks plus the terminator.
    ///
    /// A source that cannot be read still gets its terminator, so the stream
    /// stays in step with the identifier list already sent; the receiver ends
    /// up with a short file. Only write errors on the stream itself abort.
    async fn stream_file(&mut self, source: &Path) -> MarshalResult<u64> {
        let mut sent = 0u64;
        match fs::File::open(source).await {
            Ok(mut file) => {
                let mut buf = vec![0u8; self.chunk_size];
                loop {
                    let n = match file.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) => {
                            tracing::warn!("reading {} stopped early: {}", source.display(), e);
                            break;
                        }
                    };
                    self.write_frame(&buf[..n]).await?;
                    sent += n as u64;
                }
            }
            Err(e) => {
                tracing::warn!("cannot open {}, sending it empty: {}", source.display(), e);
            }
        }
        self.write_frame(&[]).await?;
        Ok(sent)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Decoding
// ═══════════════════════════════════════════════════════════════════════════

/// Reads what an [`Encoder`] wrote.
pub struct Decoder<R> {
    reader: R,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> Decoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            chunk: Vec::new(),
        }
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    async fn read_len(&mut self, limit: usize) -> MarshalResult<usize> {
        let len = self.reader.read_u32().await? as usize;
        if len > limit {
            return Err(MarshalError::FrameTooLarge { size: len, limit });
        }
        Ok(len)
    }

    /// Decode one length-prefixed value.
    pub async fn decode_value<T: DeserializeOwned>(&mut self) -> MarshalResult<T> {
        let len = self.read_len(MAX_VALUE_SIZE).await?;
        let mut body = vec![0u8; len];
        self.reader.read_exact(&mut body).await?;
        Ok(rmp_serde::from_slice(&body)?)
    }

    /// Read the next chunk into the reusable buffer. `None` is the terminator.
    async fn next_chunk(&mut self) -> MarshalResult<Option<&[u8]>> {
        let len = self.read_len(MAX_CHUNK_SIZE).await?;
        if len == 0 {
            return Ok(None);
        }
        if self.chunk.len() < len {
            self.chunk.resize(len, 0);
        }
        self.reader.read_exact(&mut self.chunk[..len]).await?;
        Ok(Some(&self.chunk[..len]))
    }

    /// Receive a message and materialize its files under `root`.
    ///
    /// On return every record that arrived has its `source` pointing at the
    /// local copy. A manifest entry no record claims aborts the decode; the
    /// stream is then mid-message and the caller should drop it.
    pub async fn unmarshal<M>(&mut self, root: Option<&Path>) -> MarshalResult<(M, TransferStats)>
    where
        M: DeserializeOwned + FileRefs,
    {
        let mut msg: M = self.decode_value().await?;
        let ids: Vec<PathBuf> = self.decode_value().await?;

        let mut stats = TransferStats {
            files: ids.len(),
            bytes: 0,
        };
        if ids.is_empty() {
            return Ok((msg, stats));
        }
        let root = root.ok_or(MarshalError::NoRoot(ids.len()))?;

        for id in ids {
            let mut refs: Vec<&mut FileRecord> = msg
                .file_refs_mut()
                .into_iter()
                .filter(|rec| rec.is_transferable() && rec.source == id)
                .collect();
            if refs.is_empty() {
                return Err(MarshalError::ManifestMismatch(id));
            }

            let first = refs[0].clone();
            let dest = first.destination(root);
            stats.bytes += self.materialize(&first, &dest, root).await?;

            // Every further reference gets the same object at its own destination.
            for rec in refs.iter_mut() {
                let other = rec.destination(root);
                if other != dest {
                    duplicate(rec, &dest, &other, root).await?;
                }
                rec.source = other;
            }
        }

        Ok((msg, stats))
    }

    async fn materialize(&mut self, rec: &FileRecord, dest: &Path, root: &Path) -> MarshalResult<u64> {
        ensure_parent(dest).await?;
        match rec.kind {
            FileKind::Directory => {
                make_dir(rec, dest).await?;
                Ok(0)
            }
            FileKind::Symlink => {
                make_symlink(rec, dest, root).await?;
                Ok(0)
            }
            FileKind::Regular => self.receive_file(rec, dest).await,
            // Never listed by an encoder.
            FileKind::Other => Ok(0),
        }
    }

    async fn receive_file(&mut self, rec: &FileRecord, dest: &Path) -> MarshalResult<u64> {
        let ctx = |source| MarshalError::File {
            path: dest.to_path_buf(),
            source,
        };

        clear_non_dir(dest).await.map_err(ctx)?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(rec.mode)
            .open(dest)
            .await
            .map_err(ctx)?;

        let mut written = 0u64;
        loop {
            let chunk = match self.next_chunk().await? {
                Some(chunk) => chunk,
                None => break,
            };
            file.write_all(chunk).await.map_err(ctx)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(ctx)?;
        drop(file);

        // umask may have trimmed the mode at create time.
        fs::set_permissions(dest, std::fs::Permissions::from_mode(rec.mode))
            .await
            .map_err(ctx)?;
        chown_quiet(dest, rec, true);
        Ok(written)
    }
}

async fn ensure_parent(dest: &Path) -> MarshalResult<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await.map_err(|source| MarshalError::File {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

/// Remove whatever non-directory object sits at `path`.
async fn clear_non_dir(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path).await {
        Ok(meta) if !meta.is_dir() => fs::remove_file(path).await,
        _ => Ok(()),
    }
}

async fn make_dir(rec: &FileRecord, dest: &Path) -> MarshalResult<()> {
    let ctx = |source| MarshalError::File {
        path: dest.to_path_buf(),
        source,
    };
    fs::DirBuilder::new()
        .recursive(true)
        .mode(rec.mode)
        .create(dest)
        .await
        .map_err(ctx)?;
    fs::set_permissions(dest, std::fs::Permissions::from_mode(rec.mode))
        .await
        .map_err(ctx)?;
    chown_quiet(dest, rec, true);
    Ok(())
}

async fn make_symlink(rec: &FileRecord, dest: &Path, root: &Path) -> MarshalResult<()> {
    let ctx = |source| MarshalError::File {
        path: dest.to_path_buf(),
        source,
    };
    let Some(target) = rec.link.as_deref() else {
        return Err(ctx(io::Error::new(
            io::ErrorKind::InvalidData,
            "symlink record without a target",
        )));
    };

    // Absolute targets point into the canonical tree, which lives under root here.
    let target = if target.is_absolute() {
        rooted(root, target)
    } else {
        target.to_path_buf()
    };

    clear_non_dir(dest).await.map_err(ctx)?;
    fs::symlink(&target, dest).await.map_err(ctx)?;
    chown_quiet(dest, rec, false);
    Ok(())
}

/// Give a second destination the object already materialized at `first`.
async fn duplicate(rec: &FileRecord, first: &Path, dest: &Path, root: &Path) -> MarshalResult<()> {
    ensure_parent(dest).await?;
    match rec.kind {
        FileKind::Directory => make_dir(rec, dest).await,
        FileKind::Symlink => make_symlink(rec, dest, root).await,
        FileKind::Regular => {
            let ctx = |source| MarshalError::File {
                path: dest.to_path_buf(),
                source,
            };
            clear_non_dir(dest).await.map_err(ctx)?;
            fs::copy(first, dest).await.map_err(ctx)?;
            fs::set_permissions(dest, std::fs::Permissions::from_mode(rec.mode))
                .await
                .map_err(ctx)?;
            chown_quiet(dest, rec, true);
            Ok(())
        }
        FileKind::Other => Ok(()),
    }
}

/// Apply record ownership. Unprivileged nodes cannot chown, which is fine.
fn chown_quiet(path: &Path, rec: &FileRecord, follow: bool) {
    let result = if follow {
        std::os::unix::fs::chown(path, Some(rec.uid), Some(rec.gid))
    } else {
        std::os::unix::fs::lchown(path, Some(rec.uid), Some(rec.gid))
    };
    if let Err(e) = result {
        if e.kind() == io::ErrorKind::PermissionDenied {
            tracing::trace!("chown {} skipped: {}", path.display(), e);
        } else {
            tracing::warn!("chown {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_types::CommandRequest;

    fn record(name: &str, kind: FileKind, source: &str) -> FileRecord {
        FileRecord::new(name, kind).with_source(source)
    }

    #[test]
    fn test_manifest_dedups_in_first_seen_order() {
        let files = vec![
            record("/b", FileKind::Regular, "/src/b"),
            record("/a", FileKind::Regular, "/src/a"),
            record("/b2", FileKind::Regular, "/src/b"),
            FileRecord::new("/meta-only", FileKind::Regular),
            record("/dev/x", FileKind::Other, "/dev/x"),
        ];
        let ids: Vec<PathBuf> = manifest(&files).into_iter().map(|(p, _)| p).collect();
        assert_eq!(ids, vec![PathBuf::from("/src/b"), PathBuf::from("/src/a")]);
    }

    #[tokio::test]
    async fn test_value_round_trip() {
        let (a, b) = tokio::io::duplex(1024);
        let mut enc = Encoder::new(a);
        let mut dec = Decoder::new(b);

        enc.encode_value(&"hello".to_string()).await.unwrap();
        let back: String = dec.decode_value().await.unwrap();
        assert_eq!(back, "hello");
    }

    #[tokio::test]
    async fn test_oversize_frame_rejected() {
        let (mut a, b) = tokio::io::duplex(64);
        let mut dec = Decoder::new(b);
        a.write_u32((MAX_VALUE_SIZE + 1) as u32).await.unwrap();

        let err = dec.decode_value::<String>().await.unwrap_err();
        assert!(matches!(err, MarshalError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_files_without_root_rejected() {
        let src = tempfile::tempdir().unwrap();
        let path = src.path().join("f");
        std::fs::write(&path, b"x").unwrap();

        let req = CommandRequest::new(vec!["/f".into()])
            .with_files(vec![record("/f", FileKind::Regular, path.to_str().unwrap())]);

        let (a, b) = tokio::io::duplex(1 << 16);
        let mut enc = Encoder::new(a);
        enc.marshal(&req).await.unwrap();

        let mut dec = Decoder::new(b);
        let err = dec.unmarshal::<CommandRequest>(None).await.unwrap_err();
        assert!(matches!(err, MarshalError::NoRoot(1)));
    }
}
