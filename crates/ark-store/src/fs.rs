//! The backing filesystem contract.
//!
//! Paths are slash-separated and relative to the filesystem's root. Absolute
//! paths and `..` components are rejected so no caller can escape the root.

use std::fmt;
use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

/// Boxed reader returned by [`WriteFs::open_file`].
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// One entry returned by [`WriteFs::read_dir`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// A filesystem or object store that can hold content and inventories.
///
/// Implementations must be safe to call concurrently.
#[async_trait]
pub trait WriteFs: Send + Sync + fmt::Debug {
    /// Write everything from `reader` to `path`, replacing any existing file.
    /// Returns the number of bytes written.
    async fn write(&self, path: &str, reader: &mut (dyn AsyncRead + Send + Unpin)) -> io::Result<u64>;

    /// Open the file at `path` for reading.
    async fn open_file(&self, path: &str) -> io::Result<BoxReader>;

    /// Remove `path` and everything below it. Removing a missing path is not
    /// an error.
    async fn remove_all(&self, path: &str) -> io::Result<()>;

    /// Move the file at `from` to `to`, replacing any file already there.
    /// Readers see either the old file or the new one.
    async fn rename(&self, from: &str, to: &str) -> io::Result<()>;

    /// List the entries of the directory at `path`, sorted by name. The empty
    /// path names the root.
    async fn read_dir(&self, path: &str) -> io::Result<Vec<DirEntry>>;

    /// Read the whole file at `path` into memory.
    async fn read_all(&self, path: &str) -> io::Result<Vec<u8>> {
        let mut reader = self.open_file(path).await?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

/// Check that `path` is a clean relative path. The empty path is allowed
/// only when `allow_root` is set.
pub fn validate_path(path: &str, allow_root: bool) -> io::Result<()> {
    if path.is_empty() {
        if allow_root {
            return Ok(());
        }
        return Err(invalid_path(path));
    }
    if path.starts_with('/') || path.contains('\\') {
        return Err(invalid_path(path));
    }
    if path
        .split('/')
        .any(|seg| seg.is_empty() || seg == "." || seg == "..")
    {
        return Err(invalid_path(path));
    }
    Ok(())
}

/// Join two slash-separated path fragments, skipping empty ones.
pub fn join(base: &str, rest: &str) -> String {
    match (base.is_empty(), rest.is_empty()) {
        (true, _) => rest.to_string(),
        (_, true) => base.to_string(),
        _ => format!("{}/{}", base.trim_end_matches('/'), rest),
    }
}

fn invalid_path(path: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("invalid path: {path:?}"))
}

/// [`WriteFs`] over a directory on the local disk.
#[derive(Clone, Debug)]
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    fn full_path(&self, path: &str, allow_root: bool) -> io::Result<PathBuf> {
        validate_path(path, allow_root)?;
        let mut full = self.root.clone();
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            full.push(seg);
        }
        Ok(full)
    }
}

#[async_trait]
impl WriteFs for LocalFs {
    async fn write(&self, path: &str, reader: &mut (dyn AsyncRead + Send + Unpin)) -> io::Result<u64> {
        let full = self.full_path(path, false)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&full).await?;
        let copied = async {
            let n = tokio::io::copy(reader, &mut file).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok::<_, io::Error>(n)
        }
        .await;
        match copied {
            Ok(n) => {
                debug!(path, bytes = n, "wrote file");
                Ok(n)
            }
            Err(e) => {
                drop(file);
                if let Err(rm) = tokio::fs::remove_file(&full).await {
                    warn!(path, error = %rm, "failed to remove partial file");
                }
                Err(e)
            }
        }
    }

    async fn open_file(&self, path: &str) -> io::Result<BoxReader> {
        let full = self.full_path(path, false)?;
        let file = tokio::fs::File::open(full).await?;
        Ok(Box::new(file))
    }

    async fn remove_all(&self, path: &str) -> io::Result<()> {
        let full = self.full_path(path, true)?;
        let meta = match tokio::fs::symlink_metadata(&full).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        let result = if meta.is_dir() {
            tokio::fs::remove_dir_all(&full).await
        } else {
            tokio::fs::remove_file(&full).await
        };
        match result {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => {
                debug!(path, "removed");
                Ok(())
            }
        }
    }

    async fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        let src = self.full_path(from, false)?;
        let dst = self.full_path(to, false)?;
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&src, &dst).await?;
        debug!(from, to, "renamed");
        Ok(())
    }

    async fn read_dir(&self, path: &str) -> io::Result<Vec<DirEntry>> {
        let full = self.full_path(path, true)?;
        let mut dir = tokio::fs::read_dir(full).await?;
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: entry.file_type().await?.is_dir(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}
