mod local;
mod privileged;

use std::fmt::Debug;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
pub use local::LocalTransport;
pub use privileged::ShellTransport;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument};

use crate::fs::{FileEntry, FileType};

pub type ReadStream = Box<dyn AsyncRead + Send + Sync + Unpin>;
pub type WriteStream = Box<dyn AsyncWrite + Send + Sync + Unpin>;

/// Joins a device path and a relative name with a single `/`
pub fn join(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name.trim_start_matches('/'))
}

/// File operations on one side of a backup or restore.
///
/// App directories are reached through [`ShellTransport`]; a backup location on a plain
/// filesystem can use [`LocalTransport`]. Paths are device paths.
#[async_trait]
pub trait FileTransport: Debug + Send + Sync {
    async fn open_read(&self, path: &str) -> Result<ReadStream>;

    /// Creates or truncates `path`. The stream must be shut down to complete the write.
    async fn open_write(&self, path: &str) -> Result<WriteStream>;

    /// Creates one directory; an existing directory is not an error
    async fn create_dir(&self, path: &str) -> Result<()>;

    async fn create_dir_all(&self, path: &str) -> Result<()>;

    /// Creates `dir/name` pointing at `target`, resolving `name` relative to `dir`
    async fn symlink(&self, dir: &str, target: &str, name: &str) -> Result<()>;

    /// Creates the named pipe `dir/name`
    async fn mkfifo(&self, dir: &str, name: &str) -> Result<()>;

    /// Names directly under `path`, or `None` if it doesn't exist
    async fn list(&self, path: &str) -> Result<Option<Vec<String>>>;

    /// Recursive listing in enumeration order, or `None` if `path` doesn't exist.
    ///
    /// Top-level entries named in `exclude` are dropped before descending.
    async fn walk(&self, path: &str, exclude: &[&str]) -> Result<Option<Vec<FileEntry>>>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Removes a file or a whole tree; a missing path is not an error
    async fn remove_all(&self, path: &str) -> Result<()>;

    /// Recursively copies `from` to `to`, which must not exist yet
    async fn copy(&self, from: &str, to: &str) -> Result<()>;

    async fn rename(&self, from: &str, to: &str) -> Result<()>;
}

/// Streams one file from `from` to `to`, possibly across transports. Returns the bytes copied.
#[instrument(level = "debug", skip(from, to), err)]
pub async fn copy_file(
    from: &dyn FileTransport,
    src: &str,
    to: &dyn FileTransport,
    dst: &str,
) -> Result<u64> {
    let mut reader = from.open_read(src).await?;
    let mut writer = to.open_write(dst).await?;
    let copied = tokio::io::copy(&mut reader, &mut writer)
        .await
        .with_context(|| format!("Failed to copy {src} to {dst}"))?;
    writer.shutdown().await.with_context(|| format!("Failed to finish writing {dst}"))?;
    Ok(copied)
}

/// Recreates `entries` (as listed under some root on `from`) below `to_dir` on `to`
#[instrument(level = "debug", skip(entries, from, to), fields(count = entries.len()), err)]
pub async fn copy_entries(
    entries: &[FileEntry],
    from: &dyn FileTransport,
    to: &dyn FileTransport,
    to_dir: &str,
) -> Result<()> {
    to.create_dir_all(to_dir).await?;
    for entry in entries {
        let target = join(to_dir, entry.relative_path());
        match (entry.file_type(), entry.link_target()) {
            (FileType::Directory, _) => to.create_dir_all(&target).await?,
            (FileType::RegularFile, _) => {
                copy_file(from, entry.absolute_path(), to, &target).await?;
            }
            // ln -s and mkfifo refuse to replace an existing entry
            (FileType::SymbolicLink, Some(link)) => {
                to.remove_all(&target).await?;
                to.symlink(to_dir, link, entry.relative_path()).await?
            }
            (FileType::NamedPipe, _) => {
                to.remove_all(&target).await?;
                to.mkfifo(to_dir, entry.relative_path()).await?
            }
            (other, _) => bail!("Unsupported file type {other}: {}", entry.absolute_path()),
        }
    }
    debug!(to_dir, "Copied entries");
    Ok(())
}
