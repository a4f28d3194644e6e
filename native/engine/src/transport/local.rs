use std::{
    ffi::CString,
    io::ErrorKind,
    os::unix::fs::{FileTypeExt, MetadataExt},
    path::Path,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use fs_err::tokio as fs;
use futures::future::BoxFuture;
use tracing::{debug, instrument};

use super::{FileTransport, ReadStream, WriteStream, copy_entries, join};
use crate::fs::{EntryMetadata, FileEntry, FileType};

fn file_type_of(meta: &std::fs::Metadata) -> FileType {
    let ft = meta.file_type();
    if ft.is_symlink() {
        FileType::SymbolicLink
    } else if ft.is_dir() {
        FileType::Directory
    } else if ft.is_fifo() {
        FileType::NamedPipe
    } else if ft.is_socket() {
        FileType::Socket
    } else if ft.is_block_device() {
        FileType::BlockDevice
    } else if ft.is_char_device() {
        FileType::CharDevice
    } else {
        FileType::RegularFile
    }
}

/// Plain filesystem access with the engine's own permissions
#[derive(Debug, Clone, Default)]
pub struct LocalTransport;

impl LocalTransport {
    pub fn new() -> Self {
        Self
    }

    async fn sorted_names(path: &str) -> Result<Option<Vec<String>>> {
        let mut dir = match fs::read_dir(path).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(Some(names))
    }

    fn walk_level<'a>(
        &'a self,
        dir: String,
        prefix: Option<String>,
        exclude: &'a [&'a str],
        out: &'a mut Vec<FileEntry>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let names = Self::sorted_names(&dir).await?.unwrap_or_default();
            let mut level = Vec::with_capacity(names.len());
            for name in names {
                if prefix.is_none() && exclude.contains(&name.as_str()) {
                    continue;
                }
                let absolute = join(&dir, &name);
                let meta = fs::symlink_metadata(&absolute).await?;
                let file_type = file_type_of(&meta);
                let link_target = if file_type == FileType::SymbolicLink {
                    Some(fs::read_link(&absolute).await?.to_string_lossy().into_owned())
                } else {
                    None
                };
                let relative = match &prefix {
                    Some(prefix) => format!("{prefix}/{name}"),
                    None => name,
                };
                let metadata = EntryMetadata {
                    size: if file_type == FileType::RegularFile { meta.len() } else { 0 },
                    mode: meta.mode() & 0o7777,
                    modified: meta.mtime(),
                };
                level.push(
                    FileEntry::new(relative, absolute, file_type, link_target)?
                        .with_metadata(metadata),
                );
            }

            let directories: Vec<(String, String)> = level
                .iter()
                .filter(|e| e.file_type() == FileType::Directory)
                .map(|e| (e.absolute_path().to_string(), e.relative_path().to_string()))
                .collect();
            out.extend(level);
            for (absolute, relative) in directories {
                self.walk_level(absolute, Some(relative), &[], out).await?;
            }
            Ok(())
        })
    }
}

#[async_trait]
impl FileTransport for LocalTransport {
    async fn open_read(&self, path: &str) -> Result<ReadStream> {
        Ok(Box::new(fs::File::open(path).await?))
    }

    async fn open_write(&self, path: &str) -> Result<WriteStream> {
        Ok(Box::new(fs::File::create(path).await?))
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        match fs::create_dir(path).await {
            Err(e) if e.kind() == ErrorKind::AlreadyExists && Path::new(path).is_dir() => Ok(()),
            other => Ok(other?),
        }
    }

    async fn create_dir_all(&self, path: &str) -> Result<()> {
        Ok(fs::create_dir_all(path).await?)
    }

    async fn symlink(&self, dir: &str, target: &str, name: &str) -> Result<()> {
        let link = join(dir, name);
        tokio::fs::symlink(target, &link)
            .await
            .with_context(|| format!("Failed to create symlink {link} -> {target}"))
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn mkfifo(&self, dir: &str, name: &str) -> Result<()> {
        let path = join(dir, name);
        let c_path = CString::new(path.as_str()).context("Path contains a NUL byte")?;
        tokio::task::spawn_blocking(move || {
            // SAFETY: `c_path` is a valid NUL-terminated string that outlives the call
            let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o644 as libc::mode_t) };
            if rc == 0 { Ok(()) } else { Err(std::io::Error::last_os_error()) }
        })
        .await
        .context("mkfifo task panicked")?
        .with_context(|| format!("Failed to create named pipe {path}"))
    }

    async fn list(&self, path: &str) -> Result<Option<Vec<String>>> {
        Self::sorted_names(path).await.with_context(|| format!("Failed to list {path}"))
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn walk(&self, path: &str, exclude: &[&str]) -> Result<Option<Vec<FileEntry>>> {
        if !self.exists(path).await? {
            return Ok(None);
        }
        let mut entries = Vec::new();
        self.walk_level(path.trim_end_matches('/').to_string(), None, exclude, &mut entries).await?;
        debug!(path, count = entries.len(), "Walked directory");
        Ok(Some(entries))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        match fs::symlink_metadata(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn remove_all(&self, path: &str) -> Result<()> {
        let meta = match fs::symlink_metadata(path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            fs::remove_dir_all(path).await?;
        } else {
            fs::remove_file(path).await?;
        }
        Ok(())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let meta = fs::symlink_metadata(from).await?;
        if !meta.is_dir() {
            fs::copy(from, to).await?;
            return Ok(());
        }
        let entries = self.walk(from, &[]).await?.unwrap_or_default();
        copy_entries(&entries, self, self, to).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        Ok(fs::rename(from, to).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::symlink;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::test_support::{TestEnv, path_str};

    #[tokio::test(flavor = "multi_thread")]
    async fn mkfifo_creates_pipes_without_replacing() {
        let env = TestEnv::new();
        let dir = path_str(&env.mkdir("pipes"));
        LocalTransport.mkfifo(&dir, "events").await.unwrap();
        let meta = fs_err::symlink_metadata(env.root().join("pipes/events")).unwrap();
        assert!(meta.file_type().is_fifo());

        let err = LocalTransport.mkfifo(&dir, "events").await.unwrap_err();
        let io = err.downcast_ref::<std::io::Error>().unwrap();
        assert_eq!(io.kind(), ErrorKind::AlreadyExists);
        assert!(LocalTransport.mkfifo(&dir, "missing/events").await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn walk_matches_enumeration_order() {
        let env = TestEnv::new();
        env.write("tree/b/x.txt", b"x");
        env.write("tree/a/y.txt", b"yy");
        env.write("tree/z.txt", b"zzz");
        symlink("/target", env.root().join("tree/link")).unwrap();

        let entries = LocalTransport.walk(&path_str(&env.root().join("tree")), &[]).await.unwrap().unwrap();
        let paths: Vec<_> = entries.iter().map(FileEntry::relative_path).collect();
        assert_eq!(paths, vec!["a", "b", "link", "z.txt", "a/y.txt", "b/x.txt"]);

        let z = entries.iter().find(|e| e.relative_path() == "z.txt").unwrap();
        assert_eq!(z.metadata().size, 3);
        let link = entries.iter().find(|e| e.relative_path() == "link").unwrap();
        assert_eq!(link.link_target(), Some("/target"));

        let entries =
            LocalTransport.walk(&path_str(&env.root().join("tree")), &["a", "link"]).await.unwrap().unwrap();
        let paths: Vec<_> = entries.iter().map(FileEntry::relative_path).collect();
        assert_eq!(paths, vec!["b", "z.txt", "b/x.txt"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_paths() {
        let env = TestEnv::new();
        let missing = path_str(&env.root().join("missing"));
        assert_eq!(LocalTransport.walk(&missing, &[]).await.unwrap(), None);
        assert_eq!(LocalTransport.list(&missing).await.unwrap(), None);
        assert!(!LocalTransport.exists(&missing).await.unwrap());
        LocalTransport.remove_all(&missing).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn copies_trees_with_links_and_pipes() {
        let env = TestEnv::new();
        env.write("src/dir/file", b"content");
        symlink("dir/file", env.root().join("src/link")).unwrap();
        LocalTransport.mkfifo(&path_str(&env.root().join("src")), "pipe").await.unwrap();

        let src = path_str(&env.root().join("src"));
        let dst = path_str(&env.root().join("dst"));
        LocalTransport.copy(&src, &dst).await.unwrap();

        assert_eq!(fs_err::read(env.root().join("dst/dir/file")).unwrap(), b"content");
        assert_eq!(
            fs_err::read_link(env.root().join("dst/link")).unwrap().to_string_lossy(),
            "dir/file"
        );
        let pipe = fs_err::symlink_metadata(env.root().join("dst/pipe")).unwrap();
        assert!(pipe.file_type().is_fifo());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn writes_and_reads_files() {
        let env = TestEnv::new();
        let path = path_str(&env.root().join("f.bin"));
        let mut writer = LocalTransport.open_write(&path).await.unwrap();
        writer.write_all(&[1, 2, 3]).await.unwrap();
        writer.shutdown().await.unwrap();

        let mut buf = Vec::new();
        LocalTransport.open_read(&path).await.unwrap().read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }
}
