use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, instrument};

use super::{FileTransport, ReadStream, WriteStream};
use crate::{
    fs::{DirectoryEnumerator, FileEntry},
    shell::{Privilege, PrivilegedExecutor, quote},
};

/// File access through root shell commands
#[derive(Debug, Clone)]
pub struct ShellTransport {
    executor: PrivilegedExecutor,
    enumerator: DirectoryEnumerator,
}

impl ShellTransport {
    pub fn new(executor: PrivilegedExecutor) -> Self {
        let enumerator = DirectoryEnumerator::new(executor.clone());
        Self { executor, enumerator }
    }

    pub fn executor(&self) -> &PrivilegedExecutor {
        &self.executor
    }

    pub fn enumerator(&self) -> &DirectoryEnumerator {
        &self.enumerator
    }

    async fn root(&self, command: String) -> Result<()> {
        self.executor.run_checked(Privilege::Root, &[command]).await?;
        Ok(())
    }
}

#[async_trait]
impl FileTransport for ShellTransport {
    async fn open_read(&self, path: &str) -> Result<ReadStream> {
        Ok(Box::new(self.executor.open_read(Privilege::Root, path)?))
    }

    async fn open_write(&self, path: &str) -> Result<WriteStream> {
        Ok(Box::new(self.executor.open_write(Privilege::Root, path)?))
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn create_dir(&self, path: &str) -> Result<()> {
        let command = format!("mkdir {}", quote(path));
        let result = self.executor.run(Privilege::Root, &[&command]).await?;
        if result.is_success() || result.stderr_contains("File exists") {
            return Ok(());
        }
        Err(result.into_failure(command).into())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn create_dir_all(&self, path: &str) -> Result<()> {
        self.root(format!("mkdir -p {}", quote(path))).await
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn symlink(&self, dir: &str, target: &str, name: &str) -> Result<()> {
        self.root(format!("cd {} && ln -s {} {}", quote(dir), quote(target), quote(name)))
            .await
            .with_context(|| format!("Failed to create symlink {name} -> {target}"))
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn mkfifo(&self, dir: &str, name: &str) -> Result<()> {
        self.root(format!("cd {} && mkfifo {}", quote(dir), quote(name)))
            .await
            .with_context(|| format!("Failed to create named pipe {name}"))
    }

    async fn list(&self, path: &str) -> Result<Option<Vec<String>>> {
        self.enumerator.list_shallow(path).await
    }

    async fn walk(&self, path: &str, exclude: &[&str]) -> Result<Option<Vec<FileEntry>>> {
        if exclude.is_empty() {
            return self.enumerator.list_detailed(path, true).await;
        }
        let Some(top) = self.enumerator.list_detailed(path, false).await? else {
            return Ok(None);
        };
        let top = top.into_iter().filter(|e| !exclude.contains(&e.name())).collect();
        Ok(Some(self.enumerator.expand(top).await?))
    }

    #[instrument(level = "debug", skip(self), ret, err)]
    async fn exists(&self, path: &str) -> Result<bool> {
        let quoted = quote(path);
        let result = self
            .executor
            .run(Privilege::Root, &[format!("[ -e {quoted} ] || [ -L {quoted} ]")])
            .await?;
        Ok(result.is_success())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn remove_all(&self, path: &str) -> Result<()> {
        let command = self.executor.toolbox_cmd(format_args!("rm -rf {}", quote(path)));
        self.root(command).await
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let command = self.executor.toolbox_cmd(format_args!("cp -r {} {}", quote(from), quote(to)));
        self.root(command).await?;
        debug!(from, to, "Copied tree");
        Ok(())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let command = self.executor.toolbox_cmd(format_args!("mv {} {}", quote(from), quote(to)));
        self.root(command).await
    }
}
