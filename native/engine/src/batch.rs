use std::{future::Future, path::Path, sync::Arc};

use anyhow::{Context, Result};
use time::{OffsetDateTime, macros::format_description};
use tokio::{io::AsyncWriteExt, sync::Semaphore, task::JoinSet};
use tracing::{debug, error, info, instrument};

use crate::{
    action::{BackupOrchestrator, Mode, RestoreOrchestrator},
    error::ActionError,
    location::StoredBackup,
    models::AppInfo,
};

/// Outcome of a batch, one entry per app
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<ActionError>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Appends one line per failed app: `yyyy/MM/dd - HH:mm:ss: <error> [<package>]`
    #[instrument(level = "debug", skip(self), fields(failed = self.failed.len()), err)]
    pub async fn write_error_log(&self, path: &Path) -> Result<()> {
        if self.failed.is_empty() {
            return Ok(());
        }
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let stamp = now
            .format(format_description!("[year]/[month]/[day] - [hour]:[minute]:[second]"))
            .context("Failed to format timestamp")?;

        let mut lines = String::new();
        for err in &self.failed {
            lines.push_str(&format!("{stamp}: {err} [{}]\n", err.package()));
        }
        let mut file = fs_err::tokio::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .context("Failed to open error log")?;
        file.write_all(lines.as_bytes()).await.context("Failed to write error log")?;
        file.flush().await?;
        Ok(())
    }
}

/// Runs independent per-app jobs with at most `limit` in flight
#[derive(Debug, Clone)]
pub struct BatchRunner {
    permits: Arc<Semaphore>,
    limit: usize,
}

impl BatchRunner {
    /// A limit of 0 is treated as 1
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self { permits: Arc::new(Semaphore::new(limit)), limit }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Runs `job` for every item. Each successful job returns its package name.
    ///
    /// Results are reported sorted by package name. A panicking job is resumed on the caller.
    pub async fn run<T, F, Fut>(&self, items: Vec<T>, job: F) -> BatchReport
    where
        T: Send + 'static,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<String, ActionError>> + Send + 'static,
    {
        debug!(count = items.len(), limit = self.limit, "Starting batch");
        let mut tasks = JoinSet::new();
        for item in items {
            let permits = self.permits.clone();
            let fut = job(item);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                fut.await
            });
        }

        let mut report = BatchReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(package)) => report.succeeded.push(package),
                Ok(Err(e)) => {
                    error!(package = e.package(), error = %e, "App failed");
                    report.failed.push(e);
                }
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => error!(error = %e, "Batch job was cancelled"),
            }
        }
        report.succeeded.sort();
        report.failed.sort_by(|a, b| a.package().cmp(b.package()));
        info!(succeeded = report.succeeded.len(), failed = report.failed.len(), "Batch finished");
        report
    }

    pub async fn backup_all(
        &self,
        orchestrator: &BackupOrchestrator,
        apps: Vec<AppInfo>,
        mode: Mode,
    ) -> BatchReport {
        self.run(apps, |app| {
            let orchestrator = orchestrator.clone();
            async move {
                orchestrator.backup(&app, mode).await?;
                Ok(app.package.to_string())
            }
        })
        .await
    }

    pub async fn restore_all(
        &self,
        orchestrator: &RestoreOrchestrator,
        jobs: Vec<(AppInfo, StoredBackup)>,
        mode: Mode,
    ) -> BatchReport {
        self.run(jobs, |(app, backup)| {
            let orchestrator = orchestrator.clone();
            async move {
                let StoredBackup { instance, manifest } = backup;
                orchestrator.restore(&app, &manifest, &instance, mode).await?;
                Ok(app.package.to_string())
            }
        })
        .await
    }
}
