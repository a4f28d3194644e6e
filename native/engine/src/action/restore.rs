use std::sync::Arc;

use anyhow::{Context, Result, bail, ensure};
use tracing::{debug, error, info, instrument, warn};

use super::{BASE_APK_NAME, DATA_EXCLUDED_DIRS, Mode, category_enabled};
use crate::{
    archive::{ArchiveCodec, ArchiveOptions, Encryption},
    config::EngineConfig,
    error::{ActionError, FailedStep},
    location::{BackupInstance, BackupLocation},
    models::{AppInfo, BackupManifest, Category, PackageName},
    ownership::OwnershipResolver,
    shell::{Privilege, PrivilegedExecutor, quote},
    transport::{FileTransport, copy_entries, copy_file, join},
};

/// Restores backup instances onto the device
#[derive(Debug, Clone)]
pub struct RestoreOrchestrator {
    config: EngineConfig,
    executor: PrivilegedExecutor,
    live: Arc<dyn FileTransport>,
    location: BackupLocation,
    ownership: OwnershipResolver,
    encryption: Option<Encryption>,
}

impl RestoreOrchestrator {
    pub fn new(
        config: EngineConfig,
        executor: PrivilegedExecutor,
        live: Arc<dyn FileTransport>,
        location: BackupLocation,
        encryption: Option<Encryption>,
    ) -> Self {
        let ownership = OwnershipResolver::new(executor.clone(), config.ownership_settle_delay());
        Self { config, executor, live, location, ownership, encryption }
    }

    /// Restores `instance` of `app`.
    ///
    /// Steps run in order and stop at the first failure. Categories restored before the
    /// failure stay in place; nothing is rolled back.
    #[instrument(level = "debug", skip(self, app, manifest), fields(package = %app.package), err)]
    pub async fn restore(
        &self,
        app: &AppInfo,
        manifest: &BackupManifest,
        instance: &BackupInstance,
        mode: Mode,
    ) -> Result<(), ActionError> {
        let package = app.package.as_str();
        info!(package, instance = %instance.name(), ?mode, "Restoring app");
        self.check_backup(app, manifest)
            .map_err(|e| ActionError::restore(package, FailedStep::Setup, e))?;

        self.kill_package(&app.package).await;

        if mode.contains(Mode::APK) {
            if manifest.has_apk {
                self.restore_apks(manifest, instance)
                    .await
                    .map_err(|e| ActionError::restore(package, FailedStep::ApkInstall, e))?;
            } else {
                info!(package, "Backup has no APK, skipping install");
            }
        }

        if mode.contains(Mode::DATA) {
            for category in Category::ALL {
                if !category_enabled(&self.config, category) || !manifest.has(category) {
                    debug!(%category, "Category not restored");
                    continue;
                }
                self.restore_category(app, manifest, instance, category)
                    .await
                    .map_err(|e| ActionError::restore(package, FailedStep::Category(category), e))?;
            }
        }

        info!(package, "Restore done");
        Ok(())
    }

    fn check_backup(&self, app: &AppInfo, manifest: &BackupManifest) -> Result<()> {
        ensure!(
            manifest.package_name == app.package,
            "Backup belongs to {}, not {}",
            manifest.package_name,
            app.package
        );
        if manifest.is_encrypted() && self.encryption.is_none() {
            bail!("Backup is encrypted with {} but no password is configured", manifest.cipher_type);
        }
        Ok(())
    }

    /// Signals every process of `package` except this one. Failures are only logged.
    #[instrument(level = "debug", skip(self))]
    async fn kill_package(&self, package: &PackageName) {
        let command = self.executor.toolbox_cmd(format_args!("pidof {package}"));
        let result = match self.executor.run(Privilege::Root, &[&command]).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = format!("{e:#}"), "Failed to look up running processes");
                return;
            }
        };
        if !result.is_success() {
            debug!("No running processes");
            return;
        }

        let own_pid = std::process::id();
        let pids = result
            .stdout
            .iter()
            .flat_map(|line| line.split_whitespace())
            .filter_map(|pid| pid.parse::<u32>().ok())
            .filter(|pid| *pid != own_pid);
        for pid in pids {
            debug!(pid, "Killing process");
            let command = format!("kill {pid}");
            if let Err(e) = self.executor.run_checked(Privilege::Root, &[&command]).await {
                error!(pid, error = format!("{e:#}"), "Failed to kill process");
            }
        }
    }

    #[instrument(level = "debug", skip_all, err)]
    async fn restore_apks(&self, manifest: &BackupManifest, instance: &BackupInstance) -> Result<()> {
        let store = self.location.store();
        let names = store
            .list(instance.path())
            .await?
            .with_context(|| format!("Backup instance is missing: {}", instance.path()))?;
        ensure!(names.iter().any(|n| n == BASE_APK_NAME), "{BASE_APK_NAME} is missing in backup");
        let splits: Vec<&str> = names
            .iter()
            .map(String::as_str)
            .filter(|n| n.ends_with(".apk") && *n != BASE_APK_NAME)
            .collect();
        if !splits.is_empty() {
            info!(count = splits.len() + 1, "Package is split into multiple APKs");
        }

        let staging = self.staging_dir().await?;
        let mut staged = Vec::with_capacity(splits.len() + 1);
        let result = self.stage_and_install(manifest, instance, &staging, &splits, &mut staged).await;
        self.remove_staged(&staged).await;
        result
    }

    async fn stage_and_install(
        &self,
        manifest: &BackupManifest,
        instance: &BackupInstance,
        staging: &str,
        splits: &[&str],
        staged: &mut Vec<String>,
    ) -> Result<()> {
        for name in std::iter::once(BASE_APK_NAME).chain(splits.iter().copied()) {
            let target = join(staging, name);
            staged.push(target.clone());
            copy_file(self.location.store().as_ref(), &join(instance.path(), name), self.live.as_ref(), &target)
                .await
                .context("Could not copy apk to staging directory")?;
        }

        self.install(&join(staging, BASE_APK_NAME), None).await?;
        for split in splits {
            self.install(&join(staging, split), Some(&manifest.package_name)).await?;
        }
        Ok(())
    }

    /// Installs one staged APK; splits name the base package they belong to
    async fn install(&self, apk: &str, base_package: Option<&PackageName>) -> Result<()> {
        let installer =
            if self.config.use_cmd_package_install { "cmd package install" } else { "pm install" };
        let command = match base_package {
            Some(base) => format!("{installer} -r -p {base} {}", quote(apk)),
            None => format!("{installer} -r {}", quote(apk)),
        };
        self.executor
            .run_checked(Privilege::Root, &[&command])
            .await
            .with_context(|| format!("Failed to install {apk}"))?;
        info!(apk, "Installed APK");
        Ok(())
    }

    /// The package staging directory, or the fallback when it is unavailable
    async fn staging_dir(&self) -> Result<String> {
        let preferred = &self.config.package_staging_dir;
        if self.live.exists(preferred).await? {
            return Ok(preferred.clone());
        }
        let fallback = &self.config.fallback_staging_dir;
        warn!(
            preferred = %preferred,
            fallback = %fallback,
            "Package staging directory is unavailable, using fallback"
        );
        self.live.create_dir_all(fallback).await?;
        Ok(fallback.clone())
    }

    async fn remove_staged(&self, staged: &[String]) {
        if staged.is_empty() {
            return;
        }
        let paths = staged.iter().map(|p| quote(p)).collect::<Vec<_>>().join(" ");
        let command = self.executor.toolbox_cmd(format_args!("rm -f {paths}"));
        match self.executor.run(Privilege::Root, &[&command]).await {
            Ok(result) if result.is_success() => debug!(count = staged.len(), "Removed staged APKs"),
            Ok(result) => warn!(stderr = ?result.stderr, "Failed to remove staged APKs"),
            Err(e) => warn!(error = format!("{e:#}"), "Failed to remove staged APKs"),
        }
    }

    #[instrument(level = "debug", skip(self, app, manifest, instance), err)]
    async fn restore_category(
        &self,
        app: &AppInfo,
        manifest: &BackupManifest,
        instance: &BackupInstance,
        category: Category,
    ) -> Result<()> {
        let store = self.location.store().as_ref();
        let target = app.data_dirs.dir(category);
        let source = instance.data_path(category, manifest.is_encrypted());
        if !store.exists(&source).await? {
            info!(source = %source, "Backup has no data for category, nothing to restore");
            return Ok(());
        }

        if category.is_archived() {
            let encryption = if manifest.is_encrypted() { self.encryption.clone() } else { None };
            let codec = ArchiveCodec::new(ArchiveOptions::new(true, encryption));
            let scratch = instance.extract_dir(category);
            self.live.remove_all(&scratch).await?;
            let stats = codec
                .extract_archive(store.open_read(&source).await?, &scratch, self.live.as_ref())
                .await?;
            debug!(entries = stats.entries, bytes = stats.bytes, "Extracted archive");
            self.move_into(&scratch, target).await?;
        } else {
            let entries = store.walk(&source, &[]).await?.unwrap_or_default();
            copy_entries(&entries, store, self.live.as_ref(), target).await?;
        }

        if category.needs_chown() {
            self.restore_ownership(target).await?;
        }
        info!(%category, target, "Restored category");
        Ok(())
    }

    /// Replaces each top-level entry of `target` with its extracted counterpart
    async fn move_into(&self, scratch: &str, target: &str) -> Result<()> {
        self.live.create_dir_all(target).await?;
        let names = self.live.list(scratch).await?.unwrap_or_default();
        for name in &names {
            let dest = join(target, name);
            self.live.remove_all(&dest).await?;
            self.live.rename(&join(scratch, name), &dest).await?;
        }
        self.live.remove_all(scratch).await?;
        debug!(target, count = names.len(), "Moved extracted entries");
        Ok(())
    }

    /// Chowns the restored entries of `target` to the owner the system gave `target` itself
    #[instrument(level = "debug", skip(self), err)]
    async fn restore_ownership(&self, target: &str) -> Result<()> {
        let owner = self.ownership.resolve(target).await?;
        let names: Vec<String> = self
            .live
            .list(target)
            .await?
            .unwrap_or_default()
            .into_iter()
            .filter(|name| !DATA_EXCLUDED_DIRS.contains(&name.as_str()))
            .collect();
        if names.is_empty() {
            info!(target, "No chown targets, nothing to do");
            return Ok(());
        }

        let paths = names.iter().map(|n| quote(&join(target, n))).collect::<Vec<_>>().join(" ");
        let command =
            self.executor.toolbox_cmd(format_args!("chown -R {}:{} {paths}", owner.uid, owner.gid));
        self.executor
            .run_checked(Privilege::Root, &[&command])
            .await
            .with_context(|| format!("Could not update permissions for {target}"))?;
        debug!(target, uid = owner.uid, gid = owner.gid, "Restored ownership");
        Ok(())
    }
}
