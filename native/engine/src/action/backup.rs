use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument};

use super::{DATA_EXCLUDED_DIRS, Mode, category_enabled, file_name};
use crate::{
    archive::{ArchiveCodec, ArchiveOptions, Encryption},
    config::EngineConfig,
    error::{ActionError, FailedStep},
    location::{BackupInstance, BackupLocation, backup_timestamp},
    models::{AppInfo, BackupManifest, Category},
    transport::{FileTransport, copy_entries, copy_file, join},
};

/// Creates backup instances for single apps
#[derive(Debug, Clone)]
pub struct BackupOrchestrator {
    config: EngineConfig,
    live: Arc<dyn FileTransport>,
    location: BackupLocation,
    encryption: Option<Encryption>,
}

impl BackupOrchestrator {
    pub fn new(
        config: EngineConfig,
        live: Arc<dyn FileTransport>,
        location: BackupLocation,
        encryption: Option<Encryption>,
    ) -> Self {
        Self { config, live, location, encryption }
    }

    /// Backs up `app` into a new instance and returns the manifest written alongside it.
    ///
    /// The manifest flags record what was actually stored: a category whose directory is
    /// missing or empty after exclusions is left out. On failure nothing is cleaned up and no
    /// manifest is written, so the instance is ignored by the backup history.
    #[instrument(level = "debug", skip(self, app), fields(package = %app.package), err)]
    pub async fn backup(&self, app: &AppInfo, mode: Mode) -> Result<BackupManifest, ActionError> {
        let package = app.package.as_str();
        info!(package, label = %app.label, ?mode, "Backing up app");

        let cipher_type = self.encryption.as_ref().map(Encryption::cipher_type).unwrap_or_default();
        let mut manifest = BackupManifest::new(app, backup_timestamp(), cipher_type);
        let instance = self
            .location
            .create_instance(&app.package, manifest.backup_date, app.profile_id)
            .await
            .map_err(|e| ActionError::backup(package, FailedStep::Setup, e))?;

        if mode.contains(Mode::APK) {
            self.backup_apks(app, &instance)
                .await
                .map_err(|e| ActionError::backup(package, FailedStep::Apk, e))?;
            manifest.has_apk = true;
        }

        if mode.contains(Mode::DATA) {
            for category in Category::ALL {
                if !category_enabled(&self.config, category) {
                    debug!(%category, "Category disabled, skipping");
                    continue;
                }
                let stored = self
                    .backup_category(app, category, &instance)
                    .await
                    .map_err(|e| ActionError::backup(package, FailedStep::Category(category), e))?;
                manifest.set_has(category, stored);
            }
        }

        self.location
            .write_manifest(&instance, &manifest)
            .await
            .map_err(|e| ActionError::backup(package, FailedStep::Manifest, e))?;
        info!(package, instance = %instance.path(), "Backup done");
        Ok(manifest)
    }

    #[instrument(level = "debug", skip_all, err)]
    async fn backup_apks(&self, app: &AppInfo, instance: &BackupInstance) -> Result<()> {
        let apks = app.apk.as_ref().with_context(|| format!("{} is not installed", app.package))?;
        debug!(count = 1 + apks.splits.len(), "Copying APKs");
        for apk in std::iter::once(&apks.base).chain(&apks.splits) {
            let target = join(instance.path(), file_name(apk));
            copy_file(self.live.as_ref(), apk, self.location.store().as_ref(), &target)
                .await
                .with_context(|| format!("Failed to back up {apk}"))?;
        }
        Ok(())
    }

    /// Stores one category and returns whether anything was written
    #[instrument(level = "debug", skip(self, app, instance), err)]
    async fn backup_category(
        &self,
        app: &AppInfo,
        category: Category,
        instance: &BackupInstance,
    ) -> Result<bool> {
        let source = app.data_dirs.dir(category);
        let exclude: &[&str] = if self.config.exclude_cache { &DATA_EXCLUDED_DIRS } else { &[] };
        let Some(entries) = self.live.walk(source, exclude).await? else {
            debug!(source, "Directory does not exist, nothing to back up");
            return Ok(false);
        };
        if entries.is_empty() {
            info!(source, "Nothing to back up, skipping");
            return Ok(false);
        }

        let store = self.location.store().as_ref();
        let target = instance.data_path(category, self.encryption.is_some());
        if category.is_archived() {
            let codec = ArchiveCodec::new(ArchiveOptions::new(true, self.encryption.clone()));
            let sink = store.open_write(&target).await?;
            let stats = codec.build_archive(&entries, self.live.as_ref(), sink).await?;
            debug!(target = %target, entries = stats.entries, bytes = stats.bytes, "Archived category");
        } else {
            copy_entries(&entries, self.live.as_ref(), store, &target).await?;
            debug!(target = %target, entries = entries.len(), "Copied category");
        }
        Ok(true)
    }
}
