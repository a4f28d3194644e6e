use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::{Context, Result, ensure};
use async_trait::async_trait;
use time::{OffsetDateTime, PrimitiveDateTime, Time, macros::format_description};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

use crate::{
    config::EngineConfig,
    error::LocationError,
    models::{BackupManifest, Category, PackageName},
    transport::{FileTransport, join},
};

pub const MANIFEST_FILE: &str = "backup.properties";

/// Supplies the writable backup root
#[async_trait]
pub trait BackupRootResolver: fmt::Debug + Send + Sync {
    /// Fails with [`LocationError`] when the root is unset or unusable
    async fn resolve(&self) -> Result<String>;
}

/// Backup root taken from [`EngineConfig::backup_root`]
#[derive(Debug, Clone)]
pub struct ConfiguredRoot {
    root: Option<String>,
}

impl ConfiguredRoot {
    pub fn new(config: &EngineConfig) -> Self {
        Self { root: config.backup_root.clone() }
    }
}

#[async_trait]
impl BackupRootResolver for ConfiguredRoot {
    async fn resolve(&self) -> Result<String> {
        let root = self.root.as_deref().ok_or(LocationError::NotConfigured)?;
        let accessible =
            fs_err::tokio::metadata(root).await.map(|meta| meta.is_dir()).unwrap_or(false);
        if !accessible {
            return Err(LocationError::NotAccessible { path: PathBuf::from(root) }.into());
        }
        Ok(root.trim_end_matches('/').to_string())
    }
}

/// Local wall-clock time truncated to milliseconds
pub fn backup_timestamp() -> PrimitiveDateTime {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    let time = now.time();
    let time = Time::from_hms_milli(time.hour(), time.minute(), time.second(), time.millisecond())
        .unwrap_or(time);
    PrimitiveDateTime::new(now.date(), time)
}

/// `<yyyy-MM-dd-HH-mm-ss-SSS>-user_<profile>`
pub fn instance_name(date: PrimitiveDateTime, profile_id: u32) -> Result<String> {
    let stamp = date
        .format(format_description!(
            "[year]-[month]-[day]-[hour]-[minute]-[second]-[subsecond digits:3]"
        ))
        .context("Failed to format backup date")?;
    Ok(format!("{stamp}-user_{profile_id}"))
}

/// One timestamped backup directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupInstance {
    path: String,
}

impl BackupInstance {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    pub fn manifest_path(&self) -> String {
        join(&self.path, MANIFEST_FILE)
    }

    /// `<category>.tar.gz[.enc]`, or the `obb_files` directory
    pub fn data_path(&self, category: Category, encrypted: bool) -> String {
        if !category.is_archived() {
            return join(&self.path, category.dir_name());
        }
        let suffix = if encrypted { ".enc" } else { "" };
        join(&self.path, &format!("{}.tar.gz{suffix}", category.dir_name()))
    }

    /// Scratch directory a category archive is unpacked into during restore
    pub fn extract_dir(&self, category: Category) -> String {
        join(&self.path, category.dir_name())
    }
}

/// A backup instance with its manifest
#[derive(Debug, Clone)]
pub struct StoredBackup {
    pub instance: BackupInstance,
    pub manifest: BackupManifest,
}

/// Backup history under `root/<package>/<instance>/`
#[derive(Debug, Clone)]
pub struct BackupLocation {
    root: String,
    store: Arc<dyn FileTransport>,
}

impl BackupLocation {
    pub fn new(root: impl Into<String>, store: Arc<dyn FileTransport>) -> Self {
        Self { root: root.into().trim_end_matches('/').to_string(), store }
    }

    /// Resolves the root once and binds it to `store`
    pub async fn open(resolver: &dyn BackupRootResolver, store: Arc<dyn FileTransport>) -> Result<Self> {
        let root = resolver.resolve().await?;
        info!(root = %root, "Using backup location");
        Ok(Self::new(root, store))
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn store(&self) -> &Arc<dyn FileTransport> {
        &self.store
    }

    pub fn package_dir(&self, package: &PackageName) -> String {
        join(&self.root, package.as_str())
    }

    #[instrument(level = "debug", skip(self), fields(package = %package), err)]
    pub async fn create_instance(
        &self,
        package: &PackageName,
        date: PrimitiveDateTime,
        profile_id: u32,
    ) -> Result<BackupInstance> {
        let path = join(&self.package_dir(package), &instance_name(date, profile_id)?);
        ensure!(!self.store.exists(&path).await?, "Backup instance already exists: {path}");
        self.store.create_dir_all(&path).await?;
        debug!(path = %path, "Created backup instance");
        Ok(BackupInstance::new(path))
    }

    pub async fn write_manifest(&self, instance: &BackupInstance, manifest: &BackupManifest) -> Result<()> {
        let json = serde_json::to_vec_pretty(manifest).context("Failed to serialize manifest")?;
        let path = instance.manifest_path();
        let mut writer = self.store.open_write(&path).await?;
        writer.write_all(&json).await.with_context(|| format!("Failed to write {path}"))?;
        writer.shutdown().await.with_context(|| format!("Failed to write {path}"))?;
        Ok(())
    }

    pub async fn read_manifest(&self, instance: &BackupInstance) -> Result<BackupManifest> {
        let path = instance.manifest_path();
        let mut content = Vec::new();
        self.store
            .open_read(&path)
            .await?
            .read_to_end(&mut content)
            .await
            .with_context(|| format!("Failed to read {path}"))?;
        serde_json::from_slice(&content).with_context(|| format!("Failed to parse {path}"))
    }

    /// Instances of `package` with a readable manifest, oldest first
    #[instrument(level = "debug", skip(self), fields(package = %package), err)]
    pub async fn instances(&self, package: &PackageName) -> Result<Vec<StoredBackup>> {
        let package_dir = self.package_dir(package);
        let Some(names) = self.store.list(&package_dir).await? else {
            return Ok(Vec::new());
        };

        let mut backups = Vec::with_capacity(names.len());
        for name in names {
            let instance = BackupInstance::new(join(&package_dir, &name));
            if !self.store.exists(&instance.manifest_path()).await? {
                continue;
            }
            match self.read_manifest(&instance).await {
                Ok(manifest) => backups.push(StoredBackup { instance, manifest }),
                Err(e) => warn!(path = %instance.path(), error = format!("{e:#}"), "Skipping unreadable backup"),
            }
        }
        backups.sort_by(|a, b| a.manifest.backup_date.cmp(&b.manifest.backup_date));
        Ok(backups)
    }

    /// The newest instance, which restore uses by default
    pub async fn latest(&self, package: &PackageName) -> Result<Option<StoredBackup>> {
        Ok(self.instances(package).await?.pop())
    }

    /// Removes one instance directory, refusing anything that isn't a backup under the root
    #[instrument(level = "debug", skip(self), err)]
    pub async fn delete_instance(&self, path: &str) -> Result<()> {
        let path = path.trim_end_matches('/');
        let relative = path
            .strip_prefix(&self.root)
            .and_then(|rest| rest.strip_prefix('/'))
            .with_context(|| format!("Refusing to delete outside backup root: {path}"))?;
        ensure!(
            !relative.is_empty() && !relative.split('/').any(|part| part == ".." || part == "."),
            "Refusing to delete outside backup root: {path}"
        );
        let instance = BackupInstance::new(path);
        ensure!(
            self.store.exists(&instance.manifest_path()).await?,
            "Not a backup directory: {path}"
        );
        self.store.remove_all(path).await?;
        info!(path, "Deleted backup");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::{
        models::{AppInfo, DataDirs},
        test_support::{TestEnv, path_str},
        transport::LocalTransport,
    };

    fn manifest(date: PrimitiveDateTime) -> BackupManifest {
        let package = PackageName::parse("com.example.app").unwrap();
        let app = AppInfo {
            data_dirs: DataDirs::for_package(&package, 0),
            package,
            label: "Example".into(),
            version_name: "1.0".into(),
            version_code: 1,
            profile_id: 0,
            is_system: false,
            apk: None,
        };
        BackupManifest::new(&app, date, "")
    }

    #[test]
    fn instance_layout() {
        let name = instance_name(datetime!(2021-01-19 01:03:07.042), 10).unwrap();
        assert_eq!(name, "2021-01-19-01-03-07-042-user_10");

        let instance = BackupInstance::new(format!("/root/com.example.app/{name}"));
        assert_eq!(instance.name(), name);
        assert_eq!(instance.manifest_path(), format!("/root/com.example.app/{name}/backup.properties"));
        assert!(instance.data_path(Category::Data, false).ends_with("/data.tar.gz"));
        assert!(instance.data_path(Category::ExternalData, true).ends_with("/external_files.tar.gz.enc"));
        assert!(instance.data_path(Category::Obb, true).ends_with("/obb_files"));
    }

    #[tokio::test]
    async fn configured_root_errors() {
        let env = TestEnv::new();
        let mut config = env.config();

        config.backup_root = None;
        let err = ConfiguredRoot::new(&config).resolve().await.unwrap_err();
        assert!(matches!(err.downcast_ref::<LocationError>(), Some(LocationError::NotConfigured)));

        config.backup_root = Some(path_str(&env.write("not-a-dir", b"")));
        let err = ConfiguredRoot::new(&config).resolve().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LocationError>(),
            Some(LocationError::NotAccessible { .. })
        ));

        let config = env.config();
        assert_eq!(
            ConfiguredRoot::new(&config).resolve().await.unwrap(),
            path_str(&env.root().join("backups"))
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn history_is_ordered_and_skips_incomplete_instances() {
        let env = TestEnv::new();
        let location = BackupLocation::open(&ConfiguredRoot::new(&env.config()), Arc::new(LocalTransport))
            .await
            .unwrap();
        let package = PackageName::parse("com.example.app").unwrap();

        let newer = datetime!(2022-05-01 10:00:00.000);
        let older = datetime!(2021-05-01 10:00:00.000);
        for date in [newer, older] {
            let instance = location.create_instance(&package, date, 0).await.unwrap();
            location.write_manifest(&instance, &manifest(date)).await.unwrap();
        }
        // An interrupted backup leaves a directory without manifest
        location.create_instance(&package, datetime!(2023-01-01 00:00:00.000), 0).await.unwrap();

        let history = location.instances(&package).await.unwrap();
        let dates: Vec<_> = history.iter().map(|b| b.manifest.backup_date).collect();
        assert_eq!(dates, vec![older, newer]);
        let latest = location.latest(&package).await.unwrap().unwrap();
        assert_eq!(latest.manifest, manifest(newer));
        assert_eq!(latest.instance.name(), "2022-05-01-10-00-00-000-user_0");

        let other = PackageName::parse("com.example.none").unwrap();
        assert!(location.latest(&other).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_stays_inside_root() {
        let env = TestEnv::new();
        let location = BackupLocation::new(path_str(&env.root().join("backups")), Arc::new(LocalTransport));
        let package = PackageName::parse("com.example.app").unwrap();
        let date = datetime!(2022-05-01 10:00:00.000);
        let instance = location.create_instance(&package, date, 0).await.unwrap();

        // No manifest yet
        assert!(location.delete_instance(instance.path()).await.is_err());
        location.write_manifest(&instance, &manifest(date)).await.unwrap();

        assert!(location.delete_instance(&path_str(&env.root())).await.is_err());
        assert!(location.delete_instance(location.root()).await.is_err());
        let escape = format!("{}/../staging", location.root());
        assert!(location.delete_instance(&escape).await.is_err());

        location.delete_instance(instance.path()).await.unwrap();
        assert!(!env.root().join("backups/com.example.app").join(instance.name()).exists());
        assert!(location.instances(&package).await.unwrap().is_empty());
    }
}
