use std::fmt;

use anyhow::{Context, Result, ensure};
use async_trait::async_trait;
use lazy_regex::regex_captures;
use tracing::{debug, instrument, warn};

use crate::{
    models::{ApkSet, AppInfo, DataDirs, PackageName},
    shell::{Privilege, PrivilegedExecutor, quote},
    transport::join,
};

/// Source of installed-package metadata
#[async_trait]
pub trait PackageInfoProvider: fmt::Debug + Send + Sync {
    /// Describes `package` in profile `profile_id`. An uninstalled package has no [`ApkSet`].
    async fn app_info(&self, package: &PackageName, profile_id: u32) -> Result<AppInfo>;
}

/// Version details reported by `dumpsys package`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct PackageDetails {
    version_name: String,
    version_code: i64,
    is_system: bool,
}

/// Splits `pm path` output into the base APK and its splits
fn parse_pm_path(lines: &[String]) -> Option<ApkSet> {
    let mut paths: Vec<String> = lines
        .iter()
        .filter_map(|line| line.trim().strip_prefix("package:"))
        .map(str::to_string)
        .collect();
    if paths.is_empty() {
        return None;
    }
    let base_index = paths.iter().position(|p| p.ends_with("/base.apk")).unwrap_or(0);
    let base = paths.remove(base_index);
    Some(ApkSet { base, splits: paths })
}

/// Reads the first `versionName=`, `versionCode=` and `pkgFlags=` values
fn parse_dumpsys(lines: &[String]) -> PackageDetails {
    let mut details = PackageDetails::default();
    let (mut name_seen, mut code_seen, mut flags_seen) = (false, false, false);
    for line in lines {
        let line = line.trim();
        if !name_seen && let Some(name) = line.strip_prefix("versionName=") {
            details.version_name = name.to_string();
            name_seen = true;
        }
        if !code_seen
            && let Some(rest) = line.strip_prefix("versionCode=")
            && let Some(code) = rest.split_whitespace().next()
        {
            details.version_code = code.parse().unwrap_or_default();
            code_seen = true;
        }
        if !flags_seen && let Some(flags) = line.strip_prefix("pkgFlags=[") {
            details.is_system = flags.trim_end_matches(']').split_whitespace().any(|f| f == "SYSTEM");
            flags_seen = true;
        }
    }
    details
}

/// User ids from `pm list users` lines such as `UserInfo{10:Work profile:1030} running`
fn parse_users(lines: &[String]) -> Vec<u32> {
    lines
        .iter()
        .filter_map(|line| regex_captures!(r"\{(\d+):", line.as_str()))
        .filter_map(|(_, id)| id.parse().ok())
        .collect()
}

/// Package names from `pm list packages` lines (`package:<name>`)
fn parse_package_list(lines: &[String]) -> Vec<PackageName> {
    lines
        .iter()
        .filter_map(|line| line.split_once(':'))
        .filter_map(|(_, name)| match PackageName::parse(name.trim()) {
            Ok(package) => Some(package),
            Err(e) => {
                warn!(line = %name, error = %e, "Skipping unparsable package name");
                None
            }
        })
        .collect()
}

/// Package metadata from `pm` and `dumpsys`
#[derive(Debug, Clone)]
pub struct PmPackageProvider {
    executor: PrivilegedExecutor,
}

impl PmPackageProvider {
    pub fn new(executor: PrivilegedExecutor) -> Self {
        Self { executor }
    }

    /// Removes a user app with `pm uninstall`, then clears its leftover native libraries
    #[instrument(level = "debug", skip(self, app), fields(package = %app.package), err)]
    pub async fn uninstall(&self, app: &AppInfo) -> Result<()> {
        ensure!(!app.is_system, "Uninstalling system app {} is not supported", app.package);
        let command = format!("pm uninstall {}", app.package);
        self.executor
            .run_checked(Privilege::Root, &[&command])
            .await
            .with_context(|| format!("Failed to uninstall {}", app.package))?;

        // usually fails with "No such file or directory"
        let command = self.executor.toolbox_cmd(format_args!("rm -r /data/lib/{}/*", app.package));
        let result = self.executor.run(Privilege::Root, &[&command]).await?;
        debug!(exit_code = result.exit_code, "Removed leftover libraries");
        Ok(())
    }

    /// Deletes `cache` and `code_cache` of the data and device-protected dirs, and the
    /// external cache
    #[instrument(level = "debug", skip(self, app), fields(package = %app.package), err)]
    pub async fn wipe_cache(&self, app: &AppInfo) -> Result<()> {
        let dirs = &app.data_dirs;
        let mut roots = vec![dirs.data.as_str()];
        if dirs.device_protected != dirs.data {
            roots.push(&dirs.device_protected);
        }
        let mut paths: Vec<String> = roots
            .into_iter()
            .flat_map(|root| [join(root, "cache"), join(root, "code_cache")])
            .collect();
        paths.push(join(&dirs.external, "cache"));

        let targets = paths.iter().map(|p| quote(p)).collect::<Vec<_>>().join(" ");
        let command = format!("rm -rf {targets}");
        self.executor
            .run_checked(Privilege::Root, &[&command])
            .await
            .with_context(|| format!("Failed to wipe cache of {}", app.package))?;
        debug!(count = paths.len(), "Wiped cache directories");
        Ok(())
    }

    /// Runs `pm enable|disable --user <id>` for every profile in `users`
    #[instrument(level = "debug", skip(self), fields(package = %package), err)]
    pub async fn set_enabled(&self, package: &PackageName, users: &[u32], enabled: bool) -> Result<()> {
        if users.is_empty() {
            debug!("No users given, nothing to change");
            return Ok(());
        }
        let option = if enabled { "enable" } else { "disable" };
        let command = users
            .iter()
            .map(|user| format!("pm {option} --user {user} {package}"))
            .collect::<Vec<_>>()
            .join(" && ");
        self.executor
            .run_checked(Privilege::Root, &[&command])
            .await
            .with_context(|| format!("Failed to {option} {package}"))?;
        Ok(())
    }

    /// Ids of the device's user profiles
    #[instrument(level = "debug", skip(self), err)]
    pub async fn list_users(&self) -> Result<Vec<u32>> {
        let result = self
            .executor
            .run_checked(Privilege::Root, &["pm list users"])
            .await
            .context("Failed to list users")?;
        Ok(parse_users(&result.stdout))
    }

    /// Packages currently disabled for the invoking user
    #[instrument(level = "debug", skip(self), err)]
    pub async fn disabled_packages(&self) -> Result<Vec<PackageName>> {
        let result = self
            .executor
            .run_checked(Privilege::User, &["pm list packages -d"])
            .await
            .context("Failed to list disabled packages")?;
        Ok(parse_package_list(&result.stdout))
    }
}

#[async_trait]
impl PackageInfoProvider for PmPackageProvider {
    #[instrument(level = "debug", skip(self), fields(package = %package), err)]
    async fn app_info(&self, package: &PackageName, profile_id: u32) -> Result<AppInfo> {
        let command = format!("pm path --user {profile_id} {package}");
        let paths = self.executor.run(Privilege::Root, &[&command]).await?;
        let apk = if paths.is_success() { parse_pm_path(&paths.stdout) } else { None };

        let command = format!("dumpsys package {package}");
        let dump = self
            .executor
            .run_checked(Privilege::Root, &[&command])
            .await
            .with_context(|| format!("Failed to read package details of {package}"))?;
        let details = parse_dumpsys(&dump.stdout);
        debug!(
            installed = apk.is_some(),
            version = %details.version_name,
            system = details.is_system,
            "Read package info"
        );

        Ok(AppInfo {
            package: package.clone(),
            label: package.to_string(),
            version_name: details.version_name,
            version_code: details.version_code,
            profile_id,
            is_system: details.is_system,
            apk,
            data_dirs: DataDirs::for_package(package, profile_id),
        })
    }
}
