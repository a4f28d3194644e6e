use std::{fmt, str::FromStr};

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

use super::BackupManifest;

/// A validated Android package name, e.g. `com.example.app`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageName(String);

impl PackageName {
    pub fn parse(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        ensure!(
            lazy_regex::regex_is_match!(r"^(?:[A-Za-z][\w]*\.)+[A-Za-z][\w]*$", &name),
            "Invalid package name: {name}"
        );
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PackageName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PackageName {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<PackageName> for String {
    fn from(value: PackageName) -> Self {
        value.0
    }
}

/// Installed APK files of a package
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApkSet {
    pub base: String,
    pub splits: Vec<String>,
}

/// Live data directories of a package for one profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDirs {
    pub data: String,
    pub device_protected: String,
    pub external: String,
    pub obb: String,
}

impl DataDirs {
    /// Standard Android layout for `package` in profile `profile_id`
    pub fn for_package(package: &PackageName, profile_id: u32) -> Self {
        Self {
            data: format!("/data/user/{profile_id}/{package}"),
            device_protected: format!("/data/user_de/{profile_id}/{package}"),
            external: format!("/storage/emulated/{profile_id}/Android/data/{package}"),
            obb: format!("/storage/emulated/{profile_id}/Android/obb/{package}"),
        }
    }
}

/// Everything the orchestrators need to know about one app
#[derive(Debug, Clone)]
pub struct AppInfo {
    pub package: PackageName,
    pub label: String,
    pub version_name: String,
    pub version_code: i64,
    pub profile_id: u32,
    pub is_system: bool,
    /// `None` when the package is not installed
    pub apk: Option<ApkSet>,
    pub data_dirs: DataDirs,
}

impl AppInfo {
    /// Describes an app that is only known from a backup, using the standard data layout
    pub fn from_manifest(manifest: &BackupManifest) -> Self {
        Self {
            package: manifest.package_name.clone(),
            label: manifest.package_label.clone(),
            version_name: manifest.version_name.clone(),
            version_code: manifest.version_code,
            profile_id: manifest.profile_id,
            is_system: manifest.is_system,
            apk: None,
            data_dirs: DataDirs::for_package(&manifest.package_name, manifest.profile_id),
        }
    }

    pub fn is_installed(&self) -> bool {
        self.apk.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_names() {
        for valid in ["com.example.app", "a.b", "org.fdroid.fdroid_2", "Com.Example.X1"] {
            assert_eq!(PackageName::parse(valid).unwrap().as_str(), valid);
        }
        for invalid in ["", "single", "1com.example", "com..example", "com.example.", "com/example", "com.ex ample"] {
            assert!(PackageName::parse(invalid).is_err(), "{invalid} should be rejected");
        }
    }

    #[test]
    fn package_name_serde() {
        let name: PackageName = serde_json::from_str(r#""com.example.app""#).unwrap();
        assert_eq!(name.to_string(), "com.example.app");
        assert!(serde_json::from_str::<PackageName>(r#""../etc""#).is_err());
    }

    #[test]
    fn android_data_layout() {
        let dirs = DataDirs::for_package(&PackageName::parse("com.example.app").unwrap(), 10);
        assert_eq!(dirs.data, "/data/user/10/com.example.app");
        assert_eq!(dirs.device_protected, "/data/user_de/10/com.example.app");
        assert_eq!(dirs.external, "/storage/emulated/10/Android/data/com.example.app");
        assert_eq!(dirs.obb, "/storage/emulated/10/Android/obb/com.example.app");
    }
}
