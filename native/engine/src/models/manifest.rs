use serde::{Deserialize, Serialize};
use time::PrimitiveDateTime;

use super::{AppInfo, PackageName};

time::serde::format_description!(
    backup_date_format,
    PrimitiveDateTime,
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
);

/// Companion record of one backup instance, stored as `backup.properties`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub package_name: PackageName,
    #[serde(default)]
    pub package_label: String,
    #[serde(default)]
    pub version_name: String,
    #[serde(default)]
    pub version_code: i64,
    #[serde(default)]
    pub profile_id: u32,
    #[serde(default)]
    pub is_system: bool,
    #[serde(with = "backup_date_format")]
    pub backup_date: PrimitiveDateTime,
    pub has_apk: bool,
    pub has_app_data: bool,
    pub has_devices_protected_data: bool,
    pub has_external_data: bool,
    pub has_obb_data: bool,
    /// Empty when the archives are not encrypted
    #[serde(default)]
    pub cipher_type: String,
}

impl BackupManifest {
    /// Manifest for `app` with every content flag cleared
    pub fn new(app: &AppInfo, backup_date: PrimitiveDateTime, cipher_type: impl Into<String>) -> Self {
        Self {
            package_name: app.package.clone(),
            package_label: app.label.clone(),
            version_name: app.version_name.clone(),
            version_code: app.version_code,
            profile_id: app.profile_id,
            is_system: app.is_system,
            backup_date,
            has_apk: false,
            has_app_data: false,
            has_devices_protected_data: false,
            has_external_data: false,
            has_obb_data: false,
            cipher_type: cipher_type.into(),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        !self.cipher_type.is_empty()
    }
}
