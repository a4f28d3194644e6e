//! Per-app backup and restore.
//!
//! Both orchestrators work on one app at a time and run their steps strictly in order:
//! APKs first, then [`Category::ALL`]. App directories are reached through the `live`
//! transport and the backup through the [`BackupLocation`](crate::location::BackupLocation)
//! store.

mod backup;
mod restore;

use std::ops::BitOr;

pub use backup::BackupOrchestrator;
pub use restore::RestoreOrchestrator;

use crate::{config::EngineConfig, models::Category};

/// Top-level data directory names that are never backed up (with `exclude_cache`) and never
/// chowned on restore
pub const DATA_EXCLUDED_DIRS: [&str; 3] = ["cache", "code_cache", "lib"];

pub const BASE_APK_NAME: &str = "base.apk";

/// Which parts of an app a backup or restore covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode(u8);

impl Mode {
    pub const APK: Mode = Mode(0b01);
    pub const DATA: Mode = Mode(0b10);
    pub const BOTH: Mode = Mode(0b11);

    pub fn contains(self, other: Mode) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Builds a mode from CLI-style flags; no flags means both
    pub fn from_flags(apk: bool, data: bool) -> Self {
        match (apk, data) {
            (true, false) => Self::APK,
            (false, true) => Self::DATA,
            _ => Self::BOTH,
        }
    }
}

impl BitOr for Mode {
    type Output = Mode;

    fn bitor(self, rhs: Mode) -> Mode {
        Mode(self.0 | rhs.0)
    }
}

/// Whether `category` is backed up / restored with this configuration
fn category_enabled(config: &EngineConfig, category: Category) -> bool {
    match category {
        Category::Data => true,
        Category::ExternalData | Category::Obb => config.backup_external_data,
        Category::DeviceProtectedData => config.backup_device_protected_data,
    }
}

/// File name part of a device path
fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
