use std::fmt;

use super::{BackupManifest, DataDirs};

/// Data categories archived per app, in backup/restore order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Data,
    ExternalData,
    Obb,
    DeviceProtectedData,
}

impl Category {
    pub const ALL: [Category; 4] =
        [Category::Data, Category::ExternalData, Category::Obb, Category::DeviceProtectedData];

    /// Name of the archive (or directory) inside a backup instance
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::ExternalData => "external_files",
            Self::Obb => "obb_files",
            Self::DeviceProtectedData => "device_protected_files",
        }
    }

    /// OBB files are already compressed containers and are stored as a plain directory
    pub fn is_archived(self) -> bool {
        self != Self::Obb
    }

    /// Restored directories whose ownership is re-applied after extraction
    pub fn needs_chown(self) -> bool {
        matches!(self, Self::Data | Self::DeviceProtectedData)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl DataDirs {
    /// Live directory holding `category`
    pub fn dir(&self, category: Category) -> &str {
        match category {
            Category::Data => &self.data,
            Category::ExternalData => &self.external,
            Category::Obb => &self.obb,
            Category::DeviceProtectedData => &self.device_protected,
        }
    }
}

impl BackupManifest {
    pub fn has(&self, category: Category) -> bool {
        match category {
            Category::Data => self.has_app_data,
            Category::ExternalData => self.has_external_data,
            Category::Obb => self.has_obb_data,
            Category::DeviceProtectedData => self.has_devices_protected_data,
        }
    }

    pub fn set_has(&mut self, category: Category, present: bool) {
        let flag = match category {
            Category::Data => &mut self.has_app_data,
            Category::ExternalData => &mut self.has_external_data,
            Category::Obb => &mut self.has_obb_data,
            Category::DeviceProtectedData => &mut self.has_devices_protected_data,
        };
        *flag = present;
    }
}
