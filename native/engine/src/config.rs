use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use derive_more::Debug;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

/// Engine configuration, loaded once and passed into the executor and orchestrators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Toolbox binary providing `ls`/`stat`/`chown`/`rm`
    pub toolbox_path: String,
    /// Tried in order when `toolbox_path` does not answer `--version`
    pub toolbox_fallbacks: Vec<String>,
    /// Shell prefix for privileged commands; the script is appended as the last argument
    pub root_shell: Vec<String>,
    /// Shell prefix for commands run as the invoking user
    pub user_shell: Vec<String>,
    /// Backup root; `None` means not configured
    pub backup_root: Option<String>,
    /// Skip `cache`, `code_cache` and `lib` when backing up data
    pub exclude_cache: bool,
    pub backup_external_data: bool,
    pub backup_device_protected_data: bool,
    /// Stream encryption password. Archives are written in plain text when unset.
    #[debug(skip)]
    pub password: Option<String>,
    #[debug(skip)]
    pub crypto_salt: Option<String>,
    /// Installer-readable directory APKs are staged in before `pm install`
    pub package_staging_dir: String,
    /// Used when `package_staging_dir` cannot be written
    pub fallback_staging_dir: String,
    /// Delay before reading ownership of a freshly installed package's directories
    pub ownership_settle_delay_ms: u64,
    /// `cmd package install` instead of `pm install`
    pub use_cmd_package_install: bool,
    pub max_parallel_apps: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            toolbox_path: "toybox".to_string(),
            toolbox_fallbacks: vec!["busybox".to_string()],
            root_shell: vec!["su".to_string(), "-c".to_string()],
            user_shell: vec!["sh".to_string(), "-c".to_string()],
            backup_root: None,
            exclude_cache: true,
            backup_external_data: true,
            backup_device_protected_data: true,
            password: None,
            crypto_salt: None,
            package_staging_dir: "/data/local/tmp".to_string(),
            fallback_staging_dir: "/sdcard/Android/data/abx/cache/apkTmp".to_string(),
            ownership_settle_delay_ms: 1000,
            use_cmd_package_install: true,
            max_parallel_apps: 1,
        }
    }
}

impl EngineConfig {
    /// Loads the config file, falling back to defaults if it doesn't exist
    #[instrument(level = "debug")]
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "Config file doesn't exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs_err::read_to_string(path).context("Failed to read config file")?;
        let config: Self = serde_json::from_str(&content).context("Failed to parse config file")?;
        debug!(?config, "Loaded engine config");
        Ok(config)
    }

    #[instrument(level = "debug", skip(self))]
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs_err::create_dir_all(parent).context("Failed to create config directory")?;
        }
        fs_err::write(path, json).context("Failed to write config file")?;
        info!(path = %path.display(), "Saved engine config");
        Ok(())
    }

    pub fn ownership_settle_delay(&self) -> Duration {
        Duration::from_millis(self.ownership_settle_delay_ms)
    }

    /// Toolbox candidates in lookup order, without duplicates
    pub fn toolbox_candidates(&self) -> Vec<String> {
        let mut candidates = vec![self.toolbox_path.clone()];
        for fallback in &self.toolbox_fallbacks {
            if !candidates.contains(fallback) {
                candidates.push(fallback.clone());
            }
        }
        candidates
    }

    pub fn is_encrypted(&self) -> bool {
        self.password.as_deref().is_some_and(|p| !p.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(&dir.path().join("engine.json")).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.ownership_settle_delay(), Duration::from_secs(1));
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        fs_err::write(&path, r#"{"toolbox_path": "/system/bin/toybox", "exclude_cache": false}"#)
            .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.toolbox_path, "/system/bin/toybox");
        assert!(!config.exclude_cache);
        assert_eq!(config.root_shell, vec!["su", "-c"]);
        assert_eq!(config.package_staging_dir, "/data/local/tmp");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        fs_err::write(&path, "{ not json").unwrap();
        let err = EngineConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse config file"));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("engine.json");
        let config = EngineConfig {
            backup_root: Some("/sdcard/abx".to_string()),
            password: Some("hunter2".to_string()),
            max_parallel_apps: 4,
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn toolbox_candidates_are_deduplicated() {
        let config = EngineConfig {
            toolbox_path: "busybox".to_string(),
            toolbox_fallbacks: vec!["busybox".to_string(), "toybox".to_string()],
            ..Default::default()
        };
        assert_eq!(config.toolbox_candidates(), vec!["busybox", "toybox"]);
    }

    #[test]
    fn password_is_not_debug_printed() {
        let config = EngineConfig { password: Some("hunter2".to_string()), ..Default::default() };
        assert!(!format!("{config:?}").contains("hunter2"));
        assert!(config.is_encrypted());
    }
}
