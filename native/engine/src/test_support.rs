//! Scratch environment for tests that run the real command strings.
//!
//! `env PATH=<bin>:… sh -c` stands in for `su -c`, and a wrapper script stands in for the toolbox so
//! GNU `ls -Al` prints the same eight-field lines as toybox.

use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use tempfile::TempDir;

use crate::{
    config::EngineConfig,
    models::{ApkSet, AppInfo, DataDirs, PackageName},
    shell::PrivilegedExecutor,
};

const TOOLBOX_SCRIPT: &str = r#"#!/bin/sh
if [ "$1" = "--version" ]; then echo "test toolbox 1.0"; exit 0; fi
TIME_STYLE=long-iso QUOTING_STYLE=literal LC_ALL=C exec "$@"
"#;

pub(crate) struct TestEnv {
    dir: TempDir,
}

impl TestEnv {
    pub(crate) fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        fs_err::create_dir_all(&bin).unwrap();
        fs_err::create_dir_all(dir.path().join("fs")).unwrap();
        let toolbox = bin.join("test-toolbox");
        fs_err::write(&toolbox, TOOLBOX_SCRIPT).unwrap();
        fs_err::set_permissions(&toolbox, std::fs::Permissions::from_mode(0o755)).unwrap();
        Self { dir }
    }

    /// Scratch filesystem root, separate from the toolbox script
    pub(crate) fn root(&self) -> PathBuf {
        self.dir.path().join("fs")
    }

    /// Creates `relative` (and its parents) under [`root`](Self::root)
    pub(crate) fn mkdir(&self, relative: &str) -> PathBuf {
        let path = self.root().join(relative);
        fs_err::create_dir_all(&path).unwrap();
        path
    }

    pub(crate) fn write(&self, relative: &str, contents: &[u8]) -> PathBuf {
        let path = self.root().join(relative);
        if let Some(parent) = path.parent() {
            fs_err::create_dir_all(parent).unwrap();
        }
        fs_err::write(&path, contents).unwrap();
        path
    }

    pub(crate) fn config(&self) -> EngineConfig {
        EngineConfig {
            toolbox_path: self.dir.path().join("bin/test-toolbox").to_string_lossy().into_owned(),
            toolbox_fallbacks: Vec::new(),
            root_shell: self.shell(),
            user_shell: self.shell(),
            backup_root: Some(self.mkdir("backups").to_string_lossy().into_owned()),
            package_staging_dir: self.mkdir("staging").to_string_lossy().into_owned(),
            fallback_staging_dir: self.root().join("fallback-staging").to_string_lossy().into_owned(),
            ownership_settle_delay_ms: 0,
            ..Default::default()
        }
    }

    /// Installs an executable script named `name` ahead of the system tools on `PATH`
    pub(crate) fn install_tool(&self, name: &str, script: &str) -> PathBuf {
        let path = self.dir.path().join("bin").join(name);
        fs_err::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        fs_err::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn shell(&self) -> Vec<String> {
        let bin = self.dir.path().join("bin");
        let path = format!("PATH={}:{}", bin.display(), std::env::var("PATH").unwrap_or_default());
        vec!["env".to_string(), path, "sh".to_string(), "-c".to_string()]
    }

    pub(crate) async fn executor(&self) -> PrivilegedExecutor {
        PrivilegedExecutor::new(&self.config()).await.unwrap()
    }
}

pub(crate) fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// An installed app whose directories live under the scratch root:
/// `data/<pkg>`, `user_de/<pkg>`, `external/<pkg>` and `obb/<pkg>`, with `app/<pkg>/base.apk`
pub(crate) fn scratch_app(env: &TestEnv, package: &str) -> AppInfo {
    let package = PackageName::parse(package).unwrap();
    let dir = |name: &str| path_str(&env.root().join(name).join(package.as_str()));
    AppInfo {
        data_dirs: DataDirs {
            data: dir("data"),
            device_protected: dir("user_de"),
            external: dir("external"),
            obb: dir("obb"),
        },
        apk: Some(ApkSet {
            base: path_str(&env.write(&format!("app/{package}/base.apk"), b"base apk")),
            splits: Vec::new(),
        }),
        package,
        label: "Example".to_string(),
        version_name: "1.0".to_string(),
        version_code: 1,
        profile_id: 0,
        is_system: false,
    }
}
