use std::{error::Error as StdError, fmt, path::PathBuf};

use thiserror::Error;

use crate::models::Category;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Failures reported by the privileged executor
#[derive(Debug, Error)]
pub enum ShellError {
    /// A strict invocation exited with a non-zero code
    #[error("command `{command}` failed with exit code {exit_code}: {}", stderr.join("; "))]
    CommandFailed { command: String, exit_code: i32, stdout: Vec<String>, stderr: Vec<String> },

    /// None of the configured toolbox binaries answered `--version`
    #[error("no usable toolbox found (tried {})", tried.join(", "))]
    ToolboxUnavailable {
        tried: Vec<String>,
        #[source]
        source: Option<BoxError>,
    },

    /// The command succeeded but its output did not have the expected shape
    #[error("unexpected result from `{command}`: {reason}")]
    UnexpectedResult { command: String, reason: String, stdout: Vec<String> },
}

impl ShellError {
    /// Exit code of a failed command, if this is a command failure
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::CommandFailed { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }

    /// Captured stderr lines of a failed command
    pub fn stderr(&self) -> &[String] {
        match self {
            Self::CommandFailed { stderr, .. } => stderr,
            _ => &[],
        }
    }
}

#[derive(Debug, Error)]
pub enum OwnershipError {
    #[error("could not resolve ownership of {}", path.display())]
    Unresolved {
        path: PathBuf,
        #[source]
        source: BoxError,
    },
}

/// Reasons the backup root cannot be used
#[derive(Debug, Error)]
pub enum LocationError {
    #[error("backup location is not configured")]
    NotConfigured,
    #[error("backup location is not accessible: {}", path.display())]
    NotAccessible { path: PathBuf },
}

/// The step an orchestrator failure is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedStep {
    /// Creating the backup instance or opening the backup
    Setup,
    /// Copying APKs into the backup
    Apk,
    Category(Category),
    ApkInstall,
    Manifest,
}

impl fmt::Display for FailedStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup => f.write_str("setup"),
            Self::Apk => f.write_str("apk"),
            Self::Category(category) => f.write_str(category.dir_name()),
            Self::ApkInstall => f.write_str("apk install"),
            Self::Manifest => f.write_str("manifest"),
        }
    }
}

/// Per-app result of a failed backup or restore
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("backup of {package} failed at {step}: {source}")]
    BackupFailed {
        package: String,
        step: FailedStep,
        #[source]
        source: BoxError,
    },
    #[error("restore of {package} failed at {step}: {source}")]
    RestoreFailed {
        package: String,
        step: FailedStep,
        #[source]
        source: BoxError,
    },
}

impl ActionError {
    pub(crate) fn backup(package: &str, step: FailedStep, source: anyhow::Error) -> Self {
        Self::BackupFailed { package: package.to_string(), step, source: source.into() }
    }

    pub(crate) fn restore(package: &str, step: FailedStep, source: anyhow::Error) -> Self {
        Self::RestoreFailed { package: package.to_string(), step, source: source.into() }
    }

    pub fn package(&self) -> &str {
        match self {
            Self::BackupFailed { package, .. } | Self::RestoreFailed { package, .. } => package,
        }
    }

    pub fn step(&self) -> &FailedStep {
        match self {
            Self::BackupFailed { step, .. } | Self::RestoreFailed { step, .. } => step,
        }
    }

    /// Walks the source chain looking for a shell failure
    pub fn shell_error(&self) -> Option<&ShellError> {
        let mut current: Option<&(dyn StdError + 'static)> = StdError::source(self);
        while let Some(err) = current {
            if let Some(shell) = err.downcast_ref::<ShellError>() {
                return Some(shell);
            }
            current = err.source();
        }
        None
    }
}
