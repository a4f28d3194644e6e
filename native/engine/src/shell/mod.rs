mod stream;

use std::{fmt::Display, process::Stdio};

use anyhow::{Context, Result, ensure};
use tokio::process::Command;
use tracing::{debug, error, info, instrument, trace, warn};

pub use stream::{ShellReader, ShellWriter};

use crate::{config::EngineConfig, error::ShellError};

/// Which shell a command is run through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    Root,
    User,
}

/// Captured outcome of one executor invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellResult {
    pub exit_code: i32,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl ShellResult {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stderr_contains(&self, needle: &str) -> bool {
        self.stderr.iter().any(|line| line.contains(needle))
    }

    /// Converts a failed result into the error a strict invocation would have returned
    pub fn into_failure(self, command: impl Into<String>) -> ShellError {
        ShellError::CommandFailed {
            command: command.into(),
            exit_code: self.exit_code,
            stdout: self.stdout,
            stderr: self.stderr,
        }
    }
}

/// A toolbox binary that answered `--version`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolbox {
    pub path: String,
    pub version: String,
}

/// Wraps `value` in double quotes, escaping the characters the shell still expands there
pub fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if matches!(c, '\\' | '"' | '$' | '`') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

fn output_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes).lines().map(str::to_string).collect()
}

/// Runs shell commands as root or as the invoking user.
///
/// The toolbox is resolved once at construction; build a new executor to re-resolve it.
#[derive(Debug, Clone)]
pub struct PrivilegedExecutor {
    root_shell: Vec<String>,
    user_shell: Vec<String>,
    toolbox: Toolbox,
}

impl PrivilegedExecutor {
    /// Creates an executor and verifies a usable toolbox.
    ///
    /// Fails with [`ShellError::ToolboxUnavailable`] when no candidate answers `--version`.
    #[instrument(level = "debug", skip(config), err)]
    pub async fn new(config: &EngineConfig) -> Result<Self> {
        ensure!(!config.root_shell.is_empty(), "Root shell command must not be empty");
        ensure!(!config.user_shell.is_empty(), "User shell command must not be empty");

        let mut executor = Self {
            root_shell: config.root_shell.clone(),
            user_shell: config.user_shell.clone(),
            toolbox: Toolbox { path: String::new(), version: String::new() },
        };
        executor.toolbox = executor.resolve_toolbox(&config.toolbox_candidates()).await?;
        Ok(executor)
    }

    pub fn toolbox(&self) -> &Toolbox {
        &self.toolbox
    }

    /// Prefixes `args` with the toolbox path, e.g. `toybox ls -Al "<path>"`
    pub fn toolbox_cmd(&self, args: impl Display) -> String {
        format!("{} {args}", self.toolbox.path)
    }

    async fn resolve_toolbox(&self, candidates: &[String]) -> Result<Toolbox> {
        let mut tried = Vec::with_capacity(candidates.len());
        let mut last_error = None;
        for candidate in candidates {
            let path = which::which(candidate)
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|_| candidate.clone());
            match self.verify_toolbox(&path).await {
                Ok(toolbox) => {
                    info!(path = %toolbox.path, version = %toolbox.version, "Using toolbox");
                    return Ok(toolbox);
                }
                Err(e) => {
                    warn!(path = %path, error = format!("{e:#}"), "Toolbox candidate is not usable");
                    tried.push(path);
                    last_error = Some(e);
                }
            }
        }
        Err(ShellError::ToolboxUnavailable { tried, source: last_error.map(Into::into) }.into())
    }

    /// Runs `<path> --version` and returns the reported version
    #[instrument(level = "debug", skip(self), err)]
    pub async fn verify_toolbox(&self, path: &str) -> Result<Toolbox> {
        let result = self.run_checked(Privilege::User, &[format!("{path} --version")]).await?;
        let version = if result.stdout.is_empty() {
            "not returned".to_string()
        } else {
            result.stdout.join(" ")
        };
        Ok(Toolbox { path: path.to_string(), version })
    }

    fn command(&self, privilege: Privilege, script: &str) -> Result<Command> {
        let shell = match privilege {
            Privilege::Root => &self.root_shell,
            Privilege::User => &self.user_shell,
        };
        let (program, args) = shell.split_first().context("Shell command is empty")?;
        let mut cmd = Command::new(program);
        cmd.args(args).arg(script);
        Ok(cmd)
    }

    /// Runs `commands` in one shell and returns the result whatever the exit code.
    ///
    /// Commands are joined as given; callers quote their own arguments.
    #[instrument(level = "debug", skip(self, commands), err)]
    pub async fn run<S: AsRef<str>>(
        &self,
        privilege: Privilege,
        commands: &[S],
    ) -> Result<ShellResult> {
        ensure!(!commands.is_empty(), "No commands to run");
        let script = commands.iter().map(AsRef::as_ref).collect::<Vec<_>>().join("\n");

        let output = self
            .command(privilege, &script)?
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to spawn shell for `{script}`"))?;
        let result = ShellResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: output_lines(&output.stdout),
            stderr: output_lines(&output.stderr),
        };
        debug!(command = %script, ?privilege, exit_code = result.exit_code, "Shell command finished");
        trace!(stdout = ?result.stdout, stderr = ?result.stderr, "Shell command output");
        Ok(result)
    }

    /// Like [`run`](Self::run), but a non-zero exit code is a [`ShellError::CommandFailed`]
    #[instrument(level = "debug", skip(self, commands), err)]
    pub async fn run_checked<S: AsRef<str>>(
        &self,
        privilege: Privilege,
        commands: &[S],
    ) -> Result<ShellResult> {
        let result = self.run(privilege, commands).await?;
        if !result.is_success() {
            let command = commands.iter().map(AsRef::as_ref).collect::<Vec<_>>().join("; ");
            error!(
                command = %command,
                exit_code = result.exit_code,
                stderr = ?result.stderr,
                "Shell command returned non-zero exit code"
            );
            return Err(result.into_failure(command).into());
        }
        Ok(result)
    }

    /// Streams the contents of `path` through `cat`
    #[instrument(level = "debug", skip(self), err)]
    pub fn open_read(&self, privilege: Privilege, path: &str) -> Result<ShellReader> {
        let script = format!("cat {}", quote(path));
        let cmd = self.command(privilege, &script)?;
        ShellReader::spawn(cmd, script).with_context(|| format!("Failed to open {path} for reading"))
    }

    /// Streams into `path` through `cat >`, truncating it. Must be shut down to complete.
    #[instrument(level = "debug", skip(self), err)]
    pub fn open_write(&self, privilege: Privilege, path: &str) -> Result<ShellWriter> {
        let script = format!("cat > {}", quote(path));
        let cmd = self.command(privilege, &script)?;
        ShellWriter::spawn(cmd, script).with_context(|| format!("Failed to open {path} for writing"))
    }
}
