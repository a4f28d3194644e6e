use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};

use abx_engine::{
    BackupOrchestrator, BatchReport, BatchRunner, EngineConfig, Mode, RestoreOrchestrator,
    archive::Encryption,
    location::{BackupLocation, ConfiguredRoot, StoredBackup},
    logging::setup_logging,
    models::{AppInfo, PackageName},
    package::{PackageInfoProvider, PmPackageProvider},
    shell::PrivilegedExecutor,
    transport::{FileTransport, LocalTransport, ShellTransport},
};
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{Level, error, info};

#[derive(Parser)]
#[command(name = "abx", version, about = "Backs up and restores Android apps with root access")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(long, global = true, default_value = "abx.json")]
    config: PathBuf,

    /// Directory for rolling log files
    #[arg(long, global = true, default_value = "logs")]
    logs: PathBuf,

    /// Print debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Back up one or more installed packages
    Backup {
        #[arg(required = true)]
        packages: Vec<PackageName>,
        /// Only the APKs
        #[arg(long)]
        apk: bool,
        /// Only the data directories
        #[arg(long)]
        data: bool,
        /// Android user profile
        #[arg(long, default_value_t = 0)]
        user: u32,
    },
    /// Restore the latest (or a named) backup of one or more packages
    Restore {
        #[arg(required = true)]
        packages: Vec<PackageName>,
        /// Instance directory name, as printed by `list`; only valid with a single package
        #[arg(long)]
        instance: Option<String>,
        #[arg(long)]
        apk: bool,
        #[arg(long)]
        data: bool,
        #[arg(long, default_value_t = 0)]
        user: u32,
    },
    /// List the stored backups of a package, oldest first
    List { package: PackageName },
    /// Delete one backup instance of a package
    Delete { package: PackageName, instance: String },
    /// Uninstall a user app
    Uninstall {
        package: PackageName,
        #[arg(long, default_value_t = 0)]
        user: u32,
    },
    /// Delete the cache directories of an app
    WipeCache {
        package: PackageName,
        #[arg(long, default_value_t = 0)]
        user: u32,
    },
    /// Enable a package for the given users (all users when none are given)
    Enable {
        package: PackageName,
        #[arg(long = "user")]
        users: Vec<u32>,
    },
    /// Disable a package for the given users (all users when none are given)
    Disable {
        package: PackageName,
        #[arg(long = "user")]
        users: Vec<u32>,
    },
    /// List the device's user profiles
    Users,
    /// List disabled packages
    Disabled,
}

impl Command {
    /// Commands that only talk to the package manager and need no backup location
    fn is_package_command(&self) -> bool {
        matches!(
            self,
            Self::Uninstall { .. }
                | Self::WipeCache { .. }
                | Self::Enable { .. }
                | Self::Disable { .. }
                | Self::Users
                | Self::Disabled
        )
    }
}

/// Everything a command needs, built once from the config
struct Engine {
    config: EngineConfig,
    executor: PrivilegedExecutor,
    live: Arc<dyn FileTransport>,
    location: BackupLocation,
    encryption: Option<Encryption>,
}

impl Engine {
    async fn new(config: EngineConfig, executor: PrivilegedExecutor) -> Result<Self> {
        // no cipher is compiled into this binary
        let encryption = Encryption::from_config(&config, None)?;
        let live: Arc<dyn FileTransport> = Arc::new(ShellTransport::new(executor.clone()));
        let location =
            BackupLocation::open(&ConfiguredRoot::new(&config), Arc::new(LocalTransport::new()))
                .await
                .context("Failed to open backup location")?;
        Ok(Self { config, executor, live, location, encryption })
    }

    fn runner(&self) -> BatchRunner {
        BatchRunner::new(self.config.max_parallel_apps)
    }

    async fn apps(&self, packages: Vec<PackageName>, user: u32) -> Result<Vec<AppInfo>> {
        let provider = PmPackageProvider::new(self.executor.clone());
        let mut apps = Vec::with_capacity(packages.len());
        for package in packages {
            apps.push(provider.app_info(&package, user).await?);
        }
        Ok(apps)
    }

    async fn backup(&self, packages: Vec<PackageName>, mode: Mode, user: u32) -> Result<BatchReport> {
        let apps = self.apps(packages, user).await?;
        let orchestrator = BackupOrchestrator::new(
            self.config.clone(),
            self.live.clone(),
            self.location.clone(),
            self.encryption.clone(),
        );
        Ok(self.runner().backup_all(&orchestrator, apps, mode).await)
    }

    async fn restore(
        &self,
        packages: Vec<PackageName>,
        instance: Option<String>,
        mode: Mode,
        user: u32,
    ) -> Result<BatchReport> {
        if instance.is_some() && packages.len() > 1 {
            bail!("--instance can only be used with a single package");
        }
        let mut jobs = Vec::with_capacity(packages.len());
        for app in self.apps(packages, user).await? {
            let backup = self.find_backup(&app.package, instance.as_deref()).await?;
            jobs.push((app, backup));
        }
        let orchestrator = RestoreOrchestrator::new(
            self.config.clone(),
            self.executor.clone(),
            self.live.clone(),
            self.location.clone(),
            self.encryption.clone(),
        );
        Ok(self.runner().restore_all(&orchestrator, jobs, mode).await)
    }

    async fn find_backup(&self, package: &PackageName, name: Option<&str>) -> Result<StoredBackup> {
        let found = match name {
            None => self.location.latest(package).await?,
            Some(name) => self
                .location
                .instances(package)
                .await?
                .into_iter()
                .find(|backup| backup.instance.name() == name),
        };
        found.with_context(|| match name {
            Some(name) => format!("No backup named {name} for {package}"),
            None => format!("No backups found for {package}"),
        })
    }

    async fn list(&self, package: &PackageName) -> Result<()> {
        for backup in self.location.instances(package).await? {
            let manifest = &backup.manifest;
            println!(
                "{}\t{} ({})\tapk={} data={} external={} obb={} device_protected={}",
                backup.instance.name(),
                manifest.version_name,
                manifest.version_code,
                manifest.has_apk,
                manifest.has_app_data,
                manifest.has_external_data,
                manifest.has_obb_data,
                manifest.has_devices_protected_data,
            );
        }
        Ok(())
    }

    async fn delete(&self, package: &PackageName, name: &str) -> Result<()> {
        let backup = self.find_backup(package, Some(name)).await?;
        self.location.delete_instance(backup.instance.path()).await
    }

    /// Logs the report and appends failures to `errors.log` in the backup root
    async fn finish(&self, report: BatchReport) -> Result<ExitCode> {
        for package in &report.succeeded {
            println!("ok\t{package}");
        }
        for err in &report.failed {
            println!("failed\t{}\t{err}", err.package());
        }
        let log = Path::new(self.location.root()).join("errors.log");
        report.write_error_log(&log).await?;
        Ok(if report.is_success() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = EngineConfig::load(&cli.config)?;
    let executor = PrivilegedExecutor::new(&config).await?;
    if cli.command.is_package_command() {
        return run_package_command(cli.command, PmPackageProvider::new(executor)).await;
    }

    let engine = Engine::new(config, executor).await?;
    match cli.command {
        Command::Backup { packages, apk, data, user } => {
            let report = engine.backup(packages, Mode::from_flags(apk, data), user).await?;
            engine.finish(report).await
        }
        Command::Restore { packages, instance, apk, data, user } => {
            let report =
                engine.restore(packages, instance, Mode::from_flags(apk, data), user).await?;
            engine.finish(report).await
        }
        Command::List { package } => {
            engine.list(&package).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Delete { package, instance } => {
            engine.delete(&package, &instance).await?;
            Ok(ExitCode::SUCCESS)
        }
        _ => bail!("Not a backup command"),
    }
}

async fn run_package_command(command: Command, provider: PmPackageProvider) -> Result<ExitCode> {
    match command {
        Command::Uninstall { package, user } => {
            let app = provider.app_info(&package, user).await?;
            if !app.is_installed() {
                bail!("{package} is not installed");
            }
            provider.uninstall(&app).await?;
        }
        Command::WipeCache { package, user } => {
            let app = provider.app_info(&package, user).await?;
            provider.wipe_cache(&app).await?;
        }
        Command::Enable { package, users } => set_enabled(&provider, &package, users, true).await?,
        Command::Disable { package, users } => {
            set_enabled(&provider, &package, users, false).await?
        }
        Command::Users => {
            for user in provider.list_users().await? {
                println!("{user}");
            }
        }
        Command::Disabled => {
            for package in provider.disabled_packages().await? {
                println!("{package}");
            }
        }
        Command::Backup { .. }
        | Command::Restore { .. }
        | Command::List { .. }
        | Command::Delete { .. } => bail!("Not a package command"),
    }
    Ok(ExitCode::SUCCESS)
}

/// Applies to every user profile when `users` is empty
async fn set_enabled(
    provider: &PmPackageProvider,
    package: &PackageName,
    users: Vec<u32>,
    enabled: bool,
) -> Result<()> {
    let users = if users.is_empty() { provider.list_users().await? } else { users };
    provider.set_enabled(package, &users, enabled).await
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let _guard = match setup_logging(&cli.logs, level) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Failed to setup logging: {e:#}");
            None
        }
    };
    info!(version = env!("CARGO_PKG_VERSION"), "Starting abx");

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = format!("{e:#}"), "Command failed");
            ExitCode::FAILURE
        }
    }
}
