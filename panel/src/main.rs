//! Micropanel - Entry Point
//!
//! Operator CLI for the static site release pipeline.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use tracing::{error, info};

use micropanel::deploy::executor::{DeployExecutor, DeployRequest};
use micropanel::logs::{init_logging, LogLevel, LogOptions};
use micropanel::models::deployment::{SiteId, UserId};
use micropanel::storage::settings::{Settings, DEFAULT_SETTINGS_PATH};
use micropanel::utils::version_info;

#[derive(Parser)]
#[command(name = "micropanel")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Archive ingestion and atomic releases for static sites")]
struct Cli {
    /// Settings file
    #[arg(long, global = true, value_name = "PATH", default_value = DEFAULT_SETTINGS_PATH)]
    settings: PathBuf,

    /// Log level, overrides the settings file
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Release an archive (.zip, .tar.gz, .tgz) to a site
    Deploy {
        #[arg(long)]
        site: SiteId,

        /// Uploader recorded in the deploy ledger
        #[arg(long, default_value_t = 0)]
        user: i64,

        archive: PathBuf,
    },

    /// Swap the current and previous releases of a site
    Rollback {
        #[arg(long)]
        site: SiteId,
    },

    /// Show recent deploys of a site
    History {
        #[arg(long)]
        site: SiteId,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Fail deploys left pending by an interrupted run
    Reconcile,

    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Command::Version = cli.command {
        return print_json(&version_info());
    }

    let settings = match load_settings(&cli.settings).await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red(), e);
            return ExitCode::FAILURE;
        }
    };

    let log_options = LogOptions {
        log_level: cli.log_level.unwrap_or(settings.log_level),
        log_dir: settings.log_dir.clone(),
        json_format: settings.log_json,
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    let executor = DeployExecutor::from_settings(&settings);

    match cli.command {
        Command::Deploy {
            site,
            user,
            archive,
        } => deploy(&executor, site, UserId(user), archive).await,
        Command::Rollback { site } => match executor.rollback(site).await {
            Ok(()) => {
                println!("{} site {}", "Rolled back".green(), site);
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Rollback of site {} failed: {}", site, e);
                eprintln!("{} {}", "Rollback failed:".red(), e.summary());
                ExitCode::FAILURE
            }
        },
        Command::History { site, limit } => match executor.list_deploys(site, limit).await {
            Ok(deploys) => print_json(&deploys),
            Err(e) => {
                eprintln!("{} {}", "Unable to read deploy history:".red(), e);
                ExitCode::FAILURE
            }
        },
        Command::Reconcile => match executor.reconcile_pending().await {
            Ok(count) => {
                println!("{} {} interrupted deploys", "Reconciled".green(), count);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{} {}", "Reconcile failed:".red(), e);
                ExitCode::FAILURE
            }
        },
        Command::Version => print_json(&version_info()),
    }
}

async fn load_settings(path: &Path) -> anyhow::Result<Settings> {
    Settings::load(path)
        .await
        .with_context(|| format!("unable to read settings from {}", path.display()))
}

/// Open an archive for upload, returning it with its size and file name
async fn open_upload(path: &Path) -> anyhow::Result<(tokio::fs::File, u64, String)> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("unable to open {}", path.display()))?;
    let size = file
        .metadata()
        .await
        .with_context(|| format!("unable to stat {}", path.display()))?
        .len();
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .context("archive path has no file name")?;
    Ok((file, size, filename))
}

async fn deploy(executor: &DeployExecutor, site: SiteId, user: UserId, archive: PathBuf) -> ExitCode {
    let (file, declared_size, filename) = match open_upload(&archive).await {
        Ok(upload) => upload,
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red(), e);
            return ExitCode::FAILURE;
        }
    };

    info!("Deploying {} ({} bytes) to site {}", archive.display(), declared_size, site);
    let request = DeployRequest {
        site_id: site,
        uploader_id: user,
        filename,
        content: file,
        declared_size,
    };

    match executor.deploy(request).await {
        Ok(deploy) => print_json(&deploy),
        Err(failure) => {
            eprintln!("{} {}", "Deploy failed:".red(), failure.error.summary());
            if let Some(record) = &failure.record {
                eprintln!("deploy id: {}", record.id);
            }
            ExitCode::FAILURE
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to serialize output: {e}");
            ExitCode::FAILURE
        }
    }
}
