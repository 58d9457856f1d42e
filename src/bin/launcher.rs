#![forbid(unsafe_code)]

//! Brings the pipeline up to date, then runs it with the remaining arguments.
//!
//! An update that cannot be completed is logged and skipped; the installed
//! pipeline still runs.

use anyhow::{Context, Result, bail};
use bandfetch_tools::config::{LauncherOverrides, resolve_launcher_settings};
use bandfetch_tools::preflight::ensure_not_root;
use bandfetch_tools::transport::HttpTransport;
use bandfetch_tools::update::{UpdateOutcome, run_self_update};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::process::{Command, ExitCode};

#[derive(Debug, Parser)]
#[command(name = "launcher", version, about = "Update and start the bandfetch pipeline")]
struct Cli {
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Where the remote version marker is published
    #[arg(long)]
    manifest_url: Option<String>,

    /// Pipeline executable to update and run
    #[arg(long)]
    pipeline: Option<PathBuf>,

    /// Run the installed pipeline without checking for updates
    #[arg(long)]
    no_update: bool,

    /// Arguments handed to the pipeline unchanged
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pipeline_args: Vec<String>,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    match run(Cli::parse()) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            log::error!("{err:#}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli) -> Result<u8> {
    ensure_not_root("launcher")?;
    let settings = resolve_launcher_settings(LauncherOverrides {
        env_path: cli.env_file,
        manifest_url: cli.manifest_url,
        pipeline_path: cli.pipeline,
        updates_disabled: cli.no_update,
    })?;

    let transport = HttpTransport::new(settings.http_timeout);
    match run_self_update(&settings, &transport) {
        UpdateOutcome::Installed { version } => info!("Running freshly installed v{version}"),
        UpdateOutcome::UpToDate { version } => info!("Running v{version}"),
        UpdateOutcome::Skipped { reason } => info!("Update skipped: {reason}"),
    }

    if !settings.pipeline_path.is_file() {
        bail!(
            "no pipeline installed at {}",
            settings.pipeline_path.display()
        );
    }
    let status = Command::new(&settings.pipeline_path)
        .args(&cli.pipeline_args)
        .status()
        .with_context(|| format!("starting {}", settings.pipeline_path.display()))?;
    Ok(exit_code(status.code()))
}

/// Signals and out-of-range codes collapse to 1.
fn exit_code(code: Option<i32>) -> u8 {
    code.and_then(|code| u8::try_from(code).ok()).unwrap_or(1)
}
