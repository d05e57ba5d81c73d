//! vmit - VM install tester
//!
//! Drives an unattended OS installer inside disposable libvirt VMs, one VM
//! per configuration profile, and reports per-phase results.

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::Context as _, Report, Result};
use tokio_util::sync::CancellationToken;

mod classifier;
mod command_run;
mod commands;
mod config;
mod error;
mod hypervisor;
mod machine;
mod orchestrator;
mod phase;
mod readiness;
mod remote;
mod report;
mod runlog;
mod store;
mod utils;

/// Test unattended installers against a matrix of configuration profiles.
///
/// Each profile gets a fresh VM that is provisioned, booted, installed,
/// rebooted into the installed system and validated. Results and per-run
/// logs are kept so that failures can be inspected after the fact.
#[derive(Parser)]
#[command(version)]
struct Cli {
    /// Configuration file (default: built-in profiles and rules)
    #[clap(long, short = 'c', global = true, env = "VMIT_CONFIG")]
    config: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the install test for some or all profiles
    Run(commands::RunOpts),

    /// Show the latest recorded run of each profile
    Status(commands::StatusOpts),

    /// Summarize recorded results; exits non-zero if any run failed
    Report(commands::ReportOpts),

    /// Classify captured installer output with the configured ruleset
    Classify(commands::ClassifyOpts),

    /// Remove leftover instances created by earlier runs
    Clean(commands::CleanOpts),

    /// Inspect the configuration
    #[clap(subcommand)]
    Config(commands::ConfigOpts),
}

/// Install and configure the tracing/logging system.
///
/// Logs go to stderr so that reports on stdout stay machine-readable.
/// Filtered by RUST_LOG, defaulting to 'info'.
fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let format = fmt::format().without_time().with_target(false).compact();

    let fmt_layer = fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

/// Cancel `token` on SIGINT or SIGTERM so that in-flight runs are torn down
/// and recorded as aborted.
fn spawn_signal_handler(rt: &tokio::runtime::Runtime, token: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    rt.spawn(async move {
        let term = async {
            match signal(SignalKind::terminate()) {
                Ok(mut s) => {
                    s.recv().await;
                }
                Err(e) => {
                    tracing::debug!("Cannot listen for SIGTERM: {e}");
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term => {}
        }
        tracing::warn!("Interrupted; aborting runs");
        token.cancel();
    });
}

fn main() -> Result<(), Report> {
    install_tracing();
    color_eyre::install()?;

    let cli = Cli::parse();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Init tokio runtime")?;

    let config = config::Config::load(cli.config.as_deref())?;
    let code = match cli.command {
        Commands::Run(opts) => {
            let cancel = CancellationToken::new();
            spawn_signal_handler(&rt, cancel.clone());
            commands::run(&rt, config, opts, cancel)?
        }
        Commands::Status(opts) => commands::status(&config, opts)?,
        Commands::Report(opts) => commands::show_report(&config, opts)?,
        Commands::Classify(opts) => commands::classify(&config, opts)?,
        Commands::Clean(opts) => commands::clean(&config, opts)?,
        Commands::Config(opts) => commands::config(&config, cli.config.as_deref(), opts)?,
    };
    tracing::debug!("exiting");
    // Ensure we don't block on any spawned tasks
    rt.shutdown_background();
    std::process::exit(code)
}
