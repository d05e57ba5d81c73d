//! Subcommand implementations.
//!
//! Each command returns the process exit status; errors that prevent a
//! command from doing its job at all are returned as `Err`.

use std::io::{BufRead, BufReader, IsTerminal as _};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use comfy_table::{presets::UTF8_FULL, Table};
use indicatif::{MultiProgress, ProgressDrawTarget};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classifier::Tag;
use crate::config::Config;
use crate::hypervisor::virsh::Virsh;
use crate::hypervisor::Hypervisor;
use crate::machine::{BaselineLeases, RunContext};
use crate::orchestrator::Orchestrator;
use crate::phase::{Phase, TestRun};
use crate::remote::Ssh;
use crate::report;
use crate::store::RunStateStore;
use crate::utils::{decode_line, INSTANCE_PREFIX};

/// Options for executing test runs.
#[derive(clap::Args, Debug)]
pub(crate) struct RunOpts {
    /// Profile to test; repeat for several (default: every configured profile)
    #[clap(long = "profile", short = 'p')]
    profiles: Vec<String>,

    /// Maximum number of runs in flight (overrides the configuration)
    #[clap(long, short = 'j')]
    concurrency: Option<usize>,

    /// Where to persist run state (overrides the configuration)
    #[clap(long)]
    state_file: Option<Utf8PathBuf>,

    /// Print the final report as JSON
    #[clap(long)]
    json: bool,

    /// Disable progress display
    #[clap(long, short = 'q')]
    quiet: bool,
}

#[derive(clap::Args, Debug)]
pub(crate) struct StatusOpts {
    /// Show details for a single profile
    profile: Option<String>,

    /// Output as structured JSON instead of a table
    #[clap(long)]
    json: bool,
}

#[derive(clap::Args, Debug)]
pub(crate) struct ReportOpts {
    /// Output as structured JSON instead of a table
    #[clap(long)]
    json: bool,
}

#[derive(clap::Args, Debug)]
pub(crate) struct ClassifyOpts {
    /// Read lines from this file instead of standard input
    file: Option<Utf8PathBuf>,

    /// Also print informational lines
    #[clap(long)]
    all: bool,
}

#[derive(clap::Args, Debug)]
pub(crate) struct CleanOpts {
    /// List the instances that would be removed without removing them
    #[clap(long)]
    dry_run: bool,

    /// Also remove instances that are still running, such as those of a
    /// `vmit run` in progress
    #[clap(long)]
    force: bool,
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum ConfigOpts {
    /// Validate the configuration and the ruleset
    Check,
    /// Print the effective configuration
    Show,
}

fn open_store(config: &Config) -> RunStateStore {
    RunStateStore::new(config.paths.state_file.clone())
}

pub(crate) fn run(
    rt: &tokio::runtime::Runtime,
    mut config: Config,
    opts: RunOpts,
    cancel: CancellationToken,
) -> Result<i32> {
    if let Some(path) = opts.state_file {
        config.paths.state_file = path;
    }
    if let Some(n) = opts.concurrency {
        config.concurrency = n;
    }
    config.validate().context("Invalid configuration")?;

    let profiles = if opts.profiles.is_empty() {
        config.profiles.clone()
    } else {
        opts.profiles
            .iter()
            .map(|name| {
                config
                    .profile(name)
                    .cloned()
                    .ok_or_else(|| eyre!("Unknown profile: {name}"))
            })
            .collect::<Result<Vec<_>>>()?
    };

    let progress = if opts.quiet || !std::io::stderr().is_terminal() {
        MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
    } else {
        MultiProgress::new()
    };
    let rules = Arc::new(config.ruleset()?);
    let ctx = RunContext {
        hypervisor: Arc::new(Virsh::new(config.hypervisor.clone())),
        remote: Arc::new(Ssh {
            connect_timeout: config.ssh.connect_timeout,
        }),
        rules,
        progress,
        store: Some(Arc::new(open_store(&config))),
        baselines: BaselineLeases::default(),
        config: Arc::new(config),
    };
    let concurrency = ctx.config.concurrency;
    info!(
        "Testing {} profile(s), {concurrency} at a time",
        profiles.len()
    );

    let orchestrator = Orchestrator::new(Arc::new(ctx), cancel);
    let runs = rt.block_on(orchestrator.run_all(&profiles, concurrency));

    print_runs(&runs, opts.json)?;
    Ok(report::exit_code(&runs))
}

fn print_runs(runs: &[TestRun], json: bool) -> Result<()> {
    if json {
        println!("{}", report::render_json(runs)?);
    } else {
        print!("{}", report::render_table(runs));
    }
    Ok(())
}

fn print_run_detail(run: &TestRun) {
    println!("profile:  {}", run.profile);
    println!("run:      {}", run.run_id);
    println!("state:    {}", run.state);
    println!("outcome:  {}", run.outcome);
    if let Some(phase) = run.current_phase() {
        println!("phase:    {phase}");
    }
    if let Some(vm) = &run.instance {
        println!("instance: {} ({})", vm.name, vm.state);
    }
    if let Some(path) = &run.log_path {
        println!("log:      {path}");
    }
    if !run.markers.is_empty() {
        println!("markers:  {}", run.markers.join(", "));
    }
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["PHASE", "OUTCOME", "DURATION", "ERROR"]);
    for rec in &run.phases {
        table.add_row(vec![
            rec.phase.to_string(),
            rec.outcome.to_string(),
            rec.duration_secs()
                .map(|s| format!("{s:.1}s"))
                .unwrap_or_default(),
            rec.error.clone().unwrap_or_default(),
        ]);
    }
    println!("{table}");
    let failed = run.failure.as_ref().map(|f| f.phase);
    if let Some(phase) = failed {
        let diag = &run.record(phase).diagnostic;
        if !diag.is_empty() {
            println!("last output of {phase}:");
            for line in diag {
                println!("  {line}");
            }
        }
    }
}

pub(crate) fn status(config: &Config, opts: StatusOpts) -> Result<i32> {
    let store = open_store(config);
    let runs = store.load_all()?;
    match opts.profile {
        Some(name) => {
            let run = runs
                .get(&name)
                .ok_or_else(|| eyre!("No recorded run for profile {name}"))?;
            if opts.json {
                println!("{}", serde_json::to_string_pretty(run)?);
            } else {
                print_run_detail(run);
            }
        }
        None => {
            if runs.is_empty() && !opts.json {
                println!("No runs recorded in {}", store.path());
                return Ok(0);
            }
            let runs: Vec<_> = runs.into_values().collect();
            print_runs(&runs, opts.json)?;
        }
    }
    Ok(0)
}

/// Report on the latest run of every profile; fails if any of them failed.
pub(crate) fn show_report(config: &Config, opts: ReportOpts) -> Result<i32> {
    let runs: Vec<_> = open_store(config).load_all()?.into_values().collect();
    print_runs(&runs, opts.json)?;
    Ok(report::exit_code(&runs))
}

fn describe(tag: &Tag) -> String {
    match tag {
        Tag::Informational => "-".to_owned(),
        Tag::PhaseMarker(name) => format!("marker:{name}"),
        Tag::CriticalError(pattern) => format!("critical:{pattern}"),
    }
}

/// Run the ruleset over a captured log; exits non-zero if a critical line is found.
pub(crate) fn classify(config: &Config, opts: ClassifyOpts) -> Result<i32> {
    let rules = config.ruleset()?;
    let mut reader: Box<dyn BufRead> = match &opts.file {
        Some(path) => Box::new(BufReader::new(
            std::fs::File::open(path).with_context(|| format!("Opening {path}"))?,
        )),
        None => Box::new(BufReader::new(std::io::stdin())),
    };
    let mut critical = 0usize;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).context("Reading input")? == 0 {
            break;
        }
        let line = decode_line(&buf);
        let ev = rules.classify(&line, Phase::Install);
        if matches!(ev.tag, Tag::CriticalError(_)) {
            critical += 1;
        }
        if opts.all || ev.tag != Tag::Informational {
            println!("{}\t{}", describe(&ev.tag), ev.raw);
        }
    }
    Ok(if critical > 0 { 1 } else { 0 })
}

/// Destroy every instance this tool created that is still defined.
///
/// Running instances may belong to a `vmit run` in progress and are left
/// alone unless `--force` is given. Idle baselines kept by
/// `teardown = revert` are removed; the next run recreates them.
pub(crate) fn clean(config: &Config, opts: CleanOpts) -> Result<i32> {
    let hv = Virsh::new(config.hypervisor.clone());
    clean_instances(&hv, &opts)
}

fn clean_instances(hv: &dyn Hypervisor, opts: &CleanOpts) -> Result<i32> {
    let names = hv.list_instances(INSTANCE_PREFIX)?;
    if names.is_empty() {
        println!("No instances to remove");
        return Ok(0);
    }
    let mut failed = 0;
    for name in names {
        let vm = hv.adopt(&name);
        if !opts.force {
            match hv.is_active(&vm) {
                Ok(false) => {}
                Ok(true) => {
                    println!("skipping running instance {name} (use --force)");
                    continue;
                }
                Err(e) => {
                    warn!("Cannot query {name}, skipping: {e}");
                    failed += 1;
                    continue;
                }
            }
        }
        if opts.dry_run {
            println!("would remove {name}");
            continue;
        }
        // Snapshot data must go before the domain can be undefined cleanly
        for snap in hv.snapshot_list(&vm).unwrap_or_default() {
            if let Err(e) = hv.snapshot_delete(&vm, &snap) {
                debug!("Deleting snapshot {snap} of {name}: {e}");
            }
        }
        match hv.destroy(&vm) {
            Ok(()) => println!("removed {name}"),
            Err(e) => {
                warn!("Failed to remove {name}: {e}");
                failed += 1;
            }
        }
    }
    Ok(if failed > 0 { 1 } else { 0 })
}

pub(crate) fn config(config: &Config, path: Option<&Utf8Path>, opts: ConfigOpts) -> Result<i32> {
    match opts {
        ConfigOpts::Check => {
            config.validate()?;
            println!(
                "{}: {} profile(s), {} rule(s)",
                path.map(|p| p.as_str()).unwrap_or("built-in defaults"),
                config.profiles.len(),
                config.rules.len()
            );
        }
        ConfigOpts::Show => {
            print!("{}", toml::to_string_pretty(config)?);
        }
    }
    Ok(0)
}
