//! Integration tests for vmit

use std::process::Output;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use libtest_mimic::{Arguments, Trial};
use serde_json::Value;
use xshell::{cmd, Shell};

pub(crate) use integration_tests::{
    integration_test, libvirt_integration_test, libvirt_tests_enabled, INTEGRATION_TESTS,
    LIBVIRT_INTEGRATION_TEST_LABEL,
};

/// Get the path to the vmit binary, checking VMIT_PATH env var first, then falling back to "vmit"
pub(crate) fn get_vmit_command() -> Result<String> {
    if let Ok(path) = std::env::var("VMIT_PATH") {
        return Ok(path);
    }
    // Force the user to set this if we're running from the project dir
    if let Some(path) = ["target/debug/vmit", "target/release/vmit"]
        .into_iter()
        .find(|p| Utf8Path::new(p).exists())
    {
        return Err(eyre!(
            "Detected {path} - set VMIT_PATH={path} to run using this binary"
        ));
    }
    Ok("vmit".to_owned())
}

/// Captured output from a command with decoded stdout/stderr strings
pub(crate) struct CapturedOutput {
    pub output: Output,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn new(output: Output) -> Self {
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        Self {
            output,
            stdout,
            stderr,
        }
    }

    /// Assert that the command succeeded, printing debug info on failure
    pub fn assert_success(&self, context: &str) {
        assert!(
            self.output.status.success(),
            "{} failed: {}",
            context,
            self.stderr
        );
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.output.status.code()
    }
}

/// Run vmit with `args`, capturing output; the environment never points at a user config.
pub(crate) fn run_vmit(args: &[&str]) -> Result<CapturedOutput> {
    let vmit = get_vmit_command()?;
    let output = std::process::Command::new(&vmit)
        .args(args)
        .env_remove("VMIT_CONFIG")
        .output()
        .with_context(|| format!("Running {vmit}"))?;
    Ok(CapturedOutput::new(output))
}

fn tempdir() -> Result<(tempfile::TempDir, Utf8PathBuf)> {
    let td = tempfile::tempdir()?;
    let path = Utf8PathBuf::try_from(td.path().to_path_buf())?;
    Ok((td, path))
}

/// Write a configuration that keeps state and logs under `dir`.
fn write_config(dir: &Utf8Path, extra: &str) -> Result<Utf8PathBuf> {
    let path = dir.join("vmit.toml");
    let text = format!(
        "[paths]\nstate_file = \"{dir}/state.json\"\nlog_dir = \"{dir}/logs\"\n\n{extra}"
    );
    std::fs::write(&path, text)?;
    Ok(path)
}

fn test_config_check_defaults() -> Result<()> {
    let out = run_vmit(&["config", "check"])?;
    out.assert_success("config check");
    if !out.stdout.contains("built-in defaults: 3 profile(s)") {
        return Err(eyre!("Unexpected output: {}", out.stdout));
    }
    Ok(())
}
integration_test!(test_config_check_defaults);

fn test_config_check_rejects_missing_marker() -> Result<()> {
    let (_td, dir) = tempdir()?;
    let config = write_config(
        &dir,
        "[[rule]]\npattern = \"kernel panic\"\ntag = \"critical\"\n",
    )?;
    let out = run_vmit(&["--config", config.as_str(), "config", "check"])?;
    if out.output.status.success() {
        return Err(eyre!("config check accepted a ruleset without install-complete"));
    }
    if !out.stderr.contains("install-complete") {
        return Err(eyre!("Unexpected error: {}", out.stderr));
    }
    Ok(())
}
integration_test!(test_config_check_rejects_missing_marker);

fn test_classify_log() -> Result<()> {
    let sh = Shell::new()?;
    let vmit = get_vmit_command()?;
    let (_td, dir) = tempdir()?;
    let log = dir.join("install.log");
    std::fs::write(
        &log,
        "Starting install\n\x1b[31merror: Disko partitioning failed\x1b[0m\nInstallation complete\n",
    )?;
    let output = cmd!(sh, "{vmit} classify {log}")
        .env_remove("VMIT_CONFIG")
        .ignore_status()
        .output()?;
    let stdout = String::from_utf8(output.stdout)?;
    let lines: Vec<&str> = stdout.lines().collect();
    if lines.len() != 2 {
        return Err(eyre!("Expected two tagged lines, got: {stdout}"));
    }
    if !lines[0].starts_with("critical:") || !lines[1].starts_with("marker:install-complete") {
        return Err(eyre!("Unexpected classification: {stdout}"));
    }
    // A critical line makes the exit status non-zero
    if output.status.code() != Some(1) {
        return Err(eyre!("Unexpected exit status: {:?}", output.status));
    }
    Ok(())
}
integration_test!(test_classify_log);

fn test_status_and_report_from_state_file() -> Result<()> {
    let (_td, dir) = tempdir()?;
    let config = write_config(&dir, "")?;
    let succeeded = |p: &str| serde_json::json!({ "phase": p, "outcome": "success" });
    let skipped = |p: &str| serde_json::json!({ "phase": p, "outcome": "skipped" });
    let all_succeeded: Vec<Value> = ["provision", "boot", "install", "reboot", "validate"]
        .into_iter()
        .map(succeeded)
        .collect();
    let state = serde_json::json!({
        "version": 1,
        "runs": {
            "vm": {
                "run_id": "20260101000000-0001",
                "profile": "vm",
                "started_at": "2026-01-01T00:00:00Z",
                "finished_at": "2026-01-01T00:20:00Z",
                "state": "done",
                "outcome": "success",
                "phases": all_succeeded,
            },
            "server": {
                "run_id": "20260101000000-0002",
                "profile": "server",
                "started_at": "2026-01-01T00:00:00Z",
                "state": "done",
                "outcome": "failed",
                "phases": [
                    succeeded("provision"),
                    succeeded("boot"),
                    {
                        "phase": "install",
                        "outcome": "failed",
                        "error": "critical installer output: kernel panic",
                        "diagnostic": ["kernel panic - not syncing"]
                    },
                    skipped("reboot"),
                    skipped("validate"),
                ],
                "failure": {
                    "phase": "install",
                    "kind": "critical-install",
                    "message": "critical installer output: kernel panic",
                    "critical_line": "kernel panic - not syncing"
                }
            }
        }
    });
    std::fs::write(dir.join("state.json"), serde_json::to_string_pretty(&state)?)?;

    let out = run_vmit(&["--config", config.as_str(), "report", "--json"])?;
    if out.exit_code() != Some(1) {
        return Err(eyre!("report should fail when a run failed: {}", out.stderr));
    }
    let report: Value = serde_json::from_str(&out.stdout).context("Parsing report JSON")?;
    if report["summary"]["total"] != 2 || report["summary"]["failed"] != 1 {
        return Err(eyre!("Unexpected summary: {}", report["summary"]));
    }

    let out = run_vmit(&["--config", config.as_str(), "status", "server"])?;
    out.assert_success("status server");
    if !out.stdout.contains("kernel panic - not syncing") {
        return Err(eyre!("Diagnostic missing from status: {}", out.stdout));
    }
    Ok(())
}
integration_test!(test_status_and_report_from_state_file);

/// Full pipeline against a real hypervisor, using the configuration named by
/// VMIT_TEST_CONFIG.
fn test_run_single_profile() -> Result<()> {
    let config = std::env::var("VMIT_TEST_CONFIG")
        .context("VMIT_TEST_CONFIG must name a configuration for libvirt tests")?;
    let out = run_vmit(&["--config", &config, "run", "--quiet", "--json", "-p", "vm"])?;
    out.assert_success("run -p vm");
    let report: Value = serde_json::from_str(&out.stdout)?;
    let run = &report["runs"][0];
    if run["outcome"] != "success" {
        return Err(eyre!("Run did not succeed: {run}"));
    }
    Ok(())
}
libvirt_integration_test!(test_run_single_profile);

fn main() {
    // Integration tests are only supported on Linux
    if std::env::consts::OS != "linux" {
        eprintln!(
            "Integration tests are only supported on Linux (current OS: {})",
            std::env::consts::OS
        );
        eprintln!("Skipping all integration tests.");
        std::process::exit(0);
    }

    let args = Arguments::from_args();
    let libvirt = libvirt_tests_enabled();

    let tests: Vec<Trial> = INTEGRATION_TESTS
        .iter()
        .map(|test| {
            let f = test.f;
            let trial = Trial::test(test.name, move || {
                f().map_err(|e| format!("{:?}", e).into())
            });
            if test.libvirt {
                trial
                    .with_kind(LIBVIRT_INTEGRATION_TEST_LABEL)
                    .with_ignored_flag(!libvirt)
            } else {
                trial
            }
        })
        .collect();

    libtest_mimic::run(&args, tests).exit();
}
