//! Human and JSON views of run results.

use comfy_table::{presets::UTF8_FULL, Table};
use serde::Serialize;
use strum::IntoEnumIterator as _;

use crate::phase::{Phase, PhaseOutcome, RunOutcome, TestRun};

/// Aggregate counts over a set of runs.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub aborted: usize,
    pub skipped: usize,
    pub running: usize,
}

impl Summary {
    pub fn of(runs: &[TestRun]) -> Self {
        let mut s = Summary {
            total: runs.len(),
            ..Default::default()
        };
        for run in runs {
            match run.outcome {
                RunOutcome::Success => s.succeeded += 1,
                RunOutcome::Failed => s.failed += 1,
                RunOutcome::TimedOut => s.timed_out += 1,
                RunOutcome::Aborted => s.aborted += 1,
                RunOutcome::Skipped => s.skipped += 1,
                RunOutcome::Running => s.running += 1,
            }
        }
        s
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0 && self.timed_out == 0 && self.aborted == 0
    }
}

/// Process exit status for a set of results: zero iff nothing failed.
pub fn exit_code(runs: &[TestRun]) -> i32 {
    if Summary::of(runs).all_passed() {
        0
    } else {
        1
    }
}

#[derive(Debug, Serialize)]
struct JsonReport<'a> {
    summary: Summary,
    runs: &'a [TestRun],
}

pub fn render_json(runs: &[TestRun]) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&JsonReport {
        summary: Summary::of(runs),
        runs,
    })
}

fn phase_cell(run: &TestRun, phase: Phase) -> String {
    let rec = run.record(phase);
    match (rec.outcome, rec.duration_secs()) {
        (PhaseOutcome::Skipped | PhaseOutcome::Pending, _) | (_, None) => rec.outcome.to_string(),
        (outcome, Some(secs)) => format!("{outcome} {}", format_secs(secs)),
    }
}

fn format_secs(secs: f64) -> String {
    let secs = secs.round() as u64;
    if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

/// A table with one row per run, followed by failure details and totals.
pub fn render_table(runs: &[TestRun]) -> String {
    let mut table = Table::new();
    let mut header = vec!["PROFILE".to_owned(), "RUN".to_owned(), "OUTCOME".to_owned()];
    header.extend(Phase::iter().map(|p| p.to_string().to_uppercase()));
    table.load_preset(UTF8_FULL).set_header(header);
    for run in runs {
        let mut row = vec![
            run.profile.clone(),
            run.run_id.clone(),
            run.outcome.to_string(),
        ];
        row.extend(run.phases.iter().map(|p| phase_cell(run, p.phase)));
        table.add_row(row);
    }

    let mut out = table.to_string();
    out.push('\n');
    for run in runs {
        let Some(failure) = &run.failure else {
            continue;
        };
        out.push_str(&format!(
            "\n{} failed in {}: {}\n",
            run.profile, failure.phase, failure.message
        ));
        if let Some(line) = &failure.critical_line {
            out.push_str(&format!("  critical: {line}\n"));
        }
        if let Some(path) = &run.log_path {
            out.push_str(&format!("  log: {path}\n"));
        }
    }
    let s = Summary::of(runs);
    out.push_str(&format!(
        "\n{} runs: {} succeeded, {} failed, {} timed out, {} aborted, {} skipped\n",
        s.total, s.succeeded, s.failed, s.timed_out, s.aborted, s.skipped
    ));
    out
}
