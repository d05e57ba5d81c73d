//! Test run data model
//!
//! A [`TestRun`] is the unit of work for one profile. It holds one
//! [`PhaseRecord`] per [`Phase`], each finalized exactly once. The
//! [`RunState`] transition table describes the linear pipeline with its
//! single failure sink.

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use crate::hypervisor::VmInstance;

/// Test phases, in execution order.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Phase {
    Provision,
    Boot,
    Install,
    Reboot,
    Validate,
}

/// Result of a single phase.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum PhaseOutcome {
    Pending,
    Success,
    Failed,
    TimedOut,
    Aborted,
    Skipped,
}

/// Why a run failed, kept distinct so an installer failure is never
/// confused with a post-install validation failure.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum FailureKind {
    Hypervisor,
    Timeout,
    CriticalInstall,
    InstallerExit,
    Validation,
    Remote,
    Aborted,
    Internal,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("phase {0} was already finalized")]
    AlreadyFinalized(Phase),
    #[error("cannot finalize phase {0} as pending")]
    PendingOutcome(Phase),
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: RunState, to: RunState },
}

/// Result of one phase of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub outcome: PhaseOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Error text for a failed phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Last lines of output captured before a failure.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostic: Vec<String>,
}

impl PhaseRecord {
    fn pending(phase: Phase) -> Self {
        Self {
            phase,
            outcome: PhaseOutcome::Pending,
            started_at: None,
            finished_at: None,
            error: None,
            diagnostic: Vec::new(),
        }
    }

    pub fn is_final(&self) -> bool {
        self.outcome != PhaseOutcome::Pending
    }

    pub fn duration_secs(&self) -> Option<f64> {
        let start = self.started_at?;
        let end = self.finished_at?;
        Some((end - start).num_milliseconds() as f64 / 1000.0)
    }

    fn finalize(
        &mut self,
        outcome: PhaseOutcome,
        error: Option<String>,
        diagnostic: Vec<String>,
    ) -> Result<(), RecordError> {
        if self.is_final() {
            return Err(RecordError::AlreadyFinalized(self.phase));
        }
        if outcome == PhaseOutcome::Pending {
            return Err(RecordError::PendingOutcome(self.phase));
        }
        self.outcome = outcome;
        self.finished_at = Some(Utc::now());
        self.error = error;
        self.diagnostic = diagnostic;
        Ok(())
    }
}

/// States of the per-run state machine.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RunState {
    Idle,
    Provisioning,
    Booting,
    Installing,
    Rebooting,
    Validating,
    Reporting,
    Done,
    Failed,
}

impl RunState {
    /// The phase executed while in this state, if any.
    pub fn phase(self) -> Option<Phase> {
        match self {
            RunState::Provisioning => Some(Phase::Provision),
            RunState::Booting => Some(Phase::Boot),
            RunState::Installing => Some(Phase::Install),
            RunState::Rebooting => Some(Phase::Reboot),
            RunState::Validating => Some(Phase::Validate),
            _ => None,
        }
    }

    pub fn for_phase(phase: Phase) -> RunState {
        match phase {
            Phase::Provision => RunState::Provisioning,
            Phase::Boot => RunState::Booting,
            Phase::Install => RunState::Installing,
            Phase::Reboot => RunState::Rebooting,
            Phase::Validate => RunState::Validating,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done)
    }

    /// Whether the pipeline permits moving from `self` to `to`.
    pub fn can_transition(self, to: RunState) -> bool {
        use RunState::*;
        match (self, to) {
            (Idle, Provisioning)
            | (Provisioning, Booting)
            | (Booting, Installing)
            | (Installing, Rebooting)
            | (Rebooting, Validating)
            | (Validating, Reporting)
            | (Reporting, Done)
            | (Failed, Reporting) => true,
            (from, Failed) => !matches!(from, Done | Failed | Reporting),
            _ => false,
        }
    }

    pub fn transition(self, to: RunState) -> Result<RunState, RecordError> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(RecordError::InvalidTransition { from: self, to })
        }
    }
}

/// Overall result of a run, as shown in reports.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RunOutcome {
    Running,
    Success,
    Failed,
    TimedOut,
    Aborted,
    Skipped,
}

impl RunOutcome {
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            RunOutcome::Failed | RunOutcome::TimedOut | RunOutcome::Aborted
        )
    }
}

/// The first failure of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub phase: Phase,
    pub kind: FailureKind,
    pub message: String,
    /// First line classified as a critical error, if that caused the failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical_line: Option<String>,
}

/// The unit of work for one profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRun {
    pub run_id: String,
    pub profile: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub state: RunState,
    pub outcome: RunOutcome,
    pub phases: Vec<PhaseRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<VmInstance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    /// Marker names seen in the installer stream, in order.
    #[serde(default)]
    pub markers: Vec<String>,
    /// Number of output lines consumed.
    #[serde(default)]
    pub lines_seen: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<Utf8PathBuf>,
}

impl TestRun {
    pub fn new(profile: &str, run_id: &str) -> Self {
        Self {
            run_id: run_id.to_owned(),
            profile: profile.to_owned(),
            started_at: Utc::now(),
            finished_at: None,
            state: RunState::Idle,
            outcome: RunOutcome::Running,
            phases: Phase::iter().map(PhaseRecord::pending).collect(),
            instance: None,
            failure: None,
            markers: Vec::new(),
            lines_seen: 0,
            log_path: None,
        }
    }

    /// A run for a profile that is configured to be skipped.
    pub fn skipped(profile: &str, run_id: &str) -> Self {
        let mut run = Self::new(profile, run_id);
        for p in run.phases.iter_mut() {
            p.outcome = PhaseOutcome::Skipped;
        }
        run.state = RunState::Done;
        run.outcome = RunOutcome::Skipped;
        run.finished_at = Some(Utc::now());
        run
    }

    pub fn record(&self, phase: Phase) -> &PhaseRecord {
        // phases is always built from Phase::iter(), so the index is the discriminant
        &self.phases[phase as usize]
    }

    fn record_mut(&mut self, phase: Phase) -> &mut PhaseRecord {
        &mut self.phases[phase as usize]
    }

    /// Enter the state that executes `phase`.
    pub fn begin(&mut self, phase: Phase) -> Result<(), RecordError> {
        self.state = self.state.transition(RunState::for_phase(phase))?;
        self.record_mut(phase).started_at = Some(Utc::now());
        Ok(())
    }

    /// Finalize the current phase as successful.
    pub fn succeed(&mut self, phase: Phase) -> Result<(), RecordError> {
        self.record_mut(phase)
            .finalize(PhaseOutcome::Success, None, Vec::new())
    }

    /// Finalize `phase` with a failing outcome and move to `Failed`.
    pub fn fail(
        &mut self,
        phase: Phase,
        outcome: PhaseOutcome,
        failure: Failure,
        diagnostic: Vec<String>,
    ) -> Result<(), RecordError> {
        let next = self.state.transition(RunState::Failed)?;
        let record = self.record_mut(phase);
        if record.started_at.is_none() {
            record.started_at = Some(Utc::now());
        }
        record.finalize(outcome, Some(failure.message.clone()), diagnostic)?;
        self.state = next;
        if self.failure.is_none() {
            self.failure = Some(failure);
        }
        Ok(())
    }

    /// Derive the overall outcome: Success iff every phase succeeded.
    pub fn derive_outcome(&self) -> RunOutcome {
        if self.phases.iter().all(|p| p.outcome == PhaseOutcome::Success) {
            return RunOutcome::Success;
        }
        if self.phases.iter().all(|p| p.outcome == PhaseOutcome::Skipped) {
            return RunOutcome::Skipped;
        }
        let first_bad = self.phases.iter().find(|p| {
            !matches!(p.outcome, PhaseOutcome::Success | PhaseOutcome::Skipped)
        });
        match first_bad.map(|p| p.outcome) {
            Some(PhaseOutcome::TimedOut) => RunOutcome::TimedOut,
            Some(PhaseOutcome::Aborted) => RunOutcome::Aborted,
            Some(PhaseOutcome::Pending) if self.state != RunState::Done => RunOutcome::Running,
            _ => RunOutcome::Failed,
        }
    }

    /// Report phase: mark unreached phases as skipped and make the run terminal.
    pub fn finish(&mut self) -> Result<(), RecordError> {
        let failed = self.state == RunState::Failed;
        self.state = self.state.transition(RunState::Reporting)?;
        if failed {
            for p in self.phases.iter_mut().filter(|p| !p.is_final()) {
                p.finalize(PhaseOutcome::Skipped, None, Vec::new())?;
            }
        }
        self.state = self.state.transition(RunState::Done)?;
        self.outcome = self.derive_outcome();
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// The phase that is currently executing, if any.
    pub fn current_phase(&self) -> Option<Phase> {
        self.state.phase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(phase: Phase, kind: FailureKind) -> Failure {
        Failure {
            phase,
            kind,
            message: format!("{kind} in {phase}"),
            critical_line: None,
        }
    }

    #[test]
    fn test_happy_path() {
        let mut run = TestRun::new("vm", "r1");
        for phase in Phase::iter() {
            run.begin(phase).unwrap();
            run.succeed(phase).unwrap();
        }
        run.finish().unwrap();
        assert_eq!(run.state, RunState::Done);
        assert_eq!(run.outcome, RunOutcome::Success);
        assert!(run.phases.iter().all(|p| p.duration_secs().is_some()));
    }

    #[test]
    fn test_failure_skips_remaining() {
        let mut run = TestRun::new("server", "r1");
        run.begin(Phase::Provision).unwrap();
        run.succeed(Phase::Provision).unwrap();
        run.begin(Phase::Boot).unwrap();
        run.succeed(Phase::Boot).unwrap();
        run.begin(Phase::Install).unwrap();
        run.fail(
            Phase::Install,
            PhaseOutcome::TimedOut,
            failure(Phase::Install, FailureKind::Timeout),
            vec!["last line".into()],
        )
        .unwrap();
        assert_eq!(run.state, RunState::Failed);
        run.finish().unwrap();
        assert_eq!(run.outcome, RunOutcome::TimedOut);
        assert_eq!(run.record(Phase::Install).outcome, PhaseOutcome::TimedOut);
        assert_eq!(run.record(Phase::Install).diagnostic, vec!["last line"]);
        assert_eq!(run.record(Phase::Reboot).outcome, PhaseOutcome::Skipped);
        assert_eq!(run.record(Phase::Validate).outcome, PhaseOutcome::Skipped);
        assert_eq!(run.failure.as_ref().unwrap().phase, Phase::Install);
    }

    #[test]
    fn test_finalized_once() {
        let mut run = TestRun::new("vm", "r1");
        run.begin(Phase::Provision).unwrap();
        run.succeed(Phase::Provision).unwrap();
        assert_eq!(
            run.succeed(Phase::Provision),
            Err(RecordError::AlreadyFinalized(Phase::Provision))
        );
        let before = run.record(Phase::Provision).clone();
        assert!(run
            .fail(
                Phase::Provision,
                PhaseOutcome::Failed,
                failure(Phase::Provision, FailureKind::Internal),
                vec![]
            )
            .is_err());
        assert_eq!(run.record(Phase::Provision), &before);
    }

    #[test]
    fn test_transition_table() {
        use RunState::*;
        assert!(Idle.can_transition(Provisioning));
        assert!(!Idle.can_transition(Installing));
        assert!(!Installing.can_transition(Validating));
        for s in [Idle, Provisioning, Booting, Installing, Rebooting, Validating] {
            assert!(s.can_transition(Failed), "{s} -> failed");
        }
        assert!(!Done.can_transition(Failed));
        assert!(!Failed.can_transition(Installing));
        assert!(Failed.can_transition(Reporting));
        assert!(Reporting.can_transition(Done));
        assert!(Done.is_terminal());
    }

    #[test]
    fn test_skipped_run() {
        let run = TestRun::skipped("server", "r1");
        assert_eq!(run.outcome, RunOutcome::Skipped);
        assert_eq!(run.derive_outcome(), RunOutcome::Skipped);
        assert!(!run.outcome.is_failure());
    }

    #[test]
    fn test_serde_roundtrip_of_failed_run() {
        let mut run = TestRun::new("vm", "r1");
        run.begin(Phase::Provision).unwrap();
        run.fail(
            Phase::Provision,
            PhaseOutcome::Failed,
            failure(Phase::Provision, FailureKind::Hypervisor),
            vec![],
        )
        .unwrap();
        run.finish().unwrap();
        let json = serde_json::to_string(&run).unwrap();
        assert!(json.contains(r#""outcome":"failed""#));
        let back: TestRun = serde_json::from_str(&json).unwrap();
        assert_eq!(back, run);
    }
}
