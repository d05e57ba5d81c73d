use std::time::Duration;

use crate::hypervisor::HypervisorError;
use crate::phase::{FailureKind, PhaseOutcome};
use crate::remote::RemoteError;

/// Errors that end a test run.
///
/// None of these ever propagate past the run that raised them; the machine
/// driving a run converts them into a failed [`crate::phase::PhaseRecord`].
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    #[error("timed out after {}s waiting for {what}", after.as_secs())]
    Timeout { what: String, after: Duration },

    #[error("critical installer output: {line}")]
    CriticalInstall { line: String, pattern: String },

    #[error("installer exited with {}", fmt_status(*.status))]
    InstallerExit { status: Option<i32> },

    #[error("installer exited cleanly without reporting install-complete")]
    MissingMarker,

    #[error("validation command `{command}` failed with {}", fmt_status(*.status))]
    Validation {
        command: String,
        status: Option<i32>,
        output: String,
    },

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("run aborted")]
    Aborted,

    #[error("failed to revert {instance} to snapshot {snapshot}: {source}")]
    Revert {
        instance: String,
        snapshot: String,
        #[source]
        source: HypervisorError,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

fn fmt_status(status: Option<i32>) -> String {
    match status {
        Some(c) => format!("status {c}"),
        None => "no exit status".to_owned(),
    }
}

impl RunError {
    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        RunError::Timeout {
            what: what.into(),
            after,
        }
    }

    /// The persisted classification of this error.
    pub fn kind(&self) -> FailureKind {
        match self {
            RunError::Hypervisor(_) | RunError::Revert { .. } => FailureKind::Hypervisor,
            RunError::Timeout { .. } => FailureKind::Timeout,
            RunError::CriticalInstall { .. } => FailureKind::CriticalInstall,
            RunError::InstallerExit { .. } | RunError::MissingMarker => FailureKind::InstallerExit,
            RunError::Validation { .. } => FailureKind::Validation,
            RunError::Remote(_) => FailureKind::Remote,
            RunError::Aborted => FailureKind::Aborted,
            RunError::Internal(_) => FailureKind::Internal,
        }
    }

    /// Outcome recorded on the phase that raised this error.
    pub fn phase_outcome(&self) -> PhaseOutcome {
        match self {
            RunError::Timeout { .. } => PhaseOutcome::TimedOut,
            RunError::Aborted => PhaseOutcome::Aborted,
            _ => PhaseOutcome::Failed,
        }
    }

    pub fn critical_line(&self) -> Option<&str> {
        match self {
            RunError::CriticalInstall { line, .. } => Some(line),
            _ => None,
        }
    }
}

impl From<tokio::task::JoinError> for RunError {
    fn from(e: tokio::task::JoinError) -> Self {
        RunError::Internal(format!("task failed: {e}"))
    }
}
