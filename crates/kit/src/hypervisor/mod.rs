//! Hypervisor control surface
//!
//! The orchestrator only needs a handful of lifecycle operations from the
//! virtualization backend. They are expressed by the [`Hypervisor`] trait so
//! the state machine can be driven against a scripted backend in tests and
//! against libvirt ([`virsh::Virsh`]) in production.
//!
//! All operations are blocking calls to external tooling; async callers go
//! through [`call`], which runs them on the blocking pool.

use std::net::IpAddr;
use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::command_run::CommandError;

pub(crate) mod virsh;

/// Lifecycle state of a provisioned instance.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum VmState {
    #[default]
    Undefined,
    Defined,
    Running,
    Stopped,
    Destroyed,
}

/// What to create for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSpec {
    pub name: String,
    pub memory_mb: u32,
    pub vcpus: u32,
    pub disk_size: u64,
}

/// A virtual machine owned by exactly one test run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInstance {
    pub name: String,
    pub disk_path: Utf8PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Populated once the readiness prober finds it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<IpAddr>,
    pub state: VmState,
}

/// Failure reported by the virtualization backend.
#[derive(Debug, thiserror::Error)]
pub enum HypervisorError {
    #[error("hypervisor {op} failed ({}): {stderr}", fmt_code(*.exit_code))]
    Failed {
        op: String,
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("failed to invoke {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unexpected output from {op}: {message}")]
    Parse { op: String, message: String },
}

fn fmt_code(code: Option<i32>) -> String {
    code.map(|c| format!("exit code {c}"))
        .unwrap_or_else(|| "killed".to_owned())
}

impl HypervisorError {
    pub(crate) fn from_command(op: &str, e: CommandError) -> Self {
        match e {
            CommandError::Spawn { program, source } => HypervisorError::Spawn {
                tool: program,
                source,
            },
            CommandError::Exit {
                exit_code, stderr, ..
            } => HypervisorError::Failed {
                op: op.to_owned(),
                exit_code,
                stderr,
            },
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            HypervisorError::Failed { exit_code, .. } => *exit_code,
            _ => None,
        }
    }
}

/// Operations against the external virtualization service.
///
/// Implementations are stateless with respect to instances: the caller owns
/// each [`VmInstance`] and updates its [`VmState`] after a successful call.
pub trait Hypervisor: Send + Sync {
    /// Allocate a backing disk and define the instance without starting it.
    fn create(&self, spec: &VmSpec) -> Result<VmInstance, HypervisorError>;

    fn start(&self, vm: &VmInstance) -> Result<(), HypervisorError>;

    /// Stop the instance; `force` pulls the plug instead of asking the guest.
    fn stop(&self, vm: &VmInstance, force: bool) -> Result<(), HypervisorError>;

    fn snapshot_create(&self, vm: &VmInstance, name: &str) -> Result<(), HypervisorError>;

    fn snapshot_revert(&self, vm: &VmInstance, name: &str) -> Result<(), HypervisorError>;

    fn snapshot_list(&self, vm: &VmInstance) -> Result<Vec<String>, HypervisorError>;

    fn snapshot_delete(&self, vm: &VmInstance, name: &str) -> Result<(), HypervisorError>;

    /// Whether the instance is currently running.
    fn is_active(&self, vm: &VmInstance) -> Result<bool, HypervisorError>;

    /// The guest's address, if the backend knows one yet.
    fn get_address(&self, vm: &VmInstance) -> Result<Option<IpAddr>, HypervisorError>;

    /// Remove the instance and its disk. Destroying an absent instance is not an error.
    fn destroy(&self, vm: &VmInstance) -> Result<(), HypervisorError>;

    /// Names of all defined instances starting with `prefix`.
    fn list_instances(&self, prefix: &str) -> Result<Vec<String>, HypervisorError>;

    /// Handle for an existing instance known only by name.
    fn adopt(&self, name: &str) -> VmInstance;
}

/// Run a hypervisor operation on the blocking pool.
pub(crate) async fn call<T, F>(hv: &Arc<dyn Hypervisor>, f: F) -> Result<T, crate::error::RunError>
where
    T: Send + 'static,
    F: FnOnce(&dyn Hypervisor) -> Result<T, HypervisorError> + Send + 'static,
{
    let hv = Arc::clone(hv);
    let r = tokio::task::spawn_blocking(move || f(hv.as_ref())).await??;
    Ok(r)
}


#[cfg(test)]
mod tests {
    use super::mock::MockHypervisor;
    use super::*;

    fn spec(name: &str) -> VmSpec {
        VmSpec {
            name: name.into(),
            memory_mb: 1024,
            vcpus: 1,
            disk_size: 1 << 30,
        }
    }

    #[test]
    fn test_from_command_error() {
        let e = HypervisorError::from_command(
            "start",
            CommandError::Exit {
                program: "virsh".into(),
                exit_code: Some(1),
                stderr: "error: domain is already active".into(),
            },
        );
        assert_eq!(e.exit_code(), Some(1));
        assert!(e.to_string().contains("hypervisor start failed (exit code 1)"));
    }

    #[tokio::test]
    async fn test_call_runs_on_blocking_pool() {
        let hv: Arc<dyn Hypervisor> = Arc::new(MockHypervisor::new());
        let vm = call(&hv, |h| h.create(&spec("vmit-vm-1-0001"))).await.unwrap();
        assert_eq!(vm.state, VmState::Defined);
        let names = call(&hv, |h| h.list_instances("vmit-")).await.unwrap();
        assert_eq!(names, vec!["vmit-vm-1-0001".to_owned()]);
    }

    #[test]
    fn test_mock_destroy_idempotent() {
        let hv = MockHypervisor::new();
        let vm = hv.create(&spec("vmit-vm-1-0001")).unwrap();
        hv.destroy(&vm).unwrap();
        hv.destroy(&vm).unwrap();
        assert!(hv.defined().is_empty());
    }
}
