//! Runs profiles concurrently and persists their results.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument as _};

use crate::config::Profile;
use crate::error::RunError;
use crate::hypervisor::{self, VmState};
use crate::machine::{PhaseMachine, RunContext};
use crate::phase::{Failure, Phase, RunState, TestRun};
use crate::runlog;
use crate::utils::generate_run_id;

pub struct Orchestrator {
    ctx: Arc<RunContext>,
    cancel: CancellationToken,
}

/// Close out a run whose machine never returned it, or never started.
fn abandon(mut run: TestRun, error: RunError) -> TestRun {
    if !matches!(run.state, RunState::Failed | RunState::Reporting | RunState::Done) {
        let phase = run
            .phases
            .iter()
            .find(|p| !p.is_final())
            .map(|p| p.phase)
            .unwrap_or(Phase::Validate);
        let failure = Failure {
            phase,
            kind: error.kind(),
            message: error.to_string(),
            critical_line: None,
        };
        if let Err(e) = run.fail(phase, error.phase_outcome(), failure, vec![error.to_string()]) {
            warn!("Failed to record failure: {e}");
        }
    }
    if run.state == RunState::Failed {
        if let Err(e) = run.finish() {
            warn!("Failed to finalize run: {e}");
        }
    }
    run
}

impl Orchestrator {
    pub fn new(ctx: Arc<RunContext>, cancel: CancellationToken) -> Self {
        Self { ctx, cancel }
    }

    /// Run one profile to completion and persist the result.
    pub async fn run_profile(&self, profile: &Profile) -> TestRun {
        let sem = Arc::new(Semaphore::new(1));
        self.spawn_run(profile.clone(), sem)
            .await
            .unwrap_or_else(|e| abandon(TestRun::new(&profile.name, ""), e.into()))
    }

    /// Run every profile with at most `concurrency` runs in flight.
    ///
    /// Results come back in the order of `profiles`; one run failing never
    /// affects another.
    pub async fn run_all(&self, profiles: &[Profile], concurrency: usize) -> Vec<TestRun> {
        let sem = Arc::new(Semaphore::new(concurrency.max(1)));
        let handles: Vec<_> = profiles
            .iter()
            .map(|p| (p.name.clone(), self.spawn_run(p.clone(), Arc::clone(&sem))))
            .collect();
        let mut results = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            let run = match handle.await {
                Ok(run) => run,
                Err(e) => {
                    warn!("Run task for {name} failed: {e}");
                    abandon(TestRun::new(&name, ""), e.into())
                }
            };
            results.push(run);
        }
        results
    }

    fn spawn_run(
        &self,
        profile: Profile,
        sem: Arc<Semaphore>,
    ) -> tokio::task::JoinHandle<TestRun> {
        let ctx = Arc::clone(&self.ctx);
        let cancel = self.cancel.child_token();
        let run_id = generate_run_id();
        let span = info_span!("run", profile = %profile.name, run_id = %run_id);
        tokio::spawn(
            async move {
                let run = if profile.skip {
                    info!("Skipped by configuration");
                    TestRun::skipped(&profile.name, &run_id)
                } else {
                    let permit = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        permit = sem.acquire_owned() => permit.ok(),
                    };
                    match permit {
                        Some(_permit) => execute(Arc::clone(&ctx), profile.clone(), &run_id, cancel).await,
                        None => abandon(TestRun::new(&profile.name, &run_id), RunError::Aborted),
                    }
                };
                persist(&ctx, &profile.name, &run);
                run
            }
            .instrument(span),
        )
    }
}

/// Drive one machine on its own task so a panic is contained to this run.
async fn execute(
    ctx: Arc<RunContext>,
    profile: Profile,
    run_id: &str,
    cancel: CancellationToken,
) -> TestRun {
    let name = profile.name.clone();
    let machine = PhaseMachine::new(Arc::clone(&ctx), profile, run_id, cancel);
    let handle = tokio::spawn(machine.execute().in_current_span());
    match handle.await {
        Ok(run) => run,
        Err(e) => {
            warn!("Run panicked: {e}");
            // Pick up from the last checkpoint so completed phases are kept
            let last = ctx
                .store
                .as_ref()
                .and_then(|s| s.load(&name).ok().flatten())
                .filter(|r| r.run_id == run_id)
                .unwrap_or_else(|| TestRun::new(&name, run_id));
            let mut run = abandon(last, e.into());
            if let Some(vm) = run.instance.clone().filter(|vm| vm.state != VmState::Destroyed) {
                match hypervisor::call(&ctx.hypervisor, move |h| h.destroy(&vm)).await {
                    Ok(()) => {
                        if let Some(vm) = run.instance.as_mut() {
                            vm.state = VmState::Destroyed;
                        }
                    }
                    Err(e) => warn!("Failed to destroy instance: {e}"),
                }
            }
            run
        }
    }
}

fn persist(ctx: &RunContext, profile: &str, run: &TestRun) {
    if let Some(store) = &ctx.store {
        if let Err(e) = store.save(profile, run) {
            warn!("Failed to save result: {e:#}");
        }
    }
    let config = &ctx.config;
    match runlog::prune(&config.paths.log_dir, profile, config.retention.runs_per_profile) {
        Ok(removed) if !removed.is_empty() => info!("Pruned {} old logs", removed.len()),
        Ok(_) => {}
        Err(e) => warn!("Failed to prune logs: {e:#}"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use super::*;
    use crate::hypervisor::mock::MockHypervisor;
    use crate::machine::testutil::context;
    use crate::phase::{FailureKind, PhaseOutcome, RunOutcome};
    use crate::remote::mock::{InstallScript, MockRemote};

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_isolated() {
        let hv = Arc::new(MockHypervisor::new().failing_create("server", 2));
        let remote = Arc::new(MockRemote::new(InstallScript::successful()));
        let (_td, ctx) = context(hv.clone(), remote, |_| {});
        let store = ctx.store.clone().unwrap();
        let profiles = ctx.config.profiles.clone();
        let o = Orchestrator::new(ctx, CancellationToken::new());
        let runs = o.run_all(&profiles, 2).await;

        assert_eq!(runs.len(), 3);
        let by_name: Vec<_> = runs.iter().map(|r| (r.profile.as_str(), r.outcome)).collect();
        assert_eq!(
            by_name,
            [
                ("vm", RunOutcome::Success),
                ("workstation", RunOutcome::Success),
                ("server", RunOutcome::Failed),
            ]
        );
        let server = &runs[2];
        assert_eq!(server.failure.as_ref().unwrap().phase, Phase::Provision);
        assert_eq!(server.record(Phase::Boot).outcome, PhaseOutcome::Skipped);

        let names: BTreeSet<_> = runs
            .iter()
            .filter_map(|r| r.instance.as_ref().map(|i| i.name.clone()))
            .collect();
        assert_eq!(names.len(), 2);
        assert!(hv.defined().is_empty());

        let saved = store.load_all().unwrap();
        assert_eq!(saved.len(), 3);
        assert_eq!(saved["server"].outcome, RunOutcome::Failed);
        assert_eq!(saved["vm"].state, RunState::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_profile_twice_uses_distinct_instances() {
        let hv = Arc::new(MockHypervisor::new());
        let remote = Arc::new(MockRemote::new(InstallScript::successful()));
        let (_td, ctx) = context(hv, remote, |_| {});
        let vm = ctx.config.profile("vm").unwrap().clone();
        let o = Orchestrator::new(ctx, CancellationToken::new());
        let runs = o.run_all(&[vm.clone(), vm], 2).await;
        assert!(runs.iter().all(|r| r.outcome == RunOutcome::Success));
        let a = runs[0].instance.as_ref().unwrap();
        let b = runs[1].instance.as_ref().unwrap();
        assert_ne!(a.name, b.name);
        assert_ne!(runs[0].run_id, runs[1].run_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_runs_share_one_baseline() {
        let hv = Arc::new(MockHypervisor::new());
        let remote = Arc::new(MockRemote::new(InstallScript::successful()));
        let (_td, ctx) = context(hv.clone(), remote, |c| {
            c.hypervisor.teardown = crate::config::Teardown::Revert
        });
        let vm = ctx.config.profile("vm").unwrap().clone();
        let o = Orchestrator::new(ctx, CancellationToken::new());
        let runs = o.run_all(&[vm.clone(), vm], 2).await;
        assert!(runs.iter().all(|r| r.outcome == RunOutcome::Success));
        let names: BTreeSet<_> = runs
            .iter()
            .map(|r| r.instance.as_ref().unwrap().name.clone())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains("vmit-vm-base"));
        // The run that could not take the baseline cleaned up after itself
        assert_eq!(hv.defined(), ["vmit-vm-base"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_persists_aborted() {
        let hv = Arc::new(MockHypervisor::new());
        let mut script = InstallScript::new(&["Starting install"]);
        script.hang = true;
        let remote = Arc::new(MockRemote::new(script));
        let (_td, ctx) = context(hv.clone(), remote, |_| {});
        let store = ctx.store.clone().unwrap();
        let profiles = ctx.config.profiles.clone();
        let cancel = CancellationToken::new();
        let o = Orchestrator::new(ctx, cancel.clone());
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(120)).await;
            c.cancel();
        });
        // One at a time: the first is mid-install, the others never start
        let runs = o.run_all(&profiles, 1).await;
        assert!(runs.iter().all(|r| r.outcome == RunOutcome::Aborted), "{runs:#?}");
        assert_eq!(runs[0].record(Phase::Install).outcome, PhaseOutcome::Aborted);
        assert_eq!(runs[1].record(Phase::Provision).outcome, PhaseOutcome::Aborted);
        assert_eq!(runs[1].failure.as_ref().unwrap().kind, FailureKind::Aborted);
        assert!(hv.defined().is_empty());
        let saved = store.load_all().unwrap();
        assert!(saved.values().all(|r| r.outcome == RunOutcome::Aborted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_skipped_profile() {
        let hv = Arc::new(MockHypervisor::new());
        let remote = Arc::new(MockRemote::new(InstallScript::successful()));
        let (_td, ctx) = context(hv.clone(), remote, |c| c.profiles[2].skip = true);
        let server = ctx.config.profile("server").unwrap().clone();
        let o = Orchestrator::new(ctx, CancellationToken::new());
        let run = o.run_profile(&server).await;
        assert_eq!(run.outcome, RunOutcome::Skipped);
        assert!(run.instance.is_none());
        assert!(hv.calls().is_empty());
    }

    #[test]
    fn test_abandon_marks_rest_skipped() {
        let mut run = TestRun::new("vm", "r1");
        run.begin(Phase::Provision).unwrap();
        run.succeed(Phase::Provision).unwrap();
        run.begin(Phase::Boot).unwrap();
        let run = abandon(run, RunError::Internal("task panicked".into()));
        assert_eq!(run.state, RunState::Done);
        assert_eq!(run.outcome, RunOutcome::Failed);
        assert_eq!(run.record(Phase::Provision).outcome, PhaseOutcome::Success);
        assert_eq!(run.record(Phase::Boot).outcome, PhaseOutcome::Failed);
        assert_eq!(run.record(Phase::Install).outcome, PhaseOutcome::Skipped);
        assert_eq!(run.failure.unwrap().kind, FailureKind::Internal);
    }
}
