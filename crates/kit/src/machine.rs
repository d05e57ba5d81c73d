//! Per-run phase state machine
//!
//! A [`PhaseMachine`] owns one [`TestRun`] and is its only writer. It walks
//! the pipeline Provision, Boot, Install, Reboot, Validate; the first error
//! finalizes the current phase and sends the run to `Failed`. Installer
//! output is read by a separate consumer task that classifies each line and
//! forwards the events, in order, over a single channel.

use std::collections::{BTreeSet, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};

use indicatif::MultiProgress;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};

use crate::classifier::{Ruleset, StreamEvent, Tag, INSTALL_COMPLETE};
use crate::config::{Config, Profile, Teardown, REMOTE_PAYLOAD_DIR};
use crate::error::RunError;
use crate::hypervisor::{self, Hypervisor, HypervisorError, VmInstance, VmState};
use crate::phase::{Failure, Phase, TestRun};
use crate::readiness::{await_network, await_remote_exec, Spinner, Wait};
use crate::remote::{probe_timeout, RemoteExec, RemoteProcess};
use crate::runlog::RunLog;
use crate::store::RunStateStore;
use crate::utils::{baseline_name, instance_name};

/// Lines of output attached to a failed phase.
pub const DIAGNOSTIC_LINES: usize = 20;

const EVENT_BUFFER: usize = 64;

/// Everything a run needs from the outside world.
pub struct RunContext {
    pub config: Arc<Config>,
    pub hypervisor: Arc<dyn Hypervisor>,
    pub remote: Arc<dyn RemoteExec>,
    pub rules: Arc<Ruleset>,
    pub progress: MultiProgress,
    /// Receives a checkpoint of the run at every phase boundary.
    pub store: Option<Arc<RunStateStore>>,
    pub baselines: BaselineLeases,
}

/// Baseline instances currently in use by a run of this process.
///
/// With `teardown = revert` each profile keeps one long-lived instance that
/// is reverted between runs; only one run can drive it at a time.
#[derive(Debug, Default, Clone)]
pub struct BaselineLeases(Arc<Mutex<BTreeSet<String>>>);

impl BaselineLeases {
    /// Claim `name`, or `None` if another run holds it.
    fn claim(&self, name: &str) -> Option<BaselineLease> {
        let mut held = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        held.insert(name.to_owned()).then(|| BaselineLease {
            leases: self.clone(),
            name: name.to_owned(),
        })
    }
}

/// Exclusive use of a baseline instance; released on drop.
#[derive(Debug)]
struct BaselineLease {
    leases: BaselineLeases,
    name: String,
}

impl Drop for BaselineLease {
    fn drop(&mut self) {
        let mut held = self.leases.0.lock().unwrap_or_else(PoisonError::into_inner);
        held.remove(&self.name);
    }
}

/// The last few lines seen, for failure diagnostics.
#[derive(Debug, Default)]
struct DiagnosticWindow(VecDeque<String>);

impl DiagnosticWindow {
    fn push(&mut self, line: &str) {
        if self.0.len() == DIAGNOSTIC_LINES {
            self.0.pop_front();
        }
        self.0.push_back(line.to_owned());
    }

    fn snapshot(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }
}

/// Installer that has reported completion but may still be running.
struct Installer {
    process: RemoteProcess,
    events: mpsc::Receiver<StreamEvent>,
    _consumer: AbortOnDropHandle<()>,
    deadline: Instant,
}

enum Signal {
    None,
    Complete,
    Critical { line: String, pattern: String },
}

/// Read installer output, log and classify it, and forward it in order.
async fn consume_stream(
    mut lines: mpsc::Receiver<String>,
    rules: Arc<Ruleset>,
    log: Option<Arc<RunLog>>,
    events: mpsc::Sender<StreamEvent>,
) {
    let mut forwarding = true;
    while let Some(line) = lines.recv().await {
        if let Some(log) = &log {
            log.line(&line);
        }
        if forwarding {
            let ev = rules.classify(&line, Phase::Install);
            if events.send(ev).await.is_err() {
                // The machine stopped listening; keep draining into the log.
                forwarding = false;
            }
        }
    }
}

pub struct PhaseMachine {
    ctx: Arc<RunContext>,
    profile: Profile,
    run: TestRun,
    vm: Option<VmInstance>,
    window: DiagnosticWindow,
    cancel: CancellationToken,
    log: Option<Arc<RunLog>>,
    installer: Option<Installer>,
    reverted: bool,
    /// Set when this run drives the profile's baseline instance.
    lease: Option<BaselineLease>,
    /// Provisioning call that has not reported back yet.
    inflight: Option<JoinHandle<Result<VmInstance, HypervisorError>>>,
}

impl PhaseMachine {
    pub fn new(
        ctx: Arc<RunContext>,
        profile: Profile,
        run_id: &str,
        cancel: CancellationToken,
    ) -> Self {
        let mut run = TestRun::new(&profile.name, run_id);
        let log = match RunLog::create(&ctx.config.paths.log_dir, &profile.name, run_id) {
            Ok(log) => {
                run.log_path = Some(log.path().to_owned());
                Some(Arc::new(log))
            }
            Err(e) => {
                warn!("Run log disabled: {e:#}");
                None
            }
        };
        Self {
            ctx,
            profile,
            run,
            vm: None,
            window: DiagnosticWindow::default(),
            cancel,
            log,
            installer: None,
            reverted: false,
            lease: None,
            inflight: None,
        }
    }

    fn note(&self, text: &str) {
        if let Some(log) = &self.log {
            log.note(text);
        }
    }

    fn checkpoint(&mut self) {
        self.run.instance = self.vm.clone();
        if let Some(store) = &self.ctx.store {
            if let Err(e) = store.save(&self.profile.name, &self.run) {
                warn!("Failed to checkpoint {}: {e:#}", self.profile.name);
            }
        }
    }

    fn enter(&mut self, phase: Phase) -> Result<(), RunError> {
        self.run
            .begin(phase)
            .map_err(|e| RunError::Internal(e.to_string()))?;
        info!("Phase {phase} started");
        self.note(&format!("phase {phase} started"));
        self.checkpoint();
        Ok(())
    }

    fn complete(&mut self, phase: Phase) -> Result<(), RunError> {
        self.run
            .succeed(phase)
            .map_err(|e| RunError::Internal(e.to_string()))?;
        let secs = self.run.record(phase).duration_secs().unwrap_or_default();
        info!("Phase {phase} succeeded ({secs:.1}s)");
        self.note(&format!("phase {phase} succeeded"));
        self.checkpoint();
        Ok(())
    }

    fn instance(&self) -> Result<VmInstance, RunError> {
        self.vm
            .clone()
            .ok_or_else(|| RunError::Internal("no instance provisioned".into()))
    }

    fn address(&self) -> Result<IpAddr, RunError> {
        self.vm
            .as_ref()
            .and_then(|vm| vm.address)
            .ok_or_else(|| RunError::Internal("guest address unknown".into()))
    }

    fn set_state(&mut self, state: VmState) {
        if let Some(vm) = self.vm.as_mut() {
            vm.state = state;
        }
    }

    fn wait(&self, timeout: std::time::Duration) -> Wait {
        Wait {
            timeout,
            interval: self.ctx.config.timeouts.poll_interval(),
        }
    }

    /// Drive the run to completion. Never fails: every error ends up in the
    /// returned run.
    pub async fn execute(mut self) -> TestRun {
        let run_timeout = self.ctx.config.timeouts.run();
        let cancel = self.cancel.clone();
        let result = tokio::select! {
            biased;
            r = self.pipeline() => r,
            _ = cancel.cancelled() => Err(RunError::Aborted),
            _ = tokio::time::sleep(run_timeout) => Err(RunError::timeout("run to finish", run_timeout)),
        };
        self.settle_inflight().await;
        if let Err(e) = result {
            self.record_failure(e).await;
        }
        self.teardown().await;
        if let Err(e) = self.run.finish() {
            error!("Failed to finalize run: {e}");
        }
        self.run.instance = self.vm.clone();
        info!("Run finished: {}", self.run.outcome);
        self.note(&format!("run finished: {}", self.run.outcome));
        self.run
    }

    async fn pipeline(&mut self) -> Result<(), RunError> {
        self.enter(Phase::Provision)?;
        self.provision().await?;
        self.complete(Phase::Provision)?;

        self.enter(Phase::Boot)?;
        self.boot().await?;
        self.complete(Phase::Boot)?;

        self.enter(Phase::Install)?;
        self.install().await?;
        self.complete(Phase::Install)?;

        self.enter(Phase::Reboot)?;
        self.reboot().await?;
        self.complete(Phase::Reboot)?;

        self.enter(Phase::Validate)?;
        self.validate().await?;
        self.complete(Phase::Validate)?;
        Ok(())
    }

    async fn record_failure(&mut self, e: RunError) {
        // The first phase not yet finalized is the one that was running or about to run.
        let phase = self
            .run
            .phases
            .iter()
            .find(|p| !p.is_final())
            .map(|p| p.phase)
            .unwrap_or(Phase::Validate);
        error!("Phase {phase} failed: {e}");
        self.note(&format!("phase {phase} failed: {e}"));
        self.installer = None;

        if matches!(e, RunError::Aborted | RunError::Timeout { .. }) {
            self.force_stop().await;
        }

        let mut diagnostic = match &e {
            RunError::Validation { output, .. } => {
                let lines: Vec<&str> = output.lines().collect();
                let start = lines.len().saturating_sub(DIAGNOSTIC_LINES);
                lines[start..].iter().map(|l| l.to_string()).collect()
            }
            _ => self.window.snapshot(),
        };
        if diagnostic.is_empty() {
            diagnostic.push(e.to_string());
        }
        let failure = Failure {
            phase,
            kind: e.kind(),
            message: e.to_string(),
            critical_line: e.critical_line().map(ToOwned::to_owned),
        };
        if let Err(re) = self
            .run
            .fail(phase, e.phase_outcome(), failure, diagnostic)
        {
            error!("Failed to record failure of {phase}: {re}");
        }
        self.checkpoint();
    }

    async fn force_stop(&mut self) {
        let Some(vm) = self.vm.clone() else {
            return;
        };
        if vm.state != VmState::Running {
            return;
        }
        match hypervisor::call(&self.ctx.hypervisor, move |h| h.stop(&vm, true)).await {
            Ok(()) => self.set_state(VmState::Stopped),
            Err(e) => warn!("Force-stop failed: {e}"),
        }
    }

    async fn teardown(&mut self) {
        let Some(vm) = self.vm.clone() else {
            return;
        };
        if self.lease.is_some() {
            if self.reverted {
                return;
            }
            match self.revert_to_baseline().await {
                Ok(()) => return,
                Err(e) => error!("{e}; destroying instance instead"),
            }
        }
        match hypervisor::call(&self.ctx.hypervisor, move |h| h.destroy(&vm)).await {
            Ok(()) => self.set_state(VmState::Destroyed),
            Err(e) => error!("Failed to destroy instance: {e}"),
        }
    }

    /// Force-stop the instance and return it to its baseline snapshot.
    async fn revert_to_baseline(&mut self) -> Result<(), RunError> {
        let vm = self.instance()?;
        let snapshot = self.ctx.config.hypervisor.snapshot.clone();
        let hv = Arc::clone(&self.ctx.hypervisor);
        let target = vm.clone();
        hypervisor::call(&hv, move |h| h.stop(&target, true)).await?;
        self.set_state(VmState::Stopped);
        let target = vm.clone();
        let snap = snapshot.clone();
        hypervisor::call(&hv, move |h| h.snapshot_revert(&target, &snap))
            .await
            .map_err(|e| match e {
                RunError::Hypervisor(source) => RunError::Revert {
                    instance: vm.name.clone(),
                    snapshot,
                    source,
                },
                e => e,
            })?;
        if let Some(vm) = self.vm.as_mut() {
            vm.address = None;
        }
        self.reverted = true;
        info!("Reverted {} to baseline", vm.name);
        Ok(())
    }

    async fn provision(&mut self) -> Result<(), RunError> {
        match self.try_provision().await {
            Err(RunError::Hypervisor(e)) => {
                warn!("Provisioning failed, retrying once: {e}");
                self.note(&format!("provisioning failed, retrying: {e}"));
                self.window.push(&e.to_string());
                self.prepare_retry().await?;
                self.try_provision().await
            }
            r => r,
        }
    }

    /// Either return a half-provisioned instance to its baseline or discard it.
    async fn prepare_retry(&mut self) -> Result<(), RunError> {
        let Some(vm) = self.vm.clone() else {
            return Ok(());
        };
        let snapshot = self.ctx.config.hypervisor.snapshot.clone();
        let probe = vm.clone();
        let has_baseline = hypervisor::call(&self.ctx.hypervisor, move |h| h.snapshot_list(&probe))
            .await
            .map(|s| s.contains(&snapshot))
            .unwrap_or(false);
        if has_baseline {
            self.revert_to_baseline().await?;
            self.reverted = false;
            return Ok(());
        }
        hypervisor::call(&self.ctx.hypervisor, move |h| h.destroy(&vm)).await?;
        self.vm = None;
        Ok(())
    }

    async fn try_provision(&mut self) -> Result<(), RunError> {
        if self.vm.is_none() {
            if self.ctx.config.hypervisor.teardown == Teardown::Revert && self.lease.is_none() {
                let name = baseline_name(&self.profile.name);
                self.lease = self.ctx.baselines.claim(&name);
                if self.lease.is_none() {
                    info!("Baseline {name} is in use; using a disposable instance");
                }
            }
            match self.lease.as_ref().map(|l| l.name.clone()) {
                Some(name) => self.acquire_baseline(name).await?,
                None => {
                    let name = instance_name(&self.profile.name, &self.run.run_id);
                    self.create_instance(name).await?
                }
            }
        }
        let mut vm = self.instance()?;
        self.provision_step(move |h| {
            h.start(&vm)?;
            vm.state = VmState::Running;
            Ok(vm)
        })
        .await
    }

    /// Reuse the profile's baseline instance if it exists with its snapshot,
    /// otherwise (re)create it.
    async fn acquire_baseline(&mut self, name: String) -> Result<(), RunError> {
        let hv = Arc::clone(&self.ctx.hypervisor);
        let prefix = name.clone();
        let existing = hypervisor::call(&hv, move |h| h.list_instances(&prefix)).await?;
        if existing.contains(&name) {
            let vm = hv.adopt(&name);
            self.vm = Some(vm.clone());
            let snapshot = self.ctx.config.hypervisor.snapshot.clone();
            let snapshots = hypervisor::call(&hv, move |h| h.snapshot_list(&vm)).await?;
            if snapshots.contains(&snapshot) {
                match self.revert_to_baseline().await {
                    Ok(()) => {
                        self.reverted = false;
                        info!("Reusing baseline {name}");
                        return Ok(());
                    }
                    Err(e) => warn!("{e}; recreating baseline"),
                }
            } else {
                warn!("{name} has no {snapshot} snapshot; recreating it");
            }
            let vm = self.instance()?;
            hypervisor::call(&hv, move |h| h.destroy(&vm)).await?;
            self.vm = None;
        }
        self.create_instance(name).await
    }

    /// Define a fresh instance and take its baseline snapshot.
    async fn create_instance(&mut self, name: String) -> Result<(), RunError> {
        let spec = self
            .profile
            .vm_spec(&name)
            .map_err(|e| RunError::Internal(format!("{e:#}")))?;
        self.provision_step(move |h| h.create(&spec)).await?;
        info!("Defined {name}");
        let vm = self.instance()?;
        let snapshot = self.ctx.config.hypervisor.snapshot.clone();
        self.provision_step(move |h| {
            h.snapshot_create(&vm, &snapshot)?;
            Ok(vm)
        })
        .await
    }

    /// Run a call that creates or changes the instance. If the run is
    /// abandoned while it is in flight, [`Self::settle_inflight`] picks up
    /// its result so teardown still sees the instance.
    async fn provision_step<F>(&mut self, f: F) -> Result<(), RunError>
    where
        F: FnOnce(&dyn Hypervisor) -> Result<VmInstance, HypervisorError> + Send + 'static,
    {
        let hv = Arc::clone(&self.ctx.hypervisor);
        let handle = self
            .inflight
            .insert(tokio::task::spawn_blocking(move || f(hv.as_ref())));
        let r = handle.await;
        self.inflight = None;
        self.vm = Some(r??);
        Ok(())
    }

    async fn settle_inflight(&mut self) {
        let Some(handle) = self.inflight.take() else {
            return;
        };
        debug!("Waiting for interrupted provisioning call");
        match handle.await {
            Ok(Ok(vm)) => {
                info!("Taking over {} from interrupted provisioning", vm.name);
                self.vm = Some(vm);
            }
            Ok(Err(e)) => debug!("Interrupted provisioning call failed: {e}"),
            Err(e) => warn!("Provisioning task failed: {e}"),
        }
    }

    async fn boot(&mut self) -> Result<(), RunError> {
        let vm = self.instance()?;
        let t = &self.ctx.config.timeouts;
        let spinner = Spinner::new(&self.ctx.progress, &self.profile.name);
        let ip = await_network(
            &self.ctx.hypervisor,
            &vm,
            self.wait(t.network()),
            &self.cancel,
            &spinner,
        )
        .await?;
        info!("Guest address {ip}");
        if let Some(vm) = self.vm.as_mut() {
            vm.address = Some(ip);
        }
        let cred = self.ctx.config.ssh.installer_credential();
        await_remote_exec(
            &self.ctx.remote,
            ip,
            &cred,
            self.ctx.config.ssh.connect_timeout,
            self.wait(t.remote_exec()),
            &self.cancel,
            &spinner,
        )
        .await?;
        Ok(())
    }

    /// Update counters and the diagnostic window, and decide what the event means.
    fn observe(&mut self, ev: StreamEvent) -> Signal {
        self.run.lines_seen += 1;
        self.window.push(&ev.raw);
        match ev.tag {
            Tag::Informational => Signal::None,
            Tag::PhaseMarker(name) => {
                info!("Marker {name}");
                let complete = name == INSTALL_COMPLETE;
                self.run.markers.push(name);
                if complete {
                    Signal::Complete
                } else {
                    Signal::None
                }
            }
            Tag::CriticalError(pattern) => Signal::Critical {
                line: ev.raw,
                pattern,
            },
        }
    }

    async fn install(&mut self) -> Result<(), RunError> {
        let ip = self.address()?;
        let config = Arc::clone(&self.ctx.config);
        let cred = config.ssh.installer_credential();
        let remote = Arc::clone(&self.ctx.remote);
        if let Some(dir) = &config.paths.payload_dir {
            remote.upload(ip, &cred, dir, REMOTE_PAYLOAD_DIR).await?;
        }
        let command = self
            .profile
            .installer_command_line(cred.user != "root")
            .map_err(|e| RunError::Internal(format!("{e:#}")))?;
        self.note(&format!("spawn: {command}"));
        let mut process = remote.spawn(ip, &cred, &command).await?;
        let lines = process
            .take_lines()
            .ok_or_else(|| RunError::Internal("installer output already taken".into()))?;
        let (tx, mut events) = mpsc::channel(EVENT_BUFFER);
        let consumer = AbortOnDropHandle::new(tokio::spawn(consume_stream(
            lines,
            Arc::clone(&self.ctx.rules),
            self.log.clone(),
            tx,
        )));

        let budget = config.timeouts.install();
        let deadline = Instant::now() + budget;
        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                ev = events.recv() => match ev {
                    Some(ev) => match self.observe(ev) {
                        Signal::None => {}
                        Signal::Complete => {
                            self.installer = Some(Installer {
                                process,
                                events,
                                _consumer: consumer,
                                deadline,
                            });
                            return Ok(());
                        }
                        Signal::Critical { line, pattern } => {
                            // Fail fast: nothing after this line is consumed.
                            process.kill();
                            return Err(RunError::CriticalInstall { line, pattern });
                        }
                    },
                    None => {
                        let exit = process
                            .take_exit()
                            .ok_or_else(|| RunError::Internal("installer exit already taken".into()))?;
                        let status = tokio::time::timeout_at(deadline, exit)
                            .await
                            .map_err(|_| RunError::timeout("installer to exit", budget))?
                            .unwrap_or(None);
                        return Err(match status {
                            Some(0) => RunError::MissingMarker,
                            status => RunError::InstallerExit { status },
                        });
                    }
                },
                _ = &mut sleep => {
                    process.kill();
                    return Err(RunError::timeout(INSTALL_COMPLETE, budget));
                }
            }
        }
    }

    /// Let the installer finish, restart the guest and wait for it to return.
    async fn reboot(&mut self) -> Result<(), RunError> {
        let mut installer = self
            .installer
            .take()
            .ok_or_else(|| RunError::Internal("installer not running".into()))?;
        let exit = installer
            .process
            .take_exit()
            .ok_or_else(|| RunError::Internal("installer exit already taken".into()))?;
        let budget = self.ctx.config.timeouts.install();
        let drained = tokio::time::timeout_at(installer.deadline, async {
            while let Some(ev) = installer.events.recv().await {
                if let Signal::Critical { line, pattern } = self.observe(ev) {
                    return Err(RunError::CriticalInstall { line, pattern });
                }
            }
            Ok(exit.await.unwrap_or(None))
        })
        .await
        .map_err(|_| RunError::timeout("installer to exit", budget))?;
        let status = drained?;
        if status != Some(0) {
            return Err(RunError::InstallerExit { status });
        }
        drop(installer);

        let config = Arc::clone(&self.ctx.config);
        let t = &config.timeouts;
        let ip = self.address()?;
        let installer_cred = config.ssh.installer_credential();
        let reboot_cmd = if installer_cred.user == "root" {
            "systemctl reboot"
        } else {
            "sudo systemctl reboot"
        };
        self.note("issuing reboot");
        // The connection usually drops before a status comes back.
        match tokio::time::timeout(
            probe_timeout(config.ssh.connect_timeout),
            self.ctx.remote.run(ip, &installer_cred, reboot_cmd),
        )
        .await
        {
            Ok(Ok(out)) => debug!("reboot: {:?}", out.status),
            Ok(Err(e)) => debug!("reboot: {e}"),
            Err(_) => debug!("reboot: no response"),
        }
        if let Some(vm) = self.vm.as_mut() {
            vm.address = None;
        }
        tokio::time::sleep(t.reboot_grace()).await;

        let deadline = Instant::now() + t.reboot();
        let vm = self.instance()?;
        let spinner = Spinner::new(&self.ctx.progress, &self.profile.name);
        let ip = await_network(
            &self.ctx.hypervisor,
            &vm,
            self.wait(t.reboot()),
            &self.cancel,
            &spinner,
        )
        .await?;
        if let Some(vm) = self.vm.as_mut() {
            vm.address = Some(ip);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        await_remote_exec(
            &self.ctx.remote,
            ip,
            &config.ssh.validate_credential(),
            config.ssh.connect_timeout,
            self.wait(remaining),
            &self.cancel,
            &spinner,
        )
        .await
        .map_err(|e| match e {
            RunError::Timeout { what, .. } => RunError::Timeout {
                what,
                after: t.reboot(),
            },
            e => e,
        })?;
        Ok(())
    }

    async fn validate(&mut self) -> Result<(), RunError> {
        let ip = self.address()?;
        let config = Arc::clone(&self.ctx.config);
        let cred = config.ssh.validate_credential();
        let limit = config.timeouts.validate_command();
        for command in &self.profile.validate {
            self.note(&format!("validate: {command}"));
            let out = tokio::time::timeout(limit, self.ctx.remote.run(ip, &cred, command))
                .await
                .map_err(|_| RunError::timeout(format!("validation command `{command}`"), limit))??;
            if let Some(log) = &self.log {
                for line in out.output.lines() {
                    log.line(line);
                }
            }
            if !out.success() {
                return Err(RunError::Validation {
                    command: command.clone(),
                    status: out.status,
                    output: out.output,
                });
            }
            debug!("Validation passed: {command}");
        }
        if self.lease.is_some() {
            self.revert_to_baseline().await?;
        }
        Ok(())
    }
}
