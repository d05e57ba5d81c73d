//! Readiness probing
//!
//! Network readiness and remote-exec readiness are separate waits: a guest
//! usually holds a DHCP lease well before its SSH daemon accepts
//! connections. Both are built on [`await_predicate`].

use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::RunError;
use crate::hypervisor::{self, Hypervisor, VmInstance};
use crate::remote::{probe_timeout, Credential, RemoteExec};

/// How long to wait and how often to look.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wait {
    pub timeout: Duration,
    pub interval: Duration,
}

/// Spinner for a wait, attached to the shared progress display and cleared
/// when dropped.
#[derive(Debug)]
pub struct Spinner(ProgressBar);

impl Spinner {
    pub fn new(progress: &MultiProgress, prefix: &str) -> Self {
        let pb = progress.add(ProgressBar::new_spinner());
        if let Ok(style) = ProgressStyle::with_template("{spinner} {prefix:.bold} {wide_msg}") {
            pb.set_style(style);
        }
        pb.set_prefix(prefix.to_owned());
        pb.enable_steady_tick(Duration::from_millis(150));
        Self(pb)
    }
}

impl std::ops::Deref for Spinner {
    type Target = ProgressBar;

    fn deref(&self) -> &ProgressBar {
        &self.0
    }
}

impl Drop for Spinner {
    fn drop(&mut self) {
        self.0.finish_and_clear();
    }
}

/// Poll `check` until it yields a value, the timeout elapses, or `cancel` fires.
///
/// Errors from `check` count as "not ready yet". Each attempt is itself
/// bounded by the time left, so the call returns no later than the timeout
/// plus scheduling jitter, and never before the timeout on failure.
pub async fn await_predicate<T, F, Fut>(
    what: &str,
    wait: Wait,
    cancel: &CancellationToken,
    progress: &ProgressBar,
    mut check: F,
) -> Result<T, RunError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = color_eyre::Result<Option<T>>>,
{
    let start = Instant::now();
    let deadline = start + wait.timeout;
    debug!("Waiting for {what} (timeout: {}s)", wait.timeout.as_secs());

    let mut attempt = 0u32;
    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        attempt += 1;
        progress.set_message(format!(
            "{what} (attempt {attempt}, elapsed: {}s)",
            start.elapsed().as_secs()
        ));

        let r = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RunError::Aborted),
            r = tokio::time::timeout(deadline - now, check()) => r,
        };
        match r {
            Ok(Ok(Some(v))) => {
                debug!("{what}: ready after {attempt} attempts");
                return Ok(v);
            }
            Ok(Ok(None)) => debug!("{what}: attempt {attempt} not ready"),
            Ok(Err(e)) => debug!("{what}: attempt {attempt} failed: {e}"),
            Err(_) => debug!("{what}: attempt {attempt} hit the deadline"),
        }

        let sleep_until = (Instant::now() + wait.interval).min(deadline);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RunError::Aborted),
            _ = tokio::time::sleep_until(sleep_until) => {}
        }
    }
    Err(RunError::timeout(what, wait.timeout))
}

/// Wait until the hypervisor reports an address for `vm`.
pub async fn await_network(
    hv: &Arc<dyn Hypervisor>,
    vm: &VmInstance,
    wait: Wait,
    cancel: &CancellationToken,
    progress: &ProgressBar,
) -> Result<IpAddr, RunError> {
    await_predicate("network", wait, cancel, progress, || {
        let vm = vm.clone();
        async move {
            let ip = hypervisor::call(hv, move |h| h.get_address(&vm)).await?;
            Ok(ip)
        }
    })
    .await
}

/// Wait until a trivial remote command succeeds on `ip`.
pub async fn await_remote_exec(
    remote: &Arc<dyn RemoteExec>,
    ip: IpAddr,
    cred: &Credential,
    connect_timeout: u64,
    wait: Wait,
    cancel: &CancellationToken,
    progress: &ProgressBar,
) -> Result<(), RunError> {
    await_predicate("remote exec", wait, cancel, progress, || async move {
        match tokio::time::timeout(probe_timeout(connect_timeout), remote.probe(ip, cred)).await {
            Ok(Ok(())) => Ok(Some(())),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(None),
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::hypervisor::mock::MockHypervisor;
    use crate::hypervisor::VmSpec;
    use crate::remote::mock::{InstallScript, MockRemote};

    fn wait(timeout: u64, interval: u64) -> Wait {
        Wait {
            timeout: Duration::from_secs(timeout),
            interval: Duration::from_secs(interval),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_within_bounds() {
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let r: Result<(), _> = await_predicate(
            "never",
            wait(10, 3),
            &cancel,
            &ProgressBar::hidden(),
            || async { Ok(None) },
        )
        .await;
        let elapsed = start.elapsed();
        assert!(matches!(r, Err(RunError::Timeout { .. })));
        assert!(elapsed >= Duration::from_secs(10), "{elapsed:?}");
        assert!(elapsed <= Duration::from_secs(13), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_check_is_bounded() {
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let r: Result<(), _> = await_predicate(
            "hung",
            wait(10, 2),
            &cancel,
            &ProgressBar::hidden(),
            || async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Some(()))
            },
        )
        .await;
        assert!(matches!(r, Err(RunError::Timeout { .. })));
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_attempts() {
        let cancel = CancellationToken::new();
        let n = AtomicU32::new(0);
        let v = await_predicate(
            "counter",
            wait(60, 2),
            &cancel,
            &ProgressBar::hidden(),
            || {
                let i = n.fetch_add(1, Ordering::SeqCst);
                async move {
                    if i < 2 {
                        Err(color_eyre::eyre::eyre!("not yet"))
                    } else {
                        Ok(Some(i))
                    }
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(v, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_polling() {
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            c.cancel();
        });
        let start = Instant::now();
        let r: Result<(), _> = await_predicate(
            "cancelled",
            wait(600, 2),
            &cancel,
            &ProgressBar::hidden(),
            || async { Ok(None) },
        )
        .await;
        assert!(matches!(r, Err(RunError::Aborted)));
        assert!(start.elapsed() < Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_network_without_address() {
        let mock = MockHypervisor::new().with_address_after(None);
        let hv: Arc<dyn Hypervisor> = Arc::new(mock);
        let vm = hv
            .create(&VmSpec {
                name: "vmit-vm-1-0001".into(),
                memory_mb: 512,
                vcpus: 1,
                disk_size: 1 << 30,
            })
            .unwrap();
        hv.start(&vm).unwrap();
        let start = Instant::now();
        let r = await_network(
            &hv,
            &vm,
            wait(10, 2),
            &CancellationToken::new(),
            &ProgressBar::hidden(),
        )
        .await;
        let elapsed = start.elapsed();
        assert!(matches!(r, Err(RunError::Timeout { .. })));
        assert!(elapsed >= Duration::from_secs(10));
        assert!(elapsed <= Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_network_and_remote_exec() {
        let hv: Arc<dyn Hypervisor> = Arc::new(MockHypervisor::new().with_address_after(Some(3)));
        let vm = hv
            .create(&VmSpec {
                name: "vmit-vm-1-0002".into(),
                memory_mb: 512,
                vcpus: 1,
                disk_size: 1 << 30,
            })
            .unwrap();
        hv.start(&vm).unwrap();
        let cancel = CancellationToken::new();
        let pb = ProgressBar::hidden();
        let ip = await_network(&hv, &vm, wait(60, 2), &cancel, &pb)
            .await
            .unwrap();

        let mock = MockRemote::new(InstallScript::successful());
        mock.probe_failures.store(2, Ordering::SeqCst);
        let remote: Arc<dyn RemoteExec> = Arc::new(mock);
        let cred = Credential {
            user: "nixos".into(),
            identity: None,
            password: None,
        };
        await_remote_exec(&remote, ip, &cred, 5, wait(60, 2), &cancel, &pb)
            .await
            .unwrap();
    }
}
