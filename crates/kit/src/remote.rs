//! Remote execution channel to the guest
//!
//! The orchestrator needs four things from the guest: a cheap liveness probe,
//! one-shot commands with captured output, a payload upload, and a
//! long-running command whose output is consumed line by line while it
//! runs. [`RemoteExec`] abstracts these; [`Ssh`] implements them with the
//! OpenSSH client tools.

use std::net::IpAddr;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::utils::decode_line;

/// Lines buffered between the remote process reader and its consumer.
const LINE_BUFFER: usize = 256;

/// Authentication for the remote channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub user: String,
    pub identity: Option<Utf8PathBuf>,
    pub password: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("remote command failed ({}): {output}", fmt_status(*.status))]
    Failed { status: Option<i32>, output: String },
    #[error("remote I/O: {0}")]
    Io(#[from] std::io::Error),
}

fn fmt_status(status: Option<i32>) -> String {
    status
        .map(|s| format!("status {s}"))
        .unwrap_or_else(|| "killed".to_owned())
}

/// Result of a one-shot remote command; stdout and stderr are merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// A command running on the guest.
///
/// Lines arrive in the order they were produced; the channel closes at end
/// of output. The exit status is delivered once the process has exited.
/// Dropping the handle kills the process.
#[derive(Debug)]
pub struct RemoteProcess {
    lines: Option<mpsc::Receiver<String>>,
    exit: Option<oneshot::Receiver<Option<i32>>>,
    kill: CancellationToken,
}

impl RemoteProcess {
    pub fn new(
        lines: mpsc::Receiver<String>,
        exit: oneshot::Receiver<Option<i32>>,
        kill: CancellationToken,
    ) -> Self {
        Self {
            lines: Some(lines),
            exit: Some(exit),
            kill,
        }
    }

    /// Take the output line receiver; `None` once taken.
    pub fn take_lines(&mut self) -> Option<mpsc::Receiver<String>> {
        self.lines.take()
    }

    /// Take the receiver for the exit status; `None` once taken.
    pub fn take_exit(&mut self) -> Option<oneshot::Receiver<Option<i32>>> {
        self.exit.take()
    }

    pub fn kill(&self) {
        self.kill.cancel();
    }
}

impl Drop for RemoteProcess {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Run a trivial command; succeeds once the channel accepts connections.
    async fn probe(&self, host: IpAddr, cred: &Credential) -> Result<(), RemoteError>;

    async fn run(
        &self,
        host: IpAddr,
        cred: &Credential,
        command: &str,
    ) -> Result<CommandOutput, RemoteError>;

    /// Copy a local directory to `remote_dir` on the guest.
    async fn upload(
        &self,
        host: IpAddr,
        cred: &Credential,
        local: &Utf8Path,
        remote_dir: &str,
    ) -> Result<(), RemoteError>;

    /// Start a long-running command and stream its merged output.
    async fn spawn(
        &self,
        host: IpAddr,
        cred: &Credential,
        command: &str,
    ) -> Result<RemoteProcess, RemoteError>;
}

/// OpenSSH client tools.
#[derive(Debug, Clone)]
pub struct Ssh {
    pub connect_timeout: u64,
}

/// Options shared by `ssh` and `scp`: ephemeral guests never have stable host keys.
fn common_ssh_options(connect_timeout: u64, batch: bool) -> Vec<String> {
    let mut opts = vec![
        "-o".to_owned(),
        "StrictHostKeyChecking=no".to_owned(),
        "-o".to_owned(),
        "UserKnownHostsFile=/dev/null".to_owned(),
        "-o".to_owned(),
        format!("ConnectTimeout={connect_timeout}"),
        "-o".to_owned(),
        "LogLevel=ERROR".to_owned(),
        "-o".to_owned(),
        "ServerAliveInterval=15".to_owned(),
    ];
    if batch {
        opts.extend(["-o".to_owned(), "BatchMode=yes".to_owned()]);
    }
    opts
}

/// Argument vector for `ssh` running `command` on `host`.
fn ssh_args(connect_timeout: u64, host: IpAddr, cred: &Credential, command: &str) -> Vec<String> {
    let mut args = common_ssh_options(connect_timeout, cred.password.is_none());
    if let Some(identity) = &cred.identity {
        args.extend(["-i".to_owned(), identity.to_string()]);
    }
    args.push(format!("{}@{}", cred.user, host));
    args.push("--".to_owned());
    // Merge stderr so ordering between the two streams is preserved
    args.push(format!("exec 2>&1; {command}"));
    args
}

impl Ssh {
    fn command(&self, program: &str, cred: &Credential) -> Command {
        let mut cmd = match &cred.password {
            Some(password) => {
                let mut c = Command::new("sshpass");
                c.arg("-e").arg(program).env("SSHPASS", password);
                c
            }
            None => Command::new(program),
        };
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    fn program_name(cred: &Credential, program: &str) -> String {
        if cred.password.is_some() {
            format!("sshpass {program}")
        } else {
            program.to_owned()
        }
    }
}

#[async_trait]
impl RemoteExec for Ssh {
    async fn probe(&self, host: IpAddr, cred: &Credential) -> Result<(), RemoteError> {
        let out = self.run(host, cred, "echo ready").await?;
        if out.success() && out.output.trim() == "ready" {
            Ok(())
        } else {
            Err(RemoteError::Failed {
                status: out.status,
                output: out.output,
            })
        }
    }

    async fn run(
        &self,
        host: IpAddr,
        cred: &Credential,
        command: &str,
    ) -> Result<CommandOutput, RemoteError> {
        let mut cmd = self.command("ssh", cred);
        cmd.args(ssh_args(self.connect_timeout, host, cred, command));
        trace!("exec: {cmd:?}");
        let output = cmd.output().await.map_err(|source| RemoteError::Spawn {
            program: Self::program_name(cred, "ssh"),
            source,
        })?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        // Connection failures are reported by ssh itself on stderr
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(CommandOutput {
            status: output.status.code(),
            output: text,
        })
    }

    async fn upload(
        &self,
        host: IpAddr,
        cred: &Credential,
        local: &Utf8Path,
        remote_dir: &str,
    ) -> Result<(), RemoteError> {
        let mut cmd = self.command("scp", cred);
        cmd.args(common_ssh_options(self.connect_timeout, cred.password.is_none()));
        if let Some(identity) = &cred.identity {
            cmd.arg("-i").arg(identity.as_str());
        }
        cmd.arg("-r")
            .arg(local.as_str())
            .arg(format!("{}@{}:{}", cred.user, host, remote_dir));
        debug!("Uploading {local} to {host}:{remote_dir}");
        let output = cmd.output().await.map_err(|source| RemoteError::Spawn {
            program: Self::program_name(cred, "scp"),
            source,
        })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(RemoteError::Failed {
                status: output.status.code(),
                output: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }

    async fn spawn(
        &self,
        host: IpAddr,
        cred: &Credential,
        command: &str,
    ) -> Result<RemoteProcess, RemoteError> {
        let mut cmd = self.command("ssh", cred);
        cmd.args(ssh_args(self.connect_timeout, host, cred, command))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        trace!("spawn: {cmd:?}");
        let child = cmd.spawn().map_err(|source| RemoteError::Spawn {
            program: Self::program_name(cred, "ssh"),
            source,
        })?;
        stream_child(child)
    }
}

/// Forward the stdout of `child` line by line until it closes, then report
/// its exit status. Bytes that are not UTF-8 are replaced, never fatal.
fn stream_child(mut child: Child) -> Result<RemoteProcess, RemoteError> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RemoteError::Io(std::io::Error::other("stdout not captured")))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| RemoteError::Io(std::io::Error::other("stderr not captured")))?;

    let (line_tx, line_rx) = mpsc::channel(LINE_BUFFER);
    let (exit_tx, exit_rx) = oneshot::channel();
    let kill = CancellationToken::new();
    let killed = kill.clone();

    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            tokio::select! {
                _ = killed.cancelled() => {
                    if let Err(e) = child.kill().await {
                        debug!("Failed to kill remote process: {e}");
                    }
                    let _ = exit_tx.send(None);
                    return;
                }
                n = reader.read_until(b'\n', &mut buf) => match n {
                    Ok(0) => break,
                    Ok(_) => {
                        if line_tx.send(decode_line(&buf)).await.is_err() {
                            // Consumer is gone; keep draining so the child never blocks
                            continue;
                        }
                    }
                    Err(e) => {
                        debug!("Reading remote output: {e}");
                        break;
                    }
                }
            }
        }
        drop(line_tx);
        let mut ssh_err = String::new();
        let _ = stderr.read_to_string(&mut ssh_err).await;
        if !ssh_err.trim().is_empty() {
            debug!("ssh: {}", ssh_err.trim());
        }
        let status = tokio::select! {
            _ = killed.cancelled() => {
                let _ = child.kill().await;
                None
            }
            status = child.wait() => status.ok().and_then(|s| s.code()),
        };
        let _ = exit_tx.send(status);
    });

    Ok(RemoteProcess::new(line_rx, exit_rx, kill))
}

/// Upper bound for one readiness probe so a hung connection cannot eat the
/// whole wait.
pub(crate) fn probe_timeout(connect_timeout: u64) -> Duration {
    Duration::from_secs(connect_timeout.saturating_mul(2).max(1))
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted guest.

    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Output and exit behaviour of the installer.
    #[derive(Debug, Clone)]
    pub(crate) struct InstallScript {
        pub lines: Vec<String>,
        /// Delay before each line.
        pub line_delay: Duration,
        pub exit: Option<i32>,
        /// Keep the process running after the last line until killed.
        pub hang: bool,
    }

    impl InstallScript {
        pub(crate) fn new(lines: &[&str]) -> Self {
            Self {
                lines: lines.iter().map(|l| l.to_string()).collect(),
                line_delay: Duration::from_millis(10),
                exit: Some(0),
                hang: false,
            }
        }

        pub(crate) fn successful() -> Self {
            Self::new(&[
                "Starting install",
                "Setting up disk partitioning",
                "Installing NixOS configuration",
                "Installation complete",
            ])
        }
    }

    #[derive(Debug)]
    pub(crate) struct MockRemote {
        pub probe_failures: AtomicU32,
        pub script: InstallScript,
        /// Results for validation commands keyed by command; others succeed.
        pub commands: BTreeMap<String, CommandOutput>,
        pub log: Mutex<Vec<String>>,
    }

    impl MockRemote {
        pub(crate) fn new(script: InstallScript) -> Self {
            Self {
                probe_failures: AtomicU32::new(0),
                script,
                commands: BTreeMap::new(),
                log: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn with_command(mut self, command: &str, status: i32, output: &str) -> Self {
            self.commands.insert(
                command.to_owned(),
                CommandOutput {
                    status: Some(status),
                    output: output.to_owned(),
                },
            );
            self
        }

        pub(crate) fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemoteExec for MockRemote {
        async fn probe(&self, host: IpAddr, cred: &Credential) -> Result<(), RemoteError> {
            self.log.lock().unwrap().push(format!("probe {}@{host}", cred.user));
            let remaining = self.probe_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.probe_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(RemoteError::Failed {
                    status: Some(255),
                    output: "Connection refused".into(),
                });
            }
            Ok(())
        }

        async fn run(
            &self,
            _host: IpAddr,
            cred: &Credential,
            command: &str,
        ) -> Result<CommandOutput, RemoteError> {
            self.log.lock().unwrap().push(format!("run {}: {command}", cred.user));
            Ok(self.commands.get(command).cloned().unwrap_or(CommandOutput {
                status: Some(0),
                output: String::new(),
            }))
        }

        async fn upload(
            &self,
            _host: IpAddr,
            _cred: &Credential,
            local: &Utf8Path,
            remote_dir: &str,
        ) -> Result<(), RemoteError> {
            self.log.lock().unwrap().push(format!("upload {local} {remote_dir}"));
            Ok(())
        }

        async fn spawn(
            &self,
            _host: IpAddr,
            _cred: &Credential,
            command: &str,
        ) -> Result<RemoteProcess, RemoteError> {
            self.log.lock().unwrap().push(format!("spawn {command}"));
            let (line_tx, line_rx) = mpsc::channel(LINE_BUFFER);
            let (exit_tx, exit_rx) = oneshot::channel();
            let kill = CancellationToken::new();
            let killed = kill.clone();
            let script = self.script.clone();
            tokio::spawn(async move {
                let feed = async {
                    for line in script.lines {
                        tokio::time::sleep(script.line_delay).await;
                        if line_tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    if script.hang {
                        std::future::pending::<()>().await;
                    }
                };
                let status = tokio::select! {
                    _ = killed.cancelled() => None,
                    _ = feed => script.exit,
                };
                drop(line_tx);
                let _ = exit_tx.send(status);
            });
            Ok(RemoteProcess::new(line_rx, exit_rx, kill))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{InstallScript, MockRemote};
    use super::*;

    fn cred(password: Option<&str>) -> Credential {
        Credential {
            user: "nixos".into(),
            identity: Some("/root/.ssh/id_ed25519".into()),
            password: password.map(Into::into),
        }
    }

    #[test]
    fn test_ssh_args() {
        let host: IpAddr = "192.168.122.10".parse().unwrap();
        let args = ssh_args(5, host, &cred(None), "uname -a");
        assert!(args.contains(&"StrictHostKeyChecking=no".to_owned()));
        assert!(args.contains(&"UserKnownHostsFile=/dev/null".to_owned()));
        assert!(args.contains(&"ConnectTimeout=5".to_owned()));
        assert!(args.contains(&"BatchMode=yes".to_owned()));
        assert!(args.contains(&"/root/.ssh/id_ed25519".to_owned()));
        let n = args.len();
        assert_eq!(args[n - 3], "nixos@192.168.122.10");
        assert_eq!(args[n - 2], "--");
        assert_eq!(args[n - 1], "exec 2>&1; uname -a");

        let with_pw = ssh_args(5, host, &cred(Some("nixos")), "true");
        assert!(!with_pw.contains(&"BatchMode=yes".to_owned()));
    }

    #[test]
    fn test_probe_timeout() {
        assert_eq!(probe_timeout(5), Duration::from_secs(10));
        assert_eq!(probe_timeout(0), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_stream_replaces_invalid_utf8() {
        let child = Command::new("sh")
            .arg("-c")
            .arg(r"printf 'Starting install\n\377\376 progress\nInstallation complete\n'")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let mut p = stream_child(child).unwrap();
        let mut lines = p.take_lines().unwrap();
        let mut got = Vec::new();
        while let Some(l) = lines.recv().await {
            got.push(l);
        }
        assert_eq!(
            got,
            [
                "Starting install",
                "\u{fffd}\u{fffd} progress",
                "Installation complete"
            ]
        );
        assert_eq!(p.take_exit().unwrap().await.unwrap(), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_stream_order_and_exit() {
        let remote = MockRemote::new(InstallScript::new(&["a", "b", "c"]));
        let host: IpAddr = "10.0.0.1".parse().unwrap();
        let mut p = remote.spawn(host, &cred(None), "install").await.unwrap();
        let mut lines = p.take_lines().unwrap();
        let mut got = Vec::new();
        while let Some(l) = lines.recv().await {
            got.push(l);
        }
        assert_eq!(got, ["a", "b", "c"]);
        assert_eq!(p.take_exit().unwrap().await.unwrap(), Some(0));
        assert!(p.take_exit().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_kill() {
        let mut script = InstallScript::new(&["a"]);
        script.hang = true;
        let remote = MockRemote::new(script);
        let host: IpAddr = "10.0.0.1".parse().unwrap();
        let mut p = remote.spawn(host, &cred(None), "install").await.unwrap();
        let mut lines = p.take_lines().unwrap();
        assert_eq!(lines.recv().await.as_deref(), Some("a"));
        p.kill();
        assert_eq!(p.take_exit().unwrap().await.unwrap(), None);
    }
}
