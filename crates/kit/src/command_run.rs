use std::io::{Read, Seek};
use std::process::Command;

/// Failure of a host-side tool invocation.
///
/// Carries the exit code (absent when the child was killed by a signal)
/// and the trailing bytes of its stderr.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {}: {stderr}", fmt_code(*.exit_code))]
    Exit {
        program: String,
        exit_code: Option<i32>,
        stderr: String,
    },
}

fn fmt_code(code: Option<i32>) -> String {
    code.map(|c| format!("status {c}"))
        .unwrap_or_else(|| "signal".to_owned())
}

impl CommandError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CommandError::Spawn { .. } => None,
            CommandError::Exit { exit_code, .. } => *exit_code,
        }
    }

    pub fn stderr(&self) -> &str {
        match self {
            CommandError::Spawn { .. } => "",
            CommandError::Exit { stderr, .. } => stderr,
        }
    }
}

/// Helpers intended for [`std::process::Command`].
pub trait CommandRun {
    /// Execute the child process, returning a typed error on failure.
    fn run(&mut self) -> Result<(), CommandError>;

    /// Execute the child process and capture its stdout as a string.
    fn run_get_string(&mut self) -> Result<String, CommandError>;
}

fn program_name(cmd: &Command) -> String {
    cmd.get_program().to_string_lossy().into_owned()
}

fn last_utf8_content_from_file(mut f: std::fs::File) -> String {
    // u16 since we truncate to just the trailing bytes here
    // to avoid pathological error messages
    const MAX_STDERR_BYTES: u16 = 1024;
    let size = f
        .metadata()
        .map_err(|e| {
            tracing::warn!("failed to fstat: {e}");
        })
        .map(|m| m.len().try_into().unwrap_or(u16::MAX))
        .unwrap_or(0);
    let size = size.min(MAX_STDERR_BYTES);
    let seek_offset = -(size as i32);
    let mut stderr_buf = Vec::with_capacity(size.into());
    let r = match f
        .seek(std::io::SeekFrom::End(seek_offset.into()))
        .and_then(|_| f.read_to_end(&mut stderr_buf))
    {
        Ok(_) => String::from_utf8_lossy(&stderr_buf),
        Err(e) => {
            tracing::warn!("failed seek+read: {e}");
            "<failed to read stderr>".into()
        }
    };
    r.trim_end().to_owned()
}

impl CommandRun for Command {
    fn run(&mut self) -> Result<(), CommandError> {
        let program = program_name(self);
        let spawn_err = |source| CommandError::Spawn {
            program: program.clone(),
            source,
        };
        let stderr = tempfile::tempfile().map_err(spawn_err)?;
        self.stderr(stderr.try_clone().map_err(spawn_err)?);
        tracing::trace!("exec: {self:?}");
        let status = self.status().map_err(spawn_err)?;
        if status.success() {
            return Ok(());
        }
        Err(CommandError::Exit {
            program,
            exit_code: status.code(),
            stderr: last_utf8_content_from_file(stderr),
        })
    }

    fn run_get_string(&mut self) -> Result<String, CommandError> {
        let program = program_name(self);
        let spawn_err = |source| CommandError::Spawn {
            program: program.clone(),
            source,
        };
        let mut stdout = tempfile::tempfile().map_err(spawn_err)?;
        self.stdout(stdout.try_clone().map_err(spawn_err)?);
        self.run()?;
        let mut s = String::new();
        stdout
            .seek(std::io::SeekFrom::Start(0))
            .and_then(|_| stdout.read_to_string(&mut s))
            .map_err(spawn_err)?;
        Ok(s)
    }
}
