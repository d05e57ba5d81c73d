//! Per-run verbose logs
//!
//! Every line the installer prints, plus orchestrator notes, is kept in
//! `<log_dir>/<profile>/<run_id>.log` for post-mortem analysis. Only the most
//! recent runs of each profile are retained.

use std::fs::File;
use std::io::{LineWriter, Write as _};
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{SecondsFormat, Utc};
use color_eyre::eyre::Context;
use color_eyre::Result;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct RunLog {
    path: Utf8PathBuf,
    file: Mutex<Option<LineWriter<File>>>,
}

impl RunLog {
    pub fn create(log_dir: &Utf8Path, profile: &str, run_id: &str) -> Result<Self> {
        let dir = log_dir.join(profile);
        std::fs::create_dir_all(&dir).with_context(|| format!("Creating {dir}"))?;
        let path = dir.join(format!("{run_id}.log"));
        let f = File::create(&path).with_context(|| format!("Creating {path}"))?;
        Ok(Self {
            path,
            file: Mutex::new(Some(LineWriter::new(f))),
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn write(&self, prefix: &str, text: &str) {
        let Ok(mut guard) = self.file.lock() else {
            return;
        };
        let Some(f) = guard.as_mut() else {
            return;
        };
        let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        if let Err(e) = writeln!(f, "{ts} {prefix}{text}") {
            // Stop logging rather than failing the run
            warn!("Writing {}: {e}", self.path);
            *guard = None;
        }
    }

    /// Record one line of guest output.
    pub fn line(&self, text: &str) {
        self.write("| ", text);
    }

    /// Record an orchestrator event.
    pub fn note(&self, text: &str) {
        self.write("# ", text);
    }
}

/// Remove all but the newest `keep` logs of `profile`; returns what was removed.
///
/// Log names start with the run id, which starts with a UTC timestamp, so
/// lexical order is chronological order.
pub fn prune(log_dir: &Utf8Path, profile: &str, keep: usize) -> Result<Vec<Utf8PathBuf>> {
    let dir = log_dir.join(profile);
    let entries = match dir.read_dir_utf8() {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Reading {dir}")),
    };
    let mut logs: Vec<Utf8PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .filter(|p| p.extension() == Some("log"))
        .collect();
    logs.sort();
    let excess = logs.len().saturating_sub(keep);
    let mut removed = Vec::new();
    for path in logs.into_iter().take(excess) {
        std::fs::remove_file(&path).with_context(|| format!("Removing {path}"))?;
        debug!("Pruned {path}");
        removed.push(path);
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let td = tempfile::tempdir().unwrap();
        let p = Utf8PathBuf::try_from(td.path().to_path_buf()).unwrap();
        (td, p)
    }

    #[test]
    fn test_log_lines() {
        let (_td, dir) = tempdir();
        let log = RunLog::create(&dir, "vm", "20260101000000-0001").unwrap();
        log.note("phase install started");
        log.line("Installation complete");
        let text = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("# phase install started"));
        assert!(lines[1].ends_with("| Installation complete"));
        assert_eq!(log.path(), dir.join("vm/20260101000000-0001.log"));
    }

    #[test]
    fn test_prune_keeps_newest() {
        let (_td, dir) = tempdir();
        for i in 0..7 {
            RunLog::create(&dir, "server", &format!("2026010100000{i}-abcd")).unwrap();
        }
        // Unrelated files are left alone
        std::fs::write(dir.join("server/notes.txt"), "x").unwrap();
        let removed = prune(&dir, "server", 5).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(removed[0].as_str().ends_with("20260101000000-abcd.log"));
        assert!(removed[1].as_str().ends_with("20260101000001-abcd.log"));
        let left = std::fs::read_dir(dir.join("server")).unwrap().count();
        assert_eq!(left, 6);
        assert!(prune(&dir, "absent", 5).unwrap().is_empty());
    }
}
