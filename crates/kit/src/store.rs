//! Run state store
//!
//! The latest [`TestRun`] of every profile lives in one JSON document. Each
//! save reads the document, replaces one profile's entry and writes the
//! result to a new file that is renamed over the old one, so a crash leaves
//! either the previous or the next document and never a torn one. The file
//! can be deleted at any time to start from a clean baseline.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::phase::TestRun;

const STORE_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    version: u32,
    #[serde(default)]
    runs: BTreeMap<String, TestRun>,
}

#[derive(Debug)]
pub struct RunStateStore {
    path: Utf8PathBuf,
    // Serialises read-modify-rename cycles within this process.
    lock: Mutex<()>,
}

impl RunStateStore {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn split(&self) -> Result<(&Utf8Path, &str)> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_str().is_empty())
            .unwrap_or(Utf8Path::new("."));
        let name = self
            .path
            .file_name()
            .ok_or_else(|| eyre!("State file path has no file name: {}", self.path))?;
        Ok((parent, name))
    }

    fn read_document(&self) -> Result<StoreDocument> {
        let (parent, name) = self.split()?;
        let dir = match Dir::open_ambient_dir(parent, cap_std::ambient_authority()) {
            Ok(d) => d,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(StoreDocument::default()),
            Err(e) => return Err(e).with_context(|| format!("Opening {parent}")),
        };
        let text = match dir.read_to_string(name) {
            Ok(t) => t,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(StoreDocument::default()),
            Err(e) => return Err(e).with_context(|| format!("Reading {}", self.path)),
        };
        let doc: StoreDocument = serde_json::from_str(&text)
            .with_context(|| format!("Parsing state file {}", self.path))?;
        if doc.version > STORE_VERSION {
            return Err(eyre!(
                "State file {} has unsupported version {}",
                self.path,
                doc.version
            ));
        }
        Ok(doc)
    }

    fn write_document(&self, doc: &StoreDocument) -> Result<()> {
        let (parent, name) = self.split()?;
        Dir::create_ambient_dir_all(parent, cap_std::ambient_authority())
            .with_context(|| format!("Creating {parent}"))?;
        let dir = Dir::open_ambient_dir(parent, cap_std::ambient_authority())
            .with_context(|| format!("Opening {parent}"))?;
        let mut buf = serde_json::to_vec_pretty(doc)?;
        buf.push(b'\n');
        dir.atomic_write(name, buf)
            .with_context(|| format!("Writing {}", self.path))?;
        Ok(())
    }

    /// Replace the entry for `profile`.
    pub fn save(&self, profile: &str, run: &TestRun) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| eyre!("State store lock poisoned"))?;
        let mut doc = self.read_document()?;
        doc.version = STORE_VERSION;
        doc.runs.insert(profile.to_owned(), run.clone());
        self.write_document(&doc)?;
        debug!("Saved {profile} ({}) to {}", run.outcome, self.path);
        Ok(())
    }

    pub fn load(&self, profile: &str) -> Result<Option<TestRun>> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| eyre!("State store lock poisoned"))?;
        Ok(self.read_document()?.runs.remove(profile))
    }

    pub fn load_all(&self) -> Result<BTreeMap<String, TestRun>> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| eyre!("State store lock poisoned"))?;
        Ok(self.read_document()?.runs)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::phase::RunOutcome;

    fn temp_store() -> (tempfile::TempDir, RunStateStore) {
        let td = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(td.path().join("state/state.json")).unwrap();
        (td, RunStateStore::new(path))
    }

    #[test]
    fn test_missing_file_is_empty() {
        let (_td, store) = temp_store();
        assert!(store.load_all().unwrap().is_empty());
        assert!(store.load("vm").unwrap().is_none());
    }

    #[test]
    fn test_save_overwrites_per_profile() {
        let (_td, store) = temp_store();
        store.save("vm", &TestRun::new("vm", "r1")).unwrap();
        store
            .save("server", &TestRun::skipped("server", "r1"))
            .unwrap();
        store.save("vm", &TestRun::new("vm", "r2")).unwrap();

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["vm"].run_id, "r2");
        assert_eq!(all["server"].outcome, RunOutcome::Skipped);
        // Human-inspectable
        let text = std::fs::read_to_string(store.path()).unwrap();
        assert!(text.contains("\"version\": 1"));
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let (_td, store) = temp_store();
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), "{not json").unwrap();
        assert!(store.load_all().is_err());
        // A failed read must not clobber the file
        assert!(store.save("vm", &TestRun::new("vm", "r1")).is_err());
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), "{not json");
    }

    #[test]
    fn test_concurrent_saves_keep_every_profile() {
        let (_td, store) = temp_store();
        let store = Arc::new(store);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let name = format!("p{i}");
                    store.save(&name, &TestRun::new(&name, "r")).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.load_all().unwrap().len(), 8);
    }
}
