//! History Persistence
//!
//! Pluggable storage for workflow histories, enabling recovery after a
//! crash or restart.
//!
//! - [`MemoryHistoryStore`]: in-process, lost on exit
//! - [`FileHistoryStore`]: one pretty-printed JSON file per run under a
//!   state directory, rewritten atomically after each append

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::history::HistoryEntry;
use super::model::RunId;
use crate::error::EngineError;

const HISTORY_SUFFIX: &str = ".history.json";

/// Append-only storage of run histories.
pub trait HistoryStore: Send {
    /// Appends entries to a run's history. Event ids must continue the
    /// stored sequence.
    fn append(&mut self, run_id: &RunId, entries: &[HistoryEntry]) -> Result<(), EngineError>;

    /// Reads a run's full history; empty if the run is unknown.
    fn read(&self, run_id: &RunId) -> Result<Vec<HistoryEntry>, EngineError>;

    /// Lists every stored run.
    fn runs(&self) -> Result<Vec<RunId>, EngineError>;
}

fn check_continuity(
    run_id: &RunId,
    stored: usize,
    entries: &[HistoryEntry],
) -> Result<(), EngineError> {
    for (offset, entry) in entries.iter().enumerate() {
        let expected = (stored + offset) as u64 + 1;
        if entry.event_id != expected {
            return Err(EngineError::CorruptHistory {
                run_id: run_id.to_string(),
                message: format!(
                    "append out of order: expected event id {}, got {}",
                    expected, entry.event_id
                ),
            });
        }
    }
    Ok(())
}

/// Keeps histories in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryHistoryStore {
    histories: BTreeMap<RunId, Vec<HistoryEntry>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn append(&mut self, run_id: &RunId, entries: &[HistoryEntry]) -> Result<(), EngineError> {
        let history = self.histories.entry(run_id.clone()).or_default();
        check_continuity(run_id, history.len(), entries)?;
        history.extend_from_slice(entries);
        Ok(())
    }

    fn read(&self, run_id: &RunId) -> Result<Vec<HistoryEntry>, EngineError> {
        Ok(self.histories.get(run_id).cloned().unwrap_or_default())
    }

    fn runs(&self) -> Result<Vec<RunId>, EngineError> {
        Ok(self.histories.keys().cloned().collect())
    }
}

/// On-disk form of one run.
#[derive(Serialize, Deserialize, Debug, Clone)]
struct HistoryFile {
    run_id: RunId,
    events: Vec<HistoryEntry>,
}

/// Stores each run's history as JSON under a state directory.
///
/// Files are named `{run_id}.history.json`, with characters unsafe in file
/// names replaced by `_`. The run id itself is kept inside the file.
#[derive(Debug)]
pub struct FileHistoryStore {
    dir: PathBuf,
    cache: BTreeMap<RunId, Vec<HistoryEntry>>,
}

impl FileHistoryStore {
    /// Opens a store, creating the directory and loading existing histories.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut cache = BTreeMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let is_history = path
                .file_name()
                .and_then(|name| name.to_str())
                .map_or(false, |name| name.ends_with(HISTORY_SUFFIX));
            if !is_history {
                continue;
            }

            let content = fs::read_to_string(&path)?;
            let file: HistoryFile = serde_json::from_str(&content).map_err(|e| {
                EngineError::CorruptHistory {
                    run_id: path.display().to_string(),
                    message: e.to_string(),
                }
            })?;
            debug!(
                "Loaded {} events for run '{}' from {}",
                file.events.len(),
                file.run_id,
                path.display()
            );
            cache.insert(file.run_id, file.events);
        }

        info!(
            "Opened history store at {} ({} runs)",
            dir.display(),
            cache.len()
        );
        Ok(Self { dir, cache })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// One file per run. Bytes outside `[A-Za-z0-9.-]` are written as `_`
    /// plus two hex digits, so distinct run ids never share a file.
    fn path_for(&self, run_id: &RunId) -> PathBuf {
        let mut stem = String::with_capacity(run_id.as_str().len());
        for byte in run_id.as_str().bytes() {
            if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.') {
                stem.push(char::from(byte));
            } else {
                stem.push('_');
                stem.push_str(&hex::encode([byte]));
            }
        }
        self.dir.join(format!("{}{}", stem, HISTORY_SUFFIX))
    }

    fn write(&self, run_id: &RunId, events: &[HistoryEntry]) -> Result<(), EngineError> {
        let path = self.path_for(run_id);
        let tmp = path.with_extension("tmp");
        let file = HistoryFile {
            run_id: run_id.clone(),
            events: events.to_vec(),
        };

        fs::write(&tmp, serde_json::to_string_pretty(&file)?)?;
        fs::rename(&tmp, &path)?;
        debug!("Saved {} events to {}", events.len(), path.display());
        Ok(())
    }
}

impl HistoryStore for FileHistoryStore {
    fn append(&mut self, run_id: &RunId, entries: &[HistoryEntry]) -> Result<(), EngineError> {
        let stored = self.cache.get(run_id).map_or(0, Vec::len);
        check_continuity(run_id, stored, entries)?;

        let mut events = self.cache.get(run_id).cloned().unwrap_or_default();
        events.extend_from_slice(entries);

        if let Err(e) = self.write(run_id, &events) {
            warn!("Failed to persist history for run '{}': {}", run_id, e);
            return Err(e);
        }
        self.cache.insert(run_id.clone(), events);
        Ok(())
    }

    fn read(&self, run_id: &RunId) -> Result<Vec<HistoryEntry>, EngineError> {
        Ok(self.cache.get(run_id).cloned().unwrap_or_default())
    }

    fn runs(&self) -> Result<Vec<RunId>, EngineError> {
        Ok(self.cache.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::history::{HistoryEvent, WorkflowHistory};
    use chrono::Utc;
    use tempfile::tempdir;

    fn entries(from: u64, count: u64) -> Vec<HistoryEntry> {
        (from..from + count)
            .map(|id| HistoryEntry {
                event_id: id,
                timestamp: Utc::now(),
                event: HistoryEvent::TimerFired { seq: id },
            })
            .collect()
    }

    #[test]
    fn test_memory_store_append_and_read() {
        let mut store = MemoryHistoryStore::new();
        let run = RunId::new("r1");
        store.append(&run, &entries(1, 2)).unwrap();
        store.append(&run, &entries(3, 1)).unwrap();

        assert_eq!(store.read(&run).unwrap().len(), 3);
        assert_eq!(store.runs().unwrap(), vec![run]);
        assert!(store.read(&RunId::new("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_out_of_order_append_rejected() {
        let mut store = MemoryHistoryStore::new();
        let run = RunId::new("r1");
        store.append(&run, &entries(1, 2)).unwrap();

        let result = store.append(&run, &entries(5, 1));
        assert!(matches!(result, Err(EngineError::CorruptHistory { .. })));
        assert_eq!(store.read(&run).unwrap().len(), 2);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let temp_dir = tempdir().unwrap();
        let run = RunId::new("wf/with:odd chars.1");

        {
            let mut store = FileHistoryStore::open(temp_dir.path()).unwrap();
            store.append(&run, &entries(1, 2)).unwrap();
            store.append(&run, &entries(3, 2)).unwrap();
        }

        let store = FileHistoryStore::open(temp_dir.path()).unwrap();
        assert_eq!(store.runs().unwrap(), vec![run.clone()]);

        let events = store.read(&run).unwrap();
        assert_eq!(events.len(), 4);
        assert!(WorkflowHistory::from_entries(events).is_ok());
    }

    #[test]
    fn test_similar_run_ids_get_separate_files() {
        let temp_dir = tempdir().unwrap();
        let slashed = RunId::new("a/b.1");
        let underscored = RunId::new("a_b.1");

        {
            let mut store = FileHistoryStore::open(temp_dir.path()).unwrap();
            assert_ne!(store.path_for(&slashed), store.path_for(&underscored));
            store.append(&slashed, &entries(1, 2)).unwrap();
            store.append(&underscored, &entries(1, 1)).unwrap();
        }

        let store = FileHistoryStore::open(temp_dir.path()).unwrap();
        assert_eq!(store.runs().unwrap().len(), 2);
        assert_eq!(store.read(&slashed).unwrap().len(), 2);
        assert_eq!(store.read(&underscored).unwrap().len(), 1);
    }

    #[test]
    fn test_file_store_writes_json_per_run() {
        let temp_dir = tempdir().unwrap();
        let mut store = FileHistoryStore::open(temp_dir.path().join("state")).unwrap();
        store.append(&RunId::new("a.1"), &entries(1, 1)).unwrap();
        store.append(&RunId::new("b.1"), &entries(1, 1)).unwrap();

        let files: Vec<String> = fs::read_dir(store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.ends_with(HISTORY_SUFFIX)));
    }

    #[test]
    fn test_file_store_ignores_other_files() {
        let temp_dir = tempdir().unwrap();
        fs::write(temp_dir.path().join("notes.txt"), "hello").unwrap();
        let store = FileHistoryStore::open(temp_dir.path()).unwrap();
        assert!(store.runs().unwrap().is_empty());
    }

    #[test]
    fn test_file_store_rejects_corrupt_file() {
        let temp_dir = tempdir().unwrap();
        fs::write(temp_dir.path().join("x.history.json"), "{not json").unwrap();
        let result = FileHistoryStore::open(temp_dir.path());
        assert!(matches!(result, Err(EngineError::CorruptHistory { .. })));
    }
}
