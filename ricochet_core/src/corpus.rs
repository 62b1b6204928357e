use crate::feedback::{Signature, is_novel};
use crate::input::Input;
use crate::scheduler::{Scheduler, SchedulerError};
use rand_core::RngCore;
use serde::Serialize;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, warn};

/// Defines errors that can arise during corpus operations.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// A run cannot start without at least one seed to mutate.
    #[error("Corpus is empty: at least one seed input is required")]
    Empty,

    /// An I/O error occurred while writing the corpus to disk.
    #[error("Corpus I/O error: {0}")]
    Io(String),

    /// The corpus index could not be serialized.
    #[error("Corpus serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for CorpusError {
    fn from(err: std::io::Error) -> Self {
        CorpusError::Io(err.to_string())
    }
}
impl From<serde_json::Error> for CorpusError {
    fn from(err: serde_json::Error) -> Self {
        CorpusError::Serialization(format!("JSON operation error: {}", err))
    }
}
impl From<SchedulerError> for CorpusError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::CorpusEmpty => CorpusError::Empty,
        }
    }
}

/// A retained input and the bookkeeping that goes with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusEntry {
    pub input: Input,
    /// The behavior that justified keeping this input. `None` for a seed
    /// that was never executed.
    pub signature: Option<Signature>,
    pub discovered_at_iteration: u64,
    pub times_selected: u64,
}

/// Per-entry metadata written to the corpus index.
#[derive(Serialize, Debug, Clone)]
pub struct PersistedEntryMetadata {
    pub file_name: String,
    pub len: usize,
    pub signature: Option<String>,
    pub discovered_at_iteration: u64,
    pub times_selected: u64,
}

#[derive(Debug, Default)]
struct CorpusState {
    entries: Vec<CorpusEntry>,
    seen: HashSet<Signature>,
    next_growth_warning: usize,
}

/// The ordered collection of retained inputs, shared by all workers.
///
/// Every operation runs under one lock, so the novelty check and the insert
/// in [`CorpusStore::consider_retain`] happen as a single step: two workers
/// that discover the same signature at once retain it exactly once.
///
/// The store grows without bound. `corpus_warn_threshold` only controls how
/// often that growth is logged; eviction is left to the caller.
pub struct CorpusStore {
    state: Mutex<CorpusState>,
    scheduler: Box<dyn Scheduler>,
    warn_threshold: usize,
}

impl CorpusStore {
    /// Default filename for the corpus index JSON file.
    const INDEX_FILENAME: &'static str = "corpus_index.json";
    /// File extension for raw entry payloads.
    const INPUT_FILE_EXTENSION: &'static str = "input";

    pub fn new(scheduler: Box<dyn Scheduler>, warn_threshold: usize) -> Self {
        Self {
            state: Mutex::new(CorpusState {
                next_growth_warning: warn_threshold,
                ..CorpusState::default()
            }),
            scheduler,
            warn_threshold,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CorpusState> {
        // Critical sections never panic midway, so a poisoned state is intact.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Loads the initial seeds; fails with [`CorpusError::Empty`] when there
    /// are none.
    pub fn seed(&self, inputs: Vec<Input>) -> Result<usize, CorpusError> {
        if inputs.is_empty() {
            return Err(CorpusError::Empty);
        }
        let mut state = self.lock();
        let count = inputs.len();
        state
            .entries
            .extend(inputs.into_iter().map(|input| CorpusEntry {
                input,
                signature: None,
                discovered_at_iteration: 0,
                times_selected: 0,
            }));
        Ok(count)
    }

    /// Picks the next entry to mutate and counts the selection.
    pub fn select(&self, rng: &mut dyn RngCore) -> Result<(usize, Input), CorpusError> {
        let mut state = self.lock();
        let id = self.scheduler.next(&state.entries, rng)?;
        let entry = &mut state.entries[id];
        entry.times_selected += 1;
        Ok((id, entry.input.clone()))
    }

    /// Returns a random entry other than `exclude`, for splicing.
    pub fn splice_partner(&self, exclude: usize, rng: &mut dyn RngCore) -> Option<Input> {
        let state = self.lock();
        let len = state.entries.len();
        if len < 2 {
            return None;
        }
        let mut id = rng.next_u64() as usize % (len - 1);
        if id >= exclude {
            id += 1;
        }
        state.entries.get(id).map(|entry| entry.input.clone())
    }

    /// Retains `input` iff `signature` has not been seen in this run.
    pub fn consider_retain(&self, input: Input, signature: Signature, iteration: u64) -> bool {
        let mut state = self.lock();
        if !is_novel(&signature, &state.seen) {
            return false;
        }
        state.seen.insert(signature);
        state.entries.push(CorpusEntry {
            input,
            signature: Some(signature),
            discovered_at_iteration: iteration,
            times_selected: 0,
        });
        let len = state.entries.len();
        debug!(%signature, iteration, corpus_size = len, "retained new corpus entry");

        if self.warn_threshold > 0 && len >= state.next_growth_warning {
            warn!(
                corpus_size = len,
                "corpus keeps growing without eviction; consider snapshotting or bounding the run"
            );
            state.next_growth_warning = len + self.warn_threshold;
        }
        true
    }

    /// Attaches the observed signature to seed `id` and marks it as seen.
    /// Returns whether the signature was new.
    pub fn record_seed_signature(&self, id: usize, signature: Signature) -> bool {
        let mut state = self.lock();
        if let Some(entry) = state.entries.get_mut(id) {
            entry.signature = Some(signature);
        }
        state.seen.insert(signature)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of distinct signatures observed so far.
    pub fn seen_signatures(&self) -> usize {
        self.lock().seen.len()
    }

    /// Copies out every entry, in insertion order.
    pub fn snapshot(&self) -> Vec<CorpusEntry> {
        self.lock().entries.clone()
    }

    /// Writes every entry as a raw file plus a JSON index into `dir`.
    ///
    /// Returns the number of entries written.
    pub fn persist(&self, dir: &Path) -> Result<usize, CorpusError> {
        fs::create_dir_all(dir).map_err(|e| {
            CorpusError::Io(format!(
                "Failed to create corpus directory at {:?}: {}",
                dir, e
            ))
        })?;

        let entries = self.snapshot();
        let mut index = Vec::with_capacity(entries.len());
        for (id, entry) in entries.iter().enumerate() {
            let file_name = format!("entry_{id:08}.{}", Self::INPUT_FILE_EXTENSION);
            let path = dir.join(&file_name);
            fs::write(&path, entry.input.as_bytes()).map_err(|e| {
                CorpusError::Io(format!("Failed to write corpus entry {:?}: {}", path, e))
            })?;
            index.push(PersistedEntryMetadata {
                file_name,
                len: entry.input.len(),
                signature: entry.signature.map(|s| s.to_string()),
                discovered_at_iteration: entry.discovered_at_iteration,
                times_selected: entry.times_selected,
            });
        }

        let index_path = dir.join(Self::INDEX_FILENAME);
        let file = File::create(&index_path).map_err(|e| {
            CorpusError::Io(format!(
                "Failed to create or truncate index file {:?}: {}",
                index_path, e
            ))
        })?;
        serde_json::to_writer_pretty(BufWriter::new(file), &index)?;
        Ok(entries.len())
    }
}

/// Reads seed payloads from files and from the files directly inside
/// directories (no recursion).
///
/// Unreadable paths are skipped with a warning; deciding whether an empty
/// result is fatal is left to [`CorpusStore::seed`].
pub fn load_seed_files(seed_paths: &[PathBuf]) -> Vec<Input> {
    let mut seeds = Vec::new();
    for path in seed_paths {
        if path.is_file() {
            read_seed(path, &mut seeds);
        } else if path.is_dir() {
            let dir_entries = match fs::read_dir(path) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(?path, error = %e, "failed to read seed directory, skipping");
                    continue;
                }
            };
            let mut files: Vec<PathBuf> = dir_entries
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file())
                .collect();
            files.sort();
            for file in &files {
                read_seed(file, &mut seeds);
            }
        } else {
            warn!(?path, "seed path does not exist, skipping");
        }
    }
    seeds
}

fn read_seed(path: &Path, seeds: &mut Vec<Input>) {
    match fs::read(path) {
        Ok(bytes) => {
            debug!(?path, len = bytes.len(), "loaded seed");
            seeds.push(Input::from(bytes));
        }
        Err(e) => warn!(?path, error = %e, "failed to read seed file, skipping"),
    }
}
