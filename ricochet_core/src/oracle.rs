use crate::executor::{Outcome, ResponseStatus};
use crate::input::Input;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex, MutexGuard};
use tracing::debug;

/// Bytes per row in the hex dump of a crash report.
const HEX_DUMP_ROW: usize = 16;

/// Category of a crash-worthy outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrashClass {
    /// The target answered with a status of 500 or above.
    ServerError,
    /// The target did not answer within the per-request timeout.
    Timeout,
    /// The request never completed at the transport level.
    ConnectionError,
}

impl CrashClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrashClass::ServerError => "server-error",
            CrashClass::Timeout => "timeout",
            CrashClass::ConnectionError => "connection-error",
        }
    }
}

impl fmt::Display for CrashClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns the crash class of `outcome`, or `None` when it is not
/// crash-worthy.
pub fn classify(outcome: &Outcome) -> Option<CrashClass> {
    match outcome.status {
        ResponseStatus::Http(code) if code >= 500 => Some(CrashClass::ServerError),
        ResponseStatus::Http(_) => None,
        ResponseStatus::Timeout => Some(CrashClass::Timeout),
        ResponseStatus::ConnectionError => Some(CrashClass::ConnectionError),
    }
}

struct Normalizer {
    pattern: Regex,
    replacement: &'static str,
}

static NORMALIZERS: LazyLock<Vec<Normalizer>> = LazyLock::new(|| {
    [
        (
            r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?",
            "<TIMESTAMP>",
        ),
        (
            r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b",
            "<UUID>",
        ),
        (
            r#"(?i)\b((?:x-)?(?:request|req|trace|correlation)[-_ ]?id["']?\s*[:=]\s*["']?)[A-Za-z0-9._-]+"#,
            "${1}<ID>",
        ),
        (r"(?i)\b0x[0-9a-f]+\b", "<ADDR>"),
        (r"\b\d{1,2}:\d{2}:\d{2}(?:\.\d+)?\b", "<TIME>"),
        (r"\b\d{10,13}\b", "<EPOCH>"),
    ]
    .into_iter()
    .map(|(pattern, replacement)| Normalizer {
        pattern: Regex::new(pattern).expect("normalizer patterns are valid"),
        replacement,
    })
    .collect()
});

/// Replaces volatile substrings (timestamps, clock times, UUIDs, request ids,
/// hex addresses, epoch numbers) with fixed placeholders.
///
/// This is a heuristic. Volatile text it does not recognize still splits one
/// root cause into several records.
pub fn normalize_error_text(text: &str) -> String {
    NORMALIZERS
        .iter()
        .fold(text.trim().to_string(), |acc, normalizer| {
            normalizer
                .pattern
                .replace_all(&acc, normalizer.replacement)
                .into_owned()
        })
}

/// MD5 hex digest over `class:normalized_text`.
pub fn dedup_key(class: CrashClass, error_text: Option<&str>) -> String {
    let normalized = error_text.map(normalize_error_text).unwrap_or_default();
    let digest = md5::compute(format!("{}:{}", class.as_str(), normalized));
    format!("{:x}", digest)
}

/// One unique crash finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashRecord {
    pub dedup_key: String,
    pub class: CrashClass,
    /// The first input that produced this crash.
    pub input: Input,
    pub outcome: Outcome,
    pub first_seen_iteration: u64,
    pub last_seen_iteration: u64,
    pub occurrences: u64,
}

impl CrashRecord {
    pub fn input_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("crash_{}.bin", self.dedup_key))
    }

    pub fn report_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("crash_{}.txt", self.dedup_key))
    }

    /// Writes the raw payload and a text report into `dir`.
    pub fn write_to_dir(&self, dir: &Path) -> std::io::Result<()> {
        fs::create_dir_all(dir)?;
        fs::write(self.input_path(dir), self.input.as_bytes())?;
        fs::write(self.report_path(dir), self.report())
    }

    pub fn report(&self) -> String {
        let status = match self.outcome.status {
            ResponseStatus::Http(code) => code.to_string(),
            ResponseStatus::Timeout => "timeout".to_string(),
            ResponseStatus::ConnectionError => "connection error".to_string(),
        };
        let mut report = format!(
            "Crash Class: {}\nDedup Key: {}\nStatus: {}\nResponse Size: {}\nElapsed: {:?}\n\
             First Seen Iteration: {}\nLast Seen Iteration: {}\nOccurrences: {}\n",
            self.class,
            self.dedup_key,
            status,
            self.outcome.response_size,
            self.outcome.elapsed,
            self.first_seen_iteration,
            self.last_seen_iteration,
            self.occurrences,
        );
        report.push_str("\n--- Error ---\n");
        report.push_str(self.outcome.error_text.as_deref().unwrap_or("(none)"));
        report.push_str("\n\n--- Input (hex) ---\n");
        for (row, chunk) in self.input.as_bytes().chunks(HEX_DUMP_ROW).enumerate() {
            report.push_str(&format!("{:08x}  {}\n", row * HEX_DUMP_ROW, hex::encode(chunk)));
        }
        report
    }
}

#[derive(Default)]
struct CrashState {
    records: Vec<CrashRecord>,
    by_key: HashMap<String, usize>,
    total: u64,
}

/// Deduplicating store of crash records for one run.
///
/// Lookup and insert happen under one lock, so concurrent workers hitting
/// the same key produce one record.
#[derive(Default)]
pub struct CrashMonitor {
    state: Mutex<CrashState>,
}

impl CrashMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CrashState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records one crash occurrence. Returns whether the key was new, along
    /// with the current state of its record.
    pub fn record(
        &self,
        input: &Input,
        outcome: &Outcome,
        class: CrashClass,
        iteration: u64,
    ) -> (bool, CrashRecord) {
        let key = dedup_key(class, outcome.error_text.as_deref());
        let mut state = self.lock();
        state.total += 1;

        if let Some(&index) = state.by_key.get(&key) {
            let record = &mut state.records[index];
            record.occurrences += 1;
            record.last_seen_iteration = record.last_seen_iteration.max(iteration);
            return (false, record.clone());
        }

        let record = CrashRecord {
            dedup_key: key.clone(),
            class,
            input: input.clone(),
            outcome: outcome.clone(),
            first_seen_iteration: iteration,
            last_seen_iteration: iteration,
            occurrences: 1,
        };
        debug!(%class, key = %key, iteration, "new unique crash");
        let index = state.records.len();
        state.records.push(record.clone());
        state.by_key.insert(key, index);
        (true, record)
    }

    /// All unique records in discovery order.
    pub fn records(&self) -> Vec<CrashRecord> {
        self.lock().records.clone()
    }

    pub fn unique_count(&self) -> usize {
        self.lock().records.len()
    }

    /// Every recorded occurrence, duplicates included.
    pub fn total_count(&self) -> u64 {
        self.lock().total
    }
}
