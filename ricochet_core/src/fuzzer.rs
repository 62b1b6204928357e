//! The fuzz loop: select, mutate, execute, classify, update.
//!
//! A [`Fuzzer`] owns one run. [`Fuzzer::init`] validates the seeds and
//! optionally calibrates them against the target; [`Fuzzer::run`] then drives
//! `threads` identical worker loops that meet only at the [`CorpusStore`] and
//! the [`CrashMonitor`].

use crate::config::FuzzerSettings;
use crate::corpus::{CorpusError, CorpusStore};
use crate::event::{EventSender, FuzzEvent, ProgressRecord};
use crate::executor::{Executor, Outcome, ResponseStatus};
use crate::feedback::signature_of;
use crate::input::Input;
use crate::mutator::Mutator;
use crate::oracle::{CrashMonitor, classify};
use crate::scheduler::scheduler_for;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Errors that abort a run before its first iteration.
#[derive(Error, Debug)]
pub enum FuzzError {
    #[error("No seed inputs were provided; at least one is required")]
    EmptyCorpus,
    #[error("Target unreachable: every seed failed at the transport level (last error: {0})")]
    TargetUnreachable(String),
    #[error("Invalid fuzzer settings: {0}")]
    InvalidSettings(String),
}

/// Shared flag that stops a run. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    IterationBudget,
    TimeBudget,
    Cancelled,
}

/// What a finished run reports, even when many iterations failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub iterations: u64,
    pub corpus_size: usize,
    pub unique_crashes: usize,
    /// Crash occurrences including duplicates and calibration.
    pub total_crashes: u64,
    pub elapsed: Duration,
    pub stop_reason: StopReason,
    pub dropped_events: u64,
}

/// Counters shared by the workers of one `run` call.
struct RunState<'a> {
    start: Instant,
    claimed: AtomicU64,
    completed: AtomicU64,
    stop_reason: OnceLock<StopReason>,
    cancel: &'a CancelToken,
}

impl RunState<'_> {
    fn stop(&self, reason: StopReason) -> StopReason {
        *self.stop_reason.get_or_init(|| reason)
    }
}

pub struct Fuzzer<E, M> {
    settings: FuzzerSettings,
    executor: E,
    mutator: M,
    corpus: CorpusStore,
    crashes: CrashMonitor,
    events: EventSender,
}

impl<E, M> Fuzzer<E, M>
where
    E: Executor,
    M: Mutator<ChaCha8Rng>,
{
    /// Prepares a run without an event listener.
    pub fn init(
        settings: FuzzerSettings,
        executor: E,
        mutator: M,
        seeds: Vec<Input>,
    ) -> Result<Self, FuzzError> {
        Self::init_with_events(settings, executor, mutator, seeds, EventSender::disabled())
    }

    /// Prepares a run that reports to `events`. Crashes found while
    /// calibrating seeds are reported as well.
    pub fn init_with_events(
        settings: FuzzerSettings,
        executor: E,
        mutator: M,
        seeds: Vec<Input>,
        events: EventSender,
    ) -> Result<Self, FuzzError> {
        if settings.threads == 0 {
            return Err(FuzzError::InvalidSettings(
                "threads must be at least 1".to_string(),
            ));
        }

        let corpus = CorpusStore::new(
            scheduler_for(&settings.scheduler),
            settings.corpus_warn_threshold,
        );
        corpus.seed(seeds).map_err(|e| match e {
            CorpusError::Empty => FuzzError::EmptyCorpus,
            other => FuzzError::InvalidSettings(other.to_string()),
        })?;

        let fuzzer = Self {
            settings,
            executor,
            mutator,
            corpus,
            crashes: CrashMonitor::new(),
            events,
        };
        if fuzzer.settings.calibrate_seeds || fuzzer.settings.require_reachable_target {
            fuzzer.calibrate()?;
        }
        Ok(fuzzer)
    }

    /// Executes every seed once. Their signatures become "seen" so that
    /// mutants behaving like a seed are not retained, and crashing seeds are
    /// recorded at iteration 0.
    fn calibrate(&self) -> Result<(), FuzzError> {
        let timeout = self.settings.request_timeout();
        let seeds = self.corpus.snapshot();
        let outcomes: Vec<Outcome> = seeds
            .iter()
            .map(|entry| self.executor.execute(&entry.input, timeout))
            .collect();

        if self.settings.require_reachable_target
            && outcomes
                .iter()
                .all(|o| o.status == ResponseStatus::ConnectionError)
        {
            let last_error = outcomes
                .iter()
                .rev()
                .find_map(|o| o.error_text.clone())
                .unwrap_or_default();
            return Err(FuzzError::TargetUnreachable(last_error));
        }
        if !self.settings.calibrate_seeds {
            return Ok(());
        }

        for (id, (entry, outcome)) in seeds.iter().zip(&outcomes).enumerate() {
            let signature = signature_of(outcome);
            self.corpus.record_seed_signature(id, signature);
            debug!(seed = id, %signature, "calibrated seed");
            if let Some(class) = classify(outcome) {
                let (is_new, record) = self.crashes.record(&entry.input, outcome, class, 0);
                if is_new {
                    warn!(seed = id, %class, "seed input already crashes the target");
                    self.events.emit(FuzzEvent::NewCrash(record));
                }
            }
        }
        info!(
            seeds = seeds.len(),
            signatures = self.corpus.seen_signatures(),
            "seed calibration complete"
        );
        Ok(())
    }

    pub fn corpus(&self) -> &CorpusStore {
        &self.corpus
    }

    pub fn crashes(&self) -> &CrashMonitor {
        &self.crashes
    }

    pub fn settings(&self) -> &FuzzerSettings {
        &self.settings
    }

    /// Runs until a budget is exhausted or `cancel` is set.
    ///
    /// Stop conditions are checked at the top of each iteration only: an
    /// iteration in flight always finishes, and with `max_iterations = K`
    /// exactly K iterations run across all workers.
    pub fn run(&self, cancel: &CancelToken) -> RunSummary {
        let threads = self.settings.threads.max(1);
        if self.settings.is_unbounded() {
            warn!("no iteration or time budget set; the run stops only when cancelled");
        }
        info!(
            threads,
            max_iterations = ?self.settings.max_iterations,
            time_budget = ?self.settings.time_budget(),
            corpus_size = self.corpus.len(),
            "starting fuzz loop"
        );

        let state = RunState {
            start: Instant::now(),
            claimed: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            stop_reason: OnceLock::new(),
            cancel,
        };

        thread::scope(|scope| {
            let handles: Vec<_> = (0..threads)
                .map(|worker| {
                    let state = &state;
                    scope.spawn(move || self.worker_loop(worker, state))
                })
                .collect();
            for handle in handles {
                if handle.join().is_err() {
                    error!("fuzz worker panicked");
                    state.stop(StopReason::Cancelled);
                }
            }
        });

        let summary = RunSummary {
            iterations: state.completed.load(Ordering::SeqCst),
            corpus_size: self.corpus.len(),
            unique_crashes: self.crashes.unique_count(),
            total_crashes: self.crashes.total_count(),
            elapsed: state.start.elapsed(),
            stop_reason: state.stop_reason.get().copied().unwrap_or(StopReason::Cancelled),
            dropped_events: self.events.dropped(),
        };
        info!(
            iterations = summary.iterations,
            corpus_size = summary.corpus_size,
            unique_crashes = summary.unique_crashes,
            stop_reason = ?summary.stop_reason,
            "fuzz loop finished"
        );
        summary
    }

    fn worker_loop(&self, worker: usize, state: &RunState<'_>) -> StopReason {
        let mut rng = ChaCha8Rng::seed_from_u64(self.settings.rng_seed.wrapping_add(worker as u64));
        let time_budget = self.settings.time_budget();
        loop {
            if state.cancel.is_cancelled() {
                return state.stop(StopReason::Cancelled);
            }
            if time_budget.is_some_and(|budget| state.start.elapsed() >= budget) {
                return state.stop(StopReason::TimeBudget);
            }
            let iteration = state.claimed.fetch_add(1, Ordering::SeqCst) + 1;
            if self
                .settings
                .max_iterations
                .is_some_and(|max| iteration > max)
            {
                return state.stop(StopReason::IterationBudget);
            }

            self.fuzz_one(iteration, &mut rng);

            let completed = state.completed.fetch_add(1, Ordering::SeqCst) + 1;
            self.events.emit(FuzzEvent::Progress(ProgressRecord {
                iteration: completed,
                corpus_size: self.corpus.len(),
                unique_crashes: self.crashes.unique_count(),
                elapsed: state.start.elapsed(),
            }));
        }
    }

    fn fuzz_one(&self, iteration: u64, rng: &mut ChaCha8Rng) {
        // Select
        let (base_id, base) = match self.corpus.select(rng) {
            Ok(selected) => selected,
            Err(e) => {
                error!(iteration, error = %e, "corpus selection failed");
                return;
            }
        };
        let partner = self.corpus.splice_partner(base_id, rng);

        // Mutate
        let mut candidate = self.mutator.mutate(&base, None, partner.as_ref(), rng);
        if candidate.len() > self.settings.max_payload_size {
            trace!(
                len = candidate.len(),
                max = self.settings.max_payload_size,
                "truncating candidate to the configured payload cap"
            );
            candidate = Input::from(&candidate.as_bytes()[..self.settings.max_payload_size]);
        }

        // Execute
        let outcome = self
            .executor
            .execute(&candidate, self.settings.request_timeout());

        // Classify
        let signature = signature_of(&outcome);
        let crash_class = classify(&outcome);

        // Update
        if self
            .corpus
            .consider_retain(candidate.clone(), signature, iteration)
        {
            self.events.emit(FuzzEvent::NewEntry {
                iteration,
                signature,
                corpus_size: self.corpus.len(),
            });
        }
        if let Some(class) = crash_class {
            let (is_new, record) = self.crashes.record(&candidate, &outcome, class, iteration);
            if is_new {
                info!(iteration, %class, key = %record.dedup_key, "found new unique crash");
                self.events.emit(FuzzEvent::NewCrash(record));
            }
        }
    }
}
