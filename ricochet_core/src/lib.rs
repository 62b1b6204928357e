pub mod config;
pub mod corpus;
pub mod event;
pub mod executor;
pub mod feedback;
pub mod fuzzer;
pub mod input;
pub mod mutator;
pub mod oracle;
pub mod scheduler;

pub use config::RicochetConfig;
pub use corpus::{CorpusEntry, CorpusError, CorpusStore, load_seed_files};
pub use event::{EventSender, FuzzEvent, ProgressRecord};
pub use executor::{Executor, HttpExecutor, InProcessExecutor, Outcome, ResponseStatus};
pub use feedback::{Signature, is_novel, signature_of};
pub use fuzzer::{CancelToken, FuzzError, Fuzzer, RunSummary, StopReason};
pub use input::Input;
pub use mutator::{HavocMutator, Mutator, Strategy};
pub use oracle::{CrashClass, CrashMonitor, CrashRecord, classify};
pub use scheduler::{RandomScheduler, Scheduler, SchedulerError, WeightedScheduler};
