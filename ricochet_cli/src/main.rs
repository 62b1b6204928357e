use ricochet_core::config::RicochetConfig;
use ricochet_core::corpus::load_seed_files;
use ricochet_core::event::{EventSender, FuzzEvent, ProgressRecord};
use ricochet_core::executor::HttpExecutor;
use ricochet_core::fuzzer::{CancelToken, Fuzzer, RunSummary};
use ricochet_core::input::Input;
use ricochet_core::mutator::HavocMutator;
use ricochet_core::oracle::CrashRecord;

use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Iteration budget used when neither the config nor the flags bound the run.
const DEFAULT_ITERATIONS: u64 = 10_000;

/// Used when no seed path is configured.
const BUILTIN_SEEDS: [&[u8]; 5] = [
    b"{\"value\": 42}",
    b"{\"a\": {\"b\": {\"c\": 1}}}",
    b"{\"items\": [1, 2, 3, 4, 5]}",
    b"{\"name\": \"test\", \"data\": \"hello world\"}",
    b"{\"a\": 10, \"b\": 5, \"op\": \"add\"}",
];

#[derive(Parser, Debug)]
#[clap(author, version, about = "Feedback-guided black-box HTTP fuzzer", long_about = None)]
struct Cli {
    #[clap(long, value_parser)]
    config_file: Option<PathBuf>,
    /// Target URL to fuzz.
    #[clap(short, long)]
    target: Option<String>,
    /// HTTP method; GET sends the payload as the `data` query parameter.
    #[clap(short, long)]
    method: Option<String>,
    #[clap(short, long)]
    iterations: Option<u64>,
    #[clap(long)]
    time_budget_secs: Option<u64>,
    /// Per-request timeout.
    #[clap(long)]
    timeout_ms: Option<u64>,
    #[clap(long)]
    max_payload_size: Option<usize>,
    /// Seed file or directory; may be repeated.
    #[clap(short, long)]
    seeds: Vec<PathBuf>,
    /// Directory for crash payloads and reports.
    #[clap(short, long)]
    crashes: Option<PathBuf>,
    /// Write the final corpus to this directory.
    #[clap(long)]
    corpus_out: Option<PathBuf>,
    #[clap(long)]
    threads: Option<usize>,
    #[clap(long)]
    rng_seed: Option<u64>,
    #[clap(long)]
    no_dictionary: bool,
    /// Refresh the status line every N iterations.
    #[clap(long, default_value_t = 100)]
    print_interval: u64,
    /// Print the effective configuration and exit.
    #[clap(long)]
    dry_run: bool,
}

fn load_config(config_file: Option<&PathBuf>) -> Result<RicochetConfig, anyhow::Error> {
    match config_file {
        Some(config_path) => {
            info!(path = ?config_path, "loading configuration");
            RicochetConfig::load_from_file(config_path)
        }
        None => {
            let default_config_path = PathBuf::from("ricochet.toml");
            if default_config_path.exists() {
                info!(path = ?default_config_path, "no config file specified, loading default");
                RicochetConfig::load_from_file(&default_config_path)
            } else {
                info!("no config file found, using built-in defaults");
                Ok(RicochetConfig::default())
            }
        }
    }
}

fn apply_overrides(config: &mut RicochetConfig, cli: &Cli) {
    if let Some(target) = &cli.target {
        config.target.url = target.clone();
    }
    if let Some(method) = &cli.method {
        config.target.method = method.clone();
    }
    if let Some(iterations) = cli.iterations {
        config.fuzzer.max_iterations = Some(iterations);
    }
    if let Some(secs) = cli.time_budget_secs {
        config.fuzzer.time_budget_ms = Some(secs.saturating_mul(1000));
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.fuzzer.request_timeout_ms = timeout_ms;
    }
    if let Some(max_payload_size) = cli.max_payload_size {
        config.fuzzer.max_payload_size = max_payload_size;
    }
    if !cli.seeds.is_empty() {
        config.corpus.initial_seed_paths = Some(cli.seeds.clone());
    }
    if let Some(crashes) = &cli.crashes {
        config.corpus.crashes_dir = crashes.clone();
    }
    if let Some(corpus_out) = &cli.corpus_out {
        config.corpus.output_dir = Some(corpus_out.clone());
    }
    if let Some(threads) = cli.threads {
        config.fuzzer.threads = threads;
    }
    if let Some(rng_seed) = cli.rng_seed {
        config.fuzzer.rng_seed = rng_seed;
    }
    if cli.no_dictionary {
        config.fuzzer.use_dictionary = false;
    }
    // Unattended runs still end on their own; Ctrl-C only stops one early.
    if config.fuzzer.is_unbounded() {
        config.fuzzer.max_iterations = Some(DEFAULT_ITERATIONS);
    }
}

fn print_configuration(config: &RicochetConfig) {
    let fuzzer = &config.fuzzer;
    println!("[*] Target:      {} {}", config.target.method, config.target.url);
    match &config.corpus.initial_seed_paths {
        Some(paths) => println!("[*] Seeds:       {paths:?}"),
        None => println!("[*] Seeds:       {} built-in JSON seeds", BUILTIN_SEEDS.len()),
    }
    println!("[*] Crashes dir: {:?}", config.corpus.crashes_dir);
    if let Some(iterations) = fuzzer.max_iterations {
        println!("[*] Iterations:  {iterations}");
    }
    if let Some(budget) = fuzzer.time_budget() {
        println!("[*] Time budget: {budget:?}");
    }
    println!(
        "[*] Timeout:     {:?}, max payload {} bytes, {} thread(s), dictionary {}",
        fuzzer.request_timeout(),
        fuzzer.max_payload_size,
        fuzzer.threads,
        if fuzzer.use_dictionary { "on" } else { "off" }
    );
    println!();
}

/// Prints events as they arrive and persists new crashes.
struct Reporter<'a> {
    crashes_dir: &'a Path,
    print_interval: u64,
    max_iterations: Option<u64>,
}

impl Reporter<'_> {
    fn handle(&self, event: FuzzEvent) {
        match event {
            FuzzEvent::Progress(progress) => {
                if progress.iteration % self.print_interval.max(1) == 0 {
                    self.print_status(&progress);
                }
            }
            FuzzEvent::NewEntry {
                iteration,
                signature,
                corpus_size,
            } => {
                debug!(iteration, %signature, corpus_size, "new behavior");
            }
            FuzzEvent::NewCrash(record) => {
                println!("\n[CRASH] New crash found: {}", record.dedup_key);
                println!("        Class: {}", record.class);
                if let Some(text) = &record.outcome.error_text {
                    let excerpt: String = text.chars().take(80).collect();
                    println!("        Error: {}", excerpt.replace('\n', " "));
                }
                self.save(&record);
            }
        }
    }

    fn print_status(&self, progress: &ProgressRecord) {
        let secs = progress.elapsed.as_secs_f32();
        let exec_per_sec = if secs > 0.0 {
            progress.iteration as f32 / secs
        } else {
            0.0
        };
        let budget = self
            .max_iterations
            .map_or_else(|| "-".to_string(), |max| max.to_string());
        print!(
            "\rIter: {}/{}, Corpus: {}, Crashes: {}, Execs/sec: {:.2}   ",
            progress.iteration, budget, progress.corpus_size, progress.unique_crashes, exec_per_sec
        );
        let _ = std::io::stdout().flush();
    }

    fn save(&self, record: &CrashRecord) {
        if let Err(e) = record.write_to_dir(self.crashes_dir) {
            warn!(key = %record.dedup_key, dir = ?self.crashes_dir, error = %e, "failed to write crash record");
        }
    }
}

fn print_summary(summary: &RunSummary) {
    println!("\nFuzz loop finished in {:.2?} ({:?}).", summary.elapsed, summary.stop_reason);
    println!(
        "Iterations: {}, Corpus Size: {}, Unique Crashes: {}, Crash Occurrences: {}",
        summary.iterations, summary.corpus_size, summary.unique_crashes, summary.total_crashes
    );
    if summary.dropped_events > 0 {
        println!("Dropped progress events: {}", summary.dropped_events);
    }
}

/// Cancels the run on SIGINT or SIGTERM. In-flight iterations finish and the
/// summary, crash reports and corpus are still written.
fn cancel_on_signals(cancel: &CancelToken) -> Result<Handle, anyhow::Error> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let handle = signals.handle();
    let cancel = cancel.clone();
    thread::spawn(move || {
        for signal in signals.forever() {
            warn!(signal, "interrupted, stopping after in-flight iterations");
            cancel.cancel();
        }
    });
    Ok(handle)
}

fn main() -> Result<(), anyhow::Error> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config_file.as_ref())?;
    apply_overrides(&mut config, &cli);
    print_configuration(&config);

    if cli.dry_run {
        println!("[!] Dry run mode - not fuzzing");
        return Ok(());
    }

    let seeds: Vec<Input> = match &config.corpus.initial_seed_paths {
        Some(paths) => load_seed_files(paths),
        None => BUILTIN_SEEDS.iter().map(|s| Input::from(*s)).collect(),
    };

    let executor = HttpExecutor::new(&config.target)?;
    let mutator = HavocMutator::from_settings(&config.fuzzer);

    let (events, rx) = EventSender::channel(config.fuzzer.event_buffer);
    let fuzzer = Fuzzer::init_with_events(config.fuzzer.clone(), executor, mutator, seeds, events)?;

    let reporter = Reporter {
        crashes_dir: &config.corpus.crashes_dir,
        print_interval: cli.print_interval,
        max_iterations: config.fuzzer.max_iterations,
    };
    let cancel = CancelToken::new();
    let signals = cancel_on_signals(&cancel)?;

    let summary = thread::scope(|scope| {
        let run = scope.spawn(|| fuzzer.run(&cancel));
        while !run.is_finished() {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(event) => reporter.handle(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        for event in rx.try_iter() {
            reporter.handle(event);
        }
        run.join()
            .map_err(|_| anyhow::anyhow!("fuzz loop terminated abnormally"))
    })?;
    signals.close();

    print_summary(&summary);

    // Rewrite every report so occurrence counts reflect the whole run.
    for record in fuzzer.crashes().records() {
        reporter.save(&record);
    }
    if summary.unique_crashes > 0 {
        println!("Crashes saved to {:?}", config.corpus.crashes_dir);
    }

    if let Some(output_dir) = &config.corpus.output_dir {
        let written = fuzzer.corpus().persist(output_dir)?;
        println!("Corpus of {written} entries saved to {output_dir:?}");
    }

    Ok(())
}
