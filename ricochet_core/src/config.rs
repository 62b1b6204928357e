use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerType {
    /// Favors entries that have been picked less often.
    #[default]
    Weighted,
    /// Every entry is equally likely.
    Uniform,
}

/// Bounds and knobs of one fuzzing run.
///
/// `max_iterations` and `time_budget_ms` are both optional; a run with
/// neither only stops through its cancellation token.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default)]
    pub max_iterations: Option<u64>,
    #[serde(default)]
    pub time_budget_ms: Option<u64>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: usize,
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default)]
    pub rng_seed: u64,
    #[serde(default)]
    pub scheduler: SchedulerType,
    #[serde(default = "default_true")]
    pub use_dictionary: bool,
    #[serde(default = "default_true")]
    pub calibrate_seeds: bool,
    #[serde(default)]
    pub require_reachable_target: bool,
    #[serde(default = "default_corpus_warn_threshold")]
    pub corpus_warn_threshold: usize,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

pub fn default_request_timeout_ms() -> u64 {
    5000
}
pub fn default_max_payload_size() -> usize {
    64 * 1024
}
pub fn default_threads() -> usize {
    1
}
pub fn default_corpus_warn_threshold() -> usize {
    10_000
}
pub fn default_event_buffer() -> usize {
    1024
}
fn default_true() -> bool {
    true
}

impl FuzzerSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn time_budget(&self) -> Option<Duration> {
        self.time_budget_ms.map(Duration::from_millis)
    }

    /// True when neither an iteration nor a time bound is set.
    pub fn is_unbounded(&self) -> bool {
        self.max_iterations.is_none() && self.time_budget_ms.is_none()
    }
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            max_iterations: None,
            time_budget_ms: None,
            request_timeout_ms: default_request_timeout_ms(),
            max_payload_size: default_max_payload_size(),
            threads: default_threads(),
            rng_seed: 0,
            scheduler: SchedulerType::default(),
            use_dictionary: true,
            calibrate_seeds: true,
            require_reachable_target: false,
            corpus_warn_threshold: default_corpus_warn_threshold(),
            event_buffer: default_event_buffer(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default)]
    pub use_env_proxy: bool,
}

fn default_method() -> String {
    "POST".to_string()
}
fn default_content_type() -> String {
    "application/json".to_string()
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:5000/api/parse".to_string(),
            method: default_method(),
            headers: BTreeMap::new(),
            content_type: default_content_type(),
            use_env_proxy: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusConfig {
    #[serde(default)]
    pub initial_seed_paths: Option<Vec<PathBuf>>,
    /// Where the retained corpus is written at the end of the run.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default = "default_crashes_dir")]
    pub crashes_dir: PathBuf,
}

pub fn default_crashes_dir() -> PathBuf {
    PathBuf::from("./crashes")
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            initial_seed_paths: None,
            output_dir: None,
            crashes_dir: default_crashes_dir(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RicochetConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub corpus: CorpusConfig,
}

impl RicochetConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;
        Self::from_toml_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_uses_defaults() {
        let config = RicochetConfig::from_toml_str("").unwrap();
        assert_eq!(config.fuzzer.max_iterations, None);
        assert_eq!(config.fuzzer.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.fuzzer.threads, 1);
        assert_eq!(config.fuzzer.scheduler, SchedulerType::Weighted);
        assert!(config.fuzzer.is_unbounded());
        assert_eq!(config.target.method, "POST");
        assert_eq!(config.target.content_type, "application/json");
        assert_eq!(config.corpus.crashes_dir, PathBuf::from("./crashes"));
    }

    #[test]
    fn kebab_case_keys_are_parsed() {
        let config = RicochetConfig::from_toml_str(
            r#"
            [fuzzer]
            max-iterations = 500
            time-budget-ms = 60000
            request-timeout-ms = 250
            max-payload-size = 128
            threads = 4
            scheduler = "uniform"
            use-dictionary = false

            [target]
            url = "http://127.0.0.1:8080/api/calculate"
            method = "put"
            headers = { "X-Trace" = "on" }

            [corpus]
            initial-seed-paths = ["seeds"]
            output-dir = "out/corpus"
            "#,
        )
        .unwrap();
        assert_eq!(config.fuzzer.max_iterations, Some(500));
        assert_eq!(config.fuzzer.time_budget(), Some(Duration::from_secs(60)));
        assert_eq!(config.fuzzer.request_timeout(), Duration::from_millis(250));
        assert_eq!(config.fuzzer.max_payload_size, 128);
        assert_eq!(config.fuzzer.threads, 4);
        assert_eq!(config.fuzzer.scheduler, SchedulerType::Uniform);
        assert!(!config.fuzzer.use_dictionary);
        assert!(!config.fuzzer.is_unbounded());
        assert_eq!(config.target.method, "put");
        assert_eq!(config.target.headers.get("X-Trace").map(String::as_str), Some("on"));
        assert_eq!(
            config.corpus.output_dir,
            Some(PathBuf::from("out/corpus"))
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result = RicochetConfig::from_toml_str("[fuzzer]\nmax-iteration = 5\n");
        assert!(result.is_err());
    }

    #[test]
    fn load_from_file_reads_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[target]\nurl = \"http://example.invalid/\"").unwrap();
        let config = RicochetConfig::load_from_file(&file.path().to_path_buf()).unwrap();
        assert_eq!(config.target.url, "http://example.invalid/");
    }

    #[test]
    fn load_from_missing_file_fails_with_context() {
        let err = RicochetConfig::load_from_file(&PathBuf::from("/nonexistent/ricochet.toml"))
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
