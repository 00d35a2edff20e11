use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Standard-library modules submitted code may import.
pub const DEFAULT_ALLOWED_MODULES: &[&str] = &[
    "abc",
    "array",
    "bisect",
    "calendar",
    "cmath",
    "collections",
    "copy",
    "dataclasses",
    "datetime",
    "decimal",
    "enum",
    "fractions",
    "functools",
    "heapq",
    "itertools",
    "json",
    "math",
    "numbers",
    "operator",
    "random",
    "re",
    "statistics",
    "string",
    "textwrap",
    "time",
    "typing",
    "unittest",
];

/// Substrings that reject code outright, wherever they appear.
pub const DEFAULT_BLOCKED_PATTERNS: &[&str] = &[
    "__builtins__",
    "__subclasses__",
    "__globals__",
    "__code__",
    "__loader__",
    "breakpoint(",
    "globals(",
    "locals(",
    "vars(",
    "getattr(",
    "setattr(",
    "delattr(",
    "open(",
    "input(",
    "os.system",
    "os.popen",
    "subprocess",
    "socket",
    "shutil",
    "ctypes",
    "pickle",
    "marshal",
    "importlib",
];

/// Runtime configuration for the execution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutorConfig {
    pub interpreter_path: String,
    #[serde(with = "duration_str")]
    pub timeout: Duration,
    #[serde(with = "duration_str")]
    pub min_timeout: Duration,
    #[serde(with = "duration_str")]
    pub max_timeout: Duration,
    pub memory_limit_mb: u64,
    pub min_memory_limit_mb: u64,
    pub max_memory_limit_mb: u64,
    pub max_output_length: usize,
    pub max_code_length: usize,
    pub sandbox_enabled: bool,
    pub max_open_files: u64,
    pub workspace_root: Option<PathBuf>,
    #[serde(with = "duration_str")]
    pub memory_sample_interval: Duration,
    #[serde(with = "duration_str")]
    pub shutdown_grace: Duration,
    pub allowed_modules: Vec<String>,
    pub blocked_patterns: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            interpreter_path: "python3".to_string(),
            timeout: Duration::from_secs(5),
            min_timeout: Duration::from_millis(100),
            max_timeout: Duration::from_secs(30),
            memory_limit_mb: 128,
            min_memory_limit_mb: 32,
            max_memory_limit_mb: 512,
            max_output_length: 64 * 1024,
            max_code_length: 10_000,
            sandbox_enabled: true,
            max_open_files: 64,
            workspace_root: None,
            memory_sample_interval: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(5),
            allowed_modules: DEFAULT_ALLOWED_MODULES
                .iter()
                .map(|m| m.to_string())
                .collect(),
            blocked_patterns: DEFAULT_BLOCKED_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

impl ExecutorConfig {
    /// Load configuration from `EXECUTOR_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = env_string("EXECUTOR_INTERPRETER") {
            config.interpreter_path = path;
        }
        if let Some(value) = env_duration("EXECUTOR_TIMEOUT")? {
            config.timeout = value;
        }
        if let Some(value) = env_duration("EXECUTOR_MIN_TIMEOUT")? {
            config.min_timeout = value;
        }
        if let Some(value) = env_duration("EXECUTOR_MAX_TIMEOUT")? {
            config.max_timeout = value;
        }
        if let Some(value) = env_parse("EXECUTOR_MEMORY_LIMIT_MB")? {
            config.memory_limit_mb = value;
        }
        if let Some(value) = env_parse("EXECUTOR_MIN_MEMORY_MB")? {
            config.min_memory_limit_mb = value;
        }
        if let Some(value) = env_parse("EXECUTOR_MAX_MEMORY_MB")? {
            config.max_memory_limit_mb = value;
        }
        if let Some(value) = env_parse("EXECUTOR_MAX_OUTPUT")? {
            config.max_output_length = value;
        }
        if let Some(value) = env_parse("EXECUTOR_MAX_CODE_LENGTH")? {
            config.max_code_length = value;
        }
        if let Some(value) = env_parse("EXECUTOR_SANDBOX")? {
            config.sandbox_enabled = value;
        }
        if let Some(value) = env_parse("EXECUTOR_MAX_OPEN_FILES")? {
            config.max_open_files = value;
        }
        if let Some(dir) = env_string("EXECUTOR_WORKSPACE_ROOT") {
            config.workspace_root = Some(PathBuf::from(dir));
        }
        if let Some(value) = env_duration("EXECUTOR_MEMORY_SAMPLE_INTERVAL")? {
            config.memory_sample_interval = value;
        }
        if let Some(value) = env_duration("EXECUTOR_SHUTDOWN_GRACE")? {
            config.shutdown_grace = value;
        }
        if let Some(list) = env_string("EXECUTOR_ALLOWED_MODULES") {
            config.allowed_modules = split_list(&list);
        }
        if let Some(list) = env_string("EXECUTOR_BLOCKED_PATTERNS") {
            config.blocked_patterns = split_list(&list);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file; missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading executor config at {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing executor config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interpreter_path.trim().is_empty() {
            bail!("interpreterPath cannot be empty");
        }
        if self.min_timeout.is_zero() {
            bail!("minTimeout must be greater than zero");
        }
        if self.min_timeout > self.max_timeout {
            bail!(
                "minTimeout ({:?}) exceeds maxTimeout ({:?})",
                self.min_timeout,
                self.max_timeout
            );
        }
        if self.timeout < self.min_timeout || self.timeout > self.max_timeout {
            bail!(
                "timeout {:?} is outside [{:?}, {:?}]",
                self.timeout,
                self.min_timeout,
                self.max_timeout
            );
        }
        if self.min_memory_limit_mb == 0 || self.min_memory_limit_mb > self.max_memory_limit_mb {
            bail!(
                "memory range [{}, {}] MB is invalid",
                self.min_memory_limit_mb,
                self.max_memory_limit_mb
            );
        }
        if self.memory_limit_mb < self.min_memory_limit_mb
            || self.memory_limit_mb > self.max_memory_limit_mb
        {
            bail!(
                "memoryLimitMb {} is outside [{}, {}]",
                self.memory_limit_mb,
                self.min_memory_limit_mb,
                self.max_memory_limit_mb
            );
        }
        if self.max_output_length == 0 {
            bail!("maxOutputLength must be greater than zero");
        }
        if self.max_code_length == 0 {
            bail!("maxCodeLength must be greater than zero");
        }
        if self.memory_sample_interval.is_zero() {
            bail!("memorySampleInterval must be greater than zero");
        }
        Ok(())
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_string(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .with_context(|| format!("invalid value '{}' for {}", raw, key)),
        None => Ok(None),
    }
}

fn env_duration(key: &str) -> Result<Option<Duration>> {
    match env_string(key) {
        Some(raw) => humantime::parse_duration(&raw)
            .map(Some)
            .with_context(|| format!("invalid duration '{}' for {}", raw, key)),
        None => Ok(None),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

/// Durations are written as humantime strings (`"5s"`, `"250ms"`).
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
