//! Configuration for evaluation runs
//!
//! Defines the `longeval.toml` schema: run settings, backend registrations,
//! task selections, and judging options.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    pub run: RunConfig,

    /// Model backends available to this run
    #[serde(default)]
    pub backends: Vec<BackendConfig>,

    /// Task selections to generate samples from
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,

    #[serde(default)]
    pub judge: JudgeConfig,
}

/// Run-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Backend id of the model under evaluation
    pub model: String,

    /// Task set identifier recorded in the run manifest
    #[serde(default = "default_task_set")]
    pub task_set: String,

    /// Directory holding per-model run directories
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Inference worker pool size
    #[serde(default = "default_workers")]
    pub worker_count: usize,

    /// Judge worker pool size (tuned independently of inference)
    #[serde(default = "default_judge_workers")]
    pub judge_worker_count: usize,

    /// Whether Failed samples (and errored score records) re-enter the
    /// pending set on a later invocation of their pass
    #[serde(default)]
    pub retry_failed: bool,

    /// Base seed for task generation
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_task_set() -> String { "default".to_string() }
fn default_output_dir() -> String { "./results".to_string() }
fn default_workers() -> usize { 8 }
fn default_judge_workers() -> usize { 4 }
fn default_seed() -> u64 { 42 }

/// One backend registration.
///
/// Several ids may point at the same `base_url`; the client pool caps
/// outstanding requests per physical endpoint, not per id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Logical backend id referenced by `run.model` and `judge.backend`
    pub id: String,

    /// Backend kind: "openai-compat" (the only wire protocol shipped)
    #[serde(default = "default_backend_kind")]
    pub kind: String,

    /// Base URL of the endpoint (e.g. "https://api.example.com/v1")
    pub base_url: String,

    /// Model name passed in the request body
    pub model: String,

    /// Environment variable holding the API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Max outstanding requests against this endpoint
    #[serde(default = "default_max_outstanding")]
    pub max_outstanding: usize,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub generation: GenerationConfig,
}

fn default_backend_kind() -> String { "openai-compat".to_string() }
fn default_max_outstanding() -> usize { 8 }
fn default_timeout_secs() -> u64 { 300 }

/// Retry policy for transient backend errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempt ceiling (first call included)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 { 5 }
fn default_initial_backoff_ms() -> u64 { 500 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_max_backoff_ms() -> u64 { 30_000 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Generation parameters sent with every request to a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Request-level seed forwarded to backends that honor it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

fn default_max_tokens() -> u32 { 8192 }
fn default_temperature() -> f64 { 0.1 }

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            seed: None,
        }
    }
}

/// One task selection: which generator to run and how many samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Task type tag, must match a registered generator
    pub task_type: String,

    /// Target output-length tag (e.g. "1k", "8k")
    #[serde(default = "default_target_length")]
    pub target_length: String,

    #[serde(default = "default_sample_count")]
    pub sample_count: usize,

    /// Generator-specific parameters
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,
}

fn default_target_length() -> String { "1k".to_string() }
fn default_sample_count() -> usize { 10 }

/// Judging options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JudgeConfig {
    /// Backend id of the judge model. Task types with a deterministic
    /// verifier are scored locally and never reach this backend; when no
    /// verifier exists and no judge backend is configured, judging those
    /// task types is a configuration error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
}

impl EvalConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {:?}", path))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a TOML file (used by `init-config`).
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Cross-field validation. Misconfiguration is fatal before any work
    /// starts, never a per-sample failure.
    pub fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            bail!("No backends configured. Add [[backends]] entries");
        }
        if self.tasks.is_empty() {
            bail!("No tasks configured. Add [[tasks]] entries");
        }
        if self.run.worker_count == 0 || self.run.judge_worker_count == 0 {
            bail!("worker_count and judge_worker_count must be at least 1");
        }
        self.backend(&self.run.model)
            .with_context(|| format!("run.model references unknown backend '{}'", self.run.model))?;
        if let Some(judge_id) = &self.judge.backend {
            self.backend(judge_id)
                .with_context(|| format!("judge.backend references unknown backend '{}'", judge_id))?;
        }
        let mut seen = std::collections::HashSet::new();
        for backend in &self.backends {
            if !seen.insert(backend.id.as_str()) {
                bail!("Duplicate backend id '{}'", backend.id);
            }
        }
        Ok(())
    }

    /// Look up a backend registration by id.
    pub fn backend(&self, id: &str) -> Result<&BackendConfig> {
        self.backends
            .iter()
            .find(|b| b.id == id)
            .ok_or_else(|| anyhow::anyhow!("Unknown backend id: {}", id))
    }

    /// Run directory for the model under evaluation.
    pub fn run_dir(&self) -> std::path::PathBuf {
        Path::new(&self.run.output_dir).join(&self.run.model)
    }

    /// Example configuration written by `init-config`.
    pub fn example() -> Self {
        Self {
            run: RunConfig {
                model: "primary".to_string(),
                task_set: default_task_set(),
                output_dir: default_output_dir(),
                worker_count: default_workers(),
                judge_worker_count: default_judge_workers(),
                retry_failed: false,
                seed: default_seed(),
            },
            backends: vec![BackendConfig {
                id: "primary".to_string(),
                kind: default_backend_kind(),
                base_url: "https://api.openai.com/v1".to_string(),
                model: "gpt-4o".to_string(),
                api_key_env: Some("OPENAI_API_KEY".to_string()),
                max_outstanding: default_max_outstanding(),
                request_timeout_secs: default_timeout_secs(),
                retry: RetryConfig::default(),
                generation: GenerationConfig::default(),
            }],
            tasks: vec![TaskConfig {
                task_type: "kv_dictionary".to_string(),
                target_length: default_target_length(),
                sample_count: default_sample_count(),
                params: serde_json::json!({ "num_entries": 160 }),
            }],
            judge: JudgeConfig::default(),
        }
    }
}
