//! Task generation
//!
//! Task generators produce the immutable task instances a run evaluates.
//! Generation is deterministic: each sample's RNG is seeded from the run
//! seed and its own id, so re-invoking with the same configuration
//! reproduces the same instances and a re-run can be compared sample by
//! sample. Generators may also carry a deterministic verifier, which the
//! judging pass uses in place of the judge model.

pub mod kv_dictionary;
pub mod state_machine;

pub use kv_dictionary::KvDictionaryTask;
pub use state_machine::StateMachineTask;

use anyhow::{bail, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{EvalConfig, TaskConfig};
use crate::sample::{SampleRecord, TaskInstance, Verdict};

/// A task type: generates instances and optionally verifies outputs.
pub trait TaskGenerator: Send + Sync {
    /// Task type tag this generator is registered under.
    fn task_type(&self) -> &'static str;

    /// Produce the instances for one `[[tasks]]` selection. Must be a pure
    /// function of the selection and `base_seed`.
    fn generate(&self, task: &TaskConfig, base_seed: u64) -> Result<Vec<TaskInstance>>;

    /// Whether outputs of this task type can be scored without a judge
    /// model. When true, `verify` must return a verdict for every output,
    /// scoring unparseable ones as zero rather than abstaining.
    fn is_verifiable(&self) -> bool {
        false
    }

    /// Deterministic scoring of one output against its ground truth.
    fn verify(&self, _output: &str, _ground_truth: &Value) -> Option<Verdict> {
        None
    }
}

/// Registry mapping task type tags to generators.
pub struct TaskRegistry {
    generators: HashMap<&'static str, Arc<dyn TaskGenerator>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            generators: HashMap::new(),
        }
    }

    /// Registry with every generator shipped in this crate.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(KvDictionaryTask));
        registry.register(Arc::new(StateMachineTask));
        registry
    }

    pub fn register(&mut self, generator: Arc<dyn TaskGenerator>) {
        self.generators.insert(generator.task_type(), generator);
    }

    pub fn get(&self, task_type: &str) -> Option<&Arc<dyn TaskGenerator>> {
        self.generators.get(task_type)
    }

    pub fn task_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.generators.keys().copied().collect();
        types.sort_unstable();
        types
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Seed for one sample, derived from the run seed and the sample id so
/// instance content is stable across re-runs and independent of generation
/// order.
pub fn seed_for_sample(base_seed: u64, sample_id: &str) -> u64 {
    let digest = Sha256::digest(format!("{}:{}", base_seed, sample_id));
    u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

/// Unique id for one sample of a task selection.
pub fn sample_id(task: &TaskConfig, index: usize) -> String {
    format!("{}/{}_{}", task.task_type, task.target_length, index)
}

/// Generate the full sample set for a run, wrapped in Pending records.
/// An unknown task type in configuration is fatal before any work starts.
pub fn generate_records(config: &EvalConfig, registry: &TaskRegistry) -> Result<Vec<SampleRecord>> {
    let mut records = Vec::new();
    for task in &config.tasks {
        let Some(generator) = registry.get(&task.task_type) else {
            bail!(
                "Unknown task type '{}' (registered: {:?})",
                task.task_type,
                registry.task_types()
            );
        };
        let instances = generator.generate(task, config.run.seed)?;
        tracing::info!(
            task_type = %task.task_type,
            target_length = %task.target_length,
            count = instances.len(),
            "Generated task instances"
        );
        records.extend(instances.into_iter().map(SampleRecord::new));
    }
    Ok(records)
}
