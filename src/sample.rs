//! Core data model for evaluation runs
//!
//! Defines the immutable task instance, the mutable sample record that
//! tracks its processing lifecycle, and the score record produced by
//! judging. All types serialize to JSON for the checkpoint files.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One generated long-context problem with embedded ground truth.
///
/// Created once by a task generator and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInstance {
    /// Unique identifier, `<task_type>/<target_length>_<index>`
    pub sample_id: String,
    /// Task type tag (selects the generator and verifier)
    pub task_type: String,
    /// Target output-length tag (e.g. "1k", "8k")
    pub target_length: String,
    /// Full prompt sent to the model under evaluation
    pub prompt: String,
    /// Verification metadata the generator embedded for scoring
    pub ground_truth: Value,
}

/// Lifecycle state of a sample within a run.
///
/// `Completed` and `Failed` are terminal: once a record reaches either, no
/// automatic transition occurs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SampleState {
    /// Not yet claimed by any worker
    Pending,
    /// Claimed by a worker; a backend call may be outstanding
    InFlight,
    /// Inference produced an output
    Completed,
    /// Inference gave up after exhausting backend retries
    Failed { reason: String },
}

impl SampleState {
    /// Whether the state admits no further automatic transition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. })
    }

    /// Short name used in logs and reports.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Mutable processing envelope wrapping one task instance.
///
/// Owned by the checkpoint manager; the scheduler only claims records and
/// requests transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleRecord {
    #[serde(flatten)]
    pub task: TaskInstance,
    #[serde(flatten)]
    pub state: SampleState,
    /// Model output, present once Completed
    pub output: Option<String>,
    /// Backend calls spent on this sample (including retries)
    pub attempts: u32,
    /// Most recent backend error, kept for failure reports
    pub last_error: Option<String>,
    /// Wall-clock seconds the inference call took
    pub inference_secs: Option<f64>,
}

impl SampleRecord {
    /// Wrap a fresh task instance in a Pending record.
    pub fn new(task: TaskInstance) -> Self {
        Self {
            task,
            state: SampleState::Pending,
            output: None,
            attempts: 0,
            last_error: None,
            inference_secs: None,
        }
    }

    pub fn sample_id(&self) -> &str {
        &self.task.sample_id
    }
}

/// Verdict produced by judging a completed output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Numeric score in [0, 1]
    Score(f64),
    /// Categorical label (e.g. "supported")
    Label(String),
}

impl Verdict {
    /// Numeric value if this verdict carries one.
    pub fn as_score(&self) -> Option<f64> {
        match self {
            Self::Score(v) => Some(*v),
            Self::Label(_) => None,
        }
    }
}

/// Result of judging one completed sample.
///
/// Keyed by sample id in the judge's own checkpoint keyspace. A record with
/// `error` set and no verdict marks a terminal judge failure; whether such
/// records are retried on a later run is a configuration choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub sample_id: String,
    pub verdict: Option<Verdict>,
    /// Judge rationale text, when the judge model provided one
    pub rationale: Option<String>,
    /// Backend id of the judge model, or "verifier" for deterministic scoring
    pub judge: String,
    /// Judge backend calls spent on this sample
    pub attempts: u32,
    pub error: Option<String>,
    /// Wall-clock seconds the judging call took
    pub judging_secs: Option<f64>,
}

impl ScoreRecord {
    /// Whether this record settles the sample (no re-judging without force).
    pub fn is_usable(&self) -> bool {
        self.verdict.is_some()
    }
}

/// Process-wide descriptor of one evaluation run.
///
/// Written to `manifest.json` in the run directory at initialization and
/// read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    /// Model under evaluation (backend id)
    pub model: String,
    /// Task set identifier from the configuration
    pub task_set: String,
    pub worker_count: usize,
    pub judge_worker_count: usize,
    pub output_dir: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> SampleRecord {
        SampleRecord::new(TaskInstance {
            sample_id: id.to_string(),
            task_type: "kv_dictionary".to_string(),
            target_length: "1k".to_string(),
            prompt: "p".to_string(),
            ground_truth: serde_json::json!({"target_key": "K"}),
        })
    }

    #[test]
    fn test_terminal_states() {
        assert!(!SampleState::Pending.is_terminal());
        assert!(!SampleState::InFlight.is_terminal());
        assert!(SampleState::Completed.is_terminal());
        assert!(SampleState::Failed { reason: "timeout".into() }.is_terminal());
    }

    #[test]
    fn test_record_roundtrip() {
        let mut rec = record("kv_dictionary/1k_0");
        rec.state = SampleState::Failed { reason: "unavailable".into() };
        rec.attempts = 3;

        let line = serde_json::to_string(&rec).unwrap();
        let back: SampleRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(back.sample_id(), "kv_dictionary/1k_0");
        assert_eq!(back.state, rec.state);
        assert_eq!(back.attempts, 3);
    }

    #[test]
    fn test_verdict_score() {
        assert_eq!(Verdict::Score(0.75).as_score(), Some(0.75));
        assert_eq!(Verdict::Label("supported".into()).as_score(), None);
    }
}
