//! Result aggregation
//!
//! A pure fold over one run's sample snapshot and score set, producing a
//! per (model, task type) summary plus a run-level rollup. Samples that
//! never reached a terminal state are reported as a distinct `stuck`
//! category so "scored low" and "never finished" stay distinguishable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::sample::{SampleRecord, SampleState, ScoreRecord};

/// Summary for one (model, task type) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTypeSummary {
    pub model: String,
    pub task_type: String,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    /// Pending or in-flight at report time: never reached a terminal state
    pub stuck: usize,
    pub completion_rate: f64,
    pub failure_rate: f64,
    /// Failure reasons with occurrence counts
    pub failure_reasons: BTreeMap<String, usize>,
    /// Samples with a usable verdict
    pub scored: usize,
    /// Samples whose judging ended in a terminal error
    pub judge_errors: usize,
    pub mean_score: Option<f64>,
    pub min_score: Option<f64>,
    pub max_score: Option<f64>,
    /// Counts per categorical verdict label
    pub label_counts: BTreeMap<String, usize>,
    pub avg_inference_secs: Option<f64>,
    pub avg_judging_secs: Option<f64>,
}

/// Run-level rollup across task types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRollup {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub stuck: usize,
    pub scored: usize,
    pub mean_score: Option<f64>,
}

/// Full report for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub model: String,
    pub task_set: String,
    pub generated_at: DateTime<Utc>,
    pub overall: RunRollup,
    pub task_types: Vec<TaskTypeSummary>,
}

struct Accumulator {
    total: usize,
    completed: usize,
    failed: usize,
    stuck: usize,
    failure_reasons: BTreeMap<String, usize>,
    scores: Vec<f64>,
    scored: usize,
    judge_errors: usize,
    label_counts: BTreeMap<String, usize>,
    inference_secs: Vec<f64>,
    judging_secs: Vec<f64>,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            total: 0,
            completed: 0,
            failed: 0,
            stuck: 0,
            failure_reasons: BTreeMap::new(),
            scores: Vec::new(),
            scored: 0,
            judge_errors: 0,
            label_counts: BTreeMap::new(),
            inference_secs: Vec::new(),
            judging_secs: Vec::new(),
        }
    }

    fn add(&mut self, record: &SampleRecord, score: Option<&ScoreRecord>) {
        self.total += 1;
        match &record.state {
            SampleState::Completed => self.completed += 1,
            SampleState::Failed { reason } => {
                self.failed += 1;
                *self.failure_reasons.entry(reason.clone()).or_default() += 1;
            }
            SampleState::Pending | SampleState::InFlight => self.stuck += 1,
        }
        if let Some(secs) = record.inference_secs {
            self.inference_secs.push(secs);
        }
        if let Some(score) = score {
            if let Some(secs) = score.judging_secs {
                self.judging_secs.push(secs);
            }
            match &score.verdict {
                Some(verdict) => {
                    self.scored += 1;
                    if let Some(value) = verdict.as_score() {
                        self.scores.push(value);
                    }
                    if let crate::sample::Verdict::Label(label) = verdict {
                        *self.label_counts.entry(label.clone()).or_default() += 1;
                    }
                }
                None => self.judge_errors += 1,
            }
        }
    }

    fn into_summary(self, model: &str, task_type: &str) -> TaskTypeSummary {
        let total = self.total.max(1) as f64;
        TaskTypeSummary {
            model: model.to_string(),
            task_type: task_type.to_string(),
            total: self.total,
            completed: self.completed,
            failed: self.failed,
            stuck: self.stuck,
            completion_rate: self.completed as f64 / total,
            failure_rate: self.failed as f64 / total,
            failure_reasons: self.failure_reasons,
            scored: self.scored,
            judge_errors: self.judge_errors,
            mean_score: mean(&self.scores),
            min_score: self.scores.iter().copied().reduce(f64::min),
            max_score: self.scores.iter().copied().reduce(f64::max),
            label_counts: self.label_counts,
            avg_inference_secs: mean(&self.inference_secs),
            avg_judging_secs: mean(&self.judging_secs),
        }
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Fold a complete snapshot and score set into a report.
pub fn aggregate(
    model: &str,
    task_set: &str,
    samples: &[SampleRecord],
    scores: &BTreeMap<String, ScoreRecord>,
) -> RunReport {
    let mut by_task_type: BTreeMap<String, Accumulator> = BTreeMap::new();
    for record in samples {
        by_task_type
            .entry(record.task.task_type.clone())
            .or_insert_with(Accumulator::new)
            .add(record, scores.get(record.sample_id()));
    }

    let mut overall = RunRollup {
        total: 0,
        completed: 0,
        failed: 0,
        stuck: 0,
        scored: 0,
        mean_score: None,
    };
    let mut all_scores = Vec::new();
    let task_types: Vec<TaskTypeSummary> = by_task_type
        .into_iter()
        .map(|(task_type, acc)| {
            all_scores.extend_from_slice(&acc.scores);
            let summary = acc.into_summary(model, &task_type);
            overall.total += summary.total;
            overall.completed += summary.completed;
            overall.failed += summary.failed;
            overall.stuck += summary.stuck;
            overall.scored += summary.scored;
            summary
        })
        .collect();
    overall.mean_score = mean(&all_scores);

    RunReport {
        model: model.to_string(),
        task_set: task_set.to_string(),
        generated_at: Utc::now(),
        overall,
        task_types,
    }
}
