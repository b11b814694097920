//! Judging pass
//!
//! Structurally mirrors the inference pass on the same dispatch engine, but
//! its unit of work is a Completed sample and its outcome is a score record
//! in the judge's own checkpoint keyspace. Task types with a deterministic
//! verifier are scored locally; everything else is packaged into a judge
//! prompt (model output + ground truth) and sent to the judge backend under
//! the same call contract as inference.

use anyhow::{bail, Result};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backends::pool::{BackendHandle, BackendPool};
use crate::backends::traits::GenerateRequest;
use crate::checkpoint::CheckpointManager;
use crate::config::EvalConfig;
use crate::sample::{SampleRecord, SampleState, ScoreRecord, Verdict};
use crate::scheduler::{drive, DispatchQueue, Processed};
use crate::tasks::TaskRegistry;

/// Build the prompt asking the judge model to score one output.
fn build_judge_prompt(record: &SampleRecord) -> String {
    let ground_truth =
        serde_json::to_string_pretty(&record.task.ground_truth).unwrap_or_else(|_| "{}".into());
    format!(
        "You are grading the output of a long-context generation task.\n\
         \n\
         Task type: {}\n\
         \n\
         Reference information (ground truth):\n{}\n\
         \n\
         Model output to grade:\n{}\n\
         \n\
         Judge ONLY against the reference information. Return JSON:\n\
         {{\"score\": <float 0.0-1.0>, \"rationale\": \"...\"}}",
        record.task.task_type,
        ground_truth,
        record.output.as_deref().unwrap_or_default(),
    )
}

/// Parse the judge's reply. Accepts a numeric `score` or a string `label`,
/// anywhere in the first JSON object of the text.
fn parse_verdict(text: &str) -> Option<(Verdict, Option<String>)> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if start >= end {
        return None;
    }
    let obj: Value = serde_json::from_str(&text[start..=end]).ok()?;
    let rationale = obj
        .get("rationale")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    if let Some(score) = obj.get("score").and_then(|v| v.as_f64()) {
        return Some((Verdict::Score(score.clamp(0.0, 1.0)), rationale));
    }
    if let Some(label) = obj.get("label").and_then(|v| v.as_str()) {
        return Some((Verdict::Label(label.to_string()), rationale));
    }
    None
}

/// Judging pass state driven by the dispatch engine.
pub struct JudgePass {
    queue: Mutex<VecDeque<SampleRecord>>,
    scores: Mutex<BTreeMap<String, ScoreRecord>>,
    manager: Arc<CheckpointManager>,
    registry: Arc<TaskRegistry>,
    judge_backend: Option<BackendHandle>,
    scored: AtomicUsize,
    errored: AtomicUsize,
}

impl JudgePass {
    fn score_with_verifier(&self, record: &SampleRecord) -> Option<ScoreRecord> {
        let generator = self.registry.get(&record.task.task_type)?;
        let output = record.output.as_deref().unwrap_or_default();
        let verdict = generator.verify(output, &record.task.ground_truth)?;
        Some(ScoreRecord {
            sample_id: record.sample_id().to_string(),
            verdict: Some(verdict),
            rationale: None,
            judge: "verifier".to_string(),
            attempts: 1,
            error: None,
            judging_secs: None,
        })
    }
}

#[async_trait::async_trait]
impl DispatchQueue for JudgePass {
    type Item = SampleRecord;
    type Outcome = ScoreRecord;

    fn claim(&self) -> Option<SampleRecord> {
        self.queue.lock().unwrap().pop_front()
    }

    async fn process(&self, item: &SampleRecord, cancel: &CancellationToken)
        -> Processed<ScoreRecord> {
        let start = Instant::now();
        if let Some(mut score) = self.score_with_verifier(item) {
            score.judging_secs = Some(start.elapsed().as_secs_f64());
            return Processed::Done(score);
        }

        // No deterministic verifier: this task type needs the judge model.
        // run_judging checks this before dispatch; a miss here means a
        // verifier abstained on a specific output, which is its own error.
        let Some(backend) = self.judge_backend.as_ref() else {
            return Processed::Done(ScoreRecord {
                sample_id: item.sample_id().to_string(),
                verdict: None,
                rationale: None,
                judge: "verifier".to_string(),
                attempts: 0,
                error: Some(format!(
                    "No verifier verdict for task type '{}' and no judge backend configured",
                    item.task.task_type
                )),
                judging_secs: Some(start.elapsed().as_secs_f64()),
            });
        };
        let request = GenerateRequest {
            system: Some("You are a meticulous, impartial grader.".to_string()),
            prompt: build_judge_prompt(item),
            max_tokens: 1024,
            temperature: 0.0,
            seed: None,
        };
        let result = backend.submit(&request, cancel).await;
        let secs = start.elapsed().as_secs_f64();

        let score = match result {
            Ok(response) => match parse_verdict(&response.text) {
                Some((verdict, rationale)) => ScoreRecord {
                    sample_id: item.sample_id().to_string(),
                    verdict: Some(verdict),
                    rationale,
                    judge: backend.id().to_string(),
                    attempts: response.attempts,
                    error: None,
                    judging_secs: Some(secs),
                },
                None => ScoreRecord {
                    sample_id: item.sample_id().to_string(),
                    verdict: None,
                    rationale: Some(response.text),
                    judge: backend.id().to_string(),
                    attempts: response.attempts,
                    error: Some("Judge reply held no parseable verdict".to_string()),
                    judging_secs: Some(secs),
                },
            },
            Err(_) if cancel.is_cancelled() => return Processed::Interrupted,
            Err(error) => {
                tracing::warn!(
                    sample_id = item.sample_id(),
                    kind = error.kind.name(),
                    attempts = error.attempts,
                    "Judging failed after exhausting retries"
                );
                ScoreRecord {
                    sample_id: item.sample_id().to_string(),
                    verdict: None,
                    rationale: None,
                    judge: backend.id().to_string(),
                    attempts: error.attempts,
                    error: Some(error.to_string()),
                    judging_secs: Some(secs),
                }
            }
        };
        Processed::Done(score)
    }

    fn commit(&self, item: &SampleRecord, outcome: ScoreRecord) -> Result<()> {
        debug_assert_eq!(item.state, SampleState::Completed);
        self.manager.scores().append(&outcome)?;
        if outcome.is_usable() {
            self.scored.fetch_add(1, Ordering::Relaxed);
        } else {
            self.errored.fetch_add(1, Ordering::Relaxed);
        }
        self.scores
            .lock()
            .unwrap()
            .insert(outcome.sample_id.clone(), outcome);
        Ok(())
    }

    fn revert(&self, item: &SampleRecord) -> Result<()> {
        // Nothing durable marks a judge claim; putting the record back is
        // enough, and a record left unscored is re-claimed on the next run.
        self.queue.lock().unwrap().push_front(item.clone());
        Ok(())
    }
}

/// Totals reported by a judging pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct JudgeCounts {
    pub scored: usize,
    pub errored: usize,
    pub skipped: usize,
}

/// Run the judging pass: claim every Completed sample without a usable
/// score record, score it via verifier or judge backend, and merge the
/// score log. `force` re-judges even already-scored samples; without it an
/// existing record is never altered.
pub async fn run_judging(
    config: &EvalConfig,
    manager: Arc<CheckpointManager>,
    pool: &BackendPool,
    registry: Arc<TaskRegistry>,
    cancel: &CancellationToken,
    force: bool,
) -> Result<JudgeCounts> {
    let samples = manager.samples().load()?;
    let scores = manager.load_scores(config.run.retry_failed || force)?;

    let mut queue = VecDeque::new();
    let mut skipped = 0usize;
    let mut needs_judge_model = false;
    for record in samples {
        if record.state != SampleState::Completed {
            continue;
        }
        if !force && scores.contains_key(record.sample_id()) {
            skipped += 1;
            continue;
        }
        let verifiable = registry
            .get(&record.task.task_type)
            .is_some_and(|g| g.is_verifiable());
        if !verifiable {
            needs_judge_model = true;
        }
        queue.push_back(record);
    }

    // Resolve the judge backend up front: a task type without a verifier
    // and no configured judge is a configuration error, not a per-sample
    // failure.
    let judge_backend = match &config.judge.backend {
        Some(id) => Some(pool.handle(id)?),
        None => {
            if needs_judge_model {
                bail!(
                    "Task set contains types without a deterministic verifier \
                     but no judge.backend is configured"
                );
            }
            None
        }
    };

    let total = queue.len();
    tracing::info!(
        to_judge = total,
        skipped,
        workers = config.run.judge_worker_count,
        "Starting judging pass"
    );

    let pass = Arc::new(JudgePass {
        queue: Mutex::new(queue),
        scores: Mutex::new(scores),
        manager: Arc::clone(&manager),
        registry,
        judge_backend,
        scored: AtomicUsize::new(0),
        errored: AtomicUsize::new(0),
    });
    drive(Arc::clone(&pass), config.run.judge_worker_count, cancel).await?;

    let final_scores: Vec<ScoreRecord> = {
        let guard = pass.scores.lock().unwrap();
        guard.values().cloned().collect()
    };
    manager.scores().merge(&final_scores)?;

    let counts = JudgeCounts {
        scored: pass.scored.load(Ordering::Relaxed),
        errored: pass.errored.load(Ordering::Relaxed),
        skipped,
    };
    tracing::info!(
        scored = counts.scored,
        errored = counts.errored,
        "Judging pass finished"
    );
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::mock_backend::MockBackend;
    use crate::backends::traits::ModelBackend;
    use crate::config::RetryConfig;
    use crate::sample::TaskInstance;
    use tempfile::TempDir;

    fn completed_record(id: &str, task_type: &str, output: &str) -> SampleRecord {
        let mut rec = SampleRecord::new(TaskInstance {
            sample_id: id.to_string(),
            task_type: task_type.to_string(),
            target_length: "1k".to_string(),
            prompt: "p".to_string(),
            ground_truth: serde_json::json!({
                "target_key": "ABCDE",
                "target_value": "v1234",
                "target_index": 1,
                "num_entries": 3,
                "key_length": 5,
                "value_length": 5,
            }),
        });
        rec.state = SampleState::Completed;
        rec.output = Some(output.to_string());
        rec
    }

    fn test_config(judge: Option<&str>) -> EvalConfig {
        let mut config = EvalConfig::example();
        config.run.judge_worker_count = 2;
        config.judge.backend = judge.map(|s| s.to_string());
        config
    }

    fn judge_pool(reply: &str) -> (BackendPool, Arc<MockBackend>) {
        let backend = Arc::new(MockBackend::new("grader").with_reply(reply));
        let mut pool = BackendPool::new();
        pool.register(
            Arc::clone(&backend) as Arc<dyn ModelBackend>,
            RetryConfig { max_attempts: 2, initial_backoff_ms: 1, backoff_multiplier: 1.0, max_backoff_ms: 1 },
            4,
        );
        (pool, backend)
    }

    #[test]
    fn test_parse_verdict_variants() {
        let (v, r) = parse_verdict("{\"score\": 0.8, \"rationale\": \"good\"}").unwrap();
        assert_eq!(v, Verdict::Score(0.8));
        assert_eq!(r.as_deref(), Some("good"));

        let (v, _) = parse_verdict("Sure! Here it is: {\"label\": \"supported\"} done").unwrap();
        assert_eq!(v, Verdict::Label("supported".into()));

        // Scores outside [0,1] are clamped, prose is rejected.
        let (v, _) = parse_verdict("{\"score\": 3.5}").unwrap();
        assert_eq!(v, Verdict::Score(1.0));
        assert!(parse_verdict("I think it's fine").is_none());
    }

    #[tokio::test]
    async fn test_model_judged_scoring() {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(CheckpointManager::new(dir.path()));
        manager
            .samples()
            .merge(&[completed_record("news/1k_0", "news_report", "a fine article")])
            .unwrap();

        let config = test_config(Some("grader"));
        let (pool, backend) = judge_pool("{\"score\": 0.75, \"rationale\": \"solid\"}");
        let registry = Arc::new(TaskRegistry::builtin());

        let counts = run_judging(
            &config,
            Arc::clone(&manager),
            &pool,
            registry,
            &CancellationToken::new(),
            false,
        )
        .await
        .unwrap();

        assert_eq!(counts.scored, 1);
        assert_eq!(backend.call_count(), 1);
        let scores = manager.load_scores(false).unwrap();
        let score = &scores["news/1k_0"];
        assert_eq!(score.verdict, Some(Verdict::Score(0.75)));
        assert_eq!(score.judge, "grader");
    }

    #[tokio::test]
    async fn test_rejudging_without_force_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(CheckpointManager::new(dir.path()));
        manager
            .samples()
            .merge(&[completed_record("news/1k_0", "news_report", "article")])
            .unwrap();

        let config = test_config(Some("grader"));
        let registry = Arc::new(TaskRegistry::builtin());

        let (pool, backend) = judge_pool("{\"score\": 0.9}");
        run_judging(&config, Arc::clone(&manager), &pool, Arc::clone(&registry), &CancellationToken::new(), false)
            .await
            .unwrap();
        assert_eq!(backend.call_count(), 1);

        // Second pass with a judge that would disagree: the existing record
        // must survive untouched and no call be made.
        let (pool2, backend2) = judge_pool("{\"score\": 0.1}");
        let counts = run_judging(&config, Arc::clone(&manager), &pool2, registry, &CancellationToken::new(), false)
            .await
            .unwrap();
        assert_eq!(counts.skipped, 1);
        assert_eq!(backend2.call_count(), 0);
        let scores = manager.load_scores(false).unwrap();
        assert_eq!(scores.len(), 1);
        assert_eq!(scores["news/1k_0"].verdict, Some(Verdict::Score(0.9)));
    }

    #[tokio::test]
    async fn test_force_rejudges_and_replaces_in_place() {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(CheckpointManager::new(dir.path()));
        manager
            .samples()
            .merge(&[completed_record("news/1k_0", "news_report", "article")])
            .unwrap();

        let config = test_config(Some("grader"));
        let registry = Arc::new(TaskRegistry::builtin());

        let (pool, _backend) = judge_pool("{\"score\": 0.9}");
        run_judging(&config, Arc::clone(&manager), &pool, Arc::clone(&registry), &CancellationToken::new(), false)
            .await
            .unwrap();

        let (pool2, backend2) = judge_pool("{\"score\": 0.2}");
        let counts = run_judging(&config, Arc::clone(&manager), &pool2, registry, &CancellationToken::new(), true)
            .await
            .unwrap();

        assert_eq!(counts.scored, 1);
        assert_eq!(counts.skipped, 0);
        assert_eq!(backend2.call_count(), 1);
        // Still exactly one record per sample, now holding the new verdict.
        let scores = manager.load_scores(false).unwrap();
        assert_eq!(scores.len(), 1);
        assert_eq!(scores["news/1k_0"].verdict, Some(Verdict::Score(0.2)));
    }

    #[tokio::test]
    async fn test_verifier_path_skips_judge_backend() {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(CheckpointManager::new(dir.path()));
        let output = r#"{"XXXXX": "aaaaa", "ABCDE": "v1234", "YYYYY": "bbbbb"}"#;
        manager
            .samples()
            .merge(&[completed_record("kv_dictionary/1k_0", "kv_dictionary", output)])
            .unwrap();

        let config = test_config(None); // no judge backend configured at all
        let pool = BackendPool::new();
        let registry = Arc::new(TaskRegistry::builtin());

        let counts = run_judging(
            &config,
            Arc::clone(&manager),
            &pool,
            registry,
            &CancellationToken::new(),
            false,
        )
        .await
        .unwrap();

        assert_eq!(counts.scored, 1);
        let scores = manager.load_scores(false).unwrap();
        let score = &scores["kv_dictionary/1k_0"];
        assert_eq!(score.judge, "verifier");
        assert!(score.verdict.as_ref().unwrap().as_score().unwrap() > 0.9);
    }

    #[tokio::test]
    async fn test_unverifiable_task_without_judge_is_config_error() {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(CheckpointManager::new(dir.path()));
        manager
            .samples()
            .merge(&[completed_record("news/1k_0", "news_report", "article")])
            .unwrap();

        let config = test_config(None);
        let pool = BackendPool::new();
        let registry = Arc::new(TaskRegistry::builtin());

        let result = run_judging(
            &config,
            manager,
            &pool,
            registry,
            &CancellationToken::new(),
            false,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_only_completed_samples_are_judged() {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(CheckpointManager::new(dir.path()));
        let mut failed = completed_record("news/1k_1", "news_report", "x");
        failed.state = SampleState::Failed { reason: "timeout".into() };
        failed.output = None;
        manager
            .samples()
            .merge(&[completed_record("news/1k_0", "news_report", "article"), failed])
            .unwrap();

        let config = test_config(Some("grader"));
        let (pool, backend) = judge_pool("{\"score\": 0.5}");
        let registry = Arc::new(TaskRegistry::builtin());

        run_judging(&config, Arc::clone(&manager), &pool, registry, &CancellationToken::new(), false)
            .await
            .unwrap();
        assert_eq!(backend.call_count(), 1);
        let scores = manager.load_scores(false).unwrap();
        assert!(scores.contains_key("news/1k_0"));
        assert!(!scores.contains_key("news/1k_1"));
    }
}
