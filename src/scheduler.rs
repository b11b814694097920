//! Concurrent dispatch engine and inference pass
//!
//! The engine drives a fixed-size worker pool over a claimable queue:
//! each worker loops claim -> process -> commit until the queue drains or
//! the run is cancelled. The same engine powers both the inference pass
//! (this module) and the judging pass, which differ only in what a unit of
//! work is and where its result lands.
//!
//! Interruption contract: once the cancellation token fires, no new claims
//! are made, in-flight backend calls return within one timeout interval,
//! and every claimed-but-unfinished sample is reverted to Pending before
//! the engine returns. A persistence failure aborts the pass instead of
//! letting in-memory state run ahead of durable state.

use anyhow::Result;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::backends::pool::{BackendHandle, BackendPool};
use crate::backends::traits::GenerateRequest;
use crate::checkpoint::CheckpointManager;
use crate::config::{EvalConfig, GenerationConfig};
use crate::sample::{SampleRecord, SampleState};
use crate::store::{SampleStore, StateCounts, Transition};

/// Result of processing one claimed unit.
pub enum Processed<T> {
    Done(T),
    /// Cut short by cancellation before reaching a terminal outcome
    Interrupted,
}

/// A claimable work queue the dispatch engine can drive.
///
/// `claim` must be atomic: no two workers may ever receive the same unit.
/// `commit` must persist the outcome before advancing any in-memory state;
/// an error from it (or from `on_claimed`/`revert`) is a persistence
/// failure and aborts the pass. `revert` must be safe to repeat.
#[async_trait::async_trait]
pub trait DispatchQueue: Send + Sync {
    type Item: Send + Sync;
    type Outcome: Send;

    fn claim(&self) -> Option<Self::Item>;

    /// Durably mark a fresh claim before any network call is made.
    fn on_claimed(&self, _item: &Self::Item) -> Result<()> {
        Ok(())
    }

    async fn process(&self, item: &Self::Item, cancel: &CancellationToken)
        -> Processed<Self::Outcome>;

    fn commit(&self, item: &Self::Item, outcome: Self::Outcome) -> Result<()>;

    fn revert(&self, item: &Self::Item) -> Result<()>;
}

/// Totals for one engine run.
#[derive(Debug, Clone, Copy, Default)]
pub struct DriveStats {
    /// Units that reached a committed outcome
    pub processed: usize,
    /// Units claimed but reverted due to cancellation
    pub interrupted: usize,
}

/// Drive `worker_count` workers over the queue until it drains or the token
/// fires. Returns the first persistence error, after all workers have
/// stopped; the token is cancelled on such an error so the other workers
/// drain promptly.
pub async fn drive<Q>(
    queue: Arc<Q>,
    worker_count: usize,
    cancel: &CancellationToken,
) -> Result<DriveStats>
where
    Q: DispatchQueue + 'static,
{
    let mut join_set = JoinSet::new();
    for worker_id in 0..worker_count.max(1) {
        let queue = Arc::clone(&queue);
        let cancel = cancel.clone();
        join_set.spawn(async move { worker_loop(queue, cancel, worker_id).await });
    }

    let mut stats = DriveStats::default();
    let mut first_error = None;
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(Ok((processed, interrupted))) => {
                stats.processed += processed;
                stats.interrupted += interrupted;
            }
            Ok(Err(e)) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(anyhow::anyhow!("Worker panicked: {}", e));
                }
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(stats),
    }
}

async fn worker_loop<Q>(
    queue: Arc<Q>,
    cancel: CancellationToken,
    worker_id: usize,
) -> Result<(usize, usize)>
where
    Q: DispatchQueue,
{
    let mut processed = 0usize;
    let mut interrupted = 0usize;
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let Some(item) = queue.claim() else {
            break;
        };
        if let Err(e) = queue.on_claimed(&item) {
            let _ = queue.revert(&item);
            cancel.cancel();
            return Err(e);
        }
        match queue.process(&item, &cancel).await {
            Processed::Done(outcome) => {
                if let Err(e) = queue.commit(&item, outcome) {
                    cancel.cancel();
                    return Err(e);
                }
                processed += 1;
            }
            Processed::Interrupted => {
                if let Err(e) = queue.revert(&item) {
                    cancel.cancel();
                    return Err(e);
                }
                interrupted += 1;
            }
        }
    }
    tracing::debug!(worker_id, processed, interrupted, "Worker finished");
    Ok((processed, interrupted))
}

/// Inference pass: claims Pending samples, calls the model under
/// evaluation, and commits Completed/Failed transitions through the
/// checkpoint manager.
pub struct InferencePass {
    store: Arc<SampleStore>,
    manager: Arc<CheckpointManager>,
    backend: BackendHandle,
    generation: GenerationConfig,
}

impl InferencePass {
    fn request_for(&self, record: &SampleRecord) -> GenerateRequest {
        GenerateRequest {
            system: Some("You are a helpful assistant.".to_string()),
            prompt: record.task.prompt.clone(),
            max_tokens: self.generation.max_tokens,
            temperature: self.generation.temperature,
            seed: self.generation.seed,
        }
    }

    /// Persist the updated record first, then advance the store. The store
    /// rejecting a transition after a successful append would mean two
    /// workers held the same claim, which `claim` rules out.
    fn commit_transition(&self, record: &SampleRecord, transition: Transition) -> Result<()> {
        let mut updated = record.clone();
        match &transition {
            Transition::Completed { output, attempts, secs } => {
                updated.state = SampleState::Completed;
                updated.output = Some(output.clone());
                updated.attempts = *attempts;
                updated.last_error = None;
                updated.inference_secs = Some(*secs);
            }
            Transition::Failed { reason, attempts, last_error, secs } => {
                updated.state = SampleState::Failed { reason: reason.clone() };
                updated.attempts = *attempts;
                updated.last_error = Some(last_error.clone());
                updated.inference_secs = Some(*secs);
            }
            Transition::RevertToPending => {
                updated.state = SampleState::Pending;
            }
        }
        self.manager.samples().append(&updated)?;
        self.store.apply(record.sample_id(), transition)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl DispatchQueue for InferencePass {
    type Item = SampleRecord;
    type Outcome = Transition;

    fn claim(&self) -> Option<SampleRecord> {
        self.store.claim_next()
    }

    fn on_claimed(&self, item: &SampleRecord) -> Result<()> {
        // The claimed copy already carries InFlight; persisting it means a
        // crash here is indistinguishable from a crash mid-call, and the
        // loader's stale-claim revert covers both.
        self.manager.samples().append(item)
    }

    async fn process(&self, item: &SampleRecord, cancel: &CancellationToken)
        -> Processed<Transition> {
        let request = self.request_for(item);
        let start = Instant::now();
        let result = self.backend.submit(&request, cancel).await;
        let secs = start.elapsed().as_secs_f64();

        match result {
            Ok(response) => Processed::Done(Transition::Completed {
                output: response.text,
                attempts: response.attempts,
                secs,
            }),
            Err(_) if cancel.is_cancelled() => Processed::Interrupted,
            Err(error) => {
                tracing::warn!(
                    sample_id = item.sample_id(),
                    kind = error.kind.name(),
                    attempts = error.attempts,
                    "Sample failed after exhausting retries"
                );
                Processed::Done(Transition::Failed {
                    reason: error.kind.name().to_string(),
                    attempts: error.attempts,
                    last_error: error.to_string(),
                    secs,
                })
            }
        }
    }

    fn commit(&self, item: &SampleRecord, outcome: Transition) -> Result<()> {
        self.commit_transition(item, outcome)
    }

    fn revert(&self, item: &SampleRecord) -> Result<()> {
        self.commit_transition(item, Transition::RevertToPending)
    }
}

/// Run the inference pass for a configured run: load-or-resume the sample
/// snapshot, drive the worker pool, and merge the side log back into the
/// snapshot once every claimed sample is settled.
pub async fn run_inference(
    config: &EvalConfig,
    manager: Arc<CheckpointManager>,
    pool: &BackendPool,
    cancel: &CancellationToken,
) -> Result<StateCounts> {
    let records = manager.load_samples(config.run.retry_failed)?;
    if records.is_empty() {
        anyhow::bail!(
            "No samples found in {:?}; generate the task set first",
            manager.run_dir()
        );
    }
    // Unknown backend ids fail here, before any sample is claimed.
    let backend = pool.handle(&config.run.model)?;
    let generation = config.backend(&config.run.model)?.generation.clone();

    let store = Arc::new(SampleStore::new(records));
    let before = store.counts();
    tracing::info!(
        total = before.total(),
        pending = before.pending,
        completed = before.completed,
        failed = before.failed,
        workers = config.run.worker_count,
        "Starting inference pass"
    );

    let pass = Arc::new(InferencePass {
        store: Arc::clone(&store),
        manager: Arc::clone(&manager),
        backend,
        generation,
    });
    let stats = drive(pass, config.run.worker_count, cancel).await?;

    // Merge after a clean drain or a graceful stop; both leave no record
    // InFlight, so the rewritten snapshot satisfies the post-stop invariant.
    let snapshot = store.snapshot();
    manager.samples().merge(&snapshot)?;

    let counts = store.counts();
    tracing::info!(
        processed = stats.processed,
        interrupted = stats.interrupted,
        completed = counts.completed,
        failed = counts.failed,
        pending = counts.pending,
        "Inference pass finished"
    );
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::mock_backend::{MockBackend, MockOutcome};
    use crate::backends::traits::{BackendErrorKind, ModelBackend};
    use crate::config::RetryConfig;
    use crate::sample::TaskInstance;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn records(n: usize) -> Vec<SampleRecord> {
        (0..n)
            .map(|i| {
                SampleRecord::new(TaskInstance {
                    sample_id: format!("kv_dictionary/1k_{}", i),
                    task_type: "kv_dictionary".to_string(),
                    target_length: "1k".to_string(),
                    prompt: format!("sample_{} payload", i),
                    ground_truth: serde_json::json!({}),
                })
            })
            .collect()
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff_ms: 1,
            backoff_multiplier: 1.0,
            max_backoff_ms: 1,
        }
    }

    fn pass_for(
        dir: &TempDir,
        backend: Arc<MockBackend>,
        retry: RetryConfig,
        n: usize,
    ) -> (Arc<InferencePass>, Arc<SampleStore>, Arc<CheckpointManager>, Arc<MockBackend>) {
        let manager = Arc::new(CheckpointManager::new(dir.path()));
        manager.samples().merge(&records(n)).unwrap();
        let store = Arc::new(SampleStore::new(manager.load_samples(false).unwrap()));
        let mut pool = BackendPool::new();
        pool.register(Arc::clone(&backend) as Arc<dyn ModelBackend>, retry, 8);
        let pass = Arc::new(InferencePass {
            store: Arc::clone(&store),
            manager: Arc::clone(&manager),
            backend: pool.handle(backend.id()).unwrap(),
            generation: Default::default(),
        });
        (pass, store, manager, backend)
    }

    #[tokio::test]
    async fn test_flaky_backend_all_samples_complete() {
        // 10 samples, 3 workers, backend fails its first 2 calls then
        // succeeds: everything completes and total calls stay in 10..=12.
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new("flaky").with_script([
            MockOutcome::Fail(BackendErrorKind::Unavailable),
            MockOutcome::Fail(BackendErrorKind::RateLimited),
        ]));
        let (pass, store, _manager, backend) = pass_for(&dir, backend, fast_retry(5), 10);

        let cancel = CancellationToken::new();
        let stats = drive(pass, 3, &cancel).await.unwrap();

        let counts = store.counts();
        assert_eq!(stats.processed, 10);
        assert_eq!(counts.completed, 10);
        assert_eq!(counts.failed, 0);
        let calls = backend.call_count();
        assert!((10..=12).contains(&calls), "calls was {}", calls);
    }

    #[tokio::test]
    async fn test_single_unavailable_sample_fails_alone() {
        // One poisoned sample with a 1-attempt ceiling fails terminally;
        // the other nine still reach Completed.
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(
            MockBackend::new("partial").with_poison("sample_3", BackendErrorKind::Unavailable),
        );
        let (pass, store, _manager, _backend) = pass_for(&dir, backend, fast_retry(1), 10);

        let cancel = CancellationToken::new();
        drive(pass, 4, &cancel).await.unwrap();

        let counts = store.counts();
        assert_eq!(counts.completed, 9);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.total(), 10);

        let failed: Vec<_> = store
            .snapshot()
            .into_iter()
            .filter(|r| matches!(r.state, SampleState::Failed { .. }))
            .collect();
        assert_eq!(failed[0].sample_id(), "kv_dictionary/1k_3");
        match &failed[0].state {
            SampleState::Failed { reason } => assert_eq!(reason, "unavailable"),
            _ => unreachable!(),
        }
        assert_eq!(failed[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_conservation_holds_at_every_point() {
        let dir = TempDir::new().unwrap();
        let backend =
            Arc::new(MockBackend::new("slow").with_delay(Duration::from_millis(5)));
        let (pass, store, _manager, _backend) = pass_for(&dir, backend, fast_retry(1), 8);

        let cancel = CancellationToken::new();
        let store_obs = Arc::clone(&store);
        let observer = tokio::spawn(async move {
            for _ in 0..20 {
                assert_eq!(store_obs.counts().total(), 8);
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });
        drive(pass, 3, &cancel).await.unwrap();
        observer.await.unwrap();
        assert_eq!(store.counts().total(), 8);
    }

    #[tokio::test]
    async fn test_cancellation_reverts_claims_and_leaves_no_in_flight() {
        let dir = TempDir::new().unwrap();
        let backend =
            Arc::new(MockBackend::new("slow").with_delay(Duration::from_millis(50)));
        let (pass, store, manager, _backend) = pass_for(&dir, backend, fast_retry(1), 10);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let stats = drive(pass, 3, &cancel).await.unwrap();

        let counts = store.counts();
        assert_eq!(counts.in_flight, 0, "no claim may outlive the stop");
        assert_eq!(counts.total(), 10);
        assert!(stats.interrupted > 0 || counts.completed + counts.pending == 10);

        // The durable view agrees: nothing is in flight after a clean stop.
        manager.samples().merge(&store.snapshot()).unwrap();
        let reloaded = manager.samples().load().unwrap();
        assert!(reloaded.iter().all(|r| r.state != SampleState::InFlight));
    }

    #[tokio::test]
    async fn test_resume_skips_terminal_records() {
        // First run is interrupted early; the resumed run must claim only
        // what is not yet terminal, any number of times over.
        let dir = TempDir::new().unwrap();
        let backend =
            Arc::new(MockBackend::new("slow").with_delay(Duration::from_millis(15)));
        let (pass, store, manager, backend) = pass_for(&dir, backend, fast_retry(1), 10);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            trigger.cancel();
        });
        drive(pass, 2, &cancel).await.unwrap();
        manager.samples().merge(&store.snapshot()).unwrap();

        let first_completed = store.counts().completed;
        assert!(first_completed < 10, "interrupt too late to be meaningful");
        let calls_before_resume = backend.call_count();

        // Resume with a fresh store built from the checkpoint.
        let resumed = manager.load_samples(false).unwrap();
        let store2 = Arc::new(SampleStore::new(resumed));
        assert_eq!(store2.counts().completed, first_completed);

        let mut pool = BackendPool::new();
        pool.register(Arc::clone(&backend) as Arc<dyn ModelBackend>, fast_retry(1), 8);
        let pass2 = Arc::new(InferencePass {
            store: Arc::clone(&store2),
            manager: Arc::clone(&manager),
            backend: pool.handle("slow").unwrap(),
            generation: Default::default(),
        });
        let stats = drive(pass2, 2, &CancellationToken::new()).await.unwrap();

        assert_eq!(stats.processed, 10 - first_completed);
        assert_eq!(store2.counts().completed, 10);
        // Terminal records were skipped, not re-executed.
        assert_eq!(
            backend.call_count() - calls_before_resume,
            (10 - first_completed) as u32
        );

        // Resuming again with everything terminal claims nothing at all,
        // however many times it is repeated.
        for _ in 0..3 {
            let store3 = Arc::new(SampleStore::new(manager.load_samples(false).unwrap()));
            let pass3 = Arc::new(InferencePass {
                store: Arc::clone(&store3),
                manager: Arc::clone(&manager),
                backend: pool.handle("slow").unwrap(),
                generation: Default::default(),
            });
            let stats = drive(pass3, 2, &CancellationToken::new()).await.unwrap();
            assert_eq!(stats.processed, 0);
            manager.samples().merge(&store3.snapshot()).unwrap();
        }
        assert_eq!(backend.call_count() - calls_before_resume, (10 - first_completed) as u32);
    }
}
