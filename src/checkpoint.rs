//! Durable checkpointing for evaluation runs
//!
//! Progress is persisted as one JSONL snapshot per keyspace plus an
//! append-only side log: every state transition is appended (and flushed)
//! before the in-memory state advances, so a crash loses at most the single
//! in-progress transition. After a clean pass the side log is merged into
//! the snapshot with an atomic rewrite and removed. The merged view of
//! snapshot + log (log wins) is the authoritative state on load.
//!
//! Inference (`samples`) and judging (`scores`) use independent keyspaces in
//! the same run directory, so the two passes resume independently.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::sample::{RunManifest, SampleRecord, SampleState, ScoreRecord};

/// Records addressable by sample identifier.
pub trait Keyed {
    fn key(&self) -> &str;
}

impl Keyed for SampleRecord {
    fn key(&self) -> &str {
        self.sample_id()
    }
}

impl Keyed for ScoreRecord {
    fn key(&self) -> &str {
        &self.sample_id
    }
}

/// Write bytes to a path atomically: temp file, flush to disk, rename,
/// then sync the parent directory so the rename itself is durable.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}", name, std::process::id()));
    let mut file = File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// One checkpoint keyspace: `<name>.jsonl` snapshot + `<name>.log.jsonl`
/// append log in a run directory.
pub struct CheckpointFile<T> {
    snapshot_path: PathBuf,
    log_path: PathBuf,
    /// Serializes appends so concurrent workers never interleave lines
    append_lock: std::sync::Mutex<()>,
    _marker: std::marker::PhantomData<T>,
}

impl<T> CheckpointFile<T>
where
    T: Serialize + DeserializeOwned + Keyed,
{
    pub fn new(run_dir: &Path, name: &str) -> Self {
        Self {
            snapshot_path: run_dir.join(format!("{}.jsonl", name)),
            log_path: run_dir.join(format!("{}.log.jsonl", name)),
            append_lock: std::sync::Mutex::new(()),
            _marker: std::marker::PhantomData,
        }
    }

    /// Whether any durable state exists for this keyspace.
    pub fn exists(&self) -> bool {
        self.snapshot_path.exists() || self.log_path.exists()
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Append one record to the side log and flush it to disk before
    /// returning. Failure here is a persistence error: callers must not
    /// advance in-memory state past an unpersisted transition.
    pub fn append(&self, record: &T) -> Result<()> {
        if let Some(parent) = self.log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let _guard = self.append_lock.lock().unwrap();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .with_context(|| format!("Failed to open checkpoint log {:?}", self.log_path))?;
        file.write_all(&line)?;
        file.sync_data()
            .with_context(|| format!("Failed to sync checkpoint log {:?}", self.log_path))?;
        Ok(())
    }

    /// Load the merged view: snapshot first, then the side log, with later
    /// entries for a key replacing earlier ones. Unparseable lines (e.g. a
    /// torn tail write from a crash) are skipped with a warning.
    pub fn load(&self) -> Result<Vec<T>> {
        let mut merged: BTreeMap<String, T> = BTreeMap::new();
        for path in [&self.snapshot_path, &self.log_path] {
            if !path.exists() {
                continue;
            }
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read checkpoint {:?}", path))?;
            for (num, line) in content.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<T>(line) {
                    Ok(record) => {
                        merged.insert(record.key().to_string(), record);
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Skipping invalid checkpoint line {}:{}: {}",
                            path.display(),
                            num + 1,
                            e
                        );
                    }
                }
            }
        }
        Ok(merged.into_values().collect())
    }

    /// Rewrite the snapshot from the given records and drop the side log.
    /// The rewrite is atomic; the log is only removed once the new snapshot
    /// is durable, so a crash mid-merge never loses transitions.
    pub fn merge(&self, records: &[T]) -> Result<()> {
        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }
        atomic_write_bytes(&self.snapshot_path, &buf)
            .with_context(|| format!("Failed to rewrite snapshot {:?}", self.snapshot_path))?;
        if self.log_path.exists() {
            fs::remove_file(&self.log_path)
                .with_context(|| format!("Failed to remove merged log {:?}", self.log_path))?;
        }
        Ok(())
    }
}

/// Checkpoint manager for one run directory.
pub struct CheckpointManager {
    run_dir: PathBuf,
    samples: CheckpointFile<SampleRecord>,
    scores: CheckpointFile<ScoreRecord>,
}

impl CheckpointManager {
    pub fn new(run_dir: &Path) -> Self {
        Self {
            run_dir: run_dir.to_path_buf(),
            samples: CheckpointFile::new(run_dir, "samples"),
            scores: CheckpointFile::new(run_dir, "scores"),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn samples(&self) -> &CheckpointFile<SampleRecord> {
        &self.samples
    }

    pub fn scores(&self) -> &CheckpointFile<ScoreRecord> {
        &self.scores
    }

    /// Write the run manifest. Only done once, when the run directory is
    /// first populated.
    pub fn write_manifest(&self, manifest: &RunManifest) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(manifest)?;
        atomic_write_bytes(&self.run_dir.join("manifest.json"), &bytes)
    }

    /// Load sample records for scheduling. Records left InFlight by an
    /// interrupted run are stale claims and revert to Pending; Completed and
    /// Failed records are untouched unless `retry_failed` re-opens failures.
    pub fn load_samples(&self, retry_failed: bool) -> Result<Vec<SampleRecord>> {
        let mut records = self.samples.load()?;
        let mut reverted = 0usize;
        let mut reopened = 0usize;
        for record in &mut records {
            match record.state {
                SampleState::InFlight => {
                    record.state = SampleState::Pending;
                    reverted += 1;
                }
                SampleState::Failed { .. } if retry_failed => {
                    record.state = SampleState::Pending;
                    record.output = None;
                    record.last_error = None;
                    reopened += 1;
                }
                _ => {}
            }
        }
        if reverted > 0 {
            tracing::info!("Reverted {} stale in-flight samples to pending", reverted);
        }
        if reopened > 0 {
            tracing::info!("Re-opened {} failed samples (retry_failed)", reopened);
        }
        Ok(records)
    }

    /// Load score records keyed by sample id. With `retry_failed`, records
    /// that only hold a judge error are dropped so judging re-claims them.
    pub fn load_scores(&self, retry_failed: bool) -> Result<BTreeMap<String, ScoreRecord>> {
        let mut scores = BTreeMap::new();
        for record in self.scores.load()? {
            if retry_failed && !record.is_usable() {
                continue;
            }
            scores.insert(record.sample_id.clone(), record);
        }
        Ok(scores)
    }
}
