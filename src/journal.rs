use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::config::AppConfig;
use crate::errors::AppResult;

const JOURNAL_FILE: &str = "activity-journal.jsonl";

/// Append-only log of what the importer did and what the server pushed back:
/// task submissions, retries, cancels, channel lifecycle, server notices.
/// Entries queue in memory and land on disk in batches.
#[derive(Clone)]
pub struct ActivityJournal {
    enabled: bool,
    queue: Arc<Mutex<Vec<JournalEntry>>>,
    journal_path: PathBuf,
    batch_size: usize,
    max_file_bytes: u64,
    max_file_count: usize,
}

#[derive(Debug, Serialize)]
pub struct JournalEntry {
    pub kind: String,
    pub at: DateTime<Utc>,
    pub details: serde_json::Value,
}

impl JournalEntry {
    fn new(kind: String, details: serde_json::Value) -> Self {
        Self {
            kind,
            at: Utc::now(),
            details,
        }
    }
}

impl ActivityJournal {
    pub fn new<P: AsRef<Path>>(data_dir: P, config: &AppConfig) -> AppResult<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)?;
        let journal_path = data_dir.join(JOURNAL_FILE);
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal_path)?;

        Ok(Self {
            enabled: config.journal_enabled,
            queue: Arc::new(Mutex::new(Vec::new())),
            journal_path,
            batch_size: config.journal_batch_size,
            max_file_bytes: config.journal_max_bytes,
            max_file_count: config.journal_max_files,
        })
    }

    pub fn record(&self, kind: impl Into<String>, details: serde_json::Value) -> AppResult<()> {
        if !self.enabled {
            return Ok(());
        }

        let mut queue = self.queue.lock();
        queue.push(JournalEntry::new(kind.into(), details));
        if queue.len() >= self.batch_size {
            self.persist_locked(&mut queue)?;
        }
        Ok(())
    }

    /// Like [`record`](Self::record) but never fails the caller; journaling
    /// is observability, not control flow.
    pub fn note(&self, kind: &str, details: serde_json::Value) {
        if let Err(err) = self.record(kind, details) {
            warn!(target: "activity_journal", kind, ?err, "dropping journal entry");
        }
    }

    pub fn flush(&self) -> AppResult<()> {
        let mut queue = self.queue.lock();
        self.persist_locked(&mut queue)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn path(&self) -> &Path {
        &self.journal_path
    }

    fn persist_locked(&self, queue: &mut Vec<JournalEntry>) -> AppResult<()> {
        if queue.is_empty() {
            return Ok(());
        }

        let mut encoded = Vec::with_capacity(queue.len());
        let mut incoming_bytes = 0_u64;
        for entry in queue.iter() {
            let line = serde_json::to_vec(entry)?;
            incoming_bytes += (line.len() + 1) as u64;
            encoded.push(line);
        }

        self.rotate_if_needed(incoming_bytes)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal_path)?;
        for line in &encoded {
            file.write_all(line)?;
            file.write_all(b"\n")?;
        }
        file.flush()?;

        queue.clear();
        Ok(())
    }

    fn rotate_if_needed(&self, incoming_bytes: u64) -> AppResult<()> {
        let current_size = fs::metadata(&self.journal_path)
            .map(|m| m.len())
            .unwrap_or(0);
        if current_size + incoming_bytes <= self.max_file_bytes {
            return Ok(());
        }

        if self.max_file_count <= 1 {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.journal_path)?;
            return Ok(());
        }

        let rotated_name = format!(
            "{}-{}.jsonl",
            self.journal_stem(),
            Utc::now().format("%Y%m%d%H%M%S")
        );
        let rotated_path = self
            .journal_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(rotated_name);

        if self.journal_path.exists() {
            fs::rename(&self.journal_path, &rotated_path)?;
        }

        self.prune_rotations()?;
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.journal_path)?;
        Ok(())
    }

    fn prune_rotations(&self) -> AppResult<()> {
        let parent = self.journal_path.parent().unwrap_or_else(|| Path::new("."));
        let prefix = format!("{}-", self.journal_stem());
        let mut rotations = fs::read_dir(parent)?
            .filter_map(|entry| {
                entry.ok().and_then(|dir_entry| {
                    let name = dir_entry.file_name();
                    let name = name.to_string_lossy();
                    if name.starts_with(&prefix) && name.ends_with(".jsonl") {
                        Some((
                            dir_entry.path(),
                            dir_entry.metadata().ok()?.modified().ok()?,
                        ))
                    } else {
                        None
                    }
                })
            })
            .collect::<Vec<_>>();

        rotations.sort_by_key(|(_, modified)| *modified);
        let allowed = self.max_file_count.saturating_sub(1);
        if rotations.len() > allowed {
            let excess = rotations.len() - allowed;
            for (path, _) in rotations.into_iter().take(excess) {
                let _ = fs::remove_file(path);
            }
        }
        Ok(())
    }

    fn journal_stem(&self) -> String {
        self.journal_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "activity-journal".into())
    }
}
