//! The queue directory: a durable, ordered holding area for submissions.
//!
//! One immutable JSON file per entry under `queue/`, named by queue id so
//! lexical order equals arrival order. Producers only ever append; the
//! worker consumes each entry exactly once and retires it into `archived/`
//! or `parked/`, where it is retained for audit.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::{EntryState, QueueEntry, QueueId, ReportId, SubmissionPayload};

const QUEUE_DIR: &str = "queue";
const ARCHIVED_DIR: &str = "archived";
const PARKED_DIR: &str = "parked";

/// What discovery found at the head of the queue.
#[derive(Debug)]
pub enum Discovered {
    /// The oldest entry whose backoff (if any) has elapsed.
    Ready(QueueEntry),
    /// A file in the queue directory that no longer parses. The worker
    /// parks it so it stops blocking the line.
    Corrupt {
        queue_id: QueueId,
        raw: String,
        error: String,
    },
}

/// Terminal annotation stored with a retired entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TerminalOutcome {
    Committed {
        committed_at: DateTime<Utc>,
        report_id: ReportId,
    },
    Parked {
        parked_at: DateTime<Utc>,
        error: String,
        attempts: u32,
    },
}

/// A retired entry as retained in `archived/` or `parked/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetiredEntry {
    pub queue_id: QueueId,
    #[serde(flatten)]
    pub outcome: TerminalOutcome,
    /// The original entry. None when the source file was unparseable;
    /// `raw` then carries the original bytes instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<QueueEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

/// The on-disk queue. Append-only from producers, consume-once from the
/// worker.
pub struct QueueDir {
    root: PathBuf,
}

impl QueueDir {
    /// Open (and create if needed) the queue layout under `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for sub in [QUEUE_DIR, ARCHIVED_DIR, PARKED_DIR] {
            tokio::fs::create_dir_all(root.join(sub)).await?;
        }
        Ok(Self { root })
    }

    /// Durably persist a submission and return its queue id.
    ///
    /// If this returns Ok, the entry survives a crash of the accepting
    /// process. If it returns Err, nothing is visible to the worker.
    pub async fn enqueue(&self, payload: SubmissionPayload) -> Result<QueueId> {
        if payload.subject.trim().is_empty() {
            return Err(Error::Structural(
                "submission subject must be non-empty".to_string(),
            ));
        }

        let now = Utc::now();
        let queue_id = QueueId::generate(now);
        let entry = QueueEntry {
            queue_id: queue_id.clone(),
            enqueued_at: now,
            attempt: 0,
            not_before: None,
            payload: serde_json::to_value(&payload)
                .map_err(|e| Error::Durability(format!("encode entry: {e}")))?,
        };

        let bytes = serde_json::to_vec_pretty(&entry)
            .map_err(|e| Error::Durability(format!("encode entry: {e}")))?;
        write_durable(&self.entry_path(&queue_id), &bytes)
            .await
            .map_err(|e| Error::Durability(format!("persist entry {queue_id}: {e}")))?;

        info!(%queue_id, subject = %payload.subject, "submission enqueued");
        Ok(queue_id)
    }

    /// Find the oldest entry ready for processing at `now`.
    ///
    /// Entries mid-backoff are skipped rather than blocking the line; an
    /// unparseable file is surfaced immediately so the worker can park it.
    pub async fn next_ready(&self, now: DateTime<Utc>) -> Result<Option<Discovered>> {
        for (queue_id, path) in self.pending_files().await? {
            let raw = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<QueueEntry>(&raw) {
                Ok(entry) => {
                    if entry.not_before.is_some_and(|t| t > now) {
                        continue;
                    }
                    return Ok(Some(Discovered::Ready(entry)));
                }
                Err(e) => {
                    return Ok(Some(Discovered::Corrupt {
                        queue_id,
                        raw,
                        error: e.to_string(),
                    }));
                }
            }
        }
        Ok(None)
    }

    /// All pending entries in arrival order, including those mid-backoff.
    /// Unparseable files are skipped here; discovery surfaces them.
    pub async fn list_pending(&self) -> Result<Vec<QueueEntry>> {
        let mut entries = Vec::new();
        for (_, path) in self.pending_files().await? {
            let raw = tokio::fs::read_to_string(&path).await?;
            if let Ok(entry) = serde_json::from_str::<QueueEntry>(&raw) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Rewrite an entry after a transient failure: bump the attempt
    /// counter and gate discovery until `not_before`.
    pub async fn defer(
        &self,
        entry: &QueueEntry,
        attempt: u32,
        not_before: DateTime<Utc>,
    ) -> Result<()> {
        let deferred = QueueEntry {
            attempt,
            not_before: Some(not_before),
            ..entry.clone()
        };
        let bytes = serde_json::to_vec_pretty(&deferred)?;
        write_durable(&self.entry_path(&entry.queue_id), &bytes)
            .await
            .map_err(|e| Error::Transient(format!("defer entry {}: {e}", entry.queue_id)))?;
        debug!(queue_id = %entry.queue_id, attempt, %not_before, "entry deferred");
        Ok(())
    }

    /// Retire a committed entry into `archived/`.
    pub async fn archive(
        &self,
        entry: &QueueEntry,
        report_id: ReportId,
        committed_at: DateTime<Utc>,
    ) -> Result<()> {
        let retired = RetiredEntry {
            queue_id: entry.queue_id.clone(),
            outcome: TerminalOutcome::Committed {
                committed_at,
                report_id,
            },
            entry: Some(entry.clone()),
            raw: None,
        };
        self.retire(&entry.queue_id, EntryState::Committed, &retired)
            .await
    }

    /// Park an entry in `parked/` as a permanent failure.
    pub async fn park(&self, entry: &QueueEntry, error: &str) -> Result<()> {
        let retired = RetiredEntry {
            queue_id: entry.queue_id.clone(),
            outcome: TerminalOutcome::Parked {
                parked_at: Utc::now(),
                error: error.to_string(),
                attempts: entry.attempt,
            },
            entry: Some(entry.clone()),
            raw: None,
        };
        self.retire(&entry.queue_id, EntryState::ParkedError, &retired)
            .await
    }

    /// Park a queue file whose contents no longer parse, retaining the
    /// original bytes for inspection.
    pub async fn park_raw(&self, queue_id: &QueueId, raw: String, error: &str) -> Result<()> {
        let retired = RetiredEntry {
            queue_id: queue_id.clone(),
            outcome: TerminalOutcome::Parked {
                parked_at: Utc::now(),
                error: error.to_string(),
                attempts: 0,
            },
            entry: None,
            raw: Some(raw),
        };
        self.retire(queue_id, EntryState::ParkedError, &retired).await
    }

    /// Entries retired after a successful commit.
    pub async fn list_archived(&self) -> Result<Vec<RetiredEntry>> {
        self.list_retired(ARCHIVED_DIR).await
    }

    /// Entries parked for operator inspection.
    pub async fn list_parked(&self) -> Result<Vec<RetiredEntry>> {
        self.list_retired(PARKED_DIR).await
    }

    fn entry_path(&self, queue_id: &QueueId) -> PathBuf {
        self.root.join(QUEUE_DIR).join(format!("{queue_id}.json"))
    }

    /// Queue files in lexical (= arrival) order. Temp files and stray
    /// names are filtered out by the id shape check.
    async fn pending_files(&self) -> Result<Vec<(QueueId, PathBuf)>> {
        let mut files = Vec::new();
        let mut dir = tokio::fs::read_dir(self.root.join(QUEUE_DIR)).await?;
        while let Some(dirent) = dir.next_entry().await? {
            let path = dirent.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(queue_id) = QueueId::parse(stem) {
                files.push((queue_id, path));
            }
        }
        files.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(files)
    }

    /// Move an entry out of the queue into its terminal location. The
    /// annotation is written first, then the queue file is removed, so a
    /// crash in between leaves both copies rather than neither.
    async fn retire(
        &self,
        queue_id: &QueueId,
        state: EntryState,
        retired: &RetiredEntry,
    ) -> Result<()> {
        debug_assert!(state.is_terminal());
        let dir = match state {
            EntryState::Committed => ARCHIVED_DIR,
            _ => PARKED_DIR,
        };
        let bytes = serde_json::to_vec_pretty(retired)?;
        let dest = self.root.join(dir).join(format!("{queue_id}.json"));
        write_durable(&dest, &bytes)
            .await
            .map_err(|e| Error::Transient(format!("retire entry {queue_id}: {e}")))?;
        tokio::fs::remove_file(self.entry_path(queue_id)).await?;
        info!(%queue_id, state = %state, "entry retired");
        Ok(())
    }

    async fn list_retired(&self, dir: &str) -> Result<Vec<RetiredEntry>> {
        let mut retired = Vec::new();
        let mut read = tokio::fs::read_dir(self.root.join(dir)).await?;
        while let Some(dirent) = read.next_entry().await? {
            let path = dirent.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let raw = tokio::fs::read_to_string(&path).await?;
            if let Ok(entry) = serde_json::from_str::<RetiredEntry>(&raw) {
                retired.push(entry);
            }
        }
        retired.sort_by(|a, b| a.queue_id.cmp(&b.queue_id));
        Ok(retired)
    }
}

/// Write bytes so that the destination is either fully present or absent:
/// temp file in the same directory, fsync, atomic rename.
pub(crate) async fn write_durable(dest: &Path, bytes: &[u8]) -> Result<()> {
    let temp = dest.with_extension("tmp");
    let mut file = tokio::fs::File::create(&temp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&temp, dest).await?;
    Ok(())
}
