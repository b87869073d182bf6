//! The atomic document store: the whole report collection as one
//! versioned snapshot.
//!
//! Readers clone an `Arc` and never block on a writer; `commit()` is the
//! only write path and serializes every writer class (worker and admin)
//! behind one mutex. Publish is write-to-temp then atomic rename, so a
//! concurrent reader sees the fully-old or fully-new snapshot, never a mix.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::{
    AttachmentRef, QueueId, Report, ReportId, ReportStatus, SubmissionPayload, normalize_identity,
};
use crate::queue::write_durable;

/// The report collection, keyed by normalized identity so the
/// one-report-per-identity invariant holds by construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportCollection {
    /// Bumped on every commit. A snapshot is immutable once published.
    pub version: u64,
    pub reports: BTreeMap<String, Report>,
}

impl ReportCollection {
    pub fn get(&self, identity_key: &str) -> Option<&Report> {
        self.reports.get(identity_key)
    }

    /// Find a report by id, or by unambiguous id prefix.
    pub fn find_by_id(&self, id_or_prefix: &str) -> Result<&Report> {
        let id_or_prefix = id_or_prefix.trim();
        if id_or_prefix.is_empty() {
            return Err(Error::Other("report id must be non-empty".to_string()));
        }
        let matches: Vec<&Report> = self
            .reports
            .values()
            .filter(|r| r.id.0.to_string().starts_with(id_or_prefix))
            .collect();
        match matches.len() {
            0 => Err(Error::NotFound(id_or_prefix.to_string())),
            1 => Ok(matches[0]),
            n => Err(Error::Other(format!(
                "{n} reports match prefix '{id_or_prefix}'"
            ))),
        }
    }
}

/// What a commit did with an entry.
#[derive(Debug, Clone)]
pub enum CommitOutcome {
    /// First submission for this identity: a new report.
    Created(Report),
    /// Merged into the existing report for this identity.
    Merged(Report),
    /// The entry was already applied in an earlier run. No-op.
    AlreadyApplied(Report),
}

impl CommitOutcome {
    pub fn report(&self) -> &Report {
        match self {
            CommitOutcome::Created(r)
            | CommitOutcome::Merged(r)
            | CommitOutcome::AlreadyApplied(r) => r,
        }
    }
}

/// Single-writer, multi-reader store for the report collection.
pub struct DocumentStore {
    path: PathBuf,
    snapshot: RwLock<Arc<ReportCollection>>,
    /// Mutual exclusion for commit(). The worker's single-consumer
    /// discipline already serializes its own writes; this guard extends
    /// the invariant to the admin writer class.
    writer: Mutex<()>,
}

impl DocumentStore {
    /// Open the store at `path`, loading the published snapshot if one
    /// exists. A corrupt snapshot is an error, not a silent empty boot.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let collection = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| Error::Other(format!("corrupt snapshot {}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ReportCollection::default(),
            Err(e) => return Err(e.into()),
        };

        debug!(path = %path.display(), version = collection.version, "document store opened");
        Ok(Self {
            path,
            snapshot: RwLock::new(Arc::new(collection)),
            writer: Mutex::new(()),
        })
    }

    /// The current published snapshot. Never blocks on a commit and never
    /// observes one mid-write.
    pub async fn read(&self) -> Arc<ReportCollection> {
        Arc::clone(&*self.snapshot.read().await)
    }

    /// The only write path. Loads the latest snapshot, applies `mutator`,
    /// publishes the result atomically, then swaps the in-memory pointer.
    ///
    /// If the underlying write fails partway, the previous snapshot stays
    /// published and the failure is reported as transient.
    pub async fn commit<T, F>(&self, mutator: F) -> Result<T>
    where
        F: FnOnce(&mut ReportCollection) -> Result<T>,
    {
        let _guard = self.writer.lock().await;

        let mut next = (*self.read().await).clone();
        let out = mutator(&mut next)?;
        next.version += 1;

        let published = Arc::new(next);
        let bytes = serde_json::to_vec_pretty(&*published)?;
        write_durable(&self.path, &bytes)
            .await
            .map_err(|e| Error::Transient(format!("publish snapshot: {e}")))?;

        *self.snapshot.write().await = published;
        Ok(out)
    }

    /// Commit one validated queue entry: insert a new report or merge
    /// into the existing one for the same identity.
    ///
    /// Idempotent: an entry already recorded in the report's merge
    /// history commits as a no-op, so re-processing after a crash between
    /// commit and retirement cannot double-apply.
    pub async fn apply_entry(
        &self,
        queue_id: &QueueId,
        payload: &SubmissionPayload,
        attachments: Vec<AttachmentRef>,
        now: DateTime<Utc>,
    ) -> Result<CommitOutcome> {
        // An entry already in the report's merge history commits as a
        // no-op: nothing to publish, version unchanged.
        let identity_key = normalize_identity(&payload.subject);
        if let Some(report) = self.read().await.get(&identity_key) {
            if report.applied_entries.contains(queue_id) {
                let report = report.clone();
                debug!(report_id = %report.id, %queue_id, "entry already applied, no-op commit");
                return Ok(CommitOutcome::AlreadyApplied(report));
            }
        }

        let outcome = self
            .commit(|collection| {
                Ok(insert_or_merge(
                    collection, queue_id, payload, attachments, now,
                ))
            })
            .await?;

        match &outcome {
            CommitOutcome::Created(r) => {
                info!(report_id = %r.id, identity_key = %r.identity_key, "report created")
            }
            CommitOutcome::Merged(r) => {
                info!(report_id = %r.id, identity_key = %r.identity_key, "report merged")
            }
            CommitOutcome::AlreadyApplied(_) => {}
        }
        Ok(outcome)
    }

    /// Admin mutation: change a report's status. Routed through the same
    /// commit() serialization point as the worker.
    pub async fn set_status(&self, id_or_prefix: &str, status: ReportStatus) -> Result<Report> {
        self.commit(|collection| {
            let key = collection.find_by_id(id_or_prefix)?.identity_key.clone();
            let report = collection
                .reports
                .get_mut(&key)
                .ok_or_else(|| Error::NotFound(id_or_prefix.to_string()))?;
            report.status = status;
            Ok(report.clone())
        })
        .await
    }
}

fn insert_or_merge(
    collection: &mut ReportCollection,
    queue_id: &QueueId,
    payload: &SubmissionPayload,
    attachments: Vec<AttachmentRef>,
    now: DateTime<Utc>,
) -> CommitOutcome {
    let identity_key = normalize_identity(&payload.subject);

    let Some(report) = collection.reports.get_mut(&identity_key) else {
        let report = Report {
            id: ReportId::new(),
            identity_key: identity_key.clone(),
            subject: payload.subject.trim().to_string(),
            fields: payload
                .fields
                .iter()
                .filter(|(_, v)| !v.trim().is_empty())
                .map(|(k, v)| (k.clone(), v.trim().to_string()))
                .collect(),
            attachments,
            status: ReportStatus::New,
            first_seen_at: now,
            last_seen_at: now,
            applied_entries: vec![queue_id.clone()],
        };
        collection.reports.insert(identity_key, report.clone());
        return CommitOutcome::Created(report);
    };

    if report.applied_entries.contains(queue_id) {
        return CommitOutcome::AlreadyApplied(report.clone());
    }

    // Fill gaps only: a field already carrying a non-empty value is never
    // overwritten by a later submission.
    for (key, value) in &payload.fields {
        if value.trim().is_empty() {
            continue;
        }
        let absent = report.fields.get(key).is_none_or(|cur| cur.trim().is_empty());
        if absent {
            report.fields.insert(key.clone(), value.trim().to_string());
        }
    }

    report.attachments.extend(attachments);
    report.last_seen_at = now;
    report.applied_entries.push(queue_id.clone());

    CommitOutcome::Merged(report.clone())
}
