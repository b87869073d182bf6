//! The sequential worker: the single consumer of the queue directory and
//! the sole routine writer of the document store.
//!
//! One entry at a time, in arrival order. Each entry's failure is
//! isolated — recorded against that entry, never escaping the loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::event::ReportEvent;
use crate::hooks::{AttachmentStore, NotificationHook, resolve_attachment};
use crate::model::{EntryState, QueueEntry, SubmissionPayload};
use crate::queue::{Discovered, QueueDir};
use crate::store::{CommitOutcome, DocumentStore};

/// Tuning knobs for the worker loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between queue scans when nothing is ready.
    pub poll_interval: Duration,
    /// Transient-failure attempts before an entry is parked.
    pub max_retries: u32,
    /// First retry delay; doubles per attempt.
    pub backoff_base: Duration,
    /// Upper bound on the retry delay.
    pub backoff_cap: Duration,
    /// Bound on each attachment-store call.
    pub attachment_timeout: Duration,
    /// Bound on the store commit step.
    pub commit_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            max_retries: 5,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            attachment_timeout: Duration::from_secs(30),
            commit_timeout: Duration::from_secs(10),
        }
    }
}

impl WorkerConfig {
    /// Delay before the retry that follows `failed_attempt` (1-based):
    /// base × 2^(failed_attempt - 1), capped.
    pub fn backoff_delay(&self, failed_attempt: u32) -> Duration {
        let shift = failed_attempt.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(1 << shift).min(self.backoff_cap)
    }
}

/// The worker loop. Owns discovery, processing, and retirement.
#[derive(Clone)]
pub struct Worker {
    queue: Arc<QueueDir>,
    store: Arc<DocumentStore>,
    attachments: Arc<dyn AttachmentStore>,
    notifier: Arc<dyn NotificationHook>,
    config: WorkerConfig,
    shutdown: Arc<Notify>,
}

impl Worker {
    pub fn new(
        queue: Arc<QueueDir>,
        store: Arc<DocumentStore>,
        attachments: Arc<dyn AttachmentStore>,
        notifier: Arc<dyn NotificationHook>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            store,
            attachments,
            notifier,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Signal the worker to stop after the entry in flight.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run until shutdown: drain every ready entry, then sleep until the
    /// next poll.
    pub async fn run(&self) -> Result<()> {
        info!("worker started");
        loop {
            loop {
                match self.process_next().await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        error!("queue scan error: {e}");
                        break;
                    }
                }
            }

            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("worker shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Process at most one entry. Returns whether one was handled.
    ///
    /// Processing failures are recorded against the entry and do not
    /// surface here; only discovery itself can error.
    pub async fn process_next(&self) -> Result<bool> {
        match self.queue.next_ready(Utc::now()).await? {
            None => Ok(false),
            Some(Discovered::Corrupt {
                queue_id,
                raw,
                error,
            }) => {
                warn!(%queue_id, %error, "unparseable queue file, parking");
                if let Err(e) = self.queue.park_raw(&queue_id, raw, &error).await {
                    error!(%queue_id, "failed to park corrupt entry: {e}");
                }
                Ok(true)
            }
            Some(Discovered::Ready(entry)) => {
                self.process_entry(entry).await;
                Ok(true)
            }
        }
    }

    async fn process_entry(&self, entry: QueueEntry) {
        let queue_id = entry.queue_id.clone();
        debug!(%queue_id, attempt = entry.attempt, "processing entry");

        match self.try_commit(&entry).await {
            Ok((outcome, committed_at)) => {
                let report = outcome.report().clone();
                info!(%queue_id, report_id = %report.id, state = %EntryState::Committed, "entry committed");

                // Retire only after the confirmed commit. A failure here
                // leaves the entry in the queue; re-processing is a no-op
                // commit, so repeating is safe.
                if let Err(e) = self.queue.archive(&entry, report.id, committed_at).await {
                    error!(%queue_id, "failed to archive committed entry: {e}");
                    return;
                }

                let event = match &outcome {
                    CommitOutcome::Created(r) => Some(ReportEvent::ReportCreated {
                        report_id: r.id,
                        identity_key: r.identity_key.clone(),
                        queue_id: queue_id.clone(),
                        at: committed_at,
                    }),
                    CommitOutcome::Merged(r) => Some(ReportEvent::ReportMerged {
                        report_id: r.id,
                        identity_key: r.identity_key.clone(),
                        queue_id: queue_id.clone(),
                        at: committed_at,
                    }),
                    // Already announced when it first applied.
                    CommitOutcome::AlreadyApplied(_) => None,
                };
                if let Some(event) = event {
                    // Fire-and-forget relative to the commit.
                    if let Err(e) = self.notifier.notify(&event).await {
                        warn!(%queue_id, "notification hook failed: {e}");
                    }
                }
            }
            Err(e) if e.is_transient() => self.handle_transient(entry, e).await,
            Err(e) => {
                warn!(%queue_id, state = %EntryState::ParkedError, "permanent failure, parking: {e}");
                if let Err(park_err) = self.queue.park(&entry, &e.to_string()).await {
                    error!(%queue_id, "failed to park entry: {park_err}");
                }
            }
        }
    }

    /// Validate, resolve attachments, and commit one entry. Both external
    /// steps are bounded by timeouts; a timed-out step is transient.
    async fn try_commit(
        &self,
        entry: &QueueEntry,
    ) -> Result<(CommitOutcome, chrono::DateTime<Utc>)> {
        let payload = SubmissionPayload::from_value(&entry.payload)?;

        let mut attachments = Vec::with_capacity(payload.attachments.len());
        for input in &payload.attachments {
            let resolved = tokio::time::timeout(
                self.config.attachment_timeout,
                resolve_attachment(self.attachments.as_ref(), &entry.queue_id, input),
            )
            .await
            .map_err(|_| Error::Transient(format!("attachment {} timed out", input.name)))??;
            attachments.push(resolved);
        }

        let now = Utc::now();
        let outcome = tokio::time::timeout(
            self.config.commit_timeout,
            self.store
                .apply_entry(&entry.queue_id, &payload, attachments, now),
        )
        .await
        .map_err(|_| Error::Transient("store commit timed out".to_string()))??;

        Ok((outcome, now))
    }

    /// Transient failure: defer with exponential backoff, or park once
    /// retries are exhausted.
    async fn handle_transient(&self, entry: QueueEntry, err: Error) {
        let queue_id = entry.queue_id.clone();
        let failed_attempt = entry.attempt + 1;

        if failed_attempt >= self.config.max_retries {
            warn!(
                %queue_id,
                attempts = failed_attempt,
                state = %EntryState::ParkedError,
                "retries exhausted, parking: {err}"
            );
            let exhausted = QueueEntry {
                attempt: failed_attempt,
                ..entry
            };
            if let Err(e) = self
                .queue
                .park(&exhausted, &format!("retries exhausted: {err}"))
                .await
            {
                error!(%queue_id, "failed to park exhausted entry: {e}");
            }
            return;
        }

        let delay = self.config.backoff_delay(failed_attempt);
        let not_before = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60));
        warn!(
            %queue_id,
            attempt = failed_attempt,
            delay_ms = delay.as_millis() as u64,
            state = %EntryState::Retrying,
            "transient failure, deferring: {err}"
        );
        if let Err(e) = self.queue.defer(&entry, failed_attempt, not_before).await {
            error!(%queue_id, "failed to defer entry: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let config = WorkerConfig {
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_millis(1500),
            ..WorkerConfig::default()
        };
        assert_eq!(config.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(config.backoff_delay(4), Duration::from_millis(800));
        assert_eq!(config.backoff_delay(5), Duration::from_millis(1500));
        assert_eq!(config.backoff_delay(6), Duration::from_millis(1500));
    }

    #[test]
    fn backoff_is_strictly_increasing_below_cap() {
        let config = WorkerConfig::default();
        let mut prev = Duration::ZERO;
        for attempt in 1..=5 {
            let delay = config.backoff_delay(attempt);
            if delay < config.backoff_cap {
                assert!(delay > prev, "delay must grow until the cap");
            }
            prev = delay;
        }
    }
}
