//! Core data model.
//!
//! A queue entry is one accepted submission awaiting commit. A report is
//! the committed record, keyed by its normalized identity. Duplicate
//! submissions for the same identity merge into one report.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Queue Id
// ---------------------------------------------------------------------------

/// Identifier of a queue entry. Lexical order equals arrival order:
/// zero-padded millisecond timestamp plus a random tie-break suffix.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueId(String);

impl QueueId {
    /// Generate an id for an entry accepted at `now`.
    pub fn generate(now: DateTime<Utc>) -> Self {
        let millis = now.timestamp_millis().max(0);
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{millis:013}-{}", &suffix[..8]))
    }

    /// Parse a file stem back into an id. Rejects names that cannot have
    /// been produced by [`QueueId::generate`], so stray files in the queue
    /// directory are not mistaken for entries.
    pub fn parse(s: &str) -> Option<Self> {
        let (millis, suffix) = s.split_once('-')?;
        if millis.len() == 13
            && suffix.len() == 8
            && millis.bytes().all(|b| b.is_ascii_digit())
            && suffix.bytes().all(|b| b.is_ascii_hexdigit())
        {
            Some(Self(s.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Queue Entry
// ---------------------------------------------------------------------------

/// A durably-stored unit of pending work. Written once by the enqueue
/// operation; only the worker touches it afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub queue_id: QueueId,

    pub enqueued_at: DateTime<Utc>,

    /// Number of processing attempts consumed so far.
    pub attempt: u32,

    /// Set while the entry waits out a retry backoff. Discovery skips the
    /// entry until this passes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,

    /// The raw submission. Parsed and validated by the worker, never here.
    pub payload: serde_json::Value,
}

/// Lifecycle state of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// Waiting for the worker.
    Pending,
    /// The worker is on it.
    Processing,
    /// Committed into the document store and archived. Terminal.
    Committed,
    /// Failed transiently, waiting out a backoff delay.
    Retrying,
    /// Failed permanently, parked for operator inspection. Terminal.
    ParkedError,
}

impl EntryState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: EntryState) -> bool {
        use EntryState::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Processing, Committed)
                | (Processing, Retrying)
                | (Processing, ParkedError)
                | (Retrying, Pending) // backoff elapsed
                | (Retrying, ParkedError) // retries exhausted
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, EntryState::Committed | EntryState::ParkedError)
    }
}

impl std::fmt::Display for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntryState::Pending => "pending",
            EntryState::Processing => "processing",
            EntryState::Committed => "committed",
            EntryState::Retrying => "retrying",
            EntryState::ParkedError => "parked-error",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Submission payload
// ---------------------------------------------------------------------------

/// The structured form of a submission, as the worker understands it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionPayload {
    /// The identity field. Its normalized form is the dedup key.
    pub subject: String,

    /// Free-form descriptive attributes (location, description, contact).
    /// Additive on merge, never destructively overwritten.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentInput>,
}

impl SubmissionPayload {
    /// Parse and structurally validate a raw payload. This is the worker's
    /// gate: unparseable JSON or a blank subject is a permanent failure.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        let payload: SubmissionPayload = serde_json::from_value(value.clone())
            .map_err(|e| Error::Structural(format!("unparseable payload: {e}")))?;
        if payload.subject.trim().is_empty() {
            return Err(Error::Structural("payload has empty subject".to_string()));
        }
        Ok(payload)
    }
}

/// An attachment as submitted: descriptor plus bytes or a reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentInput {
    pub name: String,
    pub content_type: String,
    pub source: AttachmentSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttachmentSource {
    /// Bytes carried in the queue entry itself, base64-encoded.
    Inline { data: String },
    /// Already stored elsewhere; the worker records the location as-is.
    Reference { location: String },
}

/// Builder for submissions. The producer-side API.
pub struct NewSubmission {
    subject: String,
    fields: BTreeMap<String, String>,
    attachments: Vec<AttachmentInput>,
}

impl NewSubmission {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            fields: BTreeMap::new(),
            attachments: Vec::new(),
        }
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn attachment(mut self, attachment: AttachmentInput) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn build(self) -> SubmissionPayload {
        SubmissionPayload {
            subject: self.subject,
            fields: self.fields,
            attachments: self.attachments,
        }
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Newtype for report IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReportId(pub Uuid);

impl ReportId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ReportId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for ReportId {
    fn default() -> Self {
        Self::new()
    }
}

/// The committed business record. At most one per normalized identity key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    /// Assigned at first commit, stable for the record's lifetime.
    pub id: ReportId,

    /// Normalized natural key. Duplicate submissions merge on this.
    pub identity_key: String,

    /// Display form of the subject, as first submitted.
    pub subject: String,

    /// Descriptive attributes. Merges fill gaps only.
    pub fields: BTreeMap<String, String>,

    /// Append-only from the worker's perspective.
    pub attachments: Vec<AttachmentRef>,

    /// Set once by the worker; admin-mutable afterwards.
    pub status: ReportStatus,

    pub first_seen_at: DateTime<Utc>,

    /// Updated on every merge.
    pub last_seen_at: DateTime<Utc>,

    /// Merge history: ids of every queue entry applied to this report.
    /// Re-processing an already-applied entry is a no-op.
    pub applied_entries: Vec<QueueId>,
}

/// A stored attachment on a committed report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub id: Uuid,
    pub name: String,
    pub content_type: String,
    pub size: u64,
    pub location: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportStatus {
    New,
    InReview,
    Resolved,
    Dismissed,
}

impl std::fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReportStatus::New => "new",
            ReportStatus::InReview => "in-review",
            ReportStatus::Resolved => "resolved",
            ReportStatus::Dismissed => "dismissed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ReportStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "new" => Ok(ReportStatus::New),
            "in-review" => Ok(ReportStatus::InReview),
            "resolved" => Ok(ReportStatus::Resolved),
            "dismissed" => Ok(ReportStatus::Dismissed),
            _ => Err(Error::Other(format!("unknown status: {s}"))),
        }
    }
}

/// Normalize an identity field into the dedup key: trimmed,
/// case-insensitive, inner whitespace collapsed.
pub fn normalize_identity(subject: &str) -> String {
    subject
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_ids_sort_by_creation_time() {
        let earlier = QueueId::generate("2026-03-01T10:00:00Z".parse().unwrap());
        let later = QueueId::generate("2026-03-01T10:00:01Z".parse().unwrap());
        assert!(earlier < later);
    }

    #[test]
    fn queue_id_parse_round_trips() {
        let id = QueueId::generate(Utc::now());
        assert_eq!(QueueId::parse(id.as_str()), Some(id));
    }

    #[test]
    fn queue_id_parse_rejects_stray_names() {
        assert!(QueueId::parse("notes").is_none());
        assert!(QueueId::parse("123-abc").is_none());
        assert!(QueueId::parse("0000000000000-zzzzzzzz").is_none());
    }

    #[test]
    fn identity_normalization_is_case_and_space_insensitive() {
        assert_eq!(normalize_identity("  Acme   Corp "), "acme corp");
        assert_eq!(
            normalize_identity("acme corp"),
            normalize_identity("ACME\tCORP")
        );
    }

    #[test]
    fn entry_state_machine() {
        use EntryState::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Committed));
        assert!(Processing.can_transition_to(Retrying));
        assert!(Retrying.can_transition_to(Pending));
        assert!(!Committed.can_transition_to(Processing));
        assert!(!Pending.can_transition_to(Committed));
        assert!(Committed.is_terminal());
        assert!(ParkedError.is_terminal());
        assert!(!Retrying.is_terminal());
    }

    #[test]
    fn blank_subject_fails_structural_validation() {
        let value = serde_json::json!({"subject": "   "});
        let err = SubmissionPayload::from_value(&value).unwrap_err();
        assert!(matches!(err, Error::Structural(_)));
        assert!(!err.is_transient());
    }
}
