//! Post-commit notification events.
//!
//! Handed to the [`crate::hooks::NotificationHook`] after a commit lands.
//! The excluded email and enrichment subsystems consume these.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{QueueId, ReportId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReportEvent {
    ReportCreated {
        report_id: ReportId,
        identity_key: String,
        queue_id: QueueId,
        at: DateTime<Utc>,
    },
    ReportMerged {
        report_id: ReportId,
        identity_key: String,
        queue_id: QueueId,
        at: DateTime<Utc>,
    },
}
