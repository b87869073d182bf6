//! Collaborator ports invoked by the worker during commit.
//!
//! Attachment storage and post-commit notification are external systems
//! from the queue's point of view. The worker talks to them through these
//! traits; the real HTTP/email integrations live outside this crate.

use std::path::PathBuf;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::event::ReportEvent;
use crate::model::{AttachmentInput, AttachmentRef, AttachmentSource, QueueId};

/// Stores attachment bytes and returns a stable location reference.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn store(
        &self,
        queue_id: &QueueId,
        name: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<String>;
}

/// Receives "a report was created/merged" after a successful commit.
/// Fire-and-forget: a failure here is logged, never rolled back into the
/// commit.
#[async_trait]
pub trait NotificationHook: Send + Sync {
    async fn notify(&self, event: &ReportEvent) -> Result<()>;
}

/// Resolve one submitted attachment into a stored reference.
///
/// Inline bytes go through the attachment store; a reference is recorded
/// as-is. Undecodable inline data is a structural failure of the entry.
pub async fn resolve_attachment(
    store: &dyn AttachmentStore,
    queue_id: &QueueId,
    input: &AttachmentInput,
) -> Result<AttachmentRef> {
    let (size, location) = match &input.source {
        AttachmentSource::Inline { data } => {
            let bytes = BASE64
                .decode(data)
                .map_err(|e| Error::Structural(format!("attachment {}: bad base64: {e}", input.name)))?;
            let location = store
                .store(queue_id, &input.name, &input.content_type, &bytes)
                .await?;
            (bytes.len() as u64, location)
        }
        AttachmentSource::Reference { location } => (0, location.clone()),
    };

    Ok(AttachmentRef {
        id: Uuid::new_v4(),
        name: input.name.clone(),
        content_type: input.content_type.clone(),
        size,
        location,
    })
}

/// Filesystem-backed attachment store for local operation: bytes land
/// under `<root>/<queue_id>/`, the returned reference is the path
/// relative to the root.
pub struct FsAttachmentStore {
    root: PathBuf,
}

impl FsAttachmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl AttachmentStore for FsAttachmentStore {
    async fn store(
        &self,
        queue_id: &QueueId,
        name: &str,
        _content_type: &str,
        bytes: &[u8],
    ) -> Result<String> {
        let dir = self.root.join(queue_id.as_str());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Transient(format!("attachment dir: {e}")))?;

        // Keep the original name readable but never trust it as a path.
        let safe_name: String = name
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        let file_name = format!("{}-{safe_name}", &Uuid::new_v4().simple().to_string()[..8]);

        tokio::fs::write(dir.join(&file_name), bytes)
            .await
            .map_err(|e| Error::Transient(format!("store attachment {name}: {e}")))?;

        Ok(format!("{}/{file_name}", queue_id.as_str()))
    }
}

/// Notification hook that announces commits on the log. Stands in for the
/// excluded email/enrichment subsystems in local operation.
pub struct LogNotifier;

#[async_trait]
impl NotificationHook for LogNotifier {
    async fn notify(&self, event: &ReportEvent) -> Result<()> {
        match event {
            ReportEvent::ReportCreated {
                report_id,
                identity_key,
                ..
            } => info!(%report_id, %identity_key, "notify: report created"),
            ReportEvent::ReportMerged {
                report_id,
                identity_key,
                ..
            } => info!(%report_id, %identity_key, "notify: report merged"),
        }
        Ok(())
    }
}
