mod migrations;
pub mod queue;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{RunningRecord, RunningRecordItem};

pub use queue::OfflineQueue;

/// Opaque payload queued when a network write failed. Serialized as-is and
/// retried by a mechanism external to this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PendingUpload {
    Session(RunningRecord),
    Segments {
        session_id: String,
        items: Vec<RunningRecordItem>,
    },
}

/// A queued payload as read back by an external retrier.
#[derive(Debug, Clone)]
pub struct QueuedUpload {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub payload: PendingUpload,
}

/// Durable enqueue for payloads that failed to reach the server. Retry
/// scheduling and ordering live outside this crate; implementations only
/// guarantee the payload survives to be retried.
#[async_trait]
pub trait OfflineStore: Send + Sync {
    async fn add_pending_upload(&self, record: &RunningRecord) -> Result<()>;

    async fn add_pending_segment_upload(
        &self,
        session_id: &str,
        items: &[RunningRecordItem],
    ) -> Result<()>;
}
