use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{error, info};
use rusqlite::{params, Connection};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::models::{RunningRecord, RunningRecordItem};

use super::migrations::run_migrations;
use super::{OfflineStore, PendingUpload, QueuedUpload};

type QueueTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum QueueCommand {
    Execute(QueueTask),
    Shutdown,
}

struct QueueInner {
    sender: mpsc::Sender<QueueCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(QueueCommand::Shutdown) {
                error!("Failed to send shutdown to queue thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join queue thread: {join_err:?}");
            }
        }
    }
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| anyhow!("invalid datetime '{value}': {err}"))
}

/// Durable local store for payloads that failed to reach the server. A
/// dedicated worker thread owns the SQLite connection; callers talk to it
/// through a command channel so the queue is safe to clone across tasks.
#[derive(Clone)]
pub struct OfflineQueue {
    inner: Arc<QueueInner>,
    db_path: Arc<PathBuf>,
}

impl OfflineQueue {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create queue directory {}", parent.display())
            })?;
        }

        let (command_tx, command_rx) = mpsc::channel::<QueueCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let path_for_thread = db_path.clone();

        let worker = thread::Builder::new()
            .name("stridecore-offline-queue".into())
            .spawn(move || {
                let mut conn = match Connection::open(&path_for_thread) {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(anyhow::Error::new(err)
                            .context("failed to open offline queue database")));
                        return;
                    }
                };

                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("Failed to enable WAL mode: {err}");
                }

                let init_result =
                    run_migrations(&mut conn).context("failed to run queue migrations");
                if ready_tx.send(init_result).is_err() {
                    error!("Queue initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        QueueCommand::Execute(task) => {
                            task(&mut conn);
                        }
                        QueueCommand::Shutdown => break,
                    }
                }

                info!("Offline queue thread shutting down");
            })
            .with_context(|| "failed to spawn offline queue worker thread")?;

        ready_rx
            .recv()
            .context("queue worker exited before signaling readiness")??;

        info!("Offline queue initialized at {}", db_path.as_path().display());

        Ok(Self {
            inner: Arc::new(QueueInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            db_path: Arc::new(db_path),
        })
    }

    pub fn path(&self) -> &Path {
        self.db_path.as_path()
    }

    async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.inner.sender.clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = QueueCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("Queue caller dropped before receiving result");
            }
        }));

        sender
            .send(command)
            .map_err(|err| anyhow!("failed to send command to queue thread: {err}"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("offline queue thread terminated unexpectedly"))?
    }

    async fn enqueue(&self, payload: PendingUpload) -> Result<()> {
        let kind = match &payload {
            PendingUpload::Session(_) => "session",
            PendingUpload::Segments { .. } => "segments",
        };
        let row_id = Uuid::new_v4().to_string();
        let serialized =
            serde_json::to_string(&payload).context("failed to serialize pending upload")?;
        let created_at = Utc::now().to_rfc3339();
        let kind = kind.to_string();

        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO pending_uploads (id, kind, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![row_id, kind, serialized, created_at],
            )
            .with_context(|| "failed to insert pending upload")?;
            Ok(())
        })
        .await
    }

    /// All queued payloads, oldest first. The drain policy belongs to the
    /// external retrier; this only exposes what is waiting.
    pub async fn pending(&self) -> Result<Vec<QueuedUpload>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, payload, created_at FROM pending_uploads
                 ORDER BY created_at ASC",
            )?;

            let mut rows = stmt.query([])?;
            let mut uploads = Vec::new();
            while let Some(row) = rows.next()? {
                let id: String = row.get(0)?;
                let serialized: String = row.get(1)?;
                let created_at = parse_datetime(&row.get::<_, String>(2)?)?;
                let payload: PendingUpload = serde_json::from_str(&serialized)
                    .with_context(|| format!("corrupt pending upload {id}"))?;
                uploads.push(QueuedUpload {
                    id,
                    created_at,
                    payload,
                });
            }
            Ok(uploads)
        })
        .await
    }

    /// Removes a payload once the external retrier has delivered it.
    pub async fn remove(&self, upload_id: &str) -> Result<()> {
        let upload_id = upload_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "DELETE FROM pending_uploads WHERE id = ?1",
                params![upload_id],
            )
            .with_context(|| "failed to delete pending upload")?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl OfflineStore for OfflineQueue {
    async fn add_pending_upload(&self, record: &RunningRecord) -> Result<()> {
        self.enqueue(PendingUpload::Session(record.clone())).await
    }

    async fn add_pending_segment_upload(
        &self,
        session_id: &str,
        items: &[RunningRecordItem],
    ) -> Result<()> {
        self.enqueue(PendingUpload::Segments {
            session_id: session_id.to_string(),
            items: items.to_vec(),
        })
        .await
    }
}
